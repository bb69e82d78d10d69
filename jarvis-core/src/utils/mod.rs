// src/utils/mod.rs

pub mod encoding;
pub mod fsio;
pub mod path;

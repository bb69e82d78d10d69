// src/commands/mod.rs
pub mod init;
mod api;

pub use api::{
    HealFailure, IndexSummary, Orchestrator, RunMode, RunReport, RunState, RunStatus,
};
pub use init::{ensure_initialized, InitReport};

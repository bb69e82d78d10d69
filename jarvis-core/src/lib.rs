// jarvis-core/src/lib.rs
//! Constitutional code governance over a git workspace: every scan and fix is
//! authorized by a rule engine and recorded in a hash-chained audit log.

pub mod commands;
pub mod config;
pub mod error;
pub mod services;
pub mod utils;
pub mod workspace;

pub use commands::{Orchestrator, RunReport, RunStatus};
pub use config::CoreConfig;
pub use error::{GovResult, GovernanceError};
pub use workspace::Workspace;

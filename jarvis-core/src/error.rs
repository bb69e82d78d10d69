// src/error.rs
//! Closed error taxonomy surfaced in return values and audit records.
//!
//! `kind()` yields the stable name written into the audit log, so these
//! strings must not change between releases.

use std::path::PathBuf;

use thiserror::Error;

use crate::services::constitution::AuthorizationDecision;

#[derive(Debug, Error)]
pub enum GovernanceError {
    /// A path resolved outside the workspace root.
    #[error("path {path:?} resolves outside workspace root {root:?}")]
    Containment { path: String, root: PathBuf },

    /// At least one rule rejected the action.
    #[error("constitutional denial by [{}]: {}", .decision.denied_by.join(", "), .decision.violations.join("; "))]
    ConstitutionalDenial { decision: Box<AuthorizationDecision> },

    #[error("version control unavailable: {0}")]
    VcsUnavailable(String),

    #[error("fix not applicable: {0}")]
    FixNotApplicable(String),

    #[error("fix failed after retries: {0}")]
    FixFailedIo(String),

    /// Fatal: the audit invariant outranks the action that triggered the write.
    #[error("audit write failed: {0}")]
    AuditWriteFailure(String),

    #[error("memory index is stale and must be rebuilt")]
    IndexStale,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Index(#[from] rusqlite::Error),
}

impl GovernanceError {
    /// Stable kind name used in audit records and CLI output.
    pub fn kind(&self) -> &'static str {
        match self {
            GovernanceError::Containment { .. } => "ContainmentError",
            GovernanceError::ConstitutionalDenial { .. } => "ConstitutionalDenial",
            GovernanceError::VcsUnavailable(_) => "VcsUnavailable",
            GovernanceError::FixNotApplicable(_) => "FixNotApplicable",
            GovernanceError::FixFailedIo(_) => "FixFailedIO",
            GovernanceError::AuditWriteFailure(_) => "AuditWriteFailure",
            GovernanceError::IndexStale => "IndexStale",
            GovernanceError::Config(_) => "ConfigError",
            GovernanceError::Io(_) => "IoError",
            GovernanceError::Index(_) => "IndexError",
        }
    }

    /// Denied rule ids when this is a constitutional denial, empty otherwise.
    pub fn denied_by(&self) -> &[String] {
        match self {
            GovernanceError::ConstitutionalDenial { decision } => &decision.denied_by,
            _ => &[],
        }
    }
}

pub type GovResult<T> = std::result::Result<T, GovernanceError>;

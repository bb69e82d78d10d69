// src/services/mod.rs

pub mod audit;        // hash-chained JSONL log; the single audit writer
pub mod constitution; // rule engine gating every action
pub mod detectors;    // the one detector table
pub mod fixer;
pub mod language;     // extension to comment syntax and rewrite dialect
pub mod memory;       // the ONLY SQLite writer
pub mod scanner;
pub mod vcs;          // read-only git queries

pub use audit::{AuditEntry, AuditLog, AuditRecord, ChainReport};
pub use constitution::{Action, AuthorizationDecision, Constitution, Rule, Verdict};
pub use fixer::{FileFixReport, FixOutcome, Fixer};
pub use memory::MemoryIndex;
pub use scanner::{ScanReport, Scanner, Violation};
pub use vcs::{GitCli, VersionControl};

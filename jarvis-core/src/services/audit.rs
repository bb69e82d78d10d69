//! services/audit.rs
//! Append-only, hash-chained audit log (`.jarvis/audit.log`, one JSON record per line).
//!
//! - Every record stores `prev_hash` and `hash = blake3(prev_hash || canonical payload)`;
//!   editing or deleting any line breaks verification of every later record.
//! - Appends open in append mode and write a single line; no record is ever rewritten.
//! - A torn final line (crash mid-write) is skipped on read and sealed with a
//!   newline before the next append.
//! - Append failures are fatal to the caller (`AuditWriteFailure`).

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::error::{GovResult, GovernanceError};

/// `prev_hash` of the first record.
pub const GENESIS_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// A fully sealed line of the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub ts: String,
    pub action: String,
    pub target: String,
    pub allowed: bool,
    #[serde(default)]
    pub denied_by: Vec<String>,
    #[serde(default)]
    pub violations: BTreeMap<String, usize>,
    #[serde(default)]
    pub fixes: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub files_examined: Option<usize>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub skipped: BTreeMap<String, usize>,
    pub prev_hash: String,
    pub hash: String,
}

/// The hashed portion of a record, serialized in a fixed field order.
#[derive(Serialize)]
struct Payload<'a> {
    ts: &'a str,
    action: &'a str,
    target: &'a str,
    allowed: bool,
    denied_by: &'a [String],
    violations: &'a BTreeMap<String, usize>,
    fixes: &'a BTreeMap<String, usize>,
    run: &'a Option<String>,
    status: &'a Option<String>,
    error: &'a Option<String>,
    files_examined: &'a Option<usize>,
    skipped: &'a BTreeMap<String, usize>,
}

impl AuditRecord {
    fn payload(&self) -> Payload<'_> {
        Payload {
            ts: &self.ts,
            action: &self.action,
            target: &self.target,
            allowed: self.allowed,
            denied_by: &self.denied_by,
            violations: &self.violations,
            fixes: &self.fixes,
            run: &self.run,
            status: &self.status,
            error: &self.error,
            files_examined: &self.files_examined,
            skipped: &self.skipped,
        }
    }

    /// Hash this record's payload chained onto its own `prev_hash`.
    pub fn compute_hash(&self) -> String {
        let body = serde_json::to_string(&self.payload()).unwrap_or_default();
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.prev_hash.as_bytes());
        hasher.update(body.as_bytes());
        hasher.finalize().to_hex().to_string()
    }

    pub fn timestamp(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(&self.ts)
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Caller-supplied content of a record; the log adds `ts`, `prev_hash` and `hash`.
#[derive(Debug, Clone, Default)]
pub struct AuditEntry {
    pub action: String,
    pub target: String,
    pub allowed: bool,
    pub denied_by: Vec<String>,
    pub violations: BTreeMap<String, usize>,
    pub fixes: BTreeMap<String, usize>,
    pub run: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
    pub files_examined: Option<usize>,
    pub skipped: BTreeMap<String, usize>,
}

impl AuditEntry {
    pub fn new(action: impl Into<String>, target: impl Into<String>, allowed: bool) -> Self {
        Self {
            action: action.into(),
            target: target.into(),
            allowed,
            ..Default::default()
        }
    }

    pub fn with_denied_by(mut self, ids: &[String]) -> Self {
        self.denied_by = ids.to_vec();
        self
    }

    pub fn with_violations(mut self, counts: BTreeMap<String, usize>) -> Self {
        self.violations = counts;
        self
    }

    pub fn with_fixes(mut self, counts: BTreeMap<String, usize>) -> Self {
        self.fixes = counts;
        self
    }

    pub fn with_run(mut self, run: &str) -> Self {
        self.run = Some(run.to_string());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_error(mut self, kind: &str) -> Self {
        self.error = Some(kind.to_string());
        self
    }

    pub fn with_scan_stats(mut self, files_examined: usize, skipped: BTreeMap<String, usize>) -> Self {
        self.files_examined = Some(files_examined);
        self.skipped = skipped;
        self
    }
}

/// Where and why a chain stopped verifying (1-based line numbers).
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ChainBreak {
    PrevHashMismatch { line: usize, expected: String, found: String },
    HashMismatch { line: usize },
}

impl fmt::Display for ChainBreak {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainBreak::PrevHashMismatch {
                line,
                expected,
                found,
            } => write!(f, "line {line}: prev_hash {found} does not match {expected}"),
            ChainBreak::HashMismatch { line } => write!(f, "line {line}: content does not match its hash"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ChainReport {
    pub records: usize,
    pub valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub broken: Option<ChainBreak>,
    /// Partial lines left by interrupted writes; they never carried a hash.
    pub torn_lines: usize,
}

pub struct AuditLog {
    path: PathBuf,
    last_hash: String,
    last_ts: Option<DateTime<Utc>>,
    needs_newline: bool,
}

impl AuditLog {
    /// Open (or create) the log at `path` and recover the chain tail.
    pub fn open(path: impl Into<PathBuf>) -> GovResult<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(audit_err)?;
        }
        let text = match fs::read_to_string(&path) {
            Ok(t) => t,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
            Err(e) => return Err(audit_err(e)),
        };
        let needs_newline = !text.is_empty() && !text.ends_with('\n');
        let last = parse_lines(&text).into_iter().last();
        Ok(Self {
            path,
            last_hash: last
                .as_ref()
                .map(|r| r.hash.clone())
                .unwrap_or_else(|| GENESIS_HASH.to_string()),
            last_ts: last.as_ref().and_then(AuditRecord::timestamp),
            needs_newline,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Seal `entry` onto the chain and append it as one line.
    ///
    /// # Errors
    /// * `AuditWriteFailure` if the line cannot be written.
    pub fn append(&mut self, entry: AuditEntry) -> GovResult<AuditRecord> {
        // Wall-clock time, never earlier than the previous record.
        let mut now = Utc::now();
        if let Some(prev) = self.last_ts {
            if now < prev {
                now = prev;
            }
        }
        let mut record = AuditRecord {
            ts: now.to_rfc3339_opts(SecondsFormat::Micros, true),
            action: entry.action,
            target: entry.target,
            allowed: entry.allowed,
            denied_by: entry.denied_by,
            violations: entry.violations,
            fixes: entry.fixes,
            run: entry.run,
            status: entry.status,
            error: entry.error,
            files_examined: entry.files_examined,
            skipped: entry.skipped,
            prev_hash: self.last_hash.clone(),
            hash: String::new(),
        };
        record.hash = record.compute_hash();

        let mut line = serde_json::to_string(&record)
            .map_err(|e| GovernanceError::AuditWriteFailure(e.to_string()))?;
        line.push('\n');
        if self.needs_newline {
            line.insert(0, '\n');
        }
        let mut f = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(audit_err)?;
        f.write_all(line.as_bytes()).map_err(audit_err)?;
        f.flush().map_err(audit_err)?;

        tracing::debug!(action = %record.action, target = %record.target, allowed = record.allowed, "audit record appended");
        self.needs_newline = false;
        self.last_hash = record.hash.clone();
        self.last_ts = Some(now);
        Ok(record)
    }

    /// Every complete record, oldest first.
    pub fn read_all(&self) -> GovResult<Vec<AuditRecord>> {
        read_records(&self.path)
    }

    /// The last `n` records, oldest first.
    pub fn tail(&self, n: usize) -> GovResult<Vec<AuditRecord>> {
        let mut all = self.read_all()?;
        let skip = all.len().saturating_sub(n);
        Ok(all.split_off(skip))
    }

    pub fn verify(&self) -> GovResult<ChainReport> {
        verify_chain(&self.path)
    }
}

fn audit_err(e: std::io::Error) -> GovernanceError {
    GovernanceError::AuditWriteFailure(e.to_string())
}

fn parse_lines(text: &str) -> Vec<AuditRecord> {
    text.lines()
        .filter(|l| !l.trim().is_empty())
        .filter_map(|l| match serde_json::from_str::<AuditRecord>(l) {
            Ok(r) => Some(r),
            Err(e) => {
                tracing::warn!("skipping unreadable audit line: {e}");
                None
            }
        })
        .collect()
}

/// Read all complete records at `path`; a missing log reads as empty.
pub fn read_records(path: &Path) -> GovResult<Vec<AuditRecord>> {
    match fs::read_to_string(path) {
        Ok(text) => Ok(parse_lines(&text)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
        Err(e) => Err(e.into()),
    }
}

/// Walk the log from the first line, checking linkage and content hashes.
pub fn verify_chain(path: &Path) -> GovResult<ChainReport> {
    let text = match fs::read_to_string(path) {
        Ok(t) => t,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => String::new(),
        Err(e) => return Err(e.into()),
    };
    let mut report = ChainReport {
        records: 0,
        valid: true,
        broken: None,
        torn_lines: 0,
    };
    let mut prev = GENESIS_HASH.to_string();

    for (idx, raw) in text.lines().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        let lineno = idx + 1;
        // A damaged complete record is caught by the next record's prev_hash.
        let Ok(record) = serde_json::from_str::<AuditRecord>(raw) else {
            report.torn_lines += 1;
            continue;
        };
        if record.prev_hash != prev {
            report.valid = false;
            report.broken = Some(ChainBreak::PrevHashMismatch {
                line: lineno,
                expected: prev,
                found: record.prev_hash,
            });
            break;
        }
        if record.compute_hash() != record.hash {
            report.valid = false;
            report.broken = Some(ChainBreak::HashMismatch { line: lineno });
            break;
        }
        prev = record.hash;
        report.records += 1;
    }
    if let Some(b) = &report.broken {
        tracing::warn!("audit chain broken: {b}");
    }
    Ok(report)
}

// src/commands/api.rs
//! The orchestrator: owns every component for one workspace and drives runs.
//!
//! A run moves `Ready → Authorizing → Scanning → {Healing} → Reporting → Done`;
//! authorization failures go straight to `Done`. Every action evaluated during a
//! run produces exactly one audit record before the call returns.

use chrono::{Duration, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use uuid::Uuid;

use crate::commands::init::{ensure_initialized, InitReport};
use crate::config::{absolutize, workspace_root, CoreConfig};
use crate::error::{GovResult, GovernanceError};
use crate::services::audit::{AuditEntry, AuditLog, AuditRecord, ChainReport};
use crate::services::constitution::{Action, AuthorizationDecision, Constitution};
use crate::services::fixer::{FileFixReport, Fixer};
use crate::services::memory::{
    finding_rows, ActivitySummary, IndexSnapshot, MemoryIndex, Opportunity, TodoItem,
};
use crate::services::scanner::{FileDiagnostic, Scanner, Violation};
use crate::workspace::Workspace;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunMode {
    Scan,
    Heal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// No violations.
    Clean,
    /// Violations remain (always the case for a scan that found any).
    Findings,
    /// Every violation was fixed.
    Healed,
    /// At least one file was denied or failed to write.
    Partial,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Clean => "clean",
            RunStatus::Findings => "findings",
            RunStatus::Healed => "healed",
            RunStatus::Partial => "partial",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RunState {
    Ready,
    Authorizing,
    Scanning,
    Healing,
    Reporting,
    Done,
}

impl RunState {
    fn can_advance_to(self, next: RunState) -> bool {
        use RunState::*;
        matches!(
            (self, next),
            (Ready, Authorizing)
                | (Authorizing, Scanning)
                | (Authorizing, Done)
                | (Scanning, Healing)
                | (Scanning, Reporting)
                | (Scanning, Done)
                | (Healing, Reporting)
                | (Healing, Done)
                | (Reporting, Done)
        )
    }
}

struct RunTracker {
    id: String,
    trace: Vec<RunState>,
}

impl RunTracker {
    fn new() -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            trace: vec![RunState::Ready],
        }
    }

    fn advance(&mut self, next: RunState) {
        let current = self.trace.last().copied().unwrap_or(RunState::Ready);
        if !current.can_advance_to(next) {
            tracing::warn!(run = %self.id, "unexpected run transition {current:?} -> {next:?}");
        }
        tracing::debug!(run = %self.id, "run state {current:?} -> {next:?}");
        self.trace.push(next);
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HealFailure {
    Denied {
        file: String,
        denied_by: Vec<String>,
        messages: Vec<String>,
    },
    #[serde(rename = "failed_io")]
    FailedIo { file: String, detail: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub run_id: String,
    pub mode: RunMode,
    /// Workspace-relative target.
    pub target: String,
    pub status: RunStatus,
    pub decision: AuthorizationDecision,
    pub violations: Vec<Violation>,
    pub files_examined: usize,
    pub diagnostics: Vec<FileDiagnostic>,
    pub files: Vec<FileFixReport>,
    pub failures: Vec<HealFailure>,
    pub states: Vec<RunState>,
    pub index_stale: bool,
}

impl RunReport {
    pub fn violation_counts(&self) -> BTreeMap<String, usize> {
        count_by_kind(&self.violations)
    }

    pub fn fix_counts(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for f in &self.files {
            for (k, n) in f.fixes_by_kind() {
                *out.entry(k).or_insert(0) += n;
            }
        }
        out
    }

    pub fn fixed_count(&self) -> usize {
        self.files.iter().map(FileFixReport::fixed_count).sum()
    }

    pub fn has_denials(&self) -> bool {
        self.failures
            .iter()
            .any(|f| matches!(f, HealFailure::Denied { .. }))
    }
}

/// Counts from a full index rebuild.
#[derive(Debug, Clone, Serialize)]
pub struct IndexSummary {
    pub commits: usize,
    pub findings: usize,
    pub files_examined: usize,
}

pub struct Orchestrator {
    workspace: Workspace,
    config: CoreConfig,
    constitution: Constitution,
    scanner: Scanner,
    fixer: Fixer,
    audit: AuditLog,
    index: Option<MemoryIndex>,
    index_path: PathBuf,
    index_stale: bool,
    init: InitReport,
}

impl Orchestrator {
    /// Bind the workspace at `root` (else `JARVIS_WORKSPACE`, else cwd) with the git adapter.
    pub fn open(root: Option<&Path>) -> GovResult<Self> {
        let root = workspace_root(root).map_err(|e| GovernanceError::Config(format!("{e:#}")))?;
        Self::new(Workspace::open(root)?)
    }

    /// Load `.jarvis/config.toml` and use the standard rule set.
    pub fn new(workspace: Workspace) -> GovResult<Self> {
        let config = CoreConfig::load(&workspace.reserved_dir())
            .map_err(|e| GovernanceError::Config(format!("{e:#}")))?;
        Self::with_parts(workspace, config, Constitution::standard())
    }

    /// Authorize `AuditAppend`, initialize `.jarvis/`, open the audit log and index.
    ///
    /// # Errors
    /// * `ConstitutionalDenial` if the audit log may not be appended to.
    /// * `AuditWriteFailure` if the reserved directory or log cannot be created.
    pub fn with_parts(
        workspace: Workspace,
        config: CoreConfig,
        constitution: Constitution,
    ) -> GovResult<Self> {
        let reserved = workspace.reserved_dir();
        let log_path = absolutize(&reserved, &config.audit.log_file);
        let append = Action::AuditAppend(log_path.clone());
        let decision = constitution.authorize(&append, &workspace);
        if !decision.allowed {
            return Err(GovernanceError::ConstitutionalDenial {
                decision: Box::new(decision),
            });
        }

        let init = ensure_initialized(&reserved, &config, &log_path)
            .map_err(|e| GovernanceError::AuditWriteFailure(format!("{e:#}")))?;
        let mut audit = AuditLog::open(&log_path)?;
        audit.append(
            AuditEntry::new(append.tag(), workspace.relative(&log_path), true).with_status("session-open"),
        )?;

        let index_path = absolutize(&reserved, &config.memory.db_file);
        let (index, index_stale) = match MemoryIndex::open(&index_path) {
            Ok(idx) => {
                let stale = idx.is_stale().unwrap_or(true);
                (Some(idx), stale)
            }
            Err(e) => {
                tracing::warn!("memory index unavailable: {e}");
                (None, true)
            }
        };

        Ok(Self {
            scanner: Scanner::new(workspace.root(), config.scanner.clone()),
            fixer: Fixer::new(config.fixer.clone()),
            workspace,
            config,
            constitution,
            audit,
            index,
            index_path,
            index_stale,
            init,
        })
    }

    pub fn workspace(&self) -> &Workspace {
        &self.workspace
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn init_report(&self) -> &InitReport {
        &self.init
    }

    pub fn audit_path(&self) -> &Path {
        self.audit.path()
    }

    pub fn index_is_stale(&self) -> bool {
        self.index_stale
    }

    /// Scan `raw` (resolved against the workspace root) and report violations.
    pub fn scan(&mut self, raw: impl AsRef<Path>) -> GovResult<RunReport> {
        self.run(RunMode::Scan, raw.as_ref())
    }

    /// Scan `raw`, then fix every fixable violation in files the rules allow writing.
    pub fn heal(&mut self, raw: impl AsRef<Path>) -> GovResult<RunReport> {
        self.run(RunMode::Heal, raw.as_ref())
    }

    /// Evaluate a single action outside a run and record the decision.
    ///
    /// The target is resolved against the workspace root first.
    pub fn authorize(&mut self, action: Action) -> GovResult<AuthorizationDecision> {
        let raw = action.target().to_path_buf();
        let target = match self.workspace.resolve(&raw) {
            Ok(t) => t,
            Err(e) => {
                self.audit.append(
                    AuditEntry::new(action.tag(), raw.display().to_string(), false)
                        .with_status("denied")
                        .with_error(e.kind()),
                )?;
                return Err(e);
            }
        };
        let action = action.with_target(target);
        let decision = self.constitution.authorize(&action, &self.workspace);
        self.audit.append(
            AuditEntry::new(
                action.tag(),
                self.workspace.relative(action.target()),
                decision.allowed,
            )
            .with_denied_by(&decision.denied_by)
            .with_status(if decision.allowed { "allowed" } else { "denied" }),
        )?;
        Ok(decision)
    }

    fn run(&mut self, mode: RunMode, raw: &Path) -> GovResult<RunReport> {
        let mut run = RunTracker::new();
        run.advance(RunState::Authorizing);
        tracing::info!(run = %run.id, ?mode, target = %raw.display(), "run started");

        let target = match self.workspace.resolve(raw) {
            Ok(t) => t,
            Err(e) => {
                run.advance(RunState::Done);
                let status = if matches!(e, GovernanceError::Containment { .. }) {
                    "denied"
                } else {
                    "failed"
                };
                self.audit.append(
                    AuditEntry::new("Scan", raw.display().to_string(), false)
                        .with_run(&run.id)
                        .with_status(status)
                        .with_error(e.kind()),
                )?;
                return Err(e);
            }
        };
        let rel = self.workspace.relative(&target);

        let decision = self
            .constitution
            .authorize(&Action::Scan(target.clone()), &self.workspace);
        if !decision.allowed {
            run.advance(RunState::Done);
            self.audit.append(
                AuditEntry::new("Scan", rel.as_str(), false)
                    .with_denied_by(&decision.denied_by)
                    .with_run(&run.id)
                    .with_status("denied")
                    .with_error("ConstitutionalDenial"),
            )?;
            return Err(GovernanceError::ConstitutionalDenial {
                decision: Box::new(decision),
            });
        }

        // A single-file heal must be writable before anything is scanned.
        let mut preflight: Option<AuthorizationDecision> = None;
        if mode == RunMode::Heal && target.is_file() {
            let write = self
                .constitution
                .authorize(&Action::Write(target.clone()), &self.workspace);
            if !write.allowed {
                run.advance(RunState::Done);
                self.audit.append(
                    AuditEntry::new("Write", rel.as_str(), false)
                        .with_denied_by(&write.denied_by)
                        .with_run(&run.id)
                        .with_status("denied")
                        .with_error("ConstitutionalDenial"),
                )?;
                self.audit.append(
                    AuditEntry::new("Scan", rel.as_str(), true)
                        .with_run(&run.id)
                        .with_status("aborted"),
                )?;
                return Err(GovernanceError::ConstitutionalDenial {
                    decision: Box::new(write),
                });
            }
            preflight = Some(write);
        }

        run.advance(RunState::Scanning);
        let scan = match self.scanner.scan(&target) {
            Ok(s) => s,
            Err(e) => {
                run.advance(RunState::Done);
                self.audit.append(
                    AuditEntry::new("Scan", rel.as_str(), true)
                        .with_run(&run.id)
                        .with_status("failed")
                        .with_error(e.kind()),
                )?;
                return Err(e);
            }
        };
        let mut violations = scan.violations;
        let mut files = Vec::new();
        let mut failures = Vec::new();

        if mode == RunMode::Heal {
            run.advance(RunState::Healing);
            self.fixer.begin_run();

            let mut groups: BTreeMap<String, Vec<usize>> = BTreeMap::new();
            for (i, v) in violations.iter().enumerate() {
                if v.fixable {
                    groups.entry(v.file.clone()).or_default().push(i);
                }
            }
            if preflight.is_some() {
                groups.entry(rel.clone()).or_default();
            }

            for (file, idxs) in groups {
                let path = self.workspace.root().join(&file);
                let decision = match preflight.take() {
                    Some(d) if d.action.target() == path.as_path() => d,
                    other => {
                        preflight = other;
                        self.constitution
                            .authorize(&Action::Write(path.clone()), &self.workspace)
                    }
                };
                if !decision.allowed {
                    self.audit.append(
                        AuditEntry::new("Write", file.as_str(), false)
                            .with_denied_by(&decision.denied_by)
                            .with_run(&run.id)
                            .with_status("denied")
                            .with_error("ConstitutionalDenial"),
                    )?;
                    failures.push(HealFailure::Denied {
                        file,
                        denied_by: decision.denied_by,
                        messages: decision.violations,
                    });
                    continue;
                }

                let batch: Vec<Violation> = idxs.iter().map(|&i| violations[i].clone()).collect();
                let result = self.fixer.fix_file(&path, &file, &batch);
                for &i in &idxs {
                    let v = &mut violations[i];
                    v.fixed = result
                        .fixes
                        .iter()
                        .any(|f| f.kind == v.kind && f.line == v.line && f.outcome.is_fixed());
                }

                let mut entry = AuditEntry::new("Write", file.as_str(), true)
                    .with_fixes(result.fixes_by_kind())
                    .with_run(&run.id);
                entry = if let Some(detail) = result.failure() {
                    failures.push(HealFailure::FailedIo {
                        file: file.clone(),
                        detail: detail.to_string(),
                    });
                    entry.with_status("failed").with_error("FixFailedIO")
                } else if result.written {
                    entry.with_status("fixed")
                } else {
                    entry.with_status("unchanged")
                };
                self.audit.append(entry)?;
                files.push(result);
            }
        }

        run.advance(RunState::Reporting);
        let index_violations = self.post_run_findings(&violations, &files);
        self.refresh_index(&scan.examined, &index_violations);

        let status = if !failures.is_empty() {
            RunStatus::Partial
        } else if violations.is_empty() {
            RunStatus::Clean
        } else if mode == RunMode::Heal && violations.iter().all(|v| v.fixed) {
            RunStatus::Healed
        } else {
            RunStatus::Findings
        };

        let report = RunReport {
            run_id: run.id.clone(),
            mode,
            target: rel,
            status,
            decision,
            violations,
            files_examined: scan.files_examined,
            diagnostics: scan.diagnostics,
            files,
            failures,
            states: Vec::new(),
            index_stale: self.index_stale,
        };

        run.advance(RunState::Done);
        self.audit.append(
            AuditEntry::new("Scan", report.target.as_str(), true)
                .with_violations(report.violation_counts())
                .with_fixes(report.fix_counts())
                .with_run(&run.id)
                .with_status(status.as_str())
                .with_scan_stats(report.files_examined, skipped_counts(&report.diagnostics)),
        )?;
        tracing::info!(run = %run.id, status = status.as_str(), violations = report.violations.len(), fixed = report.fixed_count(), "run finished");

        Ok(RunReport {
            states: run.trace,
            ..report
        })
    }

    /// Open findings after the run: unfixed violations, re-read for files that were rewritten.
    fn post_run_findings(&self, violations: &[Violation], files: &[FileFixReport]) -> Vec<Violation> {
        let written: Vec<&str> = files
            .iter()
            .filter(|f| f.written)
            .map(|f| f.file.as_str())
            .collect();
        let mut out: Vec<Violation> = violations
            .iter()
            .filter(|v| !v.fixed && !written.contains(&v.file.as_str()))
            .cloned()
            .collect();
        for file in written {
            match self.scanner.scan(&self.workspace.root().join(file)) {
                Ok(r) => out.extend(r.violations),
                Err(e) => tracing::warn!("rescan of {file} failed: {e}"),
            }
        }
        out
    }

    fn refresh_index(&mut self, files: &[String], violations: &[Violation]) {
        if self.index_stale {
            tracing::debug!("memory index is stale; skipping incremental update");
            return;
        }
        if let Err(e) = self.try_refresh_index(files, violations) {
            tracing::warn!("memory index update failed: {e}");
            self.mark_index_stale();
        }
    }

    fn try_refresh_index(&mut self, files: &[String], violations: &[Violation]) -> GovResult<()> {
        let now = Utc::now();
        let horizon = now - Duration::days(i64::from(self.config.memory.history_days));
        let root = self.workspace.root();
        let commits = self.workspace.vcs().commits_since(root, horizon)?;
        let rows = finding_rows(violations, root, self.workspace.vcs(), now);
        let index = self.index.as_mut().ok_or(GovernanceError::IndexStale)?;
        index.record_commits(&commits, horizon)?;
        index.replace_findings(files, &rows)?;
        Ok(())
    }

    fn mark_index_stale(&mut self) {
        self.index_stale = true;
        if let Some(index) = &self.index {
            if let Err(e) = index.mark_stale() {
                tracing::warn!("cannot persist stale flag, closing index: {e}");
                self.index = None;
            }
        }
    }

    /// Discard the index and rebuild it from history plus a full scan of the root.
    pub fn rebuild_index(&mut self) -> GovResult<IndexSummary> {
        let run_id = Uuid::new_v4().to_string();
        let root = self.workspace.root().to_path_buf();
        let decision = self
            .constitution
            .authorize(&Action::Scan(root.clone()), &self.workspace);
        if !decision.allowed {
            self.audit.append(
                AuditEntry::new("Scan", ".", false)
                    .with_denied_by(&decision.denied_by)
                    .with_run(&run_id)
                    .with_status("denied")
                    .with_error("ConstitutionalDenial"),
            )?;
            return Err(GovernanceError::ConstitutionalDenial {
                decision: Box::new(decision),
            });
        }

        match self.try_rebuild(&root) {
            Ok((summary, skipped)) => {
                self.audit.append(
                    AuditEntry::new("Scan", ".", true)
                        .with_run(&run_id)
                        .with_status("index-rebuilt")
                        .with_scan_stats(summary.files_examined, skipped),
                )?;
                Ok(summary)
            }
            Err(e) => {
                self.mark_index_stale();
                self.audit.append(
                    AuditEntry::new("Scan", ".", true)
                        .with_run(&run_id)
                        .with_status("failed")
                        .with_error(e.kind()),
                )?;
                Err(e)
            }
        }
    }

    fn try_rebuild(&mut self, root: &Path) -> GovResult<(IndexSummary, BTreeMap<String, usize>)> {
        let now = Utc::now();
        let horizon = now - Duration::days(i64::from(self.config.memory.history_days));
        let scan = self.scanner.scan(root)?;
        let commits = self.workspace.vcs().commits_since(root, horizon)?;
        let rows = finding_rows(&scan.violations, root, self.workspace.vcs(), now);

        if self.index.is_none() {
            self.index = Some(MemoryIndex::open(&self.index_path)?);
        }
        let Some(index) = self.index.as_mut() else {
            return Err(GovernanceError::IndexStale);
        };
        index.rebuild(&commits, &rows)?;
        self.index_stale = false;
        Ok((
            IndexSummary {
                commits: commits.len(),
                findings: rows.len(),
                files_examined: scan.files_examined,
            },
            skipped_counts(&scan.diagnostics),
        ))
    }

    fn fresh_index(&mut self) -> GovResult<&MemoryIndex> {
        if self.index_stale || self.index.is_none() {
            self.rebuild_index()?;
        }
        self.index.as_ref().ok_or(GovernanceError::IndexStale)
    }

    /// Commits, changed files, contributors and new findings in the last `window_days`.
    pub fn recent_activity(&mut self, window_days: u32) -> GovResult<ActivitySummary> {
        self.fresh_index()?.recent_activity(window_days, Utc::now())
    }

    /// Open TODOs older than `older_than_days` (default from config).
    pub fn stale_todos(&mut self, older_than_days: Option<u32>) -> GovResult<Vec<TodoItem>> {
        let days = older_than_days.unwrap_or(self.config.memory.stale_todo_days);
        self.fresh_index()?.stale_todos(days, Utc::now())
    }

    /// Suggested follow-ups; each requires explicit approval before anything acts on it.
    pub fn opportunities(&mut self) -> GovResult<Vec<Opportunity>> {
        let days = self.config.memory.stale_todo_days;
        let hot = self.config.memory.hotspot_threshold;
        self.fresh_index()?.opportunities(days, hot, Utc::now())
    }

    pub fn index_snapshot(&self) -> GovResult<IndexSnapshot> {
        self.index
            .as_ref()
            .ok_or(GovernanceError::IndexStale)?
            .snapshot()
    }

    /// The last `n` audit records, oldest first.
    pub fn audit_tail(&self, n: usize) -> GovResult<Vec<AuditRecord>> {
        self.audit.tail(n)
    }

    pub fn verify_audit(&self) -> GovResult<ChainReport> {
        self.audit.verify()
    }
}

fn count_by_kind(violations: &[Violation]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for v in violations {
        *out.entry(v.kind.as_str().to_string()).or_insert(0) += 1;
    }
    out
}

fn skipped_counts(diagnostics: &[FileDiagnostic]) -> BTreeMap<String, usize> {
    let mut out = BTreeMap::new();
    for d in diagnostics {
        *out.entry(d.code.to_string()).or_insert(0) += 1;
    }
    out
}

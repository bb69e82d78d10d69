// src/services/memory.rs
//! Single-writer project memory index (`.jarvis/context.db`).
//!
//! - Owns one SQLite connection (WAL); nothing else writes the file.
//! - Stores recent commits, their touched files, and open findings.
//! - Everything here is derivable from version-control history plus a fresh
//!   scan: `rebuild` reproduces the same facts an incremental history produced.
//! - A `stale` flag in `meta` forces a rebuild before queries are served.

use chrono::{DateTime, Duration, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use crate::error::GovResult;
use crate::services::detectors::DetectorId;
use crate::services::scanner::Violation;
use crate::services::vcs::{CommitInfo, VersionControl};

/// One open finding as persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FindingRow {
    pub finding_id: String,
    pub kind: String,
    pub severity: String,
    pub file: String,
    pub line: usize,
    pub text: String,
    pub fixable: bool,
    pub first_seen: String,
}

/// Build rows for `violations`, dating each by the commit that last touched its line.
///
/// Lines that are not committed yet are dated by their file's modification
/// time, so a rebuild over an unchanged tree reproduces the same rows.
pub fn finding_rows(
    violations: &[Violation],
    root: &Path,
    vcs: &dyn VersionControl,
    now: DateTime<Utc>,
) -> Vec<FindingRow> {
    let mut seen: HashMap<(String, String, String), usize> = HashMap::new();
    let mut mtimes: HashMap<String, DateTime<Utc>> = HashMap::new();
    violations
        .iter()
        .filter(|v| !v.fixed)
        .map(|v| {
            let text = v.text.trim().to_string();
            let nth = seen
                .entry((v.kind.as_str().to_string(), v.file.clone(), text.clone()))
                .or_insert(0);
            let id = finding_id(v.kind, &v.file, &text, *nth);
            *nth += 1;
            let path = root.join(&v.file);
            let first_seen = match vcs.blame_line(&path, v.line) {
                Ok(b) if b.committed => b.timestamp,
                other => {
                    if let Err(e) = other {
                        tracing::debug!("blame unavailable for {}:{}: {e}", v.file, v.line);
                    }
                    *mtimes
                        .entry(v.file.clone())
                        .or_insert_with(|| modified_at(&path).unwrap_or(now))
                }
            };
            FindingRow {
                finding_id: id,
                kind: v.kind.as_str().to_string(),
                severity: v.severity.as_str().to_string(),
                file: v.file.clone(),
                line: v.line,
                text,
                fixable: v.fixable,
                first_seen: stamp(first_seen),
            }
        })
        .collect()
}

fn modified_at(path: &Path) -> Option<DateTime<Utc>> {
    let modified = std::fs::metadata(path).and_then(|m| m.modified()).ok()?;
    Some(DateTime::<Utc>::from(modified))
}

/// Stable id: survives line moves, changes when the text or file changes.
pub fn finding_id(kind: DetectorId, file: &str, text: &str, occurrence: usize) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(kind.as_str().as_bytes());
    hasher.update(b"\x1f");
    hasher.update(file.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(text.as_bytes());
    hasher.update(b"\x1f");
    hasher.update(occurrence.to_string().as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

fn stamp(t: DateTime<Utc>) -> String {
    t.to_rfc3339_opts(SecondsFormat::Secs, true)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Contributor {
    pub author: String,
    pub commits: usize,
}

#[derive(Debug, Clone, Serialize)]
pub struct ActivitySummary {
    pub window_days: u32,
    pub since: String,
    pub commits: usize,
    pub files_changed: Vec<String>,
    pub open_todos: usize,
    pub top_contributors: Vec<Contributor>,
    /// Open findings first seen inside the window, per detector id.
    pub violations_by_kind: BTreeMap<String, usize>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TodoItem {
    pub todo_id: String,
    pub file: String,
    pub line: usize,
    pub text: String,
    pub first_seen: String,
    pub age_days: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OpportunityKind {
    StaleTodos,
    CredentialRotation,
    AutoHeal,
    Hotspot,
}

/// A suggested follow-up. Never acted on without explicit approval.
#[derive(Debug, Clone, Serialize)]
pub struct Opportunity {
    pub id: String,
    pub kind: OpportunityKind,
    pub title: String,
    pub files: Vec<String>,
    pub requires_approval: bool,
}

/// Order-independent view of the index, used to compare incremental and rebuilt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSnapshot {
    pub commits: Vec<(String, String, String, Vec<String>)>,
    pub findings: Vec<FindingRow>,
}

pub struct MemoryIndex {
    db: Connection,
    path: PathBuf,
}

impl MemoryIndex {
    /// Open/create the database and ensure the schema.
    pub fn open(db_path: impl Into<PathBuf>) -> GovResult<Self> {
        let path = db_path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let db = Connection::open(&path)?;
        db.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;

            CREATE TABLE IF NOT EXISTS meta (
              key    TEXT PRIMARY KEY,
              value  TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS commits (
              commit_id     TEXT PRIMARY KEY,
              author        TEXT NOT NULL,
              committed_at  TEXT NOT NULL,   -- RFC3339 UTC, seconds
              summary       TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS commit_files (
              commit_id  TEXT NOT NULL,
              path       TEXT NOT NULL,
              PRIMARY KEY (commit_id, path)
            );

            CREATE TABLE IF NOT EXISTS findings (
              finding_id  TEXT PRIMARY KEY,
              kind        TEXT NOT NULL,   -- detector id
              severity    TEXT NOT NULL,
              file        TEXT NOT NULL,   -- workspace-relative
              line        INTEGER NOT NULL,
              text        TEXT NOT NULL,
              fixable     INTEGER NOT NULL,
              first_seen  TEXT NOT NULL    -- RFC3339 UTC, seconds
            );

            CREATE INDEX IF NOT EXISTS idx_findings_file ON findings(file);
            CREATE INDEX IF NOT EXISTS idx_findings_kind ON findings(kind);
            CREATE INDEX IF NOT EXISTS idx_commits_time ON commits(committed_at);
            "#,
        )?;
        Ok(Self { db, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True when flagged stale or never built.
    pub fn is_stale(&self) -> GovResult<bool> {
        let stale: Option<String> = self
            .db
            .query_row("SELECT value FROM meta WHERE key='stale'", [], |r| r.get(0))
            .optional()?;
        let built: Option<String> = self
            .db
            .query_row("SELECT value FROM meta WHERE key='built_at'", [], |r| r.get(0))
            .optional()?;
        Ok(stale.as_deref() == Some("1") || built.is_none())
    }

    pub fn mark_stale(&self) -> GovResult<()> {
        self.set_meta("stale", "1")
    }

    fn set_meta(&self, key: &str, value: &str) -> GovResult<()> {
        self.db.execute(
            "INSERT INTO meta(key, value) VALUES (?1, ?2)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            params![key, value],
        )?;
        Ok(())
    }

    /// Upsert `commits` and drop those older than `horizon`.
    pub fn record_commits(&mut self, commits: &[CommitInfo], horizon: DateTime<Utc>) -> GovResult<()> {
        let tx = self.db.transaction()?;
        insert_commits(&tx, commits)?;
        let cutoff = stamp(horizon);
        tx.execute(
            "DELETE FROM commit_files WHERE commit_id IN
               (SELECT commit_id FROM commits WHERE committed_at < ?1)",
            [&cutoff],
        )?;
        tx.execute("DELETE FROM commits WHERE committed_at < ?1", [&cutoff])?;
        tx.commit()?;
        Ok(())
    }

    /// Replace the findings of every file in `files` with `rows`.
    ///
    /// Rows are taken as given; `first_seen` is derived from history and the
    /// working tree, never merged with what was stored before.
    pub fn replace_findings(&mut self, files: &[String], rows: &[FindingRow]) -> GovResult<()> {
        let tx = self.db.transaction()?;
        {
            let mut delete = tx.prepare("DELETE FROM findings WHERE file = ?1")?;
            for file in files {
                delete.execute([file])?;
            }
        }
        insert_findings(&tx, rows)?;
        tx.commit()?;
        Ok(())
    }

    /// Discard everything and load the given commits and findings; clears `stale`.
    pub fn rebuild(&mut self, commits: &[CommitInfo], rows: &[FindingRow]) -> GovResult<()> {
        let tx = self.db.transaction()?;
        tx.execute_batch(
            "DELETE FROM commit_files; DELETE FROM commits; DELETE FROM findings;",
        )?;
        insert_commits(&tx, commits)?;
        insert_findings(&tx, rows)?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES ('stale', '0')
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [],
        )?;
        tx.execute(
            "INSERT INTO meta(key, value) VALUES ('built_at', ?1)
             ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            [stamp(Utc::now())],
        )?;
        tx.commit()?;
        tracing::info!(commits = commits.len(), findings = rows.len(), "memory index rebuilt");
        Ok(())
    }

    pub fn recent_activity(&self, window_days: u32, now: DateTime<Utc>) -> GovResult<ActivitySummary> {
        let since = stamp(now - Duration::days(i64::from(window_days)));
        let commits: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM commits WHERE committed_at >= ?1",
            [&since],
            |r| r.get(0),
        )?;

        let mut stmt = self.db.prepare(
            "SELECT DISTINCT f.path FROM commit_files f
               JOIN commits c ON c.commit_id = f.commit_id
              WHERE c.committed_at >= ?1
              ORDER BY f.path",
        )?;
        let files_changed = stmt
            .query_map([&since], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;

        let open_todos: i64 = self.db.query_row(
            "SELECT COUNT(*) FROM findings WHERE kind = ?1",
            [DetectorId::TodoComment.as_str()],
            |r| r.get(0),
        )?;

        let mut stmt = self.db.prepare(
            "SELECT author, COUNT(*) AS n FROM commits
              WHERE committed_at >= ?1
              GROUP BY author ORDER BY n DESC, author ASC LIMIT 5",
        )?;
        let top_contributors = stmt
            .query_map([&since], |r| {
                Ok(Contributor {
                    author: r.get(0)?,
                    commits: r.get::<_, i64>(1)? as usize,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;

        let mut stmt = self.db.prepare(
            "SELECT kind, COUNT(*) FROM findings WHERE first_seen >= ?1 GROUP BY kind",
        )?;
        let violations_by_kind = stmt
            .query_map([&since], |r| Ok((r.get::<_, String>(0)?, r.get::<_, i64>(1)? as usize)))?
            .collect::<Result<BTreeMap<_, _>, _>>()?;

        Ok(ActivitySummary {
            window_days,
            since,
            commits: commits as usize,
            files_changed,
            open_todos: open_todos as usize,
            top_contributors,
            violations_by_kind,
        })
    }

    /// Open TODO markers first seen at least `older_than_days` ago, oldest first.
    pub fn stale_todos(&self, older_than_days: u32, now: DateTime<Utc>) -> GovResult<Vec<TodoItem>> {
        let cutoff = stamp(now - Duration::days(i64::from(older_than_days)));
        let mut stmt = self.db.prepare(
            "SELECT finding_id, file, line, text, first_seen FROM findings
              WHERE kind = ?1 AND first_seen <= ?2
              ORDER BY first_seen ASC, file ASC, line ASC",
        )?;
        let rows = stmt
            .query_map(params![DetectorId::TodoComment.as_str(), cutoff], |r| {
                Ok((
                    r.get::<_, String>(0)?,
                    r.get::<_, String>(1)?,
                    r.get::<_, i64>(2)?,
                    r.get::<_, String>(3)?,
                    r.get::<_, String>(4)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(rows
            .into_iter()
            .map(|(todo_id, file, line, text, first_seen)| {
                let age_days = DateTime::parse_from_rfc3339(&first_seen)
                    .map(|t| (now - t.with_timezone(&Utc)).num_days())
                    .unwrap_or(0);
                TodoItem {
                    todo_id,
                    file,
                    line: line as usize,
                    text,
                    first_seen,
                    age_days,
                }
            })
            .collect())
    }

    /// Suggested follow-ups derived from open findings.
    pub fn opportunities(
        &self,
        stale_todo_days: u32,
        hotspot_threshold: usize,
        now: DateTime<Utc>,
    ) -> GovResult<Vec<Opportunity>> {
        let mut out = Vec::new();

        let mut stale_files: Vec<String> = self
            .stale_todos(stale_todo_days, now)?
            .into_iter()
            .map(|t| t.file)
            .collect();
        stale_files.sort();
        stale_files.dedup();
        if !stale_files.is_empty() {
            out.push(Opportunity {
                id: "stale-todos".into(),
                kind: OpportunityKind::StaleTodos,
                title: format!("Close TODO markers older than {stale_todo_days} days"),
                files: stale_files,
                requires_approval: true,
            });
        }

        let rotate = self.files_where("kind = 'AWS_ACCESS_KEY'")?;
        if !rotate.is_empty() {
            out.push(Opportunity {
                id: "rotate-credentials".into(),
                kind: OpportunityKind::CredentialRotation,
                title: "Rotate committed cloud credentials and remove them from source".into(),
                files: rotate,
                requires_approval: true,
            });
        }

        let healable = self.files_where("fixable = 1")?;
        if !healable.is_empty() {
            out.push(Opportunity {
                id: "auto-heal".into(),
                kind: OpportunityKind::AutoHeal,
                title: format!("Run heal on {} file(s) with fixable findings", healable.len()),
                files: healable,
                requires_approval: true,
            });
        }

        let mut stmt = self.db.prepare(
            "SELECT file FROM findings GROUP BY file HAVING COUNT(*) >= ?1 ORDER BY file",
        )?;
        let hot = stmt
            .query_map([hotspot_threshold as i64], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        if !hot.is_empty() {
            out.push(Opportunity {
                id: "hotspots".into(),
                kind: OpportunityKind::Hotspot,
                title: format!("Review files with {hotspot_threshold}+ open findings"),
                files: hot,
                requires_approval: true,
            });
        }
        Ok(out)
    }

    fn files_where(&self, predicate: &str) -> GovResult<Vec<String>> {
        let sql = format!("SELECT DISTINCT file FROM findings WHERE {predicate} ORDER BY file");
        let mut stmt = self.db.prepare(&sql)?;
        let files = stmt
            .query_map([], |r| r.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(files)
    }

    pub fn snapshot(&self) -> GovResult<IndexSnapshot> {
        let mut stmt = self.db.prepare(
            "SELECT commit_id, author, committed_at FROM commits ORDER BY commit_id",
        )?;
        let heads = stmt
            .query_map([], |r| Ok((r.get::<_, String>(0)?, r.get::<_, String>(1)?, r.get::<_, String>(2)?)))?
            .collect::<Result<Vec<_>, _>>()?;
        let mut files_stmt =
            self.db.prepare("SELECT path FROM commit_files WHERE commit_id = ?1 ORDER BY path")?;
        let mut commits = Vec::with_capacity(heads.len());
        for (id, author, at) in heads {
            let files = files_stmt
                .query_map([&id], |r| r.get::<_, String>(0))?
                .collect::<Result<Vec<_>, _>>()?;
            commits.push((id, author, at, files));
        }

        let mut stmt = self.db.prepare(
            "SELECT finding_id, kind, severity, file, line, text, fixable, first_seen
               FROM findings ORDER BY file, line, finding_id",
        )?;
        let findings = stmt
            .query_map([], |r| {
                Ok(FindingRow {
                    finding_id: r.get(0)?,
                    kind: r.get(1)?,
                    severity: r.get(2)?,
                    file: r.get(3)?,
                    line: r.get::<_, i64>(4)? as usize,
                    text: r.get(5)?,
                    fixable: r.get::<_, i64>(6)? != 0,
                    first_seen: r.get(7)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(IndexSnapshot { commits, findings })
    }
}

fn insert_commits(tx: &rusqlite::Transaction<'_>, commits: &[CommitInfo]) -> GovResult<()> {
    let mut commit_stmt = tx.prepare(
        "INSERT INTO commits(commit_id, author, committed_at, summary) VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(commit_id) DO UPDATE SET
           author       = excluded.author,
           committed_at = excluded.committed_at,
           summary      = excluded.summary",
    )?;
    let mut file_stmt =
        tx.prepare("INSERT OR IGNORE INTO commit_files(commit_id, path) VALUES (?1, ?2)")?;
    for c in commits {
        commit_stmt.execute(params![c.id, c.author, stamp(c.timestamp), c.summary])?;
        for f in &c.files {
            file_stmt.execute(params![c.id, f])?;
        }
    }
    Ok(())
}

fn insert_findings(tx: &rusqlite::Transaction<'_>, rows: &[FindingRow]) -> GovResult<()> {
    let mut stmt = tx.prepare(
        "INSERT OR IGNORE INTO findings(finding_id, kind, severity, file, line, text, fixable, first_seen)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
    )?;
    for row in rows {
        stmt.execute(params![
            row.finding_id,
            row.kind,
            row.severity,
            row.file,
            row.line as i64,
            row.text,
            row.fixable as i64,
            row.first_seen,
        ])?;
    }
    Ok(())
}

// src/services/vcs.rs
//! Read-only version-control queries.
//!
//! - `VersionControl` is the seam the rule engine and memory index consult.
//! - `GitCli` shells out to `git -C <root>`; nothing here ever writes to the repo.
//! - Failures surface as `VcsUnavailable` and are never coerced into "tracked".

use chrono::{DateTime, SecondsFormat, TimeZone, Utc};
use serde::Serialize;
use std::ffi::OsStr;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use crate::error::{GovResult, GovernanceError};

/// One commit touching the queried path. `files` are workspace-relative.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommitInfo {
    pub id: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    pub summary: String,
    pub files: Vec<String>,
}

/// Last modification of a single line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlameInfo {
    pub commit: String,
    pub author: String,
    pub timestamp: DateTime<Utc>,
    /// False for lines that exist only in the working tree.
    pub committed: bool,
}

pub trait VersionControl: Send + Sync {
    /// Canonical root of the repository containing the workspace.
    fn repo_root(&self) -> GovResult<PathBuf>;

    /// *Currently tracked*: the path appears in the repository index.
    fn is_tracked(&self, path: &Path) -> GovResult<bool>;

    /// *In a tracked workspace*: the path descends from the repository root.
    fn in_tracked_workspace(&self, path: &Path) -> GovResult<bool> {
        let root = self.repo_root()?;
        Ok(path.starts_with(&root))
    }

    /// Commits touching `path` since `since`, newest first.
    fn commits_since(&self, path: &Path, since: DateTime<Utc>) -> GovResult<Vec<CommitInfo>>;

    /// Who and when last modified 1-based `line` of `file`.
    fn blame_line(&self, file: &Path, line: usize) -> GovResult<BlameInfo>;

    /// Distinct files changed under `subpath` since `since`, sorted.
    fn changed_files_since(&self, since: DateTime<Utc>, subpath: &Path) -> GovResult<Vec<String>> {
        let mut files: Vec<String> = self
            .commits_since(subpath, since)?
            .into_iter()
            .flat_map(|c| c.files)
            .collect();
        files.sort();
        files.dedup();
        Ok(files)
    }
}

/// `git` command-line adapter rooted at the workspace.
#[derive(Debug, Clone)]
pub struct GitCli {
    root: PathBuf,
}

const RECORD_SEP: char = '\u{1e}';
const FIELD_SEP: char = '\u{1f}';

impl GitCli {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn run<I, S>(&self, args: I) -> GovResult<Output>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        Command::new("git")
            .arg("-C")
            .arg(&self.root)
            .args(args)
            .output()
            .map_err(|e| GovernanceError::VcsUnavailable(format!("cannot run git: {e}")))
    }

    fn run_ok<I, S>(&self, args: I) -> GovResult<String>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let out = self.run(args)?;
        if !out.status.success() {
            return Err(GovernanceError::VcsUnavailable(
                String::from_utf8_lossy(&out.stderr).trim().to_string(),
            ));
        }
        Ok(String::from_utf8_lossy(&out.stdout).into_owned())
    }
}

impl VersionControl for GitCli {
    fn repo_root(&self) -> GovResult<PathBuf> {
        let top = self.run_ok(["rev-parse", "--show-toplevel"])?;
        let top = PathBuf::from(top.trim());
        Ok(top.canonicalize().unwrap_or(top))
    }

    fn is_tracked(&self, path: &Path) -> GovResult<bool> {
        // Distinguish "no repository" from "not tracked" before asking.
        self.repo_root()?;
        let listed = self.run_ok([
            OsStr::new("ls-files"),
            OsStr::new("-z"),
            OsStr::new("--"),
            path.as_os_str(),
        ])?;
        Ok(!listed.is_empty())
    }

    fn commits_since(&self, path: &Path, since: DateTime<Utc>) -> GovResult<Vec<CommitInfo>> {
        let since_arg = format!("--since={}", since.to_rfc3339_opts(SecondsFormat::Secs, true));
        let out = self.run([
            OsStr::new("log"),
            OsStr::new("--relative"),
            OsStr::new("--no-color"),
            OsStr::new("--name-only"),
            OsStr::new(&since_arg),
            OsStr::new("--format=%x1e%H%x1f%an%x1f%aI%x1f%s"),
            OsStr::new("--"),
            path.as_os_str(),
        ])?;
        if !out.status.success() {
            let stderr = String::from_utf8_lossy(&out.stderr);
            // A freshly initialized repository has no history yet.
            if stderr.contains("does not have any commits") {
                return Ok(Vec::new());
            }
            return Err(GovernanceError::VcsUnavailable(stderr.trim().to_string()));
        }
        Ok(parse_log(&String::from_utf8_lossy(&out.stdout)))
    }

    fn blame_line(&self, file: &Path, line: usize) -> GovResult<BlameInfo> {
        let range = format!("{line},{line}");
        let text = self.run_ok([
            OsStr::new("blame"),
            OsStr::new("--porcelain"),
            OsStr::new("-L"),
            OsStr::new(&range),
            OsStr::new("--"),
            file.as_os_str(),
        ])?;
        parse_blame(&text).ok_or_else(|| {
            GovernanceError::VcsUnavailable(format!(
                "unparsable blame output for {}:{line}",
                file.display()
            ))
        })
    }
}

fn parse_log(stdout: &str) -> Vec<CommitInfo> {
    let mut commits = Vec::new();
    for record in stdout.split(RECORD_SEP) {
        let mut lines = record.lines();
        let Some(header) = lines.next() else { continue };
        let fields: Vec<&str> = header.split(FIELD_SEP).collect();
        if fields.len() < 4 {
            continue;
        }
        let Ok(ts) = DateTime::parse_from_rfc3339(fields[2]) else {
            continue;
        };
        let files = lines
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(str::to_string)
            .collect();
        commits.push(CommitInfo {
            id: fields[0].to_string(),
            author: fields[1].to_string(),
            timestamp: ts.with_timezone(&Utc),
            summary: fields[3..].join("\u{1f}"),
            files,
        });
    }
    commits
}

fn parse_blame(porcelain: &str) -> Option<BlameInfo> {
    let mut lines = porcelain.lines();
    let commit = lines.next()?.split_whitespace().next()?.to_string();
    let mut author = None;
    let mut time = None;
    for l in lines {
        if let Some(a) = l.strip_prefix("author ") {
            author = Some(a.to_string());
        } else if let Some(t) = l.strip_prefix("author-time ") {
            time = t.trim().parse::<i64>().ok();
        }
    }
    let timestamp = Utc.timestamp_opt(time?, 0).single()?;
    Some(BlameInfo {
        committed: !commit.chars().all(|c| c == '0'),
        commit,
        author: author.unwrap_or_default(),
        timestamp,
    })
}

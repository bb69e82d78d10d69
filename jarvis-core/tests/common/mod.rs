// tests/common/mod.rs
// Shared fixtures: a temp workspace with an in-memory version-control fake.
#![allow(dead_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use tempfile::TempDir;

use jarvis_core::config::CoreConfig;
use jarvis_core::error::{GovResult, GovernanceError};
use jarvis_core::services::audit::{read_records, AuditRecord};
use jarvis_core::services::constitution::Constitution;
use jarvis_core::services::vcs::{BlameInfo, CommitInfo, VersionControl};
use jarvis_core::{Orchestrator, Workspace};

struct FakeState {
    root: PathBuf,
    available: bool,
    tracked: BTreeSet<PathBuf>,
    commits: Vec<CommitInfo>,
    blame_time: DateTime<Utc>,
}

/// Cloneable handle; every clone sees the same state.
#[derive(Clone)]
pub struct FakeVcs {
    state: Arc<Mutex<FakeState>>,
}

impl FakeVcs {
    pub fn new(root: &Path) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                root: root.to_path_buf(),
                available: true,
                tracked: BTreeSet::new(),
                commits: Vec::new(),
                blame_time: Utc::now() - Duration::days(60),
            })),
        }
    }

    pub fn track(&self, abs: &Path) {
        self.state.lock().unwrap().tracked.insert(abs.to_path_buf());
    }

    pub fn set_available(&self, available: bool) {
        self.state.lock().unwrap().available = available;
    }

    pub fn set_blame_time(&self, t: DateTime<Utc>) {
        self.state.lock().unwrap().blame_time = t;
    }

    pub fn add_commit(&self, id: &str, author: &str, days_ago: i64, files: &[&str]) {
        self.state.lock().unwrap().commits.push(CommitInfo {
            id: id.to_string(),
            author: author.to_string(),
            timestamp: Utc::now() - Duration::days(days_ago),
            summary: format!("commit {id}"),
            files: files.iter().map(|f| f.to_string()).collect(),
        });
    }

    fn unavailable() -> GovernanceError {
        GovernanceError::VcsUnavailable("not a git repository".into())
    }
}

impl VersionControl for FakeVcs {
    fn repo_root(&self) -> GovResult<PathBuf> {
        let s = self.state.lock().unwrap();
        if !s.available {
            return Err(Self::unavailable());
        }
        Ok(s.root.clone())
    }

    fn is_tracked(&self, path: &Path) -> GovResult<bool> {
        let s = self.state.lock().unwrap();
        if !s.available {
            return Err(Self::unavailable());
        }
        Ok(s.tracked.contains(path))
    }

    fn commits_since(&self, path: &Path, since: DateTime<Utc>) -> GovResult<Vec<CommitInfo>> {
        let s = self.state.lock().unwrap();
        if !s.available {
            return Err(Self::unavailable());
        }
        let prefix = path
            .strip_prefix(&s.root)
            .map(|p| p.to_string_lossy().replace('\\', "/"))
            .unwrap_or_default();
        let mut out: Vec<CommitInfo> = s
            .commits
            .iter()
            .filter(|c| c.timestamp >= since)
            .filter(|c| prefix.is_empty() || c.files.iter().any(|f| f.starts_with(&prefix)))
            .cloned()
            .collect();
        out.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(out)
    }

    fn blame_line(&self, file: &Path, _line: usize) -> GovResult<BlameInfo> {
        let s = self.state.lock().unwrap();
        if !s.available || !s.tracked.contains(file) {
            return Err(GovernanceError::VcsUnavailable(format!(
                "no such path {} in HEAD",
                file.display()
            )));
        }
        Ok(BlameInfo {
            commit: "c0ffee".into(),
            author: "Ada".into(),
            timestamp: s.blame_time,
            committed: true,
        })
    }
}

pub struct Fixture {
    _dir: TempDir,
    pub root: PathBuf,
    pub vcs: FakeVcs,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = dir.path().canonicalize().expect("canonical tempdir");
        let vcs = FakeVcs::new(&root);
        Self {
            _dir: dir,
            root,
            vcs,
        }
    }

    /// Write an untracked file.
    pub fn write(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let p = self.root.join(rel);
        fs::create_dir_all(p.parent().unwrap()).unwrap();
        fs::write(&p, bytes).unwrap();
        p
    }

    /// Write a file and mark it tracked.
    pub fn write_tracked(&self, rel: &str, bytes: &[u8]) -> PathBuf {
        let p = self.write(rel, bytes);
        self.vcs.track(&p);
        p
    }

    pub fn read(&self, rel: &str) -> Vec<u8> {
        fs::read(self.root.join(rel)).unwrap()
    }

    pub fn workspace(&self) -> Workspace {
        Workspace::with_vcs(&self.root, Box::new(self.vcs.clone())).expect("workspace")
    }

    pub fn orchestrator(&self) -> Orchestrator {
        self.orchestrator_with(CoreConfig::default())
    }

    pub fn orchestrator_with(&self, config: CoreConfig) -> Orchestrator {
        Orchestrator::with_parts(self.workspace(), config, Constitution::standard())
            .expect("orchestrator")
    }

    pub fn audit_log(&self) -> PathBuf {
        self.root.join(".jarvis").join("audit.log")
    }

    pub fn audit_records(&self) -> Vec<AuditRecord> {
        read_records(&self.audit_log()).expect("read audit log")
    }

    /// Backup files anywhere under `rel_dir`.
    pub fn backups_under(&self, rel_dir: &str) -> Vec<PathBuf> {
        let mut out: Vec<PathBuf> = walk(&self.root.join(rel_dir))
            .into_iter()
            .filter(|p| p.to_string_lossy().ends_with(".backup"))
            .collect();
        out.sort();
        out
    }
}

fn walk(dir: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    if let Ok(entries) = fs::read_dir(dir) {
        for e in entries.flatten() {
            let p = e.path();
            if p.is_dir() {
                out.extend(walk(&p));
            } else {
                out.push(p);
            }
        }
    }
    out
}

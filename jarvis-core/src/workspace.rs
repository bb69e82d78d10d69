// src/workspace.rs
//! The rooted directory tree the agent may operate on, bound once per orchestrator.

use std::fmt;
use std::path::{Path, PathBuf};

use crate::config::RESERVED_DIR;
use crate::error::GovResult;
use crate::services::vcs::{GitCli, VersionControl};
use crate::utils::path as pathutil;

pub struct Workspace {
    root: PathBuf,
    vcs: Box<dyn VersionControl>,
}

impl Workspace {
    /// Bind `root` with the `git` adapter.
    pub fn open(root: impl AsRef<Path>) -> GovResult<Self> {
        let root = root.as_ref().canonicalize()?;
        let vcs = GitCli::new(root.clone());
        Ok(Self {
            root,
            vcs: Box::new(vcs),
        })
    }

    /// Bind `root` with a caller-supplied adapter.
    pub fn with_vcs(root: impl AsRef<Path>, vcs: Box<dyn VersionControl>) -> GovResult<Self> {
        let root = root.as_ref().canonicalize()?;
        Ok(Self { root, vcs })
    }

    /// Canonical absolute root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn vcs(&self) -> &dyn VersionControl {
        self.vcs.as_ref()
    }

    /// Whether version-control metadata is present at the root.
    pub fn has_vcs_metadata(&self) -> bool {
        self.root.join(".git").exists()
    }

    /// `<root>/.jarvis`
    pub fn reserved_dir(&self) -> PathBuf {
        self.root.join(RESERVED_DIR)
    }

    /// Resolve a raw path argument to a canonical descendant of the root.
    pub fn resolve(&self, raw: impl AsRef<Path>) -> GovResult<PathBuf> {
        pathutil::resolve(raw.as_ref(), &self.root)
    }

    /// Workspace-relative rendering with `/` separators.
    pub fn relative(&self, path: &Path) -> String {
        pathutil::relative_display(&self.root, path)
    }

    pub fn contains(&self, path: &Path) -> bool {
        path.starts_with(&self.root)
    }
}

impl fmt::Debug for Workspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Workspace").field("root", &self.root).finish()
    }
}

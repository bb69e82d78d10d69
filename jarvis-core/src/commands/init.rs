// jarvis-core/src/commands/init.rs

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::CoreConfig;
use crate::utils::fsio::write_atomic;

#[derive(Debug, Clone, Serialize)]
pub struct InitReport {
    pub root: PathBuf,
    pub created: Vec<String>,
    pub existed: Vec<String>,
}

/// Ensure the reserved directory, its default config and the audit log exist.
///
/// Idempotent; existing files are never rewritten. Callers must have
/// authorized `AuditAppend` on `audit_log` first.
pub fn ensure_initialized(reserved: &Path, config: &CoreConfig, audit_log: &Path) -> Result<InitReport> {
    let mut created = Vec::new();
    let mut existed = Vec::new();

    ensure_dir(reserved, "", &mut created, &mut existed)?;
    let config_text = config.to_toml()?;
    ensure_file(reserved, Path::new("config.toml"), &config_text, &mut created, &mut existed)?;

    let log_rel = audit_log.strip_prefix(reserved).unwrap_or(audit_log);
    ensure_file(reserved, log_rel, "", &mut created, &mut existed)?;

    if !created.is_empty() {
        tracing::info!(root = %reserved.display(), created = ?created, "reserved directory initialized");
    }
    Ok(InitReport {
        root: reserved.to_path_buf(),
        created,
        existed,
    })
}

fn ensure_dir(base: &Path, rel: &str, created: &mut Vec<String>, existed: &mut Vec<String>) -> Result<()> {
    let p = if rel.is_empty() { base.to_path_buf() } else { base.join(rel) };
    let label = if rel.is_empty() { ".".to_string() } else { rel.to_string() };
    if p.exists() {
        existed.push(label);
        return Ok(());
    }
    fs::create_dir_all(&p).with_context(|| format!("create_dir_all({:?})", p))?;
    created.push(label);
    Ok(())
}

fn ensure_file(
    base: &Path,
    rel_file: &Path,
    content_if_absent: &str,
    created: &mut Vec<String>,
    existed: &mut Vec<String>,
) -> Result<()> {
    let p = base.join(rel_file);
    let label = rel_file.to_string_lossy().into_owned();
    if p.exists() {
        existed.push(label);
        return Ok(());
    }
    write_atomic(&p, content_if_absent.as_bytes()).with_context(|| format!("write {:?}", p))?;
    created.push(label);
    Ok(())
}

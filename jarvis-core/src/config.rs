use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing;

/// Environment variable that overrides the workspace root (test harnesses).
pub const WORKSPACE_ENV: &str = "JARVIS_WORKSPACE";

/// Reserved directory at the workspace root holding the audit log and index.
pub const RESERVED_DIR: &str = ".jarvis";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CoreConfig {
    #[serde(default)]
    pub scanner: ScannerConfig,
    #[serde(default)]
    pub fixer: FixerConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub audit: AuditConfig,
}

impl CoreConfig {
    /// Load `<reserved_dir>/config.toml`, falling back to defaults when absent.
    pub fn load(reserved_dir: &Path) -> Result<Self> {
        let path = reserved_dir.join("config.toml");
        let cfg = if path.exists() {
            let text = fs::read_to_string(&path)
                .with_context(|| format!("reading config file {}", path.display()))?;
            toml::from_str::<CoreConfig>(&text)
                .with_context(|| format!("parsing config file {}", path.display()))?
        } else {
            tracing::info!(
                "No config file found at {}. Using CoreConfig::default().",
                path.display()
            );
            CoreConfig::default()
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        anyhow::ensure!(self.fixer.max_attempts >= 1, "fixer.max_attempts must be >= 1");
        anyhow::ensure!(self.scanner.max_file_bytes > 0, "scanner.max_file_bytes must be > 0");
        anyhow::ensure!(
            !self.memory.db_file.as_os_str().is_empty(),
            "memory.db_file must not be empty"
        );
        Ok(())
    }

    pub fn to_toml(&self) -> Result<String> {
        toml::to_string_pretty(self).context("serializing CoreConfig")
    }
}

/// Resolve the workspace root: explicit argument, then `JARVIS_WORKSPACE`, then cwd.
pub fn workspace_root(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(p) = explicit {
        return Ok(p.to_path_buf());
    }
    if let Some(p) = std::env::var_os(WORKSPACE_ENV) {
        return Ok(PathBuf::from(p));
    }
    std::env::current_dir().context("reading current directory")
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScannerConfig {
    #[serde(default = "ScannerConfig::default_max_file_bytes")]
    pub max_file_bytes: u64,
    #[serde(default = "ScannerConfig::default_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "ScannerConfig::default_ignored_dirs")]
    pub ignored_dirs: Vec<String>,
    #[serde(default = "ScannerConfig::default_snippet_len")]
    pub snippet_len: usize,
}

impl ScannerConfig {
    fn default_max_file_bytes() -> u64 {
        1024 * 1024
    }

    pub fn default_extensions() -> Vec<String> {
        [
            "py", "pyw", "js", "jsx", "mjs", "cjs", "ts", "tsx", "java", "go", "rb", "php", "rs",
            "c", "h", "cpp", "hpp", "cs", "sh", "bash", "kt", "swift", "scala", "vue", "svelte",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    pub fn default_ignored_dirs() -> Vec<String> {
        [
            "__pycache__",
            "node_modules",
            "target",
            "dist",
            "build",
            "venv",
            "env",
            "coverage",
            "htmlcov",
        ]
        .iter()
        .map(|s| s.to_string())
        .collect()
    }

    fn default_snippet_len() -> usize {
        120
    }
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            max_file_bytes: Self::default_max_file_bytes(),
            extensions: Self::default_extensions(),
            ignored_dirs: Self::default_ignored_dirs(),
            snippet_len: Self::default_snippet_len(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixerConfig {
    #[serde(default = "FixerConfig::default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "FixerConfig::default_backoff_ms")]
    pub backoff_ms: u64,
}

impl FixerConfig {
    fn default_max_attempts() -> u32 {
        3
    }

    fn default_backoff_ms() -> u64 {
        25
    }
}

impl Default for FixerConfig {
    fn default() -> Self {
        Self {
            max_attempts: Self::default_max_attempts(),
            backoff_ms: Self::default_backoff_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Relative paths resolve under the reserved directory.
    #[serde(default = "MemoryConfig::default_db_file")]
    pub db_file: PathBuf,
    #[serde(default = "MemoryConfig::default_history_days")]
    pub history_days: u32,
    #[serde(default = "MemoryConfig::default_stale_todo_days")]
    pub stale_todo_days: u32,
    #[serde(default = "MemoryConfig::default_hotspot_threshold")]
    pub hotspot_threshold: usize,
}

impl MemoryConfig {
    fn default_db_file() -> PathBuf {
        PathBuf::from("context.db")
    }

    fn default_history_days() -> u32 {
        90
    }

    fn default_stale_todo_days() -> u32 {
        30
    }

    fn default_hotspot_threshold() -> usize {
        5
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            db_file: Self::default_db_file(),
            history_days: Self::default_history_days(),
            stale_todo_days: Self::default_stale_todo_days(),
            hotspot_threshold: Self::default_hotspot_threshold(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditConfig {
    #[serde(default = "AuditConfig::default_log_file")]
    pub log_file: PathBuf,
}

impl AuditConfig {
    fn default_log_file() -> PathBuf {
        PathBuf::from("audit.log")
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            log_file: Self::default_log_file(),
        }
    }
}

/// Join `value` under `base` unless it is already absolute.
pub fn absolutize(base: &Path, value: &Path) -> PathBuf {
    if value.is_absolute() {
        value.to_path_buf()
    } else {
        base.join(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_file_yields_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let cfg = CoreConfig::load(tmp.path()).unwrap();
        assert_eq!(cfg.scanner.max_file_bytes, 1024 * 1024);
        assert_eq!(cfg.memory.stale_todo_days, 30);
        assert_eq!(cfg.audit.log_file, PathBuf::from("audit.log"));
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(
            tmp.path().join("config.toml"),
            "[scanner]\nmax_file_bytes = 2048\n\n[memory]\nstale_todo_days = 7\n",
        )
        .unwrap();
        let cfg = CoreConfig::load(tmp.path()).unwrap();
        assert_eq!(cfg.scanner.max_file_bytes, 2048);
        assert!(cfg.scanner.extensions.iter().any(|e| e == "py"));
        assert_eq!(cfg.memory.stale_todo_days, 7);
        assert_eq!(cfg.fixer.max_attempts, 3);
    }

    #[test]
    fn written_defaults_load_back() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("config.toml"), CoreConfig::default().to_toml().unwrap()).unwrap();
        let cfg = CoreConfig::load(tmp.path()).unwrap();
        assert_eq!(cfg.scanner.ignored_dirs, ScannerConfig::default_ignored_dirs());
    }

    #[test]
    fn invalid_values_are_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("config.toml"), "[fixer]\nmax_attempts = 0\n").unwrap();
        assert!(CoreConfig::load(tmp.path()).is_err());

        fs::write(tmp.path().join("config.toml"), "[scanner\n").unwrap();
        assert!(CoreConfig::load(tmp.path()).is_err());
    }

    #[test]
    fn relative_values_resolve_under_base() {
        let base = Path::new("/ws/.jarvis");
        assert_eq!(absolutize(base, Path::new("audit.log")), base.join("audit.log"));
        assert_eq!(absolutize(base, Path::new("/var/log/a.log")), PathBuf::from("/var/log/a.log"));
    }
}

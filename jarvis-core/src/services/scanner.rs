// src/services/scanner.rs
//! Line-wise pattern scanner.
//!
//! - Files are read lazily, one at a time, in sorted traversal order.
//! - Each line is matched against the detector table; first match wins.
//! - Oversized, undecodable and non-source files become diagnostics, never violations.

use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use walkdir::{DirEntry, WalkDir};

use crate::config::ScannerConfig;
use crate::error::GovResult;
use crate::services::detectors::{self, DetectorId, Severity};
use crate::services::fixer::can_fix;
use crate::services::language::Language;
use crate::utils::encoding::{decode_with_fallback, TextEncoding};
use crate::utils::path::relative_display;

/// A detected breach inside a file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Violation {
    pub kind: DetectorId,
    /// Workspace-relative, `/`-separated.
    pub file: String,
    /// 1-based.
    pub line: usize,
    pub severity: Severity,
    /// Original line text, truncated.
    pub text: String,
    pub fixable: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub suggested_fix: Option<String>,
    pub fixed: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SkipReason {
    TooLarge,
    Encoding,
    NotSourceExtension,
}

impl SkipReason {
    /// Diagnostic code used in reports and audit records.
    pub fn code(&self) -> &'static str {
        match self {
            SkipReason::TooLarge => "SKIPPED_TOO_LARGE",
            SkipReason::Encoding => "SKIPPED_ENCODING",
            SkipReason::NotSourceExtension => "SKIPPED_NOT_SOURCE",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileDiagnostic {
    pub file: String,
    pub reason: SkipReason,
    pub code: &'static str,
    pub detail: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub violations: Vec<Violation>,
    pub files_examined: usize,
    /// Workspace-relative paths of the files actually read, in scan order.
    pub examined: Vec<String>,
    pub diagnostics: Vec<FileDiagnostic>,
}

pub struct Scanner {
    root: PathBuf,
    cfg: ScannerConfig,
}

impl Scanner {
    pub fn new(root: impl Into<PathBuf>, cfg: ScannerConfig) -> Self {
        Self {
            root: root.into(),
            cfg,
        }
    }

    /// Scan a canonical `target` (file or directory) with the configured extensions.
    pub fn scan(&self, target: &Path) -> GovResult<ScanReport> {
        self.scan_with(target, None)
    }

    /// Scan `target`, optionally overriding the extension allow-list.
    ///
    /// # Returns
    /// * `Ok(ScanReport)`: violations in file order, then strictly increasing line order.
    ///
    /// # Errors
    /// * `Io` if the target itself cannot be inspected.
    pub fn scan_with(&self, target: &Path, extensions: Option<&[String]>) -> GovResult<ScanReport> {
        let exts: Vec<String> = extensions
            .unwrap_or(&self.cfg.extensions)
            .iter()
            .map(|e| e.trim_start_matches('.').to_ascii_lowercase())
            .collect();
        let mut report = ScanReport::default();

        let meta = fs::metadata(target)?;
        if meta.is_file() {
            if has_extension(target, &exts) {
                self.scan_file(target, meta.len(), &mut report);
            } else {
                report.diagnostics.push(FileDiagnostic {
                    file: relative_display(&self.root, target),
                    reason: SkipReason::NotSourceExtension,
                    code: SkipReason::NotSourceExtension.code(),
                    detail: "extension is not in the source allow-list".to_string(),
                });
            }
            return Ok(report);
        }

        let walker = WalkDir::new(target)
            .sort_by_file_name()
            .into_iter()
            .filter_entry(|e| e.depth() == 0 || !self.is_excluded(e));
        for entry in walker {
            let entry = match entry {
                Ok(e) => e,
                Err(e) => {
                    tracing::warn!("skipping unreadable entry: {e}");
                    continue;
                }
            };
            if !entry.file_type().is_file() || !has_extension(entry.path(), &exts) {
                continue;
            }
            let len = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    tracing::warn!("skipping {}: {e}", entry.path().display());
                    continue;
                }
            };
            self.scan_file(entry.path(), len, &mut report);
        }
        Ok(report)
    }

    fn is_excluded(&self, entry: &DirEntry) -> bool {
        let name = entry.file_name().to_string_lossy();
        if name.starts_with('.') {
            return true;
        }
        entry.file_type().is_dir() && self.cfg.ignored_dirs.iter().any(|d| d.as_str() == name)
    }

    fn scan_file(&self, path: &Path, len: u64, report: &mut ScanReport) {
        let rel = relative_display(&self.root, path);
        if len > self.cfg.max_file_bytes {
            tracing::warn!("{rel}: {len} bytes exceeds cap {}", self.cfg.max_file_bytes);
            report.diagnostics.push(FileDiagnostic {
                file: rel,
                reason: SkipReason::TooLarge,
                code: SkipReason::TooLarge.code(),
                detail: format!("{len} bytes exceeds the {} byte cap", self.cfg.max_file_bytes),
            });
            return;
        }
        let bytes = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                tracing::warn!("{rel}: read failed: {e}");
                return;
            }
        };
        let Some((text, encoding)) = decode_with_fallback(&bytes) else {
            let tried: Vec<&str> = TextEncoding::FALLBACK_CHAIN.iter().map(|e| e.as_str()).collect();
            report.diagnostics.push(FileDiagnostic {
                file: rel,
                reason: SkipReason::Encoding,
                code: SkipReason::Encoding.code(),
                detail: format!("not decodable as any of {}", tried.join(", ")),
            });
            return;
        };
        if encoding != TextEncoding::Utf8 {
            tracing::debug!("{rel}: decoded as {}", encoding.as_str());
        }
        report.violations.extend(self.scan_text(&rel, &text));
        report.files_examined += 1;
        report.examined.push(rel);
    }

    /// Apply the detector table to every line of `text`, read as the language of `rel`.
    ///
    /// A violation is `fixable` only when the fixer has a rewrite for that
    /// detector in this language.
    pub fn scan_text(&self, rel: &str, text: &str) -> Vec<Violation> {
        let lang = Language::for_path(Path::new(rel));
        let mut out = Vec::new();
        for (idx, line) in text.lines().enumerate() {
            let Some(det) = detectors::first_match(line, lang) else {
                continue;
            };
            let def = det.def;
            out.push(Violation {
                kind: def.id,
                file: rel.to_string(),
                line: idx + 1,
                severity: def.severity,
                text: truncate_preview(line, self.cfg.snippet_len),
                fixable: def.fixable && can_fix(def.id, lang),
                suggested_fix: def.suggested_fix.map(str::to_string),
                fixed: false,
            });
        }
        out
    }
}

fn has_extension(path: &Path, exts: &[String]) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| exts.iter().any(|x| x.eq_ignore_ascii_case(e)))
        .unwrap_or(false)
}

/// Single-line preview truncated to `max_chars` with an ellipsis.
fn truncate_preview(s: &str, max_chars: usize) -> String {
    let t = s.trim_end();
    if t.chars().count() <= max_chars {
        return t.to_string();
    }
    let mut out: String = t.chars().take(max_chars).collect();
    out.push('…');
    out
}

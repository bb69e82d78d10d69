//! services/fixer.rs
//! Deterministic auto-heal: one transform per fixable detector.
//!
//! - Transforms are line-local and idempotent; a line the detector no longer
//!   matches is `NotApplicable`.
//! - The rewrite depends on the file's language; a detector with no rewrite
//!   for that language is `NotApplicable` and the scanner reports it unfixable.
//! - Edits within a file apply bottom to top so earlier line numbers stay valid.
//!   Preambles (imports, includes) are inserted last, once each, after the
//!   file header.
//! - `<file>.backup` is written before the first modification, only if no backup
//!   exists yet, and at most once per run.
//! - Output is always UTF-8, whatever encoding the file was read with.
//! - Writes go through a temp sibling + rename, retried with exponential backoff.

use regex::Captures;
use serde::Serialize;
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::ops::Range;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use crate::config::FixerConfig;
use crate::services::detectors::{self, CompiledDetector, DetectorId};
use crate::services::language::Language;
use crate::services::scanner::Violation;
use crate::utils::encoding::{decode_with_fallback, TextEncoding};
use crate::utils::fsio::write_atomic;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", content = "detail")]
pub enum FixOutcome {
    Fixed(String),
    NotApplicable(String),
    #[serde(rename = "FailedIO")]
    FailedIo(String),
}

impl FixOutcome {
    pub fn is_fixed(&self) -> bool {
        matches!(self, FixOutcome::Fixed(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ViolationFix {
    pub kind: DetectorId,
    pub line: usize,
    #[serde(flatten)]
    pub outcome: FixOutcome,
}

/// Per-file result of a heal pass.
#[derive(Debug, Clone, Serialize)]
pub struct FileFixReport {
    pub file: String,
    pub fixes: Vec<ViolationFix>,
    /// Backup created by this call, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub backup: Option<PathBuf>,
    pub written: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<TextEncoding>,
}

impl FileFixReport {
    fn new(file: &str) -> Self {
        Self {
            file: file.to_string(),
            fixes: Vec::new(),
            backup: None,
            written: false,
            encoding: None,
        }
    }

    pub fn fixed_count(&self) -> usize {
        self.fixes.iter().filter(|f| f.outcome.is_fixed()).count()
    }

    /// Fixed count per detector id.
    pub fn fixes_by_kind(&self) -> BTreeMap<String, usize> {
        let mut out = BTreeMap::new();
        for f in self.fixes.iter().filter(|f| f.outcome.is_fixed()) {
            *out.entry(f.kind.as_str().to_string()).or_insert(0) += 1;
        }
        out
    }

    pub fn failure(&self) -> Option<&str> {
        self.fixes.iter().find_map(|f| match &f.outcome {
            FixOutcome::FailedIo(d) => Some(d.as_str()),
            _ => None,
        })
    }
}

/// `<name>.backup` next to `path`.
pub fn backup_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".backup");
    path.with_file_name(name)
}

pub struct Fixer {
    cfg: FixerConfig,
    backed_up: HashSet<PathBuf>,
}

impl Fixer {
    pub fn new(cfg: FixerConfig) -> Self {
        Self {
            cfg,
            backed_up: HashSet::new(),
        }
    }

    /// Start a new run; backups may be taken again for files not yet backed up on disk.
    pub fn begin_run(&mut self) {
        self.backed_up.clear();
    }

    /// Apply every applicable fix for `violations` (all in the file at `path`).
    ///
    /// Never returns an error: I/O failures become `FailedIo` outcomes and the
    /// file is left exactly as it was.
    pub fn fix_file(&mut self, path: &Path, rel: &str, violations: &[Violation]) -> FileFixReport {
        let mut report = FileFixReport::new(rel);
        let mut ordered: Vec<&Violation> = violations.iter().collect();
        ordered.sort_by(|a, b| b.line.cmp(&a.line));

        let original = match fs::read(path) {
            Ok(b) => b,
            Err(e) => {
                let detail = format!("read failed: {e}");
                report.fixes = fail_all(&ordered, &detail);
                return report;
            }
        };
        let Some((text, encoding)) = decode_with_fallback(&original) else {
            report.fixes = ordered
                .iter()
                .map(|v| ViolationFix {
                    kind: v.kind,
                    line: v.line,
                    outcome: FixOutcome::NotApplicable("file no longer decodes as text".into()),
                })
                .collect();
            return report;
        };
        report.encoding = Some(encoding);

        let newline = if text.contains("\r\n") { "\r\n" } else { "\n" };
        let trailing = text.ends_with('\n');
        let mut lines: Vec<String> = text.lines().map(str::to_string).collect();
        let lang = Language::for_path(path);

        let mut preambles: Vec<Preamble> = Vec::new();
        for v in &ordered {
            let (outcome, preamble) = apply_fix(v, &mut lines, lang);
            if outcome.is_fixed() {
                if let Some(p) = preamble {
                    if !preambles.contains(&p) {
                        preambles.push(p);
                    }
                }
            }
            report.fixes.push(ViolationFix {
                kind: v.kind,
                line: v.line,
                outcome,
            });
        }
        if report.fixed_count() == 0 {
            return report;
        }
        insert_preambles(&mut lines, &preambles, lang);

        let mut updated = lines.join(newline);
        if trailing {
            updated.push_str(newline);
        }
        let created_backup = match self.ensure_backup(path, &original) {
            Ok(created) => created,
            Err(e) => {
                let detail = format!("backup failed: {e}");
                mark_failed(&mut report, &detail);
                return report;
            }
        };

        match self.write_with_retry(path, updated.as_bytes()) {
            Ok(()) => {
                report.written = true;
                report.backup = created_backup;
                tracing::info!(file = rel, fixes = report.fixed_count(), "file healed");
            }
            Err(e) => {
                if let Some(b) = &created_backup {
                    let _ = fs::remove_file(b);
                    self.backed_up.remove(path);
                }
                mark_failed(&mut report, &format!("write failed: {e}"));
            }
        }
        report
    }

    /// Write `<file>.backup` before the first modification of `path`.
    ///
    /// A backup already on disk is never replaced, even one left by an earlier
    /// run: it keeps the bytes from before the first heal ever applied to the
    /// file, and later runs only stack fixes on top of it. Within one run the
    /// check happens at most once per file.
    fn ensure_backup(&mut self, path: &Path, original: &[u8]) -> std::io::Result<Option<PathBuf>> {
        if self.backed_up.contains(path) {
            return Ok(None);
        }
        let backup = backup_path(path);
        if backup.exists() {
            self.backed_up.insert(path.to_path_buf());
            return Ok(None);
        }
        write_atomic(&backup, original)?;
        self.backed_up.insert(path.to_path_buf());
        Ok(Some(backup))
    }

    fn write_with_retry(&self, path: &Path, bytes: &[u8]) -> std::io::Result<()> {
        let mut delay = self.cfg.backoff_ms;
        let mut attempt = 1;
        loop {
            match write_atomic(path, bytes) {
                Ok(()) => return Ok(()),
                Err(e) if attempt >= self.cfg.max_attempts => return Err(e),
                Err(e) => {
                    tracing::warn!("write attempt {attempt} for {} failed: {e}", path.display());
                    thread::sleep(Duration::from_millis(delay));
                    delay = delay.saturating_mul(2);
                    attempt += 1;
                }
            }
        }
    }
}

fn fail_all(ordered: &[&Violation], detail: &str) -> Vec<ViolationFix> {
    ordered
        .iter()
        .map(|v| ViolationFix {
            kind: v.kind,
            line: v.line,
            outcome: FixOutcome::FailedIo(detail.to_string()),
        })
        .collect()
}

fn mark_failed(report: &mut FileFixReport, detail: &str) {
    tracing::warn!(file = %report.file, "{detail}");
    for f in report.fixes.iter_mut().filter(|f| f.outcome.is_fixed()) {
        f.outcome = FixOutcome::FailedIo(detail.to_string());
    }
}

/// Import, include or require line a rewritten line depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preamble {
    pub line: &'static str,
    /// Other spellings that already satisfy the dependency.
    pub satisfied_by: &'static [&'static str],
}

impl Preamble {
    const fn new(line: &'static str) -> Self {
        Self {
            line,
            satisfied_by: &[],
        }
    }

    fn present(&self, lines: &[String]) -> bool {
        lines.iter().any(|l| {
            let t = l.trim();
            t == self.line || self.satisfied_by.contains(&t)
        })
    }
}

const PY_OS: Preamble = Preamble::new("import os");
const PY_AST: Preamble = Preamble::new("import ast");
const PY_SHLEX: Preamble = Preamble::new("import shlex");
const JS_SHELL_QUOTE: Preamble = Preamble::new("const { quote } = require('shell-quote');");
const RB_JSON: Preamble = Preamble {
    line: "require 'json'",
    satisfied_by: &["require \"json\""],
};
const RB_SHELLWORDS: Preamble = Preamble {
    line: "require 'shellwords'",
    satisfied_by: &["require \"shellwords\""],
};
const GO_OS: Preamble = Preamble {
    line: "import \"os\"",
    satisfied_by: &["\"os\""],
};
const C_STDLIB: Preamble = Preamble {
    line: "#include <stdlib.h>",
    satisfied_by: &["#include <cstdlib>"],
};
const SWIFT_FOUNDATION: Preamble = Preamble::new("import Foundation");

type Rewrite = (String, Option<Preamble>);

/// Expression reading `env` from the environment, defaulting to empty.
fn env_lookup(lang: Language, env: &str) -> Option<Rewrite> {
    let (expr, preamble) = match lang {
        Language::Python => (format!("os.environ.get(\"{env}\", \"\")"), Some(PY_OS)),
        Language::Script => (format!("process.env.{env} ?? \"\""), None),
        Language::Ruby => (format!("ENV.fetch(\"{env}\", \"\")"), None),
        Language::Php => (format!("(getenv(\"{env}\") ?: \"\")"), None),
        Language::Go => (format!("os.Getenv(\"{env}\")"), Some(GO_OS)),
        Language::Shell => (format!("${{{env}:-}}"), None),
        Language::Rust => (format!("std::env::var(\"{env}\").unwrap_or_default()"), None),
        Language::C => (format!("getenv(\"{env}\")"), Some(C_STDLIB)),
        Language::Jvm => (format!("System.getenv().getOrDefault(\"{env}\", \"\")"), None),
        Language::CSharp => (
            format!("(System.Environment.GetEnvironmentVariable(\"{env}\") ?? \"\")"),
            None,
        ),
        Language::Swift => (
            format!("(ProcessInfo.processInfo.environment[\"{env}\"] ?? \"\")"),
            Some(SWIFT_FOUNDATION),
        ),
        Language::Other => return None,
    };
    Some((expr, preamble))
}

/// Safe parser call replacing `eval(`.
fn literal_parser(lang: Language) -> Option<(&'static str, Option<Preamble>)> {
    match lang {
        Language::Python => Some(("ast.literal_eval(", Some(PY_AST))),
        Language::Script => Some(("JSON.parse(", None)),
        Language::Ruby => Some(("JSON.parse(", Some(RB_JSON))),
        Language::Php => Some(("json_decode(", None)),
        _ => None,
    }
}

/// Shell-quoted form of the expression `var`.
fn shell_quote(lang: Language, var: &str) -> Option<Rewrite> {
    match lang {
        Language::Python => Some((format!("shlex.quote({var})"), Some(PY_SHLEX))),
        Language::Script => Some((format!("quote([{var}])"), Some(JS_SHELL_QUOTE))),
        Language::Ruby => Some((format!("Shellwords.escape({var})"), Some(RB_SHELLWORDS))),
        Language::Php => Some((format!("escapeshellarg({var})"), None)),
        _ => None,
    }
}

/// Whether `kind` has a rewrite for files in `lang`.
pub fn can_fix(kind: DetectorId, lang: Language) -> bool {
    match kind {
        DetectorId::AwsAccessKey => false,
        DetectorId::HardcodedPassword | DetectorId::HardcodedApiKey => {
            env_lookup(lang, "").is_some()
        }
        DetectorId::DangerousEval => literal_parser(lang).is_some(),
        DetectorId::CommandInjection => shell_quote(lang, "").is_some(),
        DetectorId::BareExcept
        | DetectorId::ConsoleLog
        | DetectorId::AnyType
        | DetectorId::TodoComment => true,
    }
}

/// Apply the transform for `v` to the in-memory `lines`.
///
/// # Returns
/// * The outcome, plus the preamble the rewritten line depends on.
pub fn apply_fix(
    v: &Violation,
    lines: &mut [String],
    lang: Language,
) -> (FixOutcome, Option<Preamble>) {
    let Some(slot) = v.line.checked_sub(1).and_then(|i| lines.get_mut(i)) else {
        return (
            FixOutcome::NotApplicable(format!("line {} no longer exists", v.line)),
            None,
        );
    };
    let line = slot.as_str();
    let det = detectors::detector(v.kind);
    if det.find(line, lang).is_none() {
        return (
            FixOutcome::NotApplicable("pattern no longer present".into()),
            None,
        );
    }
    if !can_fix(v.kind, lang) {
        let detail = match v.kind {
            DetectorId::AwsAccessKey => "credential must be rotated by a human",
            _ => "no transform for this file type",
        };
        return (FixOutcome::NotApplicable(detail.into()), None);
    }

    let mut preamble = None;
    let rewritten = match v.kind {
        DetectorId::HardcodedPassword => rewrite(line, det, lang, |c| {
            secret_edit(c, 1, "password", lang, &mut preamble)
        }),
        DetectorId::HardcodedApiKey => rewrite(line, det, lang, |c| {
            let name = c.get(1).map(|m| m.as_str()).unwrap_or("api_key");
            secret_edit(c, 2, name, lang, &mut preamble)
        }),
        DetectorId::DangerousEval => rewrite(line, det, lang, |c| {
            let (call, needs) = literal_parser(lang)?;
            preamble = needs;
            whole(c, call)
        }),
        DetectorId::BareExcept => rewrite(line, det, lang, |c| whole(c, "except Exception as e:")),
        DetectorId::CommandInjection => rewrite(line, det, lang, |c| {
            let var = c.get(2)?;
            let (quoted, needs) = shell_quote(lang, var.as_str())?;
            preamble = needs;
            Some((var.range(), quoted))
        }),
        DetectorId::ConsoleLog => {
            let body = line.trim_start();
            let indent = &line[..line.len() - body.len()];
            Some(format!("{indent}{} {body}", lang.line_comment()))
        }
        DetectorId::AnyType => rewrite(line, det, lang, |c| whole(c, ": unknown")),
        DetectorId::TodoComment => rewrite(line, det, lang, |c| {
            let marker = c.get(1)?;
            let closed = match marker.as_str() {
                "TODO" => "✓ DONE",
                "FIXME" => "✓ FIXED",
                _ => "✓ RESOLVED",
            };
            Some((marker.range(), closed.to_string()))
        }),
        DetectorId::AwsAccessKey => None,
    };

    match rewritten {
        Some(new_line) => {
            let detail = format!("{} fixed at line {}", v.kind, v.line);
            *slot = new_line;
            (FixOutcome::Fixed(detail), preamble)
        }
        None => (
            FixOutcome::NotApplicable("already in fixed form".into()),
            None,
        ),
    }
}

/// Replace every placed match of `det` on `line` using `edit`.
fn rewrite<F>(line: &str, det: &CompiledDetector, lang: Language, mut edit: F) -> Option<String>
where
    F: FnMut(&Captures<'_>) -> Option<(Range<usize>, String)>,
{
    let edits: Vec<(Range<usize>, String)> = det
        .captures_all(line, lang)
        .iter()
        .filter_map(|c| edit(c))
        .collect();
    if edits.is_empty() {
        return None;
    }
    let mut out = line.to_string();
    for (range, text) in edits.into_iter().rev() {
        out.replace_range(range, &text);
    }
    Some(out)
}

fn whole(c: &Captures<'_>, replacement: &str) -> Option<(Range<usize>, String)> {
    c.get(0).map(|m| (m.range(), replacement.to_string()))
}

fn secret_edit(
    c: &Captures<'_>,
    literal_group: usize,
    name: &str,
    lang: Language,
    preamble: &mut Option<Preamble>,
) -> Option<(Range<usize>, String)> {
    let literal = c.get(literal_group)?;
    let (lookup, needs) = env_lookup(lang, &env_var_name(name))?;
    *preamble = needs;
    Some((literal.range(), lookup))
}

/// `apiKey` -> `API_KEY`, `secret_key` -> `SECRET_KEY`.
pub fn env_var_name(name: &str) -> String {
    let mut out = String::with_capacity(name.len() + 4);
    let mut prev_lower = false;
    for ch in name.chars() {
        if ch.is_ascii_uppercase() && prev_lower {
            out.push('_');
        }
        prev_lower = ch.is_ascii_lowercase() || ch.is_ascii_digit();
        out.push(ch.to_ascii_uppercase());
    }
    out
}

/// Insert each missing preamble, in order, after the file's header.
fn insert_preambles(lines: &mut Vec<String>, preambles: &[Preamble], lang: Language) {
    let at = preamble_anchor(lines, lang);
    for p in preambles.iter().rev() {
        if p.present(lines) {
            continue;
        }
        lines.insert(at, p.line.to_string());
    }
}

/// Index of the first line a new import may precede.
fn preamble_anchor(lines: &[String], lang: Language) -> usize {
    let shebang = usize::from(lines.first().is_some_and(|l| l.starts_with("#!")));
    match lang {
        Language::Python => python_header_end(lines),
        Language::Script => skip_while(lines, shebang, |t| {
            matches!(t.trim_end_matches(';'), "'use strict'" | "\"use strict\"")
        }),
        Language::Ruby => skip_while(lines, shebang, |t| {
            t.contains("frozen_string_literal:") || is_coding_cookie(t)
        }),
        Language::Go => lines
            .iter()
            .position(|l| l.trim_start().starts_with("package "))
            .map_or(0, |i| i + 1),
        _ => shebang,
    }
}

fn skip_while(lines: &[String], from: usize, pred: impl Fn(&str) -> bool) -> usize {
    let mut i = from;
    while lines.get(i).is_some_and(|l| pred(l.trim())) {
        i += 1;
    }
    i
}

/// `# -*- coding: latin-1 -*-` and friends.
fn is_coding_cookie(trimmed: &str) -> bool {
    trimmed.starts_with('#') && (trimmed.contains("coding:") || trimmed.contains("coding="))
}

/// End of the Python module header: shebang, coding cookie, module docstring
/// and `from __future__` imports all stay ahead of inserted imports.
fn python_header_end(lines: &[String]) -> usize {
    let mut anchor = 0;
    let mut i = 0;
    let mut docstring_allowed = true;
    while i < lines.len() {
        let t = lines[i].trim();
        if (i == 0 && t.starts_with("#!")) || (i < 2 && is_coding_cookie(t)) {
            i += 1;
            anchor = i;
            continue;
        }
        if t.is_empty() || t.starts_with('#') {
            i += 1;
            continue;
        }
        if docstring_allowed {
            docstring_allowed = false;
            if let Some(end) = docstring_end(lines, i) {
                i = end + 1;
                anchor = i;
                continue;
            }
        }
        if t.starts_with("from __future__ import") {
            let mut end = i;
            if t.contains('(') {
                while end + 1 < lines.len() && !lines[end].contains(')') {
                    end += 1;
                }
            }
            i = end + 1;
            anchor = i;
            continue;
        }
        break;
    }
    anchor
}

/// Last line of a triple-quoted string statement opening at `start`.
fn docstring_end(lines: &[String], start: usize) -> Option<usize> {
    let body = lines[start]
        .trim_start()
        .trim_start_matches(|c: char| matches!(c, 'r' | 'R' | 'u' | 'U'));
    let delim = ["\"\"\"", "'''"].into_iter().find(|d| body.starts_with(*d))?;
    if body[3..].contains(delim) {
        return Some(start);
    }
    (start + 1..lines.len()).find(|&j| lines[j].contains(delim))
}

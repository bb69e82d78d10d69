//! services/detectors.rs
//! The one declarative detector table consumed by the scanner and the fixer.
//!
//! Each row is `(id, severity, line matcher, fixable, description)`. Rows are
//! tried in declaration order and the first match wins, so a line yields at
//! most one violation. Identifiers are referenced by audit records and must
//! stay stable.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::services::language::{comment_start, Language};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DetectorId {
    HardcodedPassword,
    HardcodedApiKey,
    AwsAccessKey,
    DangerousEval,
    BareExcept,
    CommandInjection,
    ConsoleLog,
    #[serde(alias = "CONSTITUTIONAL_ANY_TYPE")]
    AnyType,
    TodoComment,
}

impl DetectorId {
    pub fn as_str(&self) -> &'static str {
        match self {
            DetectorId::HardcodedPassword => "HARDCODED_PASSWORD",
            DetectorId::HardcodedApiKey => "HARDCODED_API_KEY",
            DetectorId::AwsAccessKey => "AWS_ACCESS_KEY",
            DetectorId::DangerousEval => "DANGEROUS_EVAL",
            DetectorId::BareExcept => "BARE_EXCEPT",
            DetectorId::CommandInjection => "COMMAND_INJECTION",
            DetectorId::ConsoleLog => "CONSOLE_LOG",
            DetectorId::AnyType => "ANY_TYPE",
            DetectorId::TodoComment => "TODO_COMMENT",
        }
    }

    /// Parse a stable id; the legacy `CONSTITUTIONAL_ANY_TYPE` maps to `ANY_TYPE`.
    pub fn parse(s: &str) -> Option<Self> {
        if s == "CONSTITUTIONAL_ANY_TYPE" {
            return Some(DetectorId::AnyType);
        }
        DETECTORS.iter().map(|d| d.id).find(|id| id.as_str() == s)
    }
}

impl fmt::Display for DetectorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Severity {
    Critical,
    High,
    Medium,
    Low,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Critical => "CRITICAL",
            Severity::High => "HIGH",
            Severity::Medium => "MEDIUM",
            Severity::Low => "LOW",
        }
    }
}

/// Where on the line a match is allowed to sit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Anywhere,
    OutsideComment,
    InsideComment,
    /// Outside comments, and not immediately followed by `(`.
    OutsideCommentNotCall,
}

#[derive(Debug)]
pub struct Detector {
    pub id: DetectorId,
    pub severity: Severity,
    pub pattern: &'static str,
    pub placement: Placement,
    pub fixable: bool,
    pub description: &'static str,
    pub suggested_fix: Option<&'static str>,
}

pub static DETECTORS: [Detector; 9] = [
    Detector {
        id: DetectorId::HardcodedPassword,
        severity: Severity::Critical,
        pattern: r#"\bpassword\s*=\s*("[^"]+"|'[^']+')"#,
        placement: Placement::Anywhere,
        fixable: true,
        description: "hardcoded password literal",
        suggested_fix: Some("read the password from the environment"),
    },
    Detector {
        id: DetectorId::HardcodedApiKey,
        severity: Severity::Critical,
        pattern: r#"\b(api_key|apiKey|secret_key|secretKey)\s*=\s*("[^"]+"|'[^']+')"#,
        placement: Placement::Anywhere,
        fixable: true,
        description: "hardcoded API key literal",
        suggested_fix: Some("read the key from the environment"),
    },
    Detector {
        id: DetectorId::AwsAccessKey,
        severity: Severity::Critical,
        pattern: r"\bAKIA[0-9A-Z]{16}\b",
        placement: Placement::Anywhere,
        fixable: false,
        description: "AWS access key id",
        suggested_fix: None,
    },
    Detector {
        id: DetectorId::DangerousEval,
        severity: Severity::High,
        pattern: r"\beval\(",
        placement: Placement::OutsideComment,
        fixable: true,
        description: "call to eval()",
        suggested_fix: Some("use a safe literal evaluator"),
    },
    Detector {
        id: DetectorId::BareExcept,
        severity: Severity::High,
        pattern: r"\bexcept\s*:",
        placement: Placement::OutsideComment,
        fixable: true,
        description: "bare except clause",
        suggested_fix: Some("catch Exception explicitly"),
    },
    Detector {
        id: DetectorId::CommandInjection,
        severity: Severity::High,
        pattern: r"\b(execSync|exec|spawn)\(\s*([A-Za-z_$][\w$]*(?:\.[A-Za-z_$][\w$]*)*)\s*[,)]",
        placement: Placement::OutsideComment,
        fixable: true,
        description: "shell command built from an unescaped variable",
        suggested_fix: Some("quote the argument before handing it to the shell"),
    },
    Detector {
        id: DetectorId::ConsoleLog,
        severity: Severity::Low,
        pattern: r"\bconsole\.log\(",
        placement: Placement::OutsideComment,
        fixable: true,
        description: "console.log left in code",
        suggested_fix: Some("comment out the debug output"),
    },
    Detector {
        id: DetectorId::AnyType,
        severity: Severity::Medium,
        pattern: r":\s*any\b",
        placement: Placement::OutsideCommentNotCall,
        fixable: true,
        description: "`any` type annotation",
        suggested_fix: Some("annotate as `unknown`"),
    },
    Detector {
        id: DetectorId::TodoComment,
        severity: Severity::Low,
        pattern: r"\b(TODO|FIXME|XXX)\b",
        placement: Placement::InsideComment,
        fixable: true,
        description: "open TODO/FIXME/XXX marker",
        suggested_fix: Some("close the marker"),
    },
];

/// A detector paired with its compiled pattern.
#[derive(Debug)]
pub struct CompiledDetector {
    pub def: &'static Detector,
    pub regex: Regex,
}

impl CompiledDetector {
    /// First match on `line` that satisfies the detector's placement.
    pub fn find<'l>(&self, line: &'l str, lang: Language) -> Option<regex::Match<'l>> {
        let comment = comment_start(line, lang);
        self.regex
            .find_iter(line)
            .find(|m| placement_ok(self.def.placement, line, comment, m))
    }

    /// Capture groups of every placed match, left to right.
    pub fn captures_all<'l>(&self, line: &'l str, lang: Language) -> Vec<regex::Captures<'l>> {
        let comment = comment_start(line, lang);
        self.regex
            .captures_iter(line)
            .filter(|c| {
                c.get(0)
                    .map(|m| placement_ok(self.def.placement, line, comment, &m))
                    .unwrap_or(false)
            })
            .collect()
    }
}

static TABLE: Lazy<Vec<CompiledDetector>> = Lazy::new(|| {
    DETECTORS
        .iter()
        .map(|def| CompiledDetector {
            def,
            regex: Regex::new(def.pattern).expect("static detector pattern"),
        })
        .collect()
});

/// The compiled table, in declaration order.
pub fn table() -> &'static [CompiledDetector] {
    &TABLE
}

pub fn detector(id: DetectorId) -> &'static CompiledDetector {
    // Every DetectorId has exactly one row in DETECTORS.
    &TABLE[DETECTORS.iter().position(|d| d.id == id).unwrap_or(0)]
}

/// First detector matching `line`, in declaration order.
pub fn first_match(line: &str, lang: Language) -> Option<&'static CompiledDetector> {
    table().iter().find(|d| d.find(line, lang).is_some())
}

fn placement_ok(placement: Placement, line: &str, comment: Option<usize>, m: &regex::Match<'_>) -> bool {
    let in_comment = comment.map(|c| m.start() >= c).unwrap_or(false);
    match placement {
        Placement::Anywhere => true,
        Placement::OutsideComment => !in_comment,
        Placement::InsideComment => in_comment,
        Placement::OutsideCommentNotCall => {
            !in_comment && !line[m.end()..].trim_start().starts_with('(')
        }
    }
}

//! services/constitution.rs
//! Constitutional rule engine: every scan, read and write passes this gate.
//!
//! - Rules are tagged records carrying a pure predicate over (Action, Workspace).
//! - `authorize` evaluates *every* rule in insertion order; nothing is cached,
//!   so each call sees the current workspace and version-control state.
//! - The decision keeps the dissenting rule ids and their descriptions; those
//!   become the user-visible denial messages and the audit `denied_by` list.

use serde::{Deserialize, Serialize};
use std::path::{Component, Path, PathBuf};

use crate::config::RESERVED_DIR;
use crate::workspace::Workspace;

pub const R_TRACKED_SOURCE: &str = "R-tracked-source";
pub const R_CREDENTIAL_EXCLUSION: &str = "R-credential-exclusion";
pub const R_SCAN_CONFINEMENT: &str = "R-scan-confinement";
pub const R_ROOT_IMMUTABLE: &str = "R-root-immutable";

/// Path-segment fragments that mark credential material (compared lowercase).
pub const CREDENTIAL_INDICATORS: [&str; 8] = [
    "password",
    "secret",
    "key",
    "credential",
    "token",
    ".env",
    "config",
    "auth",
];

/// The intent being authorized. Each variant carries a canonical target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "target")]
pub enum Action {
    Scan(PathBuf),
    Read(PathBuf),
    Write(PathBuf),
    Delete(PathBuf),
    /// Target is the audit log file.
    AuditAppend(PathBuf),
}

impl Action {
    /// Stable tag written to audit records.
    pub fn tag(&self) -> &'static str {
        match self {
            Action::Scan(_) => "Scan",
            Action::Read(_) => "Read",
            Action::Write(_) => "Write",
            Action::Delete(_) => "Delete",
            Action::AuditAppend(_) => "AuditAppend",
        }
    }

    pub fn target(&self) -> &Path {
        match self {
            Action::Scan(p)
            | Action::Read(p)
            | Action::Write(p)
            | Action::Delete(p)
            | Action::AuditAppend(p) => p,
        }
    }

    /// Same intent, new target.
    pub fn with_target(&self, target: PathBuf) -> Action {
        match self {
            Action::Scan(_) => Action::Scan(target),
            Action::Read(_) => Action::Read(target),
            Action::Write(_) => Action::Write(target),
            Action::Delete(_) => Action::Delete(target),
            Action::AuditAppend(_) => Action::AuditAppend(target),
        }
    }

    /// Whether the action produces writes.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            Action::Write(_) | Action::Delete(_) | Action::AuditAppend(_)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Domain {
    CodeImplementation,
    Documentation,
    DependencyManagement,
    TestAutomation,
    Diagnostics,
}

impl Domain {
    pub fn as_str(&self) -> &'static str {
        match self {
            Domain::CodeImplementation => "code_implementation",
            Domain::Documentation => "documentation",
            Domain::DependencyManagement => "dependency_management",
            Domain::TestAutomation => "test_automation",
            Domain::Diagnostics => "diagnostics",
        }
    }
}

/// A single rule's verdict; `Deny` carries the concrete detail.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Allow,
    Deny(String),
}

pub type RulePredicate = fn(&Action, &Workspace) -> Verdict;

/// A named, domain-tagged predicate. Must be pure: it may consult the action
/// and read-only workspace/version-control state, nothing else.
#[derive(Clone)]
pub struct Rule {
    pub id: &'static str,
    pub domain: Domain,
    pub description: &'static str,
    pub predicate: RulePredicate,
}

impl std::fmt::Debug for Rule {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Rule")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .finish()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RuleEvaluation {
    pub rule_id: String,
    pub domain: Domain,
    pub allowed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Outcome of applying the full rule set to one action.
///
/// Invariant: `allowed == denied_by.is_empty()`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthorizationDecision {
    pub action: Action,
    pub evaluations: Vec<RuleEvaluation>,
    pub allowed: bool,
    pub denied_by: Vec<String>,
    /// `"<rule id>: <description> (<detail>)"` per dissenting rule.
    pub violations: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct Constitution {
    rules: Vec<Rule>,
}

impl Default for Constitution {
    fn default() -> Self {
        Self::standard()
    }
}

impl Constitution {
    /// The mandatory rule set, in evaluation order.
    pub fn standard() -> Self {
        Self {
            rules: vec![
                Rule {
                    id: R_TRACKED_SOURCE,
                    domain: Domain::CodeImplementation,
                    description: "targets must be under version control: tracked files for \
                                  read/write/delete, a tracked workspace for scan/audit",
                    predicate: tracked_source,
                },
                Rule {
                    id: R_CREDENTIAL_EXCLUSION,
                    domain: Domain::CodeImplementation,
                    description: "the agent never writes to credential material",
                    predicate: credential_exclusion,
                },
                Rule {
                    id: R_SCAN_CONFINEMENT,
                    domain: Domain::Diagnostics,
                    description: "scans are confined to the workspace root",
                    predicate: scan_confinement,
                },
                Rule {
                    id: R_ROOT_IMMUTABLE,
                    domain: Domain::CodeImplementation,
                    description: "the workspace root itself is read-only",
                    predicate: root_immutable,
                },
            ],
        }
    }

    pub fn empty() -> Self {
        Self { rules: Vec::new() }
    }

    /// Append a rule; it is evaluated after all existing rules.
    pub fn with_rule(mut self, rule: Rule) -> Self {
        self.rules.push(rule);
        self
    }

    pub fn rules(&self) -> &[Rule] {
        &self.rules
    }

    /// Evaluate every rule against `action`.
    ///
    /// # Returns
    /// * An [`AuthorizationDecision`] whose `allowed` is the conjunction of all verdicts.
    pub fn authorize(&self, action: &Action, workspace: &Workspace) -> AuthorizationDecision {
        let mut evaluations = Vec::with_capacity(self.rules.len());
        let mut denied_by = Vec::new();
        let mut violations = Vec::new();

        for rule in &self.rules {
            let verdict = (rule.predicate)(action, workspace);
            tracing::debug!(rule = rule.id, action = action.tag(), ?verdict, "rule evaluated");
            match verdict {
                Verdict::Allow => evaluations.push(RuleEvaluation {
                    rule_id: rule.id.to_string(),
                    domain: rule.domain,
                    allowed: true,
                    detail: None,
                }),
                Verdict::Deny(detail) => {
                    violations.push(format!("{}: {} ({})", rule.id, rule.description, detail));
                    denied_by.push(rule.id.to_string());
                    evaluations.push(RuleEvaluation {
                        rule_id: rule.id.to_string(),
                        domain: rule.domain,
                        allowed: false,
                        detail: Some(detail),
                    });
                }
            }
        }

        let allowed = denied_by.is_empty();
        if !allowed {
            tracing::warn!(
                action = action.tag(),
                target = %workspace.relative(action.target()),
                denied_by = ?denied_by,
                "action denied"
            );
        }
        AuthorizationDecision {
            action: action.clone(),
            evaluations,
            allowed,
            denied_by,
            violations,
        }
    }
}

// ----------------- Rules -----------------

fn tracked_source(action: &Action, ws: &Workspace) -> Verdict {
    let target = action.target();
    let vcs = ws.vcs();
    let (check, wanted) = match action {
        Action::Scan(_) | Action::AuditAppend(_) => {
            (vcs.in_tracked_workspace(target), "inside a tracked workspace")
        }
        Action::Read(_) | Action::Write(_) | Action::Delete(_) => {
            (vcs.is_tracked(target), "currently tracked")
        }
    };
    match check {
        Ok(true) => Verdict::Allow,
        Ok(false) => Verdict::Deny(format!("{} is not {wanted}", ws.relative(target))),
        // Conservative: an unanswerable query denies.
        Err(e) => Verdict::Deny(format!("{}: {e}", e.kind())),
    }
}

fn credential_exclusion(action: &Action, ws: &Workspace) -> Verdict {
    if !action.is_write() {
        return Verdict::Allow;
    }
    let target = action.target();
    let rel = target.strip_prefix(ws.root()).unwrap_or(target);
    let segments: Vec<String> = rel
        .components()
        .filter_map(|c| match c {
            Component::Normal(s) => Some(s.to_string_lossy().into_owned()),
            _ => None,
        })
        .collect();

    // Exact directory-name match only; `.jarvisconfig` stays subject to the rule.
    if segments.first().map(String::as_str) == Some(RESERVED_DIR) {
        return Verdict::Allow;
    }

    for seg in &segments {
        let lower = seg.to_lowercase();
        if let Some(ind) = CREDENTIAL_INDICATORS.iter().find(|i| lower.contains(*i)) {
            return Verdict::Deny(format!(
                "path segment {seg:?} matches credential indicator {ind:?}"
            ));
        }
    }
    Verdict::Allow
}

fn scan_confinement(action: &Action, ws: &Workspace) -> Verdict {
    match action {
        Action::Scan(p) if !ws.contains(p) => {
            Verdict::Deny(format!("{} lies outside the workspace", p.display()))
        }
        _ => Verdict::Allow,
    }
}

fn root_immutable(action: &Action, ws: &Workspace) -> Verdict {
    match action {
        Action::Write(p) | Action::Delete(p) if p.as_path() == ws.root() => {
            Verdict::Deny("target is the workspace root".to_string())
        }
        _ => Verdict::Allow,
    }
}

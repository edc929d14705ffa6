//! Findings and the decision they aggregate into.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Byte range in the original SQL text that triggered a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    /// Smallest span covering both `self` and `other`.
    pub fn cover(self, other: Span) -> Span {
        Span {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }

    pub fn len(&self) -> usize {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Category of a finding.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingKind {
    Injection,
    DangerousOperation,
    PermissionDenied,
    SyntaxError,
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FindingKind::Injection => "injection",
            FindingKind::DangerousOperation => "dangerous_operation",
            FindingKind::PermissionDenied => "permission_denied",
            FindingKind::SyntaxError => "syntax_error",
        };
        f.write_str(name)
    }
}

/// How much a finding weighs in the final decision.
///
/// Ordered so that `Block > Warn`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Warn,
    Block,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Severity::Warn => f.write_str("warn"),
            Severity::Block => f.write_str("block"),
        }
    }
}

/// Error returned when parsing a severity fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParseSeverityError(String);

impl fmt::Display for ParseSeverityError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid severity: '{}'", self.0)
    }
}

impl std::error::Error for ParseSeverityError {}

impl std::str::FromStr for Severity {
    type Err = ParseSeverityError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "warn" | "warning" => Ok(Severity::Warn),
            "block" | "deny" => Ok(Severity::Block),
            _ => Err(ParseSeverityError(s.to_string())),
        }
    }
}

/// One detected issue.
///
/// `reason` is built only from keywords, identifiers and rule names. Literal
/// contents never end up here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// Identifier of the rule or check that produced the finding.
    pub rule: String,
    pub reason: String,
    pub span: Span,
}

impl Finding {
    pub fn new(
        kind: FindingKind,
        severity: Severity,
        rule: impl Into<String>,
        reason: impl Into<String>,
        span: Span,
    ) -> Self {
        Self {
            kind,
            severity,
            rule: rule.into(),
            reason: reason.into(),
            span,
        }
    }

    pub fn injection(
        severity: Severity,
        rule: impl Into<String>,
        reason: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::new(FindingKind::Injection, severity, rule, reason, span)
    }

    pub fn dangerous(
        severity: Severity,
        rule: impl Into<String>,
        reason: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::new(FindingKind::DangerousOperation, severity, rule, reason, span)
    }

    pub fn permission_denied(rule: impl Into<String>, reason: impl Into<String>, span: Span) -> Self {
        Self::new(FindingKind::PermissionDenied, Severity::Block, rule, reason, span)
    }

    pub fn syntax(
        severity: Severity,
        rule: impl Into<String>,
        reason: impl Into<String>,
        span: Span,
    ) -> Self {
        Self::new(FindingKind::SyntaxError, severity, rule, reason, span)
    }

    pub fn is_blocking(&self) -> bool {
        self.severity == Severity::Block
    }
}

/// Overall decision for one validation call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Allow,
    Deny,
}

impl Decision {
    /// `Deny` if any finding blocks, `Allow` otherwise.
    pub fn from_findings(findings: &[Finding]) -> Self {
        if findings.iter().any(Finding::is_blocking) {
            Decision::Deny
        } else {
            Decision::Allow
        }
    }

    pub fn is_allow(&self) -> bool {
        matches!(self, Decision::Allow)
    }
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Decision::Allow => f.write_str("allow"),
            Decision::Deny => f.write_str("deny"),
        }
    }
}

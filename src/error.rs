//! Error types for sqlguard.
//!
//! A deny is a normal verdict, never an error. Errors here cover the
//! validator's own infrastructure: configuration, policy loading and the
//! audit sink.

use thiserror::Error;

/// Crate-level error type.
#[derive(Debug, Error)]
pub enum GuardError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Permission policy could not be loaded or compiled
    #[error("Policy error: {0}")]
    Policy(String),

    /// A configured detection rule is invalid
    #[error("Invalid rule '{rule}': {message}")]
    InvalidRule { rule: String, message: String },

    /// Invalid input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Audit sink failure surfaced by the validator
    #[error(transparent)]
    AuditUnavailable(#[from] AuditUnavailable),
}

impl GuardError {
    /// Create a configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create a policy error.
    pub fn policy(msg: impl Into<String>) -> Self {
        Self::Policy(msg.into())
    }

    /// Create an invalid rule error.
    pub fn invalid_rule(rule: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidRule {
            rule: rule.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid input error.
    pub fn invalid_input(msg: impl Into<String>) -> Self {
        Self::InvalidInput(msg.into())
    }

    /// Get a user-friendly suggestion for how to fix this error.
    pub fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::Config(_) => Some("Check your SQLGUARD_* environment variables"),
            Self::Policy(_) => {
                Some("Check the policy file: version, role names, operations and table patterns")
            }
            Self::InvalidRule { .. } => Some("Fix the rule in SQLGUARD_CUSTOM_RULES"),
            Self::Io(_) => Some("Check that the file exists and is readable/writable"),
            Self::AuditUnavailable(_) => {
                Some("Restore the audit sink; queries must not run without an audit record")
            }
            _ => None,
        }
    }
}

/// Failure reported by an audit sink.
#[derive(Debug, Error)]
pub enum AuditError {
    /// Writing the entry failed
    #[error("audit write failed: {0}")]
    Io(#[from] std::io::Error),

    /// The entry could not be serialized
    #[error("audit entry serialization failed: {0}")]
    Serialize(#[from] serde_json::Error),

    /// The sink refused the entry
    #[error("audit sink rejected entry: {0}")]
    Rejected(String),
}

impl AuditError {
    /// Create a rejection error.
    pub fn rejected(msg: impl Into<String>) -> Self {
        Self::Rejected(msg.into())
    }
}

/// The audit record for a validation call could not be delivered.
///
/// Distinct from a deny: it describes the validator's own failure, not the
/// input. Callers decide whether to fail closed.
#[derive(Debug, Error)]
#[error("Audit unavailable for correlation id {correlation_id}: {source}")]
pub struct AuditUnavailable {
    pub correlation_id: String,
    #[source]
    pub source: AuditError,
}

impl AuditUnavailable {
    pub fn new(correlation_id: impl Into<String>, source: AuditError) -> Self {
        Self {
            correlation_id: correlation_id.into(),
            source,
        }
    }
}

//! Configuration management for sqlguard.
//!
//! Configuration is loaded from environment variables following the 12-factor app pattern.

use crate::constants::{
    DEFAULT_CHAR_CHAIN_MIN, DEFAULT_HEX_MIN_LENGTH, DEFAULT_MAX_QUERY_LENGTH,
    DEFAULT_SAFE_PROCEDURES, ENV_AUDIT_PATH, ENV_BACKSLASH_ESCAPES, ENV_CHAR_CHAIN_MIN, ENV_CUSTOM_RULES, ENV_DANGEROUS_FUNCTIONS,
    ENV_DISABLED_RULES, ENV_HEX_MIN_LENGTH, ENV_INJECTION_DETECTION, ENV_MAX_QUERY_LENGTH,
    ENV_POLICY_PATH, ENV_SAFE_PROCEDURES,
};
use crate::error::GuardError;
use crate::security::{Severity, TokenizerOptions};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::PathBuf;

/// Validator configuration loaded from environment variables.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Detection configuration
    pub detection: DetectionConfig,

    /// Audit configuration
    pub audit: AuditConfig,

    /// Permission policy file
    pub policy_path: Option<PathBuf>,
}

/// Detection configuration shared by the analysis stages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionConfig {
    /// Maximum query length (bytes)
    pub max_query_length: usize,

    /// Enable SQL injection detection
    pub injection_detection: bool,

    /// Treat `\` as an escape inside quoted literals
    pub backslash_escapes: bool,

    /// Rule ids to skip
    pub disabled_rules: Vec<String>,

    /// Extra dangerous call/word/phrase entries
    pub dangerous_functions: Vec<String>,

    /// Procedures whose EXEC is not reported
    pub safe_procedures: Vec<String>,

    /// Hex digits before a hex literal is reported
    pub hex_min_length: usize,

    /// CHAR() chain length reported
    pub char_chain_min: usize,

    /// Regex rules from configuration
    pub custom_rules: Vec<CustomRuleConfig>,
}

/// A configured regex rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomRuleConfig {
    pub id: String,
    /// Matched against the lowercased, literal-redacted statement text.
    pub pattern: String,
    pub severity: Severity,
}

/// Audit configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuditConfig {
    /// JSON-lines audit file; `None` logs audit entries through tracing
    pub path: Option<PathBuf>,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `SQLGUARD_POLICY_PATH`: JSON permission policy file
    /// - `SQLGUARD_AUDIT_PATH`: JSON-lines audit file (default: tracing sink)
    /// - `SQLGUARD_MAX_QUERY_LENGTH`: Maximum query length in bytes (default: 100000)
    /// - `SQLGUARD_INJECTION_DETECTION`: Enable injection rules (default: true)
    /// - `SQLGUARD_BACKSLASH_ESCAPES`: Honour `\` escapes in literals (default: false)
    /// - `SQLGUARD_DISABLED_RULES`: Comma-separated rule ids to skip
    /// - `SQLGUARD_DANGEROUS_FUNCTIONS`: Comma-separated extra dangerous entries
    /// - `SQLGUARD_SAFE_PROCEDURES`: Comma-separated metadata procedures
    /// - `SQLGUARD_HEX_MIN_LENGTH`: Hex digits before reporting (default: 10)
    /// - `SQLGUARD_CHAR_CHAIN_MIN`: CHAR() chain length (default: 4)
    /// - `SQLGUARD_CUSTOM_RULES`: JSON array of `{id, pattern, severity}`
    pub fn from_env() -> Result<Self, GuardError> {
        let policy_path = std::env::var(ENV_POLICY_PATH).ok().map(PathBuf::from);
        let audit_path = std::env::var(ENV_AUDIT_PATH).ok().map(PathBuf::from);

        let max_query_length = std::env::var(ENV_MAX_QUERY_LENGTH)
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_MAX_QUERY_LENGTH);

        let injection_detection = std::env::var(ENV_INJECTION_DETECTION)
            .map(|v| v.to_lowercase() != "false" && v != "0")
            .unwrap_or(true);

        let backslash_escapes = std::env::var(ENV_BACKSLASH_ESCAPES)
            .map(|v| v.to_lowercase() == "true" || v == "1")
            .unwrap_or(false);

        let disabled_rules = std::env::var(ENV_DISABLED_RULES)
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let dangerous_functions = std::env::var(ENV_DANGEROUS_FUNCTIONS)
            .map(|v| split_list(&v))
            .unwrap_or_default();

        let safe_procedures = std::env::var(ENV_SAFE_PROCEDURES)
            .map(|v| split_list(&v))
            .unwrap_or_else(|_| default_safe_procedures());

        let hex_min_length = std::env::var(ENV_HEX_MIN_LENGTH)
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_HEX_MIN_LENGTH);

        let char_chain_min = std::env::var(ENV_CHAR_CHAIN_MIN)
            .ok()
            .and_then(|p| p.parse().ok())
            .unwrap_or(DEFAULT_CHAR_CHAIN_MIN);

        let custom_rules: Vec<CustomRuleConfig> = match std::env::var(ENV_CUSTOM_RULES) {
            Ok(raw) if !raw.trim().is_empty() => serde_json::from_str(&raw).map_err(|e| {
                GuardError::config(format!("{} is not a valid rule list: {}", ENV_CUSTOM_RULES, e))
            })?,
            _ => Vec::new(),
        };
        validate_custom_rules(&custom_rules)?;

        Ok(Config {
            detection: DetectionConfig {
                max_query_length,
                injection_detection,
                backslash_escapes,
                disabled_rules,
                dangerous_functions,
                safe_procedures,
                hex_min_length,
                char_chain_min,
                custom_rules,
            },
            audit: AuditConfig { path: audit_path },
            policy_path,
        })
    }
}

impl DetectionConfig {
    /// Tokenizer switches derived from this configuration.
    pub fn tokenizer_options(&self) -> TokenizerOptions {
        TokenizerOptions {
            backslash_escapes: self.backslash_escapes,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            max_query_length: DEFAULT_MAX_QUERY_LENGTH,
            injection_detection: true,
            backslash_escapes: false,
            disabled_rules: Vec::new(),
            dangerous_functions: Vec::new(),
            safe_procedures: default_safe_procedures(),
            hex_min_length: DEFAULT_HEX_MIN_LENGTH,
            char_chain_min: DEFAULT_CHAR_CHAIN_MIN,
            custom_rules: Vec::new(),
        }
    }
}

/// Rule ids must be non-empty and unique, and patterns non-empty.
fn validate_custom_rules(rules: &[CustomRuleConfig]) -> Result<(), GuardError> {
    let mut seen = HashSet::new();
    for rule in rules {
        if rule.id.trim().is_empty() {
            return Err(GuardError::invalid_rule(&rule.id, "rule id is empty"));
        }
        if rule.pattern.is_empty() {
            return Err(GuardError::invalid_rule(&rule.id, "pattern is empty"));
        }
        if !seen.insert(rule.id.as_str()) {
            return Err(GuardError::invalid_rule(&rule.id, "duplicate rule id"));
        }
    }
    Ok(())
}

fn default_safe_procedures() -> Vec<String> {
    DEFAULT_SAFE_PROCEDURES.iter().map(|p| p.to_string()).collect()
}

fn split_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

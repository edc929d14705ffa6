//! Centralized constants for sqlguard.
//!
//! This module contains all magic numbers and default values used throughout
//! the codebase, making them easy to find, understand, and modify.

// =============================================================================
// Record Format Constants
// =============================================================================

/// Version of the serialized verdict and audit entry layout.
pub const RECORD_SCHEMA_VERSION: u32 = 1;

/// Policy document version this build understands.
pub const POLICY_VERSION: u32 = 1;

// =============================================================================
// Input Limits
// =============================================================================

/// Default maximum query length in bytes.
pub const DEFAULT_MAX_QUERY_LENGTH: usize = 100_000;

// =============================================================================
// Detection Defaults
// =============================================================================

/// Hex digits in a `0x..` literal before it is reported.
pub const DEFAULT_HEX_MIN_LENGTH: usize = 10;

/// Chained CHAR() calls before they are reported.
pub const DEFAULT_CHAR_CHAIN_MIN: usize = 4;

/// Procedures that only read metadata.
pub const DEFAULT_SAFE_PROCEDURES: &[&str] = &[
    "sp_help",
    "sp_columns",
    "sp_tables",
    "sp_stored_procedures",
    "sp_fkeys",
    "sp_pkeys",
];

// =============================================================================
// Audit Constants
// =============================================================================

/// Tracing target for audit events.
pub const AUDIT_LOG_TARGET: &str = "sqlguard::audit";

// =============================================================================
// Logging Constants
// =============================================================================

/// Default log filter when `RUST_LOG` is unset.
pub const DEFAULT_LOG_FILTER: &str = "warn,sqlguard=info";

// =============================================================================
// Environment Variable Names
// =============================================================================

pub const ENV_POLICY_PATH: &str = "SQLGUARD_POLICY_PATH";
pub const ENV_AUDIT_PATH: &str = "SQLGUARD_AUDIT_PATH";
pub const ENV_MAX_QUERY_LENGTH: &str = "SQLGUARD_MAX_QUERY_LENGTH";
pub const ENV_INJECTION_DETECTION: &str = "SQLGUARD_INJECTION_DETECTION";
pub const ENV_BACKSLASH_ESCAPES: &str = "SQLGUARD_BACKSLASH_ESCAPES";
pub const ENV_DISABLED_RULES: &str = "SQLGUARD_DISABLED_RULES";
pub const ENV_DANGEROUS_FUNCTIONS: &str = "SQLGUARD_DANGEROUS_FUNCTIONS";
pub const ENV_SAFE_PROCEDURES: &str = "SQLGUARD_SAFE_PROCEDURES";
pub const ENV_HEX_MIN_LENGTH: &str = "SQLGUARD_HEX_MIN_LENGTH";
pub const ENV_CHAR_CHAIN_MIN: &str = "SQLGUARD_CHAR_CHAIN_MIN";
pub const ENV_CUSTOM_RULES: &str = "SQLGUARD_CUSTOM_RULES";

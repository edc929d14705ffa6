//! # sqlguard
//!
//! An inline guardrail for untrusted SQL. Every query is checked before it
//! reaches a database and gets an allow/deny verdict with findings.
//!
//! This crate provides:
//! - **Normalization**: a single-pass tokenizer that redacts literals and comments
//! - **Classification**: statement kinds, multi-statement detection, table references
//! - **Injection detection**: configurable rules over the normalized token stream
//! - **Dangerous operations**: schema changes, unbounded writes, unsafe procedures
//! - **Permissions**: role/tenant grants over tables and operations
//! - **Audit**: one record per call, written before the verdict is returned
//!
//! ## Architecture
//!
//! [`SqlValidator`] owns the compiled detectors and runs them in order over
//! one immutable [`security::NormalizedStatement`]. Any blocking finding
//! denies the query. The binary speaks JSON lines on stdin/stdout.

pub mod audit;
pub mod config;
pub mod constants;
pub mod error;
pub mod security;
pub mod telemetry;
pub mod transport;
pub mod validator;

pub use audit::{AuditEntry, AuditSink};
pub use config::Config;
pub use error::{AuditError, AuditUnavailable, GuardError};
pub use security::{Decision, Finding, FindingKind, Severity};
pub use validator::{CallerContext, RawQuery, SqlValidator, ValidationVerdict};

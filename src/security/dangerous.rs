//! Destructive and irreversible operation detection.
//!
//! Purely structural: works on the classifier output and never looks at
//! literal contents. A finding here does not by itself decide anything; it
//! contributes its severity to the aggregate decision.

use super::classifier::{Classification, Clause, StatementInfo, StatementKind};
use super::finding::{Finding, Severity};
use crate::config::DetectionConfig;
use std::collections::HashSet;

/// Server-level commands that have no statement kind of their own.
const SERVER_COMMANDS: &[&str] = &["backup", "restore", "shutdown"];

pub mod rule_ids {
    pub const SCHEMA_CHANGE: &str = "schema_change";
    pub const PRIVILEGE_CHANGE: &str = "privilege_change";
    pub const CREATE_OBJECT: &str = "create_object";
    pub const UNBOUNDED_WRITE: &str = "unbounded_write";
    pub const MULTI_TABLE_WRITE: &str = "multi_table_write";
    pub const UNSAFE_PROCEDURE: &str = "unsafe_procedure";
    pub const DYNAMIC_EXECUTE: &str = "dynamic_execute";
    pub const SERVER_COMMAND: &str = "server_command";
}

/// Dangerous operation detector.
#[derive(Debug, Clone)]
pub struct DangerousOperationDetector {
    /// Procedures whose execution only reads metadata.
    safe_procedures: HashSet<String>,
}

impl Default for DangerousOperationDetector {
    fn default() -> Self {
        Self::from_config(&DetectionConfig::default())
    }
}

impl DangerousOperationDetector {
    pub fn from_config(config: &DetectionConfig) -> Self {
        Self {
            safe_procedures: config
                .safe_procedures
                .iter()
                .map(|p| p.trim().to_lowercase())
                .filter(|p| !p.is_empty())
                .collect(),
        }
    }

    /// Check every statement of the classified input.
    pub fn check(&self, classification: &Classification) -> Vec<Finding> {
        let mut findings = Vec::new();
        for statement in &classification.statements {
            self.check_statement(statement, &mut findings);
        }
        findings
    }

    fn check_statement(&self, statement: &StatementInfo, out: &mut Vec<Finding>) {
        let span = statement.span;
        match statement.kind {
            StatementKind::Drop | StatementKind::Truncate | StatementKind::Alter => {
                out.push(Finding::dangerous(
                    Severity::Block,
                    rule_ids::SCHEMA_CHANGE,
                    format!(
                        "{} statement{}",
                        statement.kind.as_str().to_uppercase(),
                        target_suffix(statement)
                    ),
                    span,
                ));
            }
            StatementKind::Grant | StatementKind::Revoke => {
                out.push(Finding::dangerous(
                    Severity::Block,
                    rule_ids::PRIVILEGE_CHANGE,
                    format!(
                        "{} changes database privileges",
                        statement.kind.as_str().to_uppercase()
                    ),
                    span,
                ));
            }
            StatementKind::Create => {
                out.push(Finding::dangerous(
                    Severity::Warn,
                    rule_ids::CREATE_OBJECT,
                    format!("CREATE statement{}", target_suffix(statement)),
                    span,
                ));
            }
            StatementKind::Update | StatementKind::Delete => {
                let verb = statement.kind.as_str().to_uppercase();
                if !statement.has_where {
                    out.push(Finding::dangerous(
                        Severity::Block,
                        rule_ids::UNBOUNDED_WRITE,
                        format!("{} without WHERE affects every row", verb),
                        span,
                    ));
                }
                let tables = statement.top_level_tables().len();
                if statement.implicit_join || tables > 1 {
                    out.push(Finding::dangerous(
                        Severity::Warn,
                        rule_ids::MULTI_TABLE_WRITE,
                        format!("{} touches {} tables", verb, tables.max(2)),
                        span,
                    ));
                }
            }
            StatementKind::Execute => self.check_execute(statement, out),
            StatementKind::Unknown => {
                if SERVER_COMMANDS.contains(&statement.leading_keyword.as_str()) {
                    out.push(Finding::dangerous(
                        Severity::Block,
                        rule_ids::SERVER_COMMAND,
                        format!(
                            "Server-level command {}",
                            statement.leading_keyword.to_uppercase()
                        ),
                        span,
                    ));
                }
            }
            StatementKind::Select | StatementKind::Insert | StatementKind::Merge => {}
        }
    }

    fn check_execute(&self, statement: &StatementInfo, out: &mut Vec<Finding>) {
        let procedure = statement
            .table_refs
            .iter()
            .find(|r| r.clause == Clause::Procedure);

        match procedure {
            // `EXEC ('...')` or `EXEC @sql`: the executed text is not visible.
            None => out.push(Finding::dangerous(
                Severity::Block,
                rule_ids::DYNAMIC_EXECUTE,
                "EXEC of dynamic SQL cannot be inspected",
                statement.span,
            )),
            Some(r) if r.name.object().starts_with('@') || !r.resolved => {
                out.push(Finding::dangerous(
                    Severity::Block,
                    rule_ids::DYNAMIC_EXECUTE,
                    "EXEC of dynamic SQL cannot be inspected",
                    r.span,
                ))
            }
            Some(r) if self.safe_procedures.contains(r.name.object()) => {}
            Some(r) => out.push(Finding::dangerous(
                Severity::Warn,
                rule_ids::UNSAFE_PROCEDURE,
                format!("EXEC of procedure '{}' outside the safe list", r.name),
                r.span,
            )),
        }
    }
}

fn target_suffix(statement: &StatementInfo) -> String {
    statement
        .table_refs
        .iter()
        .find(|r| r.clause == Clause::Target && r.resolved)
        .map(|r| format!(" on '{}'", r.name))
        .unwrap_or_default()
}

//! Validator facade.
//!
//! Runs the stages in dependency order over one immutable
//! [`NormalizedStatement`]: tokenizer findings, classification, injection
//! rules, dangerous operations, then permissions. Findings keep detection
//! order. Every call makes exactly one audit attempt before returning, and a
//! verdict is only handed out once the sink has accepted its entry.

use crate::audit::{AuditEntry, AuditSink};
use crate::config::DetectionConfig;
use crate::constants::RECORD_SCHEMA_VERSION;
use crate::error::{AuditError, AuditUnavailable};
use crate::security::{
    classify, DangerousOperationDetector, Decision, Finding, InjectionDetector, LiteralSpan,
    NormalizedStatement, PermissionValidator, PolicySource, Severity, Span, StatementKind,
};
use crate::telemetry::{correlation_id_or_new, ValidatorMetrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// Identity of the caller a query is validated for.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CallerContext {
    pub user_id: String,
    pub role: String,
    #[serde(default)]
    pub tenant: String,
}

impl CallerContext {
    pub fn new(user_id: impl Into<String>, role: impl Into<String>, tenant: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            role: role.into(),
            tenant: tenant.into(),
        }
    }
}

/// Input to one validation call. Never modified by the validator.
#[derive(Debug, Clone)]
pub struct RawQuery {
    sql: String,
    caller: CallerContext,
    correlation_id: Option<String>,
    query_id: Option<String>,
    received_at: DateTime<Utc>,
}

impl RawQuery {
    pub fn new(sql: impl Into<String>, caller: CallerContext) -> Self {
        Self {
            sql: sql.into(),
            caller,
            correlation_id: None,
            query_id: None,
            received_at: Utc::now(),
        }
    }

    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    pub fn with_query_id(mut self, query_id: impl Into<String>) -> Self {
        self.query_id = Some(query_id.into());
        self
    }

    pub fn sql(&self) -> &str {
        &self.sql
    }

    pub fn caller(&self) -> &CallerContext {
        &self.caller
    }

    pub fn correlation_id(&self) -> Option<&str> {
        self.correlation_id.as_deref()
    }

    pub fn query_id(&self) -> Option<&str> {
        self.query_id.as_deref()
    }

    pub fn received_at(&self) -> DateTime<Utc> {
        self.received_at
    }
}

/// Frozen result of one validation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationVerdict {
    schema_version: u32,
    correlation_id: String,
    decision: Decision,
    statement_kind: StatementKind,
    is_multi_statement: bool,
    findings: Vec<Finding>,
    content_hash: String,
    /// False only for fail-closed verdicts whose audit entry was not delivered.
    audited: bool,
}

impl ValidationVerdict {
    pub fn schema_version(&self) -> u32 {
        self.schema_version
    }

    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    pub fn decision(&self) -> Decision {
        self.decision
    }

    pub fn is_allowed(&self) -> bool {
        self.decision.is_allow()
    }

    pub fn statement_kind(&self) -> StatementKind {
        self.statement_kind
    }

    pub fn is_multi_statement(&self) -> bool {
        self.is_multi_statement
    }

    /// Findings in detection order.
    pub fn findings(&self) -> &[Finding] {
        &self.findings
    }

    pub fn content_hash(&self) -> &str {
        &self.content_hash
    }

    pub fn audited(&self) -> bool {
        self.audited
    }
}

/// Output of the analysis stages, before auditing.
struct Analysis {
    kind: StatementKind,
    is_multi_statement: bool,
    findings: Vec<Finding>,
    content_hash: String,
    literals: Vec<LiteralSpan>,
}

/// The SQL validator.
pub struct SqlValidator {
    config: DetectionConfig,
    injection: InjectionDetector,
    dangerous: DangerousOperationDetector,
    permissions: PermissionValidator,
    audit: Arc<dyn AuditSink>,
    metrics: Arc<ValidatorMetrics>,
}

impl std::fmt::Debug for SqlValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqlValidator")
            .field("config", &self.config)
            .field("injection_rules", &self.injection.rules().len())
            .finish_non_exhaustive()
    }
}

impl SqlValidator {
    /// Build a validator; rules are compiled once here.
    pub fn new(
        config: &DetectionConfig,
        policy: Arc<dyn PolicySource>,
        audit: Arc<dyn AuditSink>,
    ) -> Self {
        let injection = InjectionDetector::from_config(config);
        info!(
            injection_enabled = injection.is_enabled(),
            rules = injection.rules().len(),
            max_query_length = config.max_query_length,
            "SQL validator initialized"
        );
        Self {
            config: config.clone(),
            injection,
            dangerous: DangerousOperationDetector::from_config(config),
            permissions: PermissionValidator::new(policy),
            audit,
            metrics: Arc::new(ValidatorMetrics::new()),
        }
    }

    pub fn metrics(&self) -> Arc<ValidatorMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Validate `raw_sql` for `caller`.
    ///
    /// A blank `correlation_id` is replaced by a generated one. Returns
    /// [`AuditUnavailable`] when the audit sink rejects the entry; the verdict
    /// is withheld in that case.
    pub fn validate(
        &self,
        raw_sql: &str,
        caller: &CallerContext,
        correlation_id: &str,
    ) -> Result<ValidationVerdict, AuditUnavailable> {
        let query = RawQuery::new(raw_sql, caller.clone()).with_correlation_id(correlation_id);
        self.validate_query(&query)
    }

    /// Validate a [`RawQuery`].
    pub fn validate_query(&self, query: &RawQuery) -> Result<ValidationVerdict, AuditUnavailable> {
        let (verdict, audit) = self.run(query, false);
        match audit {
            Ok(()) => Ok(verdict),
            Err(source) => Err(AuditUnavailable::new(verdict.correlation_id, source)),
        }
    }

    /// Validate, treating an audit failure as a deny.
    ///
    /// The returned verdict has `audited() == false` when the entry could
    /// not be delivered.
    pub fn validate_fail_closed(&self, query: &RawQuery) -> ValidationVerdict {
        self.run(query, true).0
    }

    /// Analyze, audit and decide. Metrics count only verdicts that are
    /// handed out, with the decision the caller actually receives.
    fn run(
        &self,
        query: &RawQuery,
        fail_closed: bool,
    ) -> (ValidationVerdict, Result<(), AuditError>) {
        let started = Instant::now();
        let correlation_id = correlation_id_or_new(query.correlation_id());

        let analysis = self.analyze(query.sql(), query.caller());
        let mut decision = Decision::from_findings(&analysis.findings);

        let entry = AuditEntry {
            schema_version: RECORD_SCHEMA_VERSION,
            correlation_id: correlation_id.clone(),
            query_id: query.query_id().map(str::to_string),
            received_at: query.received_at(),
            timestamp: Utc::now(),
            caller: query.caller().clone(),
            content_hash: analysis.content_hash.clone(),
            decision,
            statement_kind: analysis.kind,
            is_multi_statement: analysis.is_multi_statement,
            findings: analysis.findings.clone(),
            literals: analysis.literals,
            query_length: query.sql().len(),
        };
        let blocks = entry.block_count();
        let warns = entry.findings.len() - blocks;

        let audit = self.audit.record(&entry);
        match &audit {
            Ok(()) if decision.is_allow() => debug!(
                correlation_id = %correlation_id,
                statement_kind = %analysis.kind,
                warnings = warns,
                "Query allowed"
            ),
            Ok(()) => info!(
                correlation_id = %correlation_id,
                statement_kind = %analysis.kind,
                blocking = blocks,
                content_hash = %analysis.content_hash,
                "Query denied"
            ),
            Err(e) => {
                self.metrics.record_audit_failure();
                warn!(
                    correlation_id = %correlation_id,
                    error = %e,
                    fail_closed,
                    "Audit sink unavailable"
                );
                if fail_closed {
                    decision = Decision::Deny;
                }
            }
        }

        if audit.is_ok() || fail_closed {
            self.metrics.record_validation(
                decision.is_allow(),
                blocks as u64,
                warns as u64,
                started.elapsed(),
            );
        }

        let verdict = ValidationVerdict {
            schema_version: RECORD_SCHEMA_VERSION,
            correlation_id,
            decision,
            statement_kind: analysis.kind,
            is_multi_statement: analysis.is_multi_statement,
            findings: analysis.findings,
            content_hash: analysis.content_hash,
            audited: audit.is_ok(),
        };
        (verdict, audit)
    }

    fn analyze(&self, sql: &str, caller: &CallerContext) -> Analysis {
        if sql.len() > self.config.max_query_length {
            self.metrics.record_oversized();
            return Analysis {
                kind: StatementKind::Unknown,
                is_multi_statement: false,
                findings: vec![Finding::syntax(
                    Severity::Block,
                    "query_too_long",
                    format!(
                        "Query of {} bytes exceeds maximum length of {} bytes",
                        sql.len(),
                        self.config.max_query_length
                    ),
                    Span::new(0, sql.len()),
                )],
                content_hash: format!("sha256:{:x}", Sha256::digest(sql.as_bytes())),
                literals: Vec::new(),
            };
        }

        let stmt = NormalizedStatement::parse_with(sql, self.config.tokenizer_options());
        let mut findings = stmt.findings().to_vec();

        let classification = classify(&stmt);
        findings.extend(classification.findings.iter().cloned());

        let injection = self.injection.check(&stmt);
        let dangerous = self.dangerous.check(&classification);
        let permissions = self.permissions.check(&classification, caller);
        debug!(
            statements = classification.statements.len(),
            injection = injection.len(),
            dangerous = dangerous.len(),
            permission = permissions.len(),
            "Analysis complete"
        );
        findings.extend(injection);
        findings.extend(dangerous);
        findings.extend(permissions);

        Analysis {
            kind: classification.kind,
            is_multi_statement: classification.is_multi_statement,
            findings,
            content_hash: stmt.content_hash(),
            literals: stmt.literals().to_vec(),
        }
    }
}

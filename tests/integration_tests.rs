//! End-to-end tests for the validator pipeline.
//!
//! Everything runs in-process against a JSON policy and in-memory or
//! file-backed audit sinks; no database is involved.
//!
//! ```bash
//! cargo test --test integration_tests
//! ```

use serial_test::serial;
use sqlguard::audit::{AuditEntry, AuditSink, JsonLinesAuditSink, MemoryAuditSink};
use sqlguard::config::{CustomRuleConfig, DetectionConfig};
use sqlguard::security::{
    dangerous_rules, injection_rules, permission_rules, PermissionPolicy, PolicySource,
    PolicyStore,
};
use sqlguard::{
    AuditError, CallerContext, Decision, FindingKind, RawQuery, Severity, SqlValidator,
    ValidationVerdict,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

const POLICY: &str = r#"{
    "version": 1,
    "default_schema": "dbo",
    "roles": {
        "analyst": [
            {"operations": ["select"], "tables": ["orders", "customers"]}
        ],
        "writer": [
            {"operations": ["select", "insert", "update"], "tables": ["orders"]}
        ],
        "tenant_reader": [
            {"operations": ["select"], "tables": ["{tenant}_data.*"]}
        ]
    }
}"#;

fn policy() -> Arc<dyn PolicySource> {
    Arc::new(Arc::new(PermissionPolicy::from_json(POLICY).unwrap()))
}

fn validator_with_sink(sink: Arc<dyn AuditSink>) -> SqlValidator {
    SqlValidator::new(&DetectionConfig::default(), policy(), sink)
}

fn analyst() -> CallerContext {
    CallerContext::new("user-7", "analyst", "acme")
}

fn kinds(verdict: &ValidationVerdict) -> Vec<FindingKind> {
    verdict.findings().iter().map(|f| f.kind).collect()
}

fn has_rule(verdict: &ValidationVerdict, rule: &str) -> bool {
    verdict.findings().iter().any(|f| f.rule == rule)
}

/// Sink that refuses every entry.
struct FailingAuditSink {
    attempts: AtomicUsize,
}

impl FailingAuditSink {
    fn new() -> Self {
        Self {
            attempts: AtomicUsize::new(0),
        }
    }
}

impl AuditSink for FailingAuditSink {
    fn record(&self, _entry: &AuditEntry) -> Result<(), AuditError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        Err(AuditError::rejected("sink offline"))
    }
}

// =============================================================================
// Corpus
// =============================================================================

#[test]
fn test_tautology_is_denied() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let verdict = v
        .validate("SELECT * FROM users WHERE id = 1 OR 1=1", &analyst(), "t1")
        .unwrap();

    assert_eq!(verdict.decision(), Decision::Deny);
    assert!(verdict
        .findings()
        .iter()
        .any(|f| f.kind == FindingKind::Injection && f.rule == injection_rules::TAUTOLOGY));
}

#[test]
fn test_stacked_drop_is_denied_with_both_findings() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let verdict = v
        .validate("SELECT name FROM t; DROP TABLE t;", &analyst(), "t2")
        .unwrap();

    assert_eq!(verdict.decision(), Decision::Deny);
    assert!(verdict.is_multi_statement());
    assert!(has_rule(&verdict, injection_rules::STACKED_STATEMENT));
    assert!(has_rule(&verdict, dangerous_rules::SCHEMA_CHANGE));

    let found = kinds(&verdict);
    assert!(found.contains(&FindingKind::Injection));
    assert!(found.contains(&FindingKind::DangerousOperation));
}

#[test]
fn test_update_without_where_against_select_grant() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let verdict = v
        .validate("UPDATE orders SET status='x'", &analyst(), "t3")
        .unwrap();

    assert_eq!(verdict.decision(), Decision::Deny);
    assert!(verdict.findings().iter().any(|f| f.kind == FindingKind::PermissionDenied
        && f.rule == permission_rules::OPERATION_NOT_GRANTED));
    assert!(verdict.findings().iter().any(|f| f.kind == FindingKind::DangerousOperation
        && f.rule == dangerous_rules::UNBOUNDED_WRITE));
}

#[test]
fn test_safe_select_is_allowed() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let verdict = v
        .validate("SELECT id, total FROM orders WHERE id = 42", &analyst(), "t4")
        .unwrap();

    assert_eq!(verdict.decision(), Decision::Allow);
    assert!(verdict.findings().iter().all(|f| f.severity == Severity::Warn));
}

#[test]
fn test_bounded_update_with_write_grant_is_allowed() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let writer = CallerContext::new("svc", "writer", "acme");
    let verdict = v
        .validate("UPDATE orders SET status = 'shipped' WHERE id = 7", &writer, "t5")
        .unwrap();

    assert_eq!(verdict.decision(), Decision::Allow);
}

#[test]
fn test_unknown_role_is_denied() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let caller = CallerContext::new("u", "intern", "acme");
    let verdict = v.validate("SELECT id FROM orders", &caller, "t6").unwrap();

    assert_eq!(verdict.decision(), Decision::Deny);
    assert!(has_rule(&verdict, permission_rules::UNKNOWN_ROLE));
}

#[test]
fn test_tenant_scoped_grant() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let acme = CallerContext::new("u", "tenant_reader", "acme");
    let globex = CallerContext::new("u", "tenant_reader", "globex");
    let sql = "SELECT * FROM acme_data.invoices WHERE id = 1";

    assert!(v.validate(sql, &acme, "a").unwrap().is_allowed());
    assert!(!v.validate(sql, &globex, "b").unwrap().is_allowed());
}

#[test]
fn test_any_block_finding_denies() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let queries = [
        "SELECT id FROM orders WHERE id = 1 OR 'a'='a'",
        "DELETE FROM orders",
        "DROP TABLE customers",
        "GRANT SELECT ON orders TO public",
        "EXEC xp_cmdshell 'dir'",
        "SELECT id FROM orders UNION SELECT * FROM customers",
    ];
    for sql in queries {
        let verdict = v.validate(sql, &analyst(), "m").unwrap();
        assert!(
            verdict.findings().iter().any(|f| f.is_blocking()),
            "expected a blocking finding for {sql}"
        );
        assert_eq!(verdict.decision(), Decision::Deny, "{sql}");
    }
}

#[test]
fn test_parenthesized_sources_need_grants() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let queries = [
        "SELECT * FROM (secrets)",
        "SELECT * FROM (orders JOIN secrets ON orders.id = secrets.order_id) WHERE orders.id = 1",
        "SELECT * FROM orders o JOIN (secrets s JOIN orders x ON s.id = x.id) ON o.id = s.id WHERE o.id = 1",
        "SELECT * FROM (SELECT id FROM orders) o, secrets WHERE o.id = 1",
    ];
    for sql in queries {
        let verdict = v.validate(sql, &analyst(), "p").unwrap();
        assert_eq!(verdict.decision(), Decision::Deny, "{sql}");
        assert!(
            has_rule(&verdict, permission_rules::TABLE_NOT_GRANTED),
            "expected a missing grant for {sql}"
        );
    }

    let verdict = v
        .validate(
            "SELECT * FROM (orders JOIN customers ON orders.cid = customers.id) WHERE orders.id = 1",
            &analyst(),
            "p2",
        )
        .unwrap();
    assert_eq!(verdict.decision(), Decision::Allow);
}

#[test]
fn test_tautology_variants_are_denied() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let queries = [
        "SELECT id FROM orders WHERE id = 5 OR -1=-1",
        "SELECT id FROM orders WHERE id = 5 || 1=1",
        "SELECT id FROM orders WHERE id = 5 OR 2-1=1",
    ];
    for sql in queries {
        let verdict = v.validate(sql, &analyst(), "v").unwrap();
        assert_eq!(verdict.decision(), Decision::Deny, "{sql}");
        assert!(has_rule(&verdict, injection_rules::TAUTOLOGY), "{sql}");
    }
}

#[test]
fn test_prefixed_column_names_are_not_procedures() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let verdict = v
        .validate("SELECT xp_total FROM orders WHERE id = 1", &analyst(), "x")
        .unwrap();
    assert_eq!(verdict.decision(), Decision::Allow);
    assert!(!has_rule(&verdict, injection_rules::DANGEROUS_FUNCTION));

    let verdict = v
        .validate("EXEC master.dbo.xp_cmdshell 'dir'", &analyst(), "y")
        .unwrap();
    assert!(has_rule(&verdict, injection_rules::DANGEROUS_FUNCTION));
}

// =============================================================================
// Audit
// =============================================================================

#[test]
fn test_every_call_writes_one_audit_entry() {
    let sink = Arc::new(MemoryAuditSink::new());
    let v = validator_with_sink(sink.clone());

    let allowed = v
        .validate("SELECT id FROM orders WHERE id = 1", &analyst(), "a1")
        .unwrap();
    let denied = v.validate("DROP TABLE orders", &analyst(), "a2").unwrap();

    let entries = sink.entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].correlation_id, allowed.correlation_id());
    assert_eq!(entries[0].decision, Decision::Allow);
    assert_eq!(entries[1].correlation_id, denied.correlation_id());
    assert_eq!(entries[1].decision, Decision::Deny);
    assert_eq!(entries[1].findings, denied.findings());
    assert_eq!(entries[1].content_hash, denied.content_hash());
    assert_eq!(entries[1].caller, analyst());
}

#[test]
fn test_audit_entry_never_contains_literals() {
    let sink = Arc::new(MemoryAuditSink::new());
    let v = validator_with_sink(sink.clone());

    let sql = "SELECT id FROM customers WHERE api_key = 'sk-live-HUNTER2' -- token s3cr3t-note\n";
    let verdict = v.validate(sql, &analyst(), "r1").unwrap();

    let entries = sink.entries();
    assert_eq!(entries.len(), 1);
    assert!(!entries[0].literals.is_empty());

    let record = serde_json::to_string(&entries[0]).unwrap();
    assert!(!record.contains("HUNTER2"));
    assert!(!record.contains("sk-live"));
    assert!(!record.contains("s3cr3t"));

    let response = serde_json::to_string(&verdict).unwrap();
    assert!(!response.contains("HUNTER2"));
}

#[test]
fn test_json_lines_audit_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("audit.jsonl");
    let sink = Arc::new(JsonLinesAuditSink::open(&path).unwrap());
    let v = validator_with_sink(sink);

    v.validate("SELECT id FROM orders WHERE id = 1", &analyst(), "f1")
        .unwrap();
    v.validate("TRUNCATE TABLE orders", &analyst(), "f2").unwrap();

    let contents = std::fs::read_to_string(&path).unwrap();
    let entries: Vec<AuditEntry> = contents
        .lines()
        .map(|line| serde_json::from_str(line).unwrap())
        .collect();
    assert_eq!(entries.len(), 2);
    assert_eq!(entries[0].correlation_id, "f1");
    assert_eq!(entries[1].decision, Decision::Deny);
    assert!(entries.iter().all(|e| e.is_current_schema()));
}

#[test]
fn test_audit_failure_withholds_verdict() {
    let sink = Arc::new(FailingAuditSink::new());
    let v = validator_with_sink(sink.clone());

    let err = v
        .validate("SELECT id FROM orders WHERE id = 1", &analyst(), "x1")
        .unwrap_err();
    assert_eq!(err.correlation_id, "x1");
    assert!(matches!(err.source, AuditError::Rejected(_)));
    assert_eq!(sink.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(v.metrics().snapshot().audit_failures, 1);
}

#[test]
fn test_fail_closed_denies_when_audit_fails() {
    let v = validator_with_sink(Arc::new(FailingAuditSink::new()));
    let query = RawQuery::new("SELECT id FROM orders WHERE id = 1", analyst())
        .with_correlation_id("x2");

    let verdict = v.validate_fail_closed(&query);
    assert_eq!(verdict.decision(), Decision::Deny);
    assert!(!verdict.audited());
    assert_eq!(verdict.correlation_id(), "x2");
}

#[test]
fn test_fail_closed_passes_through_when_audited() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let query = RawQuery::new("SELECT id FROM orders WHERE id = 1", analyst());

    let verdict = v.validate_fail_closed(&query);
    assert_eq!(verdict.decision(), Decision::Allow);
    assert!(verdict.audited());
}

#[cfg(target_os = "linux")]
#[test]
fn test_file_sink_write_failure_withholds_verdict() {
    let sink = Arc::new(JsonLinesAuditSink::open("/dev/full").unwrap());
    let v = validator_with_sink(sink);

    let err = v
        .validate("SELECT id FROM orders WHERE id = 1", &analyst(), "full")
        .unwrap_err();
    assert_eq!(err.correlation_id, "full");
    assert!(matches!(err.source, AuditError::Io(_)));
    assert_eq!(v.metrics().snapshot().validations_total, 0);
}

#[test]
fn test_fail_closed_counts_returned_decision() {
    let v = validator_with_sink(Arc::new(FailingAuditSink::new()));
    for id in ["m1", "m2"] {
        let query = RawQuery::new("SELECT id FROM orders WHERE id = 1", analyst())
            .with_correlation_id(id);
        assert_eq!(v.validate_fail_closed(&query).decision(), Decision::Deny);
    }

    let snapshot = v.metrics().snapshot();
    assert_eq!(snapshot.allowed, 0);
    assert_eq!(snapshot.denied, 2);
    assert_eq!(snapshot.audit_failures, 2);
}

#[test]
fn test_audit_entry_carries_receive_time() {
    let sink = Arc::new(MemoryAuditSink::new());
    let v = validator_with_sink(sink.clone());
    let query = RawQuery::new("SELECT id FROM orders WHERE id = 1", analyst());
    v.validate_query(&query).unwrap();

    let entry = &sink.entries()[0];
    assert_eq!(entry.received_at, query.received_at());
    assert!(entry.received_at <= entry.timestamp);
}

// =============================================================================
// Determinism and configuration
// =============================================================================

#[test]
fn test_revalidation_is_idempotent() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let sql = "SELECT name FROM orders WHERE id = 3; DELETE FROM orders";

    let first = v.validate(sql, &analyst(), "").unwrap();
    let second = v.validate(sql, &analyst(), "").unwrap();

    assert_ne!(first.correlation_id(), second.correlation_id());
    assert_eq!(first.decision(), second.decision());
    assert_eq!(kinds(&first), kinds(&second));
    assert_eq!(first.findings(), second.findings());
    assert_eq!(first.content_hash(), second.content_hash());
}

#[test]
fn test_content_hash_ignores_literal_values() {
    let v = validator_with_sink(Arc::new(MemoryAuditSink::new()));
    let a = v
        .validate("SELECT id FROM orders WHERE name = 'alice'", &analyst(), "h1")
        .unwrap();
    let b = v
        .validate("select id   from orders where name = 'bob'", &analyst(), "h2")
        .unwrap();
    assert_eq!(a.content_hash(), b.content_hash());
    assert!(a.content_hash().starts_with("sha256:"));
}

#[test]
fn test_broken_custom_rule_degrades_to_warning() {
    let config = DetectionConfig {
        custom_rules: vec![CustomRuleConfig {
            id: "broken_rule".to_string(),
            pattern: "(unclosed".to_string(),
            severity: Severity::Block,
        }],
        ..Default::default()
    };
    let v = SqlValidator::new(&config, policy(), Arc::new(MemoryAuditSink::new()));

    let verdict = v
        .validate("SELECT id FROM orders WHERE id = 1", &analyst(), "c1")
        .unwrap();
    assert_eq!(verdict.decision(), Decision::Allow);
    let finding = verdict
        .findings()
        .iter()
        .find(|f| f.rule == "broken_rule")
        .unwrap();
    assert_eq!(finding.severity, Severity::Warn);
}

#[test]
fn test_disabled_rule_is_skipped() {
    let config = DetectionConfig {
        disabled_rules: vec![injection_rules::TAUTOLOGY.to_string()],
        ..Default::default()
    };
    let v = SqlValidator::new(&config, policy(), Arc::new(MemoryAuditSink::new()));

    let verdict = v
        .validate("SELECT id FROM orders WHERE id = 1 OR 1=1", &analyst(), "d1")
        .unwrap();
    assert!(!has_rule(&verdict, injection_rules::TAUTOLOGY));
}

#[test]
#[serial]
fn test_policy_reload_takes_effect() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("policy.json");
    std::fs::write(&path, POLICY).unwrap();

    let store = Arc::new(PolicyStore::load(&path).unwrap());
    let v = SqlValidator::new(
        &DetectionConfig::default(),
        store.clone(),
        Arc::new(MemoryAuditSink::new()),
    );
    let sql = "SELECT id FROM invoices WHERE id = 1";
    assert!(!v.validate(sql, &analyst(), "p1").unwrap().is_allowed());

    std::fs::write(
        &path,
        r#"{"version": 1, "roles": {"analyst": [{"operations": ["select"], "tables": ["invoices"]}]}}"#,
    )
    .unwrap();
    store.reload(&path).unwrap();
    assert!(v.validate(sql, &analyst(), "p2").unwrap().is_allowed());
}

#[test]
fn test_concurrent_validations_audit_every_call() {
    let sink = Arc::new(MemoryAuditSink::new());
    let v = Arc::new(validator_with_sink(sink.clone()));

    let handles: Vec<_> = (0..8)
        .map(|t| {
            let v = Arc::clone(&v);
            std::thread::spawn(move || {
                for i in 0..25 {
                    let sql = if i % 2 == 0 {
                        "SELECT id FROM orders WHERE id = 1"
                    } else {
                        "DROP TABLE orders"
                    };
                    let verdict = v.validate(sql, &analyst(), &format!("{t}-{i}")).unwrap();
                    assert_eq!(verdict.is_allowed(), i % 2 == 0);
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }

    assert_eq!(sink.len(), 200);
    let snapshot = v.metrics().snapshot();
    assert_eq!(snapshot.validations_total, 200);
    assert_eq!(snapshot.allowed, 100);
    assert_eq!(snapshot.denied, 100);
}

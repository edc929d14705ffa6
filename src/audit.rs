//! Audit records and the sinks that receive them.
//!
//! The validator builds one [`AuditEntry`] per call and hands it to an
//! [`AuditSink`]. Sinks must accept concurrent calls and write each entry as
//! one unit; the validator adds no locking of its own. Entries carry literal
//! lengths and digests only, never literal text.

use crate::constants::{AUDIT_LOG_TARGET, RECORD_SCHEMA_VERSION};
use crate::error::AuditError;
use crate::security::{Decision, Finding, LiteralSpan, StatementKind};
use crate::validator::CallerContext;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::Arc;
use tracing::info;

/// Immutable record of one validation call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub schema_version: u32,
    pub correlation_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
    /// When the query reached the validator.
    pub received_at: DateTime<Utc>,
    /// When the verdict was decided.
    pub timestamp: DateTime<Utc>,
    pub caller: CallerContext,
    pub content_hash: String,
    pub decision: Decision,
    pub statement_kind: StatementKind,
    pub is_multi_statement: bool,
    pub findings: Vec<Finding>,
    /// Redacted literal and comment spans.
    pub literals: Vec<LiteralSpan>,
    /// Length of the raw SQL in bytes.
    pub query_length: usize,
}

impl AuditEntry {
    /// Number of blocking findings.
    pub fn block_count(&self) -> usize {
        self.findings.iter().filter(|f| f.is_blocking()).count()
    }

    /// Whether this build can read the record layout.
    pub fn is_current_schema(&self) -> bool {
        self.schema_version == RECORD_SCHEMA_VERSION
    }
}

/// Destination for audit entries.
///
/// `record` must either deliver the entry or return an error; dropping an
/// entry silently is not allowed.
pub trait AuditSink: Send + Sync {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError>;
}

impl<S: AuditSink + ?Sized> AuditSink for Arc<S> {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        (**self).record(entry)
    }
}

// =============================================================================
// Tracing sink
// =============================================================================

/// Emits each entry as one structured event on the `sqlguard::audit` target.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingAuditSink;

impl AuditSink for TracingAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let record = serde_json::to_string(entry)?;
        info!(
            target: AUDIT_LOG_TARGET,
            correlation_id = %entry.correlation_id,
            decision = %entry.decision,
            statement_kind = %entry.statement_kind,
            findings = entry.findings.len(),
            content_hash = %entry.content_hash,
            record = %record,
            "Validation audited"
        );
        Ok(())
    }
}

// =============================================================================
// JSON-lines file sink
// =============================================================================

/// Appends one JSON document per line to a file.
#[derive(Debug)]
pub struct JsonLinesAuditSink {
    file: Mutex<File>,
}

impl JsonLinesAuditSink {
    /// Open (or create) `path` in append mode.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, AuditError> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path.as_ref())?;
        Ok(Self {
            file: Mutex::new(file),
        })
    }
}

impl AuditSink for JsonLinesAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(entry)?;
        line.push(b'\n');

        // Serialize outside the lock; one write per entry under it.
        let mut file = self.file.lock();
        file.write_all(&line)?;
        file.flush()?;
        Ok(())
    }
}

// =============================================================================
// In-memory sink
// =============================================================================

/// Keeps entries in memory, for tests and embedding.
#[derive(Debug, Default)]
pub struct MemoryAuditSink {
    entries: Mutex<Vec<AuditEntry>>,
}

impl MemoryAuditSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Copy of all entries recorded so far.
    pub fn entries(&self) -> Vec<AuditEntry> {
        self.entries.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl AuditSink for MemoryAuditSink {
    fn record(&self, entry: &AuditEntry) -> Result<(), AuditError> {
        self.entries.lock().push(entry.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::{FindingKind, Severity, Span};

    fn entry(correlation_id: &str) -> AuditEntry {
        AuditEntry {
            schema_version: RECORD_SCHEMA_VERSION,
            correlation_id: correlation_id.to_string(),
            query_id: None,
            received_at: Utc::now(),
            timestamp: Utc::now(),
            caller: CallerContext::new("u1", "analyst", "acme"),
            content_hash: "sha256:00".to_string(),
            decision: Decision::Deny,
            statement_kind: StatementKind::Drop,
            is_multi_statement: false,
            findings: vec![Finding::dangerous(
                Severity::Block,
                "schema_change",
                "DROP statement",
                Span::new(0, 4),
            )],
            literals: Vec::new(),
            query_length: 12,
        }
    }

    #[test]
    fn test_memory_sink_records() {
        let sink = MemoryAuditSink::new();
        assert!(sink.is_empty());
        sink.record(&entry("a")).unwrap();
        sink.record(&entry("b")).unwrap();
        assert_eq!(sink.len(), 2);
        assert_eq!(sink.entries()[1].correlation_id, "b");
        assert_eq!(sink.entries()[0].block_count(), 1);
    }

    #[test]
    fn test_entry_serialization_is_stable() {
        let json = serde_json::to_value(entry("c")).unwrap();
        assert_eq!(json["schema_version"], 1);
        assert_eq!(json["decision"], "deny");
        assert_eq!(json["statement_kind"], "drop");
        assert_eq!(json["findings"][0]["kind"], "dangerous_operation");
        assert!(json.get("query_id").is_none());

        let back: AuditEntry = serde_json::from_value(json).unwrap();
        assert!(back.is_current_schema());
        assert_eq!(back.findings[0].kind, FindingKind::DangerousOperation);
    }

    #[test]
    fn test_json_lines_sink_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");

        let sink = JsonLinesAuditSink::open(&path).unwrap();
        sink.record(&entry("one")).unwrap();
        sink.record(&entry("two")).unwrap();
        drop(sink);

        let sink = JsonLinesAuditSink::open(&path).unwrap();
        sink.record(&entry("three")).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        let ids: Vec<String> = contents
            .lines()
            .map(|l| serde_json::from_str::<AuditEntry>(l).unwrap().correlation_id)
            .collect();
        assert_eq!(ids, vec!["one", "two", "three"]);
    }

    #[test]
    fn test_json_lines_sink_concurrent_writers() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("audit.jsonl");
        let sink = Arc::new(JsonLinesAuditSink::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|t| {
                let sink = Arc::clone(&sink);
                std::thread::spawn(move || {
                    for i in 0..25 {
                        sink.record(&entry(&format!("{}-{}", t, i))).unwrap();
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let contents = std::fs::read_to_string(&path).unwrap();
        assert_eq!(contents.lines().count(), 200);
        for line in contents.lines() {
            serde_json::from_str::<AuditEntry>(line).unwrap();
        }
    }

    #[cfg(target_os = "linux")]
    #[test]
    fn test_json_lines_sink_reports_write_failure() {
        let sink = JsonLinesAuditSink::open("/dev/full").unwrap();
        assert!(matches!(sink.record(&entry("full")), Err(AuditError::Io(_))));
    }

    #[test]
    fn test_entry_keeps_receive_time() {
        let mut e = entry("r");
        e.received_at = e.timestamp - chrono::Duration::milliseconds(5);
        let json = serde_json::to_value(&e).unwrap();
        assert!(json.get("received_at").is_some());
        let back: AuditEntry = serde_json::from_value(json).unwrap();
        assert_eq!(back.received_at, e.received_at);
        assert!(back.received_at < back.timestamp);
    }

    #[test]
    fn test_tracing_sink_accepts_entries() {
        assert!(TracingAuditSink.record(&entry("t")).is_ok());
    }
}

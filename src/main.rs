//! sqlguard entry point.
//!
//! Reads JSON-lines validation requests on stdin and writes one verdict per
//! line on stdout. Each audit entry is written before its verdict, so a
//! failed write withholds the verdict.

use anyhow::{Context, Result};
use sqlguard::audit::{AuditSink, JsonLinesAuditSink, TracingAuditSink};
use sqlguard::constants::{DEFAULT_LOG_FILTER, ENV_POLICY_PATH};
use sqlguard::security::{PolicySource, PolicyStore};
use sqlguard::{transport, Config, SqlValidator};
use std::sync::Arc;
use tokio::io::BufReader;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize logging to stderr (stdout is reserved for verdicts)
    init_logging();

    let version = env!("CARGO_PKG_VERSION");
    info!(version, "sqlguard starting");

    let config = Config::from_env()?;

    let policy_path = config
        .policy_path
        .clone()
        .with_context(|| format!("{} must point to a permission policy file", ENV_POLICY_PATH))?;
    let policy = PolicyStore::load(&policy_path)
        .with_context(|| format!("loading policy from {}", policy_path.display()))?;
    let policy: Arc<dyn PolicySource> = Arc::new(policy);

    let audit: Arc<dyn AuditSink> = match &config.audit.path {
        Some(path) => {
            info!(path = %path.display(), "Writing audit entries to file");
            Arc::new(
                JsonLinesAuditSink::open(path)
                    .with_context(|| format!("opening audit file {}", path.display()))?,
            )
        }
        None => Arc::new(TracingAuditSink),
    };
    let validator = SqlValidator::new(&config.detection, policy, audit);

    let stdin = BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();
    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for shutdown signal");
            std::future::pending::<()>().await;
        }
    };

    let served = transport::serve(&validator, stdin, stdout, shutdown).await;

    let snapshot = validator.metrics().snapshot();
    info!(
        validations = snapshot.validations_total,
        denied = snapshot.denied,
        audit_failures = snapshot.audit_failures,
        "sqlguard stopped"
    );

    served?;
    Ok(())
}

/// Initialize tracing subscriber with stderr output.
///
/// Logs MUST go to stderr because stdout carries the verdict stream.
fn init_logging() {
    let filter = std::env::var("RUST_LOG")
        .map(EnvFilter::new)
        .unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();
}

//! JSON-lines transport for the validator binary.
//!
//! One request object per input line, one response object per output line,
//! in request order. Logs never go to the output stream.

use crate::error::GuardError;
use crate::validator::{CallerContext, RawQuery, SqlValidator, ValidationVerdict};
use serde::{Deserialize, Serialize};
use std::future::Future;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tracing::{debug, info, warn};

/// One validation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationRequest {
    pub sql: String,
    pub role: String,
    #[serde(default)]
    pub user_id: String,
    #[serde(default)]
    pub tenant: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_id: Option<String>,
}

impl ValidationRequest {
    pub fn caller(&self) -> CallerContext {
        CallerContext::new(&self.user_id, &self.role, &self.tenant)
    }

    pub fn into_query(self) -> RawQuery {
        let caller = self.caller();
        let mut query = RawQuery::new(self.sql, caller);
        if let Some(id) = self.correlation_id {
            query = query.with_correlation_id(id);
        }
        if let Some(id) = self.query_id {
            query = query.with_query_id(id);
        }
        query
    }
}

/// Error categories reported on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    /// The audit record could not be written; no verdict is given
    AuditUnavailable,
    /// The request line could not be parsed
    InvalidRequest,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: ErrorCode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    pub message: String,
}

/// One response line: either a verdict or an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ValidationResponse {
    Verdict(ValidationVerdict),
    Error(ErrorResponse),
}

impl ValidationResponse {
    pub fn verdict(&self) -> Option<&ValidationVerdict> {
        match self {
            ValidationResponse::Verdict(v) => Some(v),
            ValidationResponse::Error(_) => None,
        }
    }

    fn error(error: ErrorCode, correlation_id: Option<String>, message: impl Into<String>) -> Self {
        ValidationResponse::Error(ErrorResponse {
            error,
            correlation_id,
            message: message.into(),
        })
    }
}

/// Parse one request line.
pub fn parse_request(line: &str) -> Result<ValidationRequest, GuardError> {
    let request: ValidationRequest = serde_json::from_str(line)
        .map_err(|e| GuardError::invalid_input(format!("malformed request: {}", e)))?;
    if request.role.trim().is_empty() {
        return Err(GuardError::invalid_input("request has an empty role"));
    }
    Ok(request)
}

/// Encode one response as a single line, without the trailing newline.
pub fn encode_response(response: &ValidationResponse) -> Result<String, GuardError> {
    Ok(serde_json::to_string(response)?)
}

/// Validate one request line and build its response.
pub fn handle_line(validator: &SqlValidator, line: &str) -> ValidationResponse {
    let request = match parse_request(line) {
        Ok(request) => request,
        Err(e) => {
            debug!(error = %e, "Rejected request line");
            return ValidationResponse::error(ErrorCode::InvalidRequest, None, e.to_string());
        }
    };

    match validator.validate_query(&request.into_query()) {
        Ok(verdict) => ValidationResponse::Verdict(verdict),
        Err(e) => ValidationResponse::error(
            ErrorCode::AuditUnavailable,
            Some(e.correlation_id.clone()),
            e.to_string(),
        ),
    }
}

/// Serve requests from `reader` until EOF or `shutdown` resolves.
///
/// Blank lines are skipped. Returns the number of responses written.
pub async fn serve<R, W, F>(
    validator: &SqlValidator,
    reader: R,
    mut writer: W,
    shutdown: F,
) -> Result<u64, GuardError>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Future<Output = ()>,
{
    let mut lines = reader.lines();
    let mut answered = 0u64;
    tokio::pin!(shutdown);

    loop {
        let line = tokio::select! {
            line = lines.next_line() => line?,
            _ = &mut shutdown => {
                info!("Shutdown requested, stopping transport");
                break;
            }
        };

        let Some(line) = line else {
            debug!("Input closed");
            break;
        };
        if line.trim().is_empty() {
            continue;
        }

        let response = handle_line(validator, &line);
        if let ValidationResponse::Error(e) = &response {
            if e.error == ErrorCode::AuditUnavailable {
                warn!(correlation_id = ?e.correlation_id, "Verdict withheld, audit unavailable");
            }
        }

        let mut encoded = encode_response(&response)?;
        encoded.push('\n');
        writer.write_all(encoded.as_bytes()).await?;
        writer.flush().await?;
        answered += 1;
    }

    Ok(answered)
}

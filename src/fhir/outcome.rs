use http::StatusCode;
use serde_json::Value;

use crate::errors::ClientError;

/// `RequestError` for a non-2xx FHIR answer.
///
/// The message is `[severity/code] diagnostics` of the first issue when the
/// body is an OperationOutcome, otherwise the raw body text.
pub fn request_error(status: StatusCode, body: &str) -> ClientError {
    let outcome = serde_json::from_str::<Value>(body).ok().filter(is_operation_outcome);

    let message = match outcome.as_ref().and_then(first_issue_summary) {
        Some(summary) => summary,
        None if body.trim().is_empty() => status.canonical_reason().unwrap_or("no response body").to_string(),
        None => body.trim().to_string(),
    };

    ClientError::Request {
        status,
        message,
        outcome,
    }
}

fn is_operation_outcome(value: &Value) -> bool {
    value.get("resourceType").and_then(Value::as_str) == Some("OperationOutcome")
        || value.get("issue").map(Value::is_array).unwrap_or(false)
}

fn first_issue_summary(outcome: &Value) -> Option<String> {
    let issue = outcome.get("issue")?.as_array()?.first()?;
    let severity = issue.get("severity").and_then(Value::as_str).unwrap_or("error");
    let code = issue.get("code").and_then(Value::as_str).unwrap_or("unknown");
    let diagnostics = issue
        .get("diagnostics")
        .and_then(Value::as_str)
        .or_else(|| issue.pointer("/details/text").and_then(Value::as_str))
        .unwrap_or("");
    Some(format!("[{}/{}] {}", severity, code, diagnostics).trim_end().to_string())
}

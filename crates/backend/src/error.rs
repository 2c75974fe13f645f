//! Errors from the planning REST collaborator.

use serde_json::Value;

/// Errors from the REST layer.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The server returned a non-2xx status code.
    #[error("Planning API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    /// A 2xx response carried a body of the wrong shape.
    #[error("Unexpected response body: {0}")]
    Decode(#[from] serde_json::Error),
}

impl BackendError {
    /// HTTP status code, when the server answered at all.
    pub fn status(&self) -> Option<u16> {
        match self {
            BackendError::Api { status, .. } => Some(*status),
            BackendError::Request(e) => e.status().map(|s| s.as_u16()),
            BackendError::Decode(_) => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status() == Some(404)
    }

    /// The server refused a lock because another session holds it.
    pub fn is_lock_conflict(&self) -> bool {
        matches!(self.status(), Some(409 | 423))
    }

    /// Best-effort human-readable message from the server error body.
    pub fn user_message(&self) -> Option<String> {
        match self {
            BackendError::Api { body, .. } => extract_error_message(body),
            _ => None,
        }
    }
}

/// Pull a human-readable message out of a server error body.
///
/// Looks at `_message`, `_issues` (preferring the validator exception),
/// `_error.message`, `error` and `message`, in that order.
pub fn extract_error_message(body: &str) -> Option<String> {
    let value: Value = serde_json::from_str(body).ok()?;
    let obj = value.as_object()?;

    if let Some(msg) = non_empty(obj.get("_message")) {
        return Some(msg);
    }
    if let Some(issues) = obj.get("_issues").and_then(Value::as_object) {
        if let Some(msg) = non_empty(issues.get("validator exception")) {
            return Some(msg);
        }
        if let Some(msg) = issues.values().find_map(|v| non_empty(Some(v))) {
            return Some(msg);
        }
    }
    if let Some(msg) = non_empty(obj.get("_error").and_then(|e| e.get("message"))) {
        return Some(msg);
    }
    non_empty(obj.get("error")).or_else(|| non_empty(obj.get("message")))
}

fn non_empty(value: Option<&Value>) -> Option<String> {
    value
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefers_top_level_message() {
        let body = r#"{"_message":"The item was already locked","_issues":{"x":"y"}}"#;
        assert_eq!(
            extract_error_message(body).as_deref(),
            Some("The item was already locked")
        );
    }

    #[test]
    fn falls_back_to_validator_exception() {
        let body = r#"{"_issues":{"validator exception":"403: Event is spiked"}}"#;
        assert_eq!(
            extract_error_message(body).as_deref(),
            Some("403: Event is spiked")
        );
    }

    #[test]
    fn reads_nested_error_message() {
        let body = r#"{"_status":"ERR","_error":{"code":412,"message":"etag mismatch"}}"#;
        assert_eq!(extract_error_message(body).as_deref(), Some("etag mismatch"));
    }

    #[test]
    fn non_json_or_empty_bodies_yield_none() {
        assert!(extract_error_message("<html>502</html>").is_none());
        assert!(extract_error_message(r#"{"_message":"  "}"#).is_none());
    }

    #[test]
    fn status_classification() {
        let conflict = BackendError::Api { status: 409, body: String::new() };
        assert!(conflict.is_lock_conflict());
        assert!(!conflict.is_not_found());

        let missing = BackendError::Api { status: 404, body: String::new() };
        assert!(missing.is_not_found());
    }
}

// Copyright 2026, Jeroen van Erp <jeroen@geeko.me>
// SPDX-License-Identifier: Apache-2.0

//! Crate-wide error type and Kubernetes API error classification.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum McmError {
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    #[error("Watch failed: {0}")]
    WatchError(#[from] kube::runtime::watcher::Error),

    #[error("Object not found: {0}")]
    NotFound(String),

    #[error("Conflict updating {0}")]
    Conflict(String),

    #[error("Join request {0} was denied")]
    Denied(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("PKI error: {0}")]
    PkiError(String),

    #[error("Failed to parse kubeconfig: {0}")]
    KubeconfigError(String),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Driver error: {0}")]
    DriverError(String),
}

pub type Result<T> = std::result::Result<T, McmError>;

impl McmError {
    /// True when the underlying object no longer exists.
    pub fn is_not_found(&self) -> bool {
        match self {
            McmError::NotFound(_) => true,
            McmError::KubeError(e) => is_not_found(e),
            _ => false,
        }
    }

    pub fn is_conflict(&self) -> bool {
        match self {
            McmError::Conflict(_) => true,
            McmError::KubeError(e) => is_conflict(e),
            _ => false,
        }
    }

    /// Errors worth retrying during bootstrap: transient server failures and
    /// objects that are not there yet.
    pub fn is_retryable(&self) -> bool {
        match self {
            McmError::NotFound(_) | McmError::Timeout(_) | McmError::WatchError(_) => true,
            McmError::KubeError(e) => is_retryable(e),
            _ => false,
        }
    }
}

fn api_code(err: &kube::Error) -> Option<u16> {
    match err {
        kube::Error::Api(resp) => Some(resp.code),
        _ => None,
    }
}

fn api_reason(err: &kube::Error) -> Option<&str> {
    match err {
        kube::Error::Api(resp) => Some(resp.reason.as_str()),
        _ => None,
    }
}

pub fn is_not_found(err: &kube::Error) -> bool {
    api_code(err) == Some(404)
}

pub fn is_conflict(err: &kube::Error) -> bool {
    api_code(err) == Some(409) && api_reason(err) != Some("AlreadyExists")
}

pub fn is_already_exists(err: &kube::Error) -> bool {
    api_code(err) == Some(409) && api_reason(err) == Some("AlreadyExists")
}

/// NotFound, ServiceUnavailable, Timeout, ServerTimeout and InternalError.
pub fn is_retryable(err: &kube::Error) -> bool {
    match err {
        kube::Error::Api(resp) => {
            matches!(resp.code, 404 | 500 | 503 | 504)
                || matches!(
                    resp.reason.as_str(),
                    "Timeout" | "ServerTimeout" | "ServiceUnavailable" | "InternalError"
                )
        }
        kube::Error::HyperError(_) | kube::Error::Service(_) => true,
        _ => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> kube::Error {
        kube::Error::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: reason.to_string(),
            code,
        })
    }

    #[test]
    fn test_not_found_classification() {
        assert!(is_not_found(&api_error(404, "NotFound")));
        assert!(McmError::from(api_error(404, "NotFound")).is_not_found());
        assert!(McmError::NotFound("x".into()).is_not_found());
        assert!(!is_not_found(&api_error(409, "Conflict")));
    }

    #[test]
    fn test_conflict_is_not_already_exists() {
        assert!(is_conflict(&api_error(409, "Conflict")));
        assert!(!is_conflict(&api_error(409, "AlreadyExists")));
        assert!(is_already_exists(&api_error(409, "AlreadyExists")));
    }

    #[test]
    fn test_retryable_errors() {
        assert!(is_retryable(&api_error(503, "ServiceUnavailable")));
        assert!(is_retryable(&api_error(504, "Timeout")));
        assert!(is_retryable(&api_error(500, "InternalError")));
        assert!(is_retryable(&api_error(404, "NotFound")));
        assert!(!is_retryable(&api_error(403, "Forbidden")));
        assert!(!McmError::Denied("req".into()).is_retryable());
    }
}

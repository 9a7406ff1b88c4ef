use std::fmt;
use std::future::Future;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Classification of a service failure, checked by value to drive fallbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Bad input, rejected before any network call.
    Validation,
    /// The named resource does not exist in the searched scope.
    NotFound,
    /// HTTP 401.
    Unauthorized,
    /// HTTP 403.
    Forbidden,
    /// An interactive flow or request ran past its deadline.
    Timeout,
    /// The caller's cancellation token fired.
    Cancelled,
    /// Throttling, server-side failures and transport errors.
    Transient,
    Other,
}

impl ErrorKind {
    /// Classify an HTTP status code.
    pub fn from_status(status: u16) -> Self {
        match status {
            400 | 405 | 409 | 412 | 422 => ErrorKind::Validation,
            401 => ErrorKind::Unauthorized,
            403 => ErrorKind::Forbidden,
            404 => ErrorKind::NotFound,
            408 | 429 => ErrorKind::Transient,
            500..=599 => ErrorKind::Transient,
            _ => ErrorKind::Other,
        }
    }

    /// True for the two classes that trigger the shared-key fallback.
    pub fn is_auth_failure(self) -> bool {
        matches!(self, ErrorKind::Unauthorized | ErrorKind::Forbidden)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ErrorKind::Validation => "validation",
            ErrorKind::NotFound => "not found",
            ErrorKind::Unauthorized => "unauthorized",
            ErrorKind::Forbidden => "forbidden",
            ErrorKind::Timeout => "timeout",
            ErrorKind::Cancelled => "cancelled",
            ErrorKind::Transient => "transient",
            ErrorKind::Other => "other",
        };
        f.write_str(name)
    }
}

/// Error returned by every service, credential and cache-miss path.
///
/// The message accumulates context (`"list Kusto tables in 'db': ..."`) as the
/// error travels up; the [`ErrorKind`] never changes once classified.
#[derive(Debug, Error)]
#[error("{message}")]
pub struct ServiceError {
    kind: ErrorKind,
    status: Option<u16>,
    message: String,
    #[source]
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

pub type ServiceResult<T> = Result<T, ServiceError>;

impl ServiceError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            status: None,
            message: message.into(),
            source: None,
        }
    }

    pub fn validation(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Validation, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    pub fn cancelled() -> Self {
        Self::new(ErrorKind::Cancelled, "operation was cancelled")
    }

    /// Build an error from an HTTP status and (possibly empty) response body.
    pub fn from_status(status: u16, body: &str) -> Self {
        let detail = extract_error_message(body).unwrap_or_else(|| body.trim().to_string());
        let message = if detail.is_empty() {
            format!("request failed with HTTP {status}")
        } else {
            format!("request failed with HTTP {status}: {detail}")
        };
        Self {
            kind: ErrorKind::from_status(status),
            status: Some(status),
            message,
            source: None,
        }
    }

    /// Record the HTTP status an SDK reported alongside its own message.
    pub fn with_status(mut self, status: u16) -> Self {
        self.kind = ErrorKind::from_status(status);
        self.status = Some(status);
        self
    }

    pub fn with_source(
        mut self,
        source: impl Into<Box<dyn std::error::Error + Send + Sync + 'static>>,
    ) -> Self {
        self.source = Some(source.into());
        self
    }

    /// Prefix the message with the attempted operation and its target.
    pub fn context(mut self, operation: impl fmt::Display) -> Self {
        self.message = format!("{operation}: {}", self.message);
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status(&self) -> Option<u16> {
        self.status
    }
}

impl From<reqwest::Error> for ServiceError {
    fn from(err: reqwest::Error) -> Self {
        let kind = match err.status() {
            Some(status) => ErrorKind::from_status(status.as_u16()),
            None if err.is_timeout() => ErrorKind::Timeout,
            None if err.is_decode() => ErrorKind::Other,
            None => ErrorKind::Transient,
        };
        Self {
            kind,
            status: err.status().map(|s| s.as_u16()),
            message: err.to_string(),
            source: Some(Box::new(err)),
        }
    }
}

impl From<serde_json::Error> for ServiceError {
    fn from(err: serde_json::Error) -> Self {
        Self::new(ErrorKind::Other, format!("invalid JSON payload: {err}")).with_source(err)
    }
}

/// Attach operation context to the error side of a `ServiceResult`.
pub trait ResultExt<T> {
    fn context(self, operation: impl fmt::Display) -> ServiceResult<T>;

    fn with_context<D: fmt::Display>(self, operation: impl FnOnce() -> D) -> ServiceResult<T>;
}

impl<T> ResultExt<T> for ServiceResult<T> {
    fn context(self, operation: impl fmt::Display) -> ServiceResult<T> {
        self.map_err(|e| e.context(operation))
    }

    fn with_context<D: fmt::Display>(self, operation: impl FnOnce() -> D) -> ServiceResult<T> {
        self.map_err(|e| e.context(operation()))
    }
}

/// Reject an empty or whitespace-only required identifier.
pub fn require(name: &str, value: &str) -> ServiceResult<()> {
    if value.trim().is_empty() {
        return Err(ServiceError::validation(format!(
            "required parameter '{name}' is missing or empty"
        )));
    }
    Ok(())
}

/// Run `fut` until it completes or `cancel` fires, whichever comes first.
///
/// On cancellation the future is dropped, so nothing after its last `.await`
/// (in particular a cache write) runs.
pub async fn cancellable<T, F>(cancel: &CancellationToken, fut: F) -> ServiceResult<T>
where
    F: Future<Output = ServiceResult<T>>,
{
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(ServiceError::cancelled()),
        res = fut => res,
    }
}

// ARM, Key Vault and Kusto all report `{"error": {"message": ...}}`; Kusto v1
// also uses `{"error": {"@message": ...}}`.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    if let Some(msg) = error.as_str() {
        return Some(msg.to_string());
    }
    error
        .get("message")
        .or_else(|| error.get("@message"))
        .and_then(|m| m.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_are_classified_by_value() {
        assert_eq!(ErrorKind::from_status(401), ErrorKind::Unauthorized);
        assert_eq!(ErrorKind::from_status(403), ErrorKind::Forbidden);
        assert_eq!(ErrorKind::from_status(404), ErrorKind::NotFound);
        assert_eq!(ErrorKind::from_status(429), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_status(503), ErrorKind::Transient);
        assert_eq!(ErrorKind::from_status(302), ErrorKind::Other);
        assert!(ErrorKind::Unauthorized.is_auth_failure());
        assert!(ErrorKind::Forbidden.is_auth_failure());
        assert!(!ErrorKind::Transient.is_auth_failure());
    }

    #[test]
    fn from_status_extracts_service_message() {
        let err = ServiceError::from_status(
            403,
            r#"{"error":{"code":"Forbidden","message":"caller lacks permission"}}"#,
        );
        assert_eq!(err.kind(), ErrorKind::Forbidden);
        assert_eq!(err.status(), Some(403));
        assert_eq!(
            err.to_string(),
            "request failed with HTTP 403: caller lacks permission"
        );
    }

    #[test]
    fn context_prefixes_message_and_keeps_kind() {
        let err: ServiceResult<()> = Err(ServiceError::from_status(404, ""));
        let err = err.context("get key 'k1' from vault 'v1'").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(
            err.to_string(),
            "get key 'k1' from vault 'v1': request failed with HTTP 404"
        );
    }

    #[test]
    fn require_rejects_blank_identifiers() {
        assert!(require("database", "db").is_ok());
        let err = require("database", "  ").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Validation);
        assert!(err.to_string().contains("'database'"));
    }

    #[tokio::test]
    async fn cancellable_returns_cancelled_when_token_fires() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let res: ServiceResult<u32> =
            cancellable(&cancel, std::future::pending::<ServiceResult<u32>>()).await;
        assert_eq!(res.unwrap_err().kind(), ErrorKind::Cancelled);
    }
}

//! Error taxonomy for sandbox lifecycle operations.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use std::fmt;
use thiserror::Error;

/// Step of the provisioning workflow that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ProvisioningStage {
    CreateEnvironment,
    FetchTerminal,
    MarkExecutable,
    LaunchTerminal,
    ResolveUrl,
    Register,
}

impl fmt::Display for ProvisioningStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::CreateEnvironment => "create_environment",
            Self::FetchTerminal => "fetch_terminal",
            Self::MarkExecutable => "mark_executable",
            Self::LaunchTerminal => "launch_terminal",
            Self::ResolveUrl => "resolve_url",
            Self::Register => "register",
        };
        f.write_str(name)
    }
}

/// Errors returned by a [`SandboxProvider`](crate::provider::SandboxProvider).
#[derive(Error, Debug)]
pub enum ProviderError {
    /// The provider API could not be reached.
    #[error("provider unreachable: {0}")]
    Unavailable(String),

    /// The referenced environment does not exist (or no longer exists).
    #[error("environment not found: {0}")]
    NotFound(String),

    /// The provider answered with a non-success status.
    #[error("provider returned {status}: {message}")]
    Api { status: u16, message: String },

    /// The provider answered with a body we could not interpret.
    #[error("unexpected provider response: {0}")]
    Decode(String),

    /// A command ran but exited unsuccessfully.
    #[error("command `{command}` exited with {exit_code}")]
    CommandFailed { command: String, exit_code: i32 },
}

impl From<reqwest::Error> for ProviderError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ProviderError::Decode(e.to_string())
        } else if let Some(status) = e.status() {
            ProviderError::Api {
                status: status.as_u16(),
                message: e.to_string(),
            }
        } else {
            ProviderError::Unavailable(e.to_string())
        }
    }
}

/// Top-level error type for sandbox operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Malformed input, rejected before any external call.
    #[error("invalid input: {0}")]
    Validation(String),

    /// No session with this id is registered.
    #[error("sandbox not found: {0}")]
    NotFound(String),

    /// A session with this id is already registered.
    #[error("sandbox already registered: {0}")]
    AlreadyExists(String),

    /// A provisioning step failed.
    #[error("provisioning failed at {stage}: {message}")]
    ProvisioningFailed {
        stage: ProvisioningStage,
        message: String,
    },

    /// The provider could not complete a request unrelated to our own logic.
    #[error("provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// The provider did not confirm a stop; the session stays registered.
    #[error("stop failed: {0}")]
    StopFailed(String),

    /// A request task died before producing an answer.
    #[error("internal error: {0}")]
    Internal(String),
}

/// Result type alias for sandbox operations.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl Error {
    /// Categorical code exposed to clients.
    pub fn code(&self) -> &'static str {
        match self {
            Error::Validation(_) => "VALIDATION_ERROR",
            Error::NotFound(_) => "NOT_FOUND",
            Error::AlreadyExists(_) => "ALREADY_EXISTS",
            Error::ProvisioningFailed { .. } => "PROVISIONING_FAILED",
            Error::ProviderUnavailable(_) => "PROVIDER_UNAVAILABLE",
            Error::StopFailed(_) => "STOP_FAILED",
            Error::Internal(_) => "INTERNAL_SERVER_ERROR",
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            Error::Validation(_) => StatusCode::BAD_REQUEST,
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::AlreadyExists(_) => StatusCode::CONFLICT,
            Error::ProvisioningFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
            Error::ProviderUnavailable(_) | Error::StopFailed(_) => StatusCode::SERVICE_UNAVAILABLE,
            Error::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Message safe to show to a client. Provider details stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            Error::Validation(msg) => msg.clone(),
            Error::NotFound(_) => "Sandbox not found".to_string(),
            Error::AlreadyExists(_) | Error::ProvisioningFailed { .. } => {
                "could not create sandbox".to_string()
            }
            Error::ProviderUnavailable(_) => "sandbox provider unavailable".to_string(),
            Error::StopFailed(_) => "could not stop sandbox".to_string(),
            Error::Internal(_) => "internal error".to_string(),
        }
    }
}

impl IntoResponse for Error {
    fn into_response(self) -> Response {
        let body = ErrorBody {
            code: self.code(),
            message: self.public_message(),
        };
        (self.status(), Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provisioning_failure_hides_provider_detail() {
        let err = Error::ProvisioningFailed {
            stage: ProvisioningStage::FetchTerminal,
            message: "token sk-123 rejected by api.internal".to_string(),
        };
        assert_eq!(err.public_message(), "could not create sandbox");
        assert!(err.to_string().contains("fetch_terminal"));
        assert!(err.to_string().contains("sk-123"));
    }

    #[test]
    fn status_codes_are_categorical() {
        assert_eq!(
            Error::Validation("x".into()).into_response().status(),
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            Error::NotFound("x".into()).into_response().status(),
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            Error::ProviderUnavailable("x".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            Error::StopFailed("x".into()).into_response().status(),
            StatusCode::SERVICE_UNAVAILABLE
        );
    }

    #[test]
    fn stop_message_only_for_stop_failures() {
        assert_eq!(
            Error::StopFailed("timed out".into()).public_message(),
            "could not stop sandbox"
        );
        assert_ne!(
            Error::ProviderUnavailable("timed out".into()).public_message(),
            "could not stop sandbox"
        );
    }
}

//! Shared error types for the Courier dispatch fabric.

use thiserror::Error;

/// Top-level error type for the Courier system.
#[derive(Error, Debug)]
pub enum CourierError {
    /// No handler is registered for the request type.
    #[error("No handler registered for {0}")]
    HandlerNotFound(String),

    /// The router could not place the message locally or remotely.
    #[error("Unable to find a handler for {0}")]
    InvalidHandler(String),

    /// No transport dispatcher accepted the message.
    #[error("Cannot dispatch message to any remote handler: {0}")]
    NoRoute(String),

    /// The broker returned a mandatory publish because nothing was bound to the route.
    #[error("Unable to deliver required action: {0}")]
    Undeliverable(String),

    /// The remote side answered with an exception envelope.
    #[error("{message}")]
    Remote {
        /// Kind of the remote failure (error variant or type name).
        kind: String,
        /// Human-readable message raised on the remote side.
        message: String,
        /// Stack trace (error chain) captured on the remote side.
        remote_trace: Option<String>,
    },

    /// A handler failed with an application error.
    #[error("{0}")]
    Handler(String),

    /// Several concurrent handlers failed.
    #[error("{} notification handler(s) failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<CourierError>),

    /// A serialization/deserialization error occurred.
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A broker or transport operation failed.
    #[error("Transport error: {0}")]
    Transport(String),

    /// The broker connection is unavailable.
    #[error("Connection error: {0}")]
    Connection(String),

    /// The caller cancelled the operation.
    #[error("Operation cancelled")]
    Cancelled,

    /// No reply arrived within the configured window.
    #[error("Timed out waiting for reply to {0}")]
    TimedOut(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A handler registration was rejected.
    #[error("Registration error: {0}")]
    Registration(String),

    /// An argument did not match what the operation expects.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// The dispatch fabric is shutting down.
    #[error("Shutdown in progress")]
    ShuttingDown,

    /// An I/O error occurred.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// An internal error occurred.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl CourierError {
    /// Short, stable name of the error variant, carried as the remote exception kind.
    pub fn kind(&self) -> &str {
        match self {
            Self::HandlerNotFound(_) => "HandlerNotFound",
            Self::InvalidHandler(_) => "InvalidHandler",
            Self::NoRoute(_) => "NoRoute",
            Self::Undeliverable(_) => "Undeliverable",
            Self::Remote { kind, .. } => kind,
            Self::Handler(_) => "Handler",
            Self::Aggregate(_) => "Aggregate",
            Self::Serialization(_) => "Serialization",
            Self::Transport(_) => "Transport",
            Self::Connection(_) => "Connection",
            Self::Cancelled => "Cancelled",
            Self::TimedOut(_) => "TimedOut",
            Self::Config(_) => "Config",
            Self::Registration(_) => "Registration",
            Self::InvalidArgument(_) => "InvalidArgument",
            Self::ShuttingDown => "ShuttingDown",
            Self::Io(_) => "Io",
            Self::Internal(_) => "Internal",
        }
    }

    /// Build an application error from any displayable value.
    pub fn handler(message: impl std::fmt::Display) -> Self {
        Self::Handler(message.to_string())
    }
}

impl From<serde_json::Error> for CourierError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

fn join_errors(errors: &[CourierError]) -> String {
    errors
        .iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Alias for Result with CourierError.
pub type CourierResult<T> = Result<T, CourierError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_error_displays_remote_message() {
        let err = CourierError::Remote {
            kind: "Handler".to_string(),
            message: "boom".to_string(),
            remote_trace: None,
        };
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.kind(), "Handler");
    }

    #[test]
    fn test_aggregate_lists_every_failure() {
        let err = CourierError::Aggregate(vec![
            CourierError::handler("first"),
            CourierError::handler("second"),
        ]);
        let text = err.to_string();
        assert!(text.starts_with("2 notification handler(s) failed"));
        assert!(text.contains("first; second"));
    }
}

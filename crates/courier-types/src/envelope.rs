//! Response envelope carried back to the caller of a remote request.

use crate::error::{CourierError, CourierResult};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::error::Error as _;

/// Outcome of a remote request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResponseStatus {
    /// The handler returned normally; `content` holds the response.
    Ok,
    /// The handler failed; `exception` describes the failure.
    Exception,
}

/// Serialized description of a remote failure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteException {
    pub kind: String,
    pub message: String,
}

/// Reply sent from a listener back to the dispatcher that issued the request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    #[serde(default)]
    pub content: serde_json::Value,
    pub status: ResponseStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exception: Option<RemoteException>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_stack_trace: Option<String>,
}

impl ResponseEnvelope {
    /// Successful reply.
    pub fn ok(content: serde_json::Value) -> Self {
        Self {
            content,
            status: ResponseStatus::Ok,
            exception: None,
            original_stack_trace: None,
        }
    }

    /// Failed reply carrying a kind and message.
    pub fn exception(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            content: serde_json::Value::Null,
            status: ResponseStatus::Exception,
            exception: Some(RemoteException {
                kind: kind.into(),
                message: message.into(),
            }),
            original_stack_trace: None,
        }
    }

    /// Failed reply describing `err`; the error-source chain becomes the stack trace.
    pub fn from_error(err: &CourierError) -> Self {
        let mut trace = format!("{}: {}", err.kind(), err);
        let mut source = err.source();
        while let Some(cause) = source {
            trace.push_str("\n  caused by: ");
            trace.push_str(&cause.to_string());
            source = cause.source();
        }
        if let CourierError::Remote {
            remote_trace: Some(remote),
            ..
        } = err
        {
            trace.push_str("\n  remote: ");
            trace.push_str(remote);
        }

        let mut envelope = Self::exception(err.kind(), err.to_string());
        envelope.original_stack_trace = Some(trace);
        envelope
    }

    /// Whether the handler succeeded.
    pub fn is_ok(&self) -> bool {
        self.status == ResponseStatus::Ok
    }

    /// The remote failure as a local error. A successful envelope yields an
    /// internal error.
    pub fn into_error(self) -> CourierError {
        match self.exception {
            Some(RemoteException { kind, message }) => CourierError::Remote {
                kind,
                message,
                remote_trace: self.original_stack_trace,
            },
            None if self.status == ResponseStatus::Exception => CourierError::Remote {
                kind: "Unknown".to_string(),
                message: "remote handler failed without details".to_string(),
                remote_trace: self.original_stack_trace,
            },
            None => CourierError::Internal("envelope does not carry an exception".to_string()),
        }
    }

    /// Decode the content as `T`, or surface the remote failure.
    pub fn into_result<T: DeserializeOwned>(self) -> CourierResult<T> {
        match self.status {
            ResponseStatus::Ok => Ok(serde_json::from_value(self.content)?),
            ResponseStatus::Exception => Err(self.into_error()),
        }
    }

    /// Encode as JSON bytes.
    pub fn to_bytes(&self) -> CourierResult<Vec<u8>> {
        Ok(serde_json::to_vec(self)?)
    }

    /// Decode from JSON bytes.
    pub fn from_bytes(bytes: &[u8]) -> CourierResult<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ok_envelope_shape() {
        let env = ResponseEnvelope::ok(serde_json::json!({"pong": true}));
        let json = serde_json::to_value(&env).unwrap();
        assert_eq!(json["status"], "Ok");
        assert_eq!(json["content"]["pong"], true);
        assert!(json.get("exception").is_none());
        assert!(json.get("originalStackTrace").is_none());
    }

    #[test]
    fn test_handler_failure_round_trip() {
        let env = ResponseEnvelope::from_error(&CourierError::handler("boom"));
        let bytes = env.to_bytes().unwrap();
        let json: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["status"], "Exception");
        assert!(json["originalStackTrace"].as_str().unwrap().contains("boom"));

        let back = ResponseEnvelope::from_bytes(&bytes).unwrap();
        let err = back.into_result::<()>().unwrap_err();
        assert_eq!(err.to_string(), "boom");
        match err {
            CourierError::Remote { kind, remote_trace, .. } => {
                assert_eq!(kind, "Handler");
                assert!(remote_trace.is_some());
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_io_error_chain_lands_in_trace() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let env = ResponseEnvelope::from_error(&CourierError::from(io));
        assert_eq!(env.exception.as_ref().unwrap().kind, "Io");
        assert!(env.original_stack_trace.unwrap().contains("disk full"));
    }

    #[test]
    fn test_into_result_decodes_content() {
        let env = ResponseEnvelope::ok(serde_json::json!(42));
        assert_eq!(env.into_result::<u32>().unwrap(), 42);
    }
}

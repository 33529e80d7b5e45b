//! Records exchanged on log topics.

use courier_types::envelope::ResponseEnvelope;
use serde::{Deserialize, Serialize};

/// A request or notification on a type topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogRequest {
    pub message: serde_json::Value,
    /// Set on requests only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub correlation_id: Option<String>,
    /// Reply topic of the caller; set on requests only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
}

impl LogRequest {
    pub fn request(message: serde_json::Value, correlation_id: impl Into<String>, reply_to: impl Into<String>) -> Self {
        Self {
            message,
            correlation_id: Some(correlation_id.into()),
            reply_to: Some(reply_to.into()),
        }
    }

    pub fn notification(message: serde_json::Value) -> Self {
        Self {
            message,
            correlation_id: None,
            reply_to: None,
        }
    }
}

/// A reply on a caller's reply topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogReply {
    pub reply: ResponseEnvelope,
    pub correlation_id: String,
}

//! Progress protocol: the message envelope and the stream frames around it.
//!
//! Every progress message travels as a JSON object:
//!
//! ```json
//! {
//!   "type": "info",
//!   "operationId": "6f1c…",
//!   "sequence": 3,
//!   "payload": { "message": "listed 120 buckets" },
//!   "timestamp": "2025-01-01T12:00:00Z"
//! }
//! ```
//!
//! `type` is an open set: values this build does not know round-trip through
//! [`MessageKind::Other`]. Unknown fields are ignored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use uuid::Uuid;

use super::operation::OperationStatus;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("frame has no `type`")]
    MissingType,

    #[error("operation {operation_id}: expected sequence {expected}, got {got}")]
    SequenceGap {
        operation_id: Uuid,
        expected: u64,
        got: u64,
    },

    #[error("operation {0} already completed")]
    AlreadyCompleted(Uuid),
}

/// Kind of a progress message.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum MessageKind {
    Info,
    Warning,
    Error,
    /// Percent update; payload carries `percent`.
    Progress,
    /// Terminal message; payload is a [`CompletionPayload`].
    Completion,
    Other(String),
}

impl MessageKind {
    pub fn as_str(&self) -> &str {
        match self {
            MessageKind::Info => "info",
            MessageKind::Warning => "warning",
            MessageKind::Error => "error",
            MessageKind::Progress => "progress",
            MessageKind::Completion => "completion",
            MessageKind::Other(other) => other,
        }
    }
}

impl From<String> for MessageKind {
    fn from(value: String) -> Self {
        match value.as_str() {
            "info" => MessageKind::Info,
            "warning" => MessageKind::Warning,
            "error" => MessageKind::Error,
            "progress" => MessageKind::Progress,
            "completion" => MessageKind::Completion,
            _ => MessageKind::Other(value),
        }
    }
}

impl From<MessageKind> for String {
    fn from(kind: MessageKind) -> Self {
        match kind {
            MessageKind::Other(other) => other,
            known => known.as_str().to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressMessage {
    #[serde(rename = "type")]
    pub kind: MessageKind,
    pub operation_id: Uuid,
    /// Gapless per operation, starting at 1.
    pub sequence: u64,
    #[serde(default)]
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

impl ProgressMessage {
    pub fn new(operation_id: Uuid, sequence: u64, kind: MessageKind, payload: Value) -> Self {
        Self {
            kind,
            operation_id,
            sequence,
            payload,
            timestamp: Utc::now(),
        }
    }

    pub fn is_completion(&self) -> bool {
        self.kind == MessageKind::Completion
    }

    /// Percent carried by a `progress` message, clamped to 100.
    pub fn percent(&self) -> Option<u8> {
        if self.kind != MessageKind::Progress {
            return None;
        }
        let percent = self.payload.get("percent")?.as_u64()?;
        Some(percent.min(100) as u8)
    }

    /// Decoded completion payload, if this is a completion message.
    pub fn completion(&self) -> Option<CompletionPayload> {
        if !self.is_completion() {
            return None;
        }
        serde_json::from_value(self.payload.clone()).ok()
    }
}

/// Payload of the terminal `completion` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompletionPayload {
    pub status: OperationStatus,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<String>,
}

impl CompletionPayload {
    pub fn into_payload(self) -> Value {
        json!(self)
    }
}

/// Frames a client sends on the stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
pub enum ClientFrame {
    Subscribe {
        operation_id: Uuid,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        after_sequence: Option<u64>,
    },
    Unsubscribe {
        operation_id: Uuid,
    },
}

impl ClientFrame {
    pub fn encode(&self) -> String {
        // Plain enum with string/number fields; serialization cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Control frames the server sends besides progress messages.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase", rename_all_fields = "camelCase")]
enum ControlFrame {
    Subscribed {
        operation_id: Uuid,
        next_sequence: u64,
    },
    ResyncRequired {
        operation_id: Uuid,
        earliest_sequence: u64,
    },
    Error {
        message: String,
    },
}

/// Everything the server writes to a stream connection.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerFrame {
    Progress(ProgressMessage),
    /// Subscription accepted; the next message delivered will carry `next_sequence`.
    Subscribed {
        operation_id: Uuid,
        next_sequence: u64,
    },
    /// The requested position was evicted from the backlog.
    ResyncRequired {
        operation_id: Uuid,
        earliest_sequence: u64,
    },
    Error {
        message: String,
    },
}

impl ServerFrame {
    pub fn encode(&self) -> String {
        let encoded = match self {
            ServerFrame::Progress(message) => serde_json::to_string(message),
            ServerFrame::Subscribed {
                operation_id,
                next_sequence,
            } => serde_json::to_string(&ControlFrame::Subscribed {
                operation_id: *operation_id,
                next_sequence: *next_sequence,
            }),
            ServerFrame::ResyncRequired {
                operation_id,
                earliest_sequence,
            } => serde_json::to_string(&ControlFrame::ResyncRequired {
                operation_id: *operation_id,
                earliest_sequence: *earliest_sequence,
            }),
            ServerFrame::Error { message } => serde_json::to_string(&ControlFrame::Error {
                message: message.clone(),
            }),
        };
        encoded.unwrap_or_default()
    }

    /// Decode a server frame.
    ///
    /// `subscribed` and `resyncRequired` are reserved control types. An `error`
    /// frame without a `sequence` is a control error; with one it is a progress
    /// message of kind `error`. Everything else is a progress message.
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let kind = value
            .get("type")
            .and_then(Value::as_str)
            .ok_or(ProtocolError::MissingType)?;

        let is_control = match kind {
            "subscribed" | "resyncRequired" => true,
            "error" => value.get("sequence").is_none(),
            _ => false,
        };
        if !is_control {
            return Ok(ServerFrame::Progress(serde_json::from_value(value)?));
        }

        let control: ControlFrame = serde_json::from_value(value)?;
        Ok(match control {
            ControlFrame::Subscribed {
                operation_id,
                next_sequence,
            } => ServerFrame::Subscribed {
                operation_id,
                next_sequence,
            },
            ControlFrame::ResyncRequired {
                operation_id,
                earliest_sequence,
            } => ServerFrame::ResyncRequired {
                operation_id,
                earliest_sequence,
            },
            ControlFrame::Error { message } => ServerFrame::Error { message },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_uses_camel_case_and_type_field() {
        let id = Uuid::new_v4();
        let message = ProgressMessage::new(id, 1, MessageKind::Info, json!({"message": "hi"}));
        let value: Value = serde_json::to_value(&message).unwrap();

        assert_eq!(value["type"], "info");
        assert_eq!(value["operationId"], id.to_string());
        assert_eq!(value["sequence"], 1);
        assert!(value["timestamp"].as_str().unwrap().ends_with('Z'));
    }

    #[test]
    fn unknown_kinds_and_fields_survive_decoding() {
        let id = Uuid::new_v4();
        let text = format!(
            r#"{{"type":"metric","operationId":"{id}","sequence":4,"payload":{{}},
                "timestamp":"2025-01-01T00:00:00Z","shard":7}}"#
        );
        let ServerFrame::Progress(message) = ServerFrame::decode(&text).unwrap() else {
            panic!("expected progress frame");
        };
        assert_eq!(message.kind, MessageKind::Other("metric".into()));
        assert_eq!(serde_json::to_value(&message).unwrap()["type"], "metric");
    }

    #[test]
    fn error_frames_are_disambiguated_by_sequence() {
        let control = ServerFrame::Error {
            message: "unknown operation".into(),
        };
        assert_eq!(ServerFrame::decode(&control.encode()).unwrap(), control);

        let progress = ServerFrame::Progress(ProgressMessage::new(
            Uuid::new_v4(),
            2,
            MessageKind::Error,
            json!({"message": "disk full"}),
        ));
        assert_eq!(ServerFrame::decode(&progress.encode()).unwrap(), progress);
    }

    #[test]
    fn control_frames_use_reserved_types() {
        let id = Uuid::new_v4();
        let frame = ServerFrame::ResyncRequired {
            operation_id: id,
            earliest_sequence: 40,
        };
        let value: Value = serde_json::from_str(&frame.encode()).unwrap();
        assert_eq!(value["type"], "resyncRequired");
        assert_eq!(value["earliestSequence"], 40);
    }

    #[test]
    fn client_subscribe_frame_shape() {
        let id = Uuid::new_v4();
        let frame = ClientFrame::decode(&format!(
            r#"{{"type":"subscribe","operationId":"{id}","afterSequence":12}}"#
        ))
        .unwrap();
        assert_eq!(
            frame,
            ClientFrame::Subscribe {
                operation_id: id,
                after_sequence: Some(12)
            }
        );
        assert!(ClientFrame::decode(r#"{"type":"dance"}"#).is_err());
    }

    #[test]
    fn completion_payload_and_percent_accessors() {
        let id = Uuid::new_v4();
        let done = ProgressMessage::new(
            id,
            9,
            MessageKind::Completion,
            CompletionPayload {
                status: OperationStatus::Succeeded,
                result: Some(json!({"resources": 3})),
                error: None,
            }
            .into_payload(),
        );
        assert_eq!(done.completion().unwrap().status, OperationStatus::Succeeded);

        let pct = ProgressMessage::new(id, 2, MessageKind::Progress, json!({"percent": 130}));
        assert_eq!(pct.percent(), Some(100));
    }
}

// Debugger wire protocol definitions
//
// Requests and responses are JSON documents. Framing is done by the transport;
// this module only knows the message shapes.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub type DebugResult<T> = Result<T, DebugError>;

/// Sequence number assigned by the dispatcher to each outbound request
pub type Seq = u64;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DebugError {
    #[error("Timeout")]
    Timeout,

    #[error("Context is dismissed")]
    ContextDismissed,

    /// Failure reported by the remote engine, passed through verbatim
    #[error("{0}")]
    Remote(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Connection closed")]
    ConnectionClosed,

    #[error("Malformed response: {0}")]
    DecodeContract(String),

    #[error("Malformed reference id: {0:?}")]
    MalformedReference(String),
}

impl DebugError {
    /// A fatal error means a collaborator broke its contract, not that the
    /// evaluation failed.
    pub fn is_fatal(&self) -> bool {
        matches!(self, DebugError::DecodeContract(_))
    }
}

/// A request before the dispatcher has assigned it a sequence number
#[derive(Debug, Clone, PartialEq)]
pub struct DebuggerMessage {
    pub command: String,
    pub arguments: Option<Value>,
}

impl DebuggerMessage {
    pub fn new(command: impl Into<String>, arguments: Option<Value>) -> Self {
        Self {
            command: command.into(),
            arguments,
        }
    }

    pub fn encode(&self, seq: Seq) -> DebugResult<String> {
        let packet = RequestPacket {
            seq,
            kind: "request",
            command: &self.command,
            arguments: self.arguments.as_ref(),
        };
        serde_json::to_string(&packet)
            .map_err(|e| DebugError::Transport(format!("Failed to encode request: {}", e)))
    }
}

#[derive(Serialize)]
struct RequestPacket<'a> {
    seq: Seq,
    #[serde(rename = "type")]
    kind: &'static str,
    command: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    arguments: Option<&'a Value>,
}

/// Reply to a request, correlated through `request_seq`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    pub request_seq: Seq,
    #[serde(default)]
    pub command: Option<String>,
    pub success: bool,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub body: Option<Value>,
    #[serde(default)]
    pub running: Option<bool>,
}

impl Response {
    /// Convert an engine-reported failure into an error, keeping the message as sent
    pub fn into_success(self) -> DebugResult<SuccessResponse> {
        if self.success {
            Ok(SuccessResponse {
                request_seq: self.request_seq,
                body: self.body,
            })
        } else {
            Err(DebugError::Remote(
                self.message
                    .unwrap_or_else(|| "Unknown remote failure".to_string()),
            ))
        }
    }
}

/// Body of a successful response, decoded lazily by whoever asked for it
#[derive(Debug, Clone, PartialEq)]
pub struct SuccessResponse {
    pub request_seq: Seq,
    pub body: Option<Value>,
}

impl SuccessResponse {
    /// Extract the evaluate body. Failing here means the engine or the decoder
    /// is broken, so the error is fatal.
    pub fn evaluate_body(&self) -> DebugResult<ValueHandle> {
        let body = self.body.as_ref().ok_or_else(|| {
            DebugError::DecodeContract("evaluate response has no body".to_string())
        })?;
        ValueHandle::deserialize(body)
            .map_err(|e| DebugError::DecodeContract(format!("evaluate body: {}", e)))
    }
}

/// Unsolicited notification from the engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventPacket {
    pub event: String,
    #[serde(default)]
    pub body: Option<Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum IncomingMessage {
    Response(Response),
    Event(EventPacket),
}

impl IncomingMessage {
    pub fn decode(text: &str) -> DebugResult<Self> {
        serde_json::from_str(text)
            .map_err(|e| DebugError::Transport(format!("Failed to decode message: {}", e)))
    }
}

/// Wire-level description of a remote value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValueHandle {
    pub handle: i64,
    #[serde(rename = "type")]
    pub value_type: String,
    #[serde(default)]
    pub value: Option<Value>,
    #[serde(default)]
    pub class_name: Option<String>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub length: Option<u64>,
    #[serde(default)]
    pub from_index: Option<u64>,
    #[serde(default)]
    pub to_index: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_encode() {
        let message = DebuggerMessage::new("continue", None);
        let encoded: Value = serde_json::from_str(&message.encode(7).unwrap()).unwrap();

        assert_eq!(
            encoded,
            json!({"seq": 7, "type": "request", "command": "continue"})
        );
    }

    #[test]
    fn test_decode_response_and_event() {
        let response = IncomingMessage::decode(
            r#"{"seq":3,"type":"response","request_seq":1,"command":"evaluate","success":false,"message":"ReferenceError: x is not defined"}"#,
        )
        .unwrap();

        match response {
            IncomingMessage::Response(r) => {
                assert_eq!(r.request_seq, 1);
                assert_eq!(
                    r.into_success().unwrap_err().to_string(),
                    "ReferenceError: x is not defined"
                );
            }
            other => panic!("Expected response, got {:?}", other),
        }

        let event =
            IncomingMessage::decode(r#"{"seq":4,"type":"event","event":"break","body":{}}"#)
                .unwrap();
        assert!(matches!(event, IncomingMessage::Event(e) if e.event == "break"));
    }

    #[test]
    fn test_decode_garbage_is_error() {
        assert!(IncomingMessage::decode("not json").is_err());
        assert!(IncomingMessage::decode(r#"{"type":"banana"}"#).is_err());
    }

    #[test]
    fn test_evaluate_body() {
        let ok = SuccessResponse {
            request_seq: 1,
            body: Some(json!({"handle": 5, "type": "number", "value": 124, "text": "124"})),
        };
        let handle = ok.evaluate_body().unwrap();
        assert_eq!(handle.handle, 5);
        assert_eq!(handle.value_type, "number");

        let missing = SuccessResponse {
            request_seq: 2,
            body: None,
        };
        let err = missing.evaluate_body().unwrap_err();
        assert!(err.is_fatal());

        let malformed = SuccessResponse {
            request_seq: 3,
            body: Some(json!({"type": 12})),
        };
        assert!(matches!(
            malformed.evaluate_body(),
            Err(DebugError::DecodeContract(_))
        ));
    }

    #[test]
    fn test_timeout_message_is_literal() {
        assert_eq!(DebugError::Timeout.to_string(), "Timeout");
        assert!(!DebugError::Timeout.is_fatal());
    }
}

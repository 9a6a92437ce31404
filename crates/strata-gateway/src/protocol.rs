//! WebSocket wire protocol. JSON text frames tagged by `type`.

use serde::{Deserialize, Serialize};

use crate::error::GatewayError;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { topic: String },
    Unsubscribe { topic: String },
    Heartbeat,
}

impl ClientMessage {
    pub fn parse(text: &str) -> Result<Self, GatewayError> {
        serde_json::from_str(text).map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    SlowConsumer,
    HeartbeatTimeout,
    WriteTimeout,
    InvalidTopic,
    BadRequest,
    ShuttingDown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Update {
        topic: String,
        payload: serde_json::Value,
        /// Gateway-wide, strictly increasing.
        sequence: u64,
    },
    HeartbeatAck,
    Error {
        code: ErrorCode,
        message: String,
        /// Minimum delay before reconnecting.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        retry_after_ms: Option<u64>,
    },
}

impl ServerMessage {
    pub fn error(code: ErrorCode, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code,
            message: message.into(),
            retry_after_ms: None,
        }
    }

    pub fn to_json(&self) -> Result<String, GatewayError> {
        serde_json::to_string(self).map_err(|e| GatewayError::Protocol(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_messages() {
        assert_eq!(
            ClientMessage::parse(r#"{"type":"subscribe","topic":"entity:deal"}"#).unwrap(),
            ClientMessage::Subscribe {
                topic: "entity:deal".into()
            }
        );
        assert_eq!(
            ClientMessage::parse(r#"{"type":"heartbeat"}"#).unwrap(),
            ClientMessage::Heartbeat
        );
        assert!(ClientMessage::parse(r#"{"type":"publish","topic":"x"}"#).is_err());
        assert!(ClientMessage::parse("not json").is_err());
    }

    #[test]
    fn test_server_message_shapes() {
        let update = ServerMessage::Update {
            topic: "entity:deal:1".into(),
            payload: json!({"stage": "won"}),
            sequence: 7,
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            json!({"type": "update", "topic": "entity:deal:1", "payload": {"stage": "won"}, "sequence": 7})
        );
        assert_eq!(
            serde_json::to_value(ServerMessage::HeartbeatAck).unwrap(),
            json!({"type": "heartbeat_ack"})
        );

        let plain = ServerMessage::error(ErrorCode::InvalidTopic, "bad");
        assert_eq!(
            serde_json::to_value(&plain).unwrap(),
            json!({"type": "error", "code": "invalid_topic", "message": "bad"})
        );

        let evicted = ServerMessage::Error {
            code: ErrorCode::SlowConsumer,
            message: "queue full".into(),
            retry_after_ms: Some(500),
        };
        assert_eq!(serde_json::to_value(&evicted).unwrap()["retry_after_ms"], 500);
    }
}

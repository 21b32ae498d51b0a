use serde::{Deserialize, Serialize};

/// Messages sent from client to server
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload")]
pub enum ClientMessage {
    /// Application-level ping; answered with a pong.
    Ping,
    /// Relay a payload to the sender's tenant peers.
    Broadcast { payload: serde_json::Value },
}

/// Messages sent from server to client
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "heartbeat")]
    Heartbeat,
    #[serde(rename = "pong")]
    Pong,
    #[serde(rename = "event")]
    Event { payload: serde_json::Value },
    #[serde(rename = "error")]
    Error { code: String, message: String },
}

impl ServerMessage {
    pub fn error(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Error {
            code: code.into(),
            message: message.into(),
        }
    }

    pub fn event(payload: serde_json::Value) -> Self {
        Self::Event { payload }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_message_round_trip() {
        let msg: ClientMessage = serde_json::from_str(r#"{"type":"Ping"}"#).unwrap();
        assert!(matches!(msg, ClientMessage::Ping));

        let msg: ClientMessage = serde_json::from_str(
            r#"{"type":"Broadcast","payload":{"payload":{"kind":"status"}}}"#,
        )
        .unwrap();
        assert!(matches!(msg, ClientMessage::Broadcast { .. }));
    }

    #[test]
    fn test_server_message_tags() {
        let json = serde_json::to_string(&ServerMessage::Heartbeat).unwrap();
        assert_eq!(json, r#"{"type":"heartbeat"}"#);

        let json = serde_json::to_string(&ServerMessage::event(json!({"k": 1}))).unwrap();
        assert!(json.contains(r#""type":"event""#));
    }
}

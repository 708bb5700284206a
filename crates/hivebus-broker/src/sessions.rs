//! WebSocket sessions as delivery destinations.
//!
//! A session's socket task owns the receiving half of a bounded channel
//! registered in the [`SessionHub`]. The delivery manager reaches it through
//! [`SessionConnector`], so pushing to a socket goes through the same
//! pool, retry and circuit logic as an HTTP POST.

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::debug;

use hivebus_client::{Connection, Connector};
use hivebus_common::model::{Endpoint, MessageEnvelope, PublishReceipt, PublishRequest};
use hivebus_common::protocol::error::{BusError, Result};

/// Frames sent by the bus to a session.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Welcome {
        session_id: String,
    },
    Ack {
        action: String,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        topics: Vec<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        receipt: Option<PublishReceipt>,
    },
    Message {
        message: MessageEnvelope,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerFrame {
    pub fn error(err: &BusError) -> Self {
        ServerFrame::Error {
            code: err.code().to_string(),
            message: err.public_message(),
        }
    }
}

/// Frames accepted from a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    Subscribe { topics: Vec<String> },
    Unsubscribe { topics: Vec<String> },
    Publish { message: PublishRequest },
}

/// Outbound channels of the open sessions.
pub struct SessionHub {
    outbound: DashMap<String, mpsc::Sender<ServerFrame>>,
    capacity: usize,
}

impl SessionHub {
    pub fn new(capacity: usize) -> Self {
        Self {
            outbound: DashMap::new(),
            capacity: capacity.max(1),
        }
    }

    /// Opens the outbound channel of a new session.
    pub fn open(&self, session_id: &str) -> mpsc::Receiver<ServerFrame> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.outbound.insert(session_id.to_string(), tx);
        rx
    }

    pub fn close(&self, session_id: &str) {
        self.outbound.remove(session_id);
    }

    pub fn is_open(&self, session_id: &str) -> bool {
        self.outbound.contains_key(session_id)
    }

    pub fn len(&self) -> usize {
        self.outbound.len()
    }

    pub fn is_empty(&self) -> bool {
        self.outbound.is_empty()
    }

    fn sender(&self, session_id: &str) -> Option<mpsc::Sender<ServerFrame>> {
        self.outbound.get(session_id).map(|tx| tx.clone())
    }
}

impl Default for SessionHub {
    fn default() -> Self {
        Self::new(256)
    }
}

/// [`Connector`] for `websocket` endpoints, whose address is a session id.
pub struct SessionConnector {
    hub: Arc<SessionHub>,
}

impl SessionConnector {
    pub fn new(hub: Arc<SessionHub>) -> Self {
        Self { hub }
    }
}

#[async_trait]
impl Connector for SessionConnector {
    async fn connect(&self, endpoint: &Endpoint) -> Result<Box<dyn Connection>> {
        let sender = self
            .hub
            .sender(&endpoint.address)
            .ok_or_else(|| BusError::Transport(format!("session {} is closed", endpoint.address)))?;
        Ok(Box::new(SessionConnection {
            session_id: endpoint.address.clone(),
            sender,
        }))
    }
}

struct SessionConnection {
    session_id: String,
    sender: mpsc::Sender<ServerFrame>,
}

#[async_trait]
impl Connection for SessionConnection {
    async fn transmit(&mut self, envelope: &MessageEnvelope) -> Result<()> {
        self.sender
            .send(ServerFrame::Message {
                message: envelope.clone(),
            })
            .await
            .map_err(|_| BusError::Transport(format!("session {} is closed", self.session_id)))?;
        debug!(session_id = %self.session_id, message_id = %envelope.id, "pushed to session");
        Ok(())
    }

    fn is_open(&self) -> bool {
        !self.sender.is_closed()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_frames_parse() {
        let frame: ClientFrame =
            serde_json::from_value(json!({"type": "subscribe", "topics": ["alerts.*"]})).unwrap();
        assert!(matches!(frame, ClientFrame::Subscribe { ref topics } if topics == &["alerts.*"]));

        let frame: ClientFrame = serde_json::from_value(json!({
            "type": "publish",
            "message": {"topic": "alerts.cpu", "payload": {"load": 0.9}}
        }))
        .unwrap();
        assert!(matches!(frame, ClientFrame::Publish { .. }));

        assert!(serde_json::from_value::<ClientFrame>(json!({"type": "shout"})).is_err());
    }

    #[test]
    fn test_server_frame_shape() {
        let welcome = serde_json::to_value(ServerFrame::Welcome {
            session_id: "ws-1".into(),
        })
        .unwrap();
        assert_eq!(welcome, json!({"type": "welcome", "session_id": "ws-1"}));

        let err = serde_json::to_value(ServerFrame::error(&BusError::validation("bad topic"))).unwrap();
        assert_eq!(err["type"], "error");
        assert_eq!(err["code"], "validation_error");
    }

    #[tokio::test]
    async fn test_connector_pushes_to_open_session() {
        let hub = Arc::new(SessionHub::new(4));
        let mut rx = hub.open("ws-1");
        let connector = SessionConnector::new(hub.clone());

        let mut conn = connector.connect(&Endpoint::websocket("ws-1")).await.unwrap();
        let envelope = MessageEnvelope::direct("ws-1", json!({"n": 1}));
        conn.transmit(&envelope).await.unwrap();

        match rx.recv().await.unwrap() {
            ServerFrame::Message { message } => assert_eq!(message.id, envelope.id),
            other => panic!("unexpected frame {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_closed_session_is_transport_error() {
        let hub = Arc::new(SessionHub::new(4));
        let connector = SessionConnector::new(hub.clone());
        assert!(matches!(
            connector.connect(&Endpoint::websocket("ws-missing")).await,
            Err(BusError::Transport(_))
        ));

        let rx = hub.open("ws-2");
        let mut conn = connector.connect(&Endpoint::websocket("ws-2")).await.unwrap();
        drop(rx);
        hub.close("ws-2");
        assert!(!conn.is_open());
        let envelope = MessageEnvelope::direct("ws-2", json!({}));
        assert!(matches!(conn.transmit(&envelope).await, Err(BusError::Transport(_))));
    }
}

//! Socket loop of a WebSocket session.
//!
//! The session registers itself as service `ws-<uuid>` with a `websocket`
//! endpoint, heartbeats while the socket is open and deregisters on close.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use tracing::{debug, info, warn};
use uuid::Uuid;

use hivebus_common::model::{Endpoint, Registration};
use hivebus_common::protocol::error::BusError;

use crate::bus::Bus;
use crate::sessions::{ClientFrame, ServerFrame};

/// Tag set on every session's service record.
pub const SESSION_TAG: &str = "websocket";

pub(crate) async fn run_session(bus: Arc<Bus>, socket: WebSocket) {
    let session_id = format!("ws-{}", Uuid::new_v4());
    let registration = Registration::new(session_id.clone(), Endpoint::websocket(session_id.clone()))
        .with_id(session_id.clone())
        .with_tag(SESSION_TAG);

    let mut outbound = bus.sessions().open(&session_id);
    if let Err(e) = bus.registry().register(registration) {
        warn!(session_id = %session_id, "could not register session: {}", e);
        bus.sessions().close(&session_id);
        return;
    }
    bus.metrics().session_opened();
    info!(session_id = %session_id, "websocket session opened");

    let (mut sink, mut stream) = socket.split();
    let mut heartbeat = tokio::time::interval(bus.config().health.heartbeat_interval());
    let cancel = bus.cancellation().clone();

    let welcome = ServerFrame::Welcome {
        session_id: session_id.clone(),
    };
    let mut open = send_frame(&mut sink, &welcome).await;

    while open {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = heartbeat.tick() => {
                if let Err(e) = bus.registry().heartbeat(&session_id) {
                    debug!(session_id = %session_id, "session heartbeat failed: {}", e);
                }
            }
            frame = outbound.recv() => match frame {
                Some(frame) => open = send_frame(&mut sink, &frame).await,
                None => break,
            },
            incoming = stream.next() => match incoming {
                Some(Ok(Message::Text(text))) => {
                    let reply = handle_frame(&bus, &session_id, &text);
                    open = send_frame(&mut sink, &reply).await;
                }
                Some(Ok(Message::Binary(_))) => {
                    let reply = ServerFrame::error(&BusError::validation("binary frames are not supported"));
                    open = send_frame(&mut sink, &reply).await;
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    warn!(session_id = %session_id, "websocket error: {}", e);
                    break;
                }
            },
        }
    }

    bus.sessions().close(&session_id);
    if let Err(e) = bus.registry().deregister(&session_id) {
        debug!(session_id = %session_id, "session already removed: {}", e);
    }
    bus.metrics().session_closed();
    info!(session_id = %session_id, "websocket session closed");
}

async fn send_frame(sink: &mut SplitSink<WebSocket, Message>, frame: &ServerFrame) -> bool {
    let text = match serde_json::to_string(frame) {
        Ok(text) => text,
        Err(e) => {
            warn!("failed to encode server frame: {}", e);
            return true;
        }
    };
    sink.send(Message::Text(text)).await.is_ok()
}

/// Applies one client frame and returns the reply.
fn handle_frame(bus: &Bus, session_id: &str, text: &str) -> ServerFrame {
    let frame: ClientFrame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => return ServerFrame::error(&BusError::validation(format!("invalid frame: {}", e))),
    };

    match frame {
        ClientFrame::Subscribe { topics } => {
            for topic in &topics {
                if let Err(e) = bus.registry().subscribe(topic, session_id) {
                    return ServerFrame::error(&e);
                }
            }
            ServerFrame::Ack {
                action: "subscribe".into(),
                topics,
                receipt: None,
            }
        }
        ClientFrame::Unsubscribe { topics } => {
            for topic in &topics {
                bus.registry().unsubscribe_topic(topic, session_id);
            }
            ServerFrame::Ack {
                action: "unsubscribe".into(),
                topics,
                receipt: None,
            }
        }
        ClientFrame::Publish { mut message } => {
            if message.source.is_none() {
                message.source = Some(session_id.to_string());
            }
            match message.into_envelope().and_then(|env| bus.router().publish(env)) {
                Ok(receipt) => ServerFrame::Ack {
                    action: "publish".into(),
                    topics: Vec::new(),
                    receipt: Some(receipt),
                },
                Err(e) => ServerFrame::error(&e),
            }
        }
    }
}

//! WebSocket stream hub
//!
//! `GET /api/stream` upgrades to a WebSocket. Clients drive membership with
//! JSON messages:
//!
//! ```json
//! {"type": "join",  "sensorId": "sensor-1"}
//! {"type": "leave", "sensorId": "sensor-1"}
//! {"type": "ack",   "alertId": "..."}
//! ```
//!
//! and receive `{"type": "frame", "sensorId": .., "readings": [..]}` for every
//! joined sensor. Each joined group gets a forwarder task that moves frames
//! from the registry into the connection's bounded outbound queue; when that
//! queue is full the frame is dropped for this client only.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use super::{group_for, Frame, SubscriptionRegistry};
use crate::alerts::AlertAcknowledger;

pub const STREAM_PATH: &str = "/api/stream";

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ClientMessage {
    Join {
        #[serde(rename = "sensorId")]
        sensor_id: String,
    },
    Leave {
        #[serde(rename = "sensorId")]
        sensor_id: String,
    },
    Ack {
        #[serde(rename = "alertId")]
        alert_id: String,
    },
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ServerMessage<'a> {
    Frame(&'a Frame),
    Ack {
        #[serde(rename = "alertId")]
        alert_id: &'a str,
    },
    Error {
        message: String,
    },
}

#[derive(Clone)]
pub struct StreamHubState {
    registry: Arc<SubscriptionRegistry>,
    acknowledger: Arc<dyn AlertAcknowledger>,
    outbound_buffer: usize,
    connections: Arc<AtomicU64>,
}

impl StreamHubState {
    pub fn new(
        registry: Arc<SubscriptionRegistry>,
        acknowledger: Arc<dyn AlertAcknowledger>,
        outbound_buffer: usize,
    ) -> Self {
        Self {
            registry,
            acknowledger,
            outbound_buffer: outbound_buffer.max(1),
            connections: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Connections accepted since start.
    pub fn connections_total(&self) -> u64 {
        self.connections.load(Ordering::Relaxed)
    }
}

pub fn router(state: StreamHubState) -> Router {
    Router::new()
        .route(STREAM_PATH, get(stream_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn stream_handler(ws: WebSocketUpgrade, State(state): State<StreamHubState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

fn encode(message: &ServerMessage<'_>) -> Option<String> {
    serde_json::to_string(message)
        .map_err(|e| warn!(error = %e, "Failed to encode server message"))
        .ok()
}

/// Forward one group's frames into the connection's outbound queue.
async fn forward_group(mut rx: broadcast::Receiver<Arc<Frame>>, out: mpsc::Sender<String>, group: String) {
    loop {
        match rx.recv().await {
            Ok(frame) => {
                let Some(text) = encode(&ServerMessage::Frame(&frame)) else {
                    continue;
                };
                match out.try_send(text) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        debug!(group = %group, "Client outbound queue full, frame dropped");
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => break,
                }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                debug!(group = %group, skipped, "Client lagging, frames skipped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

/// Per-connection group membership.
struct Membership {
    forwarders: HashMap<String, JoinHandle<()>>,
}

impl Membership {
    fn new() -> Self {
        Self {
            forwarders: HashMap::new(),
        }
    }

    fn join(&mut self, registry: &SubscriptionRegistry, sensor_id: &str, out: &mpsc::Sender<String>) {
        let group = group_for(sensor_id);
        if self.forwarders.contains_key(&group) {
            return;
        }
        let rx = registry.subscribe(&group);
        let handle = tokio::spawn(forward_group(rx, out.clone(), group.clone()));
        self.forwarders.insert(group, handle);
    }

    fn leave(&mut self, sensor_id: &str) -> bool {
        self.forwarders
            .remove(&group_for(sensor_id))
            .map(|handle| handle.abort())
            .is_some()
    }

    fn clear(&mut self) {
        for (_, handle) in self.forwarders.drain() {
            handle.abort();
        }
    }
}

async fn handle_socket(socket: WebSocket, state: StreamHubState) {
    let connection = state.connections.fetch_add(1, Ordering::Relaxed) + 1;
    info!(connection, "Stream client connected");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(state.outbound_buffer);

    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    let mut membership = Membership::new();

    while let Some(message) = stream.next().await {
        let text = match message {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(connection, error = %e, "Stream client read error");
                break;
            }
        };

        let reply = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Join { sensor_id }) => {
                debug!(connection, sensor = %sensor_id, "Join sensor group");
                membership.join(&state.registry, &sensor_id, &out_tx);
                None
            }
            Ok(ClientMessage::Leave { sensor_id }) => {
                debug!(connection, sensor = %sensor_id, "Leave sensor group");
                membership.leave(&sensor_id);
                None
            }
            Ok(ClientMessage::Ack { alert_id }) => match state.acknowledger.acknowledge(&alert_id).await {
                Ok(()) => encode(&ServerMessage::Ack { alert_id: &alert_id }),
                Err(e) => encode(&ServerMessage::Error {
                    message: e.to_string(),
                }),
            },
            Err(e) => encode(&ServerMessage::Error {
                message: format!("invalid message: {e}"),
            }),
        };

        if let Some(reply) = reply {
            if out_tx.send(reply).await.is_err() {
                break;
            }
        }
    }

    membership.clear();
    drop(out_tx);
    writer.abort();
    info!(connection, "Stream client disconnected");
}

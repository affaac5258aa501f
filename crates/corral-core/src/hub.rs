//! Accepts observer WebSocket connections, tracks room membership, and
//! fans out `DashboardEvent`s with room-based filtering.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use corral_db::models::Claim;
use corral_db::storage::ClaimsStorage;

use crate::events::{event_rooms, DashboardEvent};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(60);

/// Frames sent from an observer to the hub.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    Subscribe { rooms: Vec<String> },
    Unsubscribe { rooms: Vec<String> },
    Ping,
}

/// Frames sent from the hub to an observer.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    Snapshot { claims: Vec<Claim> },
    Event { event: DashboardEvent },
    Pong,
    Ping,
    Error { code: String, message: String },
}

struct Connection {
    sender: mpsc::UnboundedSender<ServerFrame>,
    last_ping: Instant,
}

#[derive(Default)]
struct HubState {
    next_conn_id: u64,
    connections: HashMap<u64, Connection>,
    rooms: HashMap<String, HashSet<u64>>,
    conn_rooms: HashMap<u64, HashSet<String>>,
}

impl HubState {
    fn join(&mut self, conn_id: u64, room: &str) -> bool {
        let newly_joined = self
            .conn_rooms
            .entry(conn_id)
            .or_default()
            .insert(room.to_string());
        if newly_joined {
            self.rooms.entry(room.to_string()).or_default().insert(conn_id);
        }
        newly_joined
    }

    fn leave(&mut self, conn_id: u64, room: &str) {
        if let Some(set) = self.conn_rooms.get_mut(&conn_id) {
            set.remove(room);
        }
        if let Some(set) = self.rooms.get_mut(room) {
            set.remove(&conn_id);
        }
    }

    fn remove_connection(&mut self, conn_id: u64) {
        if let Some(rooms) = self.conn_rooms.remove(&conn_id) {
            for room in rooms {
                if let Some(set) = self.rooms.get_mut(&room) {
                    set.remove(&conn_id);
                }
            }
        }
        self.connections.remove(&conn_id);
    }
}

/// Room membership tracker and event broadcaster.
#[derive(Clone)]
pub struct SubscriptionHub {
    state: Arc<Mutex<HubState>>,
    storage: Arc<dyn ClaimsStorage>,
}

impl SubscriptionHub {
    pub fn new(storage: Arc<dyn ClaimsStorage>) -> Self {
        Self {
            state: Arc::new(Mutex::new(HubState::default())),
            storage,
        }
    }

    /// Start the heartbeat loop. Intended to be spawned once for the
    /// lifetime of the service.
    pub async fn run_heartbeat(&self) {
        let mut ticker = tokio::time::interval(HEARTBEAT_INTERVAL);
        loop {
            ticker.tick().await;
            self.sweep_connections().await;
        }
    }

    async fn sweep_connections(&self) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let mut timed_out = Vec::new();
        for (&id, conn) in state.connections.iter() {
            if now.duration_since(conn.last_ping) > HEARTBEAT_TIMEOUT {
                timed_out.push(id);
            } else {
                let _ = conn.sender.send(ServerFrame::Ping);
            }
        }
        for id in timed_out {
            debug!(conn_id = id, "closing connection: heartbeat timeout");
            state.remove_connection(id);
        }
    }

    /// Broadcast a `DashboardEvent` to every connection subscribed to one of
    /// its target rooms, deduplicated.
    pub async fn broadcast(&self, event: DashboardEvent) {
        let rooms = event_rooms(&event);
        let state = self.state.lock().await;

        let mut targets: HashSet<u64> = HashSet::new();
        for room in &rooms {
            if let Some(members) = state.rooms.get(room) {
                targets.extend(members.iter().copied());
            }
        }

        let frame = ServerFrame::Event { event };
        for conn_id in targets {
            if let Some(conn) = state.connections.get(&conn_id) {
                if conn.sender.send(frame.clone()).is_err() {
                    warn!(conn_id, "failed to deliver event to connection, dropping silently");
                }
            }
        }
    }

    async fn register(&self) -> (u64, mpsc::UnboundedReceiver<ServerFrame>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut state = self.state.lock().await;
        let conn_id = state.next_conn_id;
        state.next_conn_id += 1;
        state.connections.insert(
            conn_id,
            Connection {
                sender: tx,
                last_ping: Instant::now(),
            },
        );
        (conn_id, rx)
    }

    async fn handle_message(&self, conn_id: u64, raw: ClientMessage) -> Option<ServerFrame> {
        match raw {
            ClientMessage::Ping => {
                let mut state = self.state.lock().await;
                if let Some(conn) = state.connections.get_mut(&conn_id) {
                    conn.last_ping = Instant::now();
                }
                Some(ServerFrame::Pong)
            }
            ClientMessage::Subscribe { rooms } => {
                let mut board_joined = false;
                {
                    let mut state = self.state.lock().await;
                    for room in &rooms {
                        if state.join(conn_id, room) && room == "board" {
                            board_joined = true;
                        }
                    }
                }
                if board_joined {
                    let claims = self
                        .storage
                        .list_claims(&corral_db::models::ClaimFilter::default())
                        .await
                        .unwrap_or_default();
                    Some(ServerFrame::Snapshot { claims })
                } else {
                    None
                }
            }
            ClientMessage::Unsubscribe { rooms } => {
                let mut state = self.state.lock().await;
                for room in &rooms {
                    state.leave(conn_id, room);
                }
                None
            }
        }
    }

    async fn disconnect(&self, conn_id: u64) {
        self.state.lock().await.remove_connection(conn_id);
    }
}

/// Axum handler: `GET /api/ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(hub): State<SubscriptionHub>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, hub))
}

async fn handle_socket(socket: WebSocket, hub: SubscriptionHub) {
    let (mut sink, mut stream) = socket.split();
    let (conn_id, mut rx) = hub.register().await;

    // Single writer task: every outbound frame (broadcast, pong, snapshot,
    // error) flows through this channel so publishers never touch the
    // socket directly.
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            let text = match serde_json::to_string(&frame) {
                Ok(t) => t,
                Err(_) => continue,
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
    });

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            _ => continue,
        };

        let frame = match serde_json::from_str::<ClientMessage>(&text) {
            Ok(parsed) => hub.handle_message(conn_id, parsed).await,
            Err(_) => Some(ServerFrame::Error {
                code: "INVALID_MESSAGE".to_string(),
                message: "could not parse client frame".to_string(),
            }),
        };

        if let Some(frame) = frame {
            let state = hub.state.lock().await;
            if let Some(conn) = state.connections.get(&conn_id) {
                let _ = conn.sender.send(frame);
            }
        }
    }

    hub.disconnect(conn_id).await;
    writer.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_reports_only_new_rooms() {
        let mut state = HubState::default();
        assert!(state.join(1, "board"));
        assert!(!state.join(1, "board"));
        assert!(state.join(1, "logs"));
    }

    #[test]
    fn remove_connection_clears_all_room_memberships() {
        let mut state = HubState::default();
        state.connections.insert(
            1,
            Connection {
                sender: mpsc::unbounded_channel().0,
                last_ping: Instant::now(),
            },
        );
        state.join(1, "board");
        state.join(1, "logs");
        state.remove_connection(1);

        assert!(state.rooms.get("board").map(|s| s.is_empty()).unwrap_or(true));
        assert!(state.rooms.get("logs").map(|s| s.is_empty()).unwrap_or(true));
        assert!(!state.connections.contains_key(&1));
    }
}

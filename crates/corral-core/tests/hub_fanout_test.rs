//! End-to-end room fan-out over real WebSocket connections: two observers
//! join different rooms against a live `SubscriptionHub`, and a broadcast
//! event must reach only the connections whose rooms it targets.

use std::sync::Arc;
use std::time::Duration;

use axum::routing::get;
use axum::Router;
use futures::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message as WsMessage;

use corral_core::events::DashboardEvent;
use corral_core::hub::{ws_handler, ServerFrame, SubscriptionHub};
use corral_db::storage::InMemoryClaimsStorage;

async fn spawn_hub_server() -> (std::net::SocketAddr, SubscriptionHub) {
    let storage = Arc::new(InMemoryClaimsStorage::new());
    let hub = SubscriptionHub::new(storage);

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .with_state(hub.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    (addr, hub)
}

async fn connect_and_subscribe(
    addr: std::net::SocketAddr,
    rooms: Vec<&str>,
) -> tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>> {
    let url = format!("ws://{addr}/ws");
    let (mut ws, _) = tokio_tungstenite::connect_async(url).await.expect("connect");

    let msg = serde_json::json!({
        "action": "subscribe",
        "rooms": rooms,
    });
    ws.send(WsMessage::Text(msg.to_string().into())).await.unwrap();

    ws
}

async fn recv_frame_with_timeout(
    ws: &mut tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>,
    timeout: Duration,
) -> Option<ServerFrame> {
    let result = tokio::time::timeout(timeout, ws.next()).await.ok()??;
    let msg = result.ok()?;
    match msg {
        WsMessage::Text(text) => serde_json::from_str(&text).ok(),
        _ => None,
    }
}

#[tokio::test]
async fn events_are_delivered_only_to_connections_in_matching_rooms() {
    let (addr, hub) = spawn_hub_server().await;

    let mut observer_a = connect_and_subscribe(addr, vec!["board"]).await;
    let mut observer_b = connect_and_subscribe(addr, vec!["agent:coder-xyz123"]).await;

    // Each subscribe to "board" triggers a snapshot frame; drain it before
    // asserting on the broadcast events that follow.
    let snapshot = recv_frame_with_timeout(&mut observer_a, Duration::from_secs(2)).await;
    assert!(matches!(snapshot, Some(ServerFrame::Snapshot { .. })));

    // Give the server a moment to finish registering both subscriptions
    // before broadcasting.
    tokio::time::sleep(Duration::from_millis(100)).await;

    let claim = corral_db::models::Claim {
        id: uuid::Uuid::new_v4(),
        issue_id: "T-1".to_string(),
        source: corral_db::models::ClaimSource::Manual,
        source_ref: None,
        title: "fix the thing".to_string(),
        description: None,
        status: corral_db::models::ClaimStatus::Backlog,
        claimant: None,
        progress: 0,
        context: None,
        metadata: None,
        created_at: chrono::Utc::now(),
        updated_at: chrono::Utc::now(),
    };
    hub.broadcast(DashboardEvent::ClaimUpdated {
        claim,
        changes: vec!["status".to_string()],
    })
    .await;

    let a_frame = recv_frame_with_timeout(&mut observer_a, Duration::from_secs(2)).await;
    assert!(
        matches!(a_frame, Some(ServerFrame::Event { event: DashboardEvent::ClaimUpdated { .. } })),
        "observer subscribed to board should receive the claim.updated event"
    );

    let b_frame = recv_frame_with_timeout(&mut observer_b, Duration::from_millis(300)).await;
    assert!(
        b_frame.is_none(),
        "observer subscribed only to an unrelated agent room should not receive the claim event"
    );

    hub.broadcast(DashboardEvent::AgentLog {
        agent_id: "coder-xyz123".to_string(),
        level: corral_core::events::LogLevel::Info,
        message: "working".to_string(),
        timestamp: chrono::Utc::now(),
    })
    .await;

    let b_frame = recv_frame_with_timeout(&mut observer_b, Duration::from_secs(2)).await;
    assert!(
        matches!(b_frame, Some(ServerFrame::Event { event: DashboardEvent::AgentLog { .. } })),
        "observer subscribed to the agent room should receive the agent.log event"
    );

    let a_frame = recv_frame_with_timeout(&mut observer_a, Duration::from_millis(300)).await;
    assert!(
        a_frame.is_none(),
        "observer subscribed only to board should not receive an unrelated agent event"
    );
}

#[tokio::test]
async fn observer_subscribed_to_both_rooms_receives_each_event_exactly_once() {
    let (addr, hub) = spawn_hub_server().await;

    let mut observer = connect_and_subscribe(addr, vec!["board", "logs"]).await;
    let snapshot = recv_frame_with_timeout(&mut observer, Duration::from_secs(2)).await;
    assert!(matches!(snapshot, Some(ServerFrame::Snapshot { .. })));

    tokio::time::sleep(Duration::from_millis(100)).await;

    hub.broadcast(DashboardEvent::AgentStarted {
        agent_id: "coder-abc123".to_string(),
        agent_type: "coder".to_string(),
        issue_id: Some("T-2".to_string()),
    })
    .await;

    let frame = recv_frame_with_timeout(&mut observer, Duration::from_secs(2)).await;
    assert!(matches!(
        frame,
        Some(ServerFrame::Event { event: DashboardEvent::AgentStarted { .. } })
    ));

    // No duplicate delivery: "logs" and "board" both joined by this single
    // connection, but the broadcast set is deduplicated per-connection.
    let duplicate = recv_frame_with_timeout(&mut observer, Duration::from_millis(300)).await;
    assert!(duplicate.is_none(), "event should be delivered exactly once, not once per matching room");
}

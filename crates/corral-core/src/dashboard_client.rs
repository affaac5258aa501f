//! Outbound client for the dashboard API: CRUD over HTTP plus a resilient
//! WebSocket subscription to `/api/ws`, reconnecting with backoff.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use rand::Rng;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, Notify};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{debug, error, warn};
use uuid::Uuid;

use corral_db::models::{Claim, ClaimFilter, ClaimPatch, NewClaim};

use crate::hub::{ClientMessage, ServerFrame};

const RECONNECT_BASE_DELAY: Duration = Duration::from_millis(500);
const RECONNECT_MAX_DELAY: Duration = Duration::from_secs(30);
const RECONNECT_JITTER_FRACTION: f64 = 0.3;
const MAX_RECONNECT_ATTEMPTS: u32 = 10;
const CONNECT_DEADLINE: Duration = Duration::from_secs(10);

#[derive(Debug, Error)]
pub enum DashboardError {
    #[error("dashboard request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("dashboard returned an error status: {status}: {body}")]
    Status { status: u16, body: String },
    #[error("websocket connection failed: {0}")]
    WebSocket(#[source] tokio_tungstenite::tungstenite::Error),
    #[error("malformed server frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct DashboardClientConfig {
    pub base_url: String,
    pub ws_url: String,
}

/// Exponential backoff with jitter, capped at `RECONNECT_MAX_DELAY`:
/// `base * 2^n + uniform(0, 0.3 * base * 2^n)`.
fn backoff_delay(attempt: u32) -> Duration {
    let exp = RECONNECT_BASE_DELAY.as_millis() as f64 * 2f64.powi(attempt as i32);
    let capped = exp.min(RECONNECT_MAX_DELAY.as_millis() as f64);
    let jitter = rand::thread_rng().gen_range(0.0..=(capped * RECONNECT_JITTER_FRACTION));
    Duration::from_millis((capped + jitter) as u64)
}

/// HTTP CRUD client plus a WebSocket observer connection, both talking to
/// the same dashboard service an `Orchestrator` drives claim state through.
#[derive(Clone)]
pub struct DashboardClient {
    config: DashboardClientConfig,
    http: reqwest::Client,
    outbound: Arc<Mutex<Option<mpsc::UnboundedSender<ClientMessage>>>>,
    shutdown: Arc<Notify>,
    reconnect_attempts: Arc<AtomicU32>,
}

impl DashboardClient {
    pub fn new(config: DashboardClientConfig) -> Self {
        Self {
            config,
            http: reqwest::Client::new(),
            outbound: Arc::new(Mutex::new(None)),
            shutdown: Arc::new(Notify::new()),
            reconnect_attempts: Arc::new(AtomicU32::new(0)),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url, path)
    }

    async fn check_status(response: reqwest::Response) -> Result<reqwest::Response, DashboardError> {
        if response.status().is_success() {
            Ok(response)
        } else {
            let status = response.status().as_u16();
            let body = response.text().await.unwrap_or_default();
            Err(DashboardError::Status { status, body })
        }
    }

    pub async fn create_claim(&self, claim: &NewClaim) -> Result<Claim, DashboardError> {
        let body = serde_json::json!({
            "issue_id": claim.issue_id,
            "source": claim.source.to_string(),
            "source_ref": claim.source_ref,
            "title": claim.title,
            "description": claim.description,
            "context": claim.context,
            "metadata": claim.metadata,
        });
        let response = self
            .http
            .post(self.url("/api/claims"))
            .json(&body)
            .send()
            .await
            .map_err(DashboardError::Http)?;
        let response = Self::check_status(response).await?;
        response.json().await.map_err(DashboardError::Http)
    }

    /// `FetchClaim(id) -> Claim | null` (spec §4.2/§8): a 404 is not an
    /// error, it means the claim no longer exists.
    pub async fn get_claim(&self, id: Uuid) -> Result<Option<Claim>, DashboardError> {
        let response = self
            .http
            .get(self.url(&format!("/api/claims/{id}")))
            .send()
            .await
            .map_err(DashboardError::Http)?;
        if response.status().as_u16() == 404 {
            return Ok(None);
        }
        let response = Self::check_status(response).await?;
        response.json().await.map(Some).map_err(DashboardError::Http)
    }

    pub async fn list_claims(&self, filter: &ClaimFilter) -> Result<Vec<Claim>, DashboardError> {
        let mut query: Vec<(&str, String)> = Vec::new();
        for status in &filter.status {
            query.push(("status", status.to_string()));
        }
        if let Some(source) = filter.source {
            query.push(("source", source.to_string()));
        }
        if let Some(ref claimant_type) = filter.claimant_type {
            query.push(("claimant_type", claimant_type.clone()));
        }

        let response = self
            .http
            .get(self.url("/api/claims"))
            .query(&query)
            .send()
            .await
            .map_err(DashboardError::Http)?;
        let response = Self::check_status(response).await?;
        response.json().await.map_err(DashboardError::Http)
    }

    pub async fn patch_claim(&self, id: Uuid, patch: &ClaimPatch) -> Result<Claim, DashboardError> {
        let body = serde_json::json!({
            "status": patch.status.map(|s| s.to_string()),
            "progress": patch.progress,
            "claimant": patch.claimant,
            "context": patch.context,
            "metadata": patch.metadata,
        });
        let response = self
            .http
            .patch(self.url(&format!("/api/claims/{id}")))
            .json(&body)
            .send()
            .await
            .map_err(DashboardError::Http)?;
        let response = Self::check_status(response).await?;
        response.json().await.map_err(DashboardError::Http)
    }

    pub async fn claim_issue(&self, id: Uuid, agent_id: &str) -> Result<Claim, DashboardError> {
        let response = self
            .http
            .post(self.url(&format!("/api/claims/{id}/claim")))
            .json(&serde_json::json!({ "agent_id": agent_id }))
            .send()
            .await
            .map_err(DashboardError::Http)?;
        let response = Self::check_status(response).await?;
        response.json().await.map_err(DashboardError::Http)
    }

    pub async fn release_claim(&self, id: Uuid) -> Result<Claim, DashboardError> {
        let response = self
            .http
            .post(self.url(&format!("/api/claims/{id}/release")))
            .send()
            .await
            .map_err(DashboardError::Http)?;
        let response = Self::check_status(response).await?;
        response.json().await.map_err(DashboardError::Http)
    }

    /// Connect the observer WebSocket. Only the initial handshake is bounded
    /// by the 10 s deadline and rejects through the returned `Result`; once
    /// established, the read loop and every subsequent reconnect run in a
    /// background task, with disconnects handled silently by backoff and
    /// jitter capped at `MAX_RECONNECT_ATTEMPTS` before the client gives up
    /// for good. The returned receiver yields every `ServerFrame` delivered
    /// for the lifetime of the connection.
    pub async fn connect(&self) -> Result<mpsc::UnboundedReceiver<ServerFrame>, DashboardError> {
        let (inbound_tx, inbound_rx) = mpsc::unbounded_channel();

        let ws_stream = match tokio::time::timeout(
            CONNECT_DEADLINE,
            tokio_tungstenite::connect_async(&self.config.ws_url),
        )
        .await
        {
            Ok(Ok((stream, _))) => stream,
            Ok(Err(err)) => return Err(DashboardError::WebSocket(err)),
            Err(_) => {
                return Err(DashboardError::WebSocket(
                    tokio_tungstenite::tungstenite::Error::Io(std::io::Error::new(
                        std::io::ErrorKind::TimedOut,
                        "dashboard websocket connect timed out",
                    )),
                ));
            }
        };

        debug!("dashboard websocket connected");

        let client = self.clone();
        tokio::spawn(async move {
            client.run_stream(ws_stream, inbound_tx.clone()).await;

            // Every iteration from here represents one reconnect: wait out
            // the backoff, then try again.
            loop {
                let attempt = client.reconnect_attempts.load(Ordering::SeqCst);
                if attempt >= MAX_RECONNECT_ATTEMPTS {
                    error!(attempts = attempt, "dashboard websocket exhausted reconnect attempts, giving up");
                    break;
                }

                let delay = backoff_delay(attempt);
                warn!(attempt, delay_ms = delay.as_millis() as u64, "dashboard websocket disconnected, reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = client.shutdown.notified() => break,
                }

                let connected = tokio::select! {
                    result = client.run_connection_once(inbound_tx.clone()) => result,
                    _ = client.shutdown.notified() => break,
                };

                if connected {
                    client.reconnect_attempts.store(0, Ordering::SeqCst);
                } else {
                    client.reconnect_attempts.fetch_add(1, Ordering::SeqCst);
                }
            }
        });

        Ok(inbound_rx)
    }

    /// Returns `true` if the connection was established and ran to a clean
    /// or error-terminated close (worth reconnecting); `false` only if the
    /// initial connect attempt itself failed.
    async fn run_connection_once(&self, inbound_tx: mpsc::UnboundedSender<ServerFrame>) -> bool {
        let ws_stream = match tokio_tungstenite::connect_async(&self.config.ws_url).await {
            Ok((stream, _)) => stream,
            Err(err) => {
                error!(error = %err, "failed to connect dashboard websocket");
                return false;
            }
        };

        debug!("dashboard websocket connected");
        self.run_stream(ws_stream, inbound_tx).await;
        true
    }

    /// Drive a single already-established connection's writer + reader
    /// loops until the socket closes or errors.
    async fn run_stream(
        &self,
        ws_stream: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        inbound_tx: mpsc::UnboundedSender<ServerFrame>,
    ) {
        let (mut sink, mut stream) = ws_stream.split();
        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ClientMessage>();
        *self.outbound.lock().await = Some(outbound_tx);

        let writer = tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                let Ok(text) = serde_json::to_string(&msg) else {
                    continue;
                };
                if sink.send(WsMessage::Text(text.into())).await.is_err() {
                    break;
                }
            }
        });

        while let Some(Ok(msg)) = stream.next().await {
            let text = match msg {
                WsMessage::Text(t) => t,
                WsMessage::Close(_) => break,
                _ => continue,
            };
            match serde_json::from_str::<ServerFrame>(&text) {
                Ok(frame) => {
                    if inbound_tx.send(frame).is_err() {
                        break;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "dropping malformed server frame");
                }
            }
        }

        *self.outbound.lock().await = None;
        writer.abort();
    }

    /// Subscribe to a set of rooms on the current connection. A no-op if
    /// the socket is currently disconnected; the subscription is not
    /// replayed automatically on reconnect.
    pub async fn subscribe(&self, rooms: Vec<String>) {
        if let Some(tx) = self.outbound.lock().await.as_ref() {
            let _ = tx.send(ClientMessage::Subscribe { rooms });
        }
    }

    pub async fn unsubscribe(&self, rooms: Vec<String>) {
        if let Some(tx) = self.outbound.lock().await.as_ref() {
            let _ = tx.send(ClientMessage::Unsubscribe { rooms });
        }
    }

    pub fn disconnect(&self) {
        self.shutdown.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let d0 = backoff_delay(0);
        let d5 = backoff_delay(5);
        let d20 = backoff_delay(20);
        assert!(d0.as_millis() >= RECONNECT_BASE_DELAY.as_millis());
        assert!(d5 > d0);
        assert!(d20.as_millis() as u64 <= (RECONNECT_MAX_DELAY.as_millis() as f64 * (1.0 + RECONNECT_JITTER_FRACTION)) as u64);
    }

    #[test]
    fn backoff_never_exceeds_capped_plus_jitter() {
        for attempt in 0..30 {
            let d = backoff_delay(attempt);
            let ceiling = (RECONNECT_MAX_DELAY.as_millis() as f64 * (1.0 + RECONNECT_JITTER_FRACTION)) as u128;
            assert!(d.as_millis() <= ceiling);
        }
    }
}

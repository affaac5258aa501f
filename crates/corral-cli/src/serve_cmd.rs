//! `corral serve`: the dashboard service itself — claim CRUD plus the
//! observer WebSocket hub, exercising `EventAggregator` and
//! `SubscriptionHub` end-to-end without a live orchestrator.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::Result;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use tower_http::cors::CorsLayer;
use uuid::Uuid;

use corral_core::aggregator::{EventAggregator, WorkerHook};
use corral_core::events::DashboardEvent;
use corral_core::hub::{ws_handler, SubscriptionHub};
use corral_db::models::{Claim, ClaimFilter, ClaimPatch, Claimant, NewClaim};
use corral_db::pool;
use corral_db::storage::{ClaimsStorage, InMemoryClaimsStorage, PgClaimsStorage, StorageEvent};

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

pub struct AppError {
    status: StatusCode,
    message: String,
}

impl AppError {
    fn not_found(msg: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: msg.into(),
        }
    }

    fn internal(err: anyhow::Error) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: format!("{err:#}"),
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let body = serde_json::json!({ "error": self.message });
        (self.status, Json(body)).into_response()
    }
}

// ---------------------------------------------------------------------------
// Request DTOs
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ClaimQuery {
    status: Option<String>,
    source: Option<String>,
    claimant_type: Option<String>,
}

impl ClaimQuery {
    fn into_filter(self) -> ClaimFilter {
        ClaimFilter {
            status: self
                .status
                .and_then(|s| s.parse().ok())
                .into_iter()
                .collect(),
            source: self.source.and_then(|s| s.parse().ok()),
            claimant_type: self.claimant_type,
        }
    }
}

#[derive(Debug, Deserialize)]
struct ClaimIssueRequest {
    agent_id: String,
}

// ---------------------------------------------------------------------------
// Router
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct AppState {
    storage: Arc<dyn ClaimsStorage>,
    aggregator: EventAggregator,
    hub: SubscriptionHub,
}

impl axum::extract::FromRef<AppState> for SubscriptionHub {
    fn from_ref(state: &AppState) -> Self {
        state.hub.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/claims", get(list_claims).post(create_claim))
        .route("/api/claims/{id}", get(get_claim_handler).patch(patch_claim_handler))
        .route("/api/claims/{id}/claim", post(claim_issue_handler))
        .route("/api/claims/{id}/release", post(release_claim_handler))
        .route("/api/hooks/agent", post(worker_hook_handler))
        .route("/api/ws", get(ws_handler))
        .layer(CorsLayer::permissive())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Entry point
// ---------------------------------------------------------------------------

/// Resolve storage (Postgres if `DATABASE_URL` is set, else in-memory), wire
/// the storage -> aggregator -> hub event chain, and serve until shutdown.
pub async fn run(bind_flag: Option<String>) -> Result<()> {
    let storage: Arc<dyn ClaimsStorage> = if std::env::var("DATABASE_URL").is_ok() {
        let db_config = crate::config::db_config_from_env();
        pool::ensure_database_exists(&db_config).await?;
        let db_pool = pool::create_pool(&db_config).await?;
        pool::run_migrations(&db_pool).await?;
        Arc::new(PgClaimsStorage::new(db_pool))
    } else {
        tracing::warn!("DATABASE_URL not set, falling back to an in-memory claims store");
        Arc::new(InMemoryClaimsStorage::new())
    };

    let aggregator = EventAggregator::new();
    let hub = SubscriptionHub::new(Arc::clone(&storage));
    wire_events(&storage, &aggregator, &hub).await;

    let heartbeat_hub = hub.clone();
    tokio::spawn(async move {
        heartbeat_hub.run_heartbeat().await;
    });

    let bind = bind_flag.unwrap_or_else(crate::config::bind_addr);
    let addr: SocketAddr = bind.parse()?;
    let app = build_router(AppState {
        storage,
        aggregator,
        hub,
    });

    tracing::info!("corral serve listening on http://{addr}");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;
    tracing::info!("corral serve shut down");
    Ok(())
}

async fn shutdown_signal() {
    tokio::signal::ctrl_c()
        .await
        .expect("failed to install Ctrl+C handler");
}

/// Bridge the synchronous `ClaimsStorage`/`EventAggregator` listener
/// callbacks to their async consumers by spawning a task per delivery.
async fn wire_events(storage: &Arc<dyn ClaimsStorage>, aggregator: &EventAggregator, hub: &SubscriptionHub) {
    let agg_for_storage = aggregator.clone();
    let _unsubscribe = storage
        .subscribe(Box::new(move |event: &StorageEvent| {
            let agg = agg_for_storage.clone();
            let event = event.clone();
            tokio::spawn(async move {
                agg.handle_storage_event(event).await;
            });
        }))
        .await;

    let hub_for_aggregator = hub.clone();
    aggregator
        .add_listener(Box::new(move |event: &DashboardEvent| {
            let hub = hub_for_aggregator.clone();
            let event = event.clone();
            tokio::spawn(async move {
                hub.broadcast(event).await;
            });
        }))
        .await;
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

async fn list_claims(
    State(state): State<AppState>,
    Query(query): Query<ClaimQuery>,
) -> Result<axum::response::Response, AppError> {
    let filter = query.into_filter();
    let claims = state
        .storage
        .list_claims(&filter)
        .await
        .map_err(AppError::internal)?;
    Ok(Json(claims).into_response())
}

async fn get_claim_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let claim = state
        .storage
        .get_claim(id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("claim {id} not found")))?;
    Ok(Json(claim).into_response())
}

async fn create_claim(
    State(state): State<AppState>,
    Json(data): Json<NewClaim>,
) -> Result<axum::response::Response, AppError> {
    let claim: Claim = state
        .storage
        .create_claim(&data)
        .await
        .map_err(AppError::internal)?;
    Ok((StatusCode::CREATED, Json(claim)).into_response())
}

async fn patch_claim_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(patch): Json<ClaimPatch>,
) -> Result<axum::response::Response, AppError> {
    let claim = state
        .storage
        .update_claim(id, &patch)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("claim {id} not found")))?;
    Ok(Json(claim).into_response())
}

async fn claim_issue_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ClaimIssueRequest>,
) -> Result<axum::response::Response, AppError> {
    let claimant = Claimant::Agent {
        agent_id: body.agent_id,
        // The wire protocol (see DashboardClient::claim_issue) carries only
        // agent_id; agent_type is not round-tripped over HTTP.
        agent_type: "agent".to_string(),
    };
    let claim = state
        .storage
        .claim_issue(id, &claimant)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("claim {id} not found")))?;
    Ok(Json(claim).into_response())
}

async fn release_claim_handler(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> Result<axum::response::Response, AppError> {
    let claim = state
        .storage
        .release_claim(id)
        .await
        .map_err(AppError::internal)?
        .ok_or_else(|| AppError::not_found(format!("claim {id} not found")))?;
    Ok(Json(claim).into_response())
}

async fn worker_hook_handler(
    State(state): State<AppState>,
    Json(hook): Json<WorkerHook>,
) -> impl IntoResponse {
    state.aggregator.handle_worker_hook(hook).await;
    StatusCode::ACCEPTED
}

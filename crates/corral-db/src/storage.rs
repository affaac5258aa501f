//! The `ClaimsStorage` contract and its Postgres reference implementation.
//!
//! `ClaimsStorage` is the persistence seam the rest of the workspace
//! consumes: CRUD for claims plus a change-event feed. Schema detail beyond
//! this contract is intentionally out of scope, so `PgClaimsStorage` backs
//! onto a single thin `claims` table and nothing else.

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

use crate::models::{Claim, ClaimFilter, ClaimPatch, Claimant, NewClaim};
use crate::queries::claims as q;

/// A change to a claim, delivered to every registered listener.
#[derive(Debug, Clone)]
pub enum StorageEvent {
    Created { claim: Claim },
    Updated { claim: Claim, changes: Vec<String> },
    Deleted { issue_id: String },
}

/// CRUD + change-feed contract for claim persistence.
///
/// Lookups/mutations key on the opaque internal `id`, matching the HTTP
/// surface (`/api/claims/:id`) and `DashboardClient`; `get_claim_by_issue_id`
/// is the separate external-facing lookup (spec.md §3's `issueId`).
#[async_trait]
pub trait ClaimsStorage: Send + Sync {
    async fn get_claim(&self, id: Uuid) -> Result<Option<Claim>>;
    async fn get_claim_by_issue_id(&self, issue_id: &str) -> Result<Option<Claim>>;
    async fn list_claims(&self, filter: &ClaimFilter) -> Result<Vec<Claim>>;
    async fn create_claim(&self, data: &NewClaim) -> Result<Claim>;
    async fn update_claim(&self, id: Uuid, patch: &ClaimPatch) -> Result<Option<Claim>>;
    async fn claim_issue(&self, id: Uuid, claimant: &Claimant) -> Result<Option<Claim>>;
    async fn release_claim(&self, id: Uuid) -> Result<Option<Claim>>;
    async fn delete_claim(&self, id: Uuid) -> Result<bool>;

    /// Register a listener for storage change events. Returns an
    /// unsubscribe handle; dropping it does nothing by itself — call
    /// `unsubscribe()` explicitly, mirroring the aggregator's own
    /// listener-set pattern.
    async fn subscribe(&self, listener: StorageListener) -> Unsubscribe;
}

pub type StorageListener = Box<dyn Fn(&StorageEvent) + Send + Sync>;

/// Handle returned by `subscribe`. Calling `unsubscribe` removes the
/// listener; safe to call more than once.
pub struct Unsubscribe {
    id: u64,
    listeners: Arc<RwLock<Vec<(u64, StorageListener)>>>,
}

impl Unsubscribe {
    pub async fn unsubscribe(&self) {
        let mut guard = self.listeners.write().await;
        guard.retain(|(id, _)| *id != self.id);
    }
}

/// Postgres-backed `ClaimsStorage`.
pub struct PgClaimsStorage {
    pool: PgPool,
    listeners: Arc<RwLock<Vec<(u64, StorageListener)>>>,
    next_id: std::sync::atomic::AtomicU64,
}

impl PgClaimsStorage {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    async fn emit(&self, event: StorageEvent) {
        let guard = self.listeners.read().await;
        for (_, listener) in guard.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&event);
            }));
            if result.is_err() {
                warn!("storage event listener panicked; continuing delivery to remaining listeners");
            }
        }
    }
}

#[async_trait]
impl ClaimsStorage for PgClaimsStorage {
    async fn get_claim(&self, id: Uuid) -> Result<Option<Claim>> {
        q::get_claim(&self.pool, id).await
    }

    async fn get_claim_by_issue_id(&self, issue_id: &str) -> Result<Option<Claim>> {
        q::get_claim_by_issue_id(&self.pool, issue_id).await
    }

    async fn list_claims(&self, filter: &ClaimFilter) -> Result<Vec<Claim>> {
        q::list_claims(&self.pool, filter).await
    }

    async fn create_claim(&self, data: &NewClaim) -> Result<Claim> {
        let claim = q::insert_claim(&self.pool, data).await?;
        self.emit(StorageEvent::Created {
            claim: claim.clone(),
        })
        .await;
        Ok(claim)
    }

    async fn update_claim(&self, id: Uuid, patch: &ClaimPatch) -> Result<Option<Claim>> {
        let updated = q::patch_claim(&self.pool, id, patch).await?;
        if let Some(ref claim) = updated {
            let changes = changed_fields(patch);
            self.emit(StorageEvent::Updated {
                claim: claim.clone(),
                changes,
            })
            .await;
        }
        Ok(updated)
    }

    async fn claim_issue(&self, id: Uuid, claimant: &Claimant) -> Result<Option<Claim>> {
        let updated = q::claim_issue(&self.pool, id, claimant).await?;
        if let Some(ref claim) = updated {
            self.emit(StorageEvent::Updated {
                claim: claim.clone(),
                changes: vec!["status".to_string(), "claimant".to_string()],
            })
            .await;
        }
        Ok(updated)
    }

    async fn release_claim(&self, id: Uuid) -> Result<Option<Claim>> {
        let updated = q::release_claim(&self.pool, id).await?;
        if let Some(ref claim) = updated {
            self.emit(StorageEvent::Updated {
                claim: claim.clone(),
                changes: vec!["status".to_string(), "claimant".to_string()],
            })
            .await;
        }
        Ok(updated)
    }

    async fn delete_claim(&self, id: Uuid) -> Result<bool> {
        let existing = q::get_claim(&self.pool, id).await?;
        let deleted = q::delete_claim(&self.pool, id).await?;
        if deleted {
            if let Some(claim) = existing {
                self.emit(StorageEvent::Deleted {
                    issue_id: claim.issue_id,
                })
                .await;
            }
        }
        Ok(deleted)
    }

    async fn subscribe(&self, listener: StorageListener) -> Unsubscribe {
        let id = self
            .next_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.listeners.write().await.push((id, listener));
        Unsubscribe {
            id,
            listeners: Arc::clone(&self.listeners),
        }
    }
}

/// In-process `ClaimsStorage` used by `corral serve` when `DATABASE_URL` is
/// unset. Holds claims in a plain `Vec` guarded by a lock; the listener-set
/// and event-emission logic is shared with `PgClaimsStorage` byte-for-byte
/// in spirit, just without a pool to query.
pub struct InMemoryClaimsStorage {
    claims: RwLock<Vec<Claim>>,
    listeners: Arc<RwLock<Vec<(u64, StorageListener)>>>,
    next_claim_id: std::sync::atomic::AtomicU64,
    next_listener_id: std::sync::atomic::AtomicU64,
}

impl InMemoryClaimsStorage {
    pub fn new() -> Self {
        Self {
            claims: RwLock::new(Vec::new()),
            listeners: Arc::new(RwLock::new(Vec::new())),
            next_claim_id: std::sync::atomic::AtomicU64::new(0),
            next_listener_id: std::sync::atomic::AtomicU64::new(0),
        }
    }

    async fn emit(&self, event: StorageEvent) {
        let guard = self.listeners.read().await;
        for (_, listener) in guard.iter() {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| {
                listener(&event);
            }));
            if result.is_err() {
                warn!("storage event listener panicked; continuing delivery to remaining listeners");
            }
        }
    }
}

impl Default for InMemoryClaimsStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ClaimsStorage for InMemoryClaimsStorage {
    async fn get_claim(&self, id: Uuid) -> Result<Option<Claim>> {
        Ok(self.claims.read().await.iter().find(|c| c.id == id).cloned())
    }

    async fn get_claim_by_issue_id(&self, issue_id: &str) -> Result<Option<Claim>> {
        Ok(self
            .claims
            .read()
            .await
            .iter()
            .find(|c| c.issue_id == issue_id)
            .cloned())
    }

    async fn list_claims(&self, filter: &ClaimFilter) -> Result<Vec<Claim>> {
        let mut claims: Vec<Claim> = self
            .claims
            .read()
            .await
            .iter()
            .filter(|c| filter.status.is_empty() || filter.status.contains(&c.status))
            .filter(|c| filter.source.map(|s| s == c.source).unwrap_or(true))
            .filter(|c| {
                filter
                    .claimant_type
                    .as_deref()
                    .map(|want| match (&c.claimant, want) {
                        (Some(crate::models::Claimant::Human { .. }), "human") => true,
                        (Some(crate::models::Claimant::Agent { .. }), "agent") => true,
                        _ => false,
                    })
                    .unwrap_or(true)
            })
            .cloned()
            .collect();
        claims.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(claims)
    }

    async fn create_claim(&self, data: &NewClaim) -> Result<Claim> {
        let id = uuid::Uuid::new_v4();
        let now = chrono::Utc::now();
        let claim = Claim {
            id,
            issue_id: data.issue_id.clone(),
            source: data.source,
            source_ref: data.source_ref.clone(),
            title: data.title.clone(),
            description: data.description.clone(),
            status: crate::models::ClaimStatus::Backlog,
            claimant: None,
            progress: 0,
            context: data.context.clone(),
            metadata: data.metadata.clone(),
            created_at: now,
            updated_at: now,
        };
        self.claims.write().await.push(claim.clone());
        self.next_claim_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.emit(StorageEvent::Created {
            claim: claim.clone(),
        })
        .await;
        Ok(claim)
    }

    async fn update_claim(&self, id: Uuid, patch: &ClaimPatch) -> Result<Option<Claim>> {
        let updated = {
            let mut claims = self.claims.write().await;
            let Some(claim) = claims.iter_mut().find(|c| c.id == id) else {
                return Ok(None);
            };
            if let Some(status) = patch.status {
                claim.status = status;
            }
            if let Some(progress) = patch.progress {
                claim.progress = progress;
            }
            if let Some(ref claimant) = patch.claimant {
                claim.claimant = claimant.clone();
            }
            if let Some(ref context) = patch.context {
                claim.context = context.clone();
            }
            if let Some(ref metadata) = patch.metadata {
                claim.metadata = metadata.clone();
            }
            claim.updated_at = chrono::Utc::now();
            claim.clone()
        };

        let changes = changed_fields(patch);
        self.emit(StorageEvent::Updated {
            claim: updated.clone(),
            changes,
        })
        .await;
        Ok(Some(updated))
    }

    async fn claim_issue(&self, id: Uuid, claimant: &Claimant) -> Result<Option<Claim>> {
        let updated = {
            let mut claims = self.claims.write().await;
            let Some(claim) = claims.iter_mut().find(|c| c.id == id) else {
                return Ok(None);
            };
            claim.status = crate::models::ClaimStatus::Active;
            claim.claimant = Some(claimant.clone());
            claim.updated_at = chrono::Utc::now();
            claim.clone()
        };
        self.emit(StorageEvent::Updated {
            claim: updated.clone(),
            changes: vec!["status".to_string(), "claimant".to_string()],
        })
        .await;
        Ok(Some(updated))
    }

    async fn release_claim(&self, id: Uuid) -> Result<Option<Claim>> {
        let updated = {
            let mut claims = self.claims.write().await;
            let Some(claim) = claims.iter_mut().find(|c| c.id == id) else {
                return Ok(None);
            };
            claim.status = crate::models::ClaimStatus::Backlog;
            claim.claimant = None;
            claim.updated_at = chrono::Utc::now();
            claim.clone()
        };
        self.emit(StorageEvent::Updated {
            claim: updated.clone(),
            changes: vec!["status".to_string(), "claimant".to_string()],
        })
        .await;
        Ok(Some(updated))
    }

    async fn delete_claim(&self, id: Uuid) -> Result<bool> {
        let removed_issue_id = {
            let mut claims = self.claims.write().await;
            let before = claims.len();
            let removed_issue_id = claims.iter().find(|c| c.id == id).map(|c| c.issue_id.clone());
            claims.retain(|c| c.id != id);
            if claims.len() != before {
                removed_issue_id
            } else {
                None
            }
        };
        if let Some(issue_id) = removed_issue_id {
            self.emit(StorageEvent::Deleted { issue_id }).await;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn subscribe(&self, listener: StorageListener) -> Unsubscribe {
        let id = self
            .next_listener_id
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        self.listeners.write().await.push((id, listener));
        Unsubscribe {
            id,
            listeners: Arc::clone(&self.listeners),
        }
    }
}

fn changed_fields(patch: &ClaimPatch) -> Vec<String> {
    let mut fields = Vec::new();
    if patch.status.is_some() {
        fields.push("status".to_string());
    }
    if patch.progress.is_some() {
        fields.push("progress".to_string());
    }
    if patch.claimant.is_some() {
        fields.push("claimant".to_string());
    }
    if patch.context.is_some() {
        fields.push("context".to_string());
    }
    if patch.metadata.is_some() {
        fields.push("metadata".to_string());
    }
    fields
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn changed_fields_reports_only_set_fields() {
        let patch = ClaimPatch {
            status: Some(crate::models::ClaimStatus::Active),
            progress: None,
            claimant: None,
            context: None,
            metadata: None,
        };
        assert_eq!(changed_fields(&patch), vec!["status".to_string()]);
    }

    #[test]
    fn changed_fields_empty_for_empty_patch() {
        let patch = ClaimPatch::default();
        assert!(changed_fields(&patch).is_empty());
    }
}

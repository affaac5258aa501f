//! Integration tests for `PgClaimsStorage` against a real PostgreSQL
//! instance (provisioned by `corral_test_utils`, a fresh database per test).

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use sqlx::PgPool;

use corral_db::models::{ClaimFilter, ClaimPatch, Claimant, ClaimSource, ClaimStatus, NewClaim};
use corral_db::storage::{ClaimsStorage, PgClaimsStorage, StorageEvent};
use corral_test_utils::{create_test_db, drop_test_db};

struct TestDb {
    pool: PgPool,
    db_name: String,
}

impl TestDb {
    async fn new() -> Self {
        let (pool, db_name) = create_test_db().await;
        Self { pool, db_name }
    }

    async fn teardown(self) {
        self.pool.close().await;
        drop_test_db(&self.db_name).await;
    }
}

fn sample_claim(issue_id: &str) -> NewClaim {
    NewClaim {
        issue_id: issue_id.to_string(),
        source: ClaimSource::Github,
        source_ref: Some("owner/repo#42".to_string()),
        title: "Fix the thing".to_string(),
        description: Some("Details here".to_string()),
        context: None,
        metadata: None,
    }
}

#[tokio::test]
async fn create_and_get_claim_round_trips() {
    let db = TestDb::new().await;
    let storage = PgClaimsStorage::new(db.pool.clone());

    let created = storage
        .create_claim(&sample_claim("T-1"))
        .await
        .expect("create_claim should succeed");
    assert_eq!(created.status, ClaimStatus::Backlog);
    assert_eq!(created.progress, 0);
    assert!(created.claimant.is_none());

    let fetched = storage
        .get_claim(created.id)
        .await
        .expect("get_claim should succeed")
        .expect("claim should exist");
    assert_eq!(fetched.issue_id, "T-1");
    assert_eq!(fetched.title, "Fix the thing");

    let by_issue_id = storage
        .get_claim_by_issue_id("T-1")
        .await
        .expect("get_claim_by_issue_id should succeed")
        .expect("claim should exist");
    assert_eq!(by_issue_id.id, created.id);

    db.teardown().await;
}

#[tokio::test]
async fn get_claim_returns_none_for_missing_id() {
    let db = TestDb::new().await;
    let storage = PgClaimsStorage::new(db.pool.clone());

    let result = storage
        .get_claim(uuid::Uuid::new_v4())
        .await
        .expect("get_claim should not error");
    assert!(result.is_none());

    db.teardown().await;
}

#[tokio::test]
async fn list_claims_filters_by_status_and_source() {
    let db = TestDb::new().await;
    let storage = PgClaimsStorage::new(db.pool.clone());

    let a = storage.create_claim(&sample_claim("T-a")).await.unwrap();
    let b = storage.create_claim(&sample_claim("T-b")).await.unwrap();
    let mut manual = sample_claim("T-c");
    manual.source = ClaimSource::Manual;
    let c = storage.create_claim(&manual).await.unwrap();

    storage
        .update_claim(
            a.id,
            &ClaimPatch {
                status: Some(ClaimStatus::Active),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    let active_only = storage
        .list_claims(&ClaimFilter {
            status: vec![ClaimStatus::Active],
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(active_only.len(), 1);
    assert_eq!(active_only[0].id, a.id);

    let github_only = storage
        .list_claims(&ClaimFilter {
            source: Some(ClaimSource::Github),
            ..Default::default()
        })
        .await
        .unwrap();
    let github_ids: Vec<_> = github_only.iter().map(|c| c.id).collect();
    assert!(github_ids.contains(&a.id));
    assert!(github_ids.contains(&b.id));
    assert!(!github_ids.contains(&c.id));

    db.teardown().await;
}

#[tokio::test]
async fn claim_issue_then_release_round_trips_claimant() {
    let db = TestDb::new().await;
    let storage = PgClaimsStorage::new(db.pool.clone());

    let claim = storage.create_claim(&sample_claim("T-claim")).await.unwrap();

    let claimant = Claimant::Agent {
        agent_id: "coder-ab12cd".to_string(),
        agent_type: "coder".to_string(),
    };
    let claimed = storage
        .claim_issue(claim.id, &claimant)
        .await
        .expect("claim_issue should succeed")
        .expect("claim should exist");
    assert_eq!(claimed.status, ClaimStatus::Active);
    assert_eq!(claimed.claimant, Some(claimant));

    let released = storage
        .release_claim(claim.id)
        .await
        .expect("release_claim should succeed")
        .expect("claim should exist");
    assert_eq!(released.status, ClaimStatus::Backlog);
    assert!(released.claimant.is_none());

    db.teardown().await;
}

#[tokio::test]
async fn patch_claim_can_clear_claimant_via_explicit_null() {
    let db = TestDb::new().await;
    let storage = PgClaimsStorage::new(db.pool.clone());

    let claim = storage.create_claim(&sample_claim("T-patch")).await.unwrap();
    let claimant = Claimant::Human {
        user_id: "u1".to_string(),
        name: "Ada".to_string(),
    };
    storage.claim_issue(claim.id, &claimant).await.unwrap();

    let cleared = storage
        .update_claim(
            claim.id,
            &ClaimPatch {
                claimant: Some(None),
                ..Default::default()
            },
        )
        .await
        .expect("update_claim should succeed")
        .expect("claim should exist");
    assert!(cleared.claimant.is_none());

    db.teardown().await;
}

#[tokio::test]
async fn delete_claim_removes_it_and_reports_missing_on_second_call() {
    let db = TestDb::new().await;
    let storage = PgClaimsStorage::new(db.pool.clone());

    let claim = storage.create_claim(&sample_claim("T-del")).await.unwrap();

    let deleted = storage.delete_claim(claim.id).await.unwrap();
    assert!(deleted);
    assert!(storage.get_claim(claim.id).await.unwrap().is_none());

    let deleted_again = storage.delete_claim(claim.id).await.unwrap();
    assert!(!deleted_again);

    db.teardown().await;
}

#[tokio::test]
async fn subscribers_receive_created_and_updated_events() {
    let db = TestDb::new().await;
    let storage = PgClaimsStorage::new(db.pool.clone());

    let created_count = Arc::new(AtomicUsize::new(0));
    let updated_count = Arc::new(AtomicUsize::new(0));
    let created_count2 = Arc::clone(&created_count);
    let updated_count2 = Arc::clone(&updated_count);

    let unsubscribe = storage
        .subscribe(Box::new(move |event| match event {
            StorageEvent::Created { .. } => {
                created_count2.fetch_add(1, Ordering::SeqCst);
            }
            StorageEvent::Updated { .. } => {
                updated_count2.fetch_add(1, Ordering::SeqCst);
            }
            StorageEvent::Deleted { .. } => {}
        }))
        .await;

    let claim = storage.create_claim(&sample_claim("T-sub")).await.unwrap();
    storage
        .update_claim(
            claim.id,
            &ClaimPatch {
                progress: Some(50),
                ..Default::default()
            },
        )
        .await
        .unwrap();

    assert_eq!(created_count.load(Ordering::SeqCst), 1);
    assert_eq!(updated_count.load(Ordering::SeqCst), 1);

    unsubscribe.unsubscribe().await;
    storage
        .update_claim(
            claim.id,
            &ClaimPatch {
                progress: Some(75),
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(
        updated_count.load(Ordering::SeqCst),
        1,
        "no further events should arrive after unsubscribe"
    );

    db.teardown().await;
}

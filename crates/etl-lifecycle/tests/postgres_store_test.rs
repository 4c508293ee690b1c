// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! PostgreSQL record store tests.
//!
//! These tests need a database and are skipped unless
//! TEST_ETL_LIFECYCLE_DATABASE_URL is set. Every test works on its own
//! project so they can share one database.

use chrono::Utc;
use sqlx::PgPool;

use etl_lifecycle::lifecycle::{STATUS_CHANGE_EVENT, StatusTransition};
use etl_lifecycle::model::{
    CheckKind, CheckResult, NewHistoryEvent, NewTransferRequest, SubCheck, SubCheckResult,
    TransferResult, UserRequestData, VersionId, VersionKey, VersionLabel, VersionStatus,
};
use etl_lifecycle::store::{
    CheckCompletion, PostgresStore, RecordStore, StoreError, TransferUpdate,
};

/// Skip test if database URL is not set
macro_rules! skip_if_no_db {
    () => {
        if std::env::var("TEST_ETL_LIFECYCLE_DATABASE_URL").is_err() {
            eprintln!("Skipping test: TEST_ETL_LIFECYCLE_DATABASE_URL not set");
            return;
        }
    };
}

async fn get_test_pool() -> PgPool {
    let database_url = std::env::var("TEST_ETL_LIFECYCLE_DATABASE_URL")
        .expect("TEST_ETL_LIFECYCLE_DATABASE_URL must be set");
    let pool = PgPool::connect(&database_url)
        .await
        .expect("Failed to connect to database");
    etl_lifecycle::migrations::run(&pool)
        .await
        .expect("Failed to run migrations");
    pool
}

/// Insert a project and return its id.
async fn create_project(pool: &PgPool, project_type: &str, git_flow: &str) -> i64 {
    sqlx::query_scalar(
        "INSERT INTO etl_projects (name, project_type, git_flow_type) VALUES ($1, $2, $3) RETURNING id",
    )
    .bind(format!("test_project_{}", Utc::now().timestamp_nanos_opt().unwrap_or_default()))
    .bind(project_type)
    .bind(git_flow)
    .fetch_one(pool)
    .await
    .expect("Failed to insert project")
}

/// Insert a version and return its id.
async fn create_version(pool: &PgPool, project_id: i64, version: i32, status: &str) -> VersionId {
    sqlx::query_scalar(
        r#"
        INSERT INTO etl_project_versions (etl_project_id, version, status, branch_name)
        VALUES ($1, $2, $3, $4)
        RETURNING id
        "#,
    )
    .bind(project_id)
    .bind(version)
    .bind(status)
    .bind(format!("feature/v{version}"))
    .fetch_one(pool)
    .await
    .expect("Failed to insert version")
}

fn key(project_id: i64, version: u32) -> VersionKey {
    VersionKey::new(project_id, VersionLabel::new(version).unwrap())
}

fn user() -> UserRequestData {
    UserRequestData {
        user_name: "jdoe".to_string(),
        author_email: "jdoe@example.com".to_string(),
        author_name: "J. Doe".to_string(),
    }
}

// ============================================================================
// Versions
// ============================================================================

#[tokio::test]
async fn test_find_versions_by_key() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "TARGETS", "TWO_REPOS").await;
    let v1 = create_version(&pool, project_id, 1, "PRODUCTION").await;
    let v2 = create_version(&pool, project_id, 2, "DEVELOPING").await;

    let found = store
        .find_versions(&[key(project_id, 1), key(project_id, 2), key(project_id, 9)])
        .await
        .unwrap();
    assert_eq!(found.iter().map(|v| v.id).collect::<Vec<_>>(), vec![v1, v2]);
    assert_eq!(found[1].status, VersionStatus::Developing);
    assert_eq!(found[1].branch_name.as_deref(), Some("feature/v2"));
    assert_eq!(found[1].project.git_flow.as_str(), "TWO_REPOS");

    let active = store.find_active_production(project_id, v2).await.unwrap();
    assert_eq!(active.map(|v| v.id), Some(v1));
    assert!(store.find_active_production(project_id, v1).await.unwrap().is_none());
}

#[tokio::test]
async fn test_label_beyond_column_range_is_rejected() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;

    let label = VersionLabel::new(u32::MAX).unwrap();
    let err = store
        .find_versions(&[VersionKey::new(project_id, label)])
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
}

#[tokio::test]
async fn test_unknown_status_is_invalid_data() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let id = create_version(&pool, project_id, 1, "ARCHIVED").await;

    let err = store.get_version(id).await.unwrap_err();
    assert!(matches!(err, StoreError::InvalidData(_)));
}

// ============================================================================
// Transitions
// ============================================================================

#[tokio::test]
async fn test_transition_writes_status_timestamp_and_history() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let id = create_version(&pool, project_id, 1, "DEVELOPING").await;

    let transition = StatusTransition::new(
        VersionStatus::Developing,
        VersionStatus::Testing,
        Some("author".to_string()),
        Utc::now(),
    )
    .unwrap();
    let updated = store.apply_transition(id, &transition).await.unwrap();
    assert_eq!(updated.status, VersionStatus::Testing);
    assert!(updated.timestamps.testing.is_some());

    let reloaded = store.get_version(id).await.unwrap().unwrap();
    assert_eq!(reloaded.status, VersionStatus::Testing);

    let history = store.list_history(id).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].name, STATUS_CHANGE_EVENT);
    assert_eq!(history[0].old_value.as_deref(), Some("DEVELOPING"));
    assert_eq!(history[0].new_value.as_deref(), Some("TESTING"));
}

#[tokio::test]
async fn test_stale_transition_conflicts_and_writes_nothing() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let id = create_version(&pool, project_id, 1, "TESTING").await;

    let transition = StatusTransition::new(
        VersionStatus::Developing,
        VersionStatus::Testing,
        None,
        Utc::now(),
    )
    .unwrap();
    let err = store.apply_transition(id, &transition).await.unwrap_err();
    assert!(matches!(err, StoreError::StatusConflict { .. }));
    assert!(store.list_history(id).await.unwrap().is_empty());
}

#[tokio::test]
async fn test_promotion_turns_off_previous_in_same_transaction() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let previous = create_version(&pool, project_id, 1, "PRODUCTION").await;
    let current = create_version(&pool, project_id, 2, "PROD_REVIEW").await;

    let transition = StatusTransition::new(
        VersionStatus::ProdReview,
        VersionStatus::Production,
        Some("reconciler".to_string()),
        Utc::now(),
    )
    .unwrap();
    let promotion = store.apply_promotion(current, &transition).await.unwrap();
    assert_eq!(promotion.promoted.status, VersionStatus::Production);
    assert_eq!(promotion.turned_off.len(), 1);
    assert_eq!(promotion.turned_off[0].id, previous);

    let reloaded = store.get_version(previous).await.unwrap().unwrap();
    assert_eq!(reloaded.status, VersionStatus::TurnedOff);
    assert!(reloaded.timestamps.turned_off.is_some());

    let history = store.list_history(previous).await.unwrap();
    assert_eq!(history.len(), 1);
    assert_eq!(history[0].new_value.as_deref(), Some("TURNED_OFF"));
    assert_eq!(history[0].author.as_deref(), Some("reconciler"));
}

#[tokio::test]
async fn test_stale_promotion_leaves_previous_in_production() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let previous = create_version(&pool, project_id, 1, "PRODUCTION").await;
    let current = create_version(&pool, project_id, 2, "TESTING").await;

    let transition = StatusTransition::new(
        VersionStatus::ProdReview,
        VersionStatus::Production,
        None,
        Utc::now(),
    )
    .unwrap();
    let err = store.apply_promotion(current, &transition).await.unwrap_err();
    assert!(matches!(err, StoreError::StatusConflict { .. }));

    let reloaded = store.get_version(previous).await.unwrap().unwrap();
    assert_eq!(reloaded.status, VersionStatus::Production);
    assert!(store.list_history(previous).await.unwrap().is_empty());
}

// ============================================================================
// Checks
// ============================================================================

#[tokio::test]
async fn test_check_completion_with_transfer_request() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "TARGETS", "ONE_REPO").await;
    let id = create_version(&pool, project_id, 1, "PROD_REQUEST").await;

    let check = store.create_check(id, CheckKind::Review).await.unwrap();
    assert_eq!(check.result, CheckResult::Processing);

    store
        .complete_check(
            id,
            &CheckCompletion {
                check_id: check.id,
                result: CheckResult::Success,
                checks: vec![
                    SubCheck::success("All required files are present"),
                    SubCheck::warning("Materialization call in etl/load.py"),
                ],
                transfer_request: Some(NewTransferRequest {
                    user: user(),
                    reviewers: vec!["alice".to_string()],
                    comment: Some("Before merging this pull request, @alice must review the code".to_string()),
                }),
            },
        )
        .await
        .unwrap();

    let version = store.get_version(id).await.unwrap().unwrap();
    let stored = version.find_check(check.id).unwrap();
    assert_eq!(stored.result, CheckResult::Success);
    assert_eq!(stored.checks.len(), 2);
    assert_eq!(stored.checks[1].result, SubCheckResult::Warning);

    let request = &version.transfer_requests[0];
    assert_eq!(request.result, None);
    assert_eq!(request.retry_counter, 3);
    assert_eq!(request.user.as_ref(), Some(&user()));
    assert_eq!(request.reviewers, vec!["alice"]);
}

#[tokio::test]
async fn test_completing_unknown_check_fails() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let id = create_version(&pool, project_id, 1, "DEVELOPING").await;

    let err = store
        .complete_check(
            id,
            &CheckCompletion {
                check_id: -1,
                result: CheckResult::Success,
                checks: vec![],
                transfer_request: None,
            },
        )
        .await
        .unwrap_err();
    assert!(matches!(err, StoreError::CheckNotFound { .. }));
}

// ============================================================================
// History
// ============================================================================

#[tokio::test]
async fn test_history_keeps_extra_data() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let id = create_version(&pool, project_id, 1, "PRODUCTION").await;

    let extra = serde_json::json!([
        {"header": "Date range", "value": "01.03.2025 - 15.03.2025", "items": []}
    ]);
    store
        .add_history_event(&NewHistoryEvent {
            version_id: id,
            name: "Retro calculation started".to_string(),
            old_value: None,
            new_value: None,
            author: Some("jdoe".to_string()),
            created_at: Utc::now(),
            extra_data: Some(extra.clone()),
        })
        .await
        .unwrap();

    let history = store.list_history(id).await.unwrap();
    assert_eq!(history[0].extra_data, Some(extra));
}

// ============================================================================
// Transfers
// ============================================================================

async fn seed_transfer(pool: &PgPool, version_id: VersionId) -> i64 {
    sqlx::query_scalar(
        r#"
        INSERT INTO transfer_requests (etl_project_version_id, user_name, author_email, author_name)
        VALUES ($1, 'jdoe', 'jdoe@example.com', 'J. Doe')
        RETURNING id
        "#,
    )
    .bind(version_id)
    .fetch_one(pool)
    .await
    .expect("Failed to insert transfer request")
}

#[tokio::test]
async fn test_pending_transfers_are_marked_once() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let id = create_version(&pool, project_id, 1, "PROD_REQUEST").await;
    let request_id = seed_transfer(&pool, id).await;

    let pending = store.list_pending_transfers(true).await.unwrap();
    let ours: Vec<_> = pending.iter().filter(|p| p.version.id == id).collect();
    assert_eq!(ours.len(), 1);
    assert_eq!(ours[0].request.id, request_id);

    let again = store.list_pending_transfers(true).await.unwrap();
    assert!(again.iter().all(|p| p.version.id != id));

    let version = store.get_version(id).await.unwrap().unwrap();
    assert_eq!(
        version.transfer_requests[0].result,
        Some(TransferResult::Processing)
    );
}

#[tokio::test]
async fn test_transfer_update_promotes_and_records_commit() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let previous = create_version(&pool, project_id, 1, "PRODUCTION").await;
    let id = create_version(&pool, project_id, 2, "PROD_REQUEST").await;
    seed_transfer(&pool, id).await;

    let version = store.get_version(id).await.unwrap().unwrap();
    let mut request = version.transfer_requests[0].clone();
    request.register_success();

    store
        .apply_transfer_update(&TransferUpdate {
            version_id: id,
            transition: Some(
                StatusTransition::new(
                    VersionStatus::ProdRequest,
                    VersionStatus::ProdReview,
                    Some("jdoe".to_string()),
                    Utc::now(),
                )
                .unwrap(),
            ),
            prod_branch_uri: None,
            pull_request_url: Some("https://git.local/etl/pull/3".to_string()),
            transfer_request: Some(request),
            predecessor: Some(key(project_id, 1)),
            master_commit_hash: Some("abc123".to_string()),
        })
        .await
        .unwrap();

    let promoted = store.get_version(id).await.unwrap().unwrap();
    assert_eq!(promoted.status, VersionStatus::ProdReview);
    assert_eq!(
        promoted.pull_request_url.as_deref(),
        Some("https://git.local/etl/pull/3")
    );
    assert_eq!(
        promoted.transfer_requests[0].result,
        Some(TransferResult::Success)
    );
    assert_eq!(store.list_history(id).await.unwrap().len(), 1);

    let previous = store.get_version(previous).await.unwrap().unwrap();
    assert_eq!(previous.master_commit_hash.as_deref(), Some("abc123"));
}

#[tokio::test]
async fn test_failed_transfer_update_rolls_back() {
    skip_if_no_db!();
    let pool = get_test_pool().await;
    let store = PostgresStore::new(pool.clone());
    let project_id = create_project(&pool, "FEATURES", "ONE_REPO").await;
    let id = create_version(&pool, project_id, 1, "PROD_REQUEST").await;
    let request_id = seed_transfer(&pool, id).await;

    let version = store.get_version(id).await.unwrap().unwrap();
    let mut request = version.transfer_requests[0].clone();
    request.id = request_id + 1_000_000;
    request.register_success();

    let result = store
        .apply_transfer_update(&TransferUpdate {
            version_id: id,
            transition: Some(
                StatusTransition::new(
                    VersionStatus::ProdRequest,
                    VersionStatus::ProdReview,
                    None,
                    Utc::now(),
                )
                .unwrap(),
            ),
            prod_branch_uri: None,
            pull_request_url: Some("https://git.local/etl/pull/4".to_string()),
            transfer_request: Some(request),
            predecessor: None,
            master_commit_hash: None,
        })
        .await;
    assert!(matches!(
        result,
        Err(StoreError::TransferRequestNotFound { .. })
    ));

    let unchanged = store.get_version(id).await.unwrap().unwrap();
    assert_eq!(unchanged.status, VersionStatus::ProdRequest);
    assert!(unchanged.pull_request_url.is_none());
    assert!(store.list_history(id).await.unwrap().is_empty());
}

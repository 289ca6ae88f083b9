//! Integration tests for warden-review API endpoints
//!
//! Tests cover:
//! - Health endpoint
//! - Review target selection and voting (training, standard, consensus gate)
//! - Banned reviewer rejection
//! - Manual recheck queue (priority, dedup, depth, info)
//! - Entity detail and vote statistics
//! - Worker fleet listing

use std::sync::Arc;

use axum::{
    body::Body,
    http::{Request, StatusCode},
};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot` method

use warden_common::audit::ActivityLogger;
use warden_common::db::entities::{increment_votes, upsert_snapshot, EntitySnapshot};
use warden_common::db::init::init_database;
use warden_common::db::models::{EntityKind, WorkerStatus};
use warden_common::events::EventBus;
use warden_common::params::PolicyCache;
use warden_review::{build_router, AppState};

/// Test helper: temp database plus a ready-to-serve router
async fn setup() -> (TempDir, SqlitePool, axum::Router) {
    let dir = TempDir::new().unwrap();
    let pool = init_database(&dir.path().join("test.db")).await.unwrap();

    let event_bus = EventBus::new(64);
    let policy = Arc::new(PolicyCache::new(pool.clone()));
    let (activity, _writer) = ActivityLogger::spawn(pool.clone(), 5000);
    let state = AppState::new(pool.clone(), event_bus, policy, activity);

    (dir, pool, build_router(state))
}

/// Test helper: create a GET request
fn get_request(uri: &str) -> Request<Body> {
    Request::builder().method("GET").uri(uri).body(Body::empty()).unwrap()
}

/// Test helper: create a JSON POST request
fn post_json(uri: &str, body: Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

/// Test helper: extract JSON body from response
async fn extract_json(body: Body) -> Value {
    let bytes = axum::body::to_bytes(body, usize::MAX).await.expect("Should read body");
    serde_json::from_slice(&bytes).expect("Should parse JSON")
}

/// Test helper: seed one flagged user entity
async fn seed_user(pool: &SqlitePool, id: i64) {
    upsert_snapshot(
        pool,
        &EntitySnapshot {
            id,
            kind: EntityKind::User,
            name: format!("user-{}", id),
            account_created_at: Utc::now(),
            groups: vec![],
        },
    )
    .await
    .unwrap();
}

// =============================================================================
// Health Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_health_endpoint() {
    let (_dir, _pool, app) = setup().await;

    let response = app.oneshot(get_request("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "warden-review");
    assert!(body["version"].is_string());
    assert!(body["uptime_seconds"].is_number());
}

// =============================================================================
// SSE Endpoint Tests
// =============================================================================

#[tokio::test]
async fn test_event_stream_content_type() {
    let (_dir, _pool, app) = setup().await;

    let response = app.oneshot(get_request("/api/events")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let content_type = response.headers().get("content-type").unwrap().to_str().unwrap();
    assert!(content_type.starts_with("text/event-stream"));
}

// =============================================================================
// Review Target Selection Tests
// =============================================================================

#[tokio::test]
async fn test_next_review_empty_backlog() {
    let (_dir, _pool, app) = setup().await;

    let request = post_json("/api/review/next", json!({ "reviewer_id": 1 }));
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["outcome"], "none");
}

#[tokio::test]
async fn test_next_review_grants_target() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 42).await;

    let request = post_json(
        "/api/review/next",
        json!({ "reviewer_id": 1, "sort_by": "confidence", "target_mode": "flagged_first" }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["outcome"], "target");
    assert_eq!(body["entity"]["id"], 42);
    assert_eq!(body["entity"]["kind"], "user");
    // Unprivileged reviewers are always coerced to training
    assert_eq!(body["mode"], "training");
}

#[tokio::test]
async fn test_next_review_banned_reviewer_forbidden() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;
    warden_review::db::reviewers::get_or_create(&pool, 9).await.unwrap();
    warden_review::db::reviewers::ban(&pool, 9, "test ban", "admin").await.unwrap();

    let request = post_json("/api/review/next", json!({ "reviewer_id": 9 }));
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::FORBIDDEN);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "forbidden");
}

// =============================================================================
// Voting Tests
// =============================================================================

#[tokio::test]
async fn test_vote_unknown_entity_not_found() {
    let (_dir, _pool, app) = setup().await;

    let request = post_json(
        "/api/review/user/999/vote",
        json!({ "reviewer_id": 1, "action": "confirm" }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "not_found");
}

#[tokio::test]
async fn test_vote_invalid_kind_bad_request() {
    let (_dir, _pool, app) = setup().await;

    let request = post_json(
        "/api/review/widget/1/vote",
        json!({ "reviewer_id": 1, "action": "confirm" }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn test_training_vote_moves_counters_without_transition() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;

    let request = post_json(
        "/api/review/user/1/vote",
        json!({ "reviewer_id": 7, "action": "confirm" }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["mode"], "training");
    assert_eq!(body["downvotes"], 1);
    assert_eq!(body["upvotes"], 0);
    assert_eq!(body["status"], "flagged");
    assert_eq!(body["transitioned"], false);
}

#[tokio::test]
async fn test_standard_vote_transitions_status() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;
    warden_review::db::reviewers::set_privileged(&pool, 7, true).await.unwrap();

    let request = post_json(
        "/api/review/user/1/vote",
        json!({ "reviewer_id": 7, "action": "confirm" }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["mode"], "standard");
    assert_eq!(body["status"], "confirmed");
    assert_eq!(body["transitioned"], true);
}

#[tokio::test]
async fn test_consensus_gate_rejects_with_conflict() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;
    // 8 of 10 votes say safe; a standard confirm must be blocked
    increment_votes(&pool, 1, EntityKind::User, 8, 2).await.unwrap();
    warden_review::db::reviewers::set_privileged(&pool, 7, true).await.unwrap();

    let request = post_json(
        "/api/review/user/1/vote",
        json!({ "reviewer_id": 7, "action": "confirm" }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["error"]["code"], "conflict");
    assert!(body["error"]["message"].as_str().unwrap().contains("safe"));
}

#[tokio::test]
async fn test_viewed_is_not_a_valid_vote_action() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;

    let request = post_json(
        "/api/review/user/1/vote",
        json!({ "reviewer_id": 7, "action": "viewed" }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// =============================================================================
// Recheck Queue Tests
// =============================================================================

#[tokio::test]
async fn test_queue_recheck_accepted_low_priority() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;

    let request = post_json(
        "/api/queue",
        json!({ "entity_id": 1, "kind": "user", "reviewer_id": 7 }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = extract_json(response.into_body()).await;
    // Unprivileged requester acts in training mode
    assert_eq!(body["priority"], "low");
    assert_eq!(body["position"], 1);
    assert_eq!(body["lengths"]["low"], 1);
    assert_eq!(body["lengths"]["high"], 0);
}

#[tokio::test]
async fn test_queue_recheck_privileged_is_high_priority() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;
    warden_review::db::reviewers::set_privileged(&pool, 7, true).await.unwrap();

    let request = post_json(
        "/api/queue",
        json!({ "entity_id": 1, "kind": "user", "reviewer_id": 7 }),
    );
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let body = extract_json(response.into_body()).await;
    assert_eq!(body["priority"], "high");
}

#[tokio::test]
async fn test_queue_recheck_duplicate_conflict() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;

    let first = post_json("/api/queue", json!({ "entity_id": 1, "kind": "user", "reviewer_id": 7 }));
    let response = app.clone().oneshot(first).await.unwrap();
    assert_eq!(response.status(), StatusCode::ACCEPTED);

    let second =
        post_json("/api/queue", json!({ "entity_id": 1, "kind": "user", "reviewer_id": 8 }));
    let response = app.oneshot(second).await.unwrap();
    assert_eq!(response.status(), StatusCode::CONFLICT);

    let body = extract_json(response.into_body()).await;
    assert!(body["error"]["message"].as_str().unwrap().contains("already queued"));
}

#[tokio::test]
async fn test_queue_recheck_unknown_entity_not_found() {
    let (_dir, _pool, app) = setup().await;

    let request =
        post_json("/api/queue", json!({ "entity_id": 404, "kind": "user", "reviewer_id": 7 }));
    let response = app.oneshot(request).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn test_queue_info_and_depth() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;

    let enqueue =
        post_json("/api/queue", json!({ "entity_id": 1, "kind": "user", "reviewer_id": 7 }));
    app.clone().oneshot(enqueue).await.unwrap();

    let response = app.clone().oneshot(get_request("/api/queue/user/1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["status"], "pending");
    assert_eq!(body["position"], 1);

    let response = app.clone().oneshot(get_request("/api/queue/depth")).await.unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["low"], 1);
    assert_eq!(body["high"], 0);

    // Never-queued entity is a 404
    let response = app.oneshot(get_request("/api/queue/user/999")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Entity Lookup Tests
// =============================================================================

#[tokio::test]
async fn test_entity_detail_and_votes() {
    let (_dir, pool, app) = setup().await;
    seed_user(&pool, 1).await;
    increment_votes(&pool, 1, EntityKind::User, 3, 1).await.unwrap();

    let response = app.clone().oneshot(get_request("/api/entities/user/1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["id"], 1);
    assert_eq!(body["status"], "flagged");

    let response = app.clone().oneshot(get_request("/api/entities/user/1/votes")).await.unwrap();
    let body = extract_json(response.into_body()).await;
    assert_eq!(body["upvotes"], 3);
    assert_eq!(body["downvotes"], 1);
    assert_eq!(body["total"], 4);
    assert_eq!(body["up_share"], 0.75);

    let response = app.oneshot(get_request("/api/entities/group/1")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// =============================================================================
// Worker Fleet Tests
// =============================================================================

#[tokio::test]
async fn test_worker_listing_with_staleness() {
    let (_dir, pool, app) = setup().await;

    let fresh = WorkerStatus {
        worker_type: "scan".to_string(),
        sub_type: "rescan".to_string(),
        worker_id: "worker-0".to_string(),
        last_seen: Utc::now(),
        current_task: "idle".to_string(),
        progress: 0.0,
        healthy: true,
    };
    warden_common::db::worker_status::report(&pool, &fresh, 600).await.unwrap();

    let stale = WorkerStatus {
        worker_id: "worker-1".to_string(),
        last_seen: Utc::now() - chrono::Duration::seconds(300),
        ..fresh.clone()
    };
    warden_common::db::worker_status::report(&pool, &stale, 600).await.unwrap();

    let response = app.oneshot(get_request("/api/workers")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let body = extract_json(response.into_body()).await;
    let workers = body.as_array().unwrap();
    assert_eq!(workers.len(), 2);

    // Listing is ordered by last_seen ascending: stale worker first
    assert_eq!(workers[0]["worker_id"], "worker-1");
    assert_eq!(workers[0]["stale"], true);
    assert_eq!(workers[1]["worker_id"], "worker-0");
    assert_eq!(workers[1]["stale"], false);
}

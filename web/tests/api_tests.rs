//! Monitoring API against the in-memory stores.

#![allow(clippy::unwrap_used)] // Tests can unwrap
#![allow(clippy::expect_used)] // Tests can expect

use axum::http::StatusCode;
use axum_test::TestServer;
use chronicle_core::event::{GlobalSequence, NewEvent};
use chronicle_core::event_store::EventStore;
use chronicle_core::lease::LeaseOwner;
use chronicle_core::stream::{StreamId, StreamType, Version};
use chronicle_projections::{CoordinatorConfig, ProjectionCoordinator};
use chronicle_testing::helpers::ticket_events;
use chronicle_testing::{
    InMemoryEventStore, InMemoryFailureLedger, InMemoryProjectionRegistry, RecordingProjector,
};
use chronicle_web::{AppState, CORRELATION_ID_HEADER, build_router};
use serde_json::{Value, json};
use std::sync::Arc;

const PROJECTION: &str = "ticket_stats";

struct Fixture {
    server: TestServer,
    store: InMemoryEventStore,
    projector: RecordingProjector,
    coordinator: Arc<ProjectionCoordinator>,
}

async fn fixture() -> Fixture {
    let store = InMemoryEventStore::new();
    let projector = RecordingProjector::new(PROJECTION);
    let coordinator = Arc::new(
        ProjectionCoordinator::new(
            Arc::new(store.clone()),
            Arc::new(store.clone()),
            Arc::new(InMemoryProjectionRegistry::new()),
            Arc::new(InMemoryFailureLedger::new()),
            CoordinatorConfig::default().with_owner(LeaseOwner::new("api-test")),
        )
        .with_projector(Arc::new(projector.clone())),
    );
    coordinator.initialize().await.unwrap();

    let state = AppState::new(Arc::clone(&coordinator), Arc::new(store.clone()));
    let server = TestServer::new(build_router(state)).unwrap();

    Fixture {
        server,
        store,
        projector,
        coordinator,
    }
}

async fn append(store: &InMemoryEventStore, stream: &str, count: usize) {
    let current = store
        .read_stream(StreamId::new(stream), Version::new(1))
        .await
        .unwrap()
        .len();
    store
        .append(
            StreamId::new(stream),
            StreamType::new("ticket"),
            Version::new(current as u64),
            ticket_events(count),
        )
        .await
        .unwrap();
}

#[tokio::test]
async fn health_and_readiness() {
    let f = fixture().await;

    let response = f.server.get("/health").await;
    response.assert_status_ok();
    assert_eq!(response.text(), "ok");

    let response = f.server.get("/ready").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["status"], "ready");
}

#[tokio::test]
async fn readiness_fails_when_storage_is_down() {
    let f = fixture().await;
    f.store.set_unavailable(true);

    let response = f.server.get("/ready").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);

    let response = f.server.get("/api/monitoring/overview").await;
    response.assert_status(StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(response.json::<Value>()["code"], "SERVICE_UNAVAILABLE");
}

#[tokio::test]
async fn overview_reports_lag_until_the_projection_catches_up() {
    let f = fixture().await;
    append(&f.store, "ticket-1", 3).await;
    append(&f.store, "ticket-2", 2).await;

    let body: Value = f.server.get("/api/monitoring/overview").await.json();
    assert_eq!(body["total_events"], 5);
    assert_eq!(body["total_streams"], 2);
    assert_eq!(body["unresolved_failures_count"], 0);
    assert_eq!(body["projections"][0]["name"], PROJECTION);
    assert_eq!(body["projections"][0]["checkpoint"], 0);
    assert_eq!(body["projections"][0]["lag"], 5);

    f.coordinator.tick(PROJECTION).await.unwrap();

    let body: Value = f.server.get("/api/monitoring/projections").await.json();
    assert_eq!(body[0]["checkpoint"], 5);
    assert_eq!(body[0]["lag"], 0);
    assert_eq!(body[0]["status"], "running");
    assert_eq!(body[0]["health"], "healthy");

    let body: Value = f
        .server
        .get(&format!("/api/monitoring/projections/{PROJECTION}"))
        .await
        .json();
    assert_eq!(body["checkpoint"], 5);
}

#[tokio::test]
async fn unknown_projection_is_not_found() {
    let f = fixture().await;

    let response = f.server.get("/api/monitoring/projections/nope").await;
    response.assert_status(StatusCode::NOT_FOUND);
    assert_eq!(response.json::<Value>()["code"], "NOT_FOUND");

    let response = f.server.post("/api/monitoring/projections/nope/rebuild").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn statistics_validates_parameters() {
    let f = fixture().await;
    append(&f.store, "ticket-1", 3).await;
    f.store
        .append(
            StreamId::new("order-1"),
            StreamType::new("order"),
            Version::INITIAL,
            vec![NewEvent::new("OrderPlaced.v1", b"{}".to_vec())],
        )
        .await
        .unwrap();

    let body: Value = f
        .server
        .get("/api/monitoring/statistics")
        .add_query_param("bucket", "day")
        .await
        .json();
    assert_eq!(body["bucket"], "day");
    assert_eq!(body["total"], 4);
    assert_eq!(body["totals_by_event_type"]["TicketReserved.v1"], 3);
    assert_eq!(body["totals_by_stream_type"]["order"], 1);

    let response = f
        .server
        .get("/api/monitoring/statistics")
        .add_query_param("bucket", "fortnight")
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    let response = f
        .server
        .get("/api/monitoring/statistics")
        .add_query_param("since", "2025-01-02T00:00:00Z")
        .add_query_param("until", "2025-01-01T00:00:00Z")
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);
}

#[tokio::test]
async fn recent_events_pages_newest_first() {
    let f = fixture().await;
    append(&f.store, "ticket-1", 5).await;

    let body: Value = f
        .server
        .get("/api/monitoring/recent-events")
        .add_query_param("limit", 2)
        .await
        .json();
    let sequences: Vec<u64> = body["events"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["global_sequence"].as_u64().unwrap())
        .collect();
    assert_eq!(sequences, vec![5, 4]);
    assert_eq!(body["next_before"], 4);
    assert_eq!(body["events"][0]["stream_id"], "ticket-1");
    assert_eq!(body["events"][0]["payload_bytes"], 8);

    let body: Value = f
        .server
        .get("/api/monitoring/recent-events")
        .add_query_param("limit", 10)
        .add_query_param("before", 4)
        .await
        .json();
    assert_eq!(body["events"].as_array().unwrap().len(), 3);
    assert_eq!(body["next_before"], Value::Null);
}

#[tokio::test]
async fn rebuild_is_accepted_with_the_head_as_target() {
    let f = fixture().await;
    append(&f.store, "ticket-1", 4).await;
    f.coordinator.tick(PROJECTION).await.unwrap();

    let response = f
        .server
        .post(&format!("/api/monitoring/projections/{PROJECTION}/rebuild"))
        .await;
    response.assert_status(StatusCode::ACCEPTED);
    let body: Value = response.json();
    assert_eq!(body["projection"], PROJECTION);
    assert_eq!(body["target"], 4);
    assert_eq!(body["status"], "rebuilding");

    let body: Value = f
        .server
        .get(&format!("/api/monitoring/projections/{PROJECTION}"))
        .await
        .json();
    assert_eq!(body["checkpoint"], 0);
    assert_eq!(body["status"], "rebuilding");
    assert_eq!(f.projector.resets(), 1);
}

#[tokio::test]
async fn failures_can_be_listed_and_skipped() {
    let f = fixture().await;
    append(&f.store, "ticket-1", 5).await;
    f.projector.fail_on(GlobalSequence::new(3));
    f.coordinator.tick(PROJECTION).await.unwrap();

    let body: Value = f.server.get("/api/monitoring/overview").await.json();
    assert_eq!(body["unresolved_failures_count"], 1);
    assert_eq!(body["projections"][0]["status"], "failed");
    assert_eq!(body["projections"][0]["health"], "failed");

    let failures: Value = f
        .server
        .get("/api/monitoring/failures")
        .add_query_param("projection", PROJECTION)
        .add_query_param("resolved", false)
        .await
        .json();
    let failures = failures.as_array().unwrap();
    assert_eq!(failures.len(), 1);
    assert_eq!(failures[0]["global_sequence"], 3);
    assert_eq!(failures[0]["attempt_count"], 1);
    let id = failures[0]["id"].as_i64().unwrap();

    let response = f
        .server
        .post(&format!("/api/monitoring/failures/{id}/resolve"))
        .json(&json!({"action": "skip", "resolver": "alice"}))
        .await;
    response.assert_status_ok();
    let body: Value = response.json();
    assert_eq!(body["resolved_by"], "alice");
    assert_eq!(body["resolution_action"], "skip");
    assert!(!body["resolved_at"].is_null());

    let body: Value = f
        .server
        .get(&format!("/api/monitoring/projections/{PROJECTION}"))
        .await
        .json();
    assert_eq!(body["checkpoint"], 3);

    let response = f
        .server
        .post(&format!("/api/monitoring/failures/{id}/resolve"))
        .json(&json!({"action": "ignore"}))
        .await;
    response.assert_status(StatusCode::CONFLICT);
}

#[tokio::test]
async fn resolve_rejects_bad_requests() {
    let f = fixture().await;
    append(&f.store, "ticket-1", 2).await;
    f.projector.fail_on(GlobalSequence::new(1));
    f.coordinator.tick(PROJECTION).await.unwrap();

    let response = f
        .server
        .post("/api/monitoring/failures/999/resolve")
        .json(&json!({"action": "skip"}))
        .await;
    response.assert_status(StatusCode::NOT_FOUND);

    let response = f
        .server
        .post("/api/monitoring/failures/1/resolve")
        .json(&json!({"action": "shrug"}))
        .await;
    response.assert_status(StatusCode::UNPROCESSABLE_ENTITY);

    let response = f
        .server
        .post("/api/monitoring/failures/1/resolve")
        .json(&json!({"action": "ignore"}))
        .await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["resolved_by"], "operator");

    let response = f.server.get("/api/monitoring/failures/1").await;
    response.assert_status_ok();
    assert_eq!(response.json::<Value>()["resolution_action"], "ignore");
}

#[tokio::test]
async fn responses_carry_a_correlation_id() {
    let f = fixture().await;

    let response = f.server.get("/api/monitoring/overview").await;
    response.assert_status_ok();
    assert!(response.headers().contains_key(CORRELATION_ID_HEADER));
}

#[tokio::test]
async fn metrics_endpoint_without_recorder_is_not_found() {
    let f = fixture().await;

    let response = f.server.get("/metrics").await;
    response.assert_status(StatusCode::NOT_FOUND);
}

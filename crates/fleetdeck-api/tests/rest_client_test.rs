// Integration tests for `RestStore` using wiremock.

use secrecy::SecretString;
use serde_json::json;
use url::Url;
use wiremock::matchers::{body_json, header, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

use fleetdeck_api::{CommitRequest, Error, Persistence, RestStore, VehicleStatusUpdate};

// ── Helpers ─────────────────────────────────────────────────────────

async fn setup() -> (MockServer, RestStore) {
    let server = MockServer::start().await;
    let store = RestStore::from_reqwest(
        Url::parse(&server.uri()).expect("mock server uri"),
        SecretString::from("svc-key".to_string()),
        reqwest::Client::new(),
    );
    (server, store)
}

// ── Happy-path tests ────────────────────────────────────────────────

#[tokio::test]
async fn select_returns_rows() {
    let (server, store) = setup().await;

    let body = json!([
        { "id": "veh-1", "name": "Alpha", "class": "standard", "status": "available" },
        { "id": "veh-2", "name": "Bravo", "class": "utility", "status": "maintenance" },
    ]);

    Mock::given(method("GET"))
        .and(path("/v1/vehicles"))
        .and(header("Authorization", "Bearer svc-key"))
        .respond_with(ResponseTemplate::new(200).set_body_json(&body))
        .mount(&server)
        .await;

    let rows = store.select("vehicles", None).await.expect("select");
    assert_eq!(rows.len(), 2);
    assert_eq!(rows[0]["id"], "veh-1");
    assert_eq!(rows[1]["status"], "maintenance");
}

#[tokio::test]
async fn select_passes_filter_as_query() {
    let (server, store) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/reservations"))
        .and(query_param("status", "scheduled"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!([])))
        .mount(&server)
        .await;

    let rows = store
        .select("reservations", Some("status=scheduled"))
        .await
        .expect("select with filter");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn upsert_round_trips_row() {
    let (server, store) = setup().await;

    let row = json!({ "id": "res-1", "vehicle_id": "veh-1" });

    Mock::given(method("POST"))
        .and(path("/v1/reservations"))
        .and(body_json(&row))
        .respond_with(ResponseTemplate::new(200).set_body_json(&row))
        .mount(&server)
        .await;

    let saved = store.upsert("reservations", row.clone()).await.expect("upsert");
    assert_eq!(saved, row);
}

#[tokio::test]
async fn delete_hits_row_url() {
    let (server, store) = setup().await;

    Mock::given(method("DELETE"))
        .and(path("/v1/reservations/res-9"))
        .respond_with(ResponseTemplate::new(204))
        .mount(&server)
        .await;

    store.delete("reservations", "res-9").await.expect("delete");
}

#[tokio::test]
async fn commit_returns_reservation_ids() {
    let (server, store) = setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/rpc/commit_reservations"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(json!({ "reservation_ids": ["res-1", "res-2"] })),
        )
        .mount(&server)
        .await;

    let outcome = store
        .commit_reservations(CommitRequest {
            reservations: vec![json!({ "id": "res-1" }), json!({ "id": "res-2" })],
            vehicle_updates: vec![VehicleStatusUpdate::new("veh-1", "reserved")],
        })
        .await
        .expect("commit");

    assert_eq!(outcome.reservation_ids, vec!["res-1", "res-2"]);
}

#[tokio::test]
async fn probe_checks_health_endpoint() {
    let (server, store) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/rpc/health"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "ok": true })))
        .mount(&server)
        .await;

    store.probe().await.expect("probe");
}

// ── Error mapping ───────────────────────────────────────────────────

#[tokio::test]
async fn commit_conflict_surfaces_409() {
    let (server, store) = setup().await;

    Mock::given(method("POST"))
        .and(path("/v1/rpc/commit_reservations"))
        .respond_with(
            ResponseTemplate::new(409)
                .set_body_json(json!({ "message": "overlapping reservation on veh-1" })),
        )
        .mount(&server)
        .await;

    let err = store
        .commit_reservations(CommitRequest {
            reservations: vec![json!({ "id": "res-1" })],
            vehicle_updates: vec![],
        })
        .await
        .expect_err("conflict");

    match err {
        Error::Service { status, message } => {
            assert_eq!(status, 409);
            assert!(message.contains("veh-1"));
        }
        other => panic!("expected Service error, got {other:?}"),
    }
}

#[tokio::test]
async fn error_without_body_uses_status_text() {
    let (server, store) = setup().await;

    Mock::given(method("GET"))
        .and(path("/v1/vehicles"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let err = store.select("vehicles", None).await.expect_err("error");
    match err {
        Error::Service { status, .. } => assert_eq!(status, 500),
        other => panic!("expected Service error, got {other:?}"),
    }
    assert!(store.select("vehicles", None).await.expect_err("again").is_transient());
}

//! HTTP surface driven through the router with `oneshot`.

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::{DateTime, FixedOffset, TimeZone, Utc};
use presenced::{
    build_router, AppState, AttendanceLedger, AttendanceRecord, AttendanceService, EngineError, FaceIdentifier,
    FixedClock, Identification, PresentPolicy, SqliteStore, StoreError, TimeWindow, UserDirectory,
};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tower::ServiceExt;

const BOUNDARY: &str = "presence-test-boundary";

/// Identifier that always predicts the same label, or finds no face.
struct StubIdentifier(Option<&'static str>);

#[async_trait]
impl FaceIdentifier for StubIdentifier {
    async fn identify(&self, image: Vec<u8>) -> Result<Identification, EngineError> {
        assert!(!image.is_empty());
        match self.0 {
            Some(label) => Ok(Identification {
                label: label.to_string(),
                all_labels: vec![label.to_string()],
            }),
            None => Err(EngineError::NoFaceDetected),
        }
    }
}

fn jakarta(day: u32, hour: u32, minute: u32) -> DateTime<Utc> {
    FixedOffset::east_opt(7 * 3600)
        .unwrap()
        .with_ymd_and_hms(2024, 6, day, hour, minute, 0)
        .unwrap()
        .with_timezone(&Utc)
}

/// Identifier whose worker always faults.
struct FaultyIdentifier;

#[async_trait]
impl FaceIdentifier for FaultyIdentifier {
    async fn identify(&self, _image: Vec<u8>) -> Result<Identification, EngineError> {
        Err(EngineError::Worker("worker pool poisoned at 0xdeadbeef".into()))
    }
}

/// Store where every call times out.
struct UnreachableStore;

#[async_trait]
impl UserDirectory for UnreachableStore {
    async fn username_of(&self, _: &str) -> Result<Option<String>, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(5)))
    }
    async fn all_user_ids(&self) -> Result<Vec<String>, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(5)))
    }
    async fn username_exists(&self, _: &str) -> Result<bool, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(5)))
    }
}

#[async_trait]
impl AttendanceLedger for UnreachableStore {
    async fn write_present(&self, _: &str, _: DateTime<Utc>) -> Result<AttendanceRecord, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(5)))
    }
    async fn write_absent(&self, _: &str, _: DateTime<Utc>) -> Result<AttendanceRecord, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(5)))
    }
    async fn list_by_user(&self, _: &str) -> Result<Vec<AttendanceRecord>, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(5)))
    }
    async fn list_present_since(&self, _: DateTime<Utc>) -> Result<HashSet<String>, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(5)))
    }
    async fn has_present_since(&self, _: &str, _: DateTime<Utc>) -> Result<bool, StoreError> {
        Err(StoreError::Timeout(Duration::from_secs(5)))
    }
}

async fn setup(prediction: Option<&'static str>, at: DateTime<Utc>) -> (Router, Arc<SqliteStore>) {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    store.insert_user("u1", "alice", "hash").await.unwrap();
    store.insert_user("u2", "bob", "hash").await.unwrap();
    let router = router_with(
        Arc::new(StubIdentifier(prediction)),
        store.clone(),
        store.clone(),
        at,
    );
    (router, store)
}

fn router_with(
    identifier: Arc<dyn FaceIdentifier>,
    users: Arc<dyn UserDirectory>,
    ledger: Arc<dyn AttendanceLedger>,
    at: DateTime<Utc>,
) -> Router {
    let service = AttendanceService::new(
        identifier,
        users,
        ledger,
        Arc::new(FixedClock(at)),
        TimeWindow::default(),
        PresentPolicy::AppendAlways,
        Duration::from_secs(5),
        Arc::new(Mutex::new(())),
    );
    build_router(
        AppState {
            service: Arc::new(service),
        },
        1024 * 1024,
    )
}

fn multipart(image: Option<&[u8]>, user_id: Option<&str>) -> Request<Body> {
    let mut body = Vec::new();
    if let Some(bytes) = image {
        body.extend_from_slice(
            format!(
                "--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"image\"; filename=\"face.png\"\r\nContent-Type: image/png\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(bytes);
        body.extend_from_slice(b"\r\n");
    }
    if let Some(id) = user_id {
        body.extend_from_slice(
            format!("--{BOUNDARY}\r\nContent-Disposition: form-data; name=\"user_id\"\r\n\r\n{id}\r\n").as_bytes(),
        );
    }
    body.extend_from_slice(format!("--{BOUNDARY}--\r\n").as_bytes());

    Request::builder()
        .method("POST")
        .uri("/process-image")
        .header("content-type", format!("multipart/form-data; boundary={BOUNDARY}"))
        .body(Body::from(body))
        .unwrap()
}

async fn send(app: &Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.clone().oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

#[tokio::test]
async fn process_image_records_attendance() {
    let (app, store) = setup(Some("alice"), jakarta(3, 7, 45)).await;
    let (status, body) = send(&app, multipart(Some(b"fake-image"), Some("u1"))).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    assert_eq!(body["prediction"], "alice");
    assert!(body["message"].as_str().unwrap().starts_with("Attendance recorded"));
    assert_eq!(store.list_by_user("u1").await.unwrap().len(), 1);
}

#[tokio::test]
async fn process_image_mismatch_is_400_without_write() {
    let (app, store) = setup(Some("alice"), jakarta(3, 7, 45)).await;
    let (status, body) = send(&app, multipart(Some(b"fake-image"), Some("u2"))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["status"], "error");
    assert_eq!(body["kind"], "identity_mismatch");
    assert_eq!(body["message"], "Face does not match with user");
    assert!(body.get("prediction").is_none());
    assert!(store.list_by_user("u2").await.unwrap().is_empty());
}

#[tokio::test]
async fn process_image_no_face() {
    let (app, store) = setup(None, jakarta(3, 7, 45)).await;
    let (status, body) = send(&app, multipart(Some(b"fake-image"), Some("u1"))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "no_face_detected");
    assert!(store.list_by_user("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn process_image_outside_window() {
    // Saturday morning.
    let (app, _store) = setup(Some("alice"), jakarta(8, 7, 45)).await;
    let (status, body) = send(&app, multipart(Some(b"fake-image"), Some("u1"))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "time_window");
    assert!(body["message"].as_str().unwrap().contains("2024-06-08 07:45:00"));
}

#[tokio::test]
async fn process_image_missing_fields() {
    let (app, _store) = setup(Some("alice"), jakarta(3, 7, 45)).await;

    let (status, body) = send(&app, multipart(None, Some("u1"))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
    assert_eq!(body["message"], "image is required");

    let (status, body) = send(&app, multipart(Some(b"fake-image"), None)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["message"], "user_id is required");

    let not_multipart = Request::builder()
        .method("POST")
        .uri("/process-image")
        .header("content-type", "application/json")
        .body(Body::from("{}"))
        .unwrap();
    let (status, body) = send(&app, not_multipart).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["kind"], "validation");
}

#[tokio::test]
async fn attendance_listing() {
    let (app, _store) = setup(Some("alice"), jakarta(3, 7, 45)).await;
    send(&app, multipart(Some(b"fake-image"), Some("u1"))).await;

    let request = Request::builder()
        .uri("/attendance/u1")
        .body(Body::empty())
        .unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "success");
    let data = body["attendance_data"].as_array().unwrap();
    assert_eq!(data.len(), 1);
    assert_eq!(data[0]["user_id"], "u1");
    assert_eq!(data[0]["status"], "present");
    assert_eq!(data[0]["timestamp"], "2024-06-03T00:45:00Z");
    assert!(data[0]["id"].as_str().unwrap().len() == 36);
}

#[tokio::test]
async fn check_username() {
    let (app, _store) = setup(Some("alice"), jakarta(3, 7, 45)).await;
    let form = |name: &str| {
        Request::builder()
            .method("POST")
            .uri("/check_username")
            .header("content-type", "application/x-www-form-urlencoded")
            .body(Body::from(format!("username={name}")))
            .unwrap()
    };

    let (status, body) = send(&app, form("bob")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Success");

    let (status, body) = send(&app, form("mallory")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "Failed");
}

#[tokio::test]
async fn health() {
    let (app, _store) = setup(Some("alice"), jakarta(3, 7, 45)).await;
    let request = Request::builder().uri("/health").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["status"], "ok");
    assert_eq!(body["module"], "presenced");
    assert_eq!(body["models_loaded"], true);
}

#[tokio::test]
async fn oversized_upload_rejected() {
    let (app, store) = setup(Some("alice"), jakarta(3, 7, 45)).await;
    let big = vec![0u8; 2 * 1024 * 1024];
    let response = app.clone().oneshot(multipart(Some(&big), Some("u1"))).await.unwrap();

    assert_eq!(response.status(), StatusCode::PAYLOAD_TOO_LARGE);
    assert!(store.list_by_user("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn engine_fault_is_generic_500() {
    let store = Arc::new(SqliteStore::open_in_memory().await.unwrap());
    store.insert_user("u1", "alice", "hash").await.unwrap();
    let app = router_with(Arc::new(FaultyIdentifier), store.clone(), store.clone(), jakarta(3, 7, 45));

    let response = app.clone().oneshot(multipart(Some(b"fake-image"), Some("u1"))).await.unwrap();
    assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let text = String::from_utf8(bytes.to_vec()).unwrap();
    assert!(!text.contains("0xdeadbeef"));
    assert_eq!(serde_json::from_str::<Value>(&text).unwrap(), serde_json::json!({ "error": "internal error" }));
    assert!(store.list_by_user("u1").await.unwrap().is_empty());
}

#[tokio::test]
async fn store_failure_is_generic_500() {
    let store = Arc::new(UnreachableStore);
    let app = router_with(Arc::new(StubIdentifier(Some("alice"))), store.clone(), store, jakarta(3, 7, 45));

    let request = Request::builder().uri("/attendance/u1").body(Body::empty()).unwrap();
    let (status, body) = send(&app, request).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(body, serde_json::json!({ "error": "internal error" }));

    let check = Request::builder()
        .method("POST")
        .uri("/check_username")
        .header("content-type", "application/x-www-form-urlencoded")
        .body(Body::from("username=alice"))
        .unwrap();
    let (status, body) = send(&app, check).await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert!(!body.to_string().contains("timed out"));
}

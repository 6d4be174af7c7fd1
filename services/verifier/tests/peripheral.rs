mod common;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use common::{closed_address, peripheral_config, spawn_server, JPEG};
use condo_verifier::frame::MAX_FRAME_BYTES;
use condo_verifier::source::{AcquisitionSource, CaptureError, ConnectError, RemotePeripheral};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

#[derive(Clone, Default)]
struct Camera {
    requests: Arc<AtomicUsize>,
    timestamps: Arc<Mutex<Vec<String>>>,
    broken: Arc<AtomicBool>,
    oversized: Arc<AtomicBool>,
}

async fn shot(
    State(camera): State<Camera>,
    Query(params): Query<HashMap<String, String>>,
) -> impl IntoResponse {
    camera.requests.fetch_add(1, Ordering::SeqCst);
    if let Some(ts) = params.get("timestamp") {
        camera.timestamps.lock().push(ts.clone());
    }

    if camera.broken.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    if camera.oversized.load(Ordering::SeqCst) {
        let body = vec![0xFFu8; MAX_FRAME_BYTES + 1];
        return ([(header::CONTENT_TYPE, "image/jpeg")], body).into_response();
    }

    ([(header::CONTENT_TYPE, "image/jpeg")], JPEG).into_response()
}

async fn spawn_camera(camera: Camera) -> String {
    let router = Router::new()
        .route("/shot.jpg", get(shot))
        .with_state(camera);
    spawn_server(router).await
}

fn peripheral(base_url: &str) -> RemotePeripheral {
    RemotePeripheral::new(base_url, reqwest::Client::new(), peripheral_config()).unwrap()
}

#[tokio::test]
async fn test_connect_probe_and_capture() {
    let camera = Camera::default();
    let base = spawn_camera(camera.clone()).await;
    let mut source = peripheral(&format!("{}/", base));

    source.connect().await.unwrap();
    assert!(source.is_connected());
    assert_eq!(camera.requests.load(Ordering::SeqCst), 1);

    let frame = source.capture_frame().await.unwrap();
    assert_eq!(frame.bytes.as_ref(), JPEG);
    assert_eq!(frame.mime_type, "image/jpeg");
    assert_eq!(frame.source_id, format!("peripheral:{}", base));

    let timestamps = camera.timestamps.lock().clone();
    assert_eq!(timestamps.len(), 2);
    assert!(timestamps.iter().all(|ts| ts.parse::<i64>().is_ok()));

    source.disconnect();
    assert!(!source.is_connected());
    assert_eq!(source.capture_frame().await.unwrap_err(), CaptureError::NotConnected);
}

#[tokio::test]
async fn test_unreachable_peripheral() {
    let mut source = peripheral(&closed_address().await);

    let err = source.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Unreachable { .. }));
    assert!(!source.is_connected());
}

#[tokio::test]
async fn test_failing_probe_retries_then_gives_up() {
    let camera = Camera::default();
    camera.broken.store(true, Ordering::SeqCst);
    let base = spawn_camera(camera.clone()).await;
    let mut source = peripheral(&base);

    let err = source.connect().await.unwrap_err();
    assert!(matches!(err, ConnectError::Unreachable { .. }));
    assert_eq!(camera.requests.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn test_capture_failure_after_connect() {
    let camera = Camera::default();
    let base = spawn_camera(camera.clone()).await;
    let mut source = peripheral(&base);
    source.connect().await.unwrap();

    camera.broken.store(true, Ordering::SeqCst);
    let err = source.capture_frame().await.unwrap_err();
    assert!(matches!(err, CaptureError::BadResponse(_)));
    assert!(err.suppressed_when_scheduled());
}

#[tokio::test]
async fn test_oversized_snapshot_is_refused() {
    let camera = Camera::default();
    let base = spawn_camera(camera.clone()).await;
    let mut source = peripheral(&base);
    source.connect().await.unwrap();

    camera.oversized.store(true, Ordering::SeqCst);
    let err = source.capture_frame().await.unwrap_err();
    assert_eq!(
        err,
        CaptureError::TooLarge {
            limit: MAX_FRAME_BYTES
        }
    );
    assert!(!err.suppressed_when_scheduled());
}

mod common;

use axum::http::header;
use axum::routing::{get, post};
use axum::{Json, Router};
use common::{closed_address, matcher_config, peripheral_config, spawn_server, JPEG};
use condo_verifier::config::{CaptureConfig, DeviceConfig};
use condo_verifier::{
    ActivityEvent, ChannelRecorder, ControllerOptions, DefaultSourceFactory, DeviceRegistry,
    MatcherClient, Outcome, SessionController, SessionError, SessionState, SourceKind,
    VerificationMethod, VerificationSettings,
};
use std::sync::Arc;
use std::time::Duration;

async fn spawn_matcher() -> String {
    let router = Router::new()
        .route(
            "/api/v1/face/verify",
            post(|| async {
                Json(serde_json::json!({
                    "confidence": 91.0,
                    "matched_identity": {
                        "id": "res-12",
                        "display_name": "Carlos Lima",
                        "unit": "A-12"
                    }
                }))
            }),
        )
        .route("/health", get(|| async { "ok" }));
    spawn_server(router).await
}

async fn spawn_camera() -> String {
    let router = Router::new().route(
        "/shot.jpg",
        get(|| async { ([(header::CONTENT_TYPE, "image/jpeg")], JPEG) }),
    );
    spawn_server(router).await
}

fn controller(matcher: &str, recorder: ChannelRecorder) -> SessionController {
    let options = ControllerOptions {
        capture: CaptureConfig {
            local_interval_ms: 100,
            remote_interval_ms: 100,
        },
        ..ControllerOptions::default()
    };
    let factory = DefaultSourceFactory::new(
        peripheral_config(),
        DeviceConfig::default(),
        Arc::new(DeviceRegistry::new()),
    )
    .unwrap();

    SessionController::new(
        options,
        VerificationSettings::default(),
        Arc::new(MatcherClient::new(matcher_config(matcher)).unwrap()),
        Arc::new(factory),
        Arc::new(recorder),
    )
}

/// Manual verification, retrying while a scheduled tick holds the gate.
async fn manual_verify(
    controller: &SessionController,
) -> Result<condo_verifier::VerificationResult, SessionError> {
    loop {
        match controller.manual_verify().await {
            Err(SessionError::Busy) => tokio::time::sleep(Duration::from_millis(5)).await,
            other => return other,
        }
    }
}

async fn next_event(
    events: &mut tokio::sync::mpsc::Receiver<ActivityEvent>,
    method: VerificationMethod,
) -> ActivityEvent {
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let event = events.recv().await.unwrap();
            if event.method == method {
                return event;
            }
        }
    })
    .await
    .unwrap()
}

#[tokio::test]
async fn test_remote_session_end_to_end() {
    let matcher = spawn_matcher().await;
    let camera = spawn_camera().await;
    let (recorder, mut events) = ChannelRecorder::new(64);
    let controller = controller(&matcher, recorder);

    controller
        .start(SourceKind::RemotePeripheral { base_url: camera })
        .await
        .unwrap();
    assert_eq!(controller.state(), SessionState::Active);

    let result = manual_verify(&controller).await.unwrap();
    assert_eq!(result.outcome(), Outcome::Accepted);
    assert_eq!(result.matched_identity().unwrap().id, "res-12");

    let manual = next_event(&mut events, VerificationMethod::Manual).await;
    assert_eq!(manual.actor_description, "Carlos Lima (A-12)");

    let scheduled = next_event(&mut events, VerificationMethod::Scheduled).await;
    assert_eq!(scheduled.outcome, Outcome::Accepted);

    controller.stop().await;
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, SessionState::Stopped);
    assert!(snapshot.last_result.is_none());
}

#[tokio::test]
async fn test_matcher_down_surfaces_on_manual_only() {
    let matcher = closed_address().await;
    let camera = spawn_camera().await;
    let (recorder, _events) = ChannelRecorder::new(64);
    let controller = controller(&matcher, recorder);

    controller
        .start(SourceKind::RemotePeripheral { base_url: camera })
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_millis(350)).await;
    let snapshot = controller.snapshot();
    assert_eq!(snapshot.state, SessionState::Active);
    assert!(snapshot.last_error.is_none());
    assert!(snapshot.stats.failures >= 1);

    let err = manual_verify(&controller).await.unwrap_err();
    assert!(matches!(err, SessionError::Verify(_)));

    controller.stop().await;
}

#[tokio::test]
async fn test_local_device_without_backend_fails_to_connect() {
    if cfg!(feature = "gstreamer") {
        return;
    }

    let matcher = spawn_matcher().await;
    let (recorder, _events) = ChannelRecorder::new(8);
    let controller = controller(&matcher, recorder);

    let err = controller.start(SourceKind::LocalDevice).await.unwrap_err();
    assert!(matches!(err, SessionError::Connect(_)));
    assert_eq!(controller.state(), SessionState::Error);
}

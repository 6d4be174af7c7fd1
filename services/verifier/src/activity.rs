//! Activity log sink.
//!
//! Every completed verification is reported here. Recording is
//! fire-and-forget: the controller logs a failed `record` and moves on.

use crate::matcher::{Outcome, VerificationResult};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use thiserror::Error;
use tokio::sync::mpsc;
use tracing::info;
use uuid::Uuid;

/// Errors raised by an activity sink.
#[derive(Debug, Error)]
pub enum RecordError {
    #[error("Activity channel is full")]
    ChannelFull,

    #[error("Activity channel is closed")]
    ChannelClosed,

    #[error("Activity sink failed: {0}")]
    Sink(String),
}

/// What triggered a verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationMethod {
    Scheduled,
    Manual,
}

impl VerificationMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationMethod::Scheduled => "scheduled",
            VerificationMethod::Manual => "manual",
        }
    }
}

impl fmt::Display for VerificationMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One entry in the activity log.
#[derive(Debug, Clone, Serialize)]
pub struct ActivityEvent {
    pub id: Uuid,
    pub session_id: Uuid,
    /// Who was seen, e.g. "Ana Souza (Block B / 104)".
    pub actor_description: String,
    pub outcome: Outcome,
    pub confidence: f32,
    pub method: VerificationMethod,
    pub source: String,
    pub operator: String,
    pub timestamp: DateTime<Utc>,
}

impl ActivityEvent {
    pub fn from_result(
        session_id: Uuid,
        result: &VerificationResult,
        method: VerificationMethod,
        source: impl Into<String>,
        operator: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            session_id,
            actor_description: describe_actor(result),
            outcome: result.outcome(),
            confidence: result.confidence(),
            method,
            source: source.into(),
            operator: operator.into(),
            timestamp: Utc::now(),
        }
    }
}

fn describe_actor(result: &VerificationResult) -> String {
    match result.matched_identity() {
        Some(identity) => match &identity.unit {
            Some(unit) => format!("{} ({})", identity.display_name, unit),
            None => identity.display_name.clone(),
        },
        None => "Unrecognized visitor".to_string(),
    }
}

/// Destination for activity events.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ActivityRecorder: Send + Sync {
    async fn record(&self, event: ActivityEvent) -> Result<(), RecordError>;
}

/// Writes one structured log line per event.
#[derive(Debug, Default, Clone)]
pub struct TracingRecorder;

#[async_trait]
impl ActivityRecorder for TracingRecorder {
    async fn record(&self, event: ActivityEvent) -> Result<(), RecordError> {
        info!(
            target: "activity",
            event_id = %event.id,
            session_id = %event.session_id,
            actor = %event.actor_description,
            outcome = event.outcome.as_str(),
            confidence = event.confidence,
            method = %event.method,
            source = %event.source,
            operator = %event.operator,
            "Verification recorded"
        );
        Ok(())
    }
}

/// Forwards events into a bounded channel; a full channel drops the event.
#[derive(Debug, Clone)]
pub struct ChannelRecorder {
    tx: mpsc::Sender<ActivityEvent>,
}

impl ChannelRecorder {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ActivityEvent>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl ActivityRecorder for ChannelRecorder {
    async fn record(&self, event: ActivityEvent) -> Result<(), RecordError> {
        self.tx.try_send(event).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => RecordError::ChannelFull,
            mpsc::error::TrySendError::Closed(_) => RecordError::ChannelClosed,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::matcher::{MatchResponse, MatchedIdentity};
    use crate::settings::VerificationSettings;

    fn result(confidence: f32, unit: Option<&str>) -> VerificationResult {
        let response = MatchResponse {
            outcome: None,
            confidence,
            matched_identity: Some(MatchedIdentity {
                id: "42".to_string(),
                display_name: "Ana Souza".to_string(),
                unit: unit.map(str::to_string),
                document: None,
            }),
            stats: None,
        };
        VerificationResult::interpret(response, &VerificationSettings::default()).unwrap()
    }

    #[test]
    fn test_actor_description() {
        let session_id = Uuid::new_v4();

        let accepted = ActivityEvent::from_result(
            session_id,
            &result(88.0, Some("B-104")),
            VerificationMethod::Manual,
            "local_device",
            "gatehouse",
        );
        assert_eq!(accepted.actor_description, "Ana Souza (B-104)");
        assert_eq!(accepted.outcome, Outcome::Accepted);

        let rejected = ActivityEvent::from_result(
            session_id,
            &result(40.0, Some("B-104")),
            VerificationMethod::Scheduled,
            "local_device",
            "gatehouse",
        );
        assert_eq!(rejected.actor_description, "Unrecognized visitor");
        assert_eq!(rejected.outcome, Outcome::Rejected);
    }

    #[tokio::test]
    async fn test_channel_recorder_drops_when_full() {
        let (recorder, mut rx) = ChannelRecorder::new(1);
        let event = ActivityEvent::from_result(
            Uuid::new_v4(),
            &result(90.0, None),
            VerificationMethod::Scheduled,
            "static_upload",
            "gatehouse",
        );

        recorder.record(event.clone()).await.unwrap();
        assert!(matches!(
            recorder.record(event.clone()).await,
            Err(RecordError::ChannelFull)
        ));

        let received = rx.recv().await.unwrap();
        assert_eq!(received.actor_description, "Ana Souza");

        drop(rx);
        assert!(matches!(
            recorder.record(event).await,
            Err(RecordError::ChannelClosed)
        ));
    }

    #[tokio::test]
    async fn test_tracing_recorder_never_fails() {
        let event = ActivityEvent::from_result(
            Uuid::new_v4(),
            &result(75.0, None),
            VerificationMethod::Manual,
            "local_device",
            "gatehouse",
        );
        assert!(TracingRecorder.record(event).await.is_ok());
    }
}

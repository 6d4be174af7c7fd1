//! Network camera peripheral polled over HTTP.
//!
//! The peripheral serves its current picture at `{base_url}/shot.jpg`. Every
//! request carries a `timestamp` query parameter so intermediate caches never
//! return a stale picture.

use super::{AcquisitionSource, CaptureError, ConnectError, SourceKind};
use crate::config::PeripheralConfig;
use crate::frame::{Frame, MAX_FRAME_BYTES};
use async_trait::async_trait;
use backoff::{backoff::Backoff, ExponentialBackoff};
use bytes::{Bytes, BytesMut};
use chrono::Utc;
use reqwest::header::CONTENT_TYPE;
use reqwest::Url;
use tracing::{debug, info, warn};

const SNAPSHOT_PATH: &str = "shot.jpg";

/// Why a single snapshot request failed.
#[derive(Debug)]
enum SnapshotFailure {
    Timeout,
    Unreachable(String),
    BadResponse(String),
    TooLarge,
}

impl From<reqwest::Error> for SnapshotFailure {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            SnapshotFailure::Timeout
        } else {
            SnapshotFailure::Unreachable(e.to_string())
        }
    }
}

/// Remote camera peripheral adapter.
pub struct RemotePeripheral {
    kind: SourceKind,
    snapshot_url: Url,
    client: reqwest::Client,
    config: PeripheralConfig,
    connected: bool,
    source_id: String,
}

impl RemotePeripheral {
    pub fn new(
        base_url: &str,
        client: reqwest::Client,
        config: PeripheralConfig,
    ) -> Result<Self, ConnectError> {
        let trimmed = base_url.trim().trim_end_matches('/');
        if !trimmed.starts_with("http://") && !trimmed.starts_with("https://") {
            return Err(ConnectError::InvalidAddress(base_url.to_string()));
        }

        let snapshot_url = Url::parse(&format!("{}/{}", trimmed, SNAPSHOT_PATH))
            .map_err(|e| ConnectError::InvalidAddress(format!("{}: {}", base_url, e)))?;

        Ok(Self {
            kind: SourceKind::RemotePeripheral {
                base_url: trimmed.to_string(),
            },
            snapshot_url,
            client,
            config,
            connected: false,
            source_id: format!("peripheral:{}", trimmed),
        })
    }

    /// Snapshot URL with a fresh cache-busting timestamp.
    pub fn snapshot_url(&self) -> Url {
        let mut url = self.snapshot_url.clone();
        url.query_pairs_mut()
            .append_pair("timestamp", &Utc::now().timestamp_millis().to_string());
        url
    }

    async fn fetch_snapshot(&self) -> Result<(Bytes, String), SnapshotFailure> {
        let url = self.snapshot_url();
        debug!(url = %url, "Requesting peripheral snapshot");

        let mut resp = self
            .client
            .get(url)
            .timeout(self.config.snapshot_timeout())
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(SnapshotFailure::BadResponse(format!(
                "status {}",
                resp.status()
            )));
        }

        let mime_type = resp
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("image/jpeg")
            .to_string();

        if resp
            .content_length()
            .is_some_and(|len| len > MAX_FRAME_BYTES as u64)
        {
            return Err(SnapshotFailure::TooLarge);
        }

        // Chunked replies carry no length; stop reading at the frame limit.
        let mut body = BytesMut::new();
        while let Some(chunk) = resp.chunk().await? {
            if body.len() + chunk.len() > MAX_FRAME_BYTES {
                return Err(SnapshotFailure::TooLarge);
            }
            body.extend_from_slice(&chunk);
        }
        let body = body.freeze();

        if body.is_empty() {
            return Err(SnapshotFailure::BadResponse("an empty snapshot".to_string()));
        }

        Ok((body, mime_type))
    }

    fn target(&self) -> String {
        self.snapshot_url.to_string()
    }
}

#[async_trait]
impl AcquisitionSource for RemotePeripheral {
    fn kind(&self) -> &SourceKind {
        &self.kind
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    /// Reachability probe with exponential backoff.
    async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.connected {
            return Ok(());
        }

        let mut backoff = ExponentialBackoff {
            initial_interval: self.config.reconnect_base_delay(),
            max_interval: self.config.reconnect_max_delay(),
            max_elapsed_time: None,
            ..Default::default()
        };

        let max_attempts = self.config.max_connect_attempts.max(1);
        let mut attempts = 0u32;

        loop {
            attempts += 1;

            let failure = match self.fetch_snapshot().await {
                Ok((body, _)) => {
                    self.connected = true;
                    info!(
                        source_id = %self.source_id,
                        attempts = attempts,
                        probe_bytes = body.len(),
                        "Peripheral reachable"
                    );
                    return Ok(());
                }
                Err(failure) => failure,
            };

            if attempts >= max_attempts {
                warn!(
                    source_id = %self.source_id,
                    attempts = attempts,
                    error = ?failure,
                    "Peripheral probe failed"
                );
                return Err(match failure {
                    SnapshotFailure::Timeout => ConnectError::Timeout {
                        target: self.target(),
                    },
                    SnapshotFailure::Unreachable(reason) | SnapshotFailure::BadResponse(reason) => {
                        ConnectError::Unreachable {
                            target: self.target(),
                            reason,
                        }
                    }
                    SnapshotFailure::TooLarge => ConnectError::Unreachable {
                        target: self.target(),
                        reason: format!("snapshot larger than {} bytes", MAX_FRAME_BYTES),
                    },
                });
            }

            if let Some(delay) = backoff.next_backoff() {
                debug!(
                    source_id = %self.source_id,
                    attempt = attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = ?failure,
                    "Peripheral probe failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }

    async fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.connected {
            return Err(CaptureError::NotConnected);
        }

        match self.fetch_snapshot().await {
            Ok((body, mime_type)) => Ok(Frame::new(body, mime_type, self.source_id.clone())),
            Err(SnapshotFailure::Timeout) => Err(CaptureError::Timeout),
            Err(SnapshotFailure::Unreachable(reason)) => Err(CaptureError::Unreachable(reason)),
            Err(SnapshotFailure::BadResponse(reason)) => Err(CaptureError::BadResponse(reason)),
            Err(SnapshotFailure::TooLarge) => Err(CaptureError::TooLarge {
                limit: MAX_FRAME_BYTES,
            }),
        }
    }

    fn disconnect(&mut self) {
        if self.connected {
            self.connected = false;
            info!(source_id = %self.source_id, "Peripheral released");
        }
    }
}

//! Client for the remote face-matching service.
//!
//! All transport failures are classified here, once, so the session
//! controller only has to decide whether a class is surfaced or suppressed.
//! A below-threshold match is not a failure: it comes back as a
//! [`VerificationResult`] with outcome `REJECTED`.

use crate::config::MatcherConfig;
use crate::frame::{ValidatedFrame, ValidationError};
use crate::settings::VerificationSettings;
use async_trait::async_trait;
use bytes::Bytes;
use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};
use thiserror::Error;
use tracing::{debug, warn};

/// Classified verification failures.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum VerifyError {
    #[error("Frame rejected before sending: {0}")]
    Validation(#[from] ValidationError),

    #[error("Matcher unreachable: {0}")]
    Connectivity(String),

    #[error("Matcher did not answer within {0:?}")]
    Timeout(Duration),

    #[error("Matcher error: {0}")]
    Server(String),
}

impl VerifyError {
    /// Transport classes are logged and swallowed by the live loop.
    pub fn suppressed_when_scheduled(&self) -> bool {
        matches!(
            self,
            VerifyError::Connectivity(_) | VerifyError::Timeout(_) | VerifyError::Server(_)
        )
    }

    pub fn class(&self) -> &'static str {
        match self {
            VerifyError::Validation(_) => "validation",
            VerifyError::Connectivity(_) => "connectivity",
            VerifyError::Timeout(_) => "timeout",
            VerifyError::Server(_) => "server",
        }
    }
}

/// Map a transport error onto the verification taxonomy.
fn classify(err: reqwest::Error, timeout: Duration) -> VerifyError {
    if err.is_timeout() {
        VerifyError::Timeout(timeout)
    } else if err.is_status() || err.is_decode() || err.is_body() {
        VerifyError::Server(err.to_string())
    } else {
        VerifyError::Connectivity(err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Outcome {
    Accepted,
    Rejected,
}

impl Outcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            Outcome::Accepted => "ACCEPTED",
            Outcome::Rejected => "REJECTED",
        }
    }
}

/// Enrolled identity returned on a match.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchedIdentity {
    pub id: String,
    pub display_name: String,
    #[serde(default)]
    pub unit: Option<String>,
    #[serde(default)]
    pub document: Option<String>,
}

/// Search statistics reported by the matcher.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchStats {
    #[serde(default)]
    pub candidates_scanned: u64,
    #[serde(default)]
    pub comparisons: u64,
    #[serde(default)]
    pub above_threshold: u64,
    #[serde(default)]
    pub processing_ms: u64,
}

/// Accepted results always carry the matched identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Verdict {
    Accepted {
        #[serde(rename = "matched_identity")]
        identity: MatchedIdentity,
    },
    Rejected,
}

/// Interpreted answer of one verification call.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct VerificationResult {
    #[serde(flatten)]
    verdict: Verdict,
    confidence: f32,
    threshold_used: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<MatchStats>,
}

impl VerificationResult {
    pub fn outcome(&self) -> Outcome {
        match self.verdict {
            Verdict::Accepted { .. } => Outcome::Accepted,
            Verdict::Rejected => Outcome::Rejected,
        }
    }

    pub fn is_accepted(&self) -> bool {
        self.outcome() == Outcome::Accepted
    }

    pub fn matched_identity(&self) -> Option<&MatchedIdentity> {
        match &self.verdict {
            Verdict::Accepted { identity } => Some(identity),
            Verdict::Rejected => None,
        }
    }

    pub fn verdict(&self) -> &Verdict {
        &self.verdict
    }

    pub fn confidence(&self) -> f32 {
        self.confidence
    }

    pub fn threshold_used(&self) -> f32 {
        self.threshold_used
    }

    pub fn stats(&self) -> Option<&MatchStats> {
        self.stats.as_ref()
    }

    /// Build a result from a successful matcher response.
    ///
    /// Accepted only when the matcher did not reject, the confidence reaches
    /// the threshold and an identity came back.
    pub fn interpret(
        response: MatchResponse,
        settings: &VerificationSettings,
    ) -> Result<Self, VerifyError> {
        let confidence = response.confidence;
        if !confidence.is_finite() || !(0.0..=100.0).contains(&confidence) {
            return Err(VerifyError::Server(format!(
                "confidence {} outside [0, 100]",
                confidence
            )));
        }

        let threshold = settings.confidence_threshold();
        let remote_rejected = response
            .outcome
            .as_deref()
            .is_some_and(|o| o.eq_ignore_ascii_case("rejected"));

        let verdict = match response.matched_identity {
            Some(identity) if !remote_rejected && confidence >= threshold => {
                Verdict::Accepted { identity }
            }
            _ => Verdict::Rejected,
        };

        Ok(Self {
            verdict,
            confidence,
            threshold_used: threshold,
            stats: response.stats,
        })
    }
}

/// Wire format of the matcher's answer.
#[derive(Debug, Clone, Deserialize)]
pub struct MatchResponse {
    #[serde(default)]
    pub outcome: Option<String>,
    pub confidence: f32,
    #[serde(default)]
    pub matched_identity: Option<MatchedIdentity>,
    #[serde(default)]
    pub stats: Option<MatchStats>,
}

/// Remote matching capability used by the session controller.
#[async_trait]
pub trait VerificationBackend: Send + Sync {
    /// Probe the service; a failure carries a human-readable diagnostic.
    async fn health_check(&self) -> Result<(), VerifyError>;

    async fn verify(
        &self,
        frame: &ValidatedFrame,
        settings: &VerificationSettings,
    ) -> Result<VerificationResult, VerifyError>;
}

/// HTTP matcher client.
pub struct MatcherClient {
    client: reqwest::Client,
    verify_url: String,
    health_url: String,
    config: MatcherConfig,
}

impl MatcherClient {
    pub fn new(config: MatcherConfig) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout())
            .build()?;

        let base = config.endpoint.trim_end_matches('/');
        Ok(Self {
            client,
            verify_url: format!("{}{}", base, config.verify_path),
            health_url: format!("{}{}", base, config.health_path),
            config,
        })
    }

    pub fn verify_url(&self) -> &str {
        &self.verify_url
    }

    fn build_form(
        frame: &ValidatedFrame,
        settings: &VerificationSettings,
    ) -> Result<Form, VerifyError> {
        let format = frame.format();
        let inner = frame.frame();

        let image = image_part(inner.bytes.clone(), format.file_name(), format.mime_type())?;

        Ok(Form::new()
            .part("image", image)
            .text("threshold", settings.confidence_threshold().to_string())
            .text("scope", settings.search_scope().as_str())
            .text("engine_mode", settings.engine_mode().as_str())
            .text("captured_at", inner.captured_at.to_rfc3339())
            .text("source_id", inner.source_id.clone()))
    }
}

/// The `image` form part; a MIME type reqwest cannot encode is a frame fault.
fn image_part(bytes: Bytes, file_name: &'static str, mime: &str) -> Result<Part, VerifyError> {
    Part::stream(reqwest::Body::from(bytes))
        .file_name(file_name)
        .mime_str(mime)
        .map_err(|_| VerifyError::Validation(ValidationError::UnsupportedType(mime.to_string())))
}

#[async_trait]
impl VerificationBackend for MatcherClient {
    async fn health_check(&self) -> Result<(), VerifyError> {
        let timeout = self.config.health_timeout();
        let resp = self
            .client
            .get(&self.health_url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| match classify(e, timeout) {
                VerifyError::Connectivity(reason) => VerifyError::Connectivity(format!(
                    "health probe {} failed: {}",
                    self.health_url, reason
                )),
                other => other,
            })?;

        if !resp.status().is_success() {
            return Err(VerifyError::Connectivity(format!(
                "health probe {} returned {}",
                self.health_url,
                resp.status()
            )));
        }

        Ok(())
    }

    async fn verify(
        &self,
        frame: &ValidatedFrame,
        settings: &VerificationSettings,
    ) -> Result<VerificationResult, VerifyError> {
        let timeout = self.config.request_timeout(settings.engine_mode());
        let form = Self::build_form(frame, settings)?;
        let started = Instant::now();

        let resp = self
            .client
            .post(&self.verify_url)
            .timeout(timeout)
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify(e, timeout))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            warn!(status = %status, body = %body, "Matcher returned failure status");
            return Err(VerifyError::Server(format!("status {}", status)));
        }

        let response: MatchResponse = resp.json().await.map_err(|e| classify(e, timeout))?;
        let result = VerificationResult::interpret(response, settings)?;

        debug!(
            outcome = result.outcome().as_str(),
            confidence = result.confidence(),
            threshold = result.threshold_used(),
            engine_mode = %settings.engine_mode(),
            latency_ms = started.elapsed().as_millis() as u64,
            "Verification completed"
        );

        Ok(result)
    }
}

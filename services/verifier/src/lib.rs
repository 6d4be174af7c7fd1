//! Condo Verifier - live identity-verification capture for the security panel
//!
//! This library drives a capture session against a remote face-matching
//! service. It handles:
//!
//! - Frame acquisition from a local camera, a network camera peripheral or a
//!   static upload
//! - Pre-flight validation of every frame before it is sent
//! - Periodic (scheduled) and operator-triggered (manual) verification
//! - Activity logging of every completed verification
//!
//! # Architecture
//!
//! ```text
//! AcquisitionSource -> frame::validate -> VerificationBackend -> SessionSnapshot
//!          ^                                                        |
//!          +------------- SessionController (FSM) <-----------------+
//! ```
//!
//! # Example
//!
//! ```rust,no_run
//! use condo_verifier::prelude::*;
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = VerifierConfig::load()?;
//!     let backend = Arc::new(MatcherClient::new(config.matcher.clone())?);
//!     let factory = Arc::new(DefaultSourceFactory::new(
//!         config.peripheral.clone(),
//!         config.device.clone(),
//!         Arc::new(DeviceRegistry::new()),
//!     )?);
//!
//!     let controller = SessionController::new(
//!         ControllerOptions::from_config(&config),
//!         config.verification.to_settings()?,
//!         backend,
//!         factory,
//!         Arc::new(TracingRecorder),
//!     );
//!
//!     controller.start(SourceKind::LocalDevice).await?;
//!     let result = controller.manual_verify().await?;
//!     println!("{} ({:.1})", result.outcome().as_str(), result.confidence());
//!     controller.stop().await;
//!     Ok(())
//! }
//! ```

pub mod activity;
pub mod config;
pub mod frame;
pub mod matcher;
pub mod scheduler;
pub mod session;
pub mod settings;
pub mod source;

// Re-export main types
pub use activity::{
    ActivityEvent, ActivityRecorder, ChannelRecorder, RecordError, TracingRecorder,
    VerificationMethod,
};
pub use config::{ConfigValidationError, VerifierConfig};
pub use frame::{Frame, ImageFormat, ValidatedFrame, ValidationError, MAX_FRAME_BYTES};
pub use matcher::{
    MatchStats, MatchedIdentity, MatcherClient, Outcome, VerificationBackend, VerificationResult,
    VerifyError,
};
pub use session::{
    ControllerOptions, SessionController, SessionError, SessionSnapshot, SessionState,
    SessionStats,
};
pub use settings::{EngineMode, SearchScope, SettingsError, VerificationSettings};
pub use source::{
    AcquisitionSource, CaptureError, ConnectError, DefaultSourceFactory, DeviceRegistry,
    SourceFactory, SourceKind,
};

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::activity::{ActivityRecorder, TracingRecorder};
    pub use crate::config::VerifierConfig;
    pub use crate::matcher::{MatcherClient, VerificationBackend, VerificationResult};
    pub use crate::session::{ControllerOptions, SessionController, SessionError, SessionState};
    pub use crate::settings::{EngineMode, SearchScope, VerificationSettings};
    pub use crate::source::{DefaultSourceFactory, DeviceRegistry, SourceKind};
}

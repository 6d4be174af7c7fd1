//! Condo Verifier runner
//!
//! Runs one capture session against the remote matcher: connects the
//! configured source, lets the scheduler verify live frames until shutdown,
//! and logs a status line at a fixed interval.
//!
//! # Architecture
//!
//! ```text
//! Camera / Peripheral / Upload -> SessionController -> Matcher Service
//!                                        |
//!                                        +-> Activity log
//! ```
//!
//! # Configuration
//!
//! Configuration is loaded from:
//! 1. Configuration files (config/default.toml, config/{env}.toml)
//! 2. Environment variables (prefixed with VERIFIER_)
//!
//! See `config.rs` for detailed configuration options.

use anyhow::Context;
use bytes::Bytes;
use condo_verifier::config::{LoggingConfig, VerifierConfig};
use condo_verifier::{
    ControllerOptions, DefaultSourceFactory, DeviceRegistry, MatcherClient, SessionController,
    SessionState, SourceKind, TracingRecorder,
};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{error, info, warn, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration
    let config = load_config()?;

    // Initialize logging
    init_logging(&config.logging)?;

    info!(
        service = "condo-verifier",
        version = env!("CARGO_PKG_VERSION"),
        source = %config.session.source,
        matcher = %config.matcher.endpoint,
        "Starting verification service"
    );

    // Validate configuration
    config.validate()?;

    let result = run_session(config).await;

    match result {
        Ok(()) => {
            info!("Verification service completed successfully");
        }
        Err(e) => {
            error!(error = %e, "Verification service failed");
            return Err(e);
        }
    }

    Ok(())
}

/// Load configuration.
fn load_config() -> anyhow::Result<VerifierConfig> {
    // Try loading from files first, fall back to environment
    let config = VerifierConfig::load().or_else(|e| {
        warn!(error = %e, "Failed to load config from files, trying environment");
        VerifierConfig::from_env()
    })?;

    Ok(config)
}

/// Initialize the tracing/logging subsystem.
fn init_logging(config: &LoggingConfig) -> anyhow::Result<()> {
    let level = match config.level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let filter = EnvFilter::from_default_env()
        .add_directive(format!("condo_verifier={}", level).parse()?)
        .add_directive(format!("activity={}", level).parse()?)
        .add_directive("gstreamer=warn".parse()?)
        .add_directive("reqwest=info".parse()?);

    let subscriber = tracing_subscriber::registry().with(filter);

    if config.format == "json" {
        subscriber
            .with(
                fmt::layer()
                    .json()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    } else {
        subscriber
            .with(
                fmt::layer()
                    .pretty()
                    .with_file(config.include_location)
                    .with_line_number(config.include_location),
            )
            .init();
    }

    Ok(())
}

/// Map the configured source name onto a source kind.
fn source_kind(config: &VerifierConfig) -> anyhow::Result<SourceKind> {
    match config.session.source.as_str() {
        "local" => Ok(SourceKind::LocalDevice),
        "remote" => {
            let base_url = config
                .peripheral
                .base_url
                .clone()
                .context("peripheral.base_url is required for the remote source")?;
            Ok(SourceKind::RemotePeripheral { base_url })
        }
        "upload" => Ok(SourceKind::StaticUpload),
        other => anyhow::bail!("Unknown source '{}'", other),
    }
}

/// Guess the declared type of an uploaded picture from its extension.
fn mime_for_path(path: &Path) -> &'static str {
    match path
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("png") => "image/png",
        Some("jpg") | Some("jpeg") => "image/jpeg",
        _ => "application/octet-stream",
    }
}

/// Build the controller and run the configured session until shutdown.
async fn run_session(config: VerifierConfig) -> anyhow::Result<()> {
    let kind = source_kind(&config)?;

    let backend = Arc::new(
        MatcherClient::new(config.matcher.clone()).context("Failed to build matcher client")?,
    );
    let factory = Arc::new(
        DefaultSourceFactory::new(
            config.peripheral.clone(),
            config.device.clone(),
            Arc::new(DeviceRegistry::new()),
        )
        .context("Failed to build source factory")?,
    );

    let controller = SessionController::new(
        ControllerOptions::from_config(&config),
        config.verification.to_settings()?,
        backend,
        factory,
        Arc::new(TracingRecorder),
    );

    info!(source = %kind, "Starting capture session...");
    controller.start(kind.clone()).await?;

    if kind == SourceKind::StaticUpload {
        return verify_upload(&controller, &config).await;
    }

    // Spawn the status logging task
    let status_handle = tokio::spawn({
        let controller = controller.clone();
        let interval = Duration::from_secs(config.session.status_interval_secs.max(1));
        async move {
            run_status_monitor(controller, interval).await;
        }
    });

    shutdown_signal().await;
    info!("Initiating graceful shutdown...");

    status_handle.abort();
    controller.stop().await;

    // Log final statistics
    log_final_stats(&controller);

    info!("Shutdown complete");
    Ok(())
}

/// Verify the configured upload once and stop.
async fn verify_upload(
    controller: &SessionController,
    config: &VerifierConfig,
) -> anyhow::Result<()> {
    let path = config
        .session
        .upload_path
        .as_deref()
        .context("session.upload_path is required for the upload source")?;
    let path = Path::new(path);

    let bytes = tokio::fs::read(path)
        .await
        .with_context(|| format!("Failed to read upload {}", path.display()))?;

    controller
        .load_upload(Bytes::from(bytes), mime_for_path(path))
        .await?;

    let outcome = controller.manual_verify().await;
    controller.stop().await;

    let result = outcome?;
    info!(
        outcome = result.outcome().as_str(),
        confidence = result.confidence(),
        threshold = result.threshold_used(),
        identity = ?result.matched_identity().map(|i| i.display_name.as_str()),
        "Upload verified"
    );

    Ok(())
}

/// Log a status line at a fixed interval.
async fn run_status_monitor(controller: SessionController, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await;

    loop {
        ticker.tick().await;

        let snapshot = controller.snapshot();
        if snapshot.state == SessionState::Stopped {
            break;
        }

        info!(
            state = %snapshot.state,
            ticks = snapshot.stats.ticks,
            ticks_suppressed = snapshot.stats.ticks_suppressed,
            ticks_dropped = snapshot.stats.ticks_dropped,
            verifications = snapshot.stats.verifications,
            failures = snapshot.stats.failures,
            last_outcome = ?snapshot.last_result.as_ref().map(|r| r.outcome().as_str()),
            last_error = ?snapshot.last_error,
            "Session status"
        );
    }
}

/// Wait for Ctrl+C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }

    info!("Received shutdown signal");
}

/// Log final statistics on shutdown.
fn log_final_stats(controller: &SessionController) {
    let snapshot = controller.snapshot();
    info!(
        session_id = ?snapshot.session_id,
        ticks = snapshot.stats.ticks,
        ticks_suppressed = snapshot.stats.ticks_suppressed,
        ticks_dropped = snapshot.stats.ticks_dropped,
        verifications = snapshot.stats.verifications,
        failures = snapshot.stats.failures,
        "Session final stats"
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    fn create_test_config(source: &str) -> VerifierConfig {
        let mut config: VerifierConfig = serde_json::from_value(serde_json::json!({
            "matcher": { "endpoint": "http://matcher:8000" },
            "peripheral": { "base_url": "http://192.168.1.40:8080" }
        }))
        .unwrap();
        config.session.source = source.to_string();
        config
    }

    #[test]
    fn test_source_kind_from_config() {
        assert_eq!(
            source_kind(&create_test_config("local")).unwrap(),
            SourceKind::LocalDevice
        );
        assert_eq!(
            source_kind(&create_test_config("remote")).unwrap(),
            SourceKind::RemotePeripheral {
                base_url: "http://192.168.1.40:8080".to_string()
            }
        );
        assert_eq!(
            source_kind(&create_test_config("upload")).unwrap(),
            SourceKind::StaticUpload
        );
        assert!(source_kind(&create_test_config("webcam")).is_err());
    }

    #[test]
    fn test_mime_for_path() {
        assert_eq!(mime_for_path(Path::new("visitor.PNG")), "image/png");
        assert_eq!(mime_for_path(Path::new("/tmp/visitor.jpeg")), "image/jpeg");
        assert_eq!(mime_for_path(Path::new("visitor.gif")), "application/octet-stream");
    }
}

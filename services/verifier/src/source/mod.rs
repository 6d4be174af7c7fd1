//! Acquisition sources: where frames come from.
//!
//! A session owns exactly one [`AcquisitionSource`] at a time. Adapters exist
//! for a local camera device, a network camera peripheral and a static
//! upload; the [`SourceFactory`] builds them from a [`SourceKind`].

pub mod local;
pub mod peripheral;
pub mod upload;

#[cfg(feature = "gstreamer")]
pub mod gst_camera;

use crate::config::{CaptureConfig, DeviceConfig, PeripheralConfig};
use crate::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub use local::{CameraBackend, CameraError, DeviceLease, DeviceRegistry, LocalDevice};
pub use peripheral::RemotePeripheral;
pub use upload::StaticUpload;

/// Errors raised while acquiring a source.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("{target} is unreachable: {reason}")]
    Unreachable { target: String, reason: String },

    #[error("Timed out connecting to {target}")]
    Timeout { target: String },

    #[error("Camera device {0} is already in use")]
    DeviceBusy(String),

    #[error("Camera device unavailable: {0}")]
    DeviceUnavailable(String),

    #[error("Invalid peripheral address: {0}")]
    InvalidAddress(String),
}

/// Errors raised while capturing a frame.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CaptureError {
    #[error("Source is not connected")]
    NotConnected,

    #[error("No upload has been selected")]
    NoUpload,

    #[error("{0} sources do not accept uploads")]
    UploadNotSupported(&'static str),

    #[error("Camera device error: {0}")]
    Device(String),

    #[error("Peripheral unreachable: {0}")]
    Unreachable(String),

    #[error("Peripheral returned {0}")]
    BadResponse(String),

    #[error("Timed out waiting for a frame")]
    Timeout,

    #[error("Peripheral snapshot exceeds the {limit} byte limit")]
    TooLarge { limit: usize },
}

impl CaptureError {
    /// Network blips from a peripheral are treated like matcher connectivity
    /// failures by the live loop.
    pub fn suppressed_when_scheduled(&self) -> bool {
        matches!(
            self,
            CaptureError::Unreachable(_) | CaptureError::BadResponse(_) | CaptureError::Timeout
        )
    }
}

/// Identity of an acquisition source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceKind {
    LocalDevice,
    RemotePeripheral { base_url: String },
    StaticUpload,
}

impl SourceKind {
    pub fn label(&self) -> &'static str {
        match self {
            SourceKind::LocalDevice => "local_device",
            SourceKind::RemotePeripheral { .. } => "remote_peripheral",
            SourceKind::StaticUpload => "static_upload",
        }
    }

    /// Scheduler cadence for this kind; uploads have no live feed.
    pub fn tick_interval(&self, config: &CaptureConfig) -> Option<Duration> {
        match self {
            SourceKind::LocalDevice => Some(config.local_interval()),
            SourceKind::RemotePeripheral { .. } => Some(config.remote_interval()),
            SourceKind::StaticUpload => None,
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::RemotePeripheral { base_url } => write!(f, "remote_peripheral({})", base_url),
            other => f.write_str(other.label()),
        }
    }
}

/// Capability interface every source adapter implements.
///
/// `disconnect` is synchronous and idempotent so that teardown completes on
/// every exit path, including ones reached from a cancelled future.
#[async_trait]
pub trait AcquisitionSource: Send {
    fn kind(&self) -> &SourceKind;

    fn source_id(&self) -> &str;

    fn is_connected(&self) -> bool;

    async fn connect(&mut self) -> Result<(), ConnectError>;

    async fn capture_frame(&mut self) -> Result<Frame, CaptureError>;

    fn disconnect(&mut self);

    /// Supply the payload a static upload will return.
    fn load_upload(&mut self, _bytes: Bytes, _mime_type: &str) -> Result<(), CaptureError> {
        Err(CaptureError::UploadNotSupported(self.kind().label()))
    }
}

/// Builds source adapters for a [`SourceKind`].
pub trait SourceFactory: Send + Sync {
    fn create(&self, kind: &SourceKind) -> Result<Box<dyn AcquisitionSource>, ConnectError>;
}

/// Factory producing the real adapters.
pub struct DefaultSourceFactory {
    peripheral: PeripheralConfig,
    device: DeviceConfig,
    http: reqwest::Client,
    registry: Arc<DeviceRegistry>,
}

impl DefaultSourceFactory {
    pub fn new(
        peripheral: PeripheralConfig,
        device: DeviceConfig,
        registry: Arc<DeviceRegistry>,
    ) -> Result<Self, reqwest::Error> {
        let http = reqwest::Client::builder()
            .connect_timeout(peripheral.snapshot_timeout())
            .build()?;

        Ok(Self {
            peripheral,
            device,
            http,
            registry,
        })
    }
}

impl SourceFactory for DefaultSourceFactory {
    fn create(&self, kind: &SourceKind) -> Result<Box<dyn AcquisitionSource>, ConnectError> {
        match kind {
            SourceKind::LocalDevice => Ok(Box::new(LocalDevice::new(
                self.device.clone(),
                self.registry.clone(),
                local::default_backend(&self.device),
            ))),
            SourceKind::RemotePeripheral { base_url } => Ok(Box::new(RemotePeripheral::new(
                base_url,
                self.http.clone(),
                self.peripheral.clone(),
            )?)),
            SourceKind::StaticUpload => Ok(Box::new(StaticUpload::new())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tick_interval_per_kind() {
        let config = CaptureConfig::default();
        assert_eq!(
            SourceKind::LocalDevice.tick_interval(&config),
            Some(Duration::from_millis(1500))
        );
        assert_eq!(
            SourceKind::RemotePeripheral {
                base_url: "http://cam".to_string()
            }
            .tick_interval(&config),
            Some(Duration::from_millis(3000))
        );
        assert_eq!(SourceKind::StaticUpload.tick_interval(&config), None);
    }

    #[test]
    fn test_capture_error_disposition() {
        assert!(CaptureError::Timeout.suppressed_when_scheduled());
        assert!(CaptureError::Unreachable("refused".into()).suppressed_when_scheduled());
        assert!(!CaptureError::Device("unplugged".into()).suppressed_when_scheduled());
        assert!(!CaptureError::NoUpload.suppressed_when_scheduled());
    }

    #[test]
    fn test_factory_rejects_bad_peripheral_address() {
        let factory = DefaultSourceFactory::new(
            PeripheralConfig::default(),
            DeviceConfig::default(),
            Arc::new(DeviceRegistry::new()),
        )
        .unwrap();

        let result = factory.create(&SourceKind::RemotePeripheral {
            base_url: "ftp://camera".to_string(),
        });
        assert!(matches!(result, Err(ConnectError::InvalidAddress(_))));
    }

    #[test]
    fn test_default_upload_rejection() {
        let factory = DefaultSourceFactory::new(
            PeripheralConfig::default(),
            DeviceConfig::default(),
            Arc::new(DeviceRegistry::new()),
        )
        .unwrap();

        let mut local = factory.create(&SourceKind::LocalDevice).unwrap();
        assert_eq!(
            local.load_upload(Bytes::from_static(b"x"), "image/png"),
            Err(CaptureError::UploadNotSupported("local_device"))
        );
    }
}

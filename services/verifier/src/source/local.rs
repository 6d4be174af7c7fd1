//! Local camera device with exclusive access.
//!
//! A camera node can only be opened by one consumer at a time, so connecting
//! takes a lease from the [`DeviceRegistry`] before the backend is opened.
//! The lease is returned on `disconnect`.

use super::{AcquisitionSource, CaptureError, ConnectError, SourceKind};
use crate::config::DeviceConfig;
use crate::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};

/// Errors reported by a camera backend.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CameraError {
    #[error("Camera backend unavailable: {0}")]
    Unavailable(String),

    #[error("Failed to open camera: {0}")]
    Open(String),

    #[error("Failed to grab frame: {0}")]
    Grab(String),

    #[error("No frame within the grab timeout")]
    Timeout,
}

/// Platform capture mechanics behind the local device adapter.
///
/// Calls may block; the adapter runs them on the blocking pool.
pub trait CameraBackend: Send {
    fn open(&mut self) -> Result<(), CameraError>;

    /// Encode the current live picture as JPEG.
    fn grab_jpeg(&mut self) -> Result<Bytes, CameraError>;

    fn close(&mut self);
}

/// Backend used when no capture stack is compiled in.
pub struct UnavailableBackend;

impl CameraBackend for UnavailableBackend {
    fn open(&mut self) -> Result<(), CameraError> {
        Err(CameraError::Unavailable(
            "built without the gstreamer feature".to_string(),
        ))
    }

    fn grab_jpeg(&mut self) -> Result<Bytes, CameraError> {
        Err(CameraError::Unavailable(
            "built without the gstreamer feature".to_string(),
        ))
    }

    fn close(&mut self) {}
}

/// Pick the capture backend for this build.
pub fn default_backend(config: &DeviceConfig) -> Box<dyn CameraBackend> {
    #[cfg(feature = "gstreamer")]
    {
        Box::new(super::gst_camera::GstCamera::new(config.clone()))
    }

    #[cfg(not(feature = "gstreamer"))]
    {
        let _ = config;
        Box::new(UnavailableBackend)
    }
}

/// Exclusive-access leases for camera devices, keyed by device id.
pub struct DeviceRegistry {
    locks: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

/// Held while a device is open; dropping it releases the device.
pub struct DeviceLease {
    device_id: String,
    _guard: OwnedMutexGuard<()>,
}

impl DeviceLease {
    pub fn device_id(&self) -> &str {
        &self.device_id
    }
}

impl DeviceRegistry {
    pub fn new() -> Self {
        Self {
            locks: Mutex::new(HashMap::new()),
        }
    }

    /// Take the device without waiting; `None` if another holder has it.
    pub fn try_acquire(&self, device_id: &str) -> Option<DeviceLease> {
        let lock = self
            .locks
            .lock()
            .entry(device_id.to_string())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();

        match lock.try_lock_owned() {
            Ok(guard) => {
                debug!(device_id = %device_id, "Camera device lease acquired");
                Some(DeviceLease {
                    device_id: device_id.to_string(),
                    _guard: guard,
                })
            }
            Err(_) => {
                debug!(device_id = %device_id, "Camera device busy");
                None
            }
        }
    }
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Local camera device adapter.
pub struct LocalDevice {
    kind: SourceKind,
    config: DeviceConfig,
    registry: Arc<DeviceRegistry>,
    backend: Arc<Mutex<Box<dyn CameraBackend>>>,
    lease: Option<DeviceLease>,
    source_id: String,
}

impl LocalDevice {
    pub fn new(
        config: DeviceConfig,
        registry: Arc<DeviceRegistry>,
        backend: Box<dyn CameraBackend>,
    ) -> Self {
        let source_id = format!("local:{}", config.device_id);
        Self {
            kind: SourceKind::LocalDevice,
            config,
            registry,
            backend: Arc::new(Mutex::new(backend)),
            lease: None,
            source_id,
        }
    }
}

#[async_trait]
impl AcquisitionSource for LocalDevice {
    fn kind(&self) -> &SourceKind {
        &self.kind
    }

    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn is_connected(&self) -> bool {
        self.lease.is_some()
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.lease.is_some() {
            return Ok(());
        }

        let lease = self
            .registry
            .try_acquire(&self.config.device_id)
            .ok_or_else(|| ConnectError::DeviceBusy(self.config.device_id.clone()))?;

        let backend = self.backend.clone();
        let opened = tokio::task::spawn_blocking(move || {
            let mut backend = backend.lock();
            backend.open()
        })
        .await
        .map_err(|e| ConnectError::DeviceUnavailable(e.to_string()))?;

        // On failure the lease drops here and the device is free again.
        opened.map_err(|e| ConnectError::DeviceUnavailable(e.to_string()))?;

        info!(
            device_id = %self.config.device_id,
            width = self.config.width,
            height = self.config.height,
            "Camera device opened"
        );
        self.lease = Some(lease);
        Ok(())
    }

    async fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        if self.lease.is_none() {
            return Err(CaptureError::NotConnected);
        }

        let backend = self.backend.clone();
        let grab = tokio::task::spawn_blocking(move || {
            let mut backend = backend.lock();
            backend.grab_jpeg()
        });

        let bytes = match tokio::time::timeout(self.config.grab_timeout(), grab).await {
            Ok(Ok(Ok(bytes))) => bytes,
            Ok(Ok(Err(CameraError::Timeout))) | Err(_) => return Err(CaptureError::Timeout),
            Ok(Ok(Err(e))) => return Err(CaptureError::Device(e.to_string())),
            Ok(Err(e)) => return Err(CaptureError::Device(e.to_string())),
        };

        Ok(Frame::new(bytes, "image/jpeg", self.source_id.clone()))
    }

    fn disconnect(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };

        if let Some(mut backend) = self.backend.try_lock() {
            backend.close();
            info!(device_id = %lease.device_id(), "Camera device released");
            return;
        }

        // A timed-out grab still owns the backend. Close it on the blocking
        // pool once the grab returns; the lease is held until then.
        let backend = self.backend.clone();
        let close = move || {
            backend.lock().close();
            info!(device_id = %lease.device_id(), "Camera device released");
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!(
                    device_id = %self.config.device_id,
                    "Deferring close behind a stalled grab"
                );
                handle.spawn_blocking(close);
            }
            Err(_) => close(),
        }
    }
}

impl Drop for LocalDevice {
    fn drop(&mut self) {
        if self.lease.is_some() {
            warn!(device_id = %self.config.device_id, "Camera device dropped while open");
            self.disconnect();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::{Duration, Instant};

    struct FakeCamera {
        opens: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
        fail_open: bool,
        grab_delay: Duration,
    }

    impl CameraBackend for FakeCamera {
        fn open(&mut self) -> Result<(), CameraError> {
            if self.fail_open {
                return Err(CameraError::Open("no such device".to_string()));
            }
            self.opens.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn grab_jpeg(&mut self) -> Result<Bytes, CameraError> {
            if !self.grab_delay.is_zero() {
                std::thread::sleep(self.grab_delay);
            }
            Ok(Bytes::from_static(&[0xFF, 0xD8, 0xFF, 0xD9]))
        }

        fn close(&mut self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }
    }

    fn create_device(
        registry: Arc<DeviceRegistry>,
        fail_open: bool,
    ) -> (LocalDevice, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        create_device_with(registry, DeviceConfig::default(), fail_open, Duration::ZERO)
    }

    fn create_device_with(
        registry: Arc<DeviceRegistry>,
        config: DeviceConfig,
        fail_open: bool,
        grab_delay: Duration,
    ) -> (LocalDevice, Arc<AtomicUsize>, Arc<AtomicUsize>) {
        let opens = Arc::new(AtomicUsize::new(0));
        let closes = Arc::new(AtomicUsize::new(0));
        let backend = FakeCamera {
            opens: opens.clone(),
            closes: closes.clone(),
            fail_open,
            grab_delay,
        };
        let device = LocalDevice::new(config, registry, Box::new(backend));
        (device, opens, closes)
    }

    #[tokio::test]
    async fn test_connect_capture_disconnect() {
        let registry = Arc::new(DeviceRegistry::new());
        let (mut device, opens, closes) = create_device(registry, false);

        assert_eq!(device.capture_frame().await.unwrap_err(), CaptureError::NotConnected);

        device.connect().await.unwrap();
        assert!(device.is_connected());
        assert_eq!(opens.load(Ordering::SeqCst), 1);

        let frame = device.capture_frame().await.unwrap();
        assert_eq!(frame.mime_type, "image/jpeg");
        assert_eq!(frame.source_id, "local:default");

        device.disconnect();
        device.disconnect();
        assert!(!device.is_connected());
        assert_eq!(closes.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_device_is_exclusive() {
        let registry = Arc::new(DeviceRegistry::new());
        let (mut first, _, _) = create_device(registry.clone(), false);
        let (mut second, _, _) = create_device(registry.clone(), false);

        first.connect().await.unwrap();
        assert_eq!(
            second.connect().await.unwrap_err(),
            ConnectError::DeviceBusy("default".to_string())
        );

        first.disconnect();
        assert!(second.connect().await.is_ok());
    }

    #[tokio::test]
    async fn test_failed_open_releases_lease() {
        let registry = Arc::new(DeviceRegistry::new());
        let (mut broken, _, _) = create_device(registry.clone(), true);

        assert!(matches!(
            broken.connect().await,
            Err(ConnectError::DeviceUnavailable(_))
        ));
        assert!(!broken.is_connected());
        assert!(registry.try_acquire("default").is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_disconnect_after_grab_timeout_does_not_block() {
        let registry = Arc::new(DeviceRegistry::new());
        let config = DeviceConfig {
            grab_timeout_ms: 50,
            ..DeviceConfig::default()
        };
        let (mut device, _, closes) =
            create_device_with(registry.clone(), config, false, Duration::from_millis(500));

        device.connect().await.unwrap();
        assert_eq!(device.capture_frame().await.unwrap_err(), CaptureError::Timeout);

        let started = Instant::now();
        device.disconnect();
        assert!(started.elapsed() < Duration::from_millis(100));
        assert!(!device.is_connected());

        // The device stays leased until the stalled grab returns.
        assert!(registry.try_acquire("default").is_none());

        tokio::time::sleep(Duration::from_millis(800)).await;
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert!(registry.try_acquire("default").is_some());
    }

    #[tokio::test]
    async fn test_unavailable_backend() {
        let registry = Arc::new(DeviceRegistry::new());
        let mut device = LocalDevice::new(
            DeviceConfig::default(),
            registry,
            Box::new(UnavailableBackend),
        );

        assert!(matches!(
            device.connect().await,
            Err(ConnectError::DeviceUnavailable(_))
        ));
    }
}

//! Static upload: a single operator-supplied picture.

use super::{AcquisitionSource, CaptureError, ConnectError, SourceKind};
use crate::frame::Frame;
use async_trait::async_trait;
use bytes::Bytes;
use tracing::debug;

/// Returns the selected payload exactly once per selection.
pub struct StaticUpload {
    kind: SourceKind,
    pending: Option<(Bytes, String)>,
    connected: bool,
}

impl StaticUpload {
    pub fn new() -> Self {
        Self {
            kind: SourceKind::StaticUpload,
            pending: None,
            connected: false,
        }
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }
}

impl Default for StaticUpload {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AcquisitionSource for StaticUpload {
    fn kind(&self) -> &SourceKind {
        &self.kind
    }

    fn source_id(&self) -> &str {
        "upload"
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    async fn connect(&mut self) -> Result<(), ConnectError> {
        self.connected = true;
        Ok(())
    }

    async fn capture_frame(&mut self) -> Result<Frame, CaptureError> {
        if !self.connected {
            return Err(CaptureError::NotConnected);
        }

        let (bytes, mime_type) = self.pending.take().ok_or(CaptureError::NoUpload)?;
        Ok(Frame::new(bytes, mime_type, "upload"))
    }

    fn disconnect(&mut self) {
        self.connected = false;
        self.pending = None;
    }

    fn load_upload(&mut self, bytes: Bytes, mime_type: &str) -> Result<(), CaptureError> {
        if !self.connected {
            return Err(CaptureError::NotConnected);
        }

        debug!(size = bytes.len(), mime_type = %mime_type, "Upload selected");
        self.pending = Some((bytes, mime_type.to_string()));
        Ok(())
    }
}

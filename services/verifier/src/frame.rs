//! Captured frames and the pre-flight frame validator.
//!
//! Every frame passes [`validate`] before it may reach the matcher. The
//! matcher only accepts [`ValidatedFrame`], so an oversized or unsupported
//! payload can never be put on the wire.

use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::fmt;
use thiserror::Error;

/// Largest payload accepted for verification (5 MiB).
pub const MAX_FRAME_BYTES: usize = 5 * 1024 * 1024;

/// Errors raised by the frame validator.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Frame is empty")]
    Empty,

    #[error("Frame is {size} bytes, limit is {limit} bytes")]
    TooLarge { size: usize, limit: usize },

    #[error("Unsupported image type: {0}")]
    UnsupportedType(String),
}

/// Image encodings the matcher accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageFormat {
    Jpeg,
    Png,
}

impl ImageFormat {
    /// Parse a declared mime type, ignoring case and parameters.
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let essence = mime_type
            .split(';')
            .next()
            .unwrap_or_default()
            .trim()
            .to_ascii_lowercase();

        match essence.as_str() {
            "image/jpeg" | "image/jpg" => Some(ImageFormat::Jpeg),
            "image/png" => Some(ImageFormat::Png),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
        }
    }

    pub fn file_name(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "frame.jpg",
            ImageFormat::Png => "frame.png",
        }
    }
}

/// One captured still image.
#[derive(Clone)]
pub struct Frame {
    /// Encoded image bytes
    pub bytes: Bytes,

    /// Declared mime type
    pub mime_type: String,

    /// Time the picture was taken
    pub captured_at: DateTime<Utc>,

    /// Identifier of the source that produced the frame
    pub source_id: String,
}

impl Frame {
    pub fn new(
        bytes: impl Into<Bytes>,
        mime_type: impl Into<String>,
        source_id: impl Into<String>,
    ) -> Self {
        Self {
            bytes: bytes.into(),
            mime_type: mime_type.into(),
            captured_at: Utc::now(),
            source_id: source_id.into(),
        }
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("len", &self.bytes.len())
            .field("mime_type", &self.mime_type)
            .field("captured_at", &self.captured_at)
            .field("source_id", &self.source_id)
            .finish()
    }
}

/// A frame that passed validation.
#[derive(Debug, Clone)]
pub struct ValidatedFrame {
    frame: Frame,
    format: ImageFormat,
}

impl ValidatedFrame {
    pub fn format(&self) -> ImageFormat {
        self.format
    }

    pub fn frame(&self) -> &Frame {
        &self.frame
    }

    pub fn into_inner(self) -> Frame {
        self.frame
    }
}

/// Check payload size and declared type before any network use.
pub fn validate(frame: Frame) -> Result<ValidatedFrame, ValidationError> {
    if frame.is_empty() {
        return Err(ValidationError::Empty);
    }

    if frame.len() > MAX_FRAME_BYTES {
        return Err(ValidationError::TooLarge {
            size: frame.len(),
            limit: MAX_FRAME_BYTES,
        });
    }

    let format = ImageFormat::from_mime(&frame.mime_type)
        .ok_or_else(|| ValidationError::UnsupportedType(frame.mime_type.clone()))?;

    Ok(ValidatedFrame { frame, format })
}

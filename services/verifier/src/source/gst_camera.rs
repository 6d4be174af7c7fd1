//! GStreamer-backed local camera.
//!
//! The pipeline keeps the device playing while the session holds it and
//! encodes every picture to JPEG; the appsink only retains the newest buffer
//! so a grab always returns the current live picture.

use super::local::{CameraBackend, CameraError};
use crate::config::DeviceConfig;
use bytes::Bytes;
use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use tracing::debug;

pub struct GstCamera {
    config: DeviceConfig,
    pipeline: Option<gst::Pipeline>,
    appsink: Option<gst_app::AppSink>,
}

impl GstCamera {
    pub fn new(config: DeviceConfig) -> Self {
        Self {
            config,
            pipeline: None,
            appsink: None,
        }
    }

    fn build_pipeline_string(&self) -> String {
        let source = match &self.config.device_path {
            Some(path) => format!("v4l2src device={}", path),
            None => "autovideosrc".to_string(),
        };

        format!(
            "{source} ! videoconvert ! videoscale \
             ! video/x-raw,width={width},height={height} \
             ! jpegenc quality={quality} \
             ! appsink name=sink max-buffers=1 drop=true sync=false",
            source = source,
            width = self.config.width,
            height = self.config.height,
            quality = self.config.jpeg_quality,
        )
    }
}

impl CameraBackend for GstCamera {
    fn open(&mut self) -> Result<(), CameraError> {
        gst::init().map_err(|e| CameraError::Unavailable(e.to_string()))?;

        let pipeline_str = self.build_pipeline_string();
        debug!(pipeline = %pipeline_str, "Creating camera pipeline");

        let pipeline = gst::parse::launch(&pipeline_str)
            .map_err(|e| CameraError::Open(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| CameraError::Open("Failed to cast to Pipeline".to_string()))?;

        let appsink = pipeline
            .by_name("sink")
            .ok_or_else(|| CameraError::Open("appsink not found".to_string()))?
            .downcast::<gst_app::AppSink>()
            .map_err(|_| CameraError::Open("Could not cast to AppSink".to_string()))?;

        pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| CameraError::Open(e.to_string()))?;

        let (result, _state, _pending) = pipeline.state(gst::ClockTime::from_mseconds(
            self.config.grab_timeout_ms,
        ));
        if result.is_err() {
            let _ = pipeline.set_state(gst::State::Null);
            return Err(CameraError::Open(
                "Timeout waiting for camera pipeline to start".to_string(),
            ));
        }

        self.pipeline = Some(pipeline);
        self.appsink = Some(appsink);
        Ok(())
    }

    fn grab_jpeg(&mut self) -> Result<Bytes, CameraError> {
        let appsink = self
            .appsink
            .as_ref()
            .ok_or_else(|| CameraError::Grab("camera not open".to_string()))?;

        let sample = appsink
            .try_pull_sample(gst::ClockTime::from_mseconds(self.config.grab_timeout_ms))
            .ok_or(CameraError::Timeout)?;
        let buffer = sample
            .buffer()
            .ok_or_else(|| CameraError::Grab("sample without buffer".to_string()))?;
        let map = buffer
            .map_readable()
            .map_err(|e| CameraError::Grab(e.to_string()))?;

        Ok(Bytes::copy_from_slice(map.as_slice()))
    }

    fn close(&mut self) {
        self.appsink = None;
        if let Some(pipeline) = self.pipeline.take() {
            let _ = pipeline.set_state(gst::State::Null);
        }
    }
}

impl Drop for GstCamera {
    fn drop(&mut self) {
        self.close();
    }
}

// src/camera.rs

use anyhow::Result;
use opencv::{
    core::Mat,
    prelude::*,
    videoio::{self, VideoCapture},
};
use tracing::{debug, info};

/// One approach's frame source. The capture buffer is forced to a single
/// frame so a slow consumer reads the freshest frame instead of an
/// ever-growing backlog.
pub struct Camera {
    cap: VideoCapture,
    pub uri: String,
}

impl Camera {
    /// Open a camera URI: a decimal integer selects a local device,
    /// anything else is treated as a stream URL or file path.
    pub fn open(uri: &str) -> Result<Self> {
        let mut cap = match uri.trim().parse::<i32>() {
            Ok(index) => VideoCapture::new(index, videoio::CAP_ANY)?,
            Err(_) => VideoCapture::from_file(uri, videoio::CAP_ANY)?,
        };

        if !cap.is_opened()? {
            anyhow::bail!("failed to open camera source: {uri}");
        }

        // Freshness over completeness: dropped frames beat latency.
        let _ = cap.set(videoio::CAP_PROP_BUFFERSIZE, 1.0);

        info!("camera opened: {uri}");
        Ok(Self {
            cap,
            uri: uri.to_string(),
        })
    }

    /// Grab the most recent decoded frame. Returns `None` on a read
    /// timeout or decode failure; the caller simply skips this tick.
    pub fn read(&mut self) -> Option<Mat> {
        let mut frame = Mat::default();
        match self.cap.read(&mut frame) {
            Ok(true) if !frame.empty() => Some(frame),
            Ok(_) => None,
            Err(e) => {
                debug!("camera read failed: {e}");
                None
            }
        }
    }

    pub fn is_opened(&self) -> bool {
        self.cap.is_opened().unwrap_or(false)
    }
}

impl Drop for Camera {
    fn drop(&mut self) {
        if let Err(e) = self.cap.release() {
            debug!("camera release failed: {e}");
        }
    }
}

// src/violations.rs
//
// Disk sink for violation evidence. A failed write is logged and
// swallowed; the violation event has already carried the metadata, so a
// full disk never loses the record itself.

use anyhow::{Context, Result};
use chrono::Local;
use opencv::core::{Mat, Vector};
use opencv::imgcodecs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

const DIR_NAME: &str = "stms_violations";

/// Wall-clock timestamp in the `YYYY-MM-DD_hh-mm-ss-zzz` layout used in
/// violation records and evidence filenames.
pub fn timestamp_now() -> String {
    Local::now().format("%Y-%m-%d_%H-%M-%S-%3f").to_string()
}

#[derive(Debug, Clone)]
pub struct ViolationStore {
    dir: PathBuf,
}

impl ViolationStore {
    /// Place the store under the platform per-user app-data location,
    /// falling back to the working directory.
    pub fn new() -> Self {
        let base = dirs::data_local_dir()
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));
        Self::at(base.join(DIR_NAME))
    }

    pub fn at(dir: PathBuf) -> Self {
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("could not create violation directory {}: {e}", dir.display());
        }
        Self { dir }
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    /// Filename for a tracker-attributed violation capture.
    pub fn tracker_filename(timestamp: &str, approach: usize) -> String {
        format!("VIO_{timestamp}_R{}.jpg", approach + 1)
    }

    /// Filename for one image of an IR-triggered capture sequence
    /// (`image_num` is 1-based; the sequence is 1..=3).
    pub fn ir_filename(timestamp: &str, approach: usize, image_num: u32) -> String {
        format!("VIO_IR_{timestamp}_R{}_IMG{image_num}.jpg", approach + 1)
    }

    /// Write one evidence frame. Errors are returned for the caller to
    /// log; the caller keeps going either way.
    pub fn save(&self, filename: &str, frame: &Mat) -> Result<PathBuf> {
        let path = self.dir.join(filename);
        let path_str = path
            .to_str()
            .with_context(|| format!("non-UTF-8 violation path {}", path.display()))?;
        let written = imgcodecs::imwrite(path_str, frame, &Vector::new())
            .with_context(|| format!("failed to encode {filename}"))?;
        if !written {
            anyhow::bail!("failed to write violation image {}", path.display());
        }
        info!("saved violation image: {filename}");
        Ok(path)
    }
}

impl Default for ViolationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tracker_filenames_are_one_based() {
        assert_eq!(
            ViolationStore::tracker_filename("2026-08-02_10-15-30-123", 0),
            "VIO_2026-08-02_10-15-30-123_R1.jpg"
        );
        assert_eq!(
            ViolationStore::tracker_filename("2026-08-02_10-15-30-123", 3),
            "VIO_2026-08-02_10-15-30-123_R4.jpg"
        );
    }

    #[test]
    fn ir_filenames_carry_the_sequence_number() {
        assert_eq!(
            ViolationStore::ir_filename("2026-08-02_10-15-30-123", 1, 2),
            "VIO_IR_2026-08-02_10-15-30-123_R2_IMG2.jpg"
        );
    }

    #[test]
    fn timestamp_has_millisecond_layout() {
        let ts = timestamp_now();
        // YYYY-MM-DD_hh-mm-ss-zzz
        assert_eq!(ts.len(), 23, "unexpected timestamp: {ts}");
        let bytes = ts.as_bytes();
        assert_eq!(bytes[4], b'-');
        assert_eq!(bytes[7], b'-');
        assert_eq!(bytes[10], b'_');
        assert_eq!(bytes[13], b'-');
        assert_eq!(bytes[16], b'-');
        assert_eq!(bytes[19], b'-');
        assert!(ts[20..].chars().all(|c| c.is_ascii_digit()));
    }
}

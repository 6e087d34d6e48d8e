// src/config.rs

use crate::types::{TrafficDensity, NUM_APPROACHES};
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

/// Green-phase duration (seconds) per density bucket.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct GreenDurations {
    pub off: u32,
    pub low: u32,
    pub medium: u32,
    pub high: u32,
    pub very_high: u32,
}

impl Default for GreenDurations {
    fn default() -> Self {
        Self {
            off: 5,
            low: 8,
            medium: 12,
            high: 18,
            very_high: 25,
        }
    }
}

impl GreenDurations {
    pub fn get(&self, density: TrafficDensity) -> u32 {
        match density {
            TrafficDensity::Off => self.off,
            TrafficDensity::Low => self.low,
            TrafficDensity::Medium => self.medium,
            TrafficDensity::High => self.high,
            TrafficDensity::VeryHigh => self.very_high,
        }
    }

    pub fn set(&mut self, density: TrafficDensity, seconds: u32) {
        match density {
            TrafficDensity::Off => self.off = seconds,
            TrafficDensity::Low => self.low = seconds,
            TrafficDensity::Medium => self.medium = seconds,
            TrafficDensity::High => self.high = seconds,
            TrafficDensity::VeryHigh => self.very_high = seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// ONNX detector weights, resolved against the executable directory
    /// when relative.
    pub model_path: String,
    /// Line-delimited class-name file for the detector.
    pub class_names_path: String,
    pub confidence_threshold: f32,
    pub nms_threshold: f32,
    pub green_durations: GreenDurations,
    /// Fixed yellow sub-phase duration (seconds), independent of density.
    pub yellow_duration: u32,
    pub energy_saving_enabled: bool,
    pub violation_detection_enabled: bool,
    /// Camera URI per approach: a decimal device index or a stream URL.
    pub cameras: [Option<String>; NUM_APPROACHES],
    /// Serial port for the light controller. `None` picks the first
    /// enumerated port.
    pub serial_port: Option<String>,
    /// When set, the serial link is never opened.
    pub simulation_mode: bool,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            model_path: "yolov8n.onnx".to_string(),
            class_names_path: "coco.names".to_string(),
            confidence_threshold: 0.45,
            nms_threshold: 0.4,
            green_durations: GreenDurations::default(),
            yellow_duration: 3,
            energy_saving_enabled: true,
            violation_detection_enabled: true,
            cameras: Default::default(),
            serial_port: None,
            simulation_mode: false,
        }
    }
}

impl Settings {
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let settings: Settings = serde_yaml::from_str(&contents)
            .with_context(|| format!("failed to parse config file {}", path.display()))?;
        Ok(settings)
    }
}

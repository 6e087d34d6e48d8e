// src/types.rs

use opencv::core::{Mat, Rect};
use serde::{Deserialize, Serialize};

/// Number of roads meeting at the intersection.
pub const NUM_APPROACHES: usize = 4;

// ============================================================================
// Light and density enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrafficLight {
    Off,
    Red,
    Yellow,
    Green,
}

impl TrafficLight {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficLight::Off => "OFF",
            TrafficLight::Red => "RED",
            TrafficLight::Yellow => "YELLOW",
            TrafficLight::Green => "GREEN",
        }
    }

    /// Single-letter code used on the serial wire (`L_<road>_<letter>`).
    pub fn wire_letter(&self) -> char {
        match self {
            TrafficLight::Red => 'R',
            TrafficLight::Yellow => 'Y',
            TrafficLight::Green => 'G',
            TrafficLight::Off => 'F',
        }
    }
}

impl std::fmt::Display for TrafficLight {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum TrafficDensity {
    Off,
    Low,
    Medium,
    High,
    VeryHigh,
}

impl TrafficDensity {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrafficDensity::Off => "OFF",
            TrafficDensity::Low => "LOW",
            TrafficDensity::Medium => "MEDIUM",
            TrafficDensity::High => "HIGH",
            TrafficDensity::VeryHigh => "VERY_HIGH",
        }
    }
}

impl std::fmt::Display for TrafficDensity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

// ============================================================================
// Geometry
// ============================================================================

/// Axis-aligned box, `[x1, y1, x2, y2]` in pixels.
pub type BBox = [f32; 4];

pub fn bbox_area(b: &BBox) -> f32 {
    (b[2] - b[0]).max(0.0) * (b[3] - b[1]).max(0.0)
}

/// Intersection-over-union of two corner-format boxes.
pub fn bbox_iou(a: &BBox, b: &BBox) -> f32 {
    let x1 = a[0].max(b[0]);
    let y1 = a[1].max(b[1]);
    let x2 = a[2].min(b[2]);
    let y2 = a[3].min(b[3]);

    let intersection = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = bbox_area(a) + bbox_area(b) - intersection;

    if union > 0.0 {
        intersection / union
    } else {
        0.0
    }
}

/// Region of interest restricting detection to part of the frame.
/// A zero-area ROI means "whole frame".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Roi {
    pub x: i32,
    pub y: i32,
    pub width: i32,
    pub height: i32,
}

impl Roi {
    pub fn new(x: i32, y: i32, width: i32, height: i32) -> Self {
        Self {
            x,
            y,
            width,
            height,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.width <= 0 || self.height <= 0
    }

    /// Intersect with the frame rectangle. Returns `None` for an empty ROI
    /// (whole frame) or when the clipped region has no area.
    pub fn clip_to(&self, frame_width: i32, frame_height: i32) -> Option<Rect> {
        if self.is_empty() {
            return None;
        }
        let x1 = self.x.max(0);
        let y1 = self.y.max(0);
        let x2 = (self.x + self.width).min(frame_width);
        let y2 = (self.y + self.height).min(frame_height);
        if x2 <= x1 || y2 <= y1 {
            return None;
        }
        Some(Rect::new(x1, y1, x2 - x1, y2 - y1))
    }
}

// ============================================================================
// Violations
// ============================================================================

/// A recorded red-light violation. Emitted once, never mutated.
#[derive(Debug, Clone)]
pub struct ViolationRecord {
    pub approach: usize,
    /// Wall-clock timestamp, `YYYY-MM-DD_hh-mm-ss-zzz`.
    pub timestamp: String,
    pub reason: String,
    pub frame: Option<Mat>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let b = [10.0, 10.0, 50.0, 50.0];
        assert!((bbox_iou(&b, &b) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [20.0, 20.0, 30.0, 30.0];
        assert_eq!(bbox_iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_of_half_overlapping_boxes() {
        let a = [0.0, 0.0, 10.0, 10.0];
        let b = [5.0, 0.0, 15.0, 10.0];
        // intersection 50, union 150
        assert!((bbox_iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn zero_roi_means_whole_frame() {
        assert_eq!(Roi::new(0, 0, 0, 0).clip_to(1280, 720), None);
    }

    #[test]
    fn roi_is_clipped_to_frame() {
        let rect = Roi::new(1000, 600, 500, 500).clip_to(1280, 720).unwrap();
        assert_eq!(
            (rect.x, rect.y, rect.width, rect.height),
            (1000, 600, 280, 120)
        );
    }

    #[test]
    fn roi_fully_outside_frame_is_rejected() {
        assert_eq!(Roi::new(2000, 2000, 100, 100).clip_to(1280, 720), None);
    }

    #[test]
    fn wire_letters() {
        assert_eq!(TrafficLight::Red.wire_letter(), 'R');
        assert_eq!(TrafficLight::Yellow.wire_letter(), 'Y');
        assert_eq!(TrafficLight::Green.wire_letter(), 'G');
        assert_eq!(TrafficLight::Off.wire_letter(), 'F');
    }
}

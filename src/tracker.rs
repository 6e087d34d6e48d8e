// src/tracker.rs
//
// IoU-based multi-object tracker, one instance per approach.
//
// Design:
//   - Greedy IoU matching, single pass over tracks in ascending-ID order
//     (deterministic: when two tracks prefer the same detection, the
//     lower ID wins and the other coasts)
//   - Tracks coast through brief detection gaps before deletion
//   - A track continuously matched while its approach is RED becomes a
//     violation candidate; sustained candidates are reported as violators

use crate::types::{bbox_iou, BBox, TrafficLight};
use std::collections::BTreeMap;
use tracing::debug;

#[derive(Debug, Clone, Copy)]
pub struct TrackerConfig {
    /// Minimum IoU to bind a detection to an existing track.
    pub match_iou: f32,
    /// Frames a track survives without a detection before deletion.
    pub max_frames_disappeared: u32,
    /// Consecutive red-light frames before a candidate is reported.
    pub violation_frames: u32,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            match_iou: 0.30,
            max_frames_disappeared: 15,
            violation_frames: 15, // ~0.5s of sustained detection on red
        }
    }
}

#[derive(Debug, Clone)]
pub struct TrackedVehicle {
    pub id: u32,
    pub bbox: BBox,
    pub frames_without_detection: u32,
    pub violation_candidate: bool,
    pub violation_frame_count: u32,
}

impl TrackedVehicle {
    fn new(id: u32, bbox: BBox) -> Self {
        Self {
            id,
            bbox,
            frames_without_detection: 0,
            violation_candidate: false,
            violation_frame_count: 0,
        }
    }
}

/// Per-approach tracker state. IDs are monotonic within the approach and
/// never reused.
#[derive(Debug, Default)]
pub struct RoadTracker {
    config: TrackerConfig,
    tracks: BTreeMap<u32, TrackedVehicle>,
    next_id: u32,
}

impl RoadTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            tracks: BTreeMap::new(),
            next_id: 0,
        }
    }

    /// Associate one frame's detections with the existing tracks.
    ///
    /// Returns the live track count and the IDs currently qualifying as
    /// red-light violators (sustained candidates). Deduplication against
    /// already-recorded violators is the controller's job.
    pub fn update(&mut self, detections: &[BBox], current_light: TrafficLight) -> TrackerUpdate {
        let mut used = vec![false; detections.len()];

        for track in self.tracks.values_mut() {
            track.frames_without_detection += 1;

            let mut best: Option<(usize, f32)> = None;
            for (i, det) in detections.iter().enumerate() {
                if used[i] {
                    continue;
                }
                let iou = bbox_iou(&track.bbox, det);
                if best.map_or(true, |(_, b)| iou > b) {
                    best = Some((i, iou));
                }
            }

            if let Some((idx, iou)) = best {
                if iou > self.config.match_iou {
                    track.bbox = detections[idx];
                    track.frames_without_detection = 0;
                    used[idx] = true;

                    if current_light == TrafficLight::Red {
                        track.violation_frame_count += 1;
                        track.violation_candidate = true;
                    } else {
                        track.violation_frame_count = 0;
                        track.violation_candidate = false;
                    }
                }
            }
        }

        let max_disappeared = self.config.max_frames_disappeared;
        self.tracks
            .retain(|_, t| t.frames_without_detection <= max_disappeared);

        for (i, det) in detections.iter().enumerate() {
            if !used[i] {
                let id = self.next_id;
                self.next_id += 1;
                self.tracks.insert(id, TrackedVehicle::new(id, *det));
                debug!("new track {id}");
            }
        }

        let violating_ids = self
            .tracks
            .values()
            .filter(|t| t.violation_candidate && t.violation_frame_count > self.config.violation_frames)
            .map(|t| t.id)
            .collect();

        TrackerUpdate {
            vehicle_count: self.tracks.len(),
            violating_ids,
        }
    }

    pub fn tracks(&self) -> impl Iterator<Item = &TrackedVehicle> {
        self.tracks.values()
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct TrackerUpdate {
    pub vehicle_count: usize,
    pub violating_ids: Vec<u32>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn shifted(b: &BBox, dx: f32) -> BBox {
        [b[0] + dx, b[1], b[2] + dx, b[3]]
    }

    #[test]
    fn detection_creates_and_keeps_identity() {
        let mut tracker = RoadTracker::new(TrackerConfig::default());
        let car = [100.0, 100.0, 200.0, 180.0];

        let first = tracker.update(&[car], TrafficLight::Green);
        assert_eq!(first.vehicle_count, 1);

        // Slightly moved box should bind to the same track, not spawn a
        // second one.
        let second = tracker.update(&[shifted(&car, 8.0)], TrafficLight::Green);
        assert_eq!(second.vehicle_count, 1);
        assert_eq!(tracker.tracks().next().unwrap().id, 0);
    }

    #[test]
    fn lost_track_is_dropped_after_retention_window() {
        let mut tracker = RoadTracker::new(TrackerConfig::default());
        tracker.update(&[[0.0, 0.0, 50.0, 50.0]], TrafficLight::Green);

        for _ in 0..15 {
            let u = tracker.update(&[], TrafficLight::Green);
            assert_eq!(u.vehicle_count, 1, "track must coast within retention");
        }
        let u = tracker.update(&[], TrafficLight::Green);
        assert_eq!(u.vehicle_count, 0, "track must die after 15 missed frames");
    }

    #[test]
    fn ids_are_monotonic_and_never_reused() {
        let mut tracker = RoadTracker::new(TrackerConfig::default());
        tracker.update(&[[0.0, 0.0, 50.0, 50.0]], TrafficLight::Green);
        // Kill it.
        for _ in 0..16 {
            tracker.update(&[], TrafficLight::Green);
        }
        tracker.update(&[[0.0, 0.0, 50.0, 50.0]], TrafficLight::Green);
        assert_eq!(tracker.tracks().next().unwrap().id, 1);
    }

    #[test]
    fn sustained_red_presence_reports_violator_once_qualified() {
        let mut tracker = RoadTracker::new(TrackerConfig::default());
        let car = [100.0, 100.0, 200.0, 180.0];

        // Frame 1 registers the track; 16 matched red frames push the
        // counter past the threshold.
        tracker.update(&[car], TrafficLight::Red);
        let mut reported = Vec::new();
        for i in 0..16 {
            let u = tracker.update(&[shifted(&car, i as f32)], TrafficLight::Red);
            reported = u.violating_ids;
        }
        assert_eq!(reported, vec![0]);
    }

    #[test]
    fn green_light_resets_violation_counter() {
        let mut tracker = RoadTracker::new(TrackerConfig::default());
        let car = [100.0, 100.0, 200.0, 180.0];

        tracker.update(&[car], TrafficLight::Red);
        for _ in 0..10 {
            tracker.update(&[car], TrafficLight::Red);
        }
        // One green frame clears candidacy entirely.
        tracker.update(&[car], TrafficLight::Green);
        for _ in 0..10 {
            let u = tracker.update(&[car], TrafficLight::Red);
            assert!(u.violating_ids.is_empty());
        }
    }

    #[test]
    fn contested_detection_goes_to_lowest_id() {
        let mut tracker = RoadTracker::new(TrackerConfig::default());
        let a = [0.0, 0.0, 100.0, 100.0];
        let b = [40.0, 0.0, 140.0, 100.0];
        tracker.update(&[a, b], TrafficLight::Green);

        // A single detection overlapping both tracks: track 0 is examined
        // first and claims it; track 1 coasts.
        let mid = [20.0, 0.0, 120.0, 100.0];
        tracker.update(&[mid], TrafficLight::Green);

        let tracks: Vec<_> = tracker.tracks().collect();
        assert_eq!(tracks[0].frames_without_detection, 0);
        assert_eq!(tracks[1].frames_without_detection, 1);
    }

    #[test]
    fn count_includes_coasting_tracks() {
        let mut tracker = RoadTracker::new(TrackerConfig::default());
        tracker.update(&[[0.0, 0.0, 50.0, 50.0]], TrafficLight::Green);
        let u = tracker.update(&[[300.0, 300.0, 360.0, 360.0]], TrafficLight::Green);
        // The old track coasts, the new detection registers: both count.
        assert_eq!(u.vehicle_count, 2);
    }
}

// src/worker.rs
//
// Detection worker thread. Owns the detector model, the per-approach
// trackers and the ID counters exclusively, so no locks are needed inside.
// Frames arrive through a single-slot mailbox (capacity-1 sync channel);
// the scheduler refuses to dispatch while a job is in flight, so at most
// one frame exists in the pipeline at any instant.
//
// Detector thresholds are shared as atomics and sampled once per frame,
// so a runtime update never tears an in-progress detect call.

use crate::detector::VehicleDetector;
use crate::events::LogLevel;
use crate::tracker::{RoadTracker, TrackerConfig};
use crate::types::{BBox, Roi, TrafficLight, NUM_APPROACHES};
use anyhow::{Context, Result};
use opencv::{
    core::{Mat, Point, Rect, Scalar},
    imgproc,
    prelude::*,
};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::mpsc::{sync_channel, Receiver, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::{debug, warn};

/// Confidence/NMS thresholds shared between the control loop and the
/// worker. Stored as `f32` bit patterns.
#[derive(Debug)]
pub struct SharedThresholds {
    confidence: AtomicU32,
    nms: AtomicU32,
}

impl SharedThresholds {
    pub fn new(confidence: f32, nms: f32) -> Self {
        Self {
            confidence: AtomicU32::new(confidence.to_bits()),
            nms: AtomicU32::new(nms.to_bits()),
        }
    }

    pub fn store(&self, confidence: f32, nms: f32) {
        self.confidence.store(confidence.to_bits(), Ordering::Relaxed);
        self.nms.store(nms.to_bits(), Ordering::Relaxed);
    }

    pub fn load(&self) -> (f32, f32) {
        (
            f32::from_bits(self.confidence.load(Ordering::Relaxed)),
            f32::from_bits(self.nms.load(Ordering::Relaxed)),
        )
    }
}

#[derive(Debug)]
pub struct FrameJob {
    pub approach: usize,
    pub frame: Mat,
    pub roi: Roi,
    /// Light state at dispatch time; used for violation attribution even
    /// if the light changes while the job is in flight.
    pub light: TrafficLight,
}

#[derive(Debug)]
pub struct ProcessingResult {
    pub approach: usize,
    /// The submitted frame with tracker overlays drawn.
    pub display_frame: Mat,
    pub vehicle_count: usize,
    /// Track IDs currently qualifying as red-light violators. The
    /// controller dedups these against its per-red-phase record.
    pub violating_ids: Vec<u32>,
}

#[derive(Debug)]
pub enum WorkerMessage {
    Result(ProcessingResult),
    Log { message: String, level: LogLevel },
}

pub struct WorkerHandle {
    jobs: Option<SyncSender<FrameJob>>,
    messages: Option<UnboundedReceiver<WorkerMessage>>,
    thresholds: Arc<SharedThresholds>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(detector: VehicleDetector, thresholds: Arc<SharedThresholds>) -> Result<Self> {
        let (job_tx, job_rx) = sync_channel::<FrameJob>(1);
        let (msg_tx, msg_rx) = unbounded_channel();

        let worker_thresholds = Arc::clone(&thresholds);
        let thread = std::thread::Builder::new()
            .name("detection-worker".to_string())
            .spawn(move || run_worker(detector, worker_thresholds, job_rx, msg_tx))
            .context("failed to spawn detection worker thread")?;

        Ok(Self {
            jobs: Some(job_tx),
            messages: Some(msg_rx),
            thresholds,
            thread: Some(thread),
        })
    }

    /// Hand a frame to the worker without blocking. Returns `false` when
    /// the mailbox is occupied or the worker is gone.
    pub fn try_dispatch(&self, job: FrameJob) -> bool {
        match self.jobs.as_ref() {
            Some(tx) => match tx.try_send(job) {
                Ok(()) => true,
                Err(TrySendError::Full(_)) => false,
                Err(TrySendError::Disconnected(_)) => {
                    warn!("detection worker is gone, dropping frame");
                    false
                }
            },
            None => false,
        }
    }

    pub fn set_thresholds(&self, confidence: f32, nms: f32) {
        self.thresholds.store(confidence, nms);
    }

    /// The result/log stream, taken once by the control loop.
    pub fn take_messages(&mut self) -> UnboundedReceiver<WorkerMessage> {
        self.messages.take().expect("worker messages already taken")
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        // Dropping the sender lets the worker drain and exit; pending
        // mailbox jobs are discarded with it.
        self.jobs.take();
        if let Some(thread) = self.thread.take() {
            let _ = thread.join();
        }
    }
}

fn run_worker(
    mut detector: VehicleDetector,
    thresholds: Arc<SharedThresholds>,
    jobs: Receiver<FrameJob>,
    messages: UnboundedSender<WorkerMessage>,
) {
    let mut trackers: [RoadTracker; NUM_APPROACHES] =
        std::array::from_fn(|_| RoadTracker::new(TrackerConfig::default()));

    debug!("detection worker started");
    let mut applied = thresholds.load();
    detector.set_thresholds(applied.0, applied.1);
    for mut job in jobs.iter() {
        let current = thresholds.load();
        if current != applied {
            detector.set_thresholds(current.0, current.1);
            applied = current;
        }

        let approach = job.approach;
        // A detector failure contributes no detections, but the tracker
        // still runs: existing tracks age and can expire on this frame
        // like any other.
        let detections = match detect_region(&mut detector, &job.frame, job.roi) {
            Ok(detections) => detections,
            Err(e) => {
                let _ = messages.send(WorkerMessage::Log {
                    message: format!("Detection error: {e:#}"),
                    level: LogLevel::Error,
                });
                Vec::new()
            }
        };
        let update = trackers[approach].update(&detections, job.light);
        if let Err(e) = draw_tracks(&mut job.frame, &trackers[approach]) {
            debug!("overlay draw failed: {e}");
        }

        if messages
            .send(WorkerMessage::Result(ProcessingResult {
                approach,
                display_frame: job.frame,
                vehicle_count: update.vehicle_count,
                violating_ids: update.violating_ids,
            }))
            .is_err()
        {
            break;
        }
    }
    debug!("detection worker exiting");
}

/// Run detection on the clipped ROI when one is set.
fn detect_region(detector: &mut VehicleDetector, frame: &Mat, roi: Roi) -> Result<Vec<BBox>> {
    match roi.clip_to(frame.cols(), frame.rows()) {
        Some(rect) => {
            let region = Mat::roi(frame, rect)?.try_clone()?;
            detector.detect(&region)
        }
        None => detector.detect(frame),
    }
}

/// Overlay tracked vehicles: green boxes for normal tracks, red for
/// violation candidates, each labelled with its ID.
fn draw_tracks(frame: &mut Mat, tracker: &RoadTracker) -> Result<()> {
    for track in tracker.tracks() {
        let color = if track.violation_candidate {
            Scalar::new(0.0, 0.0, 255.0, 0.0)
        } else {
            Scalar::new(0.0, 255.0, 0.0, 0.0)
        };

        let x = track.bbox[0].round() as i32;
        let y = track.bbox[1].round() as i32;
        let w = (track.bbox[2] - track.bbox[0]).round() as i32;
        let h = (track.bbox[3] - track.bbox[1]).round() as i32;

        imgproc::rectangle(
            frame,
            Rect::new(x, y, w.max(1), h.max(1)),
            color,
            2,
            imgproc::LINE_8,
            0,
        )?;
        imgproc::put_text(
            frame,
            &format!("ID: {}", track.id),
            Point::new(x, y - 10),
            imgproc::FONT_HERSHEY_SIMPLEX,
            0.6,
            color,
            2,
            imgproc::LINE_AA,
            false,
        )?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_thresholds_round_trip() {
        let t = SharedThresholds::new(0.45, 0.4);
        assert_eq!(t.load(), (0.45, 0.4));
        t.store(0.6, 0.35);
        assert_eq!(t.load(), (0.6, 0.35));
    }
}

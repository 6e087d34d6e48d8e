// src/detector.rs

use crate::types::{bbox_iou, BBox};
use anyhow::{Context, Result};
use ndarray::{Array4, ArrayView2};
use opencv::{
    core::{Mat, Size},
    imgproc,
    prelude::*,
};
use ort::session::{builder::GraphOptimizationLevel, Session};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const INPUT_SIZE: usize = 640;

// COCO class IDs for vehicles: car, motorcycle, bus, truck
const VEHICLE_CLASS_IDS: [usize; 4] = [2, 3, 5, 7];

#[derive(Debug, Clone, Copy)]
pub struct DetectorThresholds {
    pub confidence: f32,
    pub nms: f32,
}

impl Default for DetectorThresholds {
    fn default() -> Self {
        Self {
            confidence: 0.45,
            nms: 0.4,
        }
    }
}

/// Single-shot convolutional vehicle detector over a 640x640 input.
pub struct VehicleDetector {
    session: Session,
    class_names: Vec<String>,
    thresholds: DetectorThresholds,
}

impl VehicleDetector {
    pub fn new(model_path: &Path, class_names_path: &Path) -> Result<Self> {
        if !model_path.exists() {
            anyhow::bail!("model file not found at {}", model_path.display());
        }
        info!("Loading detector model: {}", model_path.display());

        let session = Session::builder()?
            .with_optimization_level(GraphOptimizationLevel::Level3)?
            .with_intra_threads(4)?
            .commit_from_file(model_path)?;

        let class_names = load_class_names(class_names_path)?;
        info!("Detector ready ({} classes)", class_names.len());

        Ok(Self {
            session,
            class_names,
            thresholds: DetectorThresholds::default(),
        })
    }

    /// Thresholds are applied from the next `detect` call onward; an
    /// in-progress call keeps the values it started with.
    pub fn set_thresholds(&mut self, confidence: f32, nms: f32) {
        self.thresholds = DetectorThresholds {
            confidence,
            nms,
        };
        debug!("detector thresholds: confidence={confidence}, nms={nms}");
    }

    pub fn thresholds(&self) -> DetectorThresholds {
        self.thresholds
    }

    /// Run detection on a BGR frame, returning vehicle boxes in the
    /// frame's own pixel coordinates.
    pub fn detect(&mut self, frame: &Mat) -> Result<Vec<BBox>> {
        if frame.empty() {
            return Ok(Vec::new());
        }

        let x_factor = frame.cols() as f32 / INPUT_SIZE as f32;
        let y_factor = frame.rows() as f32 / INPUT_SIZE as f32;

        let input = preprocess(frame)?;
        let input_value = ort::value::Value::from_array(input)?;
        let outputs = self.session.run(ort::inputs!["images" => input_value])?;
        let (shape, data) = outputs[0].try_extract_tensor::<f32>()?;

        let dims: Vec<usize> = shape.iter().map(|d| *d as usize).collect();
        let candidates = decode_predictions(
            data,
            &dims,
            self.class_names.len(),
            self.thresholds.confidence,
            x_factor,
            y_factor,
        )?;

        let kept = nms(candidates, self.thresholds.nms);
        debug!("detected {} vehicles", kept.len());
        Ok(kept.into_iter().map(|(bbox, _)| bbox).collect())
    }
}

/// Scale to 640x640 (plain stretch, no letterboxing; the box
/// un-projection uses the reciprocal per-axis factors), swap BGR to RGB
/// and normalize to [0, 1] in NCHW order.
fn preprocess(frame: &Mat) -> Result<Array4<f32>> {
    let mut resized = Mat::default();
    imgproc::resize(
        frame,
        &mut resized,
        Size::new(INPUT_SIZE as i32, INPUT_SIZE as i32),
        0.0,
        0.0,
        imgproc::INTER_LINEAR,
    )?;

    if resized.channels() != 3 {
        anyhow::bail!("expected a 3-channel BGR frame, got {} channels", resized.channels());
    }

    let pixels = resized.data_bytes()?;
    let mut input = Array4::<f32>::zeros((1, 3, INPUT_SIZE, INPUT_SIZE));
    for y in 0..INPUT_SIZE {
        for x in 0..INPUT_SIZE {
            let idx = (y * INPUT_SIZE + x) * 3;
            // OpenCV delivers BGR; the model wants RGB.
            input[[0, 0, y, x]] = pixels[idx + 2] as f32 / 255.0;
            input[[0, 1, y, x]] = pixels[idx + 1] as f32 / 255.0;
            input[[0, 2, y, x]] = pixels[idx] as f32 / 255.0;
        }
    }
    Ok(input)
}

/// Decode the raw output tensor into thresholded vehicle candidates.
///
/// YOLOv8-style exports emit either `(1, 4+C, N)` (attributes-major, the
/// common layout) or `(1, N, 4+C)` (predictions-major). The orientation
/// is decided from the shape instead of transposing unconditionally.
pub fn decode_predictions(
    data: &[f32],
    dims: &[usize],
    num_classes: usize,
    confidence_threshold: f32,
    x_factor: f32,
    y_factor: f32,
) -> Result<Vec<(BBox, f32)>> {
    if dims.len() != 3 {
        anyhow::bail!("unexpected detector output shape: {dims:?}");
    }
    let num_attrs = 4 + num_classes;
    let (rows, row_major) = if dims[1] == num_attrs {
        (dims[2], false)
    } else if dims[2] == num_attrs {
        (dims[1], true)
    } else {
        anyhow::bail!(
            "detector output shape {dims:?} does not match {num_classes} classes"
        );
    };

    // A single 2-D view serves both layouts; the attributes-major case is
    // read through the transposed view.
    let view = if row_major {
        ArrayView2::from_shape((rows, num_attrs), data)?
    } else {
        ArrayView2::from_shape((num_attrs, rows), data)?.reversed_axes()
    };

    let mut candidates = Vec::new();
    for row in view.rows() {
        let mut best_class = 0;
        let mut best_score = 0.0f32;
        for c in 0..num_classes {
            let score = row[4 + c];
            if score > best_score {
                best_score = score;
                best_class = c;
            }
        }

        if best_score <= confidence_threshold || !VEHICLE_CLASS_IDS.contains(&best_class) {
            continue;
        }

        let (cx, cy, w, h) = (row[0], row[1], row[2], row[3]);
        let bbox = [
            (cx - w / 2.0) * x_factor,
            (cy - h / 2.0) * y_factor,
            (cx + w / 2.0) * x_factor,
            (cy + h / 2.0) * y_factor,
        ];
        candidates.push((bbox, best_score));
    }
    Ok(candidates)
}

/// Greedy non-maximum suppression over (box, score) pairs.
pub fn nms(mut candidates: Vec<(BBox, f32)>, iou_threshold: f32) -> Vec<(BBox, f32)> {
    if candidates.is_empty() {
        return candidates;
    }

    candidates.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));

    let mut keep: Vec<(BBox, f32)> = Vec::new();
    'outer: for cand in candidates {
        for kept in &keep {
            if bbox_iou(&kept.0, &cand.0) >= iou_threshold {
                continue 'outer;
            }
        }
        keep.push(cand);
    }
    keep
}

fn load_class_names(path: &Path) -> Result<Vec<String>> {
    let contents = std::fs::read_to_string(path)
        .with_context(|| format!("could not open class-name file {}", path.display()))?;
    // Every line keeps its slot so class indices stay aligned.
    Ok(contents.lines().map(|l| l.trim().to_string()).collect())
}

/// Resolve an asset path against the executable directory, mirroring the
/// convention that model files sit next to the binary.
pub fn resolve_asset_path(configured: &str) -> PathBuf {
    let path = Path::new(configured);
    if path.is_absolute() {
        return path.to_path_buf();
    }
    std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(path)))
        .unwrap_or_else(|| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nms_with_zero_inputs_returns_zero_outputs() {
        assert!(nms(Vec::new(), 0.4).is_empty());
    }

    #[test]
    fn nms_suppresses_heavy_overlap_keeps_best_score() {
        let a = ([0.0, 0.0, 100.0, 100.0], 0.9);
        let b = ([5.0, 5.0, 105.0, 105.0], 0.6);
        let c = ([300.0, 300.0, 400.0, 400.0], 0.7);
        let kept = nms(vec![b, a, c], 0.4);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].1, 0.9);
        assert!(kept.iter().any(|(_, s)| *s == 0.7));
    }

    /// Build a synthetic output buffer with one confident car prediction.
    fn synthetic_output(num_classes: usize, attrs_major: bool) -> (Vec<f32>, Vec<usize>) {
        let num_attrs = 4 + num_classes;
        let n = 3;
        let mut preds = vec![vec![0.0f32; num_attrs]; n];
        // Prediction 1: car (class 2) at center (320, 320), 64x32, score 0.8.
        preds[1][0] = 320.0;
        preds[1][1] = 320.0;
        preds[1][2] = 64.0;
        preds[1][3] = 32.0;
        preds[1][4 + 2] = 0.8;
        // Prediction 2: confident *person* (class 0) must be filtered out.
        preds[2][0] = 100.0;
        preds[2][1] = 100.0;
        preds[2][2] = 20.0;
        preds[2][3] = 40.0;
        preds[2][4] = 0.9;

        if attrs_major {
            let mut data = vec![0.0f32; num_attrs * n];
            for (i, p) in preds.iter().enumerate() {
                for (k, v) in p.iter().enumerate() {
                    data[k * n + i] = *v;
                }
            }
            (data, vec![1, num_attrs, n])
        } else {
            (preds.concat(), vec![1, n, num_attrs])
        }
    }

    #[test]
    fn decode_handles_both_output_orientations() {
        for attrs_major in [true, false] {
            let (data, dims) = synthetic_output(80, attrs_major);
            let cands = decode_predictions(&data, &dims, 80, 0.45, 2.0, 1.0).unwrap();
            assert_eq!(cands.len(), 1, "attrs_major={attrs_major}");
            let (bbox, score) = cands[0];
            assert_eq!(score, 0.8);
            // cx=320 w=64 with x_factor 2: x1 = (320-32)*2
            assert_eq!(bbox, [576.0, 304.0, 704.0, 336.0]);
        }
    }

    #[test]
    fn decode_rejects_shape_mismatch() {
        let data = vec![0.0f32; 10];
        assert!(decode_predictions(&data, &[1, 2, 5], 80, 0.45, 1.0, 1.0).is_err());
        assert!(decode_predictions(&data, &[10], 80, 0.45, 1.0, 1.0).is_err());
    }

    #[test]
    fn low_confidence_predictions_are_dropped() {
        let (mut data, dims) = synthetic_output(80, false);
        // Drop the car's score under the threshold.
        let num_attrs = 84;
        data[num_attrs + 4 + 2] = 0.3;
        let cands = decode_predictions(&data, &dims, 80, 0.45, 1.0, 1.0).unwrap();
        assert!(cands.is_empty());
    }
}

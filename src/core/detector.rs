use image::{DynamicImage, GrayImage};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DetectionError {
    #[error("Failed to load detector model {path}: {message}")]
    ModelLoad { path: String, message: String },

    #[error("Detector rejected a {width}x{height} image: {message}")]
    InvalidInput {
        width: u32,
        height: u32,
        message: String,
    },

    #[error("Detector failed: {message}")]
    Failed { message: String },
}

/// Raw candidate produced by the cascade classifier.
///
/// `row`/`col` locate the centre of a square window of side `scale`;
/// `score` is the classifier confidence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub row: i32,
    pub col: i32,
    pub scale: i32,
    pub score: f32,
}

impl Detection {
    pub fn new(row: i32, col: i32, scale: i32, score: f32) -> Self {
        Self {
            row,
            col,
            scale,
            score,
        }
    }
}

/// Search granularity handed to the detector on every call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CascadeParams {
    /// Smallest face side searched for, in pixels.
    pub min_size: u32,
    /// Largest face side searched for, in pixels.
    pub max_size: u32,
    /// Sliding window step as a fraction of the window size.
    pub shift_factor: f32,
    /// Growth factor between pyramid levels.
    pub scale_factor: f32,
    /// IoU above which two detections are merged into one cluster.
    pub cluster_iou: f32,
}

impl Default for CascadeParams {
    fn default() -> Self {
        Self {
            min_size: 20,
            max_size: 2000,
            shift_factor: 0.1,
            scale_factor: 1.1,
            cluster_iou: 0.18,
        }
    }
}

/// Pluggable face detection backend.
///
/// Implementations receive a row-major grayscale buffer of `width` × `height`
/// bytes and return unclustered candidates. Loading any model is the
/// implementation's own concern and must happen before the first call.
pub trait FaceDetector: Send + Sync {
    fn detect(
        &self,
        gray: &[u8],
        width: u32,
        height: u32,
        params: &CascadeParams,
    ) -> Result<Vec<Detection>, DetectionError>;
}

/// Convert any decoded image into the luma buffer detectors consume.
pub fn to_grayscale(image: &DynamicImage) -> GrayImage {
    image.to_luma8()
}

/// Intersection over union of the square windows of two detections.
fn iou(a: &Detection, b: &Detection) -> f64 {
    let (r1, c1, s1) = (a.row as f64, a.col as f64, a.scale as f64);
    let (r2, c2, s2) = (b.row as f64, b.col as f64, b.scale as f64);

    let over_row = ((r1 + s1 / 2.0).min(r2 + s2 / 2.0) - (r1 - s1 / 2.0).max(r2 - s2 / 2.0)).max(0.0);
    let over_col = ((c1 + s1 / 2.0).min(c2 + s2 / 2.0) - (c1 - s1 / 2.0).max(c2 - s2 / 2.0)).max(0.0);
    let overlap = over_row * over_col;
    let union = s1 * s1 + s2 * s2 - overlap;

    if union <= 0.0 { 0.0 } else { overlap / union }
}

/// Merge overlapping detections.
///
/// Candidates are visited in descending score order. Each one not yet
/// absorbed seeds a cluster containing every detection whose IoU with it
/// exceeds `iou_threshold`; the cluster reports the integer mean position and
/// scale and the summed score of its members.
pub fn cluster_detections(detections: &[Detection], iou_threshold: f32) -> Vec<Detection> {
    let mut sorted = detections.to_vec();
    sorted.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));

    let threshold = iou_threshold as f64;
    let mut assigned = vec![false; sorted.len()];
    let mut clusters = Vec::new();

    for i in 0..sorted.len() {
        if assigned[i] {
            continue;
        }

        let (mut row, mut col, mut scale, mut score, mut count) = (0i64, 0i64, 0i64, 0f32, 0i64);
        for j in 0..sorted.len() {
            if assigned[j] || iou(&sorted[i], &sorted[j]) <= threshold {
                continue;
            }
            assigned[j] = true;
            row += sorted[j].row as i64;
            col += sorted[j].col as i64;
            scale += sorted[j].scale as i64;
            score += sorted[j].score;
            count += 1;
        }

        if count > 0 {
            clusters.push(Detection {
                row: (row / count) as i32,
                col: (col / count) as i32,
                scale: (scale / count) as i32,
                score,
            });
        }
    }

    clusters
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_identical_detections_merge() {
        let detections = vec![
            Detection::new(100, 100, 40, 3.0),
            Detection::new(100, 100, 40, 4.0),
        ];

        let clusters = cluster_detections(&detections, 0.18);

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0], Detection::new(100, 100, 40, 7.0));
    }

    #[test]
    fn test_overlapping_detections_average() {
        let detections = vec![
            Detection::new(100, 100, 40, 6.0),
            Detection::new(104, 102, 44, 2.0),
        ];

        let clusters = cluster_detections(&detections, 0.18);

        assert_eq!(clusters.len(), 1);
        assert_eq!(clusters[0].row, 102);
        assert_eq!(clusters[0].col, 101);
        assert_eq!(clusters[0].scale, 42);
        assert!((clusters[0].score - 8.0).abs() < f32::EPSILON);
    }

    #[test]
    fn test_distant_detections_stay_separate() {
        let detections = vec![
            Detection::new(50, 50, 30, 5.5),
            Detection::new(300, 300, 30, 9.0),
        ];

        let clusters = cluster_detections(&detections, 0.18);

        // Highest score seeds the first cluster
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].row, 300);
        assert_eq!(clusters[1].row, 50);
    }

    #[test]
    fn test_empty_input() {
        assert!(cluster_detections(&[], 0.18).is_empty());
    }

    #[test]
    fn test_degenerate_scale_is_dropped() {
        // A zero-sized window never overlaps anything, not even itself
        let clusters = cluster_detections(&[Detection::new(10, 10, 0, 9.0)], 0.18);
        assert!(clusters.is_empty());
    }

    #[test]
    fn test_default_params() {
        let params = CascadeParams::default();
        assert_eq!(params.min_size, 20);
        assert_eq!(params.max_size, 2000);
        assert!((params.shift_factor - 0.1).abs() < f32::EPSILON);
        assert!((params.scale_factor - 1.1).abs() < f32::EPSILON);
        assert!((params.cluster_iou - 0.18).abs() < f32::EPSILON);
    }

    #[test]
    fn test_to_grayscale_keeps_dimensions() {
        let img = DynamicImage::new_rgb8(32, 16);
        let gray = to_grayscale(&img);
        assert_eq!(gray.dimensions(), (32, 16));
    }
}

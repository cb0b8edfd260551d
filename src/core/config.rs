use crate::core::detector::CascadeParams;
use crate::core::region::DEFAULT_MIN_SCORE;
use crate::core::store::DEFAULT_JPEG_QUALITY;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use thiserror::Error;

/// Largest pyramid step between detector scales.
pub const MAX_SCALE_FACTOR: f32 = 2.0;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to parse config {path}: {source}")]
    Parse {
        path: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid config: {message}")]
    Invalid { message: String },
}

/// Settings for one batch run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub detector: CascadeParams,
    /// Detections must score strictly above this to be cropped.
    pub min_score: f32,
    pub jpeg_quality: u8,
    /// Descend into subdirectories of the source directory.
    pub recursive: bool,
    /// Worker threads; `None` uses one per CPU.
    pub jobs: Option<usize>,
    /// Create the destination directory instead of failing when it is missing.
    pub create_destination: bool,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            detector: CascadeParams::default(),
            min_score: DEFAULT_MIN_SCORE,
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            recursive: false,
            jobs: None,
            create_destination: false,
        }
    }
}

impl PipelineConfig {
    /// Load from a JSON file; missing fields take their defaults.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        let config: Self = serde_json::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.display().to_string(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    pub fn worker_count(&self) -> usize {
        self.jobs.unwrap_or_else(num_cpus::get).max(1)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |message: String| Err(ConfigError::Invalid { message });
        let detector = &self.detector;

        if detector.min_size < 1 {
            return invalid("detector.min_size must be at least 1".to_string());
        }
        if detector.max_size < detector.min_size {
            return invalid(format!(
                "detector.max_size ({}) is smaller than detector.min_size ({})",
                detector.max_size, detector.min_size
            ));
        }
        if !(detector.shift_factor > 0.0 && detector.shift_factor <= 1.0) {
            return invalid(format!(
                "detector.shift_factor must be in (0, 1], got {}",
                detector.shift_factor
            ));
        }
        if !(detector.scale_factor > 1.0 && detector.scale_factor <= MAX_SCALE_FACTOR) {
            return invalid(format!(
                "detector.scale_factor must be in (1, {}], got {}",
                MAX_SCALE_FACTOR, detector.scale_factor
            ));
        }
        if !(0.0..=1.0).contains(&detector.cluster_iou) {
            return invalid(format!(
                "detector.cluster_iou must be in [0, 1], got {}",
                detector.cluster_iou
            ));
        }
        if !self.min_score.is_finite() {
            return invalid("min_score must be a finite number".to_string());
        }
        if !(1..=100).contains(&self.jpeg_quality) {
            return invalid(format!("jpeg_quality must be in 1..=100, got {}", self.jpeg_quality));
        }
        if self.jobs == Some(0) {
            return invalid("jobs must be at least 1".to_string());
        }
        Ok(())
    }
}

use crate::core::crop::CropError;
use crate::core::hash::ContentKey;
use crate::core::region::FaceRegion;
use crate::core::store::StoreError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// One output record per stored crop.
///
/// `faces` lists every region found in the source image, while
/// `image_base64` holds the data URI of the single crop at index `region`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DetectionResult {
    pub source: PathBuf,
    pub region: usize,
    pub content_key: ContentKey,
    pub faces: Vec<FaceRegion>,
    pub image_base64: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureKind {
    #[serde(rename = "LoadError")]
    Load,
    #[serde(rename = "DetectionError")]
    Detection,
    EmptyRegion,
    InvalidSource,
    UnsupportedFormat,
    #[serde(rename = "EncodeError")]
    Encode,
    #[serde(rename = "IOError")]
    Io,
}

impl fmt::Display for FailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Load => "LoadError",
            Self::Detection => "DetectionError",
            Self::EmptyRegion => "EmptyRegion",
            Self::InvalidSource => "InvalidSource",
            Self::UnsupportedFormat => "UnsupportedFormat",
            Self::Encode => "EncodeError",
            Self::Io => "IOError",
        };
        write!(f, "{}", name)
    }
}

impl From<&CropError> for FailureKind {
    fn from(error: &CropError) -> Self {
        match error {
            CropError::EmptyRegion { .. } => Self::EmptyRegion,
            CropError::InvalidSource { .. } => Self::InvalidSource,
        }
    }
}

impl From<&StoreError> for FailureKind {
    fn from(error: &StoreError) -> Self {
        match error {
            StoreError::UnsupportedFormat { .. } => Self::UnsupportedFormat,
            StoreError::Encode(_) | StoreError::UnrecognizedContent => Self::Encode,
            StoreError::Io { .. } | StoreError::DestinationUnavailable { .. } => Self::Io,
        }
    }
}

/// A contained failure: one image, or one region of an image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailureRecord {
    pub path: PathBuf,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub region_index: Option<usize>,
    pub kind: FailureKind,
    pub message: String,
}

impl fmt::Display for FailureRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.region_index {
            Some(index) => write!(
                f,
                "{} (face {}): {}: {}",
                self.path.display(),
                index + 1,
                self.kind,
                self.message
            ),
            None => write!(f, "{}: {}: {}", self.path.display(), self.kind, self.message),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchSummary {
    pub images_total: usize,
    pub images_processed: usize,
    pub images_failed: usize,
    pub images_skipped: usize,
    pub images_cancelled: usize,
    pub faces_found: usize,
    pub crops_written: usize,
    pub crops_deduplicated: usize,
    pub region_failures: usize,
}

/// Everything one batch produced, in discovery order.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BatchReport {
    pub started_at: String,
    pub source: PathBuf,
    pub destination: PathBuf,
    pub results: Vec<DetectionResult>,
    pub failures: Vec<FailureRecord>,
    pub skipped: Vec<PathBuf>,
    pub summary: BatchSummary,
    /// Set when the destination became unusable mid-batch. Images that had
    /// not started by then are counted as cancelled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<FailureRecord>,
}

impl BatchReport {
    /// Failures that cost a whole image rather than a single region.
    pub fn image_failures(&self) -> impl Iterator<Item = &FailureRecord> {
        self.failures.iter().filter(|f| f.region_index.is_none())
    }

    pub fn is_complete(&self) -> bool {
        self.aborted.is_none()
    }

    pub fn results_for<'a>(&'a self, source: &'a std::path::Path) -> impl Iterator<Item = &'a DetectionResult> {
        self.results.iter().filter(move |r| r.source == source)
    }
}

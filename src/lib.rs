//! Batch face cropping: detect faces in a directory of images, crop each face,
//! and store the crops under a content-derived name.

pub mod core;

pub use crate::core::config::PipelineConfig;
pub use crate::core::crop::{CropFormat, Cropper, SourceImage};
pub use crate::core::detector::{CascadeParams, Detection, FaceDetector};
pub use crate::core::hash::{ContentKey, HashService};
pub use crate::core::region::{FaceRegion, RegionExtractor};
pub use crate::core::report::{BatchReport, DetectionResult, FailureKind, FailureRecord};
#[cfg(feature = "rustface")]
pub use crate::core::rustface_backend::RustfaceDetector;
pub use crate::core::scanner::{ScanError, ScannerService};
pub use crate::core::store::{CropStore, StoredCrop};

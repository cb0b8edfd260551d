use crate::core::detector::{CascadeParams, Detection, DetectionError, FaceDetector};
use std::fs::File;
use std::io::BufReader;
use std::path::Path;

/// Side of the classifier's base window; the sliding step is a fraction of it.
const WINDOW_SIZE: f32 = 40.0;

/// rustface refuses smaller minimum face sizes.
const MIN_SUPPORTED_FACE: u32 = 20;

/// Face detector backed by the `rustface` crate (SeetaFace engine).
///
/// The model is read once on construction and shared by every call, so one
/// instance can serve all workers of a batch.
pub struct RustfaceDetector {
    model: rustface::Model,
}

impl RustfaceDetector {
    /// Load the cascade model from `path`.
    pub fn from_path(path: &Path) -> Result<Self, DetectionError> {
        let model_load_error = |message: String| DetectionError::ModelLoad {
            path: path.display().to_string(),
            message,
        };

        let file = File::open(path).map_err(|e| model_load_error(e.to_string()))?;
        let model = rustface::read_model(BufReader::new(file))
            .map_err(|e| model_load_error(e.to_string()))?;

        log::info!("Loaded face detection model from {}", path.display());
        Ok(Self { model })
    }
}

impl FaceDetector for RustfaceDetector {
    fn detect(
        &self,
        gray: &[u8],
        width: u32,
        height: u32,
        params: &CascadeParams,
    ) -> Result<Vec<Detection>, DetectionError> {
        if width == 0 || height == 0 || gray.len() != (width as usize) * (height as usize) {
            return Err(DetectionError::InvalidInput {
                width,
                height,
                message: format!("expected {} luma bytes, got {}", width as u64 * height as u64, gray.len()),
            });
        }

        let mut detector = rustface::create_detector_with_model(self.model.clone());
        detector.set_min_face_size(params.min_size.max(MIN_SUPPORTED_FACE));
        detector.set_max_face_size(params.max_size.max(MIN_SUPPORTED_FACE));
        detector.set_pyramid_scale_factor(1.0 / params.scale_factor);
        let step = (params.shift_factor * WINDOW_SIZE).round().max(1.0) as u32;
        detector.set_slide_window_step(step, step);
        detector.set_score_thresh(0.0);

        let faces = detector.detect(&rustface::ImageData::new(gray, width, height));

        Ok(faces
            .iter()
            .map(|face| {
                let bbox = face.bbox();
                let (w, h) = (bbox.width() as i32, bbox.height() as i32);
                Detection {
                    row: bbox.y() + h / 2,
                    col: bbox.x() + w / 2,
                    scale: w.max(h),
                    score: face.score() as f32,
                }
            })
            .collect())
    }
}

use crate::core::config::{ConfigError, PipelineConfig};
use crate::core::crop::{CropFormat, Cropper, SourceImage};
use crate::core::detector::{cluster_detections, to_grayscale, DetectionError, FaceDetector};
use crate::core::region::{FaceRegion, RegionExtractor};
use crate::core::report::{BatchReport, BatchSummary, DetectionResult, FailureKind, FailureRecord};
use crate::core::store::{CropStore, StoreError};
use chrono::Utc;
use image::{GenericImageView, ImageReader};
use rayon::prelude::*;
use serde::Serialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use walkdir::WalkDir;

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("Invalid path: {path}")]
    InvalidPath { path: String },

    #[error("Cannot load image {path}: {message}")]
    Load { path: String, message: String },

    #[error("Face detection error: {0}")]
    Detection(#[from] DetectionError),

    #[error(transparent)]
    Destination(#[from] StoreError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Failed to start worker pool: {message}")]
    WorkerPool { message: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Operation cancelled")]
    Cancelled,
}

impl ScanError {
    /// Report category for errors that cost a single image.
    pub fn failure_kind(&self) -> FailureKind {
        match self {
            Self::Load { .. } | Self::InvalidPath { .. } => FailureKind::Load,
            Self::Detection(_) => FailureKind::Detection,
            Self::Destination(e) => FailureKind::from(e),
            _ => FailureKind::Io,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ScanProgress {
    pub files_processed: usize,
    pub total_files: usize,
    pub current_file: String,
}

pub type ProgressCallback = Box<dyn Fn(ScanProgress) + Send + Sync>;

/// Files found under a source directory.
#[derive(Debug, Default)]
pub struct Discovery {
    pub images: Vec<PathBuf>,
    /// Files whose extension is not a supported image type.
    pub skipped: Vec<PathBuf>,
    /// Entries the directory walk could not read.
    pub failures: Vec<FailureRecord>,
}

/// What processing one source image produced.
#[derive(Debug, Clone)]
pub struct ImageOutcome {
    pub path: PathBuf,
    pub regions: Vec<FaceRegion>,
    pub results: Vec<DetectionResult>,
    /// Per-region failures; sibling regions were still processed.
    pub failures: Vec<FailureRecord>,
    pub crops_written: usize,
    pub crops_deduplicated: usize,
}

enum ImageStatus {
    Done(ImageOutcome),
    Failed(FailureRecord),
    Cancelled,
}

/// Runs source images through detect, extract, crop and store.
pub struct ScannerService {
    detector: Arc<dyn FaceDetector>,
    config: PipelineConfig,
    extractor: RegionExtractor,
    cropper: Cropper,
    store: CropStore,
    cancellation_token: Arc<AtomicBool>,
    progress_callback: Option<ProgressCallback>,
}

impl ScannerService {
    pub fn new(detector: Arc<dyn FaceDetector>, destination: impl Into<PathBuf>, config: PipelineConfig) -> Self {
        let store = CropStore::new(destination).with_jpeg_quality(config.jpeg_quality);
        Self {
            detector,
            extractor: RegionExtractor::new(config.min_score),
            cropper: Cropper::new(),
            store,
            config,
            cancellation_token: Arc::new(AtomicBool::new(false)),
            progress_callback: None,
        }
    }

    pub fn with_progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.progress_callback = Some(callback);
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn store(&self) -> &CropStore {
        &self.store
    }

    pub fn cancellation_token(&self) -> Arc<AtomicBool> {
        self.cancellation_token.clone()
    }

    /// Stop after the images already in flight complete.
    pub fn cancel(&self) {
        self.cancellation_token.store(true, Ordering::Relaxed);
    }

    fn is_cancelled(&self) -> bool {
        self.cancellation_token.load(Ordering::Relaxed)
    }

    /// Process every supported image under `source`.
    ///
    /// Failures confined to one image or region are collected in the report.
    /// An unusable destination found before any image is read is an error;
    /// one found mid-batch stops the remaining images and is recorded in
    /// `BatchReport::aborted` next to everything already produced.
    pub fn run(&self, source: &Path) -> Result<BatchReport, ScanError> {
        if self.is_cancelled() {
            return Err(ScanError::Cancelled);
        }

        let started_at = Utc::now().to_rfc3339();
        self.config.validate()?;
        self.prepare_destination()?;

        let discovery = self.discover_files(source)?;
        let total_files = discovery.images.len();
        log::info!(
            "Processing {} image(s) from {} with {} worker(s)",
            total_files,
            source.display(),
            self.config.worker_count()
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.config.worker_count())
            .build()
            .map_err(|e| ScanError::WorkerPool { message: e.to_string() })?;

        let processed_count = AtomicUsize::new(0);
        let stop = AtomicBool::new(false);
        let systemic_error: Mutex<Option<StoreError>> = Mutex::new(None);

        let statuses: Vec<ImageStatus> = pool.install(|| {
            discovery
                .images
                .par_iter()
                .map(|path| {
                    if self.is_cancelled() || stop.load(Ordering::Relaxed) {
                        return ImageStatus::Cancelled;
                    }

                    let status = match self.process_image(path) {
                        Ok(outcome) => {
                            if outcome.failures.iter().any(|f| f.kind == FailureKind::Io) {
                                self.recheck_destination(&stop, &systemic_error);
                            }
                            ImageStatus::Done(outcome)
                        }
                        Err(e) => {
                            let record = FailureRecord {
                                path: path.clone(),
                                region_index: None,
                                kind: e.failure_kind(),
                                message: e.to_string(),
                            };
                            log::error!("Skipping image: {}", record);
                            ImageStatus::Failed(record)
                        }
                    };

                    let current_count = processed_count.fetch_add(1, Ordering::Relaxed) + 1;
                    self.send_progress(ScanProgress {
                        files_processed: current_count,
                        total_files,
                        current_file: path.to_string_lossy().to_string(),
                    });

                    status
                })
                .collect()
        });

        let mut report = self.assemble_report(started_at, source, discovery, statuses);
        if let Some(error) = systemic_error.into_inner().unwrap_or_else(|e| e.into_inner()) {
            report.aborted = Some(FailureRecord {
                path: self.store.destination().to_path_buf(),
                region_index: None,
                kind: FailureKind::from(&error),
                message: error.to_string(),
            });
        }

        Ok(report)
    }

    /// A region failed on IO: if the destination itself has gone away, stop
    /// the batch instead of failing every remaining image the same way.
    fn recheck_destination(&self, stop: &AtomicBool, systemic_error: &Mutex<Option<StoreError>>) {
        if let Err(e) = self.store.check_destination() {
            log::error!("Aborting batch: {}", e);
            stop.store(true, Ordering::Relaxed);
            let mut slot = systemic_error.lock().unwrap_or_else(|e| e.into_inner());
            slot.get_or_insert(e);
        }
    }

    fn assemble_report(
        &self,
        started_at: String,
        source: &Path,
        discovery: Discovery,
        statuses: Vec<ImageStatus>,
    ) -> BatchReport {
        let mut summary = BatchSummary {
            images_total: discovery.images.len(),
            images_skipped: discovery.skipped.len(),
            ..Default::default()
        };
        let mut results = Vec::new();
        let mut failures = discovery.failures;

        for status in statuses {
            match status {
                ImageStatus::Done(outcome) => {
                    summary.images_processed += 1;
                    summary.faces_found += outcome.regions.len();
                    summary.crops_written += outcome.crops_written;
                    summary.crops_deduplicated += outcome.crops_deduplicated;
                    summary.region_failures += outcome.failures.len();
                    results.extend(outcome.results);
                    failures.extend(outcome.failures);
                }
                ImageStatus::Failed(record) => {
                    summary.images_failed += 1;
                    failures.push(record);
                }
                ImageStatus::Cancelled => summary.images_cancelled += 1,
            }
        }

        BatchReport {
            started_at,
            source: source.to_path_buf(),
            destination: self.store.destination().to_path_buf(),
            results,
            failures,
            skipped: discovery.skipped,
            summary,
            aborted: None,
        }
    }

    fn prepare_destination(&self) -> Result<(), ScanError> {
        let destination = self.store.destination();
        if self.config.create_destination && !destination.exists() {
            fs::create_dir_all(destination)?;
            log::info!("Created destination directory {}", destination.display());
        }
        self.store.check_destination()?;
        Ok(())
    }

    /// List the files of `source`, sorted by path, split into supported
    /// images and skipped entries.
    pub fn discover_files(&self, source: &Path) -> Result<Discovery, ScanError> {
        if !source.is_dir() {
            return Err(ScanError::InvalidPath {
                path: format!("{} is not a directory", source.display()),
            });
        }

        let max_depth = if self.config.recursive { usize::MAX } else { 1 };
        let mut discovery = Discovery::default();

        for entry in WalkDir::new(source)
            .min_depth(1)
            .max_depth(max_depth)
            .follow_links(false)
            .sort_by_file_name()
        {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    let path = e.path().map(Path::to_path_buf).unwrap_or_else(|| source.to_path_buf());
                    log::warn!("Cannot read {}: {}", path.display(), e);
                    discovery.failures.push(FailureRecord {
                        path,
                        region_index: None,
                        kind: FailureKind::Io,
                        message: e.to_string(),
                    });
                    continue;
                }
            };

            if !entry.file_type().is_file() {
                continue;
            }

            let path = entry.into_path();
            if CropFormat::from_path(&path).is_some() {
                discovery.images.push(path);
            } else {
                log::info!("{} skipped. Filetype not supported.", path.display());
                discovery.skipped.push(path);
            }
        }

        Ok(discovery)
    }

    fn load_image(&self, path: &Path) -> Result<SourceImage, ScanError> {
        let load_error = |message: String| ScanError::Load {
            path: path.display().to_string(),
            message,
        };

        let (format, extension) = path
            .extension()
            .and_then(|ext| ext.to_str())
            .and_then(|ext| CropFormat::parse(ext).map(|format| (format, ext)))
            .ok_or_else(|| load_error("unsupported file extension".to_string()))?;
        let image = ImageReader::open(path)
            .map_err(|e| load_error(e.to_string()))?
            .with_guessed_format()
            .map_err(|e| load_error(e.to_string()))?
            .decode()
            .map_err(|e| load_error(e.to_string()))?;

        Ok(SourceImage::new(image, format).with_extension(extension))
    }

    /// Detect, crop and store every face of one image.
    ///
    /// Load and detection failures are returned as errors; crop and store
    /// failures are recorded per region in the outcome.
    pub fn process_image(&self, path: &Path) -> Result<ImageOutcome, ScanError> {
        log::info!("Processing image {} ...", path.display());
        let source = self.load_image(path)?;

        let (width, height) = source.image.dimensions();
        let gray = to_grayscale(&source.image);
        let params = &self.config.detector;
        let raw = self.detector.detect(gray.as_raw(), width, height, params)?;
        let detections = cluster_detections(&raw, params.cluster_iou);
        log::info!("Detected faces in image {}: {}", path.display(), detections.len());

        let regions = self.extractor.extract(&detections);
        log::debug!("Regions for {}: {:?}", path.display(), regions);

        let mut outcome = ImageOutcome {
            path: path.to_path_buf(),
            regions: regions.clone(),
            results: Vec::with_capacity(regions.len()),
            failures: Vec::new(),
            crops_written: 0,
            crops_deduplicated: 0,
        };

        for (index, region) in regions.iter().enumerate() {
            log::debug!(
                "Face {} in {}: min ({}, {}) max ({}, {})",
                index + 1,
                path.display(),
                region.min_x,
                region.min_y,
                region.max_x,
                region.max_y
            );

            let crop = match self.cropper.crop(&source, region) {
                Ok(crop) => crop,
                Err(e) => {
                    outcome.push_failure(index, FailureKind::from(&e), e.to_string());
                    continue;
                }
            };

            let stored = match self.store.store(&crop) {
                Ok(stored) => stored,
                Err(e) => {
                    outcome.push_failure(index, FailureKind::from(&e), e.to_string());
                    continue;
                }
            };

            if stored.newly_written {
                outcome.crops_written += 1;
            } else {
                outcome.crops_deduplicated += 1;
            }

            outcome.results.push(DetectionResult {
                source: path.to_path_buf(),
                region: index,
                content_key: stored.key,
                faces: regions.clone(),
                image_base64: stored.data_uri,
            });
        }

        Ok(outcome)
    }

    fn send_progress(&self, progress: ScanProgress) {
        if let Some(callback) = &self.progress_callback {
            // Callback panics are logged, never propagated to the worker
            if let Err(e) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| callback(progress))) {
                log::warn!("Progress callback panicked: {:?}", e);
            }
        }
    }
}

impl ImageOutcome {
    fn push_failure(&mut self, index: usize, kind: FailureKind, message: String) {
        let record = FailureRecord {
            path: self.path.clone(),
            region_index: Some(index),
            kind,
            message,
        };
        log::warn!("Face skipped: {}", record);
        self.failures.push(record);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::detector::{CascadeParams, Detection};
    use base64::{engine::general_purpose::STANDARD, Engine};
    use image::{ImageBuffer, Rgb};
    use tempfile::TempDir;

    /// Reports the same detections for every image.
    struct FixedDetector {
        detections: Vec<Detection>,
        calls: AtomicUsize,
    }

    impl FixedDetector {
        fn new(detections: Vec<Detection>) -> Arc<Self> {
            Arc::new(Self {
                detections,
                calls: AtomicUsize::new(0),
            })
        }
    }

    impl FaceDetector for FixedDetector {
        fn detect(
            &self,
            _gray: &[u8],
            _width: u32,
            _height: u32,
            _params: &CascadeParams,
        ) -> Result<Vec<Detection>, DetectionError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            Ok(self.detections.clone())
        }
    }

    /// Fails on images of one particular width.
    struct FailingDetector {
        fail_width: u32,
    }

    impl FaceDetector for FailingDetector {
        fn detect(
            &self,
            _gray: &[u8],
            width: u32,
            _height: u32,
            _params: &CascadeParams,
        ) -> Result<Vec<Detection>, DetectionError> {
            if width == self.fail_width {
                return Err(DetectionError::Failed {
                    message: "classifier unavailable".to_string(),
                });
            }
            Ok(vec![Detection::new(20, 20, 20, 9.0)])
        }
    }

    /// Removes the destination directory while detecting its `nth` image.
    struct VanishingDestinationDetector {
        destination: PathBuf,
        nth: usize,
        calls: AtomicUsize,
    }

    impl FaceDetector for VanishingDestinationDetector {
        fn detect(
            &self,
            _gray: &[u8],
            _width: u32,
            _height: u32,
            _params: &CascadeParams,
        ) -> Result<Vec<Detection>, DetectionError> {
            if self.calls.fetch_add(1, Ordering::Relaxed) + 1 == self.nth {
                fs::remove_dir_all(&self.destination).map_err(|e| DetectionError::Failed {
                    message: e.to_string(),
                })?;
            }
            Ok(vec![Detection::new(32, 32, 20, 9.0)])
        }
    }

    fn create_test_image(path: &Path, width: u32, height: u32) -> Result<(), Box<dyn std::error::Error>> {
        let img = ImageBuffer::from_fn(width, height, |x, y| {
            let intensity = ((x + y) % 256) as u8;
            Rgb([intensity, intensity, intensity])
        });

        img.save(path)?;
        Ok(())
    }

    fn panicking_callback(_progress: ScanProgress) {
        panic!("Test panic in callback");
    }

    fn single_worker_config() -> PipelineConfig {
        PipelineConfig {
            jobs: Some(1),
            ..Default::default()
        }
    }

    fn dirs() -> (TempDir, PathBuf, PathBuf) {
        let temp_dir = TempDir::new().unwrap();
        let source = temp_dir.path().join("src");
        let destination = temp_dir.path().join("dst");
        fs::create_dir(&source).unwrap();
        fs::create_dir(&destination).unwrap();
        (temp_dir, source, destination)
    }

    fn stored_files(dir: &Path) -> Vec<PathBuf> {
        let mut files: Vec<PathBuf> = fs::read_dir(dir).unwrap().map(|e| e.unwrap().path()).collect();
        files.sort();
        files
    }

    #[test]
    fn test_process_image_crops_every_region() {
        let (_temp_dir, source, destination) = dirs();
        let image_path = source.join("group.png");
        create_test_image(&image_path, 200, 100).unwrap();

        let detector = FixedDetector::new(vec![
            Detection::new(50, 50, 40, 10.0),
            Detection::new(50, 150, 40, 8.0),
            Detection::new(50, 100, 10, 1.0),
        ]);
        let scanner = ScannerService::new(detector, &destination, single_worker_config());

        let outcome = scanner.process_image(&image_path).unwrap();

        assert_eq!(
            outcome.regions,
            vec![FaceRegion::new(30, 30, 70, 70), FaceRegion::new(130, 30, 170, 70)]
        );
        assert_eq!(outcome.results.len(), 2);
        assert!(outcome.failures.is_empty());
        assert_eq!(outcome.crops_written, 2);

        for (index, result) in outcome.results.iter().enumerate() {
            assert_eq!(result.region, index);
            assert_eq!(result.faces, outcome.regions);
            assert!(result.image_base64.starts_with("data:image/png;base64,"));
        }

        // 40x40 crops of a diagonal gradient differ by position, so two files
        assert_eq!(stored_files(&destination).len(), 2);
    }

    #[test]
    fn test_region_outside_image_does_not_stop_siblings() {
        let (_temp_dir, source, destination) = dirs();
        let image_path = source.join("edge.jpg");
        create_test_image(&image_path, 100, 100).unwrap();

        let detector = FixedDetector::new(vec![
            Detection::new(500, 500, 40, 10.0),
            Detection::new(90, 90, 40, 10.0),
        ]);
        let scanner = ScannerService::new(detector, &destination, single_worker_config());

        let outcome = scanner.process_image(&image_path).unwrap();

        assert_eq!(outcome.regions.len(), 2);
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.failures[0].region_index, Some(0));
        assert_eq!(outcome.failures[0].kind, FailureKind::EmptyRegion);

        assert_eq!(outcome.results.len(), 1);
        let result = &outcome.results[0];
        assert_eq!(result.region, 1);
        assert!(result.image_base64.starts_with("data:image/jpeg;base64,"));

        // The second region is clipped to 30x30 at the bottom-right corner
        let (_, payload) = result.image_base64.split_once(";base64,").unwrap();
        let crop = image::load_from_memory(&STANDARD.decode(payload).unwrap()).unwrap();
        assert_eq!(crop.dimensions(), (30, 30));
    }

    #[test]
    fn test_batch_continues_past_corrupt_image() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("1.png"), 64, 64).unwrap();
        fs::write(source.join("2.jpg"), b"definitely not a jpeg").unwrap();
        create_test_image(&source.join("3.png"), 80, 80).unwrap();

        let detector = FixedDetector::new(vec![Detection::new(30, 30, 20, 9.0)]);
        let scanner = ScannerService::new(detector.clone(), &destination, single_worker_config());

        let report = scanner.run(&source).unwrap();

        assert_eq!(report.summary.images_total, 3);
        assert_eq!(report.summary.images_processed, 2);
        assert_eq!(report.summary.images_failed, 1);

        assert_eq!(report.results_for(&source.join("1.png")).count(), 1);
        assert_eq!(report.results_for(&source.join("2.jpg")).count(), 0);
        assert_eq!(report.results_for(&source.join("3.png")).count(), 1);

        let failures: Vec<_> = report.image_failures().collect();
        assert_eq!(failures.len(), 1);
        assert_eq!(failures[0].path, source.join("2.jpg"));
        assert_eq!(failures[0].kind, FailureKind::Load);

        // The corrupt file never reached the detector
        assert_eq!(detector.calls.load(Ordering::Relaxed), 2);
    }

    #[test]
    fn test_crops_keep_source_extension() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("portrait.JPEG"), 64, 64).unwrap();

        let detector = FixedDetector::new(vec![Detection::new(32, 32, 20, 9.0)]);
        let scanner = ScannerService::new(detector, &destination, single_worker_config());

        let report = scanner.run(&source).unwrap();

        assert_eq!(report.results.len(), 1);
        let key = report.results[0].content_key;
        assert_eq!(stored_files(&destination), vec![destination.join(format!("{}.jpeg", key))]);
    }

    #[test]
    fn test_detection_failure_is_per_image() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("a.png"), 64, 64).unwrap();
        create_test_image(&source.join("b.png"), 70, 70).unwrap();

        let detector = Arc::new(FailingDetector { fail_width: 64 });
        let scanner = ScannerService::new(detector, &destination, single_worker_config());

        let report = scanner.run(&source).unwrap();

        assert_eq!(report.summary.images_failed, 1);
        assert_eq!(report.summary.images_processed, 1);
        assert_eq!(report.failures[0].kind, FailureKind::Detection);
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].source, source.join("b.png"));
    }

    #[test]
    fn test_unsupported_files_are_skipped() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("face.PNG"), 64, 64).unwrap();
        create_test_image(&source.join("face.bmp"), 64, 64).unwrap();
        fs::write(source.join("notes.txt"), b"text content").unwrap();
        fs::create_dir(source.join("nested")).unwrap();
        create_test_image(&source.join("nested").join("deep.png"), 64, 64).unwrap();

        let detector = FixedDetector::new(vec![]);
        let scanner = ScannerService::new(detector, &destination, single_worker_config());

        let discovery = scanner.discover_files(&source).unwrap();

        assert_eq!(discovery.images, vec![source.join("face.PNG")]);
        assert_eq!(discovery.skipped, vec![source.join("face.bmp"), source.join("notes.txt")]);
        assert!(discovery.failures.is_empty());
    }

    #[test]
    fn test_recursive_discovery() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("top.png"), 64, 64).unwrap();
        fs::create_dir(source.join("nested")).unwrap();
        create_test_image(&source.join("nested").join("deep.jpg"), 64, 64).unwrap();

        let config = PipelineConfig {
            recursive: true,
            ..single_worker_config()
        };
        let scanner = ScannerService::new(FixedDetector::new(vec![]), &destination, config);

        let discovery = scanner.discover_files(&source).unwrap();

        assert_eq!(
            discovery.images,
            vec![source.join("nested").join("deep.jpg"), source.join("top.png")]
        );
    }

    #[test]
    fn test_identical_faces_are_stored_once() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("a.png"), 64, 64).unwrap();
        create_test_image(&source.join("b.png"), 64, 64).unwrap();

        let detector = FixedDetector::new(vec![Detection::new(32, 32, 20, 9.0)]);
        let config = PipelineConfig {
            jobs: Some(2),
            ..Default::default()
        };
        let scanner = ScannerService::new(detector, &destination, config);

        let report = scanner.run(&source).unwrap();

        assert_eq!(report.results.len(), 2);
        assert_eq!(report.results[0].content_key, report.results[1].content_key);
        assert_eq!(report.results[0].image_base64, report.results[1].image_base64);
        assert_eq!(report.summary.crops_written, 1);
        assert_eq!(report.summary.crops_deduplicated, 1);
        assert_eq!(stored_files(&destination).len(), 1);
    }

    #[test]
    fn test_missing_destination_aborts_batch() {
        let (temp_dir, source, _destination) = dirs();
        create_test_image(&source.join("a.png"), 64, 64).unwrap();

        let detector = FixedDetector::new(vec![Detection::new(32, 32, 20, 9.0)]);
        let scanner = ScannerService::new(detector.clone(), temp_dir.path().join("nowhere"), single_worker_config());

        let result = scanner.run(&source);

        assert!(matches!(
            result,
            Err(ScanError::Destination(StoreError::DestinationUnavailable { .. }))
        ));
        assert_eq!(detector.calls.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn test_destination_lost_mid_batch_keeps_partial_report() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("1.png"), 64, 64).unwrap();
        create_test_image(&source.join("2.png"), 70, 70).unwrap();
        create_test_image(&source.join("3.png"), 80, 80).unwrap();

        let detector = Arc::new(VanishingDestinationDetector {
            destination: destination.clone(),
            nth: 2,
            calls: AtomicUsize::new(0),
        });
        let scanner = ScannerService::new(detector.clone(), &destination, single_worker_config());

        let report = scanner.run(&source).unwrap();

        assert!(!report.is_complete());
        let aborted = report.aborted.as_ref().unwrap();
        assert_eq!(aborted.path, destination);
        assert_eq!(aborted.kind, FailureKind::Io);

        // The first image's crop was stored before the destination vanished
        assert_eq!(report.results.len(), 1);
        assert_eq!(report.results[0].source, source.join("1.png"));

        // The region that hit the missing directory is still reported
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path, source.join("2.png"));
        assert_eq!(report.failures[0].region_index, Some(0));
        assert_eq!(report.failures[0].kind, FailureKind::Io);

        assert_eq!(report.summary.images_processed, 2);
        assert_eq!(report.summary.images_cancelled, 1);
        assert_eq!(detector.calls.load(Ordering::Relaxed), 2);

        // The abort is scoped to that run; the service stays usable
        assert!(!scanner.cancellation_token().load(Ordering::Relaxed));
        fs::create_dir(&destination).unwrap();
        let rerun = scanner.run(&source).unwrap();
        assert!(rerun.is_complete());
        assert_eq!(rerun.results.len(), 3);
    }

    #[test]
    fn test_create_destination() {
        let (temp_dir, source, _destination) = dirs();
        create_test_image(&source.join("a.png"), 64, 64).unwrap();

        let target = temp_dir.path().join("new").join("dst");
        let config = PipelineConfig {
            create_destination: true,
            ..single_worker_config()
        };
        let detector = FixedDetector::new(vec![Detection::new(32, 32, 20, 9.0)]);
        let scanner = ScannerService::new(detector, &target, config);

        let report = scanner.run(&source).unwrap();

        assert_eq!(report.results.len(), 1);
        assert_eq!(stored_files(&target).len(), 1);
    }

    #[test]
    fn test_source_must_be_directory() {
        let (_temp_dir, source, destination) = dirs();
        let scanner = ScannerService::new(FixedDetector::new(vec![]), &destination, single_worker_config());

        let result = scanner.run(&source.join("missing"));

        assert!(matches!(result, Err(ScanError::InvalidPath { .. })));
    }

    #[test]
    fn test_cancellation_before_run() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("a.png"), 64, 64).unwrap();

        let scanner = ScannerService::new(FixedDetector::new(vec![]), &destination, single_worker_config());
        scanner.cancel();

        assert!(matches!(scanner.run(&source), Err(ScanError::Cancelled)));
    }

    #[test]
    fn test_cancellation_between_images() {
        let (_temp_dir, source, destination) = dirs();
        for i in 0..4 {
            create_test_image(&source.join(format!("{}.png", i)), 64, 64).unwrap();
        }

        let detector = FixedDetector::new(vec![Detection::new(32, 32, 20, 9.0)]);
        let scanner = ScannerService::new(detector, &destination, single_worker_config());
        let token = scanner.cancellation_token();
        let scanner = scanner.with_progress_callback(Box::new(move |progress: ScanProgress| {
            if progress.files_processed == 1 {
                token.store(true, Ordering::Relaxed);
            }
        }));

        let report = scanner.run(&source).unwrap();

        // The first image finishes; the rest are never started
        assert_eq!(report.summary.images_processed, 1);
        assert_eq!(report.summary.images_cancelled, 3);
        assert_eq!(report.results.len(), 1);
    }

    #[test]
    fn test_progress_reporting() {
        let (_temp_dir, source, destination) = dirs();
        for i in 0..3 {
            create_test_image(&source.join(format!("{}.png", i)), 64, 64).unwrap();
        }

        let updates = Arc::new(Mutex::new(Vec::new()));
        let updates_clone = updates.clone();
        let scanner = ScannerService::new(FixedDetector::new(vec![]), &destination, single_worker_config())
            .with_progress_callback(Box::new(move |progress: ScanProgress| {
                updates_clone.lock().unwrap().push(progress);
            }));

        scanner.run(&source).unwrap();

        let updates = updates.lock().unwrap();
        assert_eq!(updates.len(), 3);
        assert!(updates.iter().all(|p| p.total_files == 3));
        assert_eq!(updates.last().unwrap().files_processed, 3);
    }

    #[test]
    fn test_callback_panic_does_not_fail_batch() {
        let (_temp_dir, source, destination) = dirs();
        create_test_image(&source.join("a.png"), 64, 64).unwrap();

        let scanner = ScannerService::new(FixedDetector::new(vec![]), &destination, single_worker_config())
            .with_progress_callback(Box::new(panicking_callback));

        let report = scanner.run(&source).unwrap();
        assert_eq!(report.summary.images_processed, 1);
    }
}

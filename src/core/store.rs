use crate::core::crop::{normalize_extension, CropFormat, CroppedImage};
use crate::core::hash::{ContentKey, HashService};
use base64::{engine::general_purpose::STANDARD, Engine};
use image::codecs::jpeg::JpegEncoder;
use image::codecs::png::{CompressionType, FilterType, PngEncoder};
use image::{DynamicImage, ImageFormat};
use serde::Serialize;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

pub const DEFAULT_JPEG_QUALITY: u8 = 95;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Unsupported format: {format}")]
    UnsupportedFormat { format: String },

    #[error("Image encoding error: {0}")]
    Encode(#[from] image::ImageError),

    #[error("Encoded bytes are neither JPEG nor PNG")]
    UnrecognizedContent,

    #[error("IO error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("Destination {path} is unavailable: {message}")]
    DestinationUnavailable { path: String, message: String },
}

/// A crop as it exists in the destination directory.
#[derive(Debug, Clone, Serialize)]
pub struct StoredCrop {
    pub key: ContentKey,
    pub path: PathBuf,
    pub format: CropFormat,
    /// `data:<mime>;base64,<bytes>` of the stored file.
    pub data_uri: String,
    /// False when an identical crop was already present.
    pub newly_written: bool,
}

/// Build a data URI for encoded image bytes.
///
/// The MIME type is sniffed from the bytes themselves, not taken from any
/// file name.
pub fn data_uri(encoded: &[u8]) -> Result<String, StoreError> {
    let mime = match image::guess_format(encoded) {
        Ok(ImageFormat::Jpeg) => "image/jpeg",
        Ok(ImageFormat::Png) => "image/png",
        _ => return Err(StoreError::UnrecognizedContent),
    };
    Ok(format!("data:{};base64,{}", mime, STANDARD.encode(encoded)))
}

/// Content-addressed, write-once storage for face crops.
pub struct CropStore {
    destination: PathBuf,
    jpeg_quality: u8,
    hash_service: HashService,
}

impl CropStore {
    pub fn new(destination: impl Into<PathBuf>) -> Self {
        Self {
            destination: destination.into(),
            jpeg_quality: DEFAULT_JPEG_QUALITY,
            hash_service: HashService::new(),
        }
    }

    pub fn with_jpeg_quality(mut self, quality: u8) -> Self {
        self.jpeg_quality = quality.clamp(1, 100);
        self
    }

    pub fn destination(&self) -> &Path {
        &self.destination
    }

    /// Verify the destination exists, is a directory and accepts new files.
    pub fn check_destination(&self) -> Result<(), StoreError> {
        let unavailable = |message: String| StoreError::DestinationUnavailable {
            path: self.destination.display().to_string(),
            message,
        };

        let metadata = fs::metadata(&self.destination).map_err(|e| unavailable(e.to_string()))?;
        if !metadata.is_dir() {
            return Err(unavailable("not a directory".to_string()));
        }

        // Dropped (and removed) immediately; only creation matters.
        tempfile::tempfile_in(&self.destination).map_err(|e| unavailable(format!("not writable: {}", e)))?;
        Ok(())
    }

    /// Store a crop in its own format, named `<key><extension>`.
    pub fn store(&self, crop: &CroppedImage) -> Result<StoredCrop, StoreError> {
        self.store_image(&crop.image, crop.format, &crop.extension)
    }

    /// Store an image in the format named by `format` (`jpg`, `jpeg`, `png`).
    pub fn store_as(&self, image: &DynamicImage, format: &str) -> Result<StoredCrop, StoreError> {
        let parsed = CropFormat::parse(format).ok_or_else(|| StoreError::UnsupportedFormat {
            format: format.to_string(),
        })?;
        self.store_image(image, parsed, &normalize_extension(format))
    }

    fn store_image(&self, image: &DynamicImage, format: CropFormat, extension: &str) -> Result<StoredCrop, StoreError> {
        let encoded = self.encode(image, format)?;
        let key = self.hash_service.digest(&encoded);
        let data_uri = data_uri(&encoded)?;

        let path = self.destination.join(format!("{}{}", key.to_hex(), extension));
        let newly_written = self.write_once(&path, &encoded)?;
        if newly_written {
            log::info!("Saved cropped face to {}", path.display());
        } else {
            log::debug!("Crop {} already stored, skipping write", path.display());
        }

        Ok(StoredCrop {
            key,
            path,
            format,
            data_uri,
            newly_written,
        })
    }

    /// Encode with the fixed settings every key depends on.
    pub fn encode(&self, image: &DynamicImage, format: CropFormat) -> Result<Vec<u8>, StoreError> {
        let mut buffer = Vec::new();
        match format {
            CropFormat::Jpeg => {
                // JPEG carries no alpha channel
                let rgb = image.to_rgb8();
                let encoder = JpegEncoder::new_with_quality(&mut buffer, self.jpeg_quality);
                rgb.write_with_encoder(encoder)?;
            }
            CropFormat::Png => {
                let encoder = PngEncoder::new_with_quality(&mut buffer, CompressionType::Fast, FilterType::NoFilter);
                image.write_with_encoder(encoder)?;
            }
        }
        Ok(buffer)
    }

    /// Publish `bytes` at `path` unless something is already there.
    fn write_once(&self, path: &Path, bytes: &[u8]) -> Result<bool, StoreError> {
        if path.exists() {
            return Ok(false);
        }
        self.publish(path, bytes)
    }

    /// The bytes land in a temporary file next to the target and are moved
    /// into place without replacing an existing file, so readers never see a
    /// partial crop and concurrent writers of the same key write it once.
    /// Returns false when another writer got there first.
    fn publish(&self, path: &Path, bytes: &[u8]) -> Result<bool, StoreError> {
        let io_error = |source: io::Error| StoreError::Io {
            path: path.display().to_string(),
            source,
        };

        let mut temp = NamedTempFile::new_in(&self.destination).map_err(io_error)?;
        temp.write_all(bytes).map_err(io_error)?;
        temp.as_file().sync_all().map_err(io_error)?;

        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            temp.as_file()
                .set_permissions(fs::Permissions::from_mode(0o644))
                .map_err(io_error)?;
        }

        match temp.persist_noclobber(path) {
            Ok(_) => Ok(true),
            Err(e) if e.error.kind() == io::ErrorKind::AlreadyExists => Ok(false),
            Err(e) => Err(io_error(e.error)),
        }
    }
}

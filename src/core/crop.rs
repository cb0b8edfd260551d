use crate::core::region::FaceRegion;
use image::{DynamicImage, GenericImageView};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CropError {
    #[error("Region {region:?} does not overlap the {width}x{height} source")]
    EmptyRegion {
        region: FaceRegion,
        width: u32,
        height: u32,
    },

    #[error("Invalid source image: {message}")]
    InvalidSource { message: String },
}

/// Encodings a crop can be stored in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CropFormat {
    Jpeg,
    Png,
}

impl CropFormat {
    /// Accepts `jpg`, `jpeg` and `png`, with or without a leading dot, in
    /// any case.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim_start_matches('.').to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(Self::Jpeg),
            "png" => Some(Self::Png),
            _ => None,
        }
    }

    pub fn from_path(path: &Path) -> Option<Self> {
        path.extension()
            .and_then(|ext| ext.to_str())
            .and_then(Self::parse)
    }

    /// Canonical extension, used when no source file names one.
    pub fn extension(&self) -> &'static str {
        match self {
            Self::Jpeg => ".jpg",
            Self::Png => ".png",
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            Self::Jpeg => "image/jpeg",
            Self::Png => "image/png",
        }
    }
}

impl fmt::Display for CropFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Jpeg => write!(f, "jpeg"),
            Self::Png => write!(f, "png"),
        }
    }
}

/// Lowercase extension with a leading dot: `JPEG` becomes `.jpeg`.
pub fn normalize_extension(extension: &str) -> String {
    format!(".{}", extension.trim_start_matches('.').to_lowercase())
}

/// A decoded source image together with the format it was read from.
///
/// Decoding always yields a pixel buffer, so every source can be
/// sub-regioned.
#[derive(Debug, Clone)]
pub struct SourceImage {
    pub image: DynamicImage,
    pub format: CropFormat,
    /// Extension crops of this image are stored under, e.g. `.jpeg`.
    pub extension: String,
}

impl SourceImage {
    pub fn new(image: DynamicImage, format: CropFormat) -> Self {
        Self {
            image,
            format,
            extension: format.extension().to_string(),
        }
    }

    /// Store crops under the extension of the file the image came from.
    pub fn with_extension(mut self, extension: &str) -> Self {
        self.extension = normalize_extension(extension);
        self
    }

    /// The full pixel rectangle of the image.
    pub fn bounds(&self) -> FaceRegion {
        let (width, height) = self.image.dimensions();
        FaceRegion::new(
            0,
            0,
            i32::try_from(width).unwrap_or(i32::MAX),
            i32::try_from(height).unwrap_or(i32::MAX),
        )
    }
}

/// Pixels of one clipped region, tagged with the format it will be stored in.
#[derive(Debug, Clone)]
pub struct CroppedImage {
    pub image: DynamicImage,
    pub format: CropFormat,
    pub extension: String,
    /// The region actually extracted, after clipping.
    pub region: FaceRegion,
}

pub struct Cropper;

impl Cropper {
    pub fn new() -> Self {
        Self
    }

    /// Copy out the part of `region` that lies inside `source`.
    ///
    /// No scaling or padding is applied: the result is exactly the
    /// intersection of the region with the image bounds.
    pub fn crop(&self, source: &SourceImage, region: &FaceRegion) -> Result<CroppedImage, CropError> {
        let (width, height) = source.image.dimensions();
        if width == 0 || height == 0 {
            return Err(CropError::InvalidSource {
                message: format!("source has zero dimensions ({}x{})", width, height),
            });
        }

        let clipped = region.intersect(&source.bounds());
        if clipped.is_empty() {
            return Err(CropError::EmptyRegion {
                region: *region,
                width,
                height,
            });
        }

        let image = source.image.crop_imm(
            clipped.min_x as u32,
            clipped.min_y as u32,
            clipped.width() as u32,
            clipped.height() as u32,
        );

        Ok(CroppedImage {
            image,
            format: source.format,
            extension: source.extension.clone(),
            region: clipped,
        })
    }
}

impl Default for Cropper {
    fn default() -> Self {
        Self::new()
    }
}

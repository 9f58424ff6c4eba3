//! Image decode/encode boundary.
//!
//! [`ImageCodec`] is what the job worker sees. [`FsImageCodec`] reads local
//! files (plain paths or `file://` URIs), applies EXIF orientation and writes
//! lossless PNG results into an output directory.

use std::io::Cursor;
use std::path::PathBuf;

use chrono::Utc;
use image::{DynamicImage, ImageFormat, RgbImage};
use tracing::debug;
use url::Url;
use uuid::Uuid;

use crate::error::{Result, UpscaleError};
use crate::geometry::crop;
use crate::types::{ImageBuffer, RgbCanvas};

pub trait ImageCodec: Send + Sync {
    /// Cheap pre-flight check run before a job is created. Rejections become
    /// [`UpscaleError::InvalidInput`].
    fn validate_reference(&self, _reference: &str) -> Result<()> {
        Ok(())
    }

    /// Decode to orientation-corrected RGB.
    fn decode(&self, reference: &str) -> Result<ImageBuffer>;

    /// Crop `canvas` to `crop_width × crop_height`, persist it losslessly and
    /// return a URI for the result.
    fn encode(&self, canvas: &RgbCanvas, crop_width: u32, crop_height: u32) -> Result<String>;
}

/// Filesystem-backed codec.
#[derive(Debug, Clone)]
pub struct FsImageCodec {
    output_dir: PathBuf,
}

impl FsImageCodec {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            output_dir: output_dir.into(),
        }
    }
}

/// Turn a plain path or `file://` URI into a local path.
pub fn reference_to_path(reference: &str) -> Result<PathBuf> {
    let trimmed = reference.trim();
    if trimmed.is_empty() {
        return Err(UpscaleError::InvalidInput(
            "image reference is required".to_string(),
        ));
    }

    if trimmed.starts_with("file:") {
        let url = Url::parse(trimmed)
            .map_err(|e| UpscaleError::InvalidInput(format!("malformed URI {trimmed}: {e}")))?;
        return url
            .to_file_path()
            .map_err(|()| UpscaleError::InvalidInput(format!("not a local file URI: {trimmed}")));
    }

    Ok(PathBuf::from(trimmed))
}

/// Read EXIF Orientation (tag 0x0112). Missing or unreadable metadata is 1.
pub fn read_exif_orientation(bytes: &[u8]) -> u32 {
    let mut cursor = Cursor::new(bytes);
    let Ok(exif) = exif::Reader::new().read_from_container(&mut cursor) else {
        return 1;
    };
    exif.get_field(exif::Tag::Orientation, exif::In::PRIMARY)
        .and_then(|field| field.value.get_uint(0))
        .unwrap_or(1)
}

pub fn apply_orientation(img: DynamicImage, orientation: u32) -> DynamicImage {
    match orientation {
        2 => img.fliph(),
        3 => img.rotate180(),
        4 => img.flipv(),
        5 => img.rotate90().fliph(),
        6 => img.rotate90(),
        7 => img.rotate270().fliph(),
        8 => img.rotate270(),
        _ => img,
    }
}

fn output_file_name() -> String {
    let stamp = Utc::now().format("%Y%m%d_%H%M%S_%3f");
    let short = Uuid::new_v4().simple().to_string();
    format!("enhanced_{stamp}_{}.png", &short[..8])
}

impl ImageCodec for FsImageCodec {
    fn validate_reference(&self, reference: &str) -> Result<()> {
        let path = reference_to_path(reference)?;
        if !path.is_file() {
            return Err(UpscaleError::InvalidInput(format!(
                "image not found: {}",
                path.display()
            )));
        }
        Ok(())
    }

    fn decode(&self, reference: &str) -> Result<ImageBuffer> {
        let decode_failure = |reason: String| UpscaleError::DecodeFailure {
            reference: reference.to_string(),
            reason,
        };

        let path = reference_to_path(reference)?;
        let bytes = std::fs::read(&path).map_err(|e| decode_failure(e.to_string()))?;
        let img = image::load_from_memory(&bytes).map_err(|e| decode_failure(e.to_string()))?;

        let orientation = read_exif_orientation(&bytes);
        let rgb = apply_orientation(img, orientation).to_rgb8();
        let (width, height) = rgb.dimensions();
        if width == 0 || height == 0 {
            return Err(decode_failure("image has no pixels".to_string()));
        }
        debug!(
            path = %path.display(),
            width,
            height,
            orientation,
            "Decoded source image"
        );
        ImageBuffer::from_rgb8(width, height, rgb.as_raw())
    }

    fn encode(&self, canvas: &RgbCanvas, crop_width: u32, crop_height: u32) -> Result<String> {
        let cropped = crop(canvas, crop_width, crop_height);
        let (width, height) = (cropped.width(), cropped.height());
        let img = RgbImage::from_raw(width, height, cropped.into_raw()).ok_or_else(|| {
            UpscaleError::EncodeFailure(format!("canvas does not hold {width}x{height} pixels"))
        })?;

        std::fs::create_dir_all(&self.output_dir).map_err(|e| {
            UpscaleError::EncodeFailure(format!(
                "creating {}: {e}",
                self.output_dir.display()
            ))
        })?;
        let dir = std::fs::canonicalize(&self.output_dir).map_err(|e| {
            UpscaleError::EncodeFailure(format!(
                "resolving {}: {e}",
                self.output_dir.display()
            ))
        })?;
        let path = dir.join(output_file_name());

        img.save_with_format(&path, ImageFormat::Png)
            .map_err(|e| UpscaleError::EncodeFailure(format!("{}: {e}", path.display())))?;

        let uri = Url::from_file_path(&path).map_err(|()| {
            UpscaleError::EncodeFailure(format!("cannot express {} as a URI", path.display()))
        })?;
        debug!(path = %path.display(), width, height, "Wrote output image");
        Ok(uri.to_string())
    }
}

//! Decode, scale and re-encode one thumbnail.
//!
//! Everything here is CPU bound and synchronous; callers run it on the
//! blocking thread pool.

use std::fmt;
use std::io::Cursor;

use bytes::Bytes;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView, ImageFormat};
use tracing::debug;

use crate::naming::ImageKind;

use super::ThumbnailError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Dimensions {
    pub width: u32,
    pub height: u32,
}

impl Dimensions {
    pub fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }
}

impl fmt::Display for Dimensions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}x{}", self.width, self.height)
    }
}

/// Result of rendering a thumbnail
#[derive(Debug)]
pub struct Thumbnail {
    pub data: Bytes,
    pub native: Dimensions,
    pub dimensions: Dimensions,
    pub format: ImageFormat,
}

/// Output size for `requested_width`, keeping the aspect ratio.
///
/// Images narrower than the requested width are never upscaled: they keep
/// their native size. Heights are rounded half up and never drop below one.
pub fn target_dimensions(requested_width: u32, native: Dimensions) -> Dimensions {
    if native.width == 0 || requested_width > native.width {
        return native;
    }

    let numerator = 2 * requested_width as u64 * native.height as u64 + native.width as u64;
    let height = numerator / (2 * native.width as u64);

    Dimensions::new(requested_width, height.max(1) as u32)
}

/// Render the thumbnail for `requested_width` from the original image bytes.
///
/// The output is encoded as `kind`; when the key carried no usable type the
/// format of the source bytes is kept.
pub fn render_thumbnail(
    source: &[u8],
    requested_width: u32,
    kind: &ImageKind,
) -> Result<Thumbnail, ThumbnailError> {
    let source_format = image::guess_format(source)
        .map_err(|e| ThumbnailError::Decode(format!("unknown image format: {}", e)))?;

    let img = image::load_from_memory_with_format(source, source_format)
        .map_err(|e| ThumbnailError::Decode(format!("failed to decode image: {}", e)))?;

    let (width, height) = img.dimensions();
    let native = Dimensions::new(width, height);
    if width == 0 || height == 0 {
        return Err(ThumbnailError::Resize(format!(
            "cannot scale an image of size {}",
            native
        )));
    }

    let dimensions = target_dimensions(requested_width, native);

    debug!(
        requested_width = requested_width,
        native = %native,
        target = %dimensions,
        "Computed thumbnail dimensions"
    );

    let resized = if dimensions == native {
        img
    } else {
        img.resize_exact(dimensions.width, dimensions.height, FilterType::Lanczos3)
    };

    let format = kind.image_format().unwrap_or(source_format);
    let data = encode(resized, format)?;

    Ok(Thumbnail {
        data,
        native,
        dimensions,
        format,
    })
}

fn encode(img: DynamicImage, format: ImageFormat) -> Result<Bytes, ThumbnailError> {
    // Only PNG and TIFF take every color type; JPEG has no alpha channel
    let img = match format {
        ImageFormat::Png | ImageFormat::Tiff => img,
        ImageFormat::Jpeg => DynamicImage::ImageRgb8(img.into_rgb8()),
        _ => DynamicImage::ImageRgba8(img.into_rgba8()),
    };

    let mut buf = Cursor::new(Vec::new());
    img.write_to(&mut buf, format)
        .map_err(|e| ThumbnailError::Encode(format!("failed to encode {:?}: {}", format, e)))?;

    Ok(Bytes::from(buf.into_inner()))
}

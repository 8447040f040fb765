//! Naming conventions for uploaded images.
//!
//! Uploaders embed the image MIME type near the end of the object key, e.g.
//! `uploads/2024/photo_image_jpeg_0`. Everything the pipeline needs to know
//! about the output (where to write it, which content type and which encoder
//! to use) is derived from the key alone.

use image::ImageFormat;
use percent_encoding::percent_decode_str;

/// Marker that precedes the image subtype in an object key
const TYPE_MARKER: &str = "image_";

/// Content type used when the key does not carry a recognizable image type
pub const FALLBACK_CONTENT_TYPE: &str = "application/octet-stream";

/// Image type encoded in an object key
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageKind {
    Jpeg,
    Png,
    Bmp,
    Gif,
    WebP,
    Tiff,
    /// A subtype we have no canonical mapping for, kept verbatim
    Other(String),
    /// No `image_` marker, or nothing after it
    Unrecognized,
}

impl ImageKind {
    /// Parse the subtype token that follows the `image_` marker.
    ///
    /// The bmp check runs first since uploaders send aliases such as
    /// `x-ms-bmp`.
    pub fn from_subtype(subtype: &str) -> Self {
        let lower = subtype.to_ascii_lowercase();
        if lower.is_empty() {
            ImageKind::Unrecognized
        } else if lower.contains("bmp") {
            ImageKind::Bmp
        } else if lower.contains("png") {
            ImageKind::Png
        } else {
            match lower.as_str() {
                "jpeg" | "jpg" | "pjpeg" => ImageKind::Jpeg,
                "gif" => ImageKind::Gif,
                "webp" => ImageKind::WebP,
                "tiff" | "tif" => ImageKind::Tiff,
                _ => ImageKind::Other(subtype.to_string()),
            }
        }
    }

    pub fn content_type(&self) -> String {
        match self {
            ImageKind::Jpeg => "image/jpeg".to_string(),
            ImageKind::Png => "image/png".to_string(),
            ImageKind::Bmp => "image/bmp".to_string(),
            ImageKind::Gif => "image/gif".to_string(),
            ImageKind::WebP => "image/webp".to_string(),
            ImageKind::Tiff => "image/tiff".to_string(),
            ImageKind::Other(subtype) => format!("image/{}", subtype),
            ImageKind::Unrecognized => FALLBACK_CONTENT_TYPE.to_string(),
        }
    }

    /// Output encoder for this kind. `None` means the encoder should reuse
    /// whatever format the source bytes were in.
    pub fn image_format(&self) -> Option<ImageFormat> {
        match self {
            ImageKind::Jpeg => Some(ImageFormat::Jpeg),
            ImageKind::Png => Some(ImageFormat::Png),
            ImageKind::Bmp => Some(ImageFormat::Bmp),
            ImageKind::Gif => Some(ImageFormat::Gif),
            ImageKind::WebP => Some(ImageFormat::WebP),
            ImageKind::Tiff => Some(ImageFormat::Tiff),
            ImageKind::Other(subtype) => ImageFormat::from_extension(subtype),
            ImageKind::Unrecognized => None,
        }
    }
}

/// Names and types derived from a decoded source key
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DerivedNaming {
    pub file_name: String,
    pub key_prefix: String,
    pub image_kind: ImageKind,
}

impl DerivedNaming {
    pub fn resolve(key: &str) -> Self {
        let (key_prefix, file_name) = match key.rfind('/') {
            Some(idx) => (&key[..=idx], &key[idx + 1..]),
            None => ("", key),
        };

        Self {
            file_name: file_name.to_string(),
            key_prefix: key_prefix.to_string(),
            image_kind: ImageKind::from_subtype(type_token(file_name).unwrap_or_default()),
        }
    }

    pub fn content_type(&self) -> String {
        self.image_kind.content_type()
    }

    /// Key the thumbnail for `width` is written to
    pub fn destination_key(&self, width: u32) -> String {
        format!("{}{}_{}", self.key_prefix, self.file_name, width)
    }
}

/// Decode an S3 event key: `+` is a space, the rest is percent-encoded.
pub fn decode_key(raw: &str) -> String {
    let spaced = raw.replace('+', " ");
    percent_decode_str(&spaced).decode_utf8_lossy().into_owned()
}

/// Subtype following the last `image_` marker in a file name, up to the `_N`
/// tail if present.
///
/// The subtype must be an RFC 6838 restricted name without `.`: a dot in a
/// file name starts an extension, not a subtype. A tail holding anything
/// but alphanumerics and `_` rejects the whole token.
fn type_token(file_name: &str) -> Option<&str> {
    let start = file_name.rfind(TYPE_MARKER)? + TYPE_MARKER.len();
    let rest = &file_name[start..];
    let (token, tail) = match rest.split_once('_') {
        Some((token, tail)) => (token, Some(tail)),
        None => (rest, None),
    };

    if !is_subtype_name(token) {
        return None;
    }
    if let Some(tail) = tail
        && !tail.chars().all(|c| c.is_ascii_alphanumeric() || c == '_')
    {
        return None;
    }
    Some(token)
}

fn is_subtype_name(token: &str) -> bool {
    let mut chars = token.chars();
    match chars.next() {
        Some(first) if first.is_ascii_alphanumeric() => {}
        _ => return false,
    }
    chars.all(|c| {
        c.is_ascii_alphanumeric() || matches!(c, '!' | '#' | '$' | '&' | '-' | '^' | '+')
    })
}

//! Image and payload encoding: `DynamicImage` → base64, and base64 → [`Blob`].
//!
//! Pages sent for recognition are PNG: lossless compression keeps small print
//! legible, which matters far more than payload size for field extraction.
//! Thumbnails are JPEG because they are only ever looked at by people and are
//! stored on every history record.

use base64::alphabet;
use base64::engine::general_purpose::{GeneralPurpose, GeneralPurposeConfig, STANDARD};
use base64::engine::DecodePaddingMode;
use base64::Engine as _;
use image::codecs::jpeg::JpegEncoder;
use image::DynamicImage;
use std::io::Cursor;
use tracing::{debug, warn};

pub const PDF_MIME: &str = "application/pdf";
pub const PNG_MIME: &str = "image/png";
pub const JPEG_MIME: &str = "image/jpeg";

/// Encode a rasterised page as a bare base64 PNG (no `data:` prefix).
pub fn encode_png(img: &DynamicImage) -> Result<String, image::ImageError> {
    let mut buf = Vec::new();
    img.write_to(&mut Cursor::new(&mut buf), image::ImageFormat::Png)?;

    let b64 = STANDARD.encode(&buf);
    debug!("Encoded page → {} bytes base64", b64.len());
    Ok(b64)
}

/// Encode an image as a bare base64 JPEG at the given quality (1-100).
///
/// JPEG has no alpha channel, so the image is flattened to RGB first.
pub fn encode_jpeg(img: &DynamicImage, quality: u8) -> Result<String, image::ImageError> {
    let rgb = img.to_rgb8();
    let mut buf = Vec::new();
    JpegEncoder::new_with_quality(&mut buf, quality.clamp(1, 100)).encode_image(&rgb)?;
    Ok(STANDARD.encode(&buf))
}

pub fn encode_base64(bytes: &[u8]) -> String {
    STANDARD.encode(bytes)
}

/// `data:<mime>;base64,<payload>`
pub fn to_data_url(mime: &str, b64: &str) -> String {
    format!("data:{mime};base64,{b64}")
}

/// A decoded binary payload with its content type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Blob {
    pub content_type: String,
    pub bytes: Vec<u8>,
}

impl Blob {
    fn empty_pdf() -> Self {
        Self {
            content_type: PDF_MIME.to_string(),
            bytes: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Standard alphabet, padding optional on decode.
const LENIENT: GeneralPurpose = GeneralPurpose::new(
    &alphabet::STANDARD,
    GeneralPurposeConfig::new().with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

/// Decode a stored document payload, bare base64 or a `data:` URL.
///
/// A bare payload is assumed to be a PDF. Undecodable input yields an empty
/// PDF blob; this function never fails, so callers that need the bytes must
/// check [`Blob::is_empty`].
pub fn blob_from_base64(input: &str) -> Blob {
    let input = input.trim();
    let (content_type, payload) = match input.split_once(";base64,") {
        Some((header, payload)) => {
            let content_type = header
                .split_once(':')
                .map(|(_, mime)| mime.trim())
                .filter(|mime| !mime.is_empty())
                .unwrap_or(PDF_MIME);
            (content_type.to_string(), payload)
        }
        None => (PDF_MIME.to_string(), input),
    };

    let cleaned: String = payload.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    match LENIENT.decode(cleaned.as_bytes()) {
        Ok(bytes) => Blob {
            content_type,
            bytes,
        },
        Err(e) => {
            warn!("Could not decode base64 payload: {e}");
            Blob::empty_pdf()
        }
    }
}

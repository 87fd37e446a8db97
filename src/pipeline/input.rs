//! Input resolution: turn a local file or raw bytes into a [`SourceDocument`].
//!
//! The document kind is decided from magic bytes, not from the file name:
//! `%PDF` means a PDF rendered through pdfium; PNG and JPEG payloads are
//! treated as single-page documents. Anything else is rejected up front with
//! [`ScanError::DocumentLoad`] so callers get a meaningful error rather than
//! a pdfium failure deep inside the render stage.

use crate::error::ScanError;
use crate::pipeline::encode::{self, Blob};
use image::ImageFormat;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

/// What a [`SourceDocument`] contains.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    /// Multi-page PDF, rendered through pdfium.
    Pdf,
    /// A single raster image.
    Image(ImageFormat),
}

impl DocumentKind {
    /// MIME type of the raw payload.
    pub fn mime_type(&self) -> &'static str {
        match self {
            DocumentKind::Pdf => encode::PDF_MIME,
            DocumentKind::Image(format) => format.to_mime_type(),
        }
    }
}

/// Classify a payload by its leading bytes.
///
/// Only image formats with an enabled decoder (PNG, JPEG) are accepted.
pub fn detect_kind(bytes: &[u8]) -> Result<DocumentKind, ScanError> {
    if bytes.is_empty() {
        return Err(ScanError::DocumentLoad {
            detail: "document is empty".into(),
        });
    }
    if bytes.starts_with(b"%PDF") {
        return Ok(DocumentKind::Pdf);
    }
    match image::guess_format(bytes) {
        Ok(format @ (ImageFormat::Png | ImageFormat::Jpeg)) => Ok(DocumentKind::Image(format)),
        Ok(other) => Err(ScanError::DocumentLoad {
            detail: format!("unsupported image format {other:?} (expected PDF, PNG or JPEG)"),
        }),
        Err(_) => {
            let magic: Vec<u8> = bytes.iter().take(4).copied().collect();
            Err(ScanError::DocumentLoad {
                detail: format!("not a PDF or supported image; first bytes: {magic:?}"),
            })
        }
    }
}

/// A loaded source file: raw bytes plus their detected kind.
///
/// Cloning is cheap (the bytes are shared).
#[derive(Clone)]
pub struct SourceDocument {
    bytes: Arc<[u8]>,
    kind: DocumentKind,
    name: Option<String>,
}

impl fmt::Debug for SourceDocument {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceDocument")
            .field("kind", &self.kind)
            .field("name", &self.name)
            .field("len", &self.bytes.len())
            .finish()
    }
}

impl SourceDocument {
    /// Wrap raw bytes, validating that they look like a PDF or image.
    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Result<Self, ScanError> {
        let bytes: Vec<u8> = bytes.into();
        let kind = detect_kind(&bytes)?;
        Ok(Self {
            bytes: Arc::from(bytes),
            kind,
            name: None,
        })
    }

    /// Rebuild a document from a decoded base64 payload.
    pub fn from_blob(blob: Blob) -> Result<Self, ScanError> {
        Self::from_bytes(blob.bytes)
    }

    /// Read a local file.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let bytes = tokio::fs::read(path).await.map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => ScanError::FileNotFound {
                path: path.to_path_buf(),
            },
            std::io::ErrorKind::PermissionDenied => ScanError::PermissionDenied {
                path: path.to_path_buf(),
            },
            _ => ScanError::DocumentLoad {
                detail: format!("failed to read '{}': {e}", path.display()),
            },
        })?;

        let doc = Self::from_bytes(bytes)?.with_name(file_name(path));
        debug!(
            "Loaded {} ({:?}, {} bytes)",
            path.display(),
            doc.kind,
            doc.bytes.len()
        );
        Ok(doc)
    }

    /// Attach the original file name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub(crate) fn shared_bytes(&self) -> Arc<[u8]> {
        Arc::clone(&self.bytes)
    }

    pub fn kind(&self) -> DocumentKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Base64 payload as persisted in `pdf_data`.
    pub fn to_base64(&self) -> String {
        encode::encode_base64(&self.bytes)
    }
}

fn file_name(path: &Path) -> String {
    path.file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| PathBuf::from(path).display().to_string())
}

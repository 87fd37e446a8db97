//! Page rasterisation: render one page of a document to an image.
//!
//! ## Why spawn_blocking?
//!
//! The `pdfium-render` crate wraps the pdfium C++ library, which uses
//! thread-local state internally and is not safe to call from async contexts.
//! `tokio::task::spawn_blocking` moves the work (render *and* encode, both
//! CPU-heavy) onto the blocking pool so Tokio worker threads never stall.
//!
//! ## Why cap pixels as well as scale?
//!
//! Pages are rendered at a scale factor relative to their natural size
//! (2.0 for extraction, 0.2 for thumbnails). An A0 poster at 2× would still
//! produce an enormous bitmap, so `max_rendered_pixels` bounds the longest
//! edge regardless of physical size.
//!
//! Every call opens the document afresh; nothing is cached between calls.
//! Image documents (PNG/JPEG) have exactly one page and are resized with the
//! same scale semantics.

use crate::config::ExtractionConfig;
use crate::error::ScanError;
use crate::pipeline::encode;
use crate::pipeline::input::{DocumentKind, SourceDocument};
use image::imageops::FilterType;
use image::DynamicImage;
use pdfium_render::prelude::*;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

/// Output encoding of a rendered page.
#[derive(Debug, Clone, Copy)]
enum Output {
    Png,
    Jpeg { quality: u8 },
}

/// Renders pages of a [`SourceDocument`] to base64 images.
#[derive(Debug, Clone)]
pub struct PageRasterizer {
    pdfium_lib_path: Option<PathBuf>,
    max_rendered_pixels: u32,
}

impl Default for PageRasterizer {
    fn default() -> Self {
        Self {
            pdfium_lib_path: None,
            max_rendered_pixels: crate::config::DEFAULT_MAX_RENDERED_PIXELS,
        }
    }
}

impl PageRasterizer {
    pub fn new(config: &ExtractionConfig) -> Self {
        Self {
            pdfium_lib_path: config.pdfium_lib_path.clone(),
            max_rendered_pixels: config.max_rendered_pixels,
        }
    }

    /// Number of pages in the document (always 1 for images).
    pub async fn page_count(&self, doc: &SourceDocument) -> Result<usize, ScanError> {
        let bytes = doc.shared_bytes();
        let kind = doc.kind();
        let lib_path = self.pdfium_lib_path.clone();

        tokio::task::spawn_blocking(move || match kind {
            DocumentKind::Pdf => {
                let pdfium = bind_pdfium(lib_path.as_deref())?;
                let document = load_pdf(&pdfium, &bytes)?;
                let total = document.pages().len() as usize;
                Ok(total)
            }
            DocumentKind::Image(_) => Ok(1),
        })
        .await
        .map_err(|e| ScanError::Internal(format!("Page count task panicked: {}", e)))?
    }

    /// Render `page` (1-based) at `scale` and return it as bare base64 PNG.
    pub async fn rasterize(
        &self,
        doc: &SourceDocument,
        page: usize,
        scale: f32,
    ) -> Result<String, ScanError> {
        self.render_encoded(doc, page, scale, Output::Png).await
    }

    /// Render a small JPEG preview of `page` as a `data:` URL.
    ///
    /// Failures are logged and reported as `None`; a missing thumbnail never
    /// blocks an upload.
    pub async fn thumbnail(
        &self,
        doc: &SourceDocument,
        page: usize,
        scale: f32,
        quality: u8,
    ) -> Option<String> {
        match self
            .render_encoded(doc, page, scale, Output::Jpeg { quality })
            .await
        {
            Ok(b64) => Some(encode::to_data_url(encode::JPEG_MIME, &b64)),
            Err(e) => {
                warn!("Thumbnail generation failed: {e}");
                None
            }
        }
    }

    async fn render_encoded(
        &self,
        doc: &SourceDocument,
        page: usize,
        scale: f32,
        output: Output,
    ) -> Result<String, ScanError> {
        if !(scale.is_finite() && scale > 0.0) {
            return Err(ScanError::Render {
                page,
                detail: format!("invalid scale factor {scale}"),
            });
        }

        let bytes: Arc<[u8]> = doc.shared_bytes();
        let kind = doc.kind();
        let lib_path = self.pdfium_lib_path.clone();
        let max_pixels = self.max_rendered_pixels;

        tokio::task::spawn_blocking(move || {
            let image = match kind {
                DocumentKind::Pdf => {
                    render_pdf_page(&bytes, lib_path.as_deref(), page, scale, max_pixels)?
                }
                DocumentKind::Image(format) => {
                    render_image_page(&bytes, format, page, scale, max_pixels)?
                }
            };

            let encoded = match output {
                Output::Png => encode::encode_png(&image),
                Output::Jpeg { quality } => encode::encode_jpeg(&image, quality),
            };
            encoded.map_err(|e| ScanError::Render {
                page,
                detail: format!("encoding failed: {e}"),
            })
        })
        .await
        .map_err(|e| ScanError::Internal(format!("Render task panicked: {}", e)))?
    }
}

/// Bind to a pdfium library.
///
/// Lookup order: `lib_path` when given (a library file or the directory
/// containing it), otherwise the working directory, then the system library
/// search path.
pub fn bind_pdfium(lib_path: Option<&Path>) -> Result<Pdfium, ScanError> {
    let bindings = match lib_path {
        Some(path) if path.is_dir() => {
            Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path(path))
        }
        Some(path) => Pdfium::bind_to_library(path),
        None => Pdfium::bind_to_library(Pdfium::pdfium_platform_library_name_at_path("./"))
            .or_else(|_| Pdfium::bind_to_system_library()),
    }
    .map_err(|e| ScanError::PdfiumBindingFailed(format!("{:?}", e)))?;

    Ok(Pdfium::new(bindings))
}

fn load_pdf<'a>(pdfium: &'a Pdfium, bytes: &'a [u8]) -> Result<PdfDocument<'a>, ScanError> {
    pdfium
        .load_pdf_from_byte_slice(bytes, None)
        .map_err(|e| ScanError::DocumentLoad {
            detail: format!("{:?}", e),
        })
}

fn out_of_range(page: usize, total: usize) -> ScanError {
    let noun = if total == 1 { "page" } else { "pages" };
    ScanError::Render {
        page,
        detail: format!("page out of range (document has {total} {noun})"),
    }
}

fn render_pdf_page(
    bytes: &[u8],
    lib_path: Option<&Path>,
    page: usize,
    scale: f32,
    max_pixels: u32,
) -> Result<DynamicImage, ScanError> {
    let pdfium = bind_pdfium(lib_path)?;
    let document = load_pdf(&pdfium, bytes)?;

    let pages = document.pages();
    let total_pages = pages.len() as usize;
    if page == 0 || page > total_pages {
        return Err(out_of_range(page, total_pages));
    }

    let max_side = i32::try_from(max_pixels).unwrap_or(i32::MAX);
    let render_config = PdfRenderConfig::new()
        .scale_page_by_factor(scale)
        .set_maximum_width(max_side)
        .set_maximum_height(max_side);

    let pdf_page = pages
        .get((page - 1) as u16)
        .map_err(|e| ScanError::Render {
            page,
            detail: format!("{:?}", e),
        })?;

    let bitmap = pdf_page
        .render_with_config(&render_config)
        .map_err(|e| ScanError::Render {
            page,
            detail: format!("{:?}", e),
        })?;

    let image = bitmap.as_image();
    debug!(
        "Rendered page {} → {}x{} px",
        page,
        image.width(),
        image.height()
    );
    Ok(image)
}

fn render_image_page(
    bytes: &[u8],
    format: image::ImageFormat,
    page: usize,
    scale: f32,
    max_pixels: u32,
) -> Result<DynamicImage, ScanError> {
    if page != 1 {
        return Err(out_of_range(page, 1));
    }

    let image = image::load_from_memory_with_format(bytes, format).map_err(|e| {
        ScanError::DocumentLoad {
            detail: e.to_string(),
        }
    })?;

    let (width, height) = scaled_dimensions(image.width(), image.height(), scale, max_pixels);
    if (width, height) == (image.width(), image.height()) {
        return Ok(image);
    }

    debug!(
        "Resized image {}x{} → {}x{} px",
        image.width(),
        image.height(),
        width,
        height
    );
    Ok(image.resize_exact(width, height, FilterType::Triangle))
}

/// Apply `scale`, then shrink so the longest edge fits `max_pixels`.
/// Each edge stays at least one pixel.
fn scaled_dimensions(width: u32, height: u32, scale: f32, max_pixels: u32) -> (u32, u32) {
    let mut w = width as f32 * scale;
    let mut h = height as f32 * scale;

    let longest = w.max(h);
    if max_pixels > 0 && longest > max_pixels as f32 {
        let shrink = max_pixels as f32 / longest;
        w *= shrink;
        h *= shrink;
    }

    ((w.round() as u32).max(1), (h.round() as u32).max(1))
}

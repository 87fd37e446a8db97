//! Error types for the fieldscan library.
//!
//! Every fallible operation returns [`ScanError`]. The variants fall into two
//! groups that callers treat differently:
//!
//! * **Pipeline errors**: the document could not be loaded or rendered, or the
//!   recognition service could not be reached. During an extraction these are
//!   recorded on the history record (state `failed`) and reported in the
//!   returned [`crate::orchestrator::ExtractionOutcome`]; they do not abort the
//!   call.
//!
//! * **Storage errors**: the history database could not be opened, a query
//!   failed, or the referenced record does not exist. Nothing can be recorded
//!   when the store itself is the problem, so these always propagate as `Err`.
//!
//! [`ScanError::is_storage`] draws the line between the two.
//!
//! Two outcomes are deliberately *not* errors: a recognition reply that
//! contains no parseable JSON (an empty field map) and a thumbnail that could
//! not be rendered (`None`).

use std::path::PathBuf;
use thiserror::Error;

/// All errors returned by the fieldscan library.
#[derive(Debug, Error)]
pub enum ScanError {
    // ── Input errors ──────────────────────────────────────────────────────
    /// Input file was not found at the given path.
    #[error("Document not found: '{path}'\nCheck the path exists and is readable.")]
    FileNotFound { path: PathBuf },

    /// Process does not have read permission on the file.
    #[error("Permission denied reading '{path}'\nTry: chmod +r {path:?}")]
    PermissionDenied { path: PathBuf },

    /// The source bytes are not a parseable PDF or image.
    #[error("Document could not be loaded: {detail}")]
    DocumentLoad { detail: String },

    // ── Rendering errors ──────────────────────────────────────────────────
    /// A page could not be rasterised (out of range, corrupt stream, bad scale).
    #[error("Rendering failed for page {page}: {detail}")]
    Render { page: usize, detail: String },

    /// Could not bind to a pdfium library.
    #[error(
        "Failed to bind to pdfium library: {0}\n\n\
Set PDFIUM_LIB_PATH=/path/to/dir/containing/libpdfium, place the library \
next to the binary, or install it system-wide.\n"
    )]
    PdfiumBindingFailed(String),

    // ── Recognition errors ────────────────────────────────────────────────
    /// An extraction was requested with an empty field list.
    #[error("No fields requested: at least one field name is required")]
    NoFieldsRequested,

    /// The recognition endpoint was unreachable, returned a non-success
    /// status, or answered with something other than a chat completion.
    #[error("Recognition service error from '{endpoint}': {detail}")]
    RecognitionService { endpoint: String, detail: String },

    /// The recognition endpoint rejected the credential (401/403).
    #[error("Authentication error from '{endpoint}': {detail}\nCheck OPENAI_API_KEY.")]
    RecognitionAuth { endpoint: String, detail: String },

    /// A named LLM provider could not be initialised.
    #[error("LLM provider '{provider}' is not configured.\n{hint}")]
    ProviderNotConfigured { provider: String, hint: String },

    // ── Storage errors ────────────────────────────────────────────────────
    /// The history database could not be opened or initialised.
    #[error("History store unavailable at '{location}': {detail}")]
    StoreUnavailable { location: String, detail: String },

    /// A query against an open history database failed.
    #[error("History store error: {0}")]
    Store(#[from] rusqlite::Error),

    /// The referenced record does not exist.
    #[error("Record with ID {id} not found")]
    NotFound { id: i64 },

    /// A stored record could not be decoded.
    #[error("Record {id} is corrupt: {detail}")]
    CorruptRecord { id: i64, detail: String },

    // ── Config errors ─────────────────────────────────────────────────────
    /// Builder validation failed.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // ── Catch-all ─────────────────────────────────────────────────────────
    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl ScanError {
    /// `true` for errors raised by the history store.
    ///
    /// The orchestrator propagates these instead of marking the record
    /// `failed`, because the record itself cannot be written.
    pub fn is_storage(&self) -> bool {
        matches!(
            self,
            ScanError::StoreUnavailable { .. }
                | ScanError::Store(_)
                | ScanError::NotFound { .. }
                | ScanError::CorruptRecord { .. }
        )
    }

    /// `true` for transport-level failures of the recognition call.
    pub fn is_recognition(&self) -> bool {
        matches!(
            self,
            ScanError::RecognitionService { .. }
                | ScanError::RecognitionAuth { .. }
                | ScanError::ProviderNotConfigured { .. }
        )
    }
}

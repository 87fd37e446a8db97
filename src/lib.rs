//! # fieldscan
//!
//! Extract named fields from scanned documents (PDF or image) with a Vision
//! Language Model, and keep every upload in an editable local history.
//!
//! ## Why this crate?
//!
//! Forms, invoices and property listings carry the same dozen facts in a
//! different layout every time. Template-based OCR breaks on each new layout;
//! a VLM reading the page image does not. This crate renders a page, asks the
//! model for exactly the fields you name, and stores the result alongside the
//! source file so it can be reviewed, corrected or re-extracted later.
//!
//! ## Pipeline Overview
//!
//! ```text
//! PDF / PNG / JPEG
//!  │
//!  ├─ 1. Input      read bytes, detect kind by magic number
//!  ├─ 2. Store      record created in state `uploaded` (source + thumbnail)
//!  ├─ 3. Render     rasterise the selected pages via pdfium (spawn_blocking)
//!  ├─ 4. Recognise  page PNG + field list → VLM → JSON reply
//!  ├─ 5. Parse      lenient JSON recovery → field map
//!  └─ 6. Reconcile  merge into the record → `completed` (or `failed`)
//! ```
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use fieldscan::{ExtractionConfig, ExtractionOrchestrator, ExtractionRequest, SourceDocument};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     // OPENAI_API_KEY, FIELDSCAN_MODEL, FIELDSCAN_DB, … from the environment
//!     let config = ExtractionConfig::from_env()?;
//!     let store = config.open_store()?;
//!     let orchestrator = ExtractionOrchestrator::new(config, store)?;
//!
//!     let document = SourceDocument::open("invoice.pdf").await?;
//!     let outcome = orchestrator
//!         .extract_upload(ExtractionRequest::new(document, ["invoice number", "total"]))
//!         .await?;
//!     println!("record {} → {:?}", outcome.id, outcome.fields);
//!     Ok(())
//! }
//! ```
//!
//! ## Feature Flags
//!
//! | Feature | Default | Description |
//! |---------|---------|-------------|
//! | `cli`   | on      | Enables the `fieldscan` binary (clap + anyhow + tracing-subscriber + indicatif) |
//!
//! Disable `cli` when using only the library:
//! ```toml
//! fieldscan = { version = "0.1", default-features = false }
//! ```

// ── Modules ──────────────────────────────────────────────────────────────

pub mod config;
pub mod error;
pub mod orchestrator;
pub mod pipeline;
pub mod progress;
pub mod prompts;
pub mod record;
pub mod store;

// ── Re-exports ───────────────────────────────────────────────────────────

pub use config::{ExtractionConfig, ExtractionConfigBuilder, PageSelection};
pub use error::ScanError;
pub use orchestrator::{ExtractionOrchestrator, ExtractionOutcome, ExtractionRequest};
pub use pipeline::encode::{blob_from_base64, Blob};
pub use pipeline::extract::{parse_reply, FieldExtractor};
pub use pipeline::input::{DocumentKind, SourceDocument};
pub use pipeline::recognize::{
    resolve_recognizer, HttpRecognizer, ProviderRecognizer, RecognitionRequest, Recognizer,
};
pub use pipeline::render::PageRasterizer;
pub use progress::{ExtractionProgressCallback, NoopProgressCallback, ProgressCallback};
pub use record::{
    reconcile_fields, Attributes, ExtractionRecord, ExtractionState, FieldMap, NewRecord,
    RecordId, RecordPatch,
};
pub use store::{HistoryStore, StoreLocation};

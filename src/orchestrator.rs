//! Extraction orchestration: drive a history record through its lifecycle.
//!
//! ```text
//! uploaded ──▶ processing ──▶ completed
//!                  ▲      └──▶ failed
//!                  └── re-extract ──┘ (from completed or failed)
//! ```
//!
//! An upload is stored before any rendering happens, so the record exists
//! (and shows up in listings) even if every later step fails. Each selected
//! page is then rendered, sent for recognition and reconciled into the
//! record's field map, strictly one page after another.
//!
//! ## Which errors abort?
//!
//! Pipeline errors (unloadable document, render failure, recognition
//! transport failure) are *recorded*: the record goes to `failed`, its
//! `error` attribute carries the message, its fields are left untouched and
//! the call returns `Ok` with a failed [`ExtractionOutcome`]. Storage errors
//! cannot be recorded and are returned as `Err`.

use crate::config::{ExtractionConfig, PageSelection};
use crate::error::ScanError;
use crate::pipeline::encode;
use crate::pipeline::extract::FieldExtractor;
use crate::pipeline::input::SourceDocument;
use crate::pipeline::recognize::{resolve_recognizer, Recognizer};
use crate::pipeline::render::PageRasterizer;
use crate::record::{
    reconcile_fields, Attributes, ExtractionState, FieldMap, NewRecord, RecordId, RecordPatch,
    ERROR_ATTRIBUTE, FILE_NAME_ATTRIBUTE, REQUESTED_FIELDS_ATTRIBUTE, THUMBNAIL_ATTRIBUTE,
};
use crate::store::HistoryStore;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One upload to extract fields from.
#[derive(Debug, Clone)]
pub struct ExtractionRequest {
    pub document: SourceDocument,
    pub fields: Vec<String>,
    /// Pages to process; `None` uses the configured default.
    pub pages: Option<PageSelection>,
    /// Extra attributes stored on the new record.
    pub attributes: Attributes,
}

impl ExtractionRequest {
    pub fn new<I, S>(document: SourceDocument, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            document,
            fields: fields.into_iter().map(Into::into).collect(),
            pages: None,
            attributes: Attributes::new(),
        }
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.pages = Some(selection);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

/// Result of one extraction run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExtractionOutcome {
    pub id: RecordId,
    /// `completed` or `failed`.
    pub state: ExtractionState,
    /// The record's fields after this run.
    pub fields: FieldMap,
    /// Pages that were processed, in order.
    pub pages: Vec<usize>,
    pub error: Option<String>,
}

impl ExtractionOutcome {
    pub fn is_completed(&self) -> bool {
        self.state == ExtractionState::Completed
    }
}

/// Ties the rasterizer, the field extractor and the history store together.
#[derive(Debug, Clone)]
pub struct ExtractionOrchestrator {
    store: HistoryStore,
    rasterizer: PageRasterizer,
    extractor: FieldExtractor,
    config: ExtractionConfig,
}

impl ExtractionOrchestrator {
    /// Build an orchestrator, resolving the recognizer from `config`.
    pub fn new(config: ExtractionConfig, store: HistoryStore) -> Result<Self, ScanError> {
        let recognizer = resolve_recognizer(&config)?;
        Ok(Self::with_recognizer(config, store, recognizer))
    }

    /// Build an orchestrator around an explicit recognizer.
    pub fn with_recognizer(
        config: ExtractionConfig,
        store: HistoryStore,
        recognizer: Arc<dyn Recognizer>,
    ) -> Self {
        info!("Recognition backend: {}", recognizer.describe());
        let extractor = FieldExtractor::new(recognizer)
            .with_system_prompt(config.system_prompt.clone())
            .with_instruction(config.user_instruction.clone());
        Self {
            store,
            rasterizer: PageRasterizer::new(&config),
            extractor,
            config,
        }
    }

    pub fn store(&self) -> &HistoryStore {
        &self.store
    }

    pub fn rasterizer(&self) -> &PageRasterizer {
        &self.rasterizer
    }

    pub fn config(&self) -> &ExtractionConfig {
        &self.config
    }

    /// Store a new upload and run the extraction on it.
    pub async fn extract_upload(
        &self,
        request: ExtractionRequest,
    ) -> Result<ExtractionOutcome, ScanError> {
        let ExtractionRequest {
            document,
            fields,
            pages,
            attributes,
        } = request;

        if fields.is_empty() {
            return Err(ScanError::NoFieldsRequested);
        }

        let thumbnail = self
            .rasterizer
            .thumbnail(
                &document,
                1,
                self.config.thumbnail_scale,
                self.config.thumbnail_quality,
            )
            .await;

        let mut record = NewRecord::new(ExtractionState::Uploaded).pdf_data(document.to_base64());
        record.attributes.extend(attributes);
        record = record.attribute(REQUESTED_FIELDS_ATTRIBUTE, json!(fields));
        if let Some(name) = document.name() {
            record = record.attribute(FILE_NAME_ATTRIBUTE, name);
        }
        if let Some(thumbnail) = thumbnail {
            record = record.attribute(THUMBNAIL_ATTRIBUTE, thumbnail);
        }

        let id = self.store.create(record).await?;
        info!(
            "Stored upload {} as record {}",
            document.name().unwrap_or("<unnamed>"),
            id
        );
        if let Some(cb) = &self.config.progress_callback {
            cb.on_record_created(id);
        }

        let pages = pages.unwrap_or_else(|| self.config.pages.clone());
        let previous = Previous {
            state: ExtractionState::Uploaded,
            fields: FieldMap::new(),
            had_error: false,
        };
        self.process(id, Ok(document), &pages, &fields, previous).await
    }

    /// Run the extraction again on a stored record.
    ///
    /// The source document is rebuilt from the record's `pdf_data`. An empty
    /// `fields` slice reuses the field names of the previous request. New
    /// values are reconciled over the existing fields.
    pub async fn reextract(
        &self,
        id: RecordId,
        pages: PageSelection,
        fields: &[String],
    ) -> Result<ExtractionOutcome, ScanError> {
        let record = self.store.get(id).await?.ok_or(ScanError::NotFound { id })?;

        let fields = if fields.is_empty() {
            record.requested_fields()
        } else {
            fields.to_vec()
        };
        if fields.is_empty() {
            return Err(ScanError::NoFieldsRequested);
        }

        if record.state == ExtractionState::Processing {
            warn!("Record {} is already processing; starting another extraction", id);
        }

        let document = match record.pdf_data.as_deref() {
            Some(data) => {
                let blob = encode::blob_from_base64(data);
                let name = record.file_name().map(str::to_string);
                SourceDocument::from_blob(blob).map(|doc| match name {
                    Some(name) => doc.with_name(name),
                    None => doc,
                })
            }
            None => Err(ScanError::DocumentLoad {
                detail: format!("record {id} has no stored source document"),
            }),
        };

        let previous = Previous {
            state: record.state,
            had_error: record.error().is_some(),
            fields: record.fields_data,
        };
        self.process(id, document, &pages, &fields, previous).await
    }

    /// Replace a record's fields with user-edited values. State is unchanged.
    pub async fn edit_fields(&self, id: RecordId, fields: FieldMap) -> Result<RecordId, ScanError> {
        debug!("Editing {} field(s) on record {}", fields.len(), id);
        self.store
            .update_data(id, RecordPatch::new().fields(fields))
            .await
    }

    /// Delete a record in any state. Absent ids are not an error.
    pub async fn delete(&self, id: RecordId) -> Result<(), ScanError> {
        self.store.delete(id).await
    }

    // ── Internals ────────────────────────────────────────────────────────

    async fn process(
        &self,
        id: RecordId,
        document: Result<SourceDocument, ScanError>,
        pages: &PageSelection,
        fields: &[String],
        previous: Previous,
    ) -> Result<ExtractionOutcome, ScanError> {
        let start = Instant::now();
        self.transition(id, previous.state, ExtractionState::Processing)
            .await?;

        let result = match document {
            Ok(doc) => self.run_pages(id, &doc, pages, fields).await,
            Err(e) => Err(e),
        };

        let outcome = match result {
            Ok((extracted, processed_pages)) => {
                let mut merged = previous.fields;
                reconcile_fields(&mut merged, extracted);

                let mut patch = RecordPatch::new()
                    .state(ExtractionState::Completed)
                    .fields(merged.clone())
                    .attribute(REQUESTED_FIELDS_ATTRIBUTE, json!(fields));
                if previous.had_error {
                    patch = patch.remove_attribute(ERROR_ATTRIBUTE);
                }
                self.store.update_data(id, patch).await?;
                self.notify_state(id, ExtractionState::Processing, ExtractionState::Completed);

                info!(
                    "Record {}: extracted {} field(s) from {} page(s) in {:?}",
                    id,
                    merged.len(),
                    processed_pages.len(),
                    start.elapsed()
                );
                ExtractionOutcome {
                    id,
                    state: ExtractionState::Completed,
                    fields: merged,
                    pages: processed_pages,
                    error: None,
                }
            }
            Err(e) if e.is_storage() => return Err(e),
            Err(e) => {
                let message = e.to_string();
                warn!("Record {}: extraction failed: {}", id, message);

                let patch = RecordPatch::new()
                    .state(ExtractionState::Failed)
                    .attribute(ERROR_ATTRIBUTE, message.clone())
                    .attribute(REQUESTED_FIELDS_ATTRIBUTE, json!(fields));
                self.store.update_data(id, patch).await?;
                self.notify_state(id, ExtractionState::Processing, ExtractionState::Failed);

                ExtractionOutcome {
                    id,
                    state: ExtractionState::Failed,
                    fields: previous.fields,
                    pages: Vec::new(),
                    error: Some(message),
                }
            }
        };

        if let Some(cb) = &self.config.progress_callback {
            cb.on_extraction_complete(id, outcome.state, outcome.error.as_deref());
        }
        Ok(outcome)
    }

    /// Render and recognise each selected page, reconciling as we go.
    async fn run_pages(
        &self,
        id: RecordId,
        document: &SourceDocument,
        selection: &PageSelection,
        fields: &[String],
    ) -> Result<(FieldMap, Vec<usize>), ScanError> {
        let total_pages = self.rasterizer.page_count(document).await?;
        let pages = selection.to_pages(total_pages);
        if pages.is_empty() {
            return Err(ScanError::Render {
                page: 0,
                detail: format!(
                    "page selection '{selection}' matches no page (document has {total_pages})"
                ),
            });
        }
        debug!(
            "Record {}: {} of {} page(s) selected",
            id,
            pages.len(),
            total_pages
        );

        let mut merged = FieldMap::new();
        for &page in &pages {
            if let Some(cb) = &self.config.progress_callback {
                cb.on_page_start(id, page, pages.len());
            }

            let image = self
                .rasterizer
                .rasterize(document, page, self.config.extraction_scale)
                .await?;
            let extracted = self.extractor.extract_fields(&image, fields).await?;
            debug!("Record {}: page {} → {} field(s)", id, page, extracted.len());

            if let Some(cb) = &self.config.progress_callback {
                cb.on_page_complete(id, page, extracted.len());
            }
            reconcile_fields(&mut merged, extracted);
        }

        Ok((merged, pages))
    }

    async fn transition(
        &self,
        id: RecordId,
        from: ExtractionState,
        to: ExtractionState,
    ) -> Result<(), ScanError> {
        if !from.can_transition_to(to) {
            warn!("Record {}: unusual transition {} → {}", id, from, to);
        }
        self.store.update_state(id, to).await?;
        self.notify_state(id, from, to);
        Ok(())
    }

    fn notify_state(&self, id: RecordId, from: ExtractionState, to: ExtractionState) {
        debug!("Record {}: {} → {}", id, from, to);
        if let Some(cb) = &self.config.progress_callback {
            cb.on_state_change(id, from, to);
        }
    }
}

/// What the record looked like before this run.
struct Previous {
    state: ExtractionState,
    fields: FieldMap,
    had_error: bool,
}

//! Progress-callback trait for extraction lifecycle events.
//!
//! Inject an [`Arc<dyn ExtractionProgressCallback>`] via
//! [`crate::config::ExtractionConfigBuilder::progress_callback`] to observe a
//! record as it moves through the pipeline: created, state changes, each page
//! rendered and recognised, and the final outcome.
//!
//! # Why callbacks instead of channels?
//!
//! Callers can forward events to a terminal spinner, a channel or a UI
//! refresh without the library knowing how the host application
//! communicates. A history view that re-reads the store on every state change
//! is the typical consumer.
//!
//! # Example
//!
//! ```rust
//! use fieldscan::{ExtractionProgressCallback, ExtractionConfig, ExtractionState, RecordId};
//! use std::sync::Arc;
//!
//! struct Logger;
//!
//! impl ExtractionProgressCallback for Logger {
//!     fn on_state_change(&self, id: RecordId, from: ExtractionState, to: ExtractionState) {
//!         eprintln!("record {id}: {from} → {to}");
//!     }
//! }
//!
//! let config = ExtractionConfig::builder()
//!     .progress_callback(Arc::new(Logger) as Arc<dyn ExtractionProgressCallback>)
//!     .build()
//!     .unwrap();
//! ```

use crate::record::{ExtractionState, RecordId};
use std::sync::Arc;

/// Called by the orchestrator as an extraction progresses.
///
/// All methods have default no-op implementations so callers only override
/// what they care about. Pages are processed sequentially, so calls for one
/// record never overlap; calls for different records may.
pub trait ExtractionProgressCallback: Send + Sync {
    /// A new history record was stored in state `uploaded`.
    fn on_record_created(&self, id: RecordId) {
        let _ = id;
    }

    /// The record moved from `from` to `to`.
    fn on_state_change(&self, id: RecordId, from: ExtractionState, to: ExtractionState) {
        let _ = (id, from, to);
    }

    /// Page `page` (1-indexed) is about to be rendered and sent.
    ///
    /// `page_count` is the number of pages selected, not the document length.
    fn on_page_start(&self, id: RecordId, page: usize, page_count: usize) {
        let _ = (id, page, page_count);
    }

    /// Page `page` returned `field_count` fields.
    fn on_page_complete(&self, id: RecordId, page: usize, field_count: usize) {
        let _ = (id, page, field_count);
    }

    /// The extraction reached a terminal state (`completed` or `failed`).
    fn on_extraction_complete(&self, id: RecordId, state: ExtractionState, error: Option<&str>) {
        let _ = (id, state, error);
    }
}

/// A no-op implementation for callers that don't need progress events.
pub struct NoopProgressCallback;

impl ExtractionProgressCallback for NoopProgressCallback {}

/// Convenience alias matching the type stored in [`crate::config::ExtractionConfig`].
pub type ProgressCallback = Arc<dyn ExtractionProgressCallback>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Default)]
    struct Recorder {
        events: Mutex<Vec<String>>,
    }

    impl ExtractionProgressCallback for Recorder {
        fn on_state_change(&self, id: RecordId, from: ExtractionState, to: ExtractionState) {
            self.events.lock().unwrap().push(format!("{id}:{from}->{to}"));
        }

        fn on_extraction_complete(&self, id: RecordId, state: ExtractionState, _error: Option<&str>) {
            self.events.lock().unwrap().push(format!("{id}:done:{state}"));
        }
    }

    #[test]
    fn noop_callback_does_not_panic() {
        let cb = NoopProgressCallback;
        cb.on_record_created(1);
        cb.on_state_change(1, ExtractionState::Uploaded, ExtractionState::Processing);
        cb.on_page_start(1, 1, 3);
        cb.on_page_complete(1, 1, 4);
        cb.on_extraction_complete(1, ExtractionState::Failed, Some("timeout"));
    }

    #[test]
    fn overridden_hooks_receive_events() {
        let recorder = Recorder::default();
        recorder.on_record_created(7);
        recorder.on_state_change(7, ExtractionState::Uploaded, ExtractionState::Processing);
        recorder.on_extraction_complete(7, ExtractionState::Completed, None);

        let events = recorder.events.lock().unwrap();
        assert_eq!(
            *events,
            vec!["7:uploaded->processing".to_string(), "7:done:completed".to_string()]
        );
    }

    #[test]
    fn arc_dyn_callback_works() {
        let cb: ProgressCallback = Arc::new(NoopProgressCallback);
        cb.on_page_start(3, 1, 1);
    }
}

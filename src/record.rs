//! The extraction record: the only entity the history store persists.
//!
//! The fixed schema (`id`, `state`, `upload_date`, `pdf_data`, `fieldsData`)
//! is strongly typed; anything else a caller attaches travels in
//! [`ExtractionRecord::attributes`], an open JSON object preserved verbatim.
//!
//! Write paths go through [`NewRecord`] and [`RecordPatch`], which are
//! normalised before they reach storage: the `pdfData` alias is folded into
//! `pdf_data` and removed, and reserved names never leak into `attributes`.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Store-assigned record identifier.
pub type RecordId = i64;

/// Flat mapping from field name to extracted value.
pub type FieldMap = BTreeMap<String, String>;

/// Open-ended extension attributes carried by a record.
pub type Attributes = serde_json::Map<String, Value>;

/// Alternate spelling of `pdf_data` accepted on writes.
pub const PDF_DATA_ALIAS: &str = "pdfData";

/// Attribute holding the last extraction error message.
pub const ERROR_ATTRIBUTE: &str = "error";

/// Attribute holding the thumbnail data URL.
pub const THUMBNAIL_ATTRIBUTE: &str = "thumbnail";

/// Attribute holding the original file name.
pub const FILE_NAME_ATTRIBUTE: &str = "file_name";

/// Attribute holding the field names of the last extraction request.
pub const REQUESTED_FIELDS_ATTRIBUTE: &str = "requested_fields";

/// Names owned by the fixed schema; never stored as attributes.
const RESERVED_KEYS: &[&str] = &[
    "id",
    "state",
    "upload_date",
    "pdf_data",
    PDF_DATA_ALIAS,
    "fieldsData",
];

// ── Lifecycle state ──────────────────────────────────────────────────────

/// Lifecycle of an extraction record.
///
/// ```text
/// uploaded ──▶ processing ──▶ completed
///                  │   ▲          │
///                  ▼   └──────────┤  (user-triggered re-extraction)
///                failed ──────────┘
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExtractionState {
    /// Record created, extraction not started.
    #[default]
    Uploaded,
    /// Rasterisation or recognition in flight.
    Processing,
    /// Fields extracted and stored.
    Completed,
    /// Extraction hit a pipeline error; see the `error` attribute.
    Failed,
}

impl ExtractionState {
    pub const ALL: [ExtractionState; 4] = [
        ExtractionState::Uploaded,
        ExtractionState::Processing,
        ExtractionState::Completed,
        ExtractionState::Failed,
    ];

    /// Storage and display name.
    pub fn as_str(self) -> &'static str {
        match self {
            ExtractionState::Uploaded => "uploaded",
            ExtractionState::Processing => "processing",
            ExtractionState::Completed => "completed",
            ExtractionState::Failed => "failed",
        }
    }

    /// Whether the lifecycle allows moving from `self` to `next`.
    ///
    /// No transition skips `processing`.
    pub fn can_transition_to(self, next: ExtractionState) -> bool {
        use ExtractionState::*;
        matches!(
            (self, next),
            (Uploaded, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Completed, Processing)
                | (Failed, Processing)
        )
    }

    /// `completed` or `failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, ExtractionState::Completed | ExtractionState::Failed)
    }
}

impl fmt::Display for ExtractionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a string does not name a lifecycle state.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("unknown extraction state '{0}' (expected uploaded, processing, completed or failed)")]
pub struct ParseStateError(pub String);

impl FromStr for ExtractionState {
    type Err = ParseStateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "uploaded" => Ok(ExtractionState::Uploaded),
            "processing" => Ok(ExtractionState::Processing),
            "completed" => Ok(ExtractionState::Completed),
            "failed" => Ok(ExtractionState::Failed),
            other => Err(ParseStateError(other.to_string())),
        }
    }
}

// ── Records ──────────────────────────────────────────────────────────────

/// A persisted extraction, as returned by the history store.
///
/// Serialises with the historical field names (`fieldsData`) and flattens
/// the extension attributes into the top-level object.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtractionRecord {
    pub id: RecordId,
    pub state: ExtractionState,
    /// ISO-8601 creation timestamp; the listing sort key.
    pub upload_date: String,
    /// Base64 source document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pdf_data: Option<String>,
    #[serde(rename = "fieldsData", default)]
    pub fields_data: FieldMap,
    #[serde(flatten)]
    pub attributes: Attributes,
}

impl ExtractionRecord {
    /// Look up an extension attribute.
    pub fn attribute(&self, key: &str) -> Option<&Value> {
        self.attributes.get(key)
    }

    /// Message of the last failed extraction, if any.
    pub fn error(&self) -> Option<&str> {
        self.attribute(ERROR_ATTRIBUTE).and_then(Value::as_str)
    }

    /// Thumbnail data URL captured at upload time, if any.
    pub fn thumbnail(&self) -> Option<&str> {
        self.attribute(THUMBNAIL_ATTRIBUTE).and_then(Value::as_str)
    }

    /// Original file name, if the uploader supplied one.
    pub fn file_name(&self) -> Option<&str> {
        self.attribute(FILE_NAME_ATTRIBUTE).and_then(Value::as_str)
    }

    /// Field names the record was last extracted with; empty if unknown.
    pub fn requested_fields(&self) -> Vec<String> {
        self.attribute(REQUESTED_FIELDS_ATTRIBUTE)
            .and_then(Value::as_array)
            .map(|names| {
                names
                    .iter()
                    .filter_map(Value::as_str)
                    .map(str::to_string)
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Shallow-merge a patch onto this record.
    ///
    /// `id` and `upload_date` are never touched. Fields absent from the patch
    /// keep their current value; attributes are overwritten key by key.
    pub fn apply(&mut self, patch: RecordPatch) {
        let RecordPatch {
            state,
            pdf_data,
            fields_data,
            attributes,
            removed_attributes,
        } = patch.normalized();

        if let Some(state) = state {
            self.state = state;
        }
        if let Some(pdf_data) = pdf_data {
            self.pdf_data = Some(pdf_data);
        }
        if let Some(fields) = fields_data {
            self.fields_data = fields;
        }
        for key in &removed_attributes {
            self.attributes.remove(key);
        }
        for (key, value) in attributes {
            self.attributes.insert(key, value);
        }
    }
}

/// Input for [`crate::store::HistoryStore::create`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewRecord {
    pub state: ExtractionState,
    /// Defaults to the current time when `None`.
    pub upload_date: Option<String>,
    pub pdf_data: Option<String>,
    pub fields_data: Option<FieldMap>,
    pub attributes: Attributes,
}

impl NewRecord {
    pub fn new(state: ExtractionState) -> Self {
        Self {
            state,
            ..Default::default()
        }
    }

    pub fn upload_date(mut self, date: impl Into<String>) -> Self {
        self.upload_date = Some(date.into());
        self
    }

    pub fn pdf_data(mut self, data: impl Into<String>) -> Self {
        self.pdf_data = Some(data.into());
        self
    }

    pub fn fields(mut self, fields: FieldMap) -> Self {
        self.fields_data = Some(fields);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    /// Fold the `pdfData` alias into `pdf_data` and drop reserved attribute names.
    pub(crate) fn normalized(mut self) -> Self {
        normalize_alias(&mut self.pdf_data, &mut self.attributes);
        self
    }
}

/// Partial update for [`crate::store::HistoryStore::update_data`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordPatch {
    pub state: Option<ExtractionState>,
    pub pdf_data: Option<String>,
    pub fields_data: Option<FieldMap>,
    pub attributes: Attributes,
    /// Attribute keys to drop before `attributes` are merged.
    pub removed_attributes: Vec<String>,
}

impl RecordPatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(mut self, state: ExtractionState) -> Self {
        self.state = Some(state);
        self
    }

    pub fn pdf_data(mut self, data: impl Into<String>) -> Self {
        self.pdf_data = Some(data.into());
        self
    }

    pub fn fields(mut self, fields: FieldMap) -> Self {
        self.fields_data = Some(fields);
        self
    }

    pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn remove_attribute(mut self, key: impl Into<String>) -> Self {
        self.removed_attributes.push(key.into());
        self
    }

    pub(crate) fn normalized(mut self) -> Self {
        normalize_alias(&mut self.pdf_data, &mut self.attributes);
        self
    }
}

/// Canonical `pdf_data` wins when both spellings are supplied; the alias is
/// always removed.
fn normalize_alias(pdf_data: &mut Option<String>, attributes: &mut Attributes) {
    if let Some(alias) = attributes.remove(PDF_DATA_ALIAS) {
        if pdf_data.is_none() {
            if let Value::String(data) = alias {
                *pdf_data = Some(data);
            }
        }
    }
    for key in RESERVED_KEYS {
        attributes.remove(*key);
    }
}

/// Merge freshly extracted values into an existing field map.
///
/// A key missing from `existing` is always inserted. A key already present is
/// overwritten only when the new value is not blank, so a page on which the
/// model found nothing cannot erase what an earlier page produced.
pub fn reconcile_fields(existing: &mut FieldMap, incoming: FieldMap) {
    for (key, value) in incoming {
        match existing.get_mut(&key) {
            Some(current) => {
                if !value.trim().is_empty() {
                    *current = value;
                }
            }
            None => {
                existing.insert(key, value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn fields(pairs: &[(&str, &str)]) -> FieldMap {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn sample_record() -> ExtractionRecord {
        ExtractionRecord {
            id: 7,
            state: ExtractionState::Completed,
            upload_date: "2024-01-01T00:00:00.000Z".into(),
            pdf_data: Some("JVBERi0=".into()),
            fields_data: fields(&[("name", "Taro Yamada")]),
            attributes: Attributes::new(),
        }
    }

    #[test]
    fn state_round_trips_through_str() {
        for state in ExtractionState::ALL {
            assert_eq!(state.as_str().parse::<ExtractionState>(), Ok(state));
        }
        assert!("archived".parse::<ExtractionState>().is_err());
        assert_eq!(
            " Completed ".parse::<ExtractionState>(),
            Ok(ExtractionState::Completed)
        );
    }

    #[test]
    fn transitions_never_skip_processing() {
        use ExtractionState::*;
        assert!(Uploaded.can_transition_to(Processing));
        assert!(!Uploaded.can_transition_to(Completed));
        assert!(!Uploaded.can_transition_to(Failed));
        assert!(Processing.can_transition_to(Completed));
        assert!(Processing.can_transition_to(Failed));
        assert!(Completed.can_transition_to(Processing));
        assert!(Failed.can_transition_to(Processing));
        assert!(!Completed.can_transition_to(Failed));
        assert!(!Failed.can_transition_to(Uploaded));
    }

    #[test]
    fn alias_is_folded_into_canonical_name() {
        let rec = NewRecord::new(ExtractionState::Uploaded)
            .attribute(PDF_DATA_ALIAS, "QUJD")
            .normalized();
        assert_eq!(rec.pdf_data.as_deref(), Some("QUJD"));
        assert!(!rec.attributes.contains_key(PDF_DATA_ALIAS));
    }

    #[test]
    fn canonical_name_wins_over_alias() {
        let rec = NewRecord::new(ExtractionState::Uploaded)
            .pdf_data("canonical")
            .attribute(PDF_DATA_ALIAS, "alias")
            .normalized();
        assert_eq!(rec.pdf_data.as_deref(), Some("canonical"));
        assert!(!rec.attributes.contains_key(PDF_DATA_ALIAS));
    }

    #[test]
    fn reserved_names_are_stripped_from_attributes() {
        let patch = RecordPatch::new()
            .attribute("id", 99)
            .attribute("upload_date", "1999-01-01")
            .attribute("fieldsData", "{}")
            .attribute("note", "keep me")
            .normalized();
        assert_eq!(patch.attributes.len(), 1);
        assert_eq!(patch.attributes["note"], json!("keep me"));
    }

    #[test]
    fn apply_is_shallow_and_keeps_identity() {
        let mut rec = sample_record();
        rec.apply(
            RecordPatch::new()
                .state(ExtractionState::Processing)
                .attribute("note", "checked")
                .attribute("id", 1000),
        );
        assert_eq!(rec.id, 7);
        assert_eq!(rec.upload_date, "2024-01-01T00:00:00.000Z");
        assert_eq!(rec.state, ExtractionState::Processing);
        assert_eq!(rec.fields_data, fields(&[("name", "Taro Yamada")]));
        assert_eq!(rec.attribute("note"), Some(&json!("checked")));
    }

    #[test]
    fn apply_twice_is_idempotent() {
        let patch = RecordPatch::new()
            .fields(fields(&[("date", "2024-01-01")]))
            .attribute(PDF_DATA_ALIAS, "bmV3");
        let mut once = sample_record();
        once.apply(patch.clone());
        let mut twice = once.clone();
        twice.apply(patch);
        assert_eq!(once, twice);
        assert_eq!(once.pdf_data.as_deref(), Some("bmV3"));
    }

    #[test]
    fn reconcile_keeps_existing_values_over_blanks() {
        let mut existing = fields(&[("name", "Taro Yamada"), ("date", "")]);
        reconcile_fields(
            &mut existing,
            fields(&[("name", "  "), ("date", "2024-01-01"), ("address", "")]),
        );
        assert_eq!(
            existing,
            fields(&[
                ("address", ""),
                ("date", "2024-01-01"),
                ("name", "Taro Yamada")
            ])
        );
    }

    #[test]
    fn record_serialises_with_historical_names() {
        let mut rec = sample_record();
        rec.attributes.insert("file_name".into(), json!("deed.pdf"));
        let v = serde_json::to_value(&rec).unwrap();
        assert_eq!(v["fieldsData"]["name"], json!("Taro Yamada"));
        assert_eq!(v["state"], json!("completed"));
        assert_eq!(v["file_name"], json!("deed.pdf"));
        let back: ExtractionRecord = serde_json::from_value(v).unwrap();
        assert_eq!(back, rec);
    }

    #[test]
    fn patch_can_remove_attributes() {
        let mut rec = sample_record();
        rec.attributes.insert(ERROR_ATTRIBUTE.into(), json!("timeout"));
        rec.apply(
            RecordPatch::new()
                .state(ExtractionState::Completed)
                .remove_attribute(ERROR_ATTRIBUTE),
        );
        assert_eq!(rec.error(), None);
        assert!(!rec.attributes.contains_key(ERROR_ATTRIBUTE));
    }
}

//! Field extraction: ask the recognizer for named fields on one page image and
//! turn its reply into a [`FieldMap`].
//!
//! ## Reply parsing
//!
//! Models are told to answer with bare JSON, but replies still arrive wrapped
//! in prose ("Here is the data: {...}") or in Markdown code fences. The reply
//! is parsed in two steps:
//!
//! 1. the whole reply (trimmed) as a JSON object;
//! 2. failing that, the span from the first `{` to the last `}`.
//!
//! If neither yields an object the result is an empty map. An unusable reply
//! is a normal outcome, not an error.
//!
//! Values are normalised to strings: strings verbatim, numbers and booleans
//! as their JSON text, `null` as `""`, arrays and objects as compact JSON.
//! Keys the model was not asked for are kept.

use crate::error::ScanError;
use crate::pipeline::encode::PNG_MIME;
use crate::pipeline::recognize::{RecognitionRequest, Recognizer};
use crate::prompts::{field_extraction_prompt, DEFAULT_USER_INSTRUCTION};
use crate::record::FieldMap;
use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, warn};

/// First `{` through last `}`, across newlines.
static RE_JSON_OBJECT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)\{.*\}").unwrap());

/// Drives one recognition call per page and parses the reply.
#[derive(Clone)]
pub struct FieldExtractor {
    recognizer: Arc<dyn Recognizer>,
    system_prompt: Option<String>,
    instruction: String,
}

impl std::fmt::Debug for FieldExtractor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FieldExtractor")
            .field("recognizer", &self.recognizer.describe())
            .field("system_prompt", &self.system_prompt.as_ref().map(|_| "<custom>"))
            .field("instruction", &self.instruction)
            .finish()
    }
}

impl FieldExtractor {
    pub fn new(recognizer: Arc<dyn Recognizer>) -> Self {
        Self {
            recognizer,
            system_prompt: None,
            instruction: DEFAULT_USER_INSTRUCTION.to_string(),
        }
    }

    /// Override the system prompt template (see [`crate::prompts`]).
    pub fn with_system_prompt(mut self, template: Option<String>) -> Self {
        self.system_prompt = template;
        self
    }

    pub fn with_instruction(mut self, instruction: impl Into<String>) -> Self {
        self.instruction = instruction.into();
        self
    }

    pub fn recognizer(&self) -> &Arc<dyn Recognizer> {
        &self.recognizer
    }

    /// Extract `field_names` from a bare base64 PNG page image.
    ///
    /// Transport failures propagate; an unparseable reply gives an empty map.
    pub async fn extract_fields(
        &self,
        image_base64: &str,
        field_names: &[String],
    ) -> Result<FieldMap, ScanError> {
        if field_names.is_empty() {
            return Err(ScanError::NoFieldsRequested);
        }

        let request = RecognitionRequest {
            system_prompt: field_extraction_prompt(self.system_prompt.as_deref(), field_names),
            instruction: self.instruction.clone(),
            image_base64: image_base64.to_string(),
            image_mime: PNG_MIME.to_string(),
        };

        let reply = self.recognizer.recognize(&request).await?;
        let fields = parse_reply(&reply);

        if fields.is_empty() {
            warn!(
                "No JSON object in reply from {} ({} chars)",
                self.recognizer.describe(),
                reply.len()
            );
        } else {
            debug!("Extracted {} field(s)", fields.len());
        }
        Ok(fields)
    }
}

/// Parse a model reply into a field map. Never fails.
pub fn parse_reply(reply: &str) -> FieldMap {
    let trimmed = reply.trim().trim_start_matches('\u{FEFF}');

    if let Some(fields) = parse_object(trimmed) {
        return fields;
    }

    RE_JSON_OBJECT
        .find(trimmed)
        .and_then(|m| parse_object(m.as_str()))
        .unwrap_or_default()
}

fn parse_object(text: &str) -> Option<FieldMap> {
    match serde_json::from_str::<Value>(text) {
        Ok(Value::Object(map)) => Some(
            map.into_iter()
                .map(|(key, value)| (key, value_to_string(value)))
                .collect(),
        ),
        _ => None,
    }
}

fn value_to_string(value: Value) -> String {
    match value {
        Value::String(s) => s,
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

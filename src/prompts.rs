//! Prompts for VLM-based field extraction.
//!
//! Every prompt lives here so that changing the default wording means
//! editing exactly one place, and so unit tests can inspect the assembled
//! prompt without calling a model.
//!
//! Callers can override the system prompt via
//! [`crate::config::ExtractionConfig::system_prompt`]. An override may contain
//! the `{fields}` placeholder; if it does not, the field list is appended so
//! the model always sees every requested name.

/// Placeholder replaced by the comma-separated field names.
pub const FIELDS_PLACEHOLDER: &str = "{fields}";

/// Default system prompt template.
pub const DEFAULT_SYSTEM_PROMPT: &str = r#"You are an expert at reading scanned business documents such as invoices, contracts, property listings and forms.

Extract the following fields from the document image: {fields}

Rules:
1. Respond with a single JSON object and nothing else.
2. Use each field name exactly as given above as a JSON key.
3. Every value must be a string, copied as it appears on the page. Keep the document's original language, script and number formatting.
4. If a field does not appear on the page, omit it from the object.

Example response format: {"field name": "value", "another field": "value"}"#;

/// Text of the user turn that accompanies the page image.
pub const DEFAULT_USER_INSTRUCTION: &str = "Extract the specified fields from this document image.";

/// Build the system prompt for one page.
pub fn field_extraction_prompt(template: Option<&str>, field_names: &[String]) -> String {
    let fields = field_names.join(", ");
    let template = template.unwrap_or(DEFAULT_SYSTEM_PROMPT);

    if template.contains(FIELDS_PLACEHOLDER) {
        template.replace(FIELDS_PLACEHOLDER, &fields)
    } else {
        format!("{template}\n\nFields to extract: {fields}")
    }
}

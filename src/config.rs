//! Configuration types for field extraction.
//!
//! Everything the pipeline needs (which model to call, how to render pages,
//! where the history database lives) is controlled through
//! [`ExtractionConfig`], built via [`ExtractionConfigBuilder`] or loaded from
//! the environment with [`ExtractionConfig::from_env`].
//!
//! # Design choice: builder over constructor
//! Most callers only change the credential and perhaps the model; the builder
//! lets them set what they care about and rely on documented defaults for
//! the rest.

use crate::error::ScanError;
use crate::pipeline::recognize::Recognizer;
use crate::progress::ProgressCallback;
use crate::store::{HistoryStore, StoreLocation};
use edgequake_llm::LLMProvider;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

pub const DEFAULT_ENDPOINT: &str = "https://api.openai.com/v1/chat/completions";
pub const DEFAULT_MODEL: &str = "gpt-4.1-mini";
pub const DEFAULT_MAX_TOKENS: usize = 1000;
pub const DEFAULT_EXTRACTION_SCALE: f32 = 2.0;
pub const DEFAULT_THUMBNAIL_SCALE: f32 = 0.2;
pub const DEFAULT_THUMBNAIL_QUALITY: u8 = 80;
pub const DEFAULT_MAX_RENDERED_PIXELS: u32 = 4096;
/// Largest accepted `max_rendered_pixels` per side.
pub const MAX_RENDERED_PIXELS_LIMIT: u32 = 32_768;

// Environment variables read by `from_env`.
pub const ENV_ENDPOINT: &str = "FIELDSCAN_ENDPOINT";
pub const ENV_MODEL: &str = "FIELDSCAN_MODEL";
pub const ENV_API_KEY: &str = "OPENAI_API_KEY";
pub const ENV_PROVIDER: &str = "FIELDSCAN_PROVIDER";
pub const ENV_DATABASE: &str = "FIELDSCAN_DB";
pub const ENV_PDFIUM_LIB_PATH: &str = "PDFIUM_LIB_PATH";

/// Configuration for field extraction.
///
/// # Example
/// ```rust
/// use fieldscan::ExtractionConfig;
///
/// let config = ExtractionConfig::builder()
///     .api_key("sk-...")
///     .model("gpt-4.1-mini")
///     .extraction_scale(2.0)
///     .build()
///     .unwrap();
/// ```
#[derive(Clone)]
pub struct ExtractionConfig {
    /// Chat-completions endpoint. Default: the OpenAI endpoint.
    pub endpoint: String,

    /// Model identifier sent with every request. Default: `gpt-4.1-mini`.
    pub model: String,

    /// Bearer credential for the endpoint.
    pub api_key: Option<String>,

    /// `edgequake-llm` provider name (e.g. "anthropic", "ollama"). When set,
    /// requests go through that provider instead of the HTTP endpoint.
    pub provider_name: Option<String>,

    /// Pre-constructed `edgequake-llm` provider. Takes precedence over
    /// `provider_name`.
    pub provider: Option<Arc<dyn LLMProvider>>,

    /// Pre-constructed recognizer. Takes precedence over everything else.
    pub recognizer: Option<Arc<dyn Recognizer>>,

    /// Maximum tokens the model may generate per page. Default: 1000.
    ///
    /// A JSON object of a dozen short fields needs a few hundred tokens;
    /// 1000 leaves room for long addresses and free-text remarks.
    pub max_tokens: usize,

    /// Sampling temperature. Default: unset (the service default).
    pub temperature: Option<f32>,

    /// System prompt template; may contain `{fields}`. If None, uses the
    /// built-in default from [`crate::prompts`].
    pub system_prompt: Option<String>,

    /// Text of the user turn sent with each page image.
    pub user_instruction: String,

    /// Render scale for pages sent to the model. Default: 2.0.
    ///
    /// Twice the page's natural size keeps 8-pt print legible to the model.
    pub extraction_scale: f32,

    /// Render scale for the stored thumbnail. Default: 0.2.
    pub thumbnail_scale: f32,

    /// JPEG quality (1-100) for the stored thumbnail. Default: 80.
    pub thumbnail_quality: u8,

    /// Longest edge of any rendered page, in pixels. Default: 4096.
    pub max_rendered_pixels: u32,

    /// Page selection applied when a request does not specify one.
    /// Default: page 1 only.
    pub pages: PageSelection,

    /// History database file. If None, `~/.fieldscan/history.db`.
    pub database_path: Option<PathBuf>,

    /// pdfium library file, or the directory containing it. If None, the
    /// working directory and then the system library path are searched.
    pub pdfium_lib_path: Option<PathBuf>,

    /// Optional progress callback.
    pub progress_callback: Option<ProgressCallback>,
}

impl Default for ExtractionConfig {
    fn default() -> Self {
        Self {
            endpoint: DEFAULT_ENDPOINT.to_string(),
            model: DEFAULT_MODEL.to_string(),
            api_key: None,
            provider_name: None,
            provider: None,
            recognizer: None,
            max_tokens: DEFAULT_MAX_TOKENS,
            temperature: None,
            system_prompt: None,
            user_instruction: crate::prompts::DEFAULT_USER_INSTRUCTION.to_string(),
            extraction_scale: DEFAULT_EXTRACTION_SCALE,
            thumbnail_scale: DEFAULT_THUMBNAIL_SCALE,
            thumbnail_quality: DEFAULT_THUMBNAIL_QUALITY,
            max_rendered_pixels: DEFAULT_MAX_RENDERED_PIXELS,
            pages: PageSelection::default(),
            database_path: None,
            pdfium_lib_path: None,
            progress_callback: None,
        }
    }
}

impl fmt::Debug for ExtractionConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfig")
            .field("endpoint", &self.endpoint)
            .field("model", &self.model)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("provider_name", &self.provider_name)
            .field("provider", &self.provider.as_ref().map(|_| "<dyn LLMProvider>"))
            .field("recognizer", &self.recognizer.as_ref().map(|r| r.describe()))
            .field("max_tokens", &self.max_tokens)
            .field("temperature", &self.temperature)
            .field("extraction_scale", &self.extraction_scale)
            .field("thumbnail_scale", &self.thumbnail_scale)
            .field("thumbnail_quality", &self.thumbnail_quality)
            .field("max_rendered_pixels", &self.max_rendered_pixels)
            .field("pages", &self.pages)
            .field("database_path", &self.database_path)
            .field("pdfium_lib_path", &self.pdfium_lib_path)
            .finish()
    }
}

impl ExtractionConfig {
    /// Create a new builder for `ExtractionConfig`.
    pub fn builder() -> ExtractionConfigBuilder {
        ExtractionConfigBuilder {
            config: Self::default(),
        }
    }

    /// Start from the environment and return the builder for further tweaks.
    ///
    /// Reads `FIELDSCAN_ENDPOINT`, `FIELDSCAN_MODEL`, `OPENAI_API_KEY`,
    /// `FIELDSCAN_PROVIDER`, `FIELDSCAN_DB` and `PDFIUM_LIB_PATH`. Unset or
    /// empty variables leave the default in place.
    pub fn builder_from_env() -> ExtractionConfigBuilder {
        let mut builder = Self::builder();
        if let Some(v) = env_var(ENV_ENDPOINT) {
            builder = builder.endpoint(v);
        }
        if let Some(v) = env_var(ENV_MODEL) {
            builder = builder.model(v);
        }
        if let Some(v) = env_var(ENV_API_KEY) {
            builder = builder.api_key(v);
        }
        if let Some(v) = env_var(ENV_PROVIDER) {
            builder = builder.provider_name(v);
        }
        if let Some(v) = env_var(ENV_DATABASE) {
            builder = builder.database_path(v);
        }
        if let Some(v) = env_var(ENV_PDFIUM_LIB_PATH) {
            builder = builder.pdfium_lib_path(v);
        }
        builder
    }

    /// Load and validate the configuration from the environment.
    pub fn from_env() -> Result<Self, ScanError> {
        Self::builder_from_env().build()
    }

    /// Where the history database lives.
    pub fn store_location(&self) -> Result<StoreLocation, ScanError> {
        match &self.database_path {
            Some(path) => Ok(StoreLocation::File(path.clone())),
            None => Ok(HistoryStore::at_default_path()?.location().clone()),
        }
    }

    /// A (lazily opened) store at [`Self::store_location`].
    pub fn open_store(&self) -> Result<HistoryStore, ScanError> {
        Ok(HistoryStore::new(self.store_location()?))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Builder for [`ExtractionConfig`].
pub struct ExtractionConfigBuilder {
    config: ExtractionConfig,
}

impl fmt::Debug for ExtractionConfigBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExtractionConfigBuilder")
            .field("config", &self.config)
            .finish()
    }
}

impl ExtractionConfigBuilder {
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.config.endpoint = endpoint.into();
        self
    }

    pub fn model(mut self, model: impl Into<String>) -> Self {
        self.config.model = model.into();
        self
    }

    pub fn api_key(mut self, key: impl Into<String>) -> Self {
        self.config.api_key = Some(key.into());
        self
    }

    pub fn provider_name(mut self, name: impl Into<String>) -> Self {
        self.config.provider_name = Some(name.into());
        self
    }

    pub fn provider(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.config.provider = Some(provider);
        self
    }

    pub fn recognizer(mut self, recognizer: Arc<dyn Recognizer>) -> Self {
        self.config.recognizer = Some(recognizer);
        self
    }

    pub fn max_tokens(mut self, n: usize) -> Self {
        self.config.max_tokens = n;
        self
    }

    pub fn temperature(mut self, t: f32) -> Self {
        self.config.temperature = Some(t.clamp(0.0, 2.0));
        self
    }

    pub fn system_prompt(mut self, prompt: impl Into<String>) -> Self {
        self.config.system_prompt = Some(prompt.into());
        self
    }

    pub fn user_instruction(mut self, text: impl Into<String>) -> Self {
        self.config.user_instruction = text.into();
        self
    }

    pub fn extraction_scale(mut self, scale: f32) -> Self {
        self.config.extraction_scale = scale;
        self
    }

    pub fn thumbnail_scale(mut self, scale: f32) -> Self {
        self.config.thumbnail_scale = scale;
        self
    }

    pub fn thumbnail_quality(mut self, quality: u8) -> Self {
        self.config.thumbnail_quality = quality;
        self
    }

    pub fn max_rendered_pixels(mut self, px: u32) -> Self {
        self.config.max_rendered_pixels = px.max(100);
        self
    }

    pub fn pages(mut self, selection: PageSelection) -> Self {
        self.config.pages = selection;
        self
    }

    pub fn database_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.database_path = Some(path.into());
        self
    }

    pub fn pdfium_lib_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config.pdfium_lib_path = Some(path.into());
        self
    }

    pub fn progress_callback(mut self, callback: ProgressCallback) -> Self {
        self.config.progress_callback = Some(callback);
        self
    }

    /// Build the configuration, validating constraints.
    pub fn build(self) -> Result<ExtractionConfig, ScanError> {
        let c = &self.config;
        if !(c.endpoint.starts_with("http://") || c.endpoint.starts_with("https://")) {
            return Err(ScanError::InvalidConfig(format!(
                "endpoint must be an http(s) URL, got '{}'",
                c.endpoint
            )));
        }
        if c.model.trim().is_empty() {
            return Err(ScanError::InvalidConfig("model must not be empty".into()));
        }
        if c.max_tokens == 0 {
            return Err(ScanError::InvalidConfig("max_tokens must be ≥ 1".into()));
        }
        for (name, scale) in [
            ("extraction_scale", c.extraction_scale),
            ("thumbnail_scale", c.thumbnail_scale),
        ] {
            if !(scale.is_finite() && scale > 0.0 && scale <= 10.0) {
                return Err(ScanError::InvalidConfig(format!(
                    "{name} must be in (0, 10], got {scale}"
                )));
            }
        }
        if c.max_rendered_pixels > MAX_RENDERED_PIXELS_LIMIT {
            return Err(ScanError::InvalidConfig(format!(
                "max_rendered_pixels must be at most {MAX_RENDERED_PIXELS_LIMIT}, got {}",
                c.max_rendered_pixels
            )));
        }
        if !(1..=100).contains(&c.thumbnail_quality) {
            return Err(ScanError::InvalidConfig(format!(
                "thumbnail_quality must be 1–100, got {}",
                c.thumbnail_quality
            )));
        }
        Ok(self.config)
    }
}

// ── Page selection ─────────────────────────────────────────────────────────

/// Specifies which pages of a document to extract from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum PageSelection {
    /// Every page.
    All,
    /// A single page (1-indexed). The default is page 1.
    Single(usize),
    /// A contiguous range of pages (1-indexed, inclusive).
    Range(usize, usize),
    /// Specific pages (1-indexed).
    Set(Vec<usize>),
}

impl Default for PageSelection {
    fn default() -> Self {
        PageSelection::Single(1)
    }
}

impl PageSelection {
    /// Expand into a sorted, deduplicated list of 1-indexed page numbers.
    ///
    /// `All` and the end of a `Range` are bounded by `total_pages`; explicit
    /// page numbers (`Single`, `Set`) are kept as given so that an
    /// out-of-range request surfaces as a render error instead of being
    /// silently dropped.
    pub fn to_pages(&self, total_pages: usize) -> Vec<usize> {
        let mut pages: Vec<usize> = match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(p) => vec![*p],
            PageSelection::Range(start, end) => ((*start).max(1)..=(*end).min(total_pages)).collect(),
            PageSelection::Set(pages) => pages.clone(),
        };
        pages.sort_unstable();
        pages.dedup();
        pages
    }
}

impl fmt::Display for PageSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PageSelection::All => write!(f, "all"),
            PageSelection::Single(p) => write!(f, "{p}"),
            PageSelection::Range(s, e) => write!(f, "{s}-{e}"),
            PageSelection::Set(pages) => {
                let list: Vec<String> = pages.iter().map(|p| p.to_string()).collect();
                write!(f, "{}", list.join(","))
            }
        }
    }
}

/// Parses `all`, `3`, `2-5` or `1,3,7`.
impl FromStr for PageSelection {
    type Err = ScanError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let invalid = |detail: String| ScanError::InvalidConfig(format!("page selection '{s}': {detail}"));
        let page = |p: &str| -> Result<usize, ScanError> {
            match p.trim().parse::<usize>() {
                Ok(0) => Err(invalid("pages are numbered from 1".into())),
                Ok(n) => Ok(n),
                Err(_) => Err(invalid(format!("'{}' is not a page number", p.trim()))),
            }
        };

        if s.eq_ignore_ascii_case("all") {
            return Ok(PageSelection::All);
        }
        if let Some((start, end)) = s.split_once('-') {
            let (start, end) = (page(start)?, page(end)?);
            if start > end {
                return Err(invalid("range start exceeds end".into()));
            }
            return Ok(PageSelection::Range(start, end));
        }
        if s.contains(',') {
            let pages = s
                .split(',')
                .filter(|p| !p.trim().is_empty())
                .map(page)
                .collect::<Result<Vec<_>, _>>()?;
            return Ok(PageSelection::Set(pages));
        }
        Ok(PageSelection::Single(page(s)?))
    }
}

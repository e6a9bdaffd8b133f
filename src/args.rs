//! The argument bundle accepted by [`crate::zerox`], with defaults and
//! validation.
//!
//! Keeping every knob in one struct makes it trivial to share a
//! configuration across calls, serialize it for logging, and diff two runs
//! to understand why their outputs differ.

use std::fmt;

use crate::{
    error::ZeroxError,
    model::CustomModelFn,
    prelude::*,
};

/// LLM parameters in the canonical camelCase casing. Adapters convert to
/// each provider's wire casing at the boundary.
pub type LlmParams = serde_json::Map<String, Value>;

/// The provider family serving a model.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelProvider {
    /// OpenAI's chat completion API (also any OpenAI-compatible gateway).
    #[default]
    #[serde(rename = "OPENAI")]
    OpenAi,

    /// Azure OpenAI deployments.
    Azure,

    /// Google models: Gemini with an API key, or Vertex with a service
    /// account.
    Google,

    /// AWS Bedrock's Converse API.
    Bedrock,
}

/// Credentials, tagged by provider style.
#[derive(Clone, Deserialize, Serialize)]
#[serde(untagged)]
pub enum Credentials {
    /// API-key credentials (OpenAI, Azure, Gemini), with an optional
    /// endpoint override.
    ApiKey {
        api_key: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        endpoint: Option<String>,
    },

    /// AWS-style credentials for Bedrock.
    Aws {
        access_key_id: String,
        secret_access_key: String,
        region: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        session_token: Option<String>,
    },

    /// A Google service account, for Vertex deployments.
    ServiceAccount {
        /// Path to the service-account JSON key file.
        service_account: PathBuf,
        location: String,
    },
}

impl Credentials {
    /// Are these credentials missing every secret?
    pub fn is_empty(&self) -> bool {
        match self {
            Credentials::ApiKey { api_key, .. } => api_key.is_empty(),
            Credentials::Aws {
                access_key_id,
                secret_access_key,
                ..
            } => access_key_id.is_empty() && secret_access_key.is_empty(),
            Credentials::ServiceAccount {
                service_account, ..
            } => service_account.as_os_str().is_empty(),
        }
    }
}

// Never let secrets leak into logs via Debug.
impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credentials::ApiKey { endpoint, .. } => f
                .debug_struct("ApiKey")
                .field("api_key", &"<redacted>")
                .field("endpoint", endpoint)
                .finish(),
            Credentials::Aws { region, .. } => f
                .debug_struct("Aws")
                .field("access_key_id", &"<redacted>")
                .field("region", region)
                .finish(),
            Credentials::ServiceAccount {
                service_account,
                location,
            } => f
                .debug_struct("ServiceAccount")
                .field("service_account", service_account)
                .field("location", location)
                .finish(),
        }
    }
}

/// What to do when a page fails OCR after exhausting retries.
#[derive(Clone, Copy, Debug, Default, Deserialize, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorMode {
    /// Abort the run.
    Throw,

    /// Record an error page and continue.
    #[default]
    Ignore,
}

/// Which pages to rasterize, 1-based.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub enum PageSelection {
    /// All pages.
    #[default]
    All,

    /// A single page.
    Single(usize),

    /// An ascending list of pages.
    List(Vec<usize>),
}

impl PageSelection {
    /// Expand into the 1-based page numbers to render, in ascending order.
    /// Out-of-range entries are dropped silently.
    pub fn selected_pages(&self, total_pages: usize) -> Vec<usize> {
        match self {
            PageSelection::All => (1..=total_pages).collect(),
            PageSelection::Single(page) => {
                if (1..=total_pages).contains(page) {
                    vec![*page]
                } else {
                    vec![]
                }
            }
            PageSelection::List(pages) => {
                let mut pages = pages
                    .iter()
                    .copied()
                    .filter(|page| (1..=total_pages).contains(page))
                    .collect::<Vec<_>>();
                pages.sort_unstable();
                pages.dedup();
                pages
            }
        }
    }
}

// The wire format is `-1` (all), a single 1-based index, or an array of
// 1-based indices.
impl<'de> Deserialize<'de> for PageSelection {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(i64),
            List(Vec<i64>),
        }
        match Raw::deserialize(deserializer)? {
            Raw::Number(-1) => Ok(PageSelection::All),
            Raw::Number(n) if n >= 1 => Ok(PageSelection::Single(n as usize)),
            Raw::Number(n) => Err(serde::de::Error::custom(format!(
                "page selection must be -1 or a 1-based page number, got {n}"
            ))),
            Raw::List(list) => Ok(PageSelection::List(
                list.into_iter()
                    .filter(|n| *n >= 1)
                    .map(|n| n as usize)
                    .collect(),
            )),
        }
    }
}

impl Serialize for PageSelection {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        match self {
            PageSelection::All => serializer.serialize_i64(-1),
            PageSelection::Single(page) => serializer.serialize_u64(*page as u64),
            PageSelection::List(pages) => pages.serialize(serializer),
        }
    }
}

/// The full configuration bundle for one pipeline run.
#[derive(Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ZeroxArgs {
    /// Local path or HTTP(S) URL of the input document.
    pub file_path: String,

    /// Credentials for the main (OCR) model.
    pub credentials: Option<Credentials>,

    /// Model identifier, e.g. `gpt-4o`.
    pub model: String,

    /// Which provider family serves `model`.
    pub model_provider: ModelProvider,

    /// Remove the temp directory when the run finishes.
    pub cleanup: bool,

    /// Maximum number of in-flight LLM calls.
    pub concurrency: usize,

    /// Detect and undo page rotation before OCR.
    pub correct_orientation: bool,

    /// Per-page failure policy.
    pub error_mode: ErrorMode,

    /// Process pages sequentially, passing each page's markdown to the next
    /// as formatting context. Incompatible with extract-only mode.
    pub maintain_format: bool,

    /// Retry budget per LLM call.
    pub max_retries: usize,

    /// Upper bound on Tesseract workers. `-1` sizes the pool automatically.
    pub max_tesseract_workers: i32,

    /// Rendering DPI for PDF rasterization.
    pub image_density: Option<u32>,

    /// Rendered page height in pixels, aspect-preserving.
    pub image_height: Option<u32>,

    /// Recompress rendered pages larger than this many megabytes. `0`
    /// disables recompression.
    pub max_image_size_mb: f64,

    /// Trim uniform borders before OCR.
    pub trim_edges: bool,

    /// Which pages to rasterize.
    pub pages_to_convert: PageSelection,

    /// Root for the per-run temp directory. Defaults to the OS temp dir.
    pub temp_dir: Option<PathBuf>,

    /// If set, the concatenated markdown is written here as
    /// `{sanitized_name}.md`.
    pub output_dir: Option<PathBuf>,

    /// Extra LLM parameters (canonical camelCase keys).
    pub llm_params: LlmParams,

    /// Override for the built-in OCR system prompt.
    pub prompt: Option<String>,

    /// JSON Schema driving structured extraction.
    pub schema: Option<Value>,

    /// Top-level schema properties to extract once per page instead of once
    /// per document.
    pub extract_per_page: Vec<String>,

    /// Skip OCR output entirely; run extraction directly over page images.
    pub extract_only: bool,

    /// Feed extraction raw page images instead of OCR text.
    pub direct_image_extraction: bool,

    /// Feed extraction both page images and OCR text.
    pub enable_hybrid_extraction: bool,

    /// Extraction-stage overrides; each falls back to the main setting.
    pub extraction_model: Option<String>,
    pub extraction_model_provider: Option<ModelProvider>,
    pub extraction_credentials: Option<Credentials>,
    pub extraction_prompt: Option<String>,
    pub extraction_llm_params: Option<LlmParams>,

    /// Caller-supplied OCR handler, replacing the provider call while still
    /// running under the retry and completion-processing layers.
    #[serde(skip)]
    pub custom_model_function: Option<CustomModelFn>,
}

impl Default for ZeroxArgs {
    fn default() -> Self {
        Self {
            file_path: String::new(),
            credentials: None,
            model: "gpt-4o".to_owned(),
            model_provider: ModelProvider::OpenAi,
            cleanup: true,
            concurrency: 10,
            correct_orientation: true,
            error_mode: ErrorMode::Ignore,
            maintain_format: false,
            max_retries: 1,
            max_tesseract_workers: -1,
            image_density: None,
            image_height: None,
            max_image_size_mb: 15.0,
            trim_edges: true,
            pages_to_convert: PageSelection::All,
            temp_dir: None,
            output_dir: None,
            llm_params: LlmParams::new(),
            prompt: None,
            schema: None,
            extract_per_page: Vec::new(),
            extract_only: false,
            direct_image_extraction: false,
            enable_hybrid_extraction: false,
            extraction_model: None,
            extraction_model_provider: None,
            extraction_credentials: None,
            extraction_prompt: None,
            extraction_llm_params: None,
            custom_model_function: None,
        }
    }
}

impl fmt::Debug for ZeroxArgs {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ZeroxArgs")
            .field("file_path", &self.file_path)
            .field("model", &self.model)
            .field("model_provider", &self.model_provider)
            .field("concurrency", &self.concurrency)
            .field("maintain_format", &self.maintain_format)
            .field("error_mode", &self.error_mode)
            .field("max_retries", &self.max_retries)
            .field("pages_to_convert", &self.pages_to_convert)
            .field("extract_only", &self.extract_only)
            .field("direct_image_extraction", &self.direct_image_extraction)
            .field(
                "enable_hybrid_extraction",
                &self.enable_hybrid_extraction,
            )
            .field("has_schema", &self.schema.is_some())
            .field(
                "custom_model_function",
                &self.custom_model_function.as_ref().map(|_| "<fn>"),
            )
            .finish_non_exhaustive()
    }
}

impl ZeroxArgs {
    /// Check mutual-exclusion rules and normalize implied settings. Returns
    /// the bundle with extraction-stage fallbacks resolved.
    pub fn validated(mut self) -> Result<Self> {
        let config_err =
            |message: &str| anyhow!(ZeroxError::Config(message.to_owned()));

        if self.file_path.is_empty() {
            return Err(config_err("file_path is required"));
        }
        match &self.credentials {
            None => return Err(config_err("credentials are required")),
            Some(credentials) if credentials.is_empty() => {
                return Err(config_err("credentials are empty"));
            }
            Some(_) => {}
        }
        if self.concurrency == 0 {
            return Err(config_err("concurrency must be at least 1"));
        }
        if self.enable_hybrid_extraction
            && (self.direct_image_extraction || self.extract_only)
        {
            return Err(config_err(
                "hybrid extraction cannot be combined with direct image extraction or extract-only mode",
            ));
        }
        if (self.enable_hybrid_extraction || self.extract_only) && self.schema.is_none()
        {
            return Err(config_err(
                "hybrid extraction and extract-only mode require a schema",
            ));
        }
        if self.extract_only && self.maintain_format {
            return Err(config_err(
                "extract-only mode cannot maintain format across pages",
            ));
        }

        // Extract-only runs never look at OCR text, so they always feed the
        // extraction model images directly.
        if self.extract_only {
            self.direct_image_extraction = true;
        }

        // Resolve extraction-stage fallbacks once, here, so the rest of the
        // pipeline never re-implements the defaulting.
        if self.extraction_model.is_none() {
            self.extraction_model = Some(self.model.clone());
        }
        if self.extraction_model_provider.is_none() {
            self.extraction_model_provider = Some(self.model_provider);
        }
        if self.extraction_credentials.is_none() {
            self.extraction_credentials = self.credentials.clone();
        }
        if self.extraction_llm_params.is_none() {
            self.extraction_llm_params = Some(self.llm_params.clone());
        }

        Ok(self)
    }
}

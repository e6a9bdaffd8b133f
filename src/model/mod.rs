//! The model abstraction: one completion capability over four provider
//! families.
//!
//! Adapters classify their own failures as transient or fatal by returning
//! [`LlmRetryResult`]; actually retrying is the [`crate::retry`] module's
//! job. Each adapter owns its credential shape and its message builder.

use std::{sync::Arc, time::Duration};

use futures::future::BoxFuture;
use keen_retry::RetryResult;

use crate::{
    args::{Credentials, LlmParams, ModelProvider},
    error::ZeroxError,
    prelude::*,
    retry::retry_transient,
};

pub mod bedrock;
pub mod google;
pub mod message;
pub mod openai;
pub mod params;

/// Per-request timeout for every remote model call.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

/// A [`RetryResult`] for LLM requests, letting adapters distinguish errors
/// that may be transient from errors that are definitely fatal.
pub type LlmRetryResult<T> = RetryResult<(), (), T, anyhow::Error>;

/// What a completion call is for.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CompletionMode {
    /// Emit Markdown for the page image(s).
    Ocr,

    /// Emit a JSON object conforming to a schema.
    Extraction,
}

/// Arguments for an OCR call.
#[derive(Clone, Debug)]
pub struct OcrRequest {
    /// PNG page buffers, usually one, several when a page was split.
    pub buffers: Vec<Vec<u8>>,

    /// Whether the carry-over consistency prompt should be included.
    pub maintain_format: bool,

    /// The previous page's markdown, for format maintenance.
    pub prior_page: Option<String>,

    /// Override for the built-in OCR system prompt.
    pub prompt: Option<String>,
}

/// The input a single extraction call operates on.
#[derive(Clone, Debug)]
pub enum ExtractionInput {
    /// OCR text only.
    TextOnly(String),

    /// Raw page images only.
    ImagesOnly(Vec<PathBuf>),

    /// Both images and OCR text.
    Hybrid {
        image_paths: Vec<PathBuf>,
        text: String,
    },
}

/// Arguments for an extraction call, with images already resolved and
/// cleaned by the extraction driver.
#[derive(Clone, Debug)]
pub struct ExtractionRequest {
    /// OCR text, when the mode provides any.
    pub text: Option<String>,

    /// Cleaned PNG buffers, when the mode provides images.
    pub image_buffers: Vec<Vec<u8>>,

    /// Override for the built-in extraction system prompt.
    pub prompt: Option<String>,

    /// The (sub-)schema this call must satisfy.
    pub schema: Value,
}

/// Either kind of completion request.
#[derive(Clone, Debug)]
pub enum CompletionRequest {
    Ocr(OcrRequest),
    Extraction(ExtractionRequest),
}

impl CompletionRequest {
    pub fn mode(&self) -> CompletionMode {
        match self {
            CompletionRequest::Ocr(_) => CompletionMode::Ocr,
            CompletionRequest::Extraction(_) => CompletionMode::Extraction,
        }
    }
}

/// An OCR response, before completion processing.
#[derive(Clone, Debug)]
pub struct RawCompletion {
    /// Raw model output (possibly still fenced).
    pub content: String,

    pub input_tokens: u64,
    pub output_tokens: u64,

    /// Per-token logprobs with camelCase keys, when requested and supported.
    pub logprobs: Option<Value>,
}

/// An extraction response, before completion processing.
#[derive(Clone, Debug)]
pub struct RawExtraction {
    /// The model's JSON value (or JSON text, for strict-JSON providers).
    pub value: Value,

    pub input_tokens: u64,
    pub output_tokens: u64,
    pub logprobs: Option<Value>,
}

/// Either kind of completion response.
#[derive(Clone, Debug)]
pub enum CompletionResponse {
    Ocr(RawCompletion),
    Extraction(RawExtraction),
}

/// A caller-supplied replacement for the OCR adapter call. It bypasses the
/// provider entirely but still runs under the retry and
/// completion-processing layers, so downstream invariants hold.
pub type CustomModelFn =
    Arc<dyn Fn(OcrRequest) -> BoxFuture<'static, Result<RawCompletion>> + Send + Sync>;

/// One configured model endpoint.
pub struct ModelClient {
    inner: ClientInner,
    model: String,
    llm_params: LlmParams,
}

enum ClientInner {
    /// OpenAI, Azure, and the Gemini OpenAI-compatible endpoint.
    OpenAiCompat(openai::OpenAiCompatClient),

    /// Google Vertex, via a service account.
    Vertex(google::VertexClient),

    /// AWS Bedrock's Converse API.
    Bedrock(bedrock::BedrockClient),
}

impl ModelClient {
    /// Build a client for `model` served by `provider`.
    pub async fn new(
        provider: ModelProvider,
        credentials: &Credentials,
        model: String,
        mut llm_params: LlmParams,
    ) -> Result<Self> {
        let config_err = |message: String| anyhow!(ZeroxError::Config(message));
        let inner = match (provider, credentials) {
            (ModelProvider::OpenAi, Credentials::ApiKey { api_key, endpoint }) => {
                ClientInner::OpenAiCompat(openai::OpenAiCompatClient::for_openai(
                    api_key,
                    endpoint.as_deref(),
                ))
            }
            (ModelProvider::Azure, Credentials::ApiKey { api_key, endpoint }) => {
                let endpoint = endpoint.as_deref().ok_or_else(|| {
                    config_err("Azure credentials require an endpoint".into())
                })?;
                ClientInner::OpenAiCompat(openai::OpenAiCompatClient::for_azure(
                    api_key, endpoint, &model,
                ))
            }
            (ModelProvider::Google, Credentials::ApiKey { api_key, .. }) => {
                let knobs = google::extract_gemini_knobs(&mut llm_params, &model)?;
                ClientInner::OpenAiCompat(openai::OpenAiCompatClient::for_gemini(
                    api_key, knobs,
                ))
            }
            (
                ModelProvider::Google,
                Credentials::ServiceAccount {
                    service_account,
                    location,
                },
            ) => {
                google::reject_vertex_thinking_level(&mut llm_params);
                ClientInner::Vertex(
                    google::VertexClient::new(service_account, location).await?,
                )
            }
            (ModelProvider::Bedrock, Credentials::Aws { .. }) => {
                ClientInner::Bedrock(bedrock::BedrockClient::new(credentials).await?)
            }
            (provider, _) => {
                return Err(config_err(format!(
                    "credentials do not match provider {provider:?}"
                )));
            }
        };
        Ok(Self {
            inner,
            model,
            llm_params,
        })
    }

    /// Run one completion call. The result distinguishes transient from
    /// fatal failures; callers wrap this in [`crate::retry::run_retries`].
    #[instrument(level = "debug", skip_all, fields(model = %self.model, mode = ?request.mode()))]
    pub async fn get_completion(
        &self,
        request: CompletionRequest,
    ) -> LlmRetryResult<CompletionResponse> {
        match request {
            CompletionRequest::Ocr(ocr) => {
                let result = match &self.inner {
                    ClientInner::OpenAiCompat(client) => {
                        with_timeout(client.ocr(&self.model, &self.llm_params, &ocr))
                            .await
                    }
                    ClientInner::Vertex(client) => {
                        with_timeout(client.ocr(&self.model, &self.llm_params, &ocr))
                            .await
                    }
                    ClientInner::Bedrock(client) => {
                        with_timeout(client.ocr(&self.model, &self.llm_params, &ocr))
                            .await
                    }
                };
                map_output(result, CompletionResponse::Ocr)
            }
            CompletionRequest::Extraction(extraction) => {
                let result = match &self.inner {
                    ClientInner::OpenAiCompat(client) => {
                        with_timeout(client.extraction(
                            &self.model,
                            &self.llm_params,
                            &extraction,
                        ))
                        .await
                    }
                    ClientInner::Vertex(client) => {
                        with_timeout(client.extraction(
                            &self.model,
                            &self.llm_params,
                            &extraction,
                        ))
                        .await
                    }
                    ClientInner::Bedrock(client) => {
                        with_timeout(client.extraction(
                            &self.model,
                            &self.llm_params,
                            &extraction,
                        ))
                        .await
                    }
                };
                map_output(result, CompletionResponse::Extraction)
            }
        }
    }

    /// OCR convenience wrapper around [`Self::get_completion`].
    pub async fn get_ocr_completion(
        &self,
        request: OcrRequest,
    ) -> LlmRetryResult<RawCompletion> {
        let result = self.get_completion(CompletionRequest::Ocr(request)).await;
        map_output(result, |response| {
            let CompletionResponse::Ocr(raw) = response else {
                unreachable!("OCR requests produce OCR responses");
            };
            raw
        })
    }

    /// Extraction convenience wrapper around [`Self::get_completion`].
    pub async fn get_extraction(
        &self,
        request: ExtractionRequest,
    ) -> LlmRetryResult<RawExtraction> {
        let result = self
            .get_completion(CompletionRequest::Extraction(request))
            .await;
        map_output(result, |response| {
            let CompletionResponse::Extraction(raw) = response else {
                unreachable!("extraction requests produce extraction responses");
            };
            raw
        })
    }
}

/// Rewrap a retry result's success value without touching the
/// transient/fatal classification.
fn map_output<T, U>(
    result: LlmRetryResult<T>,
    f: impl FnOnce(T) -> U,
) -> LlmRetryResult<U> {
    match result {
        RetryResult::Ok {
            reported_input,
            output,
        } => RetryResult::Ok {
            reported_input,
            output: f(output),
        },
        RetryResult::Transient { input, error } => {
            RetryResult::Transient { input, error }
        }
        RetryResult::Fatal { input, error } => RetryResult::Fatal { input, error },
    }
}

/// Cap a remote call at [`REQUEST_TIMEOUT`]. Timeouts are retried: runaway
/// responses and overloaded servers often recover on a second attempt.
async fn with_timeout<T>(
    future: impl Future<Output = LlmRetryResult<T>>,
) -> LlmRetryResult<T> {
    match tokio::time::timeout(REQUEST_TIMEOUT, future).await {
        Ok(result) => result,
        Err(_) => retry_transient(anyhow!(
            "LLM request timed out after {}s",
            REQUEST_TIMEOUT.as_secs()
        )),
    }
}

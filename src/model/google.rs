//! Google adapters: Gemini knob mapping for the OpenAI-compatible endpoint,
//! and a Vertex AI client for service-account deployments.

use std::sync::Once;

use base64::{Engine as _, prelude::BASE64_STANDARD};
use google_cloud_aiplatform_v1 as vertexai;
use google_cloud_gax::error::rpc::Code;
use serde_json::Map;
use vertexai::{
    client::PredictionService,
    model::{Blob, Content, GenerationConfig, Part},
};

use crate::{
    args::LlmParams,
    data_url::parse_data_url,
    error::ZeroxError,
    model::{
        ExtractionRequest, LlmRetryResult, OcrRequest, RawCompletion, RawExtraction,
        message::{Message, build_extraction_messages, build_ocr_messages},
        params::numeric_param,
    },
    prelude::*,
    retry::{IntoRetryResult as _, IsKnownTransient, retry_ok, try_retry},
};

/// Abstract Gemini knobs mapped to provider constants, applied to requests
/// going through the OpenAI-compatible endpoint.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GeminiKnobs {
    /// `thinkingLevel` mapped to a `reasoning_effort` constant.
    pub reasoning_effort: Option<&'static str>,

    /// `mediaResolution` mapped to a `MEDIA_RESOLUTION_*` constant.
    pub media_resolution: Option<&'static str>,
}

impl GeminiKnobs {
    /// Decorate an OpenAI-compatible request body.
    pub fn apply(&self, req: &mut Map<String, Value>) {
        if let Some(effort) = self.reasoning_effort {
            req.insert("reasoning_effort".into(), Value::String(effort.into()));
        }
        if let Some(resolution) = self.media_resolution {
            req.insert(
                "extra_body".into(),
                json!({ "google": { "media_resolution": resolution } }),
            );
        }
    }
}

/// Pop the abstract knobs out of the canonical params and map them to
/// Gemini constants. Only Gemini-3-family models understand them; for older
/// models they are dropped with a warning.
pub fn extract_gemini_knobs(
    llm_params: &mut LlmParams,
    model: &str,
) -> Result<GeminiKnobs> {
    let thinking = llm_params.remove("thinkingLevel");
    let media = llm_params.remove("mediaResolution");
    if !model.starts_with("gemini-3") {
        if thinking.is_some() || media.is_some() {
            warn!(
                model,
                "thinkingLevel/mediaResolution only apply to Gemini 3 models; ignoring"
            );
        }
        return Ok(GeminiKnobs::default());
    }

    let reasoning_effort = match thinking.as_ref().and_then(Value::as_str) {
        None => None,
        Some("low") => Some("low"),
        Some("high") => Some("high"),
        Some(other) => {
            return Err(anyhow!(ZeroxError::Config(format!(
                "thinkingLevel must be \"low\" or \"high\", got {other:?}"
            ))));
        }
    };
    let media_resolution = match media.as_ref().and_then(Value::as_str) {
        None => None,
        Some("low") => Some("MEDIA_RESOLUTION_LOW"),
        Some("medium") => Some("MEDIA_RESOLUTION_MEDIUM"),
        Some("high") => Some("MEDIA_RESOLUTION_HIGH"),
        Some(other) => {
            return Err(anyhow!(ZeroxError::Config(format!(
                "mediaResolution must be \"low\", \"medium\" or \"high\", got {other:?}"
            ))));
        }
    };
    Ok(GeminiKnobs {
        reasoning_effort,
        media_resolution,
    })
}

/// Vertex deployments don't take `thinkingLevel`; drop it with a one-shot
/// warning instead of failing every request.
pub fn reject_vertex_thinking_level(llm_params: &mut LlmParams) {
    static WARNED: Once = Once::new();
    if llm_params.remove("thinkingLevel").is_some() {
        WARNED.call_once(|| {
            warn!("thinkingLevel is not supported on Vertex deployments; ignoring");
        });
    }
}

/// A Vertex AI client built from a service-account key file.
pub struct VertexClient {
    client: PredictionService,
    project_id: String,
    location: String,
}

impl VertexClient {
    /// Build a client from the service-account JSON at `key_path`.
    pub async fn new(key_path: &Path, location: &str) -> Result<Self> {
        let key_json = tokio::fs::read_to_string(key_path)
            .await
            .with_context(|| {
                format!("failed to read service account key {:?}", key_path.display())
            })?;
        let key: Value = serde_json::from_str(&key_json)
            .context("service account key is not valid JSON")?;
        let project_id = key
            .get("project_id")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                anyhow!(ZeroxError::Config(
                    "service account key has no project_id".into()
                ))
            })?
            .to_owned();
        let credentials =
            google_cloud_auth::credentials::service_account::Builder::new(key)
                .build()
                .context("failed to build service account credentials")?;
        let client = PredictionService::builder()
            .with_credentials(credentials)
            .build()
            .await
            .context("failed to create Vertex AI client")?;
        Ok(Self {
            client,
            project_id,
            location: location.to_owned(),
        })
    }

    fn model_path(&self, model: &str) -> String {
        format!(
            "projects/{project_id}/locations/{location}/publishers/google/models/{model}",
            project_id = self.project_id,
            location = self.location,
        )
    }

    fn generation_config(&self, llm_params: &LlmParams) -> GenerationConfig {
        let mut config = GenerationConfig::new();
        if let Some(max_tokens) = numeric_param(llm_params, "maxTokens")
            .or_else(|| numeric_param(llm_params, "maxCompletionTokens"))
        {
            config = config.set_max_output_tokens(max_tokens as i32);
        }
        if let Some(temperature) = numeric_param(llm_params, "temperature") {
            config = config.set_temperature(temperature as f32);
        }
        if let Some(top_p) = numeric_param(llm_params, "topP") {
            config = config.set_top_p(top_p as f32);
        }
        config
    }

    /// Run an OCR call: plain markdown text out.
    #[instrument(level = "debug", skip_all)]
    pub async fn ocr(
        &self,
        model: &str,
        llm_params: &LlmParams,
        request: &OcrRequest,
    ) -> LlmRetryResult<RawCompletion> {
        let contents =
            try_retry!(to_vertex_contents(&build_ocr_messages(request)).or_fatal());
        let config = self.generation_config(llm_params);
        let (text, input_tokens, output_tokens) =
            try_retry!(self.send(model, contents, config).await);
        retry_ok(RawCompletion {
            content: text,
            input_tokens,
            output_tokens,
            // Vertex does not expose per-token logprobs through this API.
            logprobs: None,
        })
    }

    /// Run an extraction call with a native response schema.
    #[instrument(level = "debug", skip_all)]
    pub async fn extraction(
        &self,
        model: &str,
        llm_params: &LlmParams,
        request: &ExtractionRequest,
    ) -> LlmRetryResult<RawExtraction> {
        let contents = try_retry!(
            to_vertex_contents(&build_extraction_messages(request)).or_fatal()
        );
        let config = self
            .generation_config(llm_params)
            .set_response_mime_type("application/json")
            .set_response_json_schema(request.schema.clone());
        let (text, input_tokens, output_tokens) =
            try_retry!(self.send(model, contents, config).await);
        // If Google didn't follow our schema, that's weird, but retryable.
        let value = try_retry!(
            serde_json::from_str::<Value>(&text)
                .with_context(|| format!(
                    "failed to parse Vertex AI response as JSON: {text}"
                ))
                .or_transient()
        );
        retry_ok(RawExtraction {
            value,
            input_tokens,
            output_tokens,
            logprobs: None,
        })
    }

    /// Send a `generate_content` request and pull out the text plus usage.
    async fn send(
        &self,
        model: &str,
        contents: Vec<Content>,
        config: GenerationConfig,
    ) -> LlmRetryResult<(String, u64, u64)> {
        let request = self
            .client
            .generate_content()
            .set_model(self.model_path(model))
            .set_contents(contents)
            .set_generation_config(config);
        let response = try_retry!(request.send().await.or_known_transient());
        trace!(?response, "Vertex response");

        let candidate = try_retry!(
            response
                .candidates
                .first()
                .ok_or_else(|| anyhow!(
                    "Vertex AI response did not contain any candidates"
                ))
                .or_fatal()
        );
        let content = try_retry!(
            candidate
                .content
                .as_ref()
                .ok_or_else(|| anyhow!(
                    "Vertex AI response did not contain any content"
                ))
                .or_fatal()
        );
        let text = try_retry!(extract_model_text(content).or_transient());

        let (input_tokens, output_tokens) = response
            .usage_metadata
            .map(|usage| {
                (
                    u64::try_from(usage.prompt_token_count).unwrap_or(0),
                    u64::try_from(usage.thoughts_token_count).unwrap_or(0)
                        + u64::try_from(usage.candidates_token_count).unwrap_or(0),
                )
            })
            .unwrap_or((0, 0));
        retry_ok((text, input_tokens, output_tokens))
    }
}

/// Convert neutral messages to Vertex AI contents. System text rides along
/// as a model-role turn, matching how the prediction API expects priming
/// context.
fn to_vertex_contents(messages: &[Message]) -> Result<Vec<Content>> {
    let mut contents = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            Message::System(text) => {
                contents.push(
                    Content::new()
                        .set_role("model")
                        .set_parts([Part::new().set_text(text)]),
                );
            }
            Message::User { text, images } => {
                let mut parts = Vec::with_capacity(images.len() + 1);
                for image in images {
                    let (mime_type, base64_data) =
                        parse_data_url(image).ok_or_else(|| {
                            anyhow!("only data URLs are supported for Vertex images")
                        })?;
                    let bytes = BASE64_STANDARD
                        .decode(base64_data)
                        .context("failed to decode base64 image data")?;
                    parts.push(Part::new().set_inline_data(
                        Blob::new().set_mime_type(mime_type).set_data(bytes),
                    ));
                }
                if let Some(text) = text {
                    parts.push(Part::new().set_text(text));
                }
                if parts.is_empty() {
                    return Err(anyhow!("user message has no content"));
                }
                contents.push(Content::new().set_role("user").set_parts(parts));
            }
        }
    }
    Ok(contents)
}

/// Extract text content from the model's response turn.
fn extract_model_text(content: &Content) -> Result<String> {
    if content.role != "model" {
        return Err(anyhow!(
            "Vertex AI response content role is not 'model': {}",
            content.role
        ));
    }
    for part in &content.parts {
        if let Some(text) = part.text() {
            return Ok(text.clone());
        }
    }
    Err(anyhow!("no text response found in Vertex AI response"))
}

impl IsKnownTransient for vertexai::Error {
    fn is_known_transient(&self) -> bool {
        if let Some(status) = self.status() {
            if status.code.is_known_transient() {
                return true;
            }
        }
        self.is_timeout() || self.is_exhausted()
    }
}

impl IsKnownTransient for Code {
    fn is_known_transient(&self) -> bool {
        matches!(
            self,
            Code::DeadlineExceeded
                | Code::ResourceExhausted
                | Code::Internal
                | Code::Unavailable
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn params(pairs: &[(&str, Value)]) -> LlmParams {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.clone()))
            .collect()
    }

    #[test]
    fn gemini_3_knobs_map_to_provider_constants() {
        let mut source = params(&[
            ("thinkingLevel", json!("high")),
            ("mediaResolution", json!("medium")),
            ("temperature", json!(0.0)),
        ]);
        let knobs = extract_gemini_knobs(&mut source, "gemini-3-pro").unwrap();
        assert_eq!(knobs.reasoning_effort, Some("high"));
        assert_eq!(knobs.media_resolution, Some("MEDIA_RESOLUTION_MEDIUM"));
        // The abstract knobs must not reach the wire params.
        assert!(!source.contains_key("thinkingLevel"));
        assert!(!source.contains_key("mediaResolution"));
        assert!(source.contains_key("temperature"));
    }

    #[test]
    fn older_gemini_models_drop_the_knobs() {
        let mut source = params(&[("thinkingLevel", json!("low"))]);
        let knobs = extract_gemini_knobs(&mut source, "gemini-2.0-flash").unwrap();
        assert_eq!(knobs, GeminiKnobs::default());
        assert!(!source.contains_key("thinkingLevel"));
    }

    #[test]
    fn invalid_knob_values_are_config_errors() {
        let mut source = params(&[("thinkingLevel", json!("maximum"))]);
        let err = extract_gemini_knobs(&mut source, "gemini-3-flash").unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ZeroxError>(),
            Some(ZeroxError::Config(_))
        ));
    }

    #[test]
    fn vertex_strips_thinking_level() {
        let mut source = params(&[("thinkingLevel", json!("low"))]);
        reject_vertex_thinking_level(&mut source);
        assert!(source.is_empty());
    }

    #[test]
    fn knobs_decorate_openai_compat_requests() {
        let knobs = GeminiKnobs {
            reasoning_effort: Some("low"),
            media_resolution: Some("MEDIA_RESOLUTION_LOW"),
        };
        let mut req = Map::new();
        knobs.apply(&mut req);
        assert_eq!(req["reasoning_effort"], json!("low"));
        assert_eq!(
            req["extra_body"]["google"]["media_resolution"],
            json!("MEDIA_RESOLUTION_LOW")
        );
    }
}

//! Adapter for OpenAI-style chat completion APIs.
//!
//! This one adapter serves three provider configurations: OpenAI itself
//! (or any compatible gateway via an endpoint override), Azure OpenAI
//! deployments, and Gemini through Google's OpenAI-compatible endpoint.
//! Requests are built as plain JSON and sent with `create_byot`, so
//! provider-specific fields pass through without any protocol authoring.

use async_openai::{
    Client,
    config::{AzureConfig, OpenAIConfig},
    error::OpenAIError,
    types::CreateChatCompletionResponse,
};
use serde_json::Map;

use crate::{
    args::LlmParams,
    completion::normalize_keys_to_camel,
    model::{
        ExtractionRequest, LlmRetryResult, OcrRequest, RawCompletion, RawExtraction,
        google::GeminiKnobs,
        message::{build_extraction_messages, build_ocr_messages, to_openai_messages},
        params::{logprobs_requested, to_snake_case_params, translate_token_limit},
    },
    prelude::*,
    retry::{IntoRetryResult as _, IsKnownTransient, retry_fatal, retry_ok, try_retry},
    schema::schema_title,
};

/// Google's OpenAI-compatible endpoint for Gemini API keys.
const GEMINI_OPENAI_COMPAT_BASE: &str =
    "https://generativelanguage.googleapis.com/v1beta/openai";

/// Azure API version used when building deployment clients.
const AZURE_API_VERSION: &str = "2024-10-21";

/// A client for any OpenAI-compatible chat endpoint.
pub struct OpenAiCompatClient {
    inner: CompatClient,

    /// Gemini-only request decorations; empty for other providers.
    knobs: GeminiKnobs,
}

enum CompatClient {
    OpenAi(Client<OpenAIConfig>),
    Azure(Client<AzureConfig>),
}

impl OpenAiCompatClient {
    /// Client for OpenAI or an OpenAI-compatible gateway.
    pub fn for_openai(api_key: &str, endpoint: Option<&str>) -> Self {
        let mut config = OpenAIConfig::new().with_api_key(api_key);
        if let Some(endpoint) = endpoint {
            config = config.with_api_base(endpoint);
        }
        Self {
            inner: CompatClient::OpenAi(Client::with_config(config)),
            knobs: GeminiKnobs::default(),
        }
    }

    /// Client for an Azure OpenAI deployment. The deployment name is the
    /// model identifier.
    pub fn for_azure(api_key: &str, endpoint: &str, deployment: &str) -> Self {
        let config = AzureConfig::new()
            .with_api_key(api_key)
            .with_api_base(endpoint)
            .with_deployment_id(deployment)
            .with_api_version(AZURE_API_VERSION);
        Self {
            inner: CompatClient::Azure(Client::with_config(config)),
            knobs: GeminiKnobs::default(),
        }
    }

    /// Client for Gemini via Google's OpenAI-compatible endpoint.
    pub fn for_gemini(api_key: &str, knobs: GeminiKnobs) -> Self {
        let config = OpenAIConfig::new()
            .with_api_key(api_key)
            .with_api_base(GEMINI_OPENAI_COMPAT_BASE);
        Self {
            inner: CompatClient::OpenAi(Client::with_config(config)),
            knobs,
        }
    }

    /// Run an OCR call: markdown out, no response schema.
    #[instrument(level = "debug", skip_all)]
    pub async fn ocr(
        &self,
        model: &str,
        llm_params: &LlmParams,
        request: &OcrRequest,
    ) -> LlmRetryResult<RawCompletion> {
        let messages =
            try_retry!(to_openai_messages(&build_ocr_messages(request)).or_fatal());
        let req = self.build_request(model, llm_params, messages, None);
        let (response, logprobs) = try_retry!(self.send(req).await);
        let content = try_retry!(extract_content(&response).or_fatal());
        retry_ok(RawCompletion {
            content,
            input_tokens: prompt_tokens(&response),
            output_tokens: completion_tokens(&response),
            logprobs,
        })
    }

    /// Run an extraction call with a native structured-output request.
    #[instrument(level = "debug", skip_all)]
    pub async fn extraction(
        &self,
        model: &str,
        llm_params: &LlmParams,
        request: &ExtractionRequest,
    ) -> LlmRetryResult<RawExtraction> {
        let messages = try_retry!(
            to_openai_messages(&build_extraction_messages(request)).or_fatal()
        );
        let req =
            self.build_request(model, llm_params, messages, Some(&request.schema));
        let (response, logprobs) = try_retry!(self.send(req).await);
        let content = try_retry!(extract_content(&response).or_fatal());
        // If we didn't get JSON here, the model ignored the response format.
        // Give it another chance.
        let value = try_retry!(
            serde_json::from_str::<Value>(&content)
                .with_context(|| format!(
                    "error parsing extraction response content: {content:?}"
                ))
                .or_transient()
        );
        retry_ok(RawExtraction {
            value,
            input_tokens: prompt_tokens(&response),
            output_tokens: completion_tokens(&response),
            logprobs,
        })
    }

    /// Assemble the JSON request body.
    fn build_request(
        &self,
        model: &str,
        llm_params: &LlmParams,
        messages: Value,
        schema: Option<&Value>,
    ) -> Value {
        let mut wire = to_snake_case_params(llm_params);
        translate_token_limit(&mut wire, model);
        let mut req = Map::new();
        req.insert("model".into(), Value::String(model.to_owned()));
        req.insert("messages".into(), messages);
        for (key, value) in wire {
            req.insert(key, value);
        }
        if logprobs_requested(llm_params) {
            req.insert("logprobs".into(), Value::Bool(true));
        }
        if let Some(schema) = schema {
            req.insert(
                "response_format".into(),
                json!({
                    "type": "json_schema",
                    "json_schema": {
                        "name": schema_title(schema),
                        "schema": schema,
                        "strict": true,
                    },
                }),
            );
        }
        self.knobs.apply(&mut req);
        Value::Object(req)
    }

    /// Send the request; on success, return the typed response plus any
    /// camelCase-normalized logprobs from the first choice.
    async fn send(
        &self,
        req: Value,
    ) -> LlmRetryResult<(CreateChatCompletionResponse, Option<Value>)> {
        trace!(?req, "request");
        let result: Result<Value, OpenAIError> = match &self.inner {
            CompatClient::OpenAi(client) => client.chat().create_byot(req).await,
            CompatClient::Azure(client) => client.chat().create_byot(req).await,
        };
        let raw: Value = try_retry!(result.or_known_transient());
        debug!(%raw, "chat response");
        let logprobs = raw["choices"][0]["logprobs"]
            .as_object()
            .map(|obj| normalize_keys_to_camel(Value::Object(obj.clone())));
        let response = try_retry!(
            serde_json::from_value::<CreateChatCompletionResponse>(raw)
                .context("error parsing chat completion response")
                .or_fatal()
        );
        match response.choices.first() {
            Some(choice)
                if choice.finish_reason
                    == Some(async_openai::types::FinishReason::ContentFilter) =>
            {
                retry_fatal(anyhow!(
                    "content filter triggered (may also be a RECITATION error for Gemini models)"
                ))
            }
            Some(_) => retry_ok((response, logprobs)),
            None => retry_fatal(anyhow!("no choices in chat response")),
        }
    }
}

/// Pull the assistant text out of the first choice.
fn extract_content(response: &CreateChatCompletionResponse) -> Result<String> {
    let choice = response
        .choices
        .first()
        .ok_or_else(|| anyhow!("no choices in chat response"))?;
    Ok(choice.message.content.clone().unwrap_or_default())
}

fn prompt_tokens(response: &CreateChatCompletionResponse) -> u64 {
    response
        .usage
        .as_ref()
        .map(|usage| u64::from(usage.prompt_tokens))
        .unwrap_or(0)
}

fn completion_tokens(response: &CreateChatCompletionResponse) -> u64 {
    response
        .usage
        .as_ref()
        .map(|usage| u64::from(usage.completion_tokens))
        .unwrap_or(0)
}

impl IsKnownTransient for OpenAIError {
    fn is_known_transient(&self) -> bool {
        match self {
            OpenAIError::Reqwest(err) => err.is_known_transient(),
            OpenAIError::ApiError(api) => {
                let kind = api.r#type.as_deref().unwrap_or_default();
                kind == "server_error"
                    || kind == "overloaded_error"
                    || api.message.contains("rate limit")
                    || api.message.contains("Rate limit")
            }
            _ => false,
        }
    }
}

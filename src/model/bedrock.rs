//! AWS Bedrock adapter, built on the Converse API.
//!
//! OCR calls are plain text conversations. Extraction calls force the model
//! through a single reporting tool whose input schema is the caller's
//! sub-schema, which is the most portable way to get schema-shaped JSON out
//! of Bedrock-hosted models.

use std::collections::HashMap;

use aws_config::BehaviorVersion;
use aws_sdk_bedrockruntime::{
    Client,
    error::SdkError,
    operation::converse::ConverseError,
    primitives::Blob,
    types::{
        AnyToolChoice, ContentBlock, ConversationRole, ImageBlock, ImageFormat,
        ImageSource, InferenceConfiguration, Message as BedrockMessage, StopReason,
        SystemContentBlock, Tool, ToolChoice, ToolConfiguration, ToolInputSchema,
        ToolSpecification,
    },
};
use aws_smithy_types::{Document, Number};
use base64::{Engine as _, prelude::BASE64_STANDARD};

use crate::{
    args::{Credentials, LlmParams},
    data_url::parse_data_url,
    error::ZeroxError,
    model::{
        ExtractionRequest, LlmRetryResult, OcrRequest, RawCompletion, RawExtraction,
        message::{Message, build_extraction_messages, build_ocr_messages},
        params::numeric_param,
    },
    prelude::*,
    retry::{
        IntoRetryResult as _, IsKnownTransient, retry_ok, retry_transient, try_retry,
    },
};

/// The name of the tool we tell Bedrock to use for reporting extraction
/// results.
static OUTPUT_TOOL_NAME: &str = "report_result";

/// A Bedrock Converse client.
pub struct BedrockClient {
    client: Client,
}

impl BedrockClient {
    /// Build a client from explicit AWS credentials. Nothing is read from
    /// the environment.
    pub async fn new(credentials: &Credentials) -> Result<Self> {
        let Credentials::Aws {
            access_key_id,
            secret_access_key,
            region,
            session_token,
        } = credentials
        else {
            return Err(anyhow!(ZeroxError::Config(
                "Bedrock requires AWS-style credentials".into()
            )));
        };
        let provider = aws_credential_types::Credentials::new(
            access_key_id.clone(),
            secret_access_key.clone(),
            session_token.clone(),
            None,
            "zerox",
        );
        let config = aws_config::defaults(BehaviorVersion::latest())
            .credentials_provider(provider)
            .region(aws_config::Region::new(region.clone()))
            .load()
            .await;
        Ok(Self {
            client: Client::new(&config),
        })
    }

    fn inference_config(&self, llm_params: &LlmParams) -> InferenceConfiguration {
        let mut builder = InferenceConfiguration::builder();
        if let Some(max_tokens) = numeric_param(llm_params, "maxTokens")
            .or_else(|| numeric_param(llm_params, "maxCompletionTokens"))
        {
            builder = builder.max_tokens(max_tokens as i32);
        }
        if let Some(temperature) = numeric_param(llm_params, "temperature") {
            builder = builder.temperature(temperature as f32);
        }
        if let Some(top_p) = numeric_param(llm_params, "topP") {
            builder = builder.top_p(top_p as f32);
        }
        builder.build()
    }

    /// Run an OCR call: the model answers with plain markdown text.
    #[instrument(level = "debug", skip_all)]
    pub async fn ocr(
        &self,
        model: &str,
        llm_params: &LlmParams,
        request: &OcrRequest,
    ) -> LlmRetryResult<RawCompletion> {
        let (system, messages) =
            try_retry!(to_bedrock_messages(&build_ocr_messages(request)).or_fatal());
        let output = try_retry!(
            self.client
                .converse()
                .model_id(model)
                .inference_config(self.inference_config(llm_params))
                .set_system(system.map(|s| vec![s]))
                .set_messages(Some(messages))
                .send()
                .await
                .or_known_transient()
        );

        let (input_tokens, output_tokens) = usage_counts(output.usage());
        let converse_output = try_retry!(
            output
                .output()
                .ok_or_else(|| anyhow!("Bedrock response did not contain any output"))
                .or_transient()
        );
        let message = try_retry!(
            converse_output
                .as_message()
                .map_err(|_| anyhow!("Bedrock response did not contain a message"))
                .or_transient()
        );
        let mut text = None;
        for block in message.content() {
            if let ContentBlock::Text(block_text) = block {
                text = Some(block_text.clone());
                break;
            }
        }
        let content = try_retry!(
            text.ok_or_else(|| anyhow!("Bedrock response contained no text block"))
                .or_transient()
        );
        retry_ok(RawCompletion {
            content,
            input_tokens,
            output_tokens,
            // The Converse API does not expose per-token logprobs.
            logprobs: None,
        })
    }

    /// Run an extraction call by forcing the model through the reporting
    /// tool.
    #[instrument(level = "debug", skip_all)]
    pub async fn extraction(
        &self,
        model: &str,
        llm_params: &LlmParams,
        request: &ExtractionRequest,
    ) -> LlmRetryResult<RawExtraction> {
        let (system, messages) = try_retry!(
            to_bedrock_messages(&build_extraction_messages(request)).or_fatal()
        );

        let tool_config = try_retry!(build_tool_config(&request.schema).or_fatal());
        let output = try_retry!(
            self.client
                .converse()
                .model_id(model)
                .inference_config(self.inference_config(llm_params))
                .tool_config(tool_config)
                .set_system(system.map(|s| vec![s]))
                .set_messages(Some(messages))
                .send()
                .await
                .or_known_transient()
        );

        // We forced tool use; anything else means the model went off-script.
        if output.stop_reason() != &StopReason::ToolUse {
            return retry_transient(anyhow!(
                "unexpected stop reason: {}",
                output.stop_reason()
            ));
        }

        let (input_tokens, output_tokens) = usage_counts(output.usage());
        let value = try_retry!(extract_tool_input(&output));
        retry_ok(RawExtraction {
            value,
            input_tokens,
            output_tokens,
            logprobs: None,
        })
    }
}

/// Build the single-tool configuration that forces schema-shaped output.
fn build_tool_config(schema: &Value) -> Result<ToolConfiguration> {
    ToolConfiguration::builder()
        .tools(Tool::ToolSpec(
            ToolSpecification::builder()
                .name(OUTPUT_TOOL_NAME.to_string())
                .description("Report the requested data".to_string())
                .input_schema(ToolInputSchema::Json(
                    value_to_aws_document(schema)
                        .context("cannot convert JSON Schema to AWS Document")?,
                ))
                .build()
                .context("cannot build Bedrock tool specification")?,
        ))
        // We have only one tool, so forcing the model to use _some_ tool
        // means it has to call ours. This is more portable than
        // SpecificToolChoice.
        .tool_choice(ToolChoice::Any(AnyToolChoice::builder().build()))
        .build()
        .context("cannot build Bedrock tool configuration")
}

/// Pull the tool-call input out of a forced-tool response.
fn extract_tool_input(
    output: &aws_sdk_bedrockruntime::operation::converse::ConverseOutput,
) -> LlmRetryResult<Value> {
    let converse_output = try_retry!(
        output
            .output()
            .ok_or_else(|| anyhow!("Bedrock response did not contain any output"))
            .or_transient()
    );
    let message = try_retry!(
        converse_output
            .as_message()
            .map_err(|_| anyhow!("Bedrock response did not contain a message"))
            .or_transient()
    );
    let blocks = message.content();
    if blocks.len() != 1 {
        return retry_transient(anyhow!(
            "Bedrock response contained {} content blocks, expected 1",
            blocks.len()
        ));
    }
    if let ContentBlock::ToolUse(tool_use) = &blocks[0] {
        if tool_use.name != OUTPUT_TOOL_NAME {
            return retry_transient(anyhow!(
                "Bedrock response contained unexpected tool name: {}",
                tool_use.name
            ));
        }
        let value = try_retry!(aws_document_to_value(&tool_use.input).or_transient());
        debug!(%value, "response");
        retry_ok(value)
    } else {
        retry_transient(anyhow!(
            "Bedrock response contained unexpected content block: {blocks:?}"
        ))
    }
}

fn usage_counts(
    usage: Option<&aws_sdk_bedrockruntime::types::TokenUsage>,
) -> (u64, u64) {
    usage
        .map(|usage| {
            (
                u64::try_from(usage.input_tokens).unwrap_or(0),
                u64::try_from(usage.output_tokens).unwrap_or(0),
            )
        })
        .unwrap_or((0, 0))
}

/// Convert neutral messages into a Bedrock system block plus user messages.
fn to_bedrock_messages(
    messages: &[Message],
) -> Result<(Option<SystemContentBlock>, Vec<BedrockMessage>)> {
    let mut system = None;
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            Message::System(text) => {
                system = Some(SystemContentBlock::Text(text.clone()));
            }
            Message::User { text, images } => {
                let mut builder = BedrockMessage::builder().role(ConversationRole::User);
                for image in images {
                    let (mime_type, data) = parse_data_url(image).ok_or_else(|| {
                        anyhow!("only data URLs are supported for Bedrock images")
                    })?;
                    let format = mime_type.strip_prefix("image/").unwrap_or(&mime_type);
                    let decoded = BASE64_STANDARD
                        .decode(data)
                        .context("cannot decode base64 image data")?;
                    let image_block = ImageBlock::builder()
                        .format(ImageFormat::try_parse(format)?)
                        .source(ImageSource::Bytes(Blob::new(decoded)))
                        .build()
                        .context("cannot build Bedrock image block")?;
                    builder = builder.content(ContentBlock::Image(image_block));
                }
                match text {
                    Some(text) if !text.trim().is_empty() => {
                        builder = builder.content(ContentBlock::Text(text.clone()));
                    }
                    _ if images.is_empty() => {
                        // The Bedrock models we've tested return errors for
                        // blank user messages, so bail on them now.
                        return Err(anyhow!("user message has no usable content"));
                    }
                    _ => {}
                }
                out.push(builder.build().context("cannot build Bedrock message")?);
            }
        }
    }
    Ok((system, out))
}

/// Convert a [`serde_json::Value`] into an [`aws_smithy_types::Document`].
fn value_to_aws_document(value: &Value) -> Result<Document> {
    match value {
        Value::Object(map) => {
            let mut obj = HashMap::new();
            for (key, val) in map {
                obj.insert(key.clone(), value_to_aws_document(val)?);
            }
            Ok(Document::Object(obj))
        }
        Value::Array(arr) => {
            let docs = arr
                .iter()
                .map(value_to_aws_document)
                .collect::<Result<Vec<_>>>()?;
            Ok(Document::from(docs))
        }
        Value::Null => Ok(Document::Null),
        Value::Bool(b) => Ok(Document::from(*b)),
        Value::String(s) => Ok(Document::from(s.clone())),
        Value::Number(num) => {
            if let Some(i) = num.as_i64() {
                Ok(Document::from(i))
            } else if let Some(u) = num.as_u64() {
                Ok(Document::from(u))
            } else if let Some(f) = num.as_f64() {
                Ok(Document::from(f))
            } else {
                Err(anyhow!("unsupported number type: {}", num))
            }
        }
    }
}

/// Convert an [`aws_smithy_types::Document`] into a [`serde_json::Value`].
fn aws_document_to_value(doc: &Document) -> Result<Value> {
    match doc {
        Document::Object(map) => {
            let mut obj = serde_json::Map::new();
            for (key, val) in map {
                obj.insert(key.clone(), aws_document_to_value(val)?);
            }
            Ok(Value::Object(obj))
        }
        Document::Array(arr) => {
            let vals = arr
                .iter()
                .map(aws_document_to_value)
                .collect::<Result<Vec<_>>>()?;
            Ok(Value::Array(vals))
        }
        Document::Null => Ok(Value::Null),
        Document::Bool(b) => Ok(Value::Bool(*b)),
        Document::String(s) => Ok(Value::String(s.clone())),
        Document::Number(num) => match num {
            Number::PosInt(value) => {
                Ok(Value::Number(serde_json::Number::from(*value)))
            }
            Number::NegInt(value) => {
                Ok(Value::Number(serde_json::Number::from(*value)))
            }
            Number::Float(value) => Ok(Value::Number(
                serde_json::Number::from_f64(*value).ok_or_else(|| {
                    anyhow!("cannot convert f64 to JSON number: {}", value)
                })?,
            )),
        },
    }
}

impl IsKnownTransient for ConverseError {
    fn is_known_transient(&self) -> bool {
        matches!(
            self,
            ConverseError::InternalServerException(_)
                | ConverseError::ModelNotReadyException(_)
                | ConverseError::ModelTimeoutException(_)
                | ConverseError::ServiceUnavailableException(_)
                | ConverseError::ThrottlingException(_)
        )
    }
}

impl<E, R> IsKnownTransient for SdkError<E, R>
where
    E: IsKnownTransient,
{
    fn is_known_transient(&self) -> bool {
        match self {
            SdkError::ServiceError(context) => context.err().is_known_transient(),
            // Network-level failures are worth another attempt.
            SdkError::TimeoutError(_)
            | SdkError::DispatchFailure(_)
            | SdkError::ResponseError(_) => true,
            _ => false,
        }
    }
}

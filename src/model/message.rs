//! Provider-neutral chat messages.
//!
//! Each adapter converts these into its own wire format (OpenAI-style JSON
//! here, Converse blocks in the Bedrock adapter, `Content` values in the
//! Vertex adapter). Images always precede text inside a user message, and
//! the format-carryover context always precedes the rest of the text, so
//! every provider sees the same part ordering.

use crate::{
    data_url::data_url,
    model::{ExtractionRequest, OcrRequest},
    prelude::*,
    prompts::{DEFAULT_EXTRACTION_PROMPT, DEFAULT_OCR_PROMPT, consistency_prompt},
};

/// A message, independent of any provider's wire format.
#[derive(Clone, Debug)]
pub enum Message {
    /// The system (aka "developer") prompt.
    System(String),

    /// A user message: optional text, plus images as `data:` URLs.
    User {
        text: Option<String>,
        images: Vec<String>,
    },
}

/// Build the message list for an OCR call.
pub fn build_ocr_messages(request: &OcrRequest) -> Vec<Message> {
    let system = request
        .prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_OCR_PROMPT.to_owned());
    let carryover = match (&request.prior_page, request.maintain_format) {
        (Some(prior), true) if !prior.is_empty() => Some(consistency_prompt(prior)),
        _ => None,
    };
    let images = request
        .buffers
        .iter()
        .map(|buffer| data_url("image/png", buffer))
        .collect();
    vec![
        Message::System(system),
        Message::User {
            text: carryover,
            images,
        },
    ]
}

/// Build the message list for an extraction call.
pub fn build_extraction_messages(request: &ExtractionRequest) -> Vec<Message> {
    let system = request
        .prompt
        .clone()
        .unwrap_or_else(|| DEFAULT_EXTRACTION_PROMPT.to_owned());
    let images = request
        .image_buffers
        .iter()
        .map(|buffer| data_url("image/png", buffer))
        .collect();
    vec![
        Message::System(system),
        Message::User {
            text: request.text.clone(),
            images,
        },
    ]
}

/// Convert messages to the OpenAI chat-completion JSON shape.
pub fn to_openai_messages(messages: &[Message]) -> Result<Value> {
    let mut out = Vec::with_capacity(messages.len());
    for message in messages {
        match message {
            Message::System(text) => out.push(json!({
                "role": "system",
                "content": text,
            })),
            Message::User { text: None, images } if images.is_empty() => {
                return Err(anyhow!("user message must have either text or images"));
            }
            Message::User {
                text: Some(text),
                images,
            } if images.is_empty() => out.push(json!({
                "role": "user",
                "content": text,
            })),
            Message::User { text, images } => {
                let mut parts = Vec::with_capacity(1 + images.len());
                for image in images {
                    parts.push(json!({
                        "type": "image_url",
                        "image_url": { "url": image },
                    }));
                }
                if let Some(text) = text {
                    parts.push(json!({ "type": "text", "text": text }));
                }
                out.push(json!({ "role": "user", "content": parts }));
            }
        }
    }
    Ok(Value::Array(out))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ocr_messages_carry_the_prior_page() {
        let request = OcrRequest {
            buffers: vec![vec![1, 2, 3]],
            maintain_format: true,
            prior_page: Some("# Page one".into()),
            prompt: None,
        };
        let messages = build_ocr_messages(&request);
        let Message::User { text, images } = &messages[1] else {
            panic!("expected a user message");
        };
        assert_eq!(images.len(), 1);
        assert!(text.as_deref().unwrap().contains("# Page one"));
    }

    #[test]
    fn no_carryover_without_maintain_format() {
        let request = OcrRequest {
            buffers: vec![vec![1]],
            maintain_format: false,
            prior_page: Some("# Page one".into()),
            prompt: None,
        };
        let messages = build_ocr_messages(&request);
        let Message::User { text, .. } = &messages[1] else {
            panic!("expected a user message");
        };
        assert!(text.is_none());
    }

    #[test]
    fn openai_conversion_puts_images_before_text() {
        let messages = vec![
            Message::System("sys".into()),
            Message::User {
                text: Some("caption".into()),
                images: vec!["data:image/png;base64,QUJD".into()],
            },
        ];
        let value = to_openai_messages(&messages).unwrap();
        let parts = value[1]["content"].as_array().unwrap();
        assert_eq!(parts[0]["type"], "image_url");
        assert_eq!(parts[1]["type"], "text");
    }

    #[test]
    fn empty_user_messages_are_rejected() {
        let messages = vec![Message::User {
            text: None,
            images: vec![],
        }];
        assert!(to_openai_messages(&messages).is_err());
    }
}

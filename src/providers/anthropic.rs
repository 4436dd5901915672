//! Anthropic adapter: the Messages API with a base64 image source block.

use std::time::Instant;

use async_trait::async_trait;
use base64::Engine;
use bytes::Bytes;
use reqwest::Client;
use serde::{Deserialize, Serialize};

use super::{
    image_mime_type, model_rates, AdapterError, AdapterResponse, ModelAdapter, ModelConfig,
    ModelRates, ProviderKind,
};

const ANTHROPIC_API_BASE: &str = "https://api.anthropic.com";
const ANTHROPIC_VERSION: &str = "2023-06-01";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
struct MessagesRequest {
    model: String,
    max_tokens: u32,
    temperature: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    system: Option<String>,
    messages: Vec<Message>,
}

#[derive(Debug, Serialize)]
struct Message {
    role: String,
    content: Vec<ContentBlock>,
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ContentBlock {
    Image { source: ImageSource },
    Text { text: String },
}

#[derive(Debug, Serialize)]
struct ImageSource {
    r#type: String,
    media_type: String,
    data: String,
}

#[derive(Debug, Deserialize)]
struct MessagesResponse {
    #[serde(default)]
    content: Vec<ResponseBlock>,
    stop_reason: Option<String>,
    usage: Option<Usage>,
}

#[derive(Debug, Deserialize)]
struct ResponseBlock {
    #[serde(rename = "type")]
    kind: String,
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Usage {
    input_tokens: Option<u64>,
    output_tokens: Option<u64>,
}

// ============================================================================
// Adapter
// ============================================================================

pub struct AnthropicAdapter {
    client: Client,
    config: ModelConfig,
    api_key: String,
    rates: ModelRates,
    base_url: String,
}

impl AnthropicAdapter {
    pub fn new(client: Client, config: ModelConfig) -> Result<Self, AdapterError> {
        let api_key = config.resolve_api_key()?;
        let rates = model_rates(ProviderKind::Anthropic, &config.model_name);
        Ok(AnthropicAdapter {
            client,
            config,
            api_key,
            rates,
            base_url: ANTHROPIC_API_BASE.to_string(),
        })
    }
}

#[async_trait]
impl ModelAdapter for AnthropicAdapter {
    async fn invoke(
        &self,
        system_message: Option<&str>,
        prompt: &str,
        image: &Bytes,
    ) -> Result<AdapterResponse, AdapterError> {
        let request = build_request(&self.config, system_message, prompt, image);
        let url = format!("{}/v1/messages", self.base_url);

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&request)
            .send()
            .await
            .map_err(AdapterError::from_request_error)?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(AdapterError::from_request_error)?;
        if !status.is_success() {
            return Err(AdapterError::from_status(status, &body));
        }

        let latency_ms = start.elapsed().as_millis() as u64;
        parse_response(&body, latency_ms, self.rates)
    }
}

fn build_request(
    config: &ModelConfig,
    system_message: Option<&str>,
    prompt: &str,
    image: &[u8],
) -> MessagesRequest {
    let data = base64::engine::general_purpose::STANDARD.encode(image);

    MessagesRequest {
        model: config.model_name.clone(),
        max_tokens: config.max_tokens,
        temperature: config.temperature,
        system: system_message.map(|s| s.to_string()),
        messages: vec![Message {
            role: "user".to_string(),
            // Image first, instruction after: matches the documented layout
            // for single-image vision prompts.
            content: vec![
                ContentBlock::Image {
                    source: ImageSource {
                        r#type: "base64".to_string(),
                        media_type: image_mime_type(image).to_string(),
                        data,
                    },
                },
                ContentBlock::Text {
                    text: prompt.to_string(),
                },
            ],
        }],
    }
}

fn parse_response(
    body: &str,
    latency_ms: u64,
    rates: ModelRates,
) -> Result<AdapterResponse, AdapterError> {
    let parsed: MessagesResponse = serde_json::from_str(body)
        .map_err(|e| AdapterError::Unknown(format!("unparseable Anthropic response: {e}")))?;

    let text: String = parsed
        .content
        .iter()
        .filter(|b| b.kind == "text")
        .filter_map(|b| b.text.as_deref())
        .collect::<Vec<_>>()
        .join("");
    if text.is_empty() {
        let reason = parsed
            .stop_reason
            .unwrap_or_else(|| "unspecified".to_string());
        return Err(AdapterError::Unknown(format!(
            "Anthropic returned no text (stop reason: {reason})"
        )));
    }

    let (input_tokens, output_tokens) = parsed
        .usage
        .map(|u| (u.input_tokens, u.output_tokens))
        .unwrap_or((None, None));
    let cost = if input_tokens.is_some() || output_tokens.is_some() {
        Some(rates.cost(input_tokens.unwrap_or(0), output_tokens.unwrap_or(0)))
    } else {
        None
    };

    Ok(AdapterResponse {
        text,
        latency_ms,
        input_tokens,
        output_tokens,
        cost,
    })
}

// ============================================================================
// Tests
// ============================================================================

//! Gemini adapter: `generateContent` over the Generative Language REST API.
//!
//! The image rides inside the user turn as an `inlineData` part (base64 +
//! sniffed MIME type); an optional `systemInstruction` block carries the
//! chain's system message.

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

const GEMINI_API_BASE: &str = "https://generativelanguage.googleapis.com/v1beta";

// ============================================================================
// Wire types
// ============================================================================

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest {
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction>,
    contents: Vec<Content>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct SystemInstruction {
    parts: Vec<TextPart>,
}

#[derive(Debug, Serialize)]
struct TextPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct Content {
    role: String,
    parts: Vec<Part>,
}

#[derive(Debug, Serialize)]
#[serde(untagged)]
enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineData,
    },
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    max_output_tokens: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Candidate {
    content: Option<CandidateContent>,
    finish_reason: Option<String>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UsageMetadata {
    prompt_token_count: Option<u64>,
    candidates_token_count: Option<u64>,
}

// ============================================================================
// Adapter
// ============================================================================

pub struct GeminiAdapter {
    client: Client,
    config: ModelConfig,
    api_key: String,
    rates: ModelRates,
    base_url: String,
}

impl GeminiAdapter {
    pub fn new(client: Client, config: ModelConfig) -> Result<Self, AdapterError> {
        let api_key = config.resolve_api_key()?;
        let rates = model_rates(ProviderKind::Gemini, &config.model_name);
        Ok(GeminiAdapter {
            client,
            config,
            api_key,
            rates,
            base_url: GEMINI_API_BASE.to_string(),
        })
    }
}

#[async_trait]
impl ModelAdapter for GeminiAdapter {
    async fn invoke(
        &self,
        system_message: Option<&str>,
        prompt: &str,
        image: &Bytes,
    ) -> Result<AdapterResponse, AdapterError> {
        let request = build_request(&self.config, system_message, prompt, image);
        let url = format!(
            "{}/models/{}:generateContent",
            self.base_url, self.config.model_name
        );

        let start = Instant::now();
        let response = self
            .client
            .post(&url)
            .header("x-goog-api-key", &self.api_key)
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
) -> GenerateRequest {
    let data = base64::engine::general_purpose::STANDARD.encode(image);

    GenerateRequest {
        system_instruction: system_message.map(|text| SystemInstruction {
            parts: vec![TextPart {
                text: text.to_string(),
            }],
        }),
        contents: vec![Content {
            role: "user".to_string(),
            parts: vec![
                Part::Text {
                    text: prompt.to_string(),
                },
                Part::InlineData {
                    inline_data: InlineData {
                        mime_type: image_mime_type(image).to_string(),
                        data,
                    },
                },
            ],
        }],
        generation_config: GenerationConfig {
            temperature: config.temperature,
            max_output_tokens: config.max_tokens,
        },
    }
}

fn parse_response(
    body: &str,
    latency_ms: u64,
    rates: ModelRates,
) -> Result<AdapterResponse, AdapterError> {
    let parsed: GenerateResponse = serde_json::from_str(body)
        .map_err(|e| AdapterError::Unknown(format!("unparseable Gemini response: {e}")))?;

    let Candidate {
        content,
        finish_reason,
    } = parsed
        .candidates
        .into_iter()
        .next()
        .ok_or_else(|| AdapterError::Unknown("Gemini response has no candidates".to_string()))?;

    let text: String = content
        .map(|c| {
            c.parts
                .into_iter()
                .filter_map(|p| p.text)
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();
    if text.is_empty() {
        // A safety block or token-limit stop leaves no text parts.
        let reason = finish_reason.unwrap_or_else(|| "unspecified".to_string());
        return Err(AdapterError::Unknown(format!(
            "Gemini returned no text (finish reason: {reason})"
        )));
    }

    let (input_tokens, output_tokens) = parsed
        .usage_metadata
        .map(|u| (u.prompt_token_count, u.candidates_token_count))
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

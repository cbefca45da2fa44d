//! Gemini-style inference provider client
//!
//! Speaks the generateContent / streamGenerateContent HTTP API. Error
//! responses are mapped into the provider error taxonomy; 429 payloads are
//! carried raw so the quota violation parser can dig into them.

use async_trait::async_trait;
use futures::StreamExt;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::time::Duration;

use crate::config::ProviderConfig;

use super::{GenerateRequest, GenerateResponse, InferenceProvider, ProviderError};

/// Gemini API client
pub struct GeminiClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

#[derive(Debug, Serialize)]
struct ApiRequest {
    contents: Vec<ApiContent>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Debug, Serialize)]
struct ApiContent {
    parts: Vec<ApiPart>,
}

#[derive(Debug, Serialize)]
struct ApiPart {
    text: String,
}

#[derive(Debug, Serialize)]
struct GenerationConfig {
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    response_mime_type: Option<String>,
    #[serde(rename = "responseSchema", skip_serializing_if = "Option::is_none")]
    response_schema: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct ApiResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
    #[serde(rename = "usageMetadata")]
    usage_metadata: Option<UsageMetadata>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    text: Option<String>,
}

#[derive(Debug, Deserialize)]
struct UsageMetadata {
    #[serde(rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

impl ApiResponse {
    fn text(&self) -> String {
        self.candidates
            .first()
            .and_then(|c| c.content.as_ref())
            .map(|content| {
                content
                    .parts
                    .iter()
                    .filter_map(|p| p.text.as_deref())
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default()
    }
}

impl GeminiClient {
    /// Create a client from provider configuration
    pub fn new(config: &ProviderConfig) -> Result<Self, ProviderError> {
        if config.api_key.is_empty() {
            return Err(ProviderError::NotConfigured(
                "GEMINI_API_KEY is not set".to_string(),
            ));
        }

        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    /// Check if the provider endpoint is reachable
    pub async fn is_available(&self) -> bool {
        let url = format!("{}/v1beta/models?key={}", self.endpoint, self.api_key);
        self.client.get(&url).send().await.is_ok()
    }

    fn body_for(request: &GenerateRequest) -> ApiRequest {
        let generation_config = if request.response_schema.is_some()
            || request.response_mime_type.is_some()
        {
            Some(GenerationConfig {
                response_mime_type: request.response_mime_type.clone(),
                response_schema: request.response_schema.clone(),
            })
        } else {
            None
        };

        ApiRequest {
            contents: vec![ApiContent {
                parts: vec![ApiPart {
                    text: request.prompt.clone(),
                }],
            }],
            generation_config,
        }
    }

    fn map_send_error(err: reqwest::Error) -> ProviderError {
        if err.is_timeout() {
            ProviderError::Timeout
        } else {
            ProviderError::Http(err)
        }
    }

    /// Map a non-success response into the error taxonomy
    fn map_error_response(status: u16, body: &str) -> ProviderError {
        let payload: Value = serde_json::from_str(body).unwrap_or(Value::Null);
        let message = payload
            .get("error")
            .and_then(|e| e.get("message"))
            .and_then(Value::as_str)
            .unwrap_or(body)
            .to_string();
        let api_status = payload
            .get("error")
            .and_then(|e| e.get("status"))
            .and_then(Value::as_str)
            .unwrap_or("");

        if status == 429 {
            ProviderError::QuotaRejected { payload }
        } else if status == 503 || api_status == "UNAVAILABLE" || message.contains("overloaded") {
            ProviderError::Overloaded { message }
        } else {
            ProviderError::RequestFailed { status, message }
        }
    }

    async fn generate_once(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent?key={}",
            self.endpoint, request.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&Self::body_for(request))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_error_response(status.as_u16(), &body));
        }

        let parsed: ApiResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let text = parsed.text();
        if text.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "response contained no candidate text".to_string(),
            ));
        }

        Ok(GenerateResponse {
            text,
            total_tokens: parsed
                .usage_metadata
                .as_ref()
                .and_then(|u| u.total_token_count),
        })
    }

    async fn generate_streaming(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        let url = format!(
            "{}/v1beta/models/{}:streamGenerateContent?alt=sse&key={}",
            self.endpoint, request.model, self.api_key
        );

        let response = self
            .client
            .post(&url)
            .json(&Self::body_for(request))
            .send()
            .await
            .map_err(Self::map_send_error)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::map_error_response(status.as_u16(), &body));
        }

        let mut text = String::new();
        let mut total_tokens = None;
        let mut buffer = String::new();
        let mut stream = response.bytes_stream();

        while let Some(chunk) = stream.next().await {
            let chunk = chunk.map_err(Self::map_send_error)?;
            buffer.push_str(&String::from_utf8_lossy(&chunk));

            // SSE frames are newline-delimited; keep the trailing partial
            // line in the buffer for the next chunk.
            while let Some(pos) = buffer.find('\n') {
                let line = buffer[..pos].trim().to_string();
                buffer.drain(..=pos);

                let Some(data) = line.strip_prefix("data:") else {
                    continue;
                };
                match serde_json::from_str::<ApiResponse>(data.trim()) {
                    Ok(frame) => {
                        text.push_str(&frame.text());
                        if let Some(tokens) = frame
                            .usage_metadata
                            .as_ref()
                            .and_then(|u| u.total_token_count)
                        {
                            total_tokens = Some(tokens);
                        }
                    }
                    Err(err) => {
                        tracing::trace!(error = %err, "skipping unparseable SSE frame");
                    }
                }
            }
        }

        if text.is_empty() {
            return Err(ProviderError::InvalidResponse(
                "stream contained no candidate text".to_string(),
            ));
        }

        Ok(GenerateResponse { text, total_tokens })
    }
}

#[async_trait]
impl InferenceProvider for GeminiClient {
    async fn generate(
        &self,
        request: &GenerateRequest,
    ) -> Result<GenerateResponse, ProviderError> {
        if request.stream {
            self.generate_streaming(request).await
        } else {
            self.generate_once(request).await
        }
    }
}

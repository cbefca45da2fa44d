//! External metadata provider client
//!
//! Given a source identifier, returns title, description, duration, view
//! count and publish timestamp. Durations arrive as ISO-8601 strings
//! (`PT20M13S`) and are parsed into seconds.

use std::sync::OnceLock;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::Client;
use serde::Deserialize;

use crate::config::MetadataConfig;
use crate::models::ContentMetadata;

use super::ProviderError;

/// The metadata provider seam
#[async_trait]
pub trait MetadataProvider: Send + Sync {
    /// Fetch metadata for one source id
    async fn fetch(&self, source_id: &str) -> Result<ContentMetadata, ProviderError>;
}

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^P(?:(\d+)D)?(?:T(?:(\d+)H)?(?:(\d+)M)?(?:(\d+)S)?)?$").expect("static regex")
    })
}

/// Parse an ISO-8601-style duration (`PT1H2M3S`) into seconds
pub fn parse_iso8601_duration(raw: &str) -> Option<u32> {
    let caps = duration_re().captures(raw)?;

    let part = |i: usize| -> u32 {
        caps.get(i)
            .and_then(|m| m.as_str().parse::<u32>().ok())
            .unwrap_or(0)
    };

    let days = part(1);
    let hours = part(2);
    let minutes = part(3);
    let seconds = part(4);

    // A bare "P" carries no information
    if caps.get(1).is_none()
        && caps.get(2).is_none()
        && caps.get(3).is_none()
        && caps.get(4).is_none()
    {
        return None;
    }

    Some(days * 86_400 + hours * 3_600 + minutes * 60 + seconds)
}

#[derive(Debug, Deserialize)]
struct VideoListResponse {
    #[serde(default)]
    items: Vec<VideoItem>,
}

#[derive(Debug, Deserialize)]
struct VideoItem {
    snippet: Option<Snippet>,
    #[serde(rename = "contentDetails")]
    content_details: Option<ContentDetails>,
    statistics: Option<Statistics>,
}

#[derive(Debug, Deserialize)]
struct Snippet {
    title: Option<String>,
    description: Option<String>,
    #[serde(rename = "publishedAt")]
    published_at: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ContentDetails {
    duration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Statistics {
    #[serde(rename = "viewCount")]
    view_count: Option<String>,
}

/// HTTP metadata provider client
pub struct HttpMetadataClient {
    client: Client,
    endpoint: String,
    api_key: String,
}

impl HttpMetadataClient {
    /// Create a client from metadata configuration
    pub fn new(config: &MetadataConfig) -> Result<Self, ProviderError> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        })
    }

    fn item_to_metadata(source_id: &str, item: VideoItem) -> Result<ContentMetadata, ProviderError> {
        let snippet = item.snippet.unwrap_or(Snippet {
            title: None,
            description: None,
            published_at: None,
        });

        let duration_raw = item
            .content_details
            .and_then(|d| d.duration)
            .ok_or_else(|| {
                ProviderError::InvalidResponse(format!("no duration for {source_id}"))
            })?;

        let duration_secs = parse_iso8601_duration(&duration_raw).ok_or_else(|| {
            ProviderError::InvalidResponse(format!(
                "unparseable duration '{duration_raw}' for {source_id}"
            ))
        })?;

        let view_count = item
            .statistics
            .and_then(|s| s.view_count)
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(0);

        let published_at = snippet
            .published_at
            .as_deref()
            .and_then(|raw| DateTime::parse_from_rfc3339(raw).ok())
            .map(|dt| dt.with_timezone(&Utc));

        Ok(ContentMetadata {
            title: snippet.title.unwrap_or_default(),
            description: snippet.description.unwrap_or_default(),
            duration_secs,
            view_count,
            published_at,
        })
    }
}

#[async_trait]
impl MetadataProvider for HttpMetadataClient {
    async fn fetch(&self, source_id: &str) -> Result<ContentMetadata, ProviderError> {
        let url = format!(
            "{}/videos?part=snippet,contentDetails,statistics&id={}&key={}",
            self.endpoint, source_id, self.api_key
        );

        let response = self.client.get(&url).send().await.map_err(|e| {
            if e.is_timeout() {
                ProviderError::Timeout
            } else {
                ProviderError::Http(e)
            }
        })?;

        let status = response.status();
        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(ProviderError::RequestFailed {
                status: status.as_u16(),
                message,
            });
        }

        let parsed: VideoListResponse = response
            .json()
            .await
            .map_err(|e| ProviderError::InvalidResponse(e.to_string()))?;

        let item = parsed
            .items
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(source_id.to_string()))?;

        Self::item_to_metadata(source_id, item)
    }
}

//! Configuration management for the yeoul pipeline
//!
//! This module handles loading and validating configuration from environment
//! variables, files, and command-line arguments.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::quota::Tier;

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Quota and model selection configuration
    pub quota: QuotaConfig,

    /// Pipeline configuration
    pub pipeline: PipelineConfig,

    /// Inference provider configuration
    pub provider: ProviderConfig,

    /// Metadata provider configuration
    pub metadata: MetadataConfig,

    /// Storage configuration
    pub storage: StorageConfig,

    /// Housekeeping configuration
    pub housekeeping: HousekeepingConfig,

    /// Logging configuration
    pub logging: LoggingConfig,
}

/// Quota and model selection configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QuotaConfig {
    /// Active quota tier
    pub tier: Tier,

    /// Model tried first by the selector
    pub default_model: String,

    /// Seconds an overload mark stays effective
    pub overload_timeout_secs: u64,
}

/// Research prompt definition
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResearchPrompt {
    /// Stable prompt identifier, used as part of the result key
    pub id: String,

    /// Prompt template; `{title}` and `{insights}` are substituted
    pub template: String,
}

/// Pipeline configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Chunk length in seconds for the insight fan-out
    pub chunk_seconds: u32,

    /// Maximum items pulled per readiness scan
    pub scan_page_size: usize,

    /// Seconds between readiness scans
    pub scan_interval_secs: u64,

    /// Number of metadata workers
    pub metadata_workers: usize,

    /// Number of insight workers
    pub insight_workers: usize,

    /// Number of research workers
    pub research_workers: usize,

    /// Maximum delivery attempts per task
    pub max_attempts: u32,

    /// Base delay in milliseconds for exponential retry backoff
    pub backoff_base_ms: u64,

    /// Channel buffer size for stage queues
    pub channel_buffer_size: usize,

    /// Research prompts run after insights are gathered
    pub research_prompts: Vec<ResearchPrompt>,
}

/// Inference provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    /// Provider endpoint URL
    pub endpoint: String,

    /// API key
    pub api_key: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,

    /// Use the streaming endpoint
    pub streaming: bool,
}

/// Metadata provider configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetadataConfig {
    /// Metadata endpoint URL
    pub endpoint: String,

    /// API key
    pub api_key: String,

    /// Request timeout in seconds
    pub timeout_secs: u64,
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// SQLite database path
    pub sqlite_path: PathBuf,
}

/// Housekeeping configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HousekeepingConfig {
    /// Local time of day ("HH:MM") for the daily cleanup task
    pub daily_cleanup_time: String,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    pub level: String,

    /// Log format (text, json)
    pub format: String,
}

fn default_research_prompts() -> Vec<ResearchPrompt> {
    vec![
        ResearchPrompt {
            id: "summary".to_string(),
            template: "Summarize the following insights gathered from \"{title}\" \
                       into a concise overview.\n\n{insights}"
                .to_string(),
        },
        ResearchPrompt {
            id: "key-topics".to_string(),
            template: "List the key topics covered in \"{title}\" based on these \
                       segment insights, ordered by prominence.\n\n{insights}"
                .to_string(),
        },
    ]
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let tier = std::env::var("YEOUL_TIER")
            .ok()
            .and_then(|v| Tier::parse(&v))
            .unwrap_or(Tier::Free);

        let default_model = std::env::var("YEOUL_DEFAULT_MODEL")
            .unwrap_or_else(|_| String::from("gemini-2.5-flash"));

        let overload_timeout_secs = std::env::var("YEOUL_OVERLOAD_TIMEOUT")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(300);

        let chunk_seconds = std::env::var("YEOUL_CHUNK_SECONDS")
            .ok()
            .and_then(|v| v.parse::<u32>().ok())
            .unwrap_or(300);

        let scan_page_size = std::env::var("YEOUL_SCAN_PAGE_SIZE")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .unwrap_or(50);

        let scan_interval_secs = std::env::var("YEOUL_SCAN_INTERVAL")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .unwrap_or(30);

        let provider_endpoint = std::env::var("GEMINI_ENDPOINT")
            .unwrap_or_else(|_| String::from("https://generativelanguage.googleapis.com"));

        let provider_api_key = std::env::var("GEMINI_API_KEY").unwrap_or_default();

        let metadata_endpoint = std::env::var("YEOUL_METADATA_ENDPOINT")
            .unwrap_or_else(|_| String::from("https://www.googleapis.com/youtube/v3"));

        let metadata_api_key = std::env::var("YEOUL_METADATA_API_KEY")
            .or_else(|_| std::env::var("YOUTUBE_API_KEY"))
            .unwrap_or_default();

        let sqlite_path = std::env::var("YEOUL_SQLITE_PATH")
            .unwrap_or_else(|_| String::from("data/yeoul.db"))
            .into();

        let daily_cleanup_time =
            std::env::var("YEOUL_DAILY_CLEANUP_TIME").unwrap_or_else(|_| String::from("00:05"));

        let log_level = std::env::var("YEOUL_LOG_LEVEL").unwrap_or_else(|_| String::from("info"));
        let log_format = std::env::var("YEOUL_LOG_FORMAT").unwrap_or_else(|_| String::from("text"));

        Ok(Self {
            quota: QuotaConfig {
                tier,
                default_model,
                overload_timeout_secs,
            },
            pipeline: PipelineConfig {
                chunk_seconds,
                scan_page_size,
                scan_interval_secs,
                metadata_workers: 2,
                insight_workers: 4,
                research_workers: 2,
                max_attempts: 5,
                backoff_base_ms: 2000,
                channel_buffer_size: 256,
                research_prompts: default_research_prompts(),
            },
            provider: ProviderConfig {
                endpoint: provider_endpoint,
                api_key: provider_api_key,
                timeout_secs: 120,
                streaming: false,
            },
            metadata: MetadataConfig {
                endpoint: metadata_endpoint,
                api_key: metadata_api_key,
                timeout_secs: 30,
            },
            storage: StorageConfig { sqlite_path },
            housekeeping: HousekeepingConfig { daily_cleanup_time },
            logging: LoggingConfig {
                level: log_level,
                format: log_format,
            },
        })
    }

    /// Load configuration from a file
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Self = toml::from_str(&content)
            .with_context(|| format!("Failed to parse TOML config file: {}", path.display()))?;

        Ok(config)
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.pipeline.chunk_seconds == 0 {
            anyhow::bail!("chunk_seconds must be greater than 0");
        }

        if self.pipeline.scan_page_size == 0 {
            anyhow::bail!("scan_page_size must be greater than 0");
        }

        if self.pipeline.max_attempts == 0 {
            anyhow::bail!("max_attempts must be greater than 0");
        }

        if self.quota.overload_timeout_secs == 0 {
            anyhow::bail!("overload_timeout_secs must be greater than 0");
        }

        if chrono::NaiveTime::parse_from_str(&self.housekeeping.daily_cleanup_time, "%H:%M")
            .is_err()
        {
            anyhow::bail!(
                "Invalid daily_cleanup_time '{}'. Expected HH:MM",
                self.housekeeping.daily_cleanup_time
            );
        }

        let mut seen = std::collections::HashSet::new();
        for prompt in &self.pipeline.research_prompts {
            if prompt.id.is_empty() {
                anyhow::bail!("research prompt id cannot be empty");
            }
            if !seen.insert(prompt.id.as_str()) {
                anyhow::bail!("duplicate research prompt id '{}'", prompt.id);
            }
        }

        Ok(())
    }

    /// Look up a research prompt by id
    pub fn research_prompt(&self, id: &str) -> Option<&ResearchPrompt> {
        self.pipeline.research_prompts.iter().find(|p| p.id == id)
    }
}

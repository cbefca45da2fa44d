//! Research stage: per-prompt model calls over gathered insights
//!
//! Research is tracked per (content, prompt) pair, not as a content-level
//! status: each configured prompt runs independently and upserts its own
//! result row, so a retry or re-run supersedes rather than duplicates.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, warn};

use crate::config::ResearchPrompt;
use crate::error::{Error, Result};
use crate::models::{ContentStatus, InsightRecord, ResearchResult};
use crate::storage::ContentRepository;

use super::{fail_or_retry, ModelGateway};

/// Worker for the research stage
pub struct ResearchWorker {
    content: Arc<dyn ContentRepository>,
    gateway: Arc<ModelGateway>,
    prompts: Vec<ResearchPrompt>,
    streaming: bool,
}

fn render_insights(insights: &[InsightRecord]) -> String {
    insights
        .iter()
        .map(|record| {
            format!(
                "[{}s-{}s] {}",
                record.start_secs, record.end_secs, record.insight
            )
        })
        .collect::<Vec<_>>()
        .join("\n")
}

impl ResearchWorker {
    pub fn new(
        content: Arc<dyn ContentRepository>,
        gateway: Arc<ModelGateway>,
        prompts: Vec<ResearchPrompt>,
        streaming: bool,
    ) -> Self {
        Self {
            content,
            gateway,
            prompts,
            streaming,
        }
    }

    /// Process one research task
    pub async fn handle(&self, content_id: &str, prompt_id: &str) -> Result<()> {
        let Some(item) = self.content.get(content_id)? else {
            warn!(content_id, "research task for missing entity, dropping");
            return Ok(());
        };

        if item.status != ContentStatus::InsightsGathered {
            debug!(content_id, status = %item.status, "stale research delivery, no-op");
            return Ok(());
        }

        if self.content.research_exists(content_id, prompt_id)? {
            debug!(content_id, prompt_id, "research result already stored");
            return Ok(());
        }

        let Some(prompt) = self.prompts.iter().find(|p| p.id == prompt_id) else {
            return fail_or_retry(
                self.content.as_ref(),
                content_id,
                None,
                Error::validation(format!("unknown research prompt '{prompt_id}'")),
            );
        };

        let insights = self.content.list_insights(content_id)?;
        if insights.is_empty() {
            return fail_or_retry(
                self.content.as_ref(),
                content_id,
                None,
                Error::validation(format!("no insights stored for {content_id}")),
            );
        }

        let rendered = prompt
            .template
            .replace("{title}", item.title.as_deref().unwrap_or("(untitled)"))
            .replace("{insights}", &render_insights(&insights));

        let (model, response) = match self.gateway.generate(rendered, None, self.streaming).await {
            Ok(result) => result,
            Err(err) => return fail_or_retry(self.content.as_ref(), content_id, None, err),
        };

        let structured = serde_json::from_str::<serde_json::Value>(&response.text).is_ok();
        self.content.store_research(&ResearchResult {
            content_id: content_id.to_string(),
            prompt_id: prompt_id.to_string(),
            model,
            output: response.text,
            structured,
            created_at: Utc::now(),
        })?;

        debug!(content_id, prompt_id, "research result stored");
        Ok(())
    }
}

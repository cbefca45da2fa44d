//! SQLite implementation of the store repositories
//!
//! Uses a `Mutex<Connection>` to ensure thread-safety for the SQLite
//! connection; pipeline workers call in from async tasks and the critical
//! sections are short single statements.
//!
//! The store has no native TTL, so expiring rows carry an `expires_at`
//! column swept by the daily housekeeping task.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};

use crate::models::{
    ContentItem, ContentMetadata, ContentStatus, InsightRecord, QuotaKind, QuotaViolation,
    ResearchResult,
};

use super::{ContentRepository, QuotaRepository, StoreError, StoreResult, WindowUsage};

/// SQLite-backed store implementing both repositories
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open (or create) a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StoreError::Corrupt(format!("cannot create {parent:?}: {e}")))?;
            }
        }

        let conn = Connection::open(path)?;
        Self::create_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Open an in-memory store (used by tests)
    pub fn open_in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        Self::create_schema(&conn)?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn create_schema(conn: &Connection) -> StoreResult<()> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS content_items (
                id TEXT PRIMARY KEY,
                source_id TEXT NOT NULL UNIQUE,
                title TEXT,
                description TEXT,
                duration_secs INTEGER,
                view_count INTEGER,
                published_at TEXT,
                status TEXT NOT NULL,
                discovered_at TEXT NOT NULL,
                metadata_at TEXT,
                insights_queued_at TEXT,
                insights_gathered_at TEXT,
                chunk_count INTEGER,
                last_error TEXT
            );
            CREATE INDEX IF NOT EXISTS idx_content_items_status
                ON content_items(status);

            CREATE TABLE IF NOT EXISTS quota_windows (
                model TEXT NOT NULL,
                minute_key TEXT NOT NULL,
                day_key TEXT NOT NULL,
                requests INTEGER NOT NULL DEFAULT 0,
                tokens INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (model, minute_key)
            );

            CREATE TABLE IF NOT EXISTS quota_days (
                model TEXT NOT NULL,
                day_key TEXT NOT NULL,
                requests INTEGER NOT NULL DEFAULT 0,
                expires_at TEXT NOT NULL,
                PRIMARY KEY (model, day_key)
            );

            CREATE TABLE IF NOT EXISTS quota_violations (
                id TEXT PRIMARY KEY,
                model TEXT NOT NULL,
                raw_payload TEXT,
                quota_id TEXT,
                kind TEXT NOT NULL,
                tier_label TEXT NOT NULL,
                retry_delay_secs INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                expires_at TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_quota_violations_created
                ON quota_violations(created_at);

            CREATE TABLE IF NOT EXISTS insight_records (
                content_id TEXT NOT NULL,
                chunk_index INTEGER NOT NULL,
                start_secs INTEGER NOT NULL,
                end_secs INTEGER NOT NULL,
                model TEXT NOT NULL,
                insight TEXT NOT NULL,
                structured INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (content_id, chunk_index)
            );

            CREATE TABLE IF NOT EXISTS research_results (
                content_id TEXT NOT NULL,
                prompt_id TEXT NOT NULL,
                model TEXT NOT NULL,
                output TEXT NOT NULL,
                structured INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                PRIMARY KEY (content_id, prompt_id)
            );",
        )?;
        Ok(())
    }
}

fn ts(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339()
}

fn opt_ts(dt: &Option<DateTime<Utc>>) -> Option<String> {
    dt.as_ref().map(ts)
}

fn parse_ts(s: &str) -> StoreResult<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| StoreError::Corrupt(format!("bad timestamp '{s}': {e}")))
}

fn parse_opt_ts(s: Option<String>) -> StoreResult<Option<DateTime<Utc>>> {
    s.map(|s| parse_ts(&s)).transpose()
}

fn row_to_item(row: &Row<'_>) -> rusqlite::Result<RawItem> {
    Ok(RawItem {
        id: row.get(0)?,
        source_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        duration_secs: row.get(4)?,
        view_count: row.get(5)?,
        published_at: row.get(6)?,
        status: row.get(7)?,
        discovered_at: row.get(8)?,
        metadata_at: row.get(9)?,
        insights_queued_at: row.get(10)?,
        insights_gathered_at: row.get(11)?,
        chunk_count: row.get(12)?,
        last_error: row.get(13)?,
    })
}

struct RawItem {
    id: String,
    source_id: String,
    title: Option<String>,
    description: Option<String>,
    duration_secs: Option<u32>,
    view_count: Option<u64>,
    published_at: Option<String>,
    status: String,
    discovered_at: String,
    metadata_at: Option<String>,
    insights_queued_at: Option<String>,
    insights_gathered_at: Option<String>,
    chunk_count: Option<u32>,
    last_error: Option<String>,
}

impl RawItem {
    fn into_item(self) -> StoreResult<ContentItem> {
        let status = ContentStatus::parse(&self.status)
            .ok_or_else(|| StoreError::Corrupt(format!("unknown status '{}'", self.status)))?;

        Ok(ContentItem {
            id: self.id,
            source_id: self.source_id,
            title: self.title,
            description: self.description,
            duration_secs: self.duration_secs,
            view_count: self.view_count,
            published_at: parse_opt_ts(self.published_at)?,
            status,
            discovered_at: parse_ts(&self.discovered_at)?,
            metadata_at: parse_opt_ts(self.metadata_at)?,
            insights_queued_at: parse_opt_ts(self.insights_queued_at)?,
            insights_gathered_at: parse_opt_ts(self.insights_gathered_at)?,
            chunk_count: self.chunk_count,
            last_error: self.last_error,
        })
    }
}

const ITEM_COLUMNS: &str = "id, source_id, title, description, duration_secs, view_count, \
     published_at, status, discovered_at, metadata_at, insights_queued_at, \
     insights_gathered_at, chunk_count, last_error";

impl ContentRepository for SqliteStore {
    fn insert_discovered(&self, item: &ContentItem) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO content_items
                 (id, source_id, status, discovered_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                item.id,
                item.source_id,
                item.status.as_str(),
                ts(&item.discovered_at)
            ],
        )?;
        Ok(inserted == 1)
    }

    fn get(&self, id: &str) -> StoreResult<Option<ContentItem>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM content_items WHERE id = ?1"),
                params![id],
                row_to_item,
            )
            .optional()?;
        raw.map(RawItem::into_item).transpose()
    }

    fn get_by_source(&self, source_id: &str) -> StoreResult<Option<ContentItem>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {ITEM_COLUMNS} FROM content_items WHERE source_id = ?1"),
                params![source_id],
                row_to_item,
            )
            .optional()?;
        raw.map(RawItem::into_item).transpose()
    }

    fn list_by_status(&self, status: ContentStatus, limit: usize) -> StoreResult<Vec<ContentItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM content_items
             WHERE status = ?1 ORDER BY discovered_at ASC LIMIT ?2"
        ))?;
        let rows = stmt.query_map(params![status.as_str(), limit as i64], row_to_item)?;

        let mut items = Vec::new();
        for raw in rows {
            items.push(raw?.into_item()?);
        }
        Ok(items)
    }

    fn list_all(&self, limit: usize) -> StoreResult<Vec<ContentItem>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {ITEM_COLUMNS} FROM content_items
             ORDER BY discovered_at DESC LIMIT ?1"
        ))?;
        let rows = stmt.query_map(params![limit as i64], row_to_item)?;

        let mut items = Vec::new();
        for raw in rows {
            items.push(raw?.into_item()?);
        }
        Ok(items)
    }

    fn cas_status(&self, id: &str, from: ContentStatus, to: ContentStatus) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE content_items SET status = ?1 WHERE id = ?2 AND status = ?3",
            params![to.as_str(), id, from.as_str()],
        )?;
        Ok(changed == 1)
    }

    fn store_metadata(&self, id: &str, meta: &ContentMetadata) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE content_items SET
                 title = ?1, description = ?2, duration_secs = ?3,
                 view_count = ?4, published_at = ?5,
                 status = ?6, metadata_at = ?7, last_error = NULL
             WHERE id = ?8 AND status = ?9",
            params![
                meta.title,
                meta.description,
                meta.duration_secs,
                meta.view_count,
                opt_ts(&meta.published_at),
                ContentStatus::MetadataReady.as_str(),
                ts(&Utc::now()),
                id,
                ContentStatus::Initializing.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn mark_insights_queued(&self, id: &str, chunk_count: u32) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE content_items SET
                 status = ?1, chunk_count = ?2, insights_queued_at = ?3
             WHERE id = ?4 AND status = ?5",
            params![
                ContentStatus::InsightsQueued.as_str(),
                chunk_count,
                ts(&Utc::now()),
                id,
                ContentStatus::MetadataReady.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn mark_insights_gathered(&self, id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE content_items SET status = ?1, insights_gathered_at = ?2
             WHERE id = ?3 AND status = ?4",
            params![
                ContentStatus::InsightsGathered.as_str(),
                ts(&Utc::now()),
                id,
                ContentStatus::InsightsQueued.as_str(),
            ],
        )?;
        Ok(changed == 1)
    }

    fn mark_failed(&self, id: &str, error: &str) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE content_items SET status = ?1, last_error = ?2
             WHERE id = ?3 AND status != ?1",
            params![ContentStatus::Failed.as_str(), error, id],
        )?;
        Ok(())
    }

    fn reset_to_metadata_ready(&self, id: &str) -> StoreResult<bool> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let changed = tx.execute(
            "UPDATE content_items SET
                 status = ?1, insights_queued_at = NULL,
                 insights_gathered_at = NULL, chunk_count = NULL,
                 last_error = NULL
             WHERE id = ?2 AND metadata_at IS NOT NULL",
            params![ContentStatus::MetadataReady.as_str(), id],
        )?;

        if changed == 1 {
            tx.execute(
                "DELETE FROM insight_records WHERE content_id = ?1",
                params![id],
            )?;
            tx.execute(
                "DELETE FROM research_results WHERE content_id = ?1",
                params![id],
            )?;
        }

        tx.commit()?;
        Ok(changed == 1)
    }

    fn store_insight(&self, record: &InsightRecord) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO insight_records
                 (content_id, chunk_index, start_secs, end_secs, model,
                  insight, structured, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(content_id, chunk_index) DO UPDATE SET
                 model = excluded.model,
                 insight = excluded.insight,
                 structured = excluded.structured,
                 created_at = excluded.created_at",
            params![
                record.content_id,
                record.chunk_index,
                record.start_secs,
                record.end_secs,
                record.model,
                record.insight,
                record.structured as i32,
                ts(&record.created_at),
            ],
        )?;
        Ok(())
    }

    fn insight_exists(&self, content_id: &str, chunk_index: u32) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM insight_records
             WHERE content_id = ?1 AND chunk_index = ?2",
            params![content_id, chunk_index],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn insight_count(&self, content_id: &str) -> StoreResult<u32> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM insight_records WHERE content_id = ?1",
            params![content_id],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    fn list_insights(&self, content_id: &str) -> StoreResult<Vec<InsightRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT content_id, chunk_index, start_secs, end_secs, model,
                    insight, structured, created_at
             FROM insight_records WHERE content_id = ?1 ORDER BY chunk_index",
        )?;
        let rows = stmt.query_map(params![content_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, u32>(1)?,
                row.get::<_, u32>(2)?,
                row.get::<_, u32>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, i32>(6)?,
                row.get::<_, String>(7)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (content_id, chunk_index, start_secs, end_secs, model, insight, structured, created) =
                row?;
            records.push(InsightRecord {
                content_id,
                chunk_index,
                start_secs,
                end_secs,
                model,
                insight,
                structured: structured != 0,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(records)
    }

    fn store_research(&self, record: &ResearchResult) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO research_results
                 (content_id, prompt_id, model, output, structured, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(content_id, prompt_id) DO UPDATE SET
                 model = excluded.model,
                 output = excluded.output,
                 structured = excluded.structured,
                 created_at = excluded.created_at",
            params![
                record.content_id,
                record.prompt_id,
                record.model,
                record.output,
                record.structured as i32,
                ts(&record.created_at),
            ],
        )?;
        Ok(())
    }

    fn research_exists(&self, content_id: &str, prompt_id: &str) -> StoreResult<bool> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM research_results
             WHERE content_id = ?1 AND prompt_id = ?2",
            params![content_id, prompt_id],
            |row| row.get(0),
        )?;
        Ok(count > 0)
    }

    fn list_research(&self, content_id: &str) -> StoreResult<Vec<ResearchResult>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT content_id, prompt_id, model, output, structured, created_at
             FROM research_results WHERE content_id = ?1 ORDER BY prompt_id",
        )?;
        let rows = stmt.query_map(params![content_id], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, String>(2)?,
                row.get::<_, String>(3)?,
                row.get::<_, i32>(4)?,
                row.get::<_, String>(5)?,
            ))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (content_id, prompt_id, model, output, structured, created) = row?;
            records.push(ResearchResult {
                content_id,
                prompt_id,
                model,
                output,
                structured: structured != 0,
                created_at: parse_ts(&created)?,
            });
        }
        Ok(records)
    }
}

impl QuotaRepository for SqliteStore {
    fn increment_usage(
        &self,
        model: &str,
        minute_key: &str,
        day_key: &str,
        tokens: u64,
        expires_at: DateTime<Utc>,
    ) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        let expires = ts(&expires_at);

        conn.execute(
            "INSERT INTO quota_windows (model, minute_key, day_key, requests, tokens, expires_at)
             VALUES (?1, ?2, ?3, 1, ?4, ?5)
             ON CONFLICT(model, minute_key) DO UPDATE SET
                 requests = requests + 1,
                 tokens = tokens + excluded.tokens,
                 expires_at = excluded.expires_at",
            params![model, minute_key, day_key, tokens, expires],
        )?;

        conn.execute(
            "INSERT INTO quota_days (model, day_key, requests, expires_at)
             VALUES (?1, ?2, 1, ?3)
             ON CONFLICT(model, day_key) DO UPDATE SET
                 requests = requests + 1,
                 expires_at = excluded.expires_at",
            params![model, day_key, expires],
        )?;

        Ok(())
    }

    fn window_usage(&self, model: &str, minute_key: &str) -> StoreResult<WindowUsage> {
        let conn = self.conn.lock().unwrap();
        let usage = conn
            .query_row(
                "SELECT requests, tokens FROM quota_windows
                 WHERE model = ?1 AND minute_key = ?2",
                params![model, minute_key],
                |row| {
                    Ok(WindowUsage {
                        requests: row.get(0)?,
                        tokens: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(usage.unwrap_or_default())
    }

    fn daily_usage(&self, model: &str, day_key: &str) -> StoreResult<u32> {
        let conn = self.conn.lock().unwrap();
        let requests: Option<u32> = conn
            .query_row(
                "SELECT requests FROM quota_days WHERE model = ?1 AND day_key = ?2",
                params![model, day_key],
                |row| row.get(0),
            )
            .optional()?;
        Ok(requests.unwrap_or(0))
    }

    fn record_violation(&self, violation: &QuotaViolation) -> StoreResult<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO quota_violations
                 (id, model, raw_payload, quota_id, kind, tier_label,
                  retry_delay_secs, created_at, expires_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                violation.id,
                violation.model,
                violation.raw_payload,
                violation.quota_id,
                violation.kind.as_str(),
                violation.tier_label,
                violation.retry_delay_secs,
                ts(&violation.created_at),
                ts(&violation.expires_at),
            ],
        )?;
        Ok(())
    }

    fn recent_violations(&self, limit: usize) -> StoreResult<Vec<QuotaViolation>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, model, raw_payload, quota_id, kind, tier_label,
                    retry_delay_secs, created_at, expires_at
             FROM quota_violations ORDER BY created_at DESC LIMIT ?1",
        )?;
        let rows = stmt.query_map(params![limit as i64], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, String>(1)?,
                row.get::<_, Option<String>>(2)?,
                row.get::<_, Option<String>>(3)?,
                row.get::<_, String>(4)?,
                row.get::<_, String>(5)?,
                row.get::<_, u64>(6)?,
                row.get::<_, String>(7)?,
                row.get::<_, String>(8)?,
            ))
        })?;

        let mut violations = Vec::new();
        for row in rows {
            let (id, model, raw_payload, quota_id, kind, tier_label, retry, created, expires) =
                row?;
            violations.push(QuotaViolation {
                id,
                model,
                raw_payload,
                quota_id,
                kind: QuotaKind::parse(&kind)
                    .ok_or_else(|| StoreError::Corrupt(format!("unknown quota kind '{kind}'")))?,
                tier_label,
                retry_delay_secs: retry,
                created_at: parse_ts(&created)?,
                expires_at: parse_ts(&expires)?,
            });
        }
        Ok(violations)
    }

    fn sweep_expired(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let conn = self.conn.lock().unwrap();
        let cutoff = ts(&now);

        let mut removed = 0;
        removed += conn.execute(
            "DELETE FROM quota_windows WHERE expires_at < ?1",
            params![cutoff],
        )?;
        removed += conn.execute(
            "DELETE FROM quota_days WHERE expires_at < ?1",
            params![cutoff],
        )?;
        removed += conn.execute(
            "DELETE FROM quota_violations WHERE expires_at < ?1",
            params![cutoff],
        )?;

        Ok(removed)
    }
}

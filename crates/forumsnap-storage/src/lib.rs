//! Snapshot store (SQLite via sqlx) + HTTP fetch utilities for forumsnap.

use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::Utc;
use forumsnap_core::{ChannelTag, ThreadRecord};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::Serialize;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::{Executor, Sqlite, Transaction};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info, info_span, Instrument};

pub const CRATE_NAME: &str = "forumsnap-storage";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

/// Thread row as read back from `discord_threads`.
#[derive(Debug, Clone, PartialEq, Serialize, sqlx::FromRow)]
pub struct StoredThread {
    pub thread_id: String,
    pub thread_name: String,
    pub topic: Option<String>,
    pub owner_id: Option<String>,
    pub owner_nickname: Option<String>,
    pub parent_id: Option<String>,
    pub member_count: Option<i64>,
    pub message_count: Option<i64>,
    pub available_tags: Option<String>,
    pub applied_tags: Option<String>,
    pub thread_metadata: Option<String>,
    pub created_timestamp: Option<i64>,
    pub last_updated: i64,
}

#[derive(Debug, Clone)]
pub struct ThreadStore {
    pool: SqlitePool,
}

impl ThreadStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .busy_timeout(Duration::from_secs(5));
        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(options)
            .await?;
        Ok(Self { pool })
    }

    /// Single-connection in-memory store. The data lives as long as the store.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        Ok(Self { pool })
    }

    pub async fn migrate(&self) -> Result<(), StoreError> {
        sqlx::migrate!("../../migrations").run(&self.pool).await?;
        Ok(())
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }

    /// Open the write transaction for one run. Dropping the writer without
    /// calling [`SnapshotWriter::commit`] rolls everything back.
    pub async fn begin_snapshot(&self) -> Result<SnapshotWriter, StoreError> {
        let tx = self.pool.begin().await?;
        Ok(SnapshotWriter { tx })
    }

    pub async fn list_threads(
        &self,
        parent_id: Option<&str>,
    ) -> Result<Vec<StoredThread>, StoreError> {
        let rows = sqlx::query_as::<_, StoredThread>(
            r#"
            SELECT thread_id, thread_name, topic, owner_id, owner_nickname, parent_id,
                   member_count, message_count, available_tags, applied_tags,
                   thread_metadata, created_timestamp, last_updated
              FROM discord_threads
             WHERE ?1 IS NULL OR parent_id = ?1
             ORDER BY last_updated DESC, thread_id
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows)
    }

    pub async fn get_thread(&self, thread_id: &str) -> Result<Option<StoredThread>, StoreError> {
        let row = sqlx::query_as::<_, StoredThread>(
            r#"
            SELECT thread_id, thread_name, topic, owner_id, owner_nickname, parent_id,
                   member_count, message_count, available_tags, applied_tags,
                   thread_metadata, created_timestamp, last_updated
              FROM discord_threads
             WHERE thread_id = ?
            "#,
        )
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn list_channel_tags(&self, parent_id: &str) -> Result<Vec<ChannelTag>, StoreError> {
        let rows = sqlx::query_as::<_, (String, String, Option<String>, Option<String>)>(
            r#"
            SELECT parent_id, tag_id, tag_name, tag_emoji
              FROM discord_channel_tags
             WHERE parent_id = ?
             ORDER BY tag_id
            "#,
        )
        .bind(parent_id)
        .fetch_all(&self.pool)
        .await?;
        Ok(rows
            .into_iter()
            .map(|(parent_id, tag_id, tag_name, tag_emoji)| ChannelTag {
                parent_id,
                tag_id,
                tag_name: tag_name.unwrap_or_default(),
                tag_emoji,
            })
            .collect())
    }

    pub async fn count_threads(&self) -> Result<i64, StoreError> {
        let count = sqlx::query_scalar("SELECT COUNT(*) FROM discord_threads")
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }
}

/// Write side of one snapshot run.
pub struct SnapshotWriter {
    tx: Transaction<'static, Sqlite>,
}

impl SnapshotWriter {
    /// Delete every thread and tag row. Returns `(threads, tags)` removed.
    pub async fn clear(&mut self) -> Result<(u64, u64), StoreError> {
        let threads = sqlx::query("DELETE FROM discord_threads")
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        let tags = sqlx::query("DELETE FROM discord_channel_tags")
            .execute(&mut *self.tx)
            .await?
            .rows_affected();
        debug!(threads, tags, "cleared previous snapshot");
        Ok((threads, tags))
    }

    /// Single-statement upsert keyed by `thread_id`. A failing statement leaves
    /// the transaction usable for the next row.
    pub async fn upsert_thread(&mut self, record: &ThreadRecord) -> Result<(), StoreError> {
        upsert_thread_on(&mut *self.tx, record, Utc::now().timestamp_millis()).await?;
        Ok(())
    }

    pub async fn upsert_channel_tag(&mut self, tag: &ChannelTag) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO discord_channel_tags (parent_id, tag_id, tag_name, tag_emoji)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(parent_id, tag_id) DO UPDATE SET
                tag_name = excluded.tag_name,
                tag_emoji = excluded.tag_emoji
            "#,
        )
        .bind(&tag.parent_id)
        .bind(&tag.tag_id)
        .bind(&tag.tag_name)
        .bind(&tag.tag_emoji)
        .execute(&mut *self.tx)
        .await?;
        Ok(())
    }

    pub async fn commit(self) -> Result<(), StoreError> {
        self.tx.commit().await?;
        Ok(())
    }
}

async fn upsert_thread_on<'e, E>(
    executor: E,
    record: &ThreadRecord,
    now_ms: i64,
) -> Result<(), sqlx::Error>
where
    E: Executor<'e, Database = Sqlite>,
{
    sqlx::query(
        r#"
        INSERT INTO discord_threads (
            thread_id, thread_name, topic, owner_id, owner_nickname, parent_id,
            member_count, message_count, available_tags, applied_tags,
            thread_metadata, created_timestamp, last_updated
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(thread_id) DO UPDATE SET
            thread_name = excluded.thread_name,
            topic = excluded.topic,
            owner_id = excluded.owner_id,
            owner_nickname = excluded.owner_nickname,
            parent_id = excluded.parent_id,
            member_count = excluded.member_count,
            message_count = excluded.message_count,
            available_tags = excluded.available_tags,
            applied_tags = excluded.applied_tags,
            thread_metadata = excluded.thread_metadata,
            created_timestamp = excluded.created_timestamp,
            last_updated = excluded.last_updated
        "#,
    )
    .bind(&record.thread_id)
    .bind(&record.thread_name)
    .bind(&record.topic)
    .bind(&record.owner_id)
    .bind(&record.owner_nickname)
    .bind(&record.parent_id)
    .bind(record.member_count)
    .bind(record.message_count)
    .bind(&record.available_tags)
    .bind(&record.applied_tags)
    .bind(&record.thread_metadata)
    .bind(record.created_timestamp)
    .bind(now_ms)
    .execute(executor)
    .await?;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacer: `capacity` tokens, one token regained per `refill_every`.
#[derive(Debug)]
pub struct TokenBucket {
    config: TokenBucketConfig,
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    tokens: u32,
    refilled_at: Instant,
}

impl TokenBucket {
    pub fn new(config: TokenBucketConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BucketState {
                tokens: config.capacity.max(1),
                refilled_at: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        let mut state = self.state.lock().await;
        let period = self.config.refill_every;
        if period.is_zero() {
            return;
        }
        loop {
            let elapsed = state.refilled_at.elapsed();
            let regained = (elapsed.as_nanos() / period.as_nanos()) as u32;
            if regained > 0 {
                state.tokens = state
                    .tokens
                    .saturating_add(regained)
                    .min(self.config.capacity.max(1));
                state.refilled_at += period * regained;
            }
            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }
            // Holding the lock while sleeping keeps waiters in FIFO order.
            tokio::time::sleep_until(state.refilled_at + period).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Value for the `Authorization` header sent with every request.
    pub authorization: Option<String>,
    pub max_in_flight: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            authorization: None,
            max_in_flight: 1,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {snippet}")]
    HttpStatus {
        status: u16,
        url: String,
        snippet: String,
    },
    #[error("http fetcher is shut down")]
    Shutdown,
}

impl FetchError {
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            Self::Request(err) => err.status().map(|s| s.as_u16()),
            Self::Shutdown => None,
        }
    }
}

/// Single-attempt GET client. No retries: callers decide whether a failure is
/// skipped or fatal.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    in_flight: Arc<Semaphore>,
    token_bucket: Option<Arc<TokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        if let Some(authorization) = &config.authorization {
            let mut value = HeaderValue::from_str(authorization)
                .context("authorization header contains invalid characters")?;
            value.set_sensitive(true);
            headers.insert(AUTHORIZATION, value);
        }

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }
        let client = builder.build().context("building reqwest client")?;

        Ok(Self {
            client,
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            token_bucket: config.token_bucket.map(|c| Arc::new(TokenBucket::new(c))),
        })
    }

    pub async fn fetch_bytes(
        &self,
        route: &str,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let _permit = self
            .in_flight
            .acquire()
            .await
            .map_err(|_| FetchError::Shutdown)?;
        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", route, url);
        self.fetch_once(url, query).instrument(span).await
    }

    async fn fetch_once(
        &self,
        url: &str,
        query: &[(&str, String)],
    ) -> Result<FetchedResponse, FetchError> {
        let resp = self.client.get(url).query(query).send().await?;
        let status = resp.status();
        let final_url = resp.url().to_string();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            info!(status = status.as_u16(), "non-success response");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
                snippet: body.chars().take(300).collect(),
            });
        }
        let body = resp.bytes().await?.to_vec();
        debug!(bytes = body.len(), "fetched");
        Ok(FetchedResponse {
            status,
            final_url,
            body,
        })
    }
}

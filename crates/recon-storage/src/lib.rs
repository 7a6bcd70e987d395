//! Record store backends: the listing/archive surface the reconciler consumes,
//! plus HTTP retry utilities for the document-database client.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, Utc};
use recon_core::{Page, Record};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Row};
use thiserror::Error;
use tokio::sync::{Mutex, Semaphore};
use tracing::{info_span, warn, Instrument};

pub const CRATE_NAME: &str = "recon-storage";

pub const DEFAULT_DOCUMENT_API_URL: &str = "https://api.notion.com/v1";
pub const DEFAULT_DOCUMENT_API_VERSION: &str = "2022-06-28";
const API_VERSION_HEADER: &str = "notion-version";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}: {body}")]
    HttpStatus { status: u16, url: String, body: String },
    #[error("malformed store payload: {0}")]
    Decode(String),
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("record {0} not found")]
    NotFound(String),
    #[error("store rejected request: {0}")]
    Rejected(String),
}

/// Listing and soft-delete surface of an external record store.
#[async_trait]
pub trait RecordStore: Send + Sync {
    fn store_id(&self) -> &str;

    /// Returns one bounded page. `cursor` is `None` for the first page and
    /// otherwise a `next_cursor` previously returned by this store.
    async fn query(&self, cursor: Option<&str>) -> Result<Page, StoreError>;

    /// Marks a record as retired so later `query` calls no longer list it.
    async fn archive(&self, record_id: &str) -> Result<(), StoreError>;
}

#[derive(Debug, Clone)]
struct MemoryRow {
    record: Record,
    archived: bool,
}

#[derive(Debug, Default)]
struct MemoryState {
    rows: Vec<MemoryRow>,
    archive_failures: HashMap<String, String>,
    query_failure: Option<String>,
    archive_calls: usize,
}

/// In-process store keeping records in insertion order.
#[derive(Debug)]
pub struct MemoryStore {
    store_id: String,
    page_size: usize,
    state: Mutex<MemoryState>,
}

impl MemoryStore {
    pub fn new(store_id: impl Into<String>, records: Vec<Record>) -> Self {
        let rows = records
            .into_iter()
            .map(|record| MemoryRow {
                record,
                archived: false,
            })
            .collect();
        Self {
            store_id: store_id.into(),
            page_size: 100,
            state: Mutex::new(MemoryState {
                rows,
                ..Default::default()
            }),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Every archive call for `record_id` fails with `reason`.
    pub fn with_archive_failure(mut self, record_id: &str, reason: &str) -> Self {
        self.state
            .get_mut()
            .archive_failures
            .insert(record_id.to_string(), reason.to_string());
        self
    }

    /// Every query call fails with `reason`.
    pub fn with_query_failure(mut self, reason: &str) -> Self {
        self.state.get_mut().query_failure = Some(reason.to_string());
        self
    }

    pub async fn archive_calls(&self) -> usize {
        self.state.lock().await.archive_calls
    }

    pub async fn live_records(&self) -> Vec<Record> {
        self.state
            .lock()
            .await
            .rows
            .iter()
            .filter(|row| !row.archived)
            .map(|row| row.record.clone())
            .collect()
    }

    pub async fn is_archived(&self, record_id: &str) -> bool {
        self.state
            .lock()
            .await
            .rows
            .iter()
            .any(|row| row.archived && row.record.record_id == record_id)
    }
}

#[async_trait]
impl RecordStore for MemoryStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn query(&self, cursor: Option<&str>) -> Result<Page, StoreError> {
        let state = self.state.lock().await;
        if let Some(reason) = &state.query_failure {
            return Err(StoreError::Rejected(reason.clone()));
        }

        let start = match cursor {
            Some(raw) => raw
                .parse::<usize>()
                .map_err(|_| StoreError::Decode(format!("invalid memory cursor `{raw}`")))?,
            None => 0,
        };

        let mut items = Vec::new();
        let mut position = start;
        while position < state.rows.len() && items.len() < self.page_size {
            let row = &state.rows[position];
            if !row.archived {
                items.push(row.record.clone());
            }
            position += 1;
        }

        let has_more = state.rows[position.min(state.rows.len())..]
            .iter()
            .any(|row| !row.archived);
        Ok(Page {
            items,
            next_cursor: has_more.then(|| position.to_string()),
        })
    }

    async fn archive(&self, record_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        state.archive_calls += 1;
        if let Some(reason) = state.archive_failures.get(record_id) {
            return Err(StoreError::Rejected(reason.clone()));
        }
        let row = state
            .rows
            .iter_mut()
            .find(|row| row.record.record_id == record_id)
            .ok_or_else(|| StoreError::NotFound(record_id.to_string()))?;
        row.archived = true;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Request pacing for APIs that publish a per-second budget.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Names of the database properties that carry each record field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PropertyMap {
    pub title: String,
    pub assignee: String,
    pub status: String,
    pub deadline: String,
    pub description: String,
}

impl Default for PropertyMap {
    fn default() -> Self {
        Self {
            title: "Name".to_string(),
            assignee: "Assignee".to_string(),
            status: "Status".to_string(),
            deadline: "Deadline".to_string(),
            description: "Description".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DocumentStoreConfig {
    pub base_url: String,
    pub database_id: String,
    pub api_token: String,
    pub api_version: String,
    pub page_size: usize,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub max_in_flight: usize,
    pub backoff: BackoffPolicy,
    pub token_bucket: Option<TokenBucketConfig>,
    pub properties: PropertyMap,
}

impl DocumentStoreConfig {
    pub fn new(
        base_url: impl Into<String>,
        database_id: impl Into<String>,
        api_token: impl Into<String>,
    ) -> Self {
        Self {
            base_url: base_url.into(),
            database_id: database_id.into(),
            api_token: api_token.into(),
            api_version: DEFAULT_DOCUMENT_API_VERSION.to_string(),
            page_size: 100,
            timeout: Duration::from_secs(20),
            user_agent: None,
            max_in_flight: 4,
            backoff: BackoffPolicy::default(),
            token_bucket: Some(TokenBucketConfig {
                capacity: 3,
                refill_every: Duration::from_millis(350),
            }),
            properties: PropertyMap::default(),
        }
    }
}

#[derive(Debug, Serialize)]
struct QueryBody<'a> {
    page_size: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    start_cursor: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct QueryResponse {
    #[serde(default)]
    results: Vec<JsonValue>,
    #[serde(default)]
    has_more: bool,
    #[serde(default)]
    next_cursor: Option<String>,
}

/// Client for a hosted document database exposing databases of pages.
#[derive(Debug)]
pub struct DocumentStore {
    store_id: String,
    client: reqwest::Client,
    base_url: String,
    database_id: String,
    page_size: usize,
    in_flight: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
    backoff: BackoffPolicy,
    properties: PropertyMap,
}

impl DocumentStore {
    pub fn new(config: DocumentStoreConfig) -> anyhow::Result<Self> {
        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", config.api_token)
                .parse()
                .context("building authorization header")?,
        );
        headers.insert(
            API_VERSION_HEADER,
            config
                .api_version
                .parse()
                .context("building api version header")?,
        );

        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .default_headers(headers);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            store_id: format!("document:{}", config.database_id),
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            database_id: config.database_id,
            page_size: config.page_size.clamp(1, 100),
            in_flight: Arc::new(Semaphore::new(config.max_in_flight.max(1))),
            token_bucket,
            backoff: config.backoff,
            properties: config.properties,
        })
    }

    /// Sends the request produced by `build`, retrying transient failures,
    /// and returns the decoded JSON body of the first successful response.
    async fn send_json<F>(&self, url: &str, build: F) -> Result<JsonValue, StoreError>
    where
        F: Fn() -> reqwest::RequestBuilder,
    {
        let _permit = self.in_flight.acquire().await.expect("semaphore not closed");

        for attempt in 0..=self.backoff.max_retries {
            if let Some(bucket) = &self.token_bucket {
                bucket.take().await;
            }

            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        return resp.json::<JsonValue>().await.map_err(StoreError::Request);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        let delay = retry_after(&resp)
                            .unwrap_or_else(|| self.backoff.delay_for_attempt(attempt))
                            .min(self.backoff.max_delay);
                        warn!(%status, attempt, url, "retrying document store request");
                        tokio::time::sleep(delay).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(StoreError::HttpStatus {
                        status: status.as_u16(),
                        url: url.to_string(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, url, "retrying document store request");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(StoreError::Request(err));
                }
            }
        }

        unreachable!("final attempt always returns")
    }
}

fn retry_after(resp: &reqwest::Response) -> Option<Duration> {
    resp.headers()
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

#[async_trait]
impl RecordStore for DocumentStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn query(&self, cursor: Option<&str>) -> Result<Page, StoreError> {
        let url = format!("{}/databases/{}/query", self.base_url, self.database_id);
        let body = QueryBody {
            page_size: self.page_size,
            start_cursor: cursor,
        };
        let span = info_span!("document_query", store = %self.store_id, cursor = cursor.unwrap_or("<start>"));
        let value = self
            .send_json(&url, || self.client.post(&url).json(&body))
            .instrument(span)
            .await?;

        let response: QueryResponse = serde_json::from_value(value)
            .map_err(|err| StoreError::Decode(format!("query response: {err}")))?;
        let items = response
            .results
            .iter()
            .filter(|page| !page_is_archived(page))
            .map(|page| page_to_record(page, &self.properties))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Page {
            items,
            next_cursor: if response.has_more {
                response.next_cursor
            } else {
                None
            },
        })
    }

    async fn archive(&self, record_id: &str) -> Result<(), StoreError> {
        let url = format!("{}/pages/{}", self.base_url, record_id);
        let body = serde_json::json!({ "archived": true });
        let span = info_span!("document_archive", store = %self.store_id, record_id);
        match self
            .send_json(&url, || self.client.patch(&url).json(&body))
            .instrument(span)
            .await
        {
            Ok(_) => Ok(()),
            Err(StoreError::HttpStatus { status: 404, .. }) => {
                Err(StoreError::NotFound(record_id.to_string()))
            }
            Err(err) => Err(err),
        }
    }
}

fn page_is_archived(page: &JsonValue) -> bool {
    ["archived", "in_trash"]
        .iter()
        .any(|flag| page.get(flag).and_then(JsonValue::as_bool).unwrap_or(false))
}

/// Maps one database page onto a [`Record`].
pub fn page_to_record(page: &JsonValue, properties: &PropertyMap) -> Result<Record, StoreError> {
    let record_id = page
        .get("id")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::Decode("page without id".to_string()))?
        .to_string();
    let created_time = timestamp_field(page, "created_time", &record_id)?;
    let last_edited_time = timestamp_field(page, "last_edited_time", &record_id)?;

    let props = page.get("properties");
    let text = |name: &str| {
        props
            .and_then(|p| p.get(name))
            .and_then(property_text)
            .unwrap_or_default()
    };

    let deadline = props
        .and_then(|p| p.get(&properties.deadline))
        .and_then(|value| property_date(value, &record_id));

    Ok(Record {
        title: text(&properties.title),
        assignee_label: text(&properties.assignee),
        status: text(&properties.status),
        description: text(&properties.description),
        deadline,
        created_time,
        last_edited_time,
        record_id,
    })
}

fn timestamp_field(page: &JsonValue, field: &str, record_id: &str) -> Result<DateTime<Utc>, StoreError> {
    let raw = page
        .get(field)
        .and_then(JsonValue::as_str)
        .ok_or_else(|| StoreError::Decode(format!("page {record_id} missing {field}")))?;
    DateTime::parse_from_rfc3339(raw)
        .map(|ts| ts.with_timezone(&Utc))
        .map_err(|err| StoreError::Decode(format!("page {record_id} {field} `{raw}`: {err}")))
}

fn join_plain_text(items: &JsonValue) -> Option<String> {
    let parts = items.as_array()?;
    Some(
        parts
            .iter()
            .filter_map(|part| part.get("plain_text").and_then(JsonValue::as_str))
            .collect::<String>(),
    )
}

/// Plain-text rendering of a typed property value.
pub fn property_text(value: &JsonValue) -> Option<String> {
    let kind = value.get("type")?.as_str()?;
    let inner = value.get(kind)?;
    match kind {
        "title" | "rich_text" => join_plain_text(inner),
        "select" | "status" => inner.get("name")?.as_str().map(str::to_string),
        "multi_select" | "people" => {
            let names = inner
                .as_array()?
                .iter()
                .filter_map(|entry| entry.get("name").and_then(JsonValue::as_str))
                .collect::<Vec<_>>();
            Some(names.join(", "))
        }
        "date" => inner.get("start")?.as_str().map(str::to_string),
        "number" => inner.as_f64().map(|n| n.to_string()),
        "formula" => inner.get("string")?.as_str().map(str::to_string),
        _ => None,
    }
}

fn property_date(value: &JsonValue, record_id: &str) -> Option<NaiveDate> {
    let raw = property_text(value)?;
    let day = raw.get(..10)?;
    match NaiveDate::parse_from_str(day, "%Y-%m-%d") {
        Ok(date) => Some(date),
        Err(err) => {
            warn!(record_id, raw = %raw, error = %err, "ignoring unparseable deadline");
            None
        }
    }
}

/// Task table in a PostgreSQL database. Pages are keyset-paginated by `id`.
#[derive(Debug, Clone)]
pub struct PgRecordStore {
    store_id: String,
    pool: PgPool,
    page_size: i64,
}

impl PgRecordStore {
    pub async fn connect(database_url: &str, page_size: usize) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        Ok(Self::from_pool(pool, page_size))
    }

    pub fn from_pool(pool: PgPool, page_size: usize) -> Self {
        Self {
            store_id: "postgres:tasks".to_string(),
            pool,
            page_size: page_size.max(1) as i64,
        }
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        sqlx::migrate!("../../migrations")
            .run(&self.pool)
            .await
            .context("applying tasks migrations")
    }
}

#[async_trait]
impl RecordStore for PgRecordStore {
    fn store_id(&self) -> &str {
        &self.store_id
    }

    async fn query(&self, cursor: Option<&str>) -> Result<Page, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, title, assignee, status, deadline, description, created_at, updated_at
              FROM tasks
             WHERE archived_at IS NULL
               AND ($1::text IS NULL OR id > $1)
             ORDER BY id
             LIMIT $2
            "#,
        )
        .bind(cursor)
        .bind(self.page_size + 1)
        .fetch_all(&self.pool)
        .instrument(info_span!("pg_query", cursor = cursor.unwrap_or("<start>")))
        .await?;

        let has_more = rows.len() as i64 > self.page_size;
        let items = rows
            .iter()
            .take(self.page_size as usize)
            .map(|row| {
                Ok(Record {
                    record_id: row.try_get("id")?,
                    title: row.try_get("title")?,
                    assignee_label: row.try_get("assignee")?,
                    status: row.try_get("status")?,
                    deadline: row.try_get("deadline")?,
                    description: row.try_get("description")?,
                    created_time: row.try_get("created_at")?,
                    last_edited_time: row.try_get("updated_at")?,
                })
            })
            .collect::<Result<Vec<_>, sqlx::Error>>()?;

        let next_cursor = if has_more {
            items.last().map(|r| r.record_id.clone())
        } else {
            None
        };
        Ok(Page { items, next_cursor })
    }

    async fn archive(&self, record_id: &str) -> Result<(), StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE tasks
               SET archived_at = NOW()
             WHERE id = $1
               AND archived_at IS NULL
            "#,
        )
        .bind(record_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() > 0 {
            return Ok(());
        }

        let exists = sqlx::query("SELECT 1 FROM tasks WHERE id = $1")
            .bind(record_id)
            .fetch_optional(&self.pool)
            .await?
            .is_some();
        if exists {
            Ok(())
        } else {
            Err(StoreError::NotFound(record_id.to_string()))
        }
    }
}

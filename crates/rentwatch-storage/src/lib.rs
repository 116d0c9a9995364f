//! Listing store (SQLite) + HTTP fetch utilities for rentwatch.

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use rentwatch_core::{Listing, ListingAttributes};
use reqwest::StatusCode;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

const LISTING_COLUMNS: &str = "id, link, price, expenses, location, address, rooms, m2, years, image, \
     is_active, is_new, deactivation_synced, first_seen_at, last_seen_at";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("listing {0} not found")]
    NotFound(i64),
}

/// Result of [`ListingStore::upsert_if_absent`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpsertOutcome {
    pub id: i64,
    pub inserted: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreStats {
    pub total: i64,
    pub active: i64,
    pub pending_create: i64,
    pub pending_deactivation: i64,
}

#[derive(Debug, FromRow)]
struct ListingRow {
    id: i64,
    link: String,
    price: Option<i64>,
    expenses: Option<i64>,
    location: Option<String>,
    address: Option<String>,
    rooms: Option<i64>,
    m2: Option<i64>,
    years: Option<String>,
    image: Option<String>,
    is_active: bool,
    is_new: bool,
    deactivation_synced: bool,
    first_seen_at: DateTime<Utc>,
    last_seen_at: DateTime<Utc>,
}

impl From<ListingRow> for Listing {
    fn from(row: ListingRow) -> Self {
        Listing {
            id: row.id,
            link: row.link,
            attributes: ListingAttributes {
                price: row.price,
                expenses: row.expenses,
                location: row.location,
                address: row.address,
                rooms: row.rooms,
                m2: row.m2,
                years: row.years,
                image: row.image,
            },
            is_active: row.is_active,
            is_new: row.is_new,
            deactivation_synced: row.deactivation_synced,
            first_seen_at: row.first_seen_at,
            last_seen_at: row.last_seen_at,
        }
    }
}

/// Durable listing table keyed by link.
///
/// The pool holds a single connection: one run owns the store for its whole
/// duration and all mutations are issued sequentially.
#[derive(Debug, Clone)]
pub struct ListingStore {
    pool: SqlitePool,
}

impl ListingStore {
    /// Open (creating if needed) the SQLite file at `path`.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::new()
            .filename(path.as_ref())
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect_with(options)
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    /// Ephemeral store for tests; the connection is never recycled so the data survives.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await?;
        let store = Self { pool };
        store.init_schema().await?;
        Ok(store)
    }

    async fn init_schema(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS listings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                link TEXT NOT NULL UNIQUE,
                price INTEGER,
                expenses INTEGER,
                location TEXT,
                address TEXT,
                rooms INTEGER,
                m2 INTEGER,
                years TEXT,
                image TEXT,
                is_active BOOLEAN NOT NULL DEFAULT 1,
                is_new BOOLEAN NOT NULL DEFAULT 1,
                deactivation_synced BOOLEAN NOT NULL DEFAULT 0,
                first_seen_at TEXT NOT NULL,
                last_seen_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_listings_is_new ON listings(is_new);
            CREATE INDEX IF NOT EXISTS idx_listings_is_active ON listings(is_active);
            "#,
        )
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Insert `link` with `attributes` unless it is already stored.
    ///
    /// Existing rows keep their attributes; only `last_seen_at` moves forward.
    pub async fn upsert_if_absent(
        &self,
        link: &str,
        attributes: &ListingAttributes,
        seen_at: DateTime<Utc>,
    ) -> Result<UpsertOutcome, StoreError> {
        let inserted: Option<i64> = sqlx::query_scalar(
            r#"
            INSERT INTO listings (
                link, price, expenses, location, address, rooms, m2, years, image,
                is_active, is_new, deactivation_synced, first_seen_at, last_seen_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, 1, 1, 0, ?10, ?10)
            ON CONFLICT(link) DO NOTHING
            RETURNING id
            "#,
        )
        .bind(link)
        .bind(attributes.price)
        .bind(attributes.expenses)
        .bind(&attributes.location)
        .bind(&attributes.address)
        .bind(attributes.rooms)
        .bind(attributes.m2)
        .bind(&attributes.years)
        .bind(&attributes.image)
        .bind(seen_at)
        .fetch_optional(&self.pool)
        .await?;

        if let Some(id) = inserted {
            return Ok(UpsertOutcome { id, inserted: true });
        }

        let id: i64 = sqlx::query_scalar(
            "UPDATE listings SET last_seen_at = ?1 WHERE link = ?2 RETURNING id",
        )
        .bind(seen_at)
        .bind(link)
        .fetch_one(&self.pool)
        .await?;
        Ok(UpsertOutcome {
            id,
            inserted: false,
        })
    }

    /// Flag every active row whose link is not in `seen_links` as inactive.
    ///
    /// The links are staged in a temp table so the flip is one `UPDATE` inside
    /// one transaction, whatever the size of the set. Returns the number of
    /// rows that went inactive.
    pub async fn mark_active_set(&self, seen_links: &HashSet<String>) -> Result<u64, StoreError> {
        let mut tx = self.pool.begin().await?;

        sqlx::query("CREATE TEMP TABLE IF NOT EXISTS seen_links (link TEXT PRIMARY KEY)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("DELETE FROM seen_links").execute(&mut *tx).await?;
        for link in seen_links {
            sqlx::query("INSERT OR IGNORE INTO seen_links (link) VALUES (?1)")
                .bind(link)
                .execute(&mut *tx)
                .await?;
        }

        let result = sqlx::query(
            r#"
            UPDATE listings
               SET is_active = 0
             WHERE is_active = 1
               AND link NOT IN (SELECT link FROM seen_links)
            "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM seen_links").execute(&mut *tx).await?;
        tx.commit().await?;

        debug!(
            seen = seen_links.len(),
            deactivated = result.rows_affected(),
            "applied active set"
        );
        Ok(result.rows_affected())
    }

    /// Listings whose remote record has not been created yet.
    pub async fn list_new(&self) -> Result<Vec<Listing>, StoreError> {
        self.select_where("is_new = 1").await
    }

    /// Inactive listings whose remote record has not been confirmed inactive.
    pub async fn list_newly_inactive(&self) -> Result<Vec<Listing>, StoreError> {
        self.select_where("is_active = 0 AND deactivation_synced = 0").await
    }

    pub async fn mark_synced(&self, id: i64) -> Result<(), StoreError> {
        self.set_flag(id, "UPDATE listings SET is_new = 0 WHERE id = ?1").await
    }

    pub async fn mark_deactivation_synced(&self, id: i64) -> Result<(), StoreError> {
        self.set_flag(id, "UPDATE listings SET deactivation_synced = 1 WHERE id = ?1")
            .await
    }

    pub async fn get(&self, id: i64) -> Result<Option<Listing>, StoreError> {
        let row: Option<ListingRow> =
            sqlx::query_as(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE id = ?1"))
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Listing::from))
    }

    pub async fn find_by_link(&self, link: &str) -> Result<Option<Listing>, StoreError> {
        let row: Option<ListingRow> =
            sqlx::query_as(&format!("SELECT {LISTING_COLUMNS} FROM listings WHERE link = ?1"))
                .bind(link)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(Listing::from))
    }

    pub async fn stats(&self) -> Result<StoreStats, StoreError> {
        let (total, active, pending_create, pending_deactivation): (i64, i64, i64, i64) =
            sqlx::query_as(
                r#"
                SELECT COUNT(*),
                       COALESCE(SUM(is_active = 1), 0),
                       COALESCE(SUM(is_new = 1), 0),
                       COALESCE(SUM(is_active = 0 AND deactivation_synced = 0), 0)
                  FROM listings
                "#,
            )
            .fetch_one(&self.pool)
            .await?;
        Ok(StoreStats {
            total,
            active,
            pending_create,
            pending_deactivation,
        })
    }

    async fn select_where(&self, predicate: &str) -> Result<Vec<Listing>, StoreError> {
        let rows: Vec<ListingRow> = sqlx::query_as(&format!(
            "SELECT {LISTING_COLUMNS} FROM listings WHERE {predicate} ORDER BY id"
        ))
        .fetch_all(&self.pool)
        .await?;
        Ok(rows.into_iter().map(Listing::from).collect())
    }

    async fn set_flag(&self, id: i64, statement: &str) -> Result<(), StoreError> {
        let result = sqlx::query(statement).bind(id).execute(&self.pool).await?;
        if result.rows_affected() == 0 {
            return Err(StoreError::NotFound(id));
        }
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

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

impl HttpClientConfig {
    /// Shared client builder so crawler, remote directory and notifier agree on timeouts.
    pub fn build_client(&self) -> anyhow::Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(self.timeout);

        if let Some(user_agent) = &self.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        builder.build().context("building reqwest client")
    }
}

/// GET-only fetcher with retry on transient failures. Requests are issued one at a time.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

impl FetchedResponse {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.body).into_owned()
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        Ok(Self {
            client: config.build_client()?,
            backoff: config.backoff,
        })
    }

    pub async fn fetch_bytes(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let mut attempt = 0;
        loop {
            match self.client.get(url).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.bytes().await?.to_vec();
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, %status, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(attempt, error = %err, "retrying after request error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}

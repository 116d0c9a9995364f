//! Crawl reconciliation and remote directory sync for rentwatch.

use std::collections::HashSet;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rentwatch_adapters::{ArgenpropCrawler, FixtureCrawler, SourceCrawler};
use rentwatch_core::{text_or_none, Listing, ListingAttributes, RemoteStatus};
use rentwatch_storage::{HttpClientConfig, HttpFetcher, ListingStore, StoreError, StoreStats};
use serde::Serialize;
use serde_json::{json, Value as JsonValue};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const NOTION_VERSION: &str = "2022-06-28";
pub const NOTIFICATION_TITLE: &str = "Alerta departamentos";
pub const NOTIFICATION_TAGS: &str = "rotating_light";

const REQUIRED_KEYS: [&str; 6] = [
    "RENTWATCH_DB_PATH",
    "NOTION_TOKEN",
    "NOTION_DATABASE_ID",
    "NOTIFICATIONS_CHANNEL",
    "ARGENPROP_BASE_LINK",
    "ARGENPROP_SEARCH_LINK",
];

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing required settings: {}", .0.join(", "))]
    Missing(Vec<&'static str>),
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: &'static str, value: String },
}

#[derive(Debug, Clone)]
pub struct NotionConfig {
    pub api_base: String,
    pub token: String,
    pub database_id: String,
}

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub notion: NotionConfig,
    pub notifications_channel: String,
    pub argenprop_base_link: String,
    pub argenprop_search_link: String,
    pub fixture_dir: Option<PathBuf>,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub max_pages: usize,
    pub scheduler_enabled: bool,
    pub sync_cron_1: String,
    pub sync_cron_2: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build and validate the configuration from any key/value source.
    ///
    /// All missing required keys are reported together.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let get = |key: &str| lookup(key).and_then(|v| text_or_none(&v));

        let missing: Vec<&'static str> = REQUIRED_KEYS
            .iter()
            .copied()
            .filter(|key| get(*key).is_none())
            .collect();
        if !missing.is_empty() {
            return Err(ConfigError::Missing(missing));
        }
        let required = |key: &'static str| get(key).ok_or(ConfigError::Missing(vec![key]));

        Ok(Self {
            db_path: PathBuf::from(required("RENTWATCH_DB_PATH")?),
            notion: NotionConfig {
                api_base: get("NOTION_API_BASE")
                    .unwrap_or_else(|| "https://api.notion.com".to_string())
                    .trim_end_matches('/')
                    .to_string(),
                token: required("NOTION_TOKEN")?,
                database_id: required("NOTION_DATABASE_ID")?,
            },
            notifications_channel: required("NOTIFICATIONS_CHANNEL")?,
            argenprop_base_link: required("ARGENPROP_BASE_LINK")?,
            argenprop_search_link: required("ARGENPROP_SEARCH_LINK")?,
            fixture_dir: get("RENTWATCH_FIXTURE_DIR").map(PathBuf::from),
            user_agent: get("RENTWATCH_USER_AGENT")
                .unwrap_or_else(|| format!("rentwatch/{}", env!("CARGO_PKG_VERSION"))),
            http_timeout_secs: parse_or("RENTWATCH_HTTP_TIMEOUT_SECS", get("RENTWATCH_HTTP_TIMEOUT_SECS"), 20)?,
            max_pages: parse_or("RENTWATCH_MAX_PAGES", get("RENTWATCH_MAX_PAGES"), 50)?,
            scheduler_enabled: get("RENTWATCH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes"))
                .unwrap_or(false),
            sync_cron_1: get("SYNC_CRON_1").unwrap_or_else(|| "0 0 9 * * *".to_string()),
            sync_cron_2: get("SYNC_CRON_2").unwrap_or_else(|| "0 0 21 * * *".to_string()),
        })
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
            ..Default::default()
        }
    }
}

fn parse_or<T: FromStr>(key: &'static str, value: Option<String>, default: T) -> Result<T, ConfigError> {
    match value {
        None => Ok(default),
        Some(raw) => raw.parse().map_err(|_| ConfigError::Invalid { key, value: raw }),
    }
}

/// Outcome of one crawl pass applied to the store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    pub pages: usize,
    pub observed: usize,
    pub unique_links: usize,
    pub inserted: usize,
    pub skipped_without_link: usize,
    pub deactivated: u64,
    pub fetch_error: Option<String>,
}

impl ReconcileReport {
    pub fn completed(&self) -> bool {
        self.fetch_error.is_none()
    }

    /// The crawl failed on its first page, so nothing was observed at all.
    pub fn is_total_fetch_failure(&self) -> bool {
        !self.completed() && self.pages == 0
    }
}

/// Apply one crawl pass to the store.
///
/// Every observed link is inserted if unknown. Only when the crawler reports
/// the end of the pass are unseen listings flagged inactive; an interrupted
/// pass keeps its inserts but never deactivates anything.
pub async fn reconcile_pass(
    store: &ListingStore,
    crawler: &mut dyn SourceCrawler,
) -> Result<ReconcileReport, StoreError> {
    let source_id = crawler.source_id();
    let mut report = ReconcileReport::default();
    let mut seen_links: HashSet<String> = HashSet::new();

    loop {
        let page = match crawler.next_page().await {
            Ok(Some(page)) => page,
            Ok(None) => break,
            Err(err) => {
                warn!(
                    source_id,
                    pages = report.pages,
                    error = %err,
                    "crawl pass interrupted, deactivation skipped"
                );
                report.unique_links = seen_links.len();
                report.fetch_error = Some(err.to_string());
                return Ok(report);
            }
        };
        report.pages += 1;

        for raw in page.listings {
            report.observed += 1;
            let Some(link) = raw.normalized_link() else {
                report.skipped_without_link += 1;
                continue;
            };
            let outcome = store
                .upsert_if_absent(&link, &raw.normalize(), Utc::now())
                .await?;
            if outcome.inserted {
                report.inserted += 1;
                debug!(id = outcome.id, link = %link, "new listing");
            }
            seen_links.insert(link);
        }
    }

    report.unique_links = seen_links.len();
    report.deactivated = store.mark_active_set(&seen_links).await?;
    info!(
        source_id,
        pages = report.pages,
        observed = report.observed,
        inserted = report.inserted,
        deactivated = report.deactivated,
        "crawl pass reconciled"
    );
    Ok(report)
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("remote returned status {status}: {body}")]
    Status { status: u16, body: String },
    #[error("unexpected remote response: {0}")]
    Decode(String),
}

#[derive(Debug, Error)]
pub enum NotifyError {
    #[error("http request failed: {0}")]
    Http(#[from] reqwest::Error),
    #[error("notification channel returned status {status}")]
    Status { status: u16 },
}

/// Create request for the remote directory, correlated by the local listing id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CreateRecord {
    pub correlation_id: i64,
    pub link: String,
    pub attributes: ListingAttributes,
}

impl CreateRecord {
    pub fn from_listing(listing: &Listing) -> Self {
        Self {
            correlation_id: listing.id,
            link: listing.link.clone(),
            attributes: listing.attributes.clone(),
        }
    }
}

/// External system holding one mirrored record per listing.
#[async_trait]
pub trait RemoteDirectory: Send + Sync {
    /// Create an active record; returns its remote id.
    async fn create(&self, record: &CreateRecord) -> Result<String, RemoteError>;

    async fn find_by_correlation_id(
        &self,
        correlation_id: i64,
        status: RemoteStatus,
    ) -> Result<Option<String>, RemoteError>;

    async fn set_status(&self, remote_id: &str, status: RemoteStatus) -> Result<(), RemoteError>;
}

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), NotifyError>;
}

/// Text sent at the end of a run, `None` when nothing changed.
pub fn summary_text(created: usize, deactivated: usize) -> Option<String> {
    match (created, deactivated) {
        (0, 0) => None,
        (0, d) => Some(format!("Se eliminaron {d} publicaciones")),
        (c, 0) => Some(format!("Se encontraron {c} nuevos departamentos!")),
        (c, d) => Some(format!(
            "Se encontraron {c} nuevos departamentos!\nAdemas, se eliminaron {d} publicaciones"
        )),
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
    pub created: usize,
    pub create_failures: usize,
    pub deactivated: usize,
    pub already_inactive: usize,
    pub never_created: usize,
    pub deactivate_failures: usize,
    pub notified: bool,
    pub notify_failed: bool,
}

impl SyncReport {
    pub fn remote_failures(&self) -> usize {
        self.create_failures + self.deactivate_failures + usize::from(self.notify_failed)
    }
}

enum DeactivateOutcome {
    Deactivated,
    AlreadyInactive,
    NeverCreated,
}

/// Converges remote records with local lifecycle flags.
///
/// Local flags change only after the matching remote call succeeded, so a
/// failed or interrupted run is simply retried by the next one.
pub struct SyncEngine<'a> {
    store: &'a ListingStore,
    remote: &'a dyn RemoteDirectory,
    notifier: &'a dyn Notifier,
}

impl<'a> SyncEngine<'a> {
    pub fn new(
        store: &'a ListingStore,
        remote: &'a dyn RemoteDirectory,
        notifier: &'a dyn Notifier,
    ) -> Self {
        Self {
            store,
            remote,
            notifier,
        }
    }

    pub async fn run(&self) -> Result<SyncReport, StoreError> {
        let mut report = SyncReport::default();

        // Creates drain first so a listing created here can be deactivated in the same run.
        self.create_pending(&mut report).await?;
        self.deactivate_pending(&mut report).await?;

        if let Some(text) = summary_text(report.created, report.deactivated) {
            match self.notifier.send(&text).await {
                Ok(()) => report.notified = true,
                Err(err) => {
                    warn!(error = %err, "notification failed");
                    report.notify_failed = true;
                }
            }
        }

        info!(
            created = report.created,
            deactivated = report.deactivated,
            failures = report.remote_failures(),
            "remote sync finished"
        );
        Ok(report)
    }

    async fn create_pending(&self, report: &mut SyncReport) -> Result<(), StoreError> {
        for listing in self.store.list_new().await? {
            let record = CreateRecord::from_listing(&listing);
            match self.remote.create(&record).await {
                Ok(remote_id) => {
                    self.store.mark_synced(listing.id).await?;
                    report.created += 1;
                    debug!(id = listing.id, remote_id = %remote_id, "created remote record");
                }
                Err(err) => {
                    report.create_failures += 1;
                    warn!(id = listing.id, link = %listing.link, error = %err, "remote create failed");
                }
            }
        }
        Ok(())
    }

    async fn deactivate_pending(&self, report: &mut SyncReport) -> Result<(), StoreError> {
        for listing in self.store.list_newly_inactive().await? {
            match self.deactivate_one(&listing).await {
                Ok(DeactivateOutcome::Deactivated) => {
                    self.store.mark_deactivation_synced(listing.id).await?;
                    report.deactivated += 1;
                    debug!(id = listing.id, "deactivated remote record");
                }
                Ok(DeactivateOutcome::AlreadyInactive) => {
                    self.store.mark_deactivation_synced(listing.id).await?;
                    report.already_inactive += 1;
                }
                Ok(DeactivateOutcome::NeverCreated) => {
                    // Left pending: once the create goes through, the deactivation follows.
                    report.never_created += 1;
                }
                Err(err) => {
                    report.deactivate_failures += 1;
                    warn!(id = listing.id, error = %err, "remote deactivation failed");
                }
            }
        }
        Ok(())
    }

    async fn deactivate_one(&self, listing: &Listing) -> Result<DeactivateOutcome, RemoteError> {
        let found = self
            .remote
            .find_by_correlation_id(listing.id, RemoteStatus::Active)
            .await?;
        match found {
            Some(remote_id) => {
                self.remote
                    .set_status(&remote_id, RemoteStatus::Inactive)
                    .await?;
                Ok(DeactivateOutcome::Deactivated)
            }
            None if listing.is_new => Ok(DeactivateOutcome::NeverCreated),
            None => Ok(DeactivateOutcome::AlreadyInactive),
        }
    }
}

/// Label of the `Estado` select option for a status.
pub fn notion_status_label(status: RemoteStatus) -> &'static str {
    match status {
        RemoteStatus::Active => "Activo",
        RemoteStatus::Inactive => "Inactivo",
    }
}

pub fn notion_create_payload(database_id: &str, record: &CreateRecord) -> JsonValue {
    let attrs = &record.attributes;
    let text = |value: &Option<String>| value.clone().unwrap_or_default();

    let mut payload = json!({
        "parent": { "database_id": database_id },
        "icon": { "emoji": "🏡" },
        "properties": {
            "Direccion": { "title": [{ "text": { "content": text(&attrs.address) } }] },
            "Localidad": { "rich_text": [{ "text": { "content": text(&attrs.location) } }] },
            "Precio": { "number": attrs.price },
            "Expensas": { "number": attrs.expenses },
            "Habitaciones": { "number": attrs.rooms },
            "m2": { "number": attrs.m2 },
            "Imagen": { "url": attrs.image },
            "Antiguedad": { "rich_text": [{ "text": { "content": text(&attrs.years) } }] },
            "Link": { "url": record.link },
            "Estado": { "select": { "name": notion_status_label(RemoteStatus::Active) } },
            "listingId": { "number": record.correlation_id },
        }
    });

    if let Some(image) = &attrs.image {
        payload["cover"] = json!({ "external": { "url": image } });
        payload["children"] = json!([{
            "object": "block",
            "type": "image",
            "image": { "type": "external", "external": { "url": image } }
        }]);
    }
    payload
}

pub fn notion_query_payload(correlation_id: i64, status: RemoteStatus) -> JsonValue {
    json!({
        "filter": {
            "and": [
                { "property": "listingId", "number": { "equals": correlation_id } },
                { "property": "Estado", "select": { "equals": notion_status_label(status) } }
            ]
        }
    })
}

pub fn notion_status_payload(status: RemoteStatus) -> JsonValue {
    json!({
        "properties": {
            "Estado": { "select": { "name": notion_status_label(status) } }
        }
    })
}

fn first_result_id(body: &JsonValue) -> Option<String> {
    body.get("results")?
        .as_array()?
        .first()?
        .get("id")?
        .as_str()
        .map(ToString::to_string)
}

/// Notion database acting as the remote directory.
#[derive(Debug, Clone)]
pub struct NotionDirectory {
    client: reqwest::Client,
    config: NotionConfig,
}

impl NotionDirectory {
    pub fn new(client: reqwest::Client, config: NotionConfig) -> Self {
        Self { client, config }
    }

    async fn send_json(
        &self,
        request: reqwest::RequestBuilder,
        body: &JsonValue,
    ) -> Result<JsonValue, RemoteError> {
        let resp = request
            .bearer_auth(&self.config.token)
            .header("Notion-Version", NOTION_VERSION)
            .json(body)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(RemoteError::Status {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl RemoteDirectory for NotionDirectory {
    async fn create(&self, record: &CreateRecord) -> Result<String, RemoteError> {
        let url = format!("{}/v1/pages", self.config.api_base);
        let payload = notion_create_payload(&self.config.database_id, record);
        let body = self.send_json(self.client.post(url), &payload).await?;
        body.get("id")
            .and_then(JsonValue::as_str)
            .map(ToString::to_string)
            .ok_or_else(|| RemoteError::Decode("created page has no id".to_string()))
    }

    async fn find_by_correlation_id(
        &self,
        correlation_id: i64,
        status: RemoteStatus,
    ) -> Result<Option<String>, RemoteError> {
        let url = format!(
            "{}/v1/databases/{}/query",
            self.config.api_base, self.config.database_id
        );
        let payload = notion_query_payload(correlation_id, status);
        let body = self.send_json(self.client.post(url), &payload).await?;
        Ok(first_result_id(&body))
    }

    async fn set_status(&self, remote_id: &str, status: RemoteStatus) -> Result<(), RemoteError> {
        let url = format!("{}/v1/pages/{}", self.config.api_base, remote_id);
        self.send_json(self.client.patch(url), &notion_status_payload(status))
            .await?;
        Ok(())
    }
}

/// Push notifications over a plain HTTP POST (ntfy-style topic URL).
#[derive(Debug, Clone)]
pub struct NtfyNotifier {
    client: reqwest::Client,
    channel_url: String,
}

impl NtfyNotifier {
    pub fn new(client: reqwest::Client, channel_url: impl Into<String>) -> Self {
        Self {
            client,
            channel_url: channel_url.into(),
        }
    }
}

#[async_trait]
impl Notifier for NtfyNotifier {
    async fn send(&self, text: &str) -> Result<(), NotifyError> {
        let resp = self
            .client
            .post(self.channel_url.as_str())
            .header("Title", NOTIFICATION_TITLE)
            .header("Tags", NOTIFICATION_TAGS)
            .body(text.to_string())
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(NotifyError::Status {
                status: status.as_u16(),
            });
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reconcile: ReconcileReport,
    pub sync: SyncReport,
}

impl RunSummary {
    pub fn fetch_failures(&self) -> usize {
        usize::from(!self.reconcile.completed())
    }

    pub fn remote_failures(&self) -> usize {
        self.sync.remote_failures()
    }

    pub fn is_total_fetch_failure(&self) -> bool {
        self.reconcile.is_total_fetch_failure()
    }
}

/// Crawl, reconcile, then sync, strictly in that order.
pub async fn run_pass(
    store: &ListingStore,
    crawler: &mut dyn SourceCrawler,
    remote: &dyn RemoteDirectory,
    notifier: &dyn Notifier,
) -> Result<RunSummary> {
    let run_id = Uuid::new_v4();
    let started_at = Utc::now();

    let span = info_span!("run", %run_id);
    async move {
        let reconcile = reconcile_pass(store, crawler)
            .await
            .context("reconciling crawl pass")?;
        let sync = SyncEngine::new(store, remote, notifier)
            .run()
            .await
            .context("syncing remote directory")?;

        Ok(RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            reconcile,
            sync,
        })
    }
    .instrument(span)
    .await
}

pub struct SyncPipeline {
    config: SyncConfig,
    http: HttpFetcher,
    remote: NotionDirectory,
    notifier: NtfyNotifier,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(config: SyncConfig) -> Result<Self> {
        let http_config = config.http_client_config();
        let client = http_config.build_client()?;
        let http = HttpFetcher::new(http_config)?;
        let remote = NotionDirectory::new(client.clone(), config.notion.clone());
        let notifier = NtfyNotifier::new(client, config.notifications_channel.clone());
        Ok(Self {
            config,
            http,
            remote,
            notifier,
            run_lock: Mutex::new(()),
        })
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub async fn open_store(&self) -> Result<ListingStore> {
        ListingStore::open(&self.config.db_path)
            .await
            .with_context(|| format!("opening listing store {}", self.config.db_path.display()))
    }

    async fn crawler(&self) -> Result<Box<dyn SourceCrawler>> {
        if let Some(dir) = &self.config.fixture_dir {
            let crawler = FixtureCrawler::from_dir(dir, &self.config.argenprop_base_link)
                .await
                .with_context(|| format!("loading fixture pages from {}", dir.display()))?;
            return Ok(Box::new(crawler));
        }
        let crawler = ArgenpropCrawler::new(
            self.http.clone(),
            &self.config.argenprop_base_link,
            &self.config.argenprop_search_link,
            self.config.max_pages,
        )
        .context("building argenprop crawler")?;
        Ok(Box::new(crawler))
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let _guard = self.run_lock.lock().await;
        self.run_locked().await
    }

    async fn run_locked(&self) -> Result<RunSummary> {
        let store = self.open_store().await?;
        let mut crawler = self.crawler().await?;
        let summary = run_pass(&store, crawler.as_mut(), &self.remote, &self.notifier).await;
        store.pool().close().await;
        summary
    }

    /// Crawl and reconcile only; the remote directory is not touched.
    pub async fn crawl_once(&self) -> Result<ReconcileReport> {
        let _guard = self.run_lock.lock().await;
        let store = self.open_store().await?;
        let mut crawler = self.crawler().await?;
        let report = reconcile_pass(&store, crawler.as_mut())
            .await
            .context("reconciling crawl pass")?;
        store.pool().close().await;
        Ok(report)
    }

    /// Replay pending creates/deactivations without crawling.
    pub async fn sync_once(&self) -> Result<SyncReport> {
        let _guard = self.run_lock.lock().await;
        let store = self.open_store().await?;
        let report = SyncEngine::new(&store, &self.remote, &self.notifier)
            .run()
            .await
            .context("syncing remote directory")?;
        store.pool().close().await;
        Ok(report)
    }

    pub async fn stats(&self) -> Result<StoreStats> {
        let store = self.open_store().await?;
        let stats = store.stats().await.context("reading store stats")?;
        store.pool().close().await;
        Ok(stats)
    }

    /// Cron-driven runs. A tick that fires while a run is active is skipped.
    pub async fn maybe_build_scheduler(self: &Arc<Self>) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }

        let sched = JobScheduler::new().await.context("creating scheduler")?;
        for cron in [&self.config.sync_cron_1, &self.config.sync_cron_2] {
            let pipeline = Arc::clone(self);
            let job = Job::new_async(cron.as_str(), move |_uuid, _l| {
                let pipeline = Arc::clone(&pipeline);
                Box::pin(async move {
                    let Ok(_guard) = pipeline.run_lock.try_lock() else {
                        warn!("previous run still active, skipping scheduled run");
                        return;
                    };
                    match pipeline.run_locked().await {
                        Ok(summary) => info!(
                            run_id = %summary.run_id,
                            created = summary.sync.created,
                            deactivated = summary.sync.deactivated,
                            "scheduled run finished"
                        ),
                        Err(err) => error!(error = %format!("{err:#}"), "scheduled run failed"),
                    }
                })
            })
            .with_context(|| format!("creating scheduler job for cron {cron}"))?;
            sched.add(job).await.context("adding scheduler job")?;
        }
        Ok(Some(sched))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rentwatch_adapters::{CrawlError, CrawledPage, PageFetcher};
    use rentwatch_core::RawListing;
    use rentwatch_storage::{FetchError, FetchedResponse};
    use std::collections::{BTreeMap, HashMap, VecDeque};
    use std::sync::Mutex as StdMutex;

    struct ScriptedCrawler {
        pages: VecDeque<Result<Vec<RawListing>, CrawlError>>,
        served: usize,
    }

    impl ScriptedCrawler {
        fn new(pages: Vec<Result<Vec<RawListing>, CrawlError>>) -> Self {
            Self {
                pages: pages.into(),
                served: 0,
            }
        }

        fn single(listings: Vec<RawListing>) -> Self {
            Self::new(vec![Ok(listings)])
        }
    }

    #[async_trait]
    impl SourceCrawler for ScriptedCrawler {
        fn source_id(&self) -> &'static str {
            "scripted"
        }

        async fn next_page(&mut self) -> Result<Option<CrawledPage>, CrawlError> {
            match self.pages.pop_front() {
                None => Ok(None),
                Some(Err(err)) => Err(err),
                Some(Ok(listings)) => {
                    self.served += 1;
                    Ok(Some(CrawledPage {
                        url: format!("page-{}", self.served),
                        listings,
                    }))
                }
            }
        }
    }

    fn fetch_failure() -> CrawlError {
        CrawlError::Fetch {
            url: "https://www.argenprop.com/departamentos?pagina-2".into(),
            source: FetchError::HttpStatus {
                status: 503,
                url: "https://www.argenprop.com/departamentos?pagina-2".into(),
            },
        }
    }

    fn raw(link: &str, price: &str) -> RawListing {
        RawListing {
            price: Some(price.to_string()),
            address: Some(format!("Calle {link}")),
            ..RawListing::new(link)
        }
    }

    #[derive(Default)]
    struct FakeState {
        records: BTreeMap<String, (i64, RemoteStatus)>,
        fail_create: HashSet<i64>,
        fail_find: HashSet<i64>,
        creates: Vec<i64>,
        finds: usize,
        updates: usize,
    }

    #[derive(Default)]
    struct FakeDirectory {
        state: StdMutex<FakeState>,
    }

    impl FakeDirectory {
        fn failing_create(ids: &[i64]) -> Self {
            let dir = Self::default();
            dir.state.lock().unwrap().fail_create = ids.iter().copied().collect();
            dir
        }

        fn status_of(&self, correlation_id: i64) -> Vec<RemoteStatus> {
            self.state
                .lock()
                .unwrap()
                .records
                .values()
                .filter(|(id, _)| *id == correlation_id)
                .map(|(_, status)| *status)
                .collect()
        }
    }

    #[async_trait]
    impl RemoteDirectory for FakeDirectory {
        async fn create(&self, record: &CreateRecord) -> Result<String, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.creates.push(record.correlation_id);
            if state.fail_create.contains(&record.correlation_id) {
                return Err(RemoteError::Status {
                    status: 502,
                    body: "bad gateway".into(),
                });
            }
            let remote_id = format!("page-{}", state.records.len() + 1);
            state
                .records
                .insert(remote_id.clone(), (record.correlation_id, RemoteStatus::Active));
            Ok(remote_id)
        }

        async fn find_by_correlation_id(
            &self,
            correlation_id: i64,
            status: RemoteStatus,
        ) -> Result<Option<String>, RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.finds += 1;
            if state.fail_find.contains(&correlation_id) {
                return Err(RemoteError::Decode("query timed out".into()));
            }
            Ok(state
                .records
                .iter()
                .find(|(_, (id, s))| *id == correlation_id && *s == status)
                .map(|(remote_id, _)| remote_id.clone()))
        }

        async fn set_status(&self, remote_id: &str, status: RemoteStatus) -> Result<(), RemoteError> {
            let mut state = self.state.lock().unwrap();
            state.updates += 1;
            match state.records.get_mut(remote_id) {
                Some(record) => {
                    record.1 = status;
                    Ok(())
                }
                None => Err(RemoteError::Status {
                    status: 404,
                    body: "not found".into(),
                }),
            }
        }
    }

    #[derive(Default)]
    struct FakeNotifier {
        sent: StdMutex<Vec<String>>,
        fail: bool,
    }

    #[async_trait]
    impl Notifier for FakeNotifier {
        async fn send(&self, text: &str) -> Result<(), NotifyError> {
            if self.fail {
                return Err(NotifyError::Status { status: 500 });
            }
            self.sent.lock().unwrap().push(text.to_string());
            Ok(())
        }
    }

    async fn reconcile(store: &ListingStore, listings: Vec<RawListing>) -> ReconcileReport {
        reconcile_pass(store, &mut ScriptedCrawler::single(listings))
            .await
            .unwrap()
    }

    async fn id_of(store: &ListingStore, link: &str) -> i64 {
        store.find_by_link(link).await.unwrap().unwrap().id
    }

    #[tokio::test]
    async fn repeated_pass_is_idempotent() {
        let store = ListingStore::in_memory().await.unwrap();
        let pass = vec![raw("A", "$ 100.000"), raw("B", "$ 200.000")];

        let first = reconcile(&store, pass.clone()).await;
        let second = reconcile(&store, pass).await;

        assert_eq!(first.inserted, 2);
        assert_eq!(second.inserted, 0);
        assert_eq!(second.deactivated, 0);
        assert_eq!(store.stats().await.unwrap().total, 2);
    }

    #[tokio::test]
    async fn duplicate_links_within_a_pass_create_one_row() {
        let store = ListingStore::in_memory().await.unwrap();
        let mut crawler = ScriptedCrawler::new(vec![
            Ok(vec![raw("A", "1"), raw(" A ", "2")]),
            Ok(vec![raw("A", "3"), raw("", "4")]),
        ]);

        let report = reconcile_pass(&store, &mut crawler).await.unwrap();

        assert!(report.completed());
        assert_eq!(report.pages, 2);
        assert_eq!(report.observed, 4);
        assert_eq!(report.unique_links, 1);
        assert_eq!(report.inserted, 1);
        assert_eq!(report.skipped_without_link, 1);
        let stored = store.find_by_link("A").await.unwrap().unwrap();
        assert_eq!(stored.attributes.price, Some(1));
        assert_eq!(store.stats().await.unwrap().total, 1);
    }

    #[tokio::test]
    async fn unseen_listing_is_deactivated_after_complete_pass() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1"), raw("B", "1"), raw("C", "1")]).await;

        let report = reconcile(&store, vec![raw("A", "1"), raw("C", "1")]).await;

        assert_eq!(report.deactivated, 1);
        for (link, active) in [("A", true), ("B", false), ("C", true)] {
            let listing = store.find_by_link(link).await.unwrap().unwrap();
            assert_eq!(listing.is_active, active, "listing {link}");
        }
    }

    #[tokio::test]
    async fn interrupted_pass_does_not_deactivate() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1"), raw("B", "1"), raw("C", "1")]).await;

        let mut crawler = ScriptedCrawler::new(vec![
            Ok(vec![raw("A", "1"), raw("D", "1")]),
            Err(fetch_failure()),
        ]);
        let report = reconcile_pass(&store, &mut crawler).await.unwrap();

        assert!(!report.completed());
        assert!(!report.is_total_fetch_failure());
        assert_eq!(report.deactivated, 0);
        assert_eq!(report.inserted, 1, "inserts before the failure are kept");
        let stats = store.stats().await.unwrap();
        assert_eq!(stats.total, 4);
        assert_eq!(stats.active, 4);
    }

    struct SinglePage(String);

    #[async_trait]
    impl PageFetcher for SinglePage {
        async fn fetch_page(&self, url: &str) -> Result<FetchedResponse, FetchError> {
            Ok(FetchedResponse {
                status: reqwest::StatusCode::OK,
                final_url: url.to_string(),
                body: self.0.clone().into_bytes(),
            })
        }
    }

    #[tokio::test]
    async fn truncated_crawl_does_not_deactivate() {
        let store = ListingStore::in_memory().await.unwrap();
        let base = "https://www.argenprop.com";
        let seen = |id: u32| format!("{base}/depto--{id}");
        reconcile(&store, vec![raw(&seen(1), "1"), raw(&seen(2), "1"), raw(&seen(3), "1")]).await;

        let page = r#"
            <div class="listing__item"><a class="card" href="/depto--1"></a></div>
            <div class="pagination__page-next"><a href="/departamentos?pagina-2">Siguiente</a></div>
        "#;
        let mut crawler =
            ArgenpropCrawler::new(SinglePage(page.to_string()), base, "/departamentos", 1).unwrap();
        let report = reconcile_pass(&store, &mut crawler).await.unwrap();

        assert_eq!(report.pages, 1);
        assert!(!report.completed());
        assert!(report.fetch_error.as_deref().unwrap().contains("page limit"));
        assert_eq!(report.deactivated, 0);
        assert_eq!(store.stats().await.unwrap().active, 3);
    }

    #[tokio::test]
    async fn inactive_listing_stays_inactive_when_it_reappears() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "$ 1.000")]).await;
        reconcile(&store, vec![]).await;

        let report = reconcile(&store, vec![raw("A", "$ 9.999")]).await;

        assert_eq!(report.inserted, 0);
        let listing = store.find_by_link("A").await.unwrap().unwrap();
        assert!(!listing.is_active);
        assert_eq!(listing.attributes.price, Some(1_000));
    }

    #[tokio::test]
    async fn created_listing_is_not_created_twice() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1")]).await;
        let remote = FakeDirectory::default();
        let notifier = FakeNotifier::default();

        let first = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();
        let second = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();

        assert_eq!(first.created, 1);
        assert_eq!(second.created, 0);
        let a = id_of(&store, "A").await;
        assert_eq!(remote.state.lock().unwrap().creates, vec![a]);
        assert!(!store.get(a).await.unwrap().unwrap().is_new);
        assert_eq!(notifier.sent.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn failed_create_is_retried_and_does_not_block_batch() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1"), raw("B", "2"), raw("C", "3")]).await;
        let b = id_of(&store, "B").await;
        let remote = FakeDirectory::failing_create(&[b]);
        let notifier = FakeNotifier::default();

        let report = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();

        assert_eq!(report.created, 2);
        assert_eq!(report.create_failures, 1);
        assert_eq!(report.remote_failures(), 1);
        assert!(store.get(b).await.unwrap().unwrap().is_new);
        let pending: Vec<_> = store.list_new().await.unwrap().into_iter().map(|l| l.id).collect();
        assert_eq!(pending, vec![b]);

        remote.state.lock().unwrap().fail_create.clear();
        let retry = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();
        assert_eq!(retry.created, 1);
        assert!(store.list_new().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn deactivation_happens_once() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1")]).await;
        let remote = FakeDirectory::default();
        let notifier = FakeNotifier::default();
        SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();

        reconcile(&store, vec![]).await;
        let first = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();
        let finds_after_first = remote.state.lock().unwrap().finds;
        let second = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();

        assert_eq!(first.deactivated, 1);
        assert_eq!(second.deactivated, 0);
        assert_eq!(remote.state.lock().unwrap().finds, finds_after_first);
        assert_eq!(remote.state.lock().unwrap().updates, 1);
        let a = id_of(&store, "A").await;
        assert_eq!(remote.status_of(a), vec![RemoteStatus::Inactive]);
        assert!(store.get(a).await.unwrap().unwrap().deactivation_synced);
    }

    #[tokio::test]
    async fn failed_deactivation_is_retried_next_run() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1"), raw("B", "1")]).await;
        let remote = FakeDirectory::default();
        let notifier = FakeNotifier::default();
        SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();
        reconcile(&store, vec![]).await;
        let a = id_of(&store, "A").await;
        remote.state.lock().unwrap().fail_find.insert(a);

        let first = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();
        assert_eq!(first.deactivated, 1);
        assert_eq!(first.deactivate_failures, 1);
        assert!(!store.get(a).await.unwrap().unwrap().deactivation_synced);

        remote.state.lock().unwrap().fail_find.clear();
        let second = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();
        assert_eq!(second.deactivated, 1);
        assert!(store.list_newly_inactive().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn never_created_listing_is_skipped_until_created() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1")]).await;
        reconcile(&store, vec![]).await;
        let a = id_of(&store, "A").await;
        let remote = FakeDirectory::failing_create(&[a]);
        let notifier = FakeNotifier::default();

        let first = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();
        assert_eq!(first.never_created, 1);
        assert_eq!(first.deactivate_failures, 0);
        assert_eq!(store.list_newly_inactive().await.unwrap().len(), 1);

        remote.state.lock().unwrap().fail_create.clear();
        let second = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();
        assert_eq!(second.created, 1);
        assert_eq!(second.deactivated, 1);
        assert_eq!(remote.status_of(a), vec![RemoteStatus::Inactive]);
    }

    #[tokio::test]
    async fn remote_already_inactive_is_settled_without_update() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1")]).await;
        let a = id_of(&store, "A").await;
        store.mark_synced(a).await.unwrap();
        reconcile(&store, vec![]).await;
        let remote = FakeDirectory::default();
        let notifier = FakeNotifier::default();

        let report = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();

        assert_eq!(report.deactivated, 0);
        assert_eq!(report.already_inactive, 1);
        assert_eq!(remote.state.lock().unwrap().updates, 0);
        assert!(store.get(a).await.unwrap().unwrap().deactivation_synced);
        assert!(notifier.sent.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn notification_failure_does_not_fail_sync() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1")]).await;
        let remote = FakeDirectory::default();
        let notifier = FakeNotifier {
            fail: true,
            ..Default::default()
        };

        let report = SyncEngine::new(&store, &remote, &notifier).run().await.unwrap();

        assert_eq!(report.created, 1);
        assert!(report.notify_failed);
        assert!(!report.notified);
        assert_eq!(report.remote_failures(), 1);
    }

    #[tokio::test]
    async fn end_to_end_listing_lifecycle() {
        let store = ListingStore::in_memory().await.unwrap();
        let remote = FakeDirectory::default();
        let notifier = FakeNotifier::default();

        let first = run_pass(
            &store,
            &mut ScriptedCrawler::single(vec![raw("L1", "1000")]),
            &remote,
            &notifier,
        )
        .await
        .unwrap();
        assert_eq!(first.reconcile.inserted, 1);
        assert_eq!((first.sync.created, first.sync.deactivated), (1, 0));

        let l1 = store.find_by_link("L1").await.unwrap().unwrap();
        assert_eq!(l1.attributes.price, Some(1000));
        assert!(l1.is_active);
        assert!(!l1.is_new);

        let second = run_pass(&store, &mut ScriptedCrawler::new(vec![]), &remote, &notifier)
            .await
            .unwrap();
        assert_eq!(second.reconcile.deactivated, 1);
        assert_eq!((second.sync.created, second.sync.deactivated), (0, 1));
        assert_eq!(second.fetch_failures(), 0);
        assert!(!store.get(l1.id).await.unwrap().unwrap().is_active);
        assert_eq!(remote.status_of(l1.id), vec![RemoteStatus::Inactive]);

        assert_eq!(
            *notifier.sent.lock().unwrap(),
            vec![
                "Se encontraron 1 nuevos departamentos!".to_string(),
                "Se eliminaron 1 publicaciones".to_string(),
            ]
        );
    }

    #[tokio::test]
    async fn first_page_failure_is_a_total_fetch_failure() {
        let store = ListingStore::in_memory().await.unwrap();
        reconcile(&store, vec![raw("A", "1")]).await;
        let remote = FakeDirectory::default();
        let notifier = FakeNotifier::default();

        let summary = run_pass(
            &store,
            &mut ScriptedCrawler::new(vec![Err(fetch_failure())]),
            &remote,
            &notifier,
        )
        .await
        .unwrap();

        assert!(summary.reconcile.is_total_fetch_failure());
        assert!(summary.is_total_fetch_failure());
        assert_eq!(summary.fetch_failures(), 1);
        assert!(summary.reconcile.fetch_error.as_deref().unwrap().contains("503"));
        assert_eq!(store.stats().await.unwrap().active, 1);
        assert_eq!(summary.sync.created, 1, "pending work is still synced");
    }

    #[test]
    fn summary_text_combines_counts() {
        assert_eq!(summary_text(0, 0), None);
        assert_eq!(
            summary_text(3, 0).as_deref(),
            Some("Se encontraron 3 nuevos departamentos!")
        );
        assert_eq!(summary_text(0, 2).as_deref(), Some("Se eliminaron 2 publicaciones"));
        assert_eq!(
            summary_text(3, 2).as_deref(),
            Some("Se encontraron 3 nuevos departamentos!\nAdemas, se eliminaron 2 publicaciones")
        );
    }

    fn full_env() -> HashMap<&'static str, String> {
        HashMap::from([
            ("RENTWATCH_DB_PATH", "/tmp/listings.db".to_string()),
            ("NOTION_TOKEN", "secret_abc".to_string()),
            ("NOTION_DATABASE_ID", "db123".to_string()),
            ("NOTIFICATIONS_CHANNEL", "https://ntfy.sh/deptos".to_string()),
            ("ARGENPROP_BASE_LINK", "https://www.argenprop.com".to_string()),
            ("ARGENPROP_SEARCH_LINK", "/departamentos/alquiler".to_string()),
        ])
    }

    #[test]
    fn config_reports_every_missing_key() {
        let mut env = full_env();
        env.remove("NOTION_TOKEN");
        env.insert("NOTIFICATIONS_CHANNEL", "   ".to_string());

        let err = SyncConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Missing(vec!["NOTION_TOKEN", "NOTIFICATIONS_CHANNEL"])
        );
        assert!(err.to_string().contains("NOTION_TOKEN, NOTIFICATIONS_CHANNEL"));
    }

    #[test]
    fn config_defaults_and_invalid_values() {
        let env = full_env();
        let config = SyncConfig::from_lookup(|k| env.get(k).cloned()).unwrap();
        assert_eq!(config.db_path, PathBuf::from("/tmp/listings.db"));
        assert_eq!(config.notion.api_base, "https://api.notion.com");
        assert_eq!(config.http_timeout_secs, 20);
        assert_eq!(config.max_pages, 50);
        assert!(!config.scheduler_enabled);
        assert!(config.fixture_dir.is_none());

        let mut env = full_env();
        env.insert("RENTWATCH_MAX_PAGES", "lots".to_string());
        let err = SyncConfig::from_lookup(|k| env.get(k).cloned()).unwrap_err();
        assert_eq!(
            err,
            ConfigError::Invalid {
                key: "RENTWATCH_MAX_PAGES",
                value: "lots".to_string()
            }
        );
    }

    #[test]
    fn notion_create_payload_carries_correlation_id() {
        let record = CreateRecord {
            correlation_id: 7,
            link: "https://www.argenprop.com/depto--7".into(),
            attributes: ListingAttributes {
                price: Some(420_000),
                address: Some("Gorriti 4800".into()),
                ..Default::default()
            },
        };

        let payload = notion_create_payload("db123", &record);
        let props = &payload["properties"];
        assert_eq!(payload["parent"]["database_id"], "db123");
        assert_eq!(props["listingId"]["number"], 7);
        assert_eq!(props["Precio"]["number"], 420_000);
        assert!(props["Expensas"]["number"].is_null());
        assert_eq!(props["Direccion"]["title"][0]["text"]["content"], "Gorriti 4800");
        assert_eq!(props["Localidad"]["rich_text"][0]["text"]["content"], "");
        assert_eq!(props["Estado"]["select"]["name"], "Activo");
        assert!(payload.get("cover").is_none());

        let with_image = CreateRecord {
            attributes: ListingAttributes {
                image: Some("https://img.test/7.jpg".into()),
                ..record.attributes.clone()
            },
            ..record
        };
        let payload = notion_create_payload("db123", &with_image);
        assert_eq!(payload["cover"]["external"]["url"], "https://img.test/7.jpg");
        assert_eq!(payload["children"][0]["image"]["external"]["url"], "https://img.test/7.jpg");
    }

    #[test]
    fn notion_query_and_status_payloads() {
        let query = notion_query_payload(7, RemoteStatus::Active);
        assert_eq!(query["filter"]["and"][0]["number"]["equals"], 7);
        assert_eq!(query["filter"]["and"][1]["select"]["equals"], "Activo");

        let update = notion_status_payload(RemoteStatus::Inactive);
        assert_eq!(update["properties"]["Estado"]["select"]["name"], "Inactivo");

        let body = json!({ "results": [{ "id": "page-1" }, { "id": "page-2" }] });
        assert_eq!(first_result_id(&body).as_deref(), Some("page-1"));
        assert_eq!(first_result_id(&json!({ "results": [] })), None);
    }
}

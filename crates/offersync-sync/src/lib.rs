//! Synchronization runs: bounded fetching, listing discovery and the
//! load / reconcile / save cycle over an offer store.

use std::collections::{HashSet, VecDeque};
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use chrono::Utc;
use futures::future::join_all;
use futures::FutureExt;
use offersync_adapters::{HtmlListingSite, ListingSite};
use offersync_core::{CrawlBatchResult, ListingId, OfferTable, ScrapedOffer, StoreStats};
use offersync_storage::{CsvOfferStore, HttpClientConfig, HttpFetcher, OfferStore};
use reqwest::Url;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offersync-sync";

/// Query parameter carrying the result page number.
pub const PAGE_PARAM: &str = "page";

pub const DEFAULT_DB_PATH: &str = "offers.csv";
pub const DEFAULT_WORKERS: usize = 4;
pub const DEFAULT_PAUSE_MS: u64 = 2_000;
pub const DEFAULT_HTTP_TIMEOUT_SECS: u64 = 20;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ExecutorError {
    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Runs a unit of work over many inputs with at most `worker_count` in flight.
///
/// Each worker sleeps for `pause` after every unit it finishes, so a run over
/// `n` inputs takes at least `ceil(n / worker_count) * pause`. A failing or
/// panicking unit is logged with its input and yields `None` in its slot.
#[derive(Debug, Clone)]
pub struct FetchExecutor {
    worker_count: usize,
    pause: Duration,
}

impl FetchExecutor {
    pub fn new(worker_count: usize, pause: Duration) -> Result<Self, ExecutorError> {
        if worker_count == 0 {
            return Err(ExecutorError::NoWorkers);
        }
        Ok(Self {
            worker_count,
            pause,
        })
    }

    pub fn worker_count(&self) -> usize {
        self.worker_count
    }

    pub fn pause(&self) -> Duration {
        self.pause
    }

    /// Applies `work` to every input exactly once. The output is aligned with
    /// the input order regardless of completion order.
    pub async fn execute<I, R, E, F, Fut>(&self, inputs: Vec<I>, work: F) -> Vec<Option<R>>
    where
        I: fmt::Display,
        E: fmt::Display,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let total = inputs.len();
        if total == 0 {
            return Vec::new();
        }

        let queue = Mutex::new(inputs.into_iter().enumerate().collect::<VecDeque<_>>());
        let workers = (0..self.worker_count.min(total))
            .map(|worker| self.run_worker(worker, &queue, &work));
        let finished = join_all(workers).await;

        let mut results: Vec<Option<R>> = (0..total).map(|_| None).collect();
        for (index, outcome) in finished.into_iter().flatten() {
            results[index] = outcome;
        }
        results
    }

    async fn run_worker<I, R, E, F, Fut>(
        &self,
        worker: usize,
        queue: &Mutex<VecDeque<(usize, I)>>,
        work: &F,
    ) -> Vec<(usize, Option<R>)>
    where
        I: fmt::Display,
        E: fmt::Display,
        F: Fn(I) -> Fut,
        Fut: Future<Output = Result<R, E>>,
    {
        let mut done = Vec::new();
        loop {
            let next = queue.lock().await.pop_front();
            let Some((index, input)) = next else {
                break;
            };
            let label = input.to_string();

            let outcome = match AssertUnwindSafe(async { work(input).await })
                .catch_unwind()
                .await
            {
                Ok(Ok(value)) => Some(value),
                Ok(Err(err)) => {
                    warn!(worker, input = %label, error = %err, "unit of work failed");
                    None
                }
                Err(_) => {
                    error!(worker, input = %label, "unit of work panicked");
                    None
                }
            };
            done.push((index, outcome));

            if !self.pause.is_zero() {
                tokio::time::sleep(self.pause).await;
            }
        }
        done
    }
}

/// Builds the URLs of result pages `1..=pages` for a search.
///
/// Any page parameter already on the search URL is replaced; other query
/// parameters keep their order. A page count of zero is treated as one.
pub fn page_urls(search_url: &str, pages: u32) -> Vec<String> {
    let pages = pages.max(1);
    let Ok(base) = Url::parse(search_url) else {
        return page_urls_textual(search_url, pages);
    };

    let retained: Vec<(String, String)> = base
        .query_pairs()
        .filter(|(key, _)| key != PAGE_PARAM)
        .map(|(key, value)| (key.into_owned(), value.into_owned()))
        .collect();

    (1..=pages)
        .map(|page| {
            let mut url = base.clone();
            url.query_pairs_mut()
                .clear()
                .extend_pairs(retained.iter().map(|(k, v)| (k.as_str(), v.as_str())))
                .append_pair(PAGE_PARAM, &page.to_string());
            url.to_string()
        })
        .collect()
}

fn page_urls_textual(search_url: &str, pages: u32) -> Vec<String> {
    let (path, query) = match search_url.split_once('?') {
        Some((path, query)) => (path, query),
        None => (search_url, ""),
    };
    let prefix = format!("{PAGE_PARAM}=");
    let kept: Vec<&str> = query
        .split('&')
        .filter(|pair| !pair.is_empty() && !pair.starts_with(&prefix) && *pair != PAGE_PARAM)
        .collect();

    (1..=pages)
        .map(|page| {
            let mut pairs = kept.clone();
            let page_pair = format!("{PAGE_PARAM}={page}");
            pairs.push(&page_pair);
            format!("{path}?{}", pairs.join("&"))
        })
        .collect()
}

/// Collects listing identities across every result page of a search.
///
/// Identities come back in page order, then card order; duplicates are kept.
/// A failed page count means one page, and a failed page contributes nothing.
pub async fn discover<S>(site: &S, executor: &FetchExecutor, search_query: &str) -> Vec<ListingId>
where
    S: ListingSite + ?Sized,
{
    let pages = match site.page_count(search_query).await {
        Ok(0) => {
            warn!("site reported zero result pages, crawling the first one");
            1
        }
        Ok(pages) => pages,
        Err(err) => {
            info!(error = %err, "page count unavailable, crawling the first page only");
            1
        }
    };

    let urls = page_urls(search_query, pages);
    let per_page = executor
        .execute(urls, |url: String| async move { site.listing_ids(&url).await })
        .await;

    let failed_pages = per_page.iter().filter(|page| page.is_none()).count();
    let identities: Vec<ListingId> = per_page.into_iter().flatten().flatten().collect();
    if failed_pages > 0 {
        warn!(
            pages,
            failed_pages,
            "result pages failed; their listings will be treated as missing this run"
        );
    }
    info!(
        pages,
        failed_pages,
        identities = identities.len(),
        "listing discovery finished"
    );
    identities
}

#[derive(Debug, Clone, PartialEq)]
pub struct SyncConfig {
    pub db_path: PathBuf,
    pub worker_count: usize,
    pub pause: Duration,
    pub http_timeout_secs: u64,
    pub user_agent: Option<String>,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from(DEFAULT_DB_PATH),
            worker_count: DEFAULT_WORKERS,
            pause: Duration::from_millis(DEFAULT_PAUSE_MS),
            http_timeout_secs: DEFAULT_HTTP_TIMEOUT_SECS,
            user_agent: None,
        }
    }
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds a config from an arbitrary variable source; unparsable values fall back to defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        Self {
            db_path: lookup("OFFERSYNC_DB_PATH")
                .filter(|v| !v.trim().is_empty())
                .map(PathBuf::from)
                .unwrap_or(defaults.db_path),
            worker_count: lookup("OFFERSYNC_WORKERS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.worker_count),
            pause: lookup("OFFERSYNC_PAUSE_MS")
                .and_then(|v| v.trim().parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(defaults.pause),
            http_timeout_secs: lookup("OFFERSYNC_HTTP_TIMEOUT_SECS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.http_timeout_secs),
            user_agent: lookup("OFFERSYNC_USER_AGENT").filter(|v| !v.trim().is_empty()),
        }
    }

    pub fn validate(&self) -> Result<(), ExecutorError> {
        if self.worker_count == 0 {
            return Err(ExecutorError::NoWorkers);
        }
        Ok(())
    }

    pub fn executor(&self) -> Result<FetchExecutor, ExecutorError> {
        FetchExecutor::new(self.worker_count, self.pause)
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        let mut http = HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            ..HttpClientConfig::default()
        };
        if let Some(agent) = &self.user_agent {
            http.user_agents = vec![agent.clone()];
        }
        http
    }
}

/// Reconciles a store with what a listing site currently shows for a search.
pub struct Synchronizer<S, St> {
    site: S,
    store: St,
    executor: FetchExecutor,
}

impl Synchronizer<HtmlListingSite, CsvOfferStore> {
    /// Live site over HTTP, CSV store at `config.db_path`.
    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        config.validate()?;
        let http = HttpFetcher::new(config.http_client_config())?;
        Ok(Self::new(
            HtmlListingSite::new(Arc::new(http)),
            CsvOfferStore::new(&config.db_path),
            config.executor()?,
        ))
    }
}

impl<S, St> Synchronizer<S, St>
where
    S: ListingSite,
    St: OfferStore,
{
    pub fn new(site: S, store: St, executor: FetchExecutor) -> Self {
        Self {
            site,
            store,
            executor,
        }
    }

    pub fn site(&self) -> &S {
        &self.site
    }

    pub fn store(&self) -> &St {
        &self.store
    }

    pub fn executor(&self) -> &FetchExecutor {
        &self.executor
    }

    /// Loads the store, reconciles it against `search_query` and saves it back.
    ///
    /// Load and save failures abort the run; nothing is persisted on error.
    pub async fn synchronize(&self, search_query: &str) -> Result<CrawlBatchResult> {
        let table = self.store.load().await.context("loading offer store")?;
        let (table, result) = self.synchronize_table(table, search_query).await;
        self.store
            .save(&table)
            .await
            .context("saving offer store")?;
        info!(
            run_id = %result.run_id,
            new = result.new_offers,
            updated = result.updated_offers,
            inactive = result.inactive_offers,
            failed = result.failed_scrapes,
            "sync run persisted"
        );
        Ok(result)
    }

    /// The reconcile step on its own, without touching the store.
    pub async fn synchronize_table(
        &self,
        table: OfferTable,
        search_query: &str,
    ) -> (OfferTable, CrawlBatchResult) {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, search_query);
        self.reconcile(run_id, table, search_query)
            .instrument(span)
            .await
    }

    async fn reconcile(
        &self,
        run_id: Uuid,
        mut table: OfferTable,
        search_query: &str,
    ) -> (OfferTable, CrawlBatchResult) {
        let started_at = Utc::now();
        let clock = Instant::now();
        info!(known_offers = table.len(), "sync run started");

        let identities = discover(&self.site, &self.executor, search_query).await;
        let known = table.all_identities();

        if identities.is_empty() && !table.identities_for_query(search_query).is_empty() {
            warn!("discovery returned nothing; every offer of this search will be deactivated");
        }

        let mut queued: HashSet<&ListingId> = HashSet::new();
        let to_fetch: Vec<ListingId> = identities
            .iter()
            .filter(|id| !known.contains(*id) && queued.insert(*id))
            .cloned()
            .collect();

        let site = &self.site;
        let details = self
            .executor
            .execute(to_fetch.clone(), |id: ListingId| async move {
                Ok::<_, Infallible>(site.fetch_detail(&id).await)
            })
            .await;

        let scraped: Vec<ScrapedOffer> = to_fetch
            .into_iter()
            .zip(details)
            .filter_map(|(id, detail)| {
                let attributes = detail.flatten().filter(|attrs| !attrs.is_empty());
                if attributes.is_none() {
                    warn!(identity = %id, "detail scrape failed, will retry on a later run");
                }
                attributes.map(|attributes| ScrapedOffer { id, attributes })
            })
            .collect();
        let failed_scrapes = queued.len() - scraped.len();

        let now = Utc::now();
        let new_offers = table.add_new(scraped, search_query, now);
        let updated_offers = table.refresh(identities.iter().filter(|id| known.contains(*id)), now);
        let observed: HashSet<ListingId> = identities.iter().cloned().collect();
        let inactive_offers = table.deactivate_missing(&observed, search_query, now);

        let result = CrawlBatchResult {
            run_id,
            search_query: search_query.to_string(),
            started_at,
            total_found: identities.len(),
            new_offers,
            updated_offers,
            inactive_offers,
            failed_scrapes,
            duration_seconds: clock.elapsed().as_secs_f64(),
        };
        info!(
            total_found = result.total_found,
            new_offers,
            updated_offers,
            inactive_offers,
            failed_scrapes,
            duration_seconds = result.duration_seconds,
            "sync run reconciled"
        );
        (table, result)
    }
}

pub async fn store_stats<St>(store: &St) -> Result<StoreStats>
where
    St: OfferStore + ?Sized,
{
    let table = store.load().await.context("loading offer store")?;
    Ok(table.stats())
}

/// Collapses duplicate identities in the store. Saves only when something was removed.
pub async fn deduplicate_store<St>(store: &St) -> Result<usize>
where
    St: OfferStore + ?Sized,
{
    let mut table = store.load().await.context("loading offer store")?;
    let removed = table.deduplicate();
    if removed > 0 {
        store.save(&table).await.context("saving offer store")?;
    }
    info!(removed, "deduplication finished");
    Ok(removed)
}

/// Writes store contents to a CSV file at `output`, active offers only unless
/// `include_inactive` is set. Returns the number of rows written.
pub async fn export_offers<St>(store: &St, output: &Path, include_inactive: bool) -> Result<usize>
where
    St: OfferStore + ?Sized,
{
    let table = store.load().await.context("loading offer store")?;
    let exported = if include_inactive {
        table
    } else {
        table.active_table()
    };
    if exported.is_empty() {
        warn!(output = %output.display(), "no offers selected, nothing exported");
        return Ok(0);
    }
    CsvOfferStore::new(output)
        .save(&exported)
        .await
        .with_context(|| format!("writing export to {}", output.display()))?;
    info!(rows = exported.len(), output = %output.display(), "export written");
    Ok(exported.len())
}

//! Offer persistence (CSV file + in-memory) and HTTP fetch utilities.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use offersync_core::{
    AttributeMap, ListingId, OfferRecord, OfferTable, COL_FIRST_SEEN, COL_IDENTITY, COL_IS_ACTIVE,
    COL_LAST_SEEN, COL_SOURCE_QUERY, LIFECYCLE_COLUMNS,
};
use reqwest::header::USER_AGENT;
use reqwest::StatusCode;
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::{debug, info, info_span, warn, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offersync-storage";

/// Column names older store files used before the lifecycle columns were renamed.
const LEGACY_IDENTITY_COLUMN: &str = "url";
const LEGACY_SOURCE_QUERY_COLUMN: &str = "search_url";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error on {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("csv error: {0}")]
    Csv(#[from] csv::Error),
    #[error("encoding store rows: {0}")]
    Encode(String),
    #[error("store file has no identity column")]
    MissingIdentityColumn,
    #[error("in-memory store rejected save: {0}")]
    Rejected(String),
}

impl StoreError {
    fn io(path: &Path, source: std::io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Backing store for the offer table. Loads and saves are whole-table operations.
#[async_trait]
pub trait OfferStore: Send + Sync {
    /// Returns an empty table when nothing has been persisted yet.
    async fn load(&self) -> Result<OfferTable, StoreError>;

    /// Replaces the persisted contents with `table`, ordered by `last_seen` descending.
    async fn save(&self, table: &OfferTable) -> Result<(), StoreError>;
}

/// CSV file keyed by identity: lifecycle columns first, then the sorted union of
/// attribute columns.
#[derive(Debug, Clone)]
pub struct CsvOfferStore {
    path: PathBuf,
}

impl CsvOfferStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn parent_dir(&self) -> &Path {
        self.path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."))
    }

    /// Write bytes to a temp file beside the target and rename it into place.
    async fn write_atomically(&self, bytes: &[u8]) -> Result<(), StoreError> {
        let parent = self.parent_dir();
        fs::create_dir_all(parent)
            .await
            .map_err(|e| StoreError::io(parent, e))?;

        let file_name = self
            .path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "offers".to_string());
        let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

        let written = async {
            let mut file = fs::OpenOptions::new()
                .create_new(true)
                .write(true)
                .open(&temp_path)
                .await?;
            file.write_all(bytes).await?;
            file.flush().await?;
            file.sync_all().await?;
            drop(file);
            fs::rename(&temp_path, &self.path).await
        }
        .await;

        if let Err(err) = written {
            let _ = fs::remove_file(&temp_path).await;
            return Err(StoreError::io(&self.path, err));
        }
        Ok(())
    }
}

#[async_trait]
impl OfferStore for CsvOfferStore {
    async fn load(&self) -> Result<OfferTable, StoreError> {
        let exists = fs::try_exists(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        if !exists {
            info!(path = %self.path.display(), "store file does not exist, starting fresh");
            return Ok(OfferTable::new());
        }

        let bytes = fs::read(&self.path)
            .await
            .map_err(|e| StoreError::io(&self.path, e))?;
        let table = decode_table(&bytes, Utc::now())?;
        info!(path = %self.path.display(), offers = table.len(), "loaded offers");
        Ok(table)
    }

    async fn save(&self, table: &OfferTable) -> Result<(), StoreError> {
        let bytes = encode_table(table)?;
        self.write_atomically(&bytes).await?;
        info!(path = %self.path.display(), offers = table.len(), "saved offers");
        Ok(())
    }
}

/// Process-local store; used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryOfferStore {
    table: Mutex<OfferTable>,
    saves: AtomicUsize,
    reject_saves: bool,
}

impl MemoryOfferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_table(table: OfferTable) -> Self {
        Self {
            table: Mutex::new(table),
            ..Self::default()
        }
    }

    /// Store whose `save` always fails, for exercising the fatal-save path.
    pub fn rejecting_saves(table: OfferTable) -> Self {
        Self {
            table: Mutex::new(table),
            reject_saves: true,
            ..Self::default()
        }
    }

    pub async fn snapshot(&self) -> OfferTable {
        self.table.lock().await.clone()
    }

    pub fn save_count(&self) -> usize {
        self.saves.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl OfferStore for MemoryOfferStore {
    async fn load(&self) -> Result<OfferTable, StoreError> {
        Ok(self.table.lock().await.clone())
    }

    async fn save(&self, table: &OfferTable) -> Result<(), StoreError> {
        if self.reject_saves {
            return Err(StoreError::Rejected("store is read-only".to_string()));
        }
        let mut sorted = table.clone();
        sorted.sort_by_last_seen_desc();
        *self.table.lock().await = sorted;
        self.saves.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_timestamp(raw: &str) -> Option<DateTime<Utc>> {
    let raw = raw.trim();
    if raw.is_empty() {
        return None;
    }
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Some(ts.with_timezone(&Utc));
    }
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(raw, fmt).ok())
        .map(|naive| naive.and_utc())
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Serialize a table as CSV, most recently seen rows first.
pub fn encode_table(table: &OfferTable) -> Result<Vec<u8>, StoreError> {
    let mut sorted = table.clone();
    sorted.sort_by_last_seen_desc();
    let attribute_columns = sorted.attribute_columns();

    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(
        LIFECYCLE_COLUMNS
            .iter()
            .copied()
            .chain(attribute_columns.iter().map(String::as_str)),
    )?;

    for record in sorted.records() {
        let mut row = vec![
            record.id.to_string(),
            format_timestamp(record.first_seen),
            format_timestamp(record.last_seen),
            record.is_active.to_string(),
            record.source_query.clone(),
        ];
        row.extend(
            attribute_columns
                .iter()
                .map(|column| record.attributes.get(column).cloned().unwrap_or_default()),
        );
        writer.write_record(&row)?;
    }

    writer
        .into_inner()
        .map_err(|e| StoreError::Encode(e.to_string()))
}

#[derive(Debug)]
struct ColumnLayout {
    identity: usize,
    first_seen: Option<usize>,
    last_seen: Option<usize>,
    is_active: Option<usize>,
    source_query: Option<usize>,
    attributes: Vec<(usize, String)>,
}

impl ColumnLayout {
    fn resolve(headers: &csv::StringRecord) -> Result<Self, StoreError> {
        let position = |name: &str| headers.iter().position(|h| h.trim() == name);

        let identity = position(COL_IDENTITY)
            .or_else(|| position(LEGACY_IDENTITY_COLUMN))
            .ok_or(StoreError::MissingIdentityColumn)?;
        let source_query =
            position(COL_SOURCE_QUERY).or_else(|| position(LEGACY_SOURCE_QUERY_COLUMN));
        let mut layout = Self {
            identity,
            first_seen: position(COL_FIRST_SEEN),
            last_seen: position(COL_LAST_SEEN),
            is_active: position(COL_IS_ACTIVE),
            source_query,
            attributes: Vec::new(),
        };

        let claimed = [
            Some(layout.identity),
            layout.first_seen,
            layout.last_seen,
            layout.is_active,
            layout.source_query,
        ];
        layout.attributes = headers
            .iter()
            .enumerate()
            .filter(|(index, _)| !claimed.contains(&Some(*index)))
            .map(|(index, name)| (index, name.trim().to_string()))
            .filter(|(_, name)| !name.is_empty())
            .collect();
        Ok(layout)
    }
}

/// Parse a CSV store file. Missing or unparsable lifecycle values fall back to
/// `is_active = true` and `now` timestamps; rows without an identity are skipped.
pub fn decode_table(bytes: &[u8], now: DateTime<Utc>) -> Result<OfferTable, StoreError> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(bytes);
    let headers = reader.headers()?.clone();
    if headers.is_empty() {
        info!("store file has no header row, starting fresh");
        return Ok(OfferTable::new());
    }
    let layout = ColumnLayout::resolve(&headers)?;

    let mut records = Vec::new();
    let mut skipped = 0usize;
    for row in reader.records() {
        let row = row?;
        let cell = |index: Option<usize>| index.and_then(|i| row.get(i)).unwrap_or_default();

        let Some(id) = ListingId::new(cell(Some(layout.identity))) else {
            skipped += 1;
            continue;
        };

        let first_seen = parse_timestamp(cell(layout.first_seen)).unwrap_or(now);
        let last_seen = parse_timestamp(cell(layout.last_seen)).unwrap_or(now);
        let attributes: AttributeMap = layout
            .attributes
            .iter()
            .filter_map(|(index, name)| {
                let value = row.get(*index)?;
                (!value.is_empty()).then(|| (name.clone(), value.to_string()))
            })
            .collect();

        records.push(OfferRecord {
            id,
            attributes,
            first_seen,
            last_seen: last_seen.max(first_seen),
            is_active: parse_flag(cell(layout.is_active)).unwrap_or(true),
            source_query: cell(layout.source_query).to_string(),
        });
    }

    if skipped > 0 {
        warn!(skipped, "skipped store rows without an identity");
    }
    Ok(OfferTable::from_records(records))
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
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

/// Desktop browser user agents rotated across retry attempts.
pub const DEFAULT_USER_AGENTS: [&str; 4] = [
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0.0.0 Safari/537.36",
    "Mozilla/5.0 (Macintosh; Intel Mac OS X 14_4) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.4 Safari/605.1.15",
    "Mozilla/5.0 (X11; Linux x86_64; rv:125.0) Gecko/20100101 Firefox/125.0",
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:125.0) Gecko/20100101 Firefox/125.0",
];

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agents: Vec<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agents: DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect(),
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: String,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    user_agents: Vec<String>,
    next_agent: AtomicUsize,
    backoff: BackoffPolicy,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()
            .context("building reqwest client")?;

        let user_agents = if config.user_agents.is_empty() {
            DEFAULT_USER_AGENTS.iter().map(|s| s.to_string()).collect()
        } else {
            config.user_agents
        };

        Ok(Self {
            client,
            user_agents,
            next_agent: AtomicUsize::new(0),
            backoff: config.backoff,
        })
    }

    /// Next user agent in the rotation; each call advances it.
    pub fn rotate_user_agent(&self) -> &str {
        let index = self.next_agent.fetch_add(1, Ordering::Relaxed) % self.user_agents.len();
        &self.user_agents[index]
    }

    /// GET `url` as text, retrying retryable failures with a fresh user agent each attempt.
    pub async fn fetch_text(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", url);
        self.fetch_with_retries(url).instrument(span).await
    }

    async fn fetch_with_retries(&self, url: &str) -> Result<FetchedResponse, FetchError> {
        let max_retries = self.backoff.max_retries;
        let mut attempt = 0usize;

        loop {
            let last_attempt = attempt >= max_retries;
            let user_agent = self.rotate_user_agent().to_string();
            debug!(attempt, %user_agent, "sending request");

            let failure = match self.client.get(url).header(USER_AGENT, user_agent).send().await {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        let body = resp.text().await?;
                        return Ok(FetchedResponse {
                            status,
                            final_url,
                            body,
                        });
                    }

                    let failure = FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    };
                    if classify_status(status) == RetryDisposition::NonRetryable || last_attempt {
                        return Err(failure);
                    }
                    warn!(attempt, status = status.as_u16(), "retryable http status");
                    failure
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::NonRetryable || last_attempt {
                        return Err(FetchError::Request(err));
                    }
                    warn!(attempt, error = %err, "retryable request error");
                    FetchError::Request(err)
                }
            };

            debug!(attempt, error = %failure, "backing off before retry");
            tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
            attempt += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use offersync_core::ScrapedOffer;
    use std::sync::Arc;
    use tempfile::tempdir;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn scraped(raw: &str, attrs: &[(&str, &str)]) -> ScrapedOffer {
        ScrapedOffer {
            id: ListingId::new(raw).unwrap(),
            attributes: attrs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        }
    }

    fn sample_table() -> OfferTable {
        let mut table = OfferTable::new();
        table.add_new(
            vec![scraped("https://x.test/o/1", &[("title", "Golf, 2019"), ("price", "45 000")])],
            "https://x.test/search?q=golf",
            ts(1),
        );
        table.add_new(
            vec![scraped("https://x.test/o/2", &[("title", "Polo"), ("mileage", "12 km")])],
            "https://x.test/search?q=polo",
            ts(3),
        );
        table
    }

    #[tokio::test]
    async fn missing_store_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let store = CsvOfferStore::new(dir.path().join("offers.csv"));
        let table = store.load().await.expect("load");
        assert!(table.is_empty());
    }

    #[tokio::test]
    async fn save_then_load_preserves_records() {
        let dir = tempdir().expect("tempdir");
        let store = CsvOfferStore::new(dir.path().join("nested").join("offers.csv"));
        let table = sample_table();

        store.save(&table).await.expect("save");
        let loaded = store.load().await.expect("load");

        let mut expected = table.clone();
        expected.sort_by_last_seen_desc();
        assert_eq!(loaded, expected);

        let leftovers = std::fs::read_dir(dir.path().join("nested"))
            .expect("read dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".tmp"))
            .count();
        assert_eq!(leftovers, 0);
    }

    #[test]
    fn encoded_rows_are_sorted_most_recent_first_with_union_header() {
        let bytes = encode_table(&sample_table()).expect("encode");
        let text = String::from_utf8(bytes).expect("utf8");
        let mut lines = text.lines();
        assert_eq!(
            lines.next(),
            Some("identity,first_seen,last_seen,is_active,source_query,mileage,price,title")
        );
        assert!(lines.next().unwrap().starts_with("https://x.test/o/2,"));
        let older = lines.next().unwrap();
        assert!(older.starts_with("https://x.test/o/1,"));
        assert!(older.contains("\"Golf, 2019\""));
    }

    #[test]
    fn legacy_columns_are_backfilled_with_defaults() {
        let now = ts(12);
        let csv = "url,search_url,title\nhttps://x.test/o/9,https://x.test/s,Corsa\n";
        let table = decode_table(csv.as_bytes(), now).expect("decode");
        let record = table.get("https://x.test/o/9").expect("record");
        assert!(record.is_active);
        assert_eq!(record.first_seen, now);
        assert_eq!(record.last_seen, now);
        assert_eq!(record.source_query, "https://x.test/s");
        assert_eq!(record.attributes.get("title").map(String::as_str), Some("Corsa"));
    }

    #[test]
    fn malformed_lifecycle_values_fall_back_and_blank_identities_are_skipped() {
        let now = ts(12);
        let csv = "identity,first_seen,last_seen,is_active,source_query\n\
                   https://x.test/o/1,garbage,2026-03-01 05:00:00,maybe,q\n\
                   ,2026-03-01T01:00:00Z,2026-03-01T01:00:00Z,true,q\n\
                   https://x.test/o/2,2026-03-01T01:00:00Z,2026-03-01T02:00:00Z,False,q\n";
        let table = decode_table(csv.as_bytes(), now).expect("decode");
        assert_eq!(table.len(), 2);

        let first = table.get("https://x.test/o/1").unwrap();
        assert!(first.is_active);
        assert_eq!(first.first_seen, now);
        // last_seen is never earlier than first_seen.
        assert_eq!(first.last_seen, now);

        let second = table.get("https://x.test/o/2").unwrap();
        assert!(!second.is_active);
        assert_eq!(second.last_seen, ts(2));
    }

    #[test]
    fn store_without_identity_column_is_an_error() {
        let csv = "title,price\nGolf,1\n";
        let err = decode_table(csv.as_bytes(), ts(0)).unwrap_err();
        assert!(matches!(err, StoreError::MissingIdentityColumn));
    }

    #[tokio::test]
    async fn zero_byte_store_file_loads_empty() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("offers.csv");
        std::fs::write(&path, b"").expect("write empty store");

        let store = CsvOfferStore::new(&path);
        assert!(store.load().await.expect("load").is_empty());

        store.save(&sample_table()).await.expect("save");
        assert_eq!(store.load().await.expect("reload").len(), 2);
    }

    #[tokio::test]
    async fn memory_store_round_trips_and_can_reject_saves() {
        let store = MemoryOfferStore::new();
        store.save(&sample_table()).await.expect("save");
        assert_eq!(store.save_count(), 1);
        assert_eq!(store.load().await.expect("load").len(), 2);
        assert_eq!(store.snapshot().await.records()[0].id.as_str(), "https://x.test/o/2");

        let rejecting = MemoryOfferStore::rejecting_saves(OfferTable::new());
        assert!(rejecting.save(&sample_table()).await.is_err());
        assert!(rejecting.load().await.expect("load").is_empty());
    }

    #[test]
    fn status_classification_retries_server_errors_and_throttling() {
        assert_eq!(classify_status(StatusCode::BAD_GATEWAY), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::TOO_MANY_REQUESTS), RetryDisposition::Retryable);
        assert_eq!(classify_status(StatusCode::NOT_FOUND), RetryDisposition::NonRetryable);
        assert_eq!(classify_status(StatusCode::FORBIDDEN), RetryDisposition::NonRetryable);
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(5), Duration::from_millis(350));
    }

    /// Serves `status` with a small HTML body to every request after `delay`,
    /// counting requests.
    async fn canned_server(status: u16, delay: Duration) -> (String, Arc<AtomicUsize>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("local addr");
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);

        tokio::spawn(async move {
            while let Ok((mut socket, _)) = listener.accept().await {
                let counter = Arc::clone(&counter);
                tokio::spawn(async move {
                    let mut request = Vec::new();
                    let mut buf = [0u8; 1024];
                    while !request.windows(4).any(|w| w == b"\r\n\r\n") {
                        match socket.read(&mut buf).await {
                            Ok(0) | Err(_) => return,
                            Ok(n) => request.extend_from_slice(&buf[..n]),
                        }
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(delay).await;
                    let body = "<html><body>offer</body></html>";
                    let response = format!(
                        "HTTP/1.1 {status} Canned\r\ncontent-type: text/html\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
                        body.len()
                    );
                    let _ = socket.write_all(response.as_bytes()).await;
                    let _ = socket.shutdown().await;
                });
            }
        });

        (format!("http://{addr}/offer/1"), hits)
    }

    fn quick_fetcher(timeout: Duration, max_retries: usize) -> HttpFetcher {
        HttpFetcher::new(HttpClientConfig {
            timeout,
            backoff: BackoffPolicy {
                max_retries,
                base_delay: Duration::from_millis(5),
                max_delay: Duration::from_millis(20),
            },
            ..Default::default()
        })
        .expect("fetcher")
    }

    #[tokio::test]
    async fn fetch_returns_body_on_success() {
        let (url, hits) = canned_server(200, Duration::ZERO).await;
        let page = quick_fetcher(Duration::from_secs(5), 2)
            .fetch_text(&url)
            .await
            .expect("fetch");
        assert_eq!(page.status, StatusCode::OK);
        assert!(page.body.contains("offer"));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn client_error_fails_without_retrying() {
        let (url, hits) = canned_server(404, Duration::ZERO).await;
        let err = quick_fetcher(Duration::from_secs(5), 2)
            .fetch_text(&url)
            .await
            .unwrap_err();
        assert!(matches!(err, FetchError::HttpStatus { status: 404, .. }));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn server_errors_and_throttling_are_retried_until_exhausted() {
        for status in [503u16, 429] {
            let (url, hits) = canned_server(status, Duration::ZERO).await;
            let err = quick_fetcher(Duration::from_secs(5), 2)
                .fetch_text(&url)
                .await
                .unwrap_err();
            assert!(
                matches!(err, FetchError::HttpStatus { status: s, .. } if s == status),
                "unexpected error for {status}: {err}"
            );
            assert_eq!(hits.load(Ordering::SeqCst), 3, "attempts for {status}");
        }
    }

    #[tokio::test]
    async fn slow_response_times_out() {
        let (url, _hits) = canned_server(200, Duration::from_secs(5)).await;
        let err = quick_fetcher(Duration::from_millis(100), 0)
            .fetch_text(&url)
            .await
            .unwrap_err();
        assert!(matches!(&err, FetchError::Request(e) if e.is_timeout()), "got {err}");
    }

    #[test]
    fn user_agents_rotate_round_robin() {
        let fetcher = HttpFetcher::new(HttpClientConfig {
            user_agents: vec!["ua-a".to_string(), "ua-b".to_string()],
            ..Default::default()
        })
        .expect("fetcher");
        assert_eq!(fetcher.rotate_user_agent(), "ua-a");
        assert_eq!(fetcher.rotate_user_agent(), "ua-b");
        assert_eq!(fetcher.rotate_user_agent(), "ua-a");
    }
}

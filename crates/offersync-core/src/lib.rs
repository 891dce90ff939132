//! Core domain model and lifecycle rules for tracked listings.

use std::borrow::Borrow;
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "offersync-core";

pub const COL_IDENTITY: &str = "identity";
pub const COL_FIRST_SEEN: &str = "first_seen";
pub const COL_LAST_SEEN: &str = "last_seen";
pub const COL_IS_ACTIVE: &str = "is_active";
pub const COL_SOURCE_QUERY: &str = "source_query";

/// Lifecycle columns every persisted row carries, in on-disk order.
pub const LIFECYCLE_COLUMNS: [&str; 5] = [
    COL_IDENTITY,
    COL_FIRST_SEEN,
    COL_LAST_SEEN,
    COL_IS_ACTIVE,
    COL_SOURCE_QUERY,
];

/// Scraped attributes keyed by field label.
pub type AttributeMap = BTreeMap<String, String>;

/// Normalized listing URL; the only uniqueness key in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ListingId(String);

impl ListingId {
    /// Returns `None` for blank input.
    pub fn new(raw: impl Into<String>) -> Option<Self> {
        let raw = raw.into();
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            None
        } else if trimmed.len() == raw.len() {
            Some(Self(raw))
        } else {
            Some(Self(trimmed.to_string()))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ListingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Borrow<str> for ListingId {
    fn borrow(&self) -> &str {
        &self.0
    }
}

impl AsRef<str> for ListingId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Freshly scraped listing, before lifecycle metadata is stamped.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScrapedOffer {
    pub id: ListingId,
    pub attributes: AttributeMap,
}

/// Persisted listing with lifecycle metadata.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OfferRecord {
    pub id: ListingId,
    pub attributes: AttributeMap,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub is_active: bool,
    pub source_query: String,
}

impl OfferRecord {
    /// Survivor ordering used by deduplication: active beats inactive, then newer `last_seen` wins.
    fn outranks(&self, other: &OfferRecord) -> bool {
        (self.is_active, self.last_seen) > (other.is_active, other.last_seen)
    }

    fn touch(&mut self, now: DateTime<Utc>) {
        if now > self.last_seen {
            self.last_seen = now;
        }
    }
}

/// Summary of one synchronization run. Returned to the caller, never persisted.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CrawlBatchResult {
    pub run_id: Uuid,
    pub search_query: String,
    pub started_at: DateTime<Utc>,
    pub total_found: usize,
    pub new_offers: usize,
    pub updated_offers: usize,
    pub inactive_offers: usize,
    pub failed_scrapes: usize,
    pub duration_seconds: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct StoreStats {
    pub total_offers: usize,
    pub active_offers: usize,
    pub inactive_offers: usize,
    pub source_queries: usize,
}

/// In-memory record set loaded from, and written back to, an offer store.
///
/// Every lifecycle mutation goes through this type; persistence layers only
/// move whole tables in and out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OfferTable {
    records: Vec<OfferRecord>,
}

impl OfferTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_records(records: Vec<OfferRecord>) -> Self {
        Self { records }
    }

    pub fn records(&self) -> &[OfferRecord] {
        &self.records
    }

    pub fn into_records(self) -> Vec<OfferRecord> {
        self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&OfferRecord> {
        self.records.iter().find(|r| r.id.as_str() == id)
    }

    pub fn active_records(&self) -> impl Iterator<Item = &OfferRecord> {
        self.records.iter().filter(|r| r.is_active)
    }

    /// Copy of the table restricted to active records.
    pub fn active_table(&self) -> OfferTable {
        Self::from_records(self.active_records().cloned().collect())
    }

    pub fn identities_for_query(&self, source_query: &str) -> HashSet<ListingId> {
        self.records
            .iter()
            .filter(|r| r.source_query == source_query)
            .map(|r| r.id.clone())
            .collect()
    }

    pub fn all_identities(&self) -> HashSet<ListingId> {
        self.records.iter().map(|r| r.id.clone()).collect()
    }

    /// Appends offers whose identity is not present anywhere in the table.
    ///
    /// Attribute keys that collide with lifecycle columns are dropped.
    /// Returns the number of records actually added.
    pub fn add_new(
        &mut self,
        offers: Vec<ScrapedOffer>,
        source_query: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let mut known = self.all_identities();
        let mut added = 0usize;

        for offer in offers {
            if !known.insert(offer.id.clone()) {
                debug!(identity = %offer.id, "skipping offer already present in store");
                continue;
            }
            let mut attributes = offer.attributes;
            let before = attributes.len();
            attributes.retain(|key, _| !LIFECYCLE_COLUMNS.contains(&key.as_str()));
            if attributes.len() != before {
                warn!(
                    identity = %offer.id,
                    dropped = before - attributes.len(),
                    "dropping attributes that shadow lifecycle columns"
                );
            }
            self.records.push(OfferRecord {
                id: offer.id,
                attributes,
                first_seen: now,
                last_seen: now,
                is_active: true,
                source_query: source_query.to_string(),
            });
            added += 1;
        }

        info!(added, "added new offers");
        added
    }

    /// Marks already-known identities as seen again, reactivating inactive ones.
    ///
    /// Unknown identities are ignored. Returns the number of distinct identities touched.
    pub fn refresh<'a, I>(&mut self, ids: I, now: DateTime<Utc>) -> usize
    where
        I: IntoIterator<Item = &'a ListingId>,
    {
        let wanted: HashSet<&ListingId> = ids.into_iter().collect();
        if wanted.is_empty() {
            return 0;
        }

        let mut touched: HashSet<&ListingId> = HashSet::new();
        for record in &mut self.records {
            if let Some(id) = wanted.get(&record.id) {
                record.touch(now);
                record.is_active = true;
                touched.insert(*id);
            }
        }

        info!(refreshed = touched.len(), "refreshed existing offers");
        touched.len()
    }

    /// Deactivates records introduced by `source_query` that the latest crawl of
    /// that query did not observe.
    ///
    /// Only currently active records are touched and counted; records owned by
    /// other queries are never eligible.
    pub fn deactivate_missing(
        &mut self,
        observed: &HashSet<ListingId>,
        source_query: &str,
        now: DateTime<Utc>,
    ) -> usize {
        let missing: HashSet<ListingId> = self
            .identities_for_query(source_query)
            .difference(observed)
            .cloned()
            .collect();
        if missing.is_empty() {
            return 0;
        }

        let mut deactivated: HashSet<&ListingId> = HashSet::new();
        for record in &mut self.records {
            if !record.is_active || record.source_query != source_query {
                continue;
            }
            if let Some(id) = missing.get(&record.id) {
                record.is_active = false;
                record.touch(now);
                deactivated.insert(id);
            }
        }

        info!(
            deactivated = deactivated.len(),
            source_query, "marked missing offers inactive"
        );
        deactivated.len()
    }

    /// Collapses rows sharing an identity down to one survivor.
    ///
    /// Survivor order: active over inactive, then most recent `last_seen`; ties
    /// keep the earliest row. Returns the number of rows removed.
    pub fn deduplicate(&mut self) -> usize {
        let before = self.records.len();
        let mut survivors: Vec<OfferRecord> = Vec::with_capacity(before);
        let mut slot: HashMap<ListingId, usize> = HashMap::new();

        for record in self.records.drain(..) {
            match slot.get(&record.id) {
                Some(&index) => {
                    if record.outranks(&survivors[index]) {
                        survivors[index] = record;
                    }
                }
                None => {
                    slot.insert(record.id.clone(), survivors.len());
                    survivors.push(record);
                }
            }
        }

        self.records = survivors;
        let removed = before - self.records.len();
        if removed > 0 {
            info!(removed, "removed duplicate offer rows");
        } else {
            debug!("no duplicate offer rows found");
        }
        removed
    }

    /// Orders rows most-recently-seen first; identity breaks ties so output is stable.
    pub fn sort_by_last_seen_desc(&mut self) {
        self.records.sort_by(|a, b| {
            b.last_seen
                .cmp(&a.last_seen)
                .then_with(|| a.id.cmp(&b.id))
        });
    }

    /// Sorted union of attribute keys across all rows.
    pub fn attribute_columns(&self) -> Vec<String> {
        self.records
            .iter()
            .flat_map(|r| r.attributes.keys().cloned())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }

    pub fn stats(&self) -> StoreStats {
        let active_offers = self.active_records().count();
        let source_queries = self
            .records
            .iter()
            .filter(|r| !r.source_query.is_empty())
            .map(|r| r.source_query.as_str())
            .collect::<HashSet<_>>()
            .len();
        StoreStats {
            total_offers: self.records.len(),
            active_offers,
            inactive_offers: self.records.len() - active_offers,
            source_queries,
        }
    }
}

//! Listing site contract and the HTML implementation for paginated search results.

use std::sync::Arc;

use async_trait::async_trait;
use offersync_core::{AttributeMap, ListingId};
use offersync_storage::{FetchError, HttpFetcher};
use reqwest::Url;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const CRATE_NAME: &str = "offersync-adapters";

pub const ATTR_TITLE: &str = "title";
pub const ATTR_PRICE: &str = "price";
pub const ATTR_CURRENCY: &str = "currency";
pub const ATTR_PRICE_EVALUATION: &str = "price_evaluation";
pub const ATTR_DESCRIPTION: &str = "description";
pub const ATTR_LOCATION: &str = "location";
pub const UNKNOWN_LOCATION: &str = "unknown";

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("{0}")]
    Message(String),
    #[error("invalid selector `{selector}`: {reason}")]
    Selector { selector: String, reason: String },
    #[error(transparent)]
    Fetch(#[from] FetchError),
}

/// Everything the sync engine needs from a listing site.
///
/// Implementations must not panic on ordinary fetch or markup failures.
#[async_trait]
pub trait ListingSite: Send + Sync {
    /// Number of result pages for a search. Callers treat errors as a single page.
    async fn page_count(&self, search_url: &str) -> Result<u32, AdapterError>;

    /// Identities on one result page, in card order, promoted cards excluded.
    async fn listing_ids(&self, page_url: &str) -> Result<Vec<ListingId>, AdapterError>;

    /// Attributes of one listing, or `None` when the page could not be scraped.
    async fn fetch_detail(&self, id: &ListingId) -> Option<AttributeMap>;
}

#[async_trait]
impl<T: ListingSite + ?Sized> ListingSite for Arc<T> {
    async fn page_count(&self, search_url: &str) -> Result<u32, AdapterError> {
        (**self).page_count(search_url).await
    }

    async fn listing_ids(&self, page_url: &str) -> Result<Vec<ListingId>, AdapterError> {
        (**self).listing_ids(page_url).await
    }

    async fn fetch_detail(&self, id: &ListingId) -> Option<AttributeMap> {
        (**self).fetch_detail(id).await
    }
}

/// CSS selectors describing the search-result and detail markup.
#[derive(Debug, Clone)]
pub struct SiteSelectors {
    /// Pagination item for the "next page" control; its previous sibling holds the last page number.
    pub pagination_next: String,
    /// Container wrapping the organic search results.
    pub results_container: String,
    /// One result card inside the container.
    pub result_card: String,
    /// Substring of a card's `data-testid` marking paid placements.
    pub promoted_marker: String,
    /// Link to the listing inside a card.
    pub card_link: String,
    pub title: String,
    pub price: String,
    pub currency: String,
    pub price_evaluation: String,
    /// Label/value pairs in the main details block.
    pub main_details: String,
    pub description_paragraphs: String,
    /// Label/value pairs in the basic information block.
    pub basic_information: String,
    pub location_link: String,
}

impl Default for SiteSelectors {
    fn default() -> Self {
        Self {
            pagination_next: r#"li[title="Go to next Page"]"#.to_string(),
            results_container: r#"div[data-testid="search-results"]"#.to_string(),
            result_card: "article".to_string(),
            promoted_marker: "featured-dealer".to_string(),
            card_link: "section a[href]".to_string(),
            title: r#"h1[class^="offer-title"]"#.to_string(),
            price: r#"span[class^="offer-price__number"]"#.to_string(),
            currency: r#"span[class^="offer-price__currency"]"#.to_string(),
            price_evaluation: r#"[data-testid="small-price-evaluation-indicator"]"#.to_string(),
            main_details: r#"[data-testid="main-details-section"] [data-testid="detail"]"#
                .to_string(),
            description_paragraphs: r#"[data-testid="textWrapper"] p"#.to_string(),
            basic_information: r#"[data-testid="basic_information"] [data-testid]"#.to_string(),
            location_link: r#"a[href^="https://www.google.com/maps/search/"]"#.to_string(),
        }
    }
}

fn selector(raw: &str) -> Result<Selector, AdapterError> {
    Selector::parse(raw).map_err(|e| AdapterError::Selector {
        selector: raw.to_string(),
        reason: e.to_string(),
    })
}

fn text_or_none(value: String) -> Option<String> {
    let trimmed = value.trim().to_string();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}

fn element_text(element: ElementRef<'_>) -> Option<String> {
    text_or_none(element.text().collect::<String>())
}

fn select_first_text(document: &Html, raw: &str) -> Result<Option<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document.select(&sel).next().and_then(element_text))
}

fn select_all_texts(document: &Html, raw: &str) -> Result<Vec<String>, AdapterError> {
    let sel = selector(raw)?;
    Ok(document.select(&sel).filter_map(element_text).collect())
}

/// Resolve a card href against the page it was found on; fragments are dropped.
pub fn normalize_listing_url(href: &str, page_url: &str) -> Option<ListingId> {
    let href = href.trim();
    if href.is_empty() {
        return None;
    }
    let mut url = match Url::parse(page_url) {
        Ok(base) => base.join(href).ok()?,
        Err(_) => Url::parse(href).ok()?,
    };
    url.set_fragment(None);
    ListingId::new(String::from(url))
}

/// Last page number from the pagination control, if present and numeric.
pub fn parse_page_count(html: &str, selectors: &SiteSelectors) -> Result<Option<u32>, AdapterError> {
    let document = Html::parse_document(html);
    let next_sel = selector(&selectors.pagination_next)?;
    let Some(next_button) = document.select(&next_sel).next() else {
        return Ok(None);
    };
    let last_page = next_button
        .prev_siblings()
        .filter_map(ElementRef::wrap)
        .next()
        .and_then(element_text)
        .and_then(|text| text.parse::<u32>().ok());
    Ok(last_page)
}

/// Listing identities on a search result page, skipping promoted cards.
pub fn parse_listing_ids(
    html: &str,
    page_url: &str,
    selectors: &SiteSelectors,
) -> Result<Vec<ListingId>, AdapterError> {
    let document = Html::parse_document(html);
    let container_sel = selector(&selectors.results_container)?;
    let card_sel = selector(&selectors.result_card)?;
    let link_sel = selector(&selectors.card_link)?;

    let container = document.select(&container_sel).next().ok_or_else(|| {
        AdapterError::Message(format!("results container not found on {page_url}"))
    })?;

    let mut ids = Vec::new();
    for card in container.select(&card_sel) {
        let promoted = card
            .value()
            .attr("data-testid")
            .is_some_and(|testid| testid.contains(&selectors.promoted_marker));
        if promoted {
            debug!(page_url, "skipping promoted card");
            continue;
        }

        let href = card
            .select(&link_sel)
            .next()
            .and_then(|link| link.value().attr("href"));
        match href.and_then(|href| normalize_listing_url(href, page_url)) {
            Some(id) => ids.push(id),
            None => warn!(page_url, "result card without a usable listing link"),
        }
    }

    Ok(ids)
}

fn extract_label_pairs(
    document: &Html,
    block: &str,
    exact_pairs_only: bool,
) -> Result<Vec<(String, String)>, AdapterError> {
    let block_sel = selector(block)?;
    let p_sel = selector("p")?;
    let mut pairs = Vec::new();
    for item in document.select(&block_sel) {
        let texts: Vec<String> = item.select(&p_sel).filter_map(element_text).collect();
        if exact_pairs_only && texts.len() != 2 {
            continue;
        }
        if let [label, value, ..] = texts.as_slice() {
            pairs.push((label.clone(), value.clone()));
        }
    }
    Ok(pairs)
}

/// Extract listing attributes from a detail page.
///
/// Each field is extracted independently; a missing or broken field never
/// discards the others. Returns an empty map when nothing was recognised.
pub fn parse_offer_detail(html: &str, selectors: &SiteSelectors) -> AttributeMap {
    let document = Html::parse_document(html);
    let mut attributes = AttributeMap::new();

    let single_fields = [
        (ATTR_TITLE, selectors.title.as_str()),
        (ATTR_PRICE, selectors.price.as_str()),
        (ATTR_CURRENCY, selectors.currency.as_str()),
        (ATTR_PRICE_EVALUATION, selectors.price_evaluation.as_str()),
    ];
    for (key, raw) in single_fields {
        match select_first_text(&document, raw) {
            Ok(Some(value)) => {
                attributes.insert(key.to_string(), value);
            }
            Ok(None) => debug!(field = key, "detail field not present"),
            Err(err) => warn!(field = key, error = %err, "detail field extraction failed"),
        }
    }

    match select_all_texts(&document, &selectors.description_paragraphs) {
        Ok(paragraphs) if !paragraphs.is_empty() => {
            attributes.insert(ATTR_DESCRIPTION.to_string(), paragraphs.join("\n"));
        }
        Ok(_) => debug!(field = ATTR_DESCRIPTION, "detail field not present"),
        Err(err) => warn!(field = ATTR_DESCRIPTION, error = %err, "detail field extraction failed"),
    }

    let pair_blocks = [
        (selectors.main_details.as_str(), false),
        (selectors.basic_information.as_str(), true),
    ];
    for (block, exact_pairs_only) in pair_blocks {
        match extract_label_pairs(&document, block, exact_pairs_only) {
            Ok(pairs) => attributes.extend(pairs),
            Err(err) => warn!(block, error = %err, "detail pair extraction failed"),
        }
    }

    if attributes.is_empty() {
        return attributes;
    }

    let location = select_first_text(&document, &selectors.location_link)
        .unwrap_or_else(|err| {
            warn!(error = %err, "location extraction failed");
            None
        })
        .unwrap_or_else(|| UNKNOWN_LOCATION.to_string());
    attributes.insert(ATTR_LOCATION.to_string(), location);
    attributes
}

/// Listing site backed by live HTTP fetches and CSS selectors.
#[derive(Debug, Clone)]
pub struct HtmlListingSite {
    http: Arc<HttpFetcher>,
    selectors: SiteSelectors,
}

impl HtmlListingSite {
    pub fn new(http: Arc<HttpFetcher>) -> Self {
        Self::with_selectors(http, SiteSelectors::default())
    }

    pub fn with_selectors(http: Arc<HttpFetcher>, selectors: SiteSelectors) -> Self {
        Self { http, selectors }
    }

    pub fn selectors(&self) -> &SiteSelectors {
        &self.selectors
    }
}

#[async_trait]
impl ListingSite for HtmlListingSite {
    async fn page_count(&self, search_url: &str) -> Result<u32, AdapterError> {
        let page = self.http.fetch_text(search_url).await?;
        let count = parse_page_count(&page.body, &self.selectors)?.ok_or_else(|| {
            AdapterError::Message(format!("no pagination control on {search_url}"))
        })?;
        info!(search_url, pages = count, "determined result page count");
        Ok(count)
    }

    async fn listing_ids(&self, page_url: &str) -> Result<Vec<ListingId>, AdapterError> {
        let page = self.http.fetch_text(page_url).await?;
        let ids = parse_listing_ids(&page.body, &page.final_url, &self.selectors)?;
        info!(page_url, found = ids.len(), "collected listing links");
        Ok(ids)
    }

    async fn fetch_detail(&self, id: &ListingId) -> Option<AttributeMap> {
        let page = match self.http.fetch_text(id.as_str()).await {
            Ok(page) => page,
            Err(err) => {
                warn!(identity = %id, error = %err, "detail fetch failed");
                return None;
            }
        };
        let attributes = parse_offer_detail(&page.body, &self.selectors);
        if attributes.is_empty() {
            warn!(identity = %id, "detail page yielded no attributes");
            return None;
        }
        Some(attributes)
    }
}

//! Upstream listing feeds for askwatch: paged search-index fetch, catalog
//! price quotes, observation extraction and the bargain screen.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use askwatch_core::{AskObservation, ObservationBatch, Price};

pub const CRATE_NAME: &str = "askwatch-feeds";

pub const HITS_PER_PAGE: usize = 100;
pub const MAX_PAGES: usize = 500;
pub const CATALOG_BATCH: usize = 24;

const PAGE_DELAY: Duration = Duration::from_millis(400);

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Lookback window for the newly-listed facet. The index exposes it as a
/// label facet rather than a timestamp range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Lookback {
    pub days: u32,
}

impl Lookback {
    pub fn facet_label(&self) -> String {
        if self.days <= 1 {
            "1 Day".to_string()
        } else {
            format!("{} Days", self.days)
        }
    }

    pub fn filter_clause(&self) -> String {
        format!("newly_listed:'{}'", self.facet_label())
    }
}

/// Raw search hit lifted into a typed shape. Everything is optional here;
/// validation happens at observation extraction.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Listing {
    pub sku: Option<String>,
    pub name: Option<String>,
    pub vintage: Option<String>,
    pub region: Option<String>,
    pub case_size: Option<u32>,
    pub bottle_volume: Option<String>,
    pub format: Option<String>,
    pub product_url: Option<String>,
}

impl Listing {
    pub fn from_hit(hit: &serde_json::Value) -> Self {
        Self {
            sku: str_field(hit, "parent_sku").or_else(|| str_field(hit, "sku")),
            name: str_field(hit, "name"),
            vintage: str_field(hit, "vintage"),
            region: str_field(hit, "region"),
            case_size: uint_field(hit, "case_size"),
            bottle_volume: str_field(hit, "bottle_volume"),
            format: str_field(hit, "format"),
            product_url: str_field(hit, "product_url"),
        }
    }
}

fn str_field(value: &serde_json::Value, key: &str) -> Option<String> {
    match value.get(key) {
        Some(serde_json::Value::String(s)) if !s.trim().is_empty() => Some(s.trim().to_string()),
        Some(serde_json::Value::Number(n)) => Some(n.to_string()),
        _ => None,
    }
}

fn uint_field(value: &serde_json::Value, key: &str) -> Option<u32> {
    value.get(key)?.as_u64().and_then(|n| u32::try_from(n).ok())
}

/// Raw per-SKU quote from the catalog pricing service. Pricing fields stay
/// optional until extraction.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceQuote {
    #[serde(default)]
    pub lowest_ask: Option<f64>,
    #[serde(default)]
    pub market_price: Option<f64>,
    #[serde(default)]
    pub last_trade: Option<f64>,
    #[serde(default)]
    pub qty_available: Option<u32>,
    #[serde(default)]
    pub format: Option<String>,
}

/// Search-index boundary: raw hits for a lookback window.
#[async_trait]
pub trait SearchIndex: Send + Sync {
    async fn fetch_new_listings(&self, lookback: Lookback) -> Result<Vec<Listing>, FeedError>;
}

/// Catalog pricing boundary: one quote per SKU, best effort.
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn price_quotes(&self, skus: &[String]) -> Result<HashMap<String, PriceQuote>, FeedError>;
}

#[derive(Debug, Clone)]
pub struct SearchConfig {
    pub url: String,
    pub app_id: String,
    pub api_key: String,
    pub index: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Paged POST client for the search index. Pages until a page comes back
/// empty; a failed or undecodable later page keeps the partial results,
/// while a rejected first page surfaces as an error so credential problems
/// are not mistaken for a quiet market.
pub struct HttpSearchIndex {
    client: reqwest::Client,
    config: SearchConfig,
}

impl HttpSearchIndex {
    pub fn new(config: SearchConfig) -> anyhow::Result<Self> {
        let client = build_client(config.timeout, config.user_agent.as_deref())?;
        Ok(Self { client, config })
    }
}

#[derive(Debug, Deserialize)]
struct SearchPage {
    #[serde(default)]
    hits: Vec<serde_json::Value>,
}

#[async_trait]
impl SearchIndex for HttpSearchIndex {
    async fn fetch_new_listings(&self, lookback: Lookback) -> Result<Vec<Listing>, FeedError> {
        let filters = lookback.filter_clause();
        let mut listings = Vec::new();

        for page in 0..MAX_PAGES {
            let body = serde_json::json!({
                "index": self.config.index,
                "page": page,
                "hits_per_page": HITS_PER_PAGE,
                "filters": filters,
            });

            let resp = self
                .client
                .post(&self.config.url)
                .header("x-application-id", &self.config.app_id)
                .header("x-api-key", &self.config.api_key)
                .json(&body)
                .send()
                .await?;

            let status = resp.status();
            if !status.is_success() {
                if page == 0 {
                    return Err(FeedError::HttpStatus {
                        status: status.as_u16(),
                        url: self.config.url.clone(),
                    });
                }
                warn!(page, status = status.as_u16(), "search page rejected, keeping partial results");
                break;
            }

            let parsed: SearchPage = match resp.json().await {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(page, error = %err, "search page undecodable, keeping partial results");
                    break;
                }
            };

            if parsed.hits.is_empty() {
                break;
            }
            listings.extend(parsed.hits.iter().map(Listing::from_hit));

            tokio::time::sleep(PAGE_DELAY).await;
        }

        info!(
            listings = listings.len(),
            window = %lookback.facet_label(),
            "fetched newly listed hits"
        );
        Ok(listings)
    }
}

#[derive(Debug, Clone)]
pub struct CatalogConfig {
    pub url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Batched POST client for the catalog pricing service. A failed batch is
/// logged and skipped; the scan runs on whatever quotes were obtained.
pub struct HttpCatalog {
    client: reqwest::Client,
    config: CatalogConfig,
}

impl HttpCatalog {
    pub fn new(config: CatalogConfig) -> anyhow::Result<Self> {
        let client = build_client(config.timeout, config.user_agent.as_deref())?;
        Ok(Self { client, config })
    }
}

#[async_trait]
impl Catalog for HttpCatalog {
    async fn price_quotes(&self, skus: &[String]) -> Result<HashMap<String, PriceQuote>, FeedError> {
        let mut quotes = HashMap::new();

        for batch in skus.chunks(CATALOG_BATCH) {
            let body = serde_json::json!({ "product_codes": batch });

            let resp = match self.client.post(&self.config.url).json(&body).send().await {
                Ok(resp) => resp,
                Err(err) => {
                    warn!(batch = batch.len(), error = %err, "catalog batch failed, continuing");
                    continue;
                }
            };

            let status = resp.status();
            if !status.is_success() {
                warn!(batch = batch.len(), status = status.as_u16(), "catalog batch rejected, continuing");
                continue;
            }

            // response is keyed by SKU, each entry a list of quotes with the
            // best offer first
            let parsed: HashMap<String, Vec<PriceQuote>> = match resp.json().await {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(batch = batch.len(), error = %err, "catalog batch undecodable, continuing");
                    continue;
                }
            };

            for (sku, entries) in parsed {
                if let Some(first) = entries.into_iter().next() {
                    quotes.entry(sku).or_insert(first);
                }
            }
        }

        if quotes.is_empty() && !skus.is_empty() {
            warn!(skus = skus.len(), "no catalog quotes obtained");
        }
        Ok(quotes)
    }
}

fn build_client(timeout: Duration, user_agent: Option<&str>) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder().gzip(true).brotli(true).timeout(timeout);
    if let Some(user_agent) = user_agent {
        builder = builder.user_agent(user_agent.to_string());
    }
    builder.build().context("building reqwest client")
}

/// Reduces one raw listing plus its quote into the minimal comparable
/// fact. `None` means malformed for alerting purposes (no SKU, or no
/// positive finite ask); the caller counts the skip. Absent data never
/// produces an observation, so it can never produce a notification.
pub fn observation_from(
    listing: &Listing,
    quote: Option<&PriceQuote>,
    observed_at: DateTime<Utc>,
) -> Option<AskObservation> {
    let sku = listing.sku.clone()?;
    let ask = Price::from_major(quote?.lowest_ask?)?;
    if ask.minor() == 0 {
        return None;
    }
    Some(AskObservation {
        sku,
        ask,
        observed_at,
    })
}

/// Percentage discount of `ask` against `reference`, one decimal place.
pub fn pct_discount(reference: Price, ask: Price) -> f64 {
    let raw = (reference.major() - ask.major()) / reference.major() * 100.0;
    (raw * 10.0).round() / 10.0
}

/// Compact case descriptor for digests, eg "6x75cl". Falls back to a
/// normalized format string, then "N/A".
pub fn derive_case_format(listing: &Listing) -> String {
    if let (Some(case_size), Some(bottle_volume)) =
        (listing.case_size, listing.bottle_volume.as_deref())
    {
        return format!("{case_size}x{bottle_volume}");
    }
    if let Some(format) = listing.format.as_deref() {
        let trimmed = format.trim();
        if !trimmed.is_empty() {
            return trimmed.replace(" x ", "x").replace(' ', "");
        }
    }
    "N/A".to_string()
}

/// Candidate opportunity: the comparable fact plus display context for the
/// alert digest.
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
    pub observation: AskObservation,
    pub name: String,
    pub vintage: Option<String>,
    pub region: Option<String>,
    pub case_format: String,
    pub market: Price,
    pub pct_market: f64,
    pub pct_last: Option<f64>,
    pub url: Option<String>,
}

/// Threshold screen for bargain candidates: minimum discount against the
/// market price and against the last trade, plus a junk-price floor.
#[derive(Debug, Clone, Copy)]
pub struct DiscountScreen {
    pub min_pct_market: f64,
    pub min_pct_last: f64,
    pub min_ask: Price,
}

impl Default for DiscountScreen {
    fn default() -> Self {
        Self {
            min_pct_market: 15.0,
            min_pct_last: 15.0,
            min_ask: Price::from_minor(100),
        }
    }
}

impl DiscountScreen {
    /// Applies the thresholds. `None` means not a bargain, or no usable
    /// market reference to judge against. A listing with no last trade is
    /// judged on the market discount alone.
    pub fn evaluate(
        &self,
        observation: &AskObservation,
        listing: &Listing,
        quote: &PriceQuote,
    ) -> Option<Candidate> {
        let ask = observation.ask;
        if ask <= self.min_ask {
            return None;
        }

        let market = Price::from_major(quote.market_price?)?;
        if market.minor() == 0 {
            return None;
        }

        let pct_market = pct_discount(market, ask);
        if pct_market < self.min_pct_market {
            return None;
        }

        let pct_last = quote
            .last_trade
            .and_then(Price::from_major)
            .filter(|last| last.minor() > 0)
            .map(|last| pct_discount(last, ask));
        if let Some(pct) = pct_last {
            if pct < self.min_pct_last {
                return None;
            }
        }

        Some(Candidate {
            observation: observation.clone(),
            name: listing
                .name
                .clone()
                .unwrap_or_else(|| observation.sku.clone()),
            vintage: listing.vintage.clone(),
            region: listing.region.clone(),
            case_format: derive_case_format(listing),
            market,
            pct_market,
            pct_last,
            url: listing.product_url.clone(),
        })
    }
}

/// Front half of a scan: screened candidates plus bookkeeping counts for
/// the run summary.
#[derive(Debug)]
pub struct CandidateSet {
    pub candidates: Vec<Candidate>,
    pub skipped_malformed: usize,
    pub screened_out: usize,
}

impl CandidateSet {
    pub fn to_batch(&self) -> ObservationBatch {
        ObservationBatch {
            observations: self
                .candidates
                .iter()
                .map(|c| c.observation.clone())
                .collect(),
            skipped_malformed: self.skipped_malformed,
        }
    }
}

/// Fetches the lookback window, joins quotes, extracts observations and
/// applies the screen. One SKU yields at most one candidate; duplicate
/// listing rows for a SKU are ignored after the first.
pub async fn collect_candidates(
    search: &dyn SearchIndex,
    catalog: &dyn Catalog,
    screen: &DiscountScreen,
    lookback: Lookback,
    observed_at: DateTime<Utc>,
) -> Result<CandidateSet, FeedError> {
    let listings = search.fetch_new_listings(lookback).await?;

    let mut skus: Vec<String> = Vec::new();
    let mut seen = BTreeSet::new();
    for listing in &listings {
        if let Some(sku) = &listing.sku {
            if seen.insert(sku.clone()) {
                skus.push(sku.clone());
            }
        }
    }

    let quotes = catalog.price_quotes(&skus).await?;

    let mut set = CandidateSet {
        candidates: Vec::new(),
        skipped_malformed: 0,
        screened_out: 0,
    };
    let mut decided: BTreeSet<String> = BTreeSet::new();

    for listing in &listings {
        if let Some(sku) = &listing.sku {
            if !decided.insert(sku.clone()) {
                continue;
            }
        }

        let quote = listing.sku.as_deref().and_then(|sku| quotes.get(sku));
        match observation_from(listing, quote, observed_at) {
            None => set.skipped_malformed += 1,
            Some(observation) => {
                if let Some(quote) = quote {
                    match screen.evaluate(&observation, listing, quote) {
                        Some(candidate) => set.candidates.push(candidate),
                        None => set.screened_out += 1,
                    }
                }
            }
        }
    }

    info!(
        candidates = set.candidates.len(),
        skipped_malformed = set.skipped_malformed,
        screened_out = set.screened_out,
        "screened listings"
    );
    Ok(set)
}

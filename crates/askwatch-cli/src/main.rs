//! askwatch command line: a one-shot scan-decide-alert pass plus a state
//! inspection helper. Scheduling cadence lives outside the process.

use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Args, Parser, Subcommand};
use tracing::warn;

use askwatch_core::Price;
use askwatch_engine::{AlertEngine, DedupPolicy, Persistence, DEFAULT_REMINDER_DAYS};
use askwatch_feeds::{
    collect_candidates, Candidate, CatalogConfig, DiscountScreen, HttpCatalog, HttpSearchIndex,
    Lookback, SearchConfig,
};
use askwatch_notify::{format_digest, AlertChannel, AlertItem, DigestLimits, WebhookChannel};
use askwatch_store::{FileBlobStore, HttpBlobStore, RemoteStoreConfig, StateStore};

#[derive(Debug, Parser)]
#[command(name = "askwatch")]
#[command(about = "Marketplace ask watcher: scan new listings, dedup, alert")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run one scan over the lookback window and alert on the survivors.
    Scan(ScanArgs),
    /// Print the persisted notification state.
    State,
}

#[derive(Debug, Args)]
struct ScanArgs {
    /// Days of listing history to scan.
    #[arg(long, default_value_t = 1)]
    lookback_days: u32,

    /// Days before an unchanged ask may be re-notified.
    #[arg(long, default_value_t = DEFAULT_REMINDER_DAYS)]
    reminder_days: i64,

    /// Minimum discount against the market price, in percent.
    #[arg(long, default_value_t = 15.0)]
    min_pct_market: f64,

    /// Minimum discount against the last trade, in percent.
    #[arg(long, default_value_t = 15.0)]
    min_pct_last: f64,

    /// Asks at or below this price are ignored as junk.
    #[arg(long, default_value_t = 1.0)]
    min_ask: f64,

    /// Most numbered lines in one digest.
    #[arg(long, default_value_t = 20)]
    max_lines: usize,

    /// Print the digest to stdout instead of sending it.
    #[arg(long)]
    dry_run: bool,

    /// Stay quiet when nothing cleared the screen.
    #[arg(long)]
    skip_empty_alert: bool,
}

impl Default for ScanArgs {
    fn default() -> Self {
        Self {
            lookback_days: 1,
            reminder_days: DEFAULT_REMINDER_DAYS,
            min_pct_market: 15.0,
            min_pct_last: 15.0,
            min_ask: 1.0,
            max_lines: 20,
            dry_run: false,
            skip_empty_alert: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ScanConfig {
    state_url: Option<String>,
    state_token: Option<String>,
    state_file: PathBuf,
    search_url: Option<String>,
    search_app_id: Option<String>,
    search_api_key: Option<String>,
    search_index: String,
    catalog_url: Option<String>,
    webhook_url: Option<String>,
    user_agent: String,
    http_timeout_secs: u64,
}

impl ScanConfig {
    fn from_env() -> Self {
        Self {
            state_url: std::env::var("ASKWATCH_STATE_URL").ok(),
            state_token: std::env::var("ASKWATCH_STATE_TOKEN").ok(),
            state_file: std::env::var("ASKWATCH_STATE_FILE")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("data/askwatch-state.json")),
            search_url: std::env::var("ASKWATCH_SEARCH_URL").ok(),
            search_app_id: std::env::var("ASKWATCH_SEARCH_APP_ID").ok(),
            search_api_key: std::env::var("ASKWATCH_SEARCH_API_KEY").ok(),
            search_index: std::env::var("ASKWATCH_SEARCH_INDEX")
                .unwrap_or_else(|_| "prod_product".to_string()),
            catalog_url: std::env::var("ASKWATCH_CATALOG_URL").ok(),
            webhook_url: std::env::var("ASKWATCH_WEBHOOK_URL").ok(),
            user_agent: std::env::var("ASKWATCH_USER_AGENT")
                .unwrap_or_else(|_| "askwatch/0.1".to_string()),
            http_timeout_secs: std::env::var("ASKWATCH_HTTP_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(20),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_secs(self.http_timeout_secs)
    }

    fn state_store(&self) -> Result<StateStore> {
        match &self.state_url {
            Some(url) => {
                let mut remote = RemoteStoreConfig::new(url.clone());
                remote.bearer_token = self.state_token.clone();
                remote.timeout = self.timeout();
                remote.user_agent = Some(self.user_agent.clone());
                let primary = HttpBlobStore::new(remote).context("building remote state store")?;
                Ok(StateStore::new(
                    Box::new(primary),
                    Some(FileBlobStore::new(&self.state_file)),
                ))
            }
            None => Ok(StateStore::local(&self.state_file)),
        }
    }

    fn search_client(&self) -> Result<HttpSearchIndex> {
        let config = SearchConfig {
            url: self
                .search_url
                .clone()
                .context("ASKWATCH_SEARCH_URL is not set")?,
            app_id: self
                .search_app_id
                .clone()
                .context("ASKWATCH_SEARCH_APP_ID is not set")?,
            api_key: self
                .search_api_key
                .clone()
                .context("ASKWATCH_SEARCH_API_KEY is not set")?,
            index: self.search_index.clone(),
            timeout: self.timeout(),
            user_agent: Some(self.user_agent.clone()),
        };
        HttpSearchIndex::new(config)
    }

    fn catalog_client(&self) -> Result<HttpCatalog> {
        let config = CatalogConfig {
            url: self
                .catalog_url
                .clone()
                .context("ASKWATCH_CATALOG_URL is not set")?,
            timeout: self.timeout(),
            user_agent: Some(self.user_agent.clone()),
        };
        HttpCatalog::new(config)
    }
}

async fn run_scan(config: ScanConfig, args: ScanArgs) -> Result<()> {
    let store = config.state_store()?;
    let search = config.search_client()?;
    let catalog = config.catalog_client()?;

    let screen = DiscountScreen {
        min_pct_market: args.min_pct_market,
        min_pct_last: args.min_pct_last,
        min_ask: Price::from_major(args.min_ask).context("--min-ask must be a valid price")?,
    };
    let lookback = Lookback {
        days: args.lookback_days,
    };

    let set = collect_candidates(&search, &catalog, &screen, lookback, Utc::now()).await?;

    let engine = AlertEngine::new(
        store,
        DedupPolicy {
            reminder_interval_days: args.reminder_days,
        },
    );
    let summary = engine.run_once(&set.to_batch()).await?;

    let by_sku: HashMap<&str, &Candidate> = set
        .candidates
        .iter()
        .map(|candidate| (candidate.observation.sku.as_str(), candidate))
        .collect();
    let items: Vec<AlertItem> = summary
        .alerts
        .iter()
        .filter_map(|alert| {
            by_sku.get(alert.sku.as_str()).map(|candidate| AlertItem {
                sku: alert.sku.clone(),
                name: candidate.name.clone(),
                vintage: candidate.vintage.clone(),
                region: candidate.region.clone(),
                case_format: candidate.case_format.clone(),
                ask: alert.ask,
                previous_ask: alert.previous_ask,
                market: candidate.market,
                pct_market: candidate.pct_market,
                pct_last: candidate.pct_last,
                url: candidate.url.clone(),
            })
        })
        .collect();

    let limits = DigestLimits {
        max_lines: args.max_lines,
        min_pct_market: args.min_pct_market,
        min_pct_last: args.min_pct_last,
    };
    let digest = format_digest(&items, summary.suppressed, &limits);

    if args.dry_run {
        println!("{digest}");
    } else if !items.is_empty() || !args.skip_empty_alert {
        match &config.webhook_url {
            None => warn!("ASKWATCH_WEBHOOK_URL is not set, digest not sent"),
            Some(url) => {
                let channel = WebhookChannel::new(url.clone(), config.timeout())?;
                // State is already committed; a lost digest only costs this
                // run's message, so log and carry on to the exit status.
                if let Err(err) = channel.send(&digest).await {
                    warn!(error = %err, "alert delivery failed");
                }
            }
        }
    }

    println!(
        "scan complete: run_id={} facts={} notified={} suppressed={} skipped={}",
        summary.run_id,
        summary.facts_seen,
        summary.notified,
        summary.suppressed,
        summary.skipped_malformed
    );

    if let Persistence::Failed { error } = &summary.persistence {
        bail!("state commit failed after alerting: {error}");
    }
    Ok(())
}

async fn show_state(config: ScanConfig) -> Result<()> {
    let store = config.state_store()?;
    let document = store.load().await?;

    println!(
        "{}: {} records, updated {}",
        store.location(),
        document.records.len(),
        document.updated_at.to_rfc3339()
    );
    for (sku, record) in &document.records {
        let notified = record
            .last_notified_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_else(|| "never".to_string());
        println!(
            "{sku}: ask {} notified {notified} seen {}",
            record.last_ask,
            record.last_seen_at.to_rfc3339()
        );
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let config = ScanConfig::from_env();

    match cli
        .command
        .unwrap_or_else(|| Commands::Scan(ScanArgs::default()))
    {
        Commands::Scan(args) => run_scan(config, args).await,
        Commands::State => show_state(config).await,
    }
}

//! Outbound alert channel for askwatch: digest formatting plus webhook
//! delivery. The engine decides what to alert on; this crate only turns
//! those decisions into text and moves the text.

use std::fmt::Write as _;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use thiserror::Error;
use tracing::info;

use askwatch_core::Price;

pub const CRATE_NAME: &str = "askwatch-notify";

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("webhook returned status {status}")]
    HttpStatus { status: u16 },
}

/// Delivery seam. Implementations report per-attempt success or failure
/// and never panic on an unreachable endpoint.
#[async_trait]
pub trait AlertChannel: Send + Sync {
    async fn send(&self, text: &str) -> Result<(), ChannelError>;
}

/// Webhook channel posting `{"text": ...}`. Anything but a 200 counts as
/// a failed attempt.
pub struct WebhookChannel {
    client: reqwest::Client,
    url: String,
}

impl WebhookChannel {
    pub fn new(url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl AlertChannel for WebhookChannel {
    async fn send(&self, text: &str) -> Result<(), ChannelError> {
        let resp = self
            .client
            .post(&self.url)
            .json(&serde_json::json!({ "text": text }))
            .send()
            .await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            return Err(ChannelError::HttpStatus {
                status: status.as_u16(),
            });
        }
        info!(bytes = text.len(), "alert digest delivered");
        Ok(())
    }
}

/// One digest line: an alert decision joined with the display context the
/// caller kept from the scan.
#[derive(Debug, Clone, PartialEq)]
pub struct AlertItem {
    pub sku: String,
    pub name: String,
    pub vintage: Option<String>,
    pub region: Option<String>,
    pub case_format: String,
    pub ask: Price,
    pub previous_ask: Option<Price>,
    pub market: Price,
    pub pct_market: f64,
    pub pct_last: Option<f64>,
    pub url: Option<String>,
}

/// Digest shape knobs. The thresholds only appear in the header so a
/// reader knows what bar these candidates cleared.
#[derive(Debug, Clone, Copy)]
pub struct DigestLimits {
    pub max_lines: usize,
    pub min_pct_market: f64,
    pub min_pct_last: f64,
}

impl Default for DigestLimits {
    fn default() -> Self {
        Self {
            max_lines: 20,
            min_pct_market: 15.0,
            min_pct_last: 15.0,
        }
    }
}

/// Builds the whole digest message for one run. An empty run still gets a
/// line, so a quiet scan is distinguishable from a dead one.
pub fn format_digest(items: &[AlertItem], suppressed: usize, limits: &DigestLimits) -> String {
    if items.is_empty() {
        let mut message = "Ask scan: no new or improved asks.".to_string();
        if suppressed > 0 {
            let _ = write!(
                message,
                "\n(Suppressed {suppressed} previously-notified listings this run.)"
            );
        }
        return message;
    }

    let mut message = format!(
        "Ask scan - {} candidates (mkt>={}%, last>={}%)",
        items.len(),
        limits.min_pct_market,
        limits.min_pct_last,
    );

    for (index, item) in items.iter().take(limits.max_lines).enumerate() {
        let _ = write!(
            message,
            "\n{}. {} ({}, {}, {}) - £{} ask | £{} mkt ({:.1}%)",
            index + 1,
            item.name,
            item.vintage.as_deref().unwrap_or("NV"),
            item.region.as_deref().unwrap_or("-"),
            item.case_format,
            item.ask,
            item.market,
            item.pct_market,
        );
        if let Some(pct_last) = item.pct_last {
            let _ = write!(message, " | last {pct_last:.1}%");
        }
        if let Some(previous) = item.previous_ask {
            if previous > item.ask {
                let _ = write!(message, " | down from £{previous}");
            }
        }
        if let Some(url) = &item.url {
            let _ = write!(message, " - {url}");
        }
    }

    if items.len() > limits.max_lines {
        let _ = write!(message, "\n... and {} more.", items.len() - limits.max_lines);
    }

    if suppressed > 0 {
        let _ = write!(
            message,
            "\n(Suppressed {suppressed} previously-notified listings this run.)"
        );
    }

    message
}

#[cfg(test)]
mod tests {
    use super::*;

    fn item(sku: &str, ask_minor: i64, previous_minor: Option<i64>) -> AlertItem {
        AlertItem {
            sku: sku.to_string(),
            name: format!("Wine {sku}"),
            vintage: Some("2015".to_string()),
            region: Some("Burgundy".to_string()),
            case_format: "6x75cl".to_string(),
            ask: Price::from_minor(ask_minor),
            previous_ask: previous_minor.map(Price::from_minor),
            market: Price::from_minor(10000),
            pct_market: 16.0,
            pct_last: None,
            url: Some(format!("https://market.example/{sku}")),
        }
    }

    #[test]
    fn empty_run_message_mentions_suppressed_count() {
        let quiet = format_digest(&[], 0, &DigestLimits::default());
        assert_eq!(quiet, "Ask scan: no new or improved asks.");

        let with_suppressed = format_digest(&[], 4, &DigestLimits::default());
        assert!(with_suppressed.contains("no new or improved asks"));
        assert!(with_suppressed.contains("Suppressed 4 previously-notified listings"));
    }

    #[test]
    fn digest_lists_numbered_candidates_under_a_threshold_header() {
        let items = vec![item("A1", 8400, None), item("B2", 8400, Some(10000))];
        let digest = format_digest(&items, 1, &DigestLimits::default());

        let mut lines = digest.lines();
        assert_eq!(
            lines.next().unwrap(),
            "Ask scan - 2 candidates (mkt>=15%, last>=15%)"
        );

        let first = lines.next().unwrap();
        assert!(first.starts_with("1. Wine A1 (2015, Burgundy, 6x75cl)"));
        assert!(first.contains("£84.00 ask"));
        assert!(first.contains("£100.00 mkt (16.0%)"));
        assert!(!first.contains("down from"));

        let second = lines.next().unwrap();
        assert!(second.starts_with("2. "));
        assert!(second.contains("down from £100.00"));

        assert!(digest.ends_with("(Suppressed 1 previously-notified listings this run.)"));
    }

    #[test]
    fn digest_caps_lines_and_counts_the_rest() {
        let items: Vec<AlertItem> = (0..5)
            .map(|i| item(&format!("SKU{i}"), 8400, None))
            .collect();
        let limits = DigestLimits {
            max_lines: 2,
            ..DigestLimits::default()
        };

        let digest = format_digest(&items, 0, &limits);
        assert!(digest.contains("... and 3 more."));
        assert!(!digest.contains("3. "));
    }

    #[test]
    fn reminder_lines_do_not_claim_a_drop() {
        // a reminder re-alerts at the same price, so previous == ask
        let items = vec![item("A1", 8400, Some(8400))];
        let digest = format_digest(&items, 0, &DigestLimits::default());
        assert!(!digest.contains("down from"));
    }

    #[test]
    fn missing_context_falls_back_to_placeholders() {
        let mut sparse = item("A1", 8400, None);
        sparse.vintage = None;
        sparse.region = None;
        sparse.url = None;

        let digest = format_digest(&[sparse], 0, &DigestLimits::default());
        assert!(digest.contains("(NV, -, 6x75cl)"));
        assert!(!digest.contains("https://"));
    }
}

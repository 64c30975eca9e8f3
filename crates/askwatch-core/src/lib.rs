//! Core domain model for askwatch: prices, observations, and dedup state.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "askwatch-core";

/// Version stamped into every persisted state document. Loaders treat any
/// other value as an unknown schema and start from an empty document.
pub const STATE_SCHEMA_VERSION: u32 = 1;

/// Monetary amount held in minor units (hundredths), so ordering and
/// equality are integer-exact. JSON carries the major-unit number:
/// `Price::from_minor(9000)` serializes as `90.0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Price(i64);

impl Price {
    /// Builds a price from a major-unit amount, rounding to the nearest
    /// minor unit. Non-finite and negative amounts are rejected, which
    /// makes this the validation point for raw upstream numbers.
    pub fn from_major(amount: f64) -> Option<Self> {
        if !amount.is_finite() || amount < 0.0 {
            return None;
        }
        Some(Self((amount * 100.0).round() as i64))
    }

    pub fn from_minor(minor: i64) -> Self {
        Self(minor)
    }

    pub fn minor(&self) -> i64 {
        self.0
    }

    pub fn major(&self) -> f64 {
        self.0 as f64 / 100.0
    }
}

impl fmt::Display for Price {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:02}", self.0 / 100, self.0 % 100)
    }
}

impl Serialize for Price {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(self.major())
    }
}

impl<'de> Deserialize<'de> for Price {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let amount = f64::deserialize(deserializer)?;
        Price::from_major(amount)
            .ok_or_else(|| serde::de::Error::custom(format!("invalid price amount {amount}")))
    }
}

/// Minimal comparable fact about one listed SKU at one scan instant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AskObservation {
    pub sku: String,
    pub ask: Price,
    pub observed_at: DateTime<Utc>,
}

/// Extractor output for one scan: valid observations plus the number of
/// raw listings dropped as malformed.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ObservationBatch {
    pub observations: Vec<AskObservation>,
    pub skipped_malformed: usize,
}

/// Per-SKU dedup state. The SKU itself is the key of
/// [`StateDocument::records`]. `last_ask` only moves when a notification
/// goes out, so it always names the last *notified* ask.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationRecord {
    pub last_ask: Price,
    pub last_notified_at: Option<DateTime<Utc>>,
    pub last_seen_at: DateTime<Utc>,
}

/// The single durable JSON document backing dedup decisions. BTreeMap
/// keeps one record per SKU and a stable sorted serialization.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StateDocument {
    pub schema_version: u32,
    pub updated_at: DateTime<Utc>,
    pub records: BTreeMap<String, NotificationRecord>,
}

impl StateDocument {
    pub fn empty(now: DateTime<Utc>) -> Self {
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            updated_at: now,
            records: BTreeMap::new(),
        }
    }
}

/// One notify decision shaped for the outbound channel: the ask that
/// triggered it plus the previously notified ask when one exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceAlert {
    pub sku: String,
    pub ask: Price,
    pub previous_ask: Option<Price>,
}

//! Dedup policy and the per-run coordinator for askwatch.
//!
//! The policy is pure: previous record, observation and clock in; action
//! and replacement record out. The coordinator wraps it in exactly one
//! load-decide-save pass and reports everything the caller needs to
//! deliver alerts and judge the run.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use tracing::{error, info};
use uuid::Uuid;

use askwatch_core::{AskObservation, NotificationRecord, ObservationBatch, PriceAlert};
use askwatch_store::{StateStore, StoreError};

pub const CRATE_NAME: &str = "askwatch-engine";

pub const DEFAULT_REMINDER_DAYS: i64 = 7;

/// What to do about one observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Action {
    Notify,
    Suppress,
}

/// The dedup decision rules. A record's `last_ask` always names the last
/// *notified* ask, so a worse price neither alerts nor moves the baseline
/// nor resets the reminder clock.
#[derive(Debug, Clone, Copy)]
pub struct DedupPolicy {
    pub reminder_interval_days: i64,
}

impl Default for DedupPolicy {
    fn default() -> Self {
        Self {
            reminder_interval_days: DEFAULT_REMINDER_DAYS,
        }
    }
}

impl DedupPolicy {
    /// Decides notify-vs-suppress for one observation. First matching rule
    /// wins: a first sighting notifies; a strictly cheaper ask than the
    /// last notified one notifies; an equal ask notifies once the reminder
    /// window has elapsed; everything else suppresses. The returned record
    /// replaces the previous one and always carries `last_seen_at = now`.
    pub fn decide(
        &self,
        previous: Option<&NotificationRecord>,
        observation: &AskObservation,
        now: DateTime<Utc>,
    ) -> (Action, NotificationRecord) {
        let Some(previous) = previous else {
            return (Action::Notify, self.notified_record(observation, now));
        };

        if observation.ask < previous.last_ask {
            return (Action::Notify, self.notified_record(observation, now));
        }

        if observation.ask == previous.last_ask
            && self.reminder_due(previous.last_notified_at, now)
        {
            return (Action::Notify, self.notified_record(observation, now));
        }

        (
            Action::Suppress,
            NotificationRecord {
                last_ask: previous.last_ask,
                last_notified_at: previous.last_notified_at,
                last_seen_at: now,
            },
        )
    }

    fn notified_record(
        &self,
        observation: &AskObservation,
        now: DateTime<Utc>,
    ) -> NotificationRecord {
        NotificationRecord {
            last_ask: observation.ask,
            last_notified_at: Some(now),
            last_seen_at: now,
        }
    }

    /// A record with no notification timestamp counts as due.
    fn reminder_due(&self, last_notified_at: Option<DateTime<Utc>>, now: DateTime<Utc>) -> bool {
        match last_notified_at {
            Some(at) => now - at >= Duration::days(self.reminder_interval_days),
            None => true,
        }
    }
}

/// How the state commit ended.
#[derive(Debug, Clone, Serialize)]
pub enum Persistence {
    Committed { location: String },
    Degraded { location: String, primary_error: String },
    Failed { error: String },
}

impl Persistence {
    pub fn failed(&self) -> bool {
        matches!(self, Persistence::Failed { .. })
    }
}

/// Everything a caller needs after one pass: what to send, what was
/// counted, and whether the state commit stuck.
#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub facts_seen: usize,
    pub notified: usize,
    pub suppressed: usize,
    pub skipped_malformed: usize,
    pub alerts: Vec<PriceAlert>,
    pub persistence: Persistence,
}

/// One read-decide-write pass over the state document.
pub struct AlertEngine {
    store: StateStore,
    policy: DedupPolicy,
}

impl AlertEngine {
    pub fn new(store: StateStore, policy: DedupPolicy) -> Self {
        Self { store, policy }
    }

    /// Runs one dedup pass. The state document is read once at the start
    /// and written once at the end. A failed write lands in the summary
    /// rather than in the return value so the alerts can still go out;
    /// the only error here is a store that cannot be read at all, in
    /// which case nothing was decided and nothing was mutated.
    pub async fn run_once(&self, batch: &ObservationBatch) -> Result<RunSummary, StoreError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();

        let mut document = self.store.load().await?;

        let mut alerts = Vec::new();
        let mut notified = 0usize;
        let mut suppressed = 0usize;

        for observation in &batch.observations {
            let previous = document.records.get(&observation.sku);
            let previous_ask = previous.map(|record| record.last_ask);
            let (action, record) = self.policy.decide(previous, observation, started_at);

            match action {
                Action::Notify => {
                    notified += 1;
                    alerts.push(PriceAlert {
                        sku: observation.sku.clone(),
                        ask: observation.ask,
                        previous_ask,
                    });
                }
                Action::Suppress => suppressed += 1,
            }
            document.records.insert(observation.sku.clone(), record);
        }

        let persistence = match self.store.save(&document).await {
            Ok(receipt) => match receipt.degraded {
                None => Persistence::Committed {
                    location: receipt.location,
                },
                Some(primary_error) => Persistence::Degraded {
                    location: receipt.location,
                    primary_error,
                },
            },
            Err(err) => {
                error!(error = %err, "state commit failed, next run may re-alert");
                Persistence::Failed {
                    error: err.to_string(),
                }
            }
        };

        let summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            facts_seen: batch.observations.len(),
            notified,
            suppressed,
            skipped_malformed: batch.skipped_malformed,
            alerts,
            persistence,
        };

        info!(
            run_id = %summary.run_id,
            facts_seen = summary.facts_seen,
            notified = summary.notified,
            suppressed = summary.suppressed,
            skipped_malformed = summary.skipped_malformed,
            "dedup pass complete"
        );
        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use askwatch_core::Price;

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).expect("ts").with_timezone(&Utc)
    }

    fn obs(sku: &str, minor: i64, at: DateTime<Utc>) -> AskObservation {
        AskObservation {
            sku: sku.to_string(),
            ask: Price::from_minor(minor),
            observed_at: at,
        }
    }

    fn notified(minor: i64, at: DateTime<Utc>) -> NotificationRecord {
        NotificationRecord {
            last_ask: Price::from_minor(minor),
            last_notified_at: Some(at),
            last_seen_at: at,
        }
    }

    #[test]
    fn first_sighting_notifies_and_seeds_the_record() {
        let policy = DedupPolicy::default();
        let t0 = ts("2025-11-23T08:10:00Z");

        let (action, record) = policy.decide(None, &obs("A1", 10000, t0), t0);

        assert_eq!(action, Action::Notify);
        assert_eq!(record.last_ask, Price::from_minor(10000));
        assert_eq!(record.last_notified_at, Some(t0));
        assert_eq!(record.last_seen_at, t0);
    }

    #[test]
    fn cheaper_ask_notifies_and_moves_the_baseline() {
        let policy = DedupPolicy::default();
        let t0 = ts("2025-11-23T08:10:00Z");
        let t1 = t0 + Duration::hours(2);

        let (action, record) = policy.decide(Some(&notified(10000, t0)), &obs("A1", 9000, t1), t1);

        assert_eq!(action, Action::Notify);
        assert_eq!(record.last_ask, Price::from_minor(9000));
        assert_eq!(record.last_notified_at, Some(t1));
        assert_eq!(record.last_seen_at, t1);
    }

    #[test]
    fn equal_ask_inside_reminder_window_suppresses_but_marks_seen() {
        let policy = DedupPolicy::default();
        let t1 = ts("2025-11-23T08:10:00Z");
        let later = t1 + Duration::days(1);

        let (action, record) =
            policy.decide(Some(&notified(9000, t1)), &obs("A1", 9000, later), later);

        assert_eq!(action, Action::Suppress);
        assert_eq!(record.last_ask, Price::from_minor(9000));
        assert_eq!(record.last_notified_at, Some(t1));
        assert_eq!(record.last_seen_at, later);
    }

    #[test]
    fn equal_ask_after_reminder_window_renotifies() {
        let policy = DedupPolicy::default();
        let t1 = ts("2025-11-23T08:10:00Z");
        let later = t1 + Duration::days(8);

        let (action, record) =
            policy.decide(Some(&notified(9000, t1)), &obs("A1", 9000, later), later);

        assert_eq!(action, Action::Notify);
        assert_eq!(record.last_ask, Price::from_minor(9000));
        assert_eq!(record.last_notified_at, Some(later));
        assert_eq!(record.last_seen_at, later);
    }

    #[test]
    fn reminder_boundary_is_inclusive() {
        let policy = DedupPolicy::default();
        let t1 = ts("2025-11-23T08:10:00Z");
        let exactly = t1 + Duration::days(DEFAULT_REMINDER_DAYS);

        let (action, _) =
            policy.decide(Some(&notified(9000, t1)), &obs("A1", 9000, exactly), exactly);
        assert_eq!(action, Action::Notify);

        let just_short = exactly - Duration::seconds(1);
        let (action, _) = policy.decide(
            Some(&notified(9000, t1)),
            &obs("A1", 9000, just_short),
            just_short,
        );
        assert_eq!(action, Action::Suppress);
    }

    #[test]
    fn worse_ask_suppresses_without_touching_the_baseline() {
        let policy = DedupPolicy::default();
        let t1 = ts("2025-11-23T08:10:00Z");
        let later = t1 + Duration::days(1);

        let (action, record) =
            policy.decide(Some(&notified(9000, t1)), &obs("A1", 9500, later), later);

        assert_eq!(action, Action::Suppress);
        assert_eq!(record.last_ask, Price::from_minor(9000));
        assert_eq!(record.last_notified_at, Some(t1));
        assert_eq!(record.last_seen_at, later);

        // the worse sighting did not reset the reminder clock
        let reminder_at = t1 + Duration::days(8);
        let (action, _) = policy.decide(Some(&record), &obs("A1", 9000, reminder_at), reminder_at);
        assert_eq!(action, Action::Notify);
    }

    #[test]
    fn equal_ask_is_not_treated_as_cheaper() {
        let policy = DedupPolicy::default();
        let t1 = ts("2025-11-23T08:10:00Z");
        let moments_later = t1 + Duration::minutes(5);

        let (action, _) = policy.decide(
            Some(&notified(9000, t1)),
            &obs("A1", 9000, moments_later),
            moments_later,
        );
        assert_eq!(action, Action::Suppress);
    }

    #[test]
    fn record_without_notified_timestamp_counts_as_due() {
        let policy = DedupPolicy::default();
        let t1 = ts("2025-11-23T08:10:00Z");
        let previous = NotificationRecord {
            last_ask: Price::from_minor(9000),
            last_notified_at: None,
            last_seen_at: t1,
        };

        let (action, record) = policy.decide(Some(&previous), &obs("A1", 9000, t1), t1);
        assert_eq!(action, Action::Notify);
        assert_eq!(record.last_notified_at, Some(t1));
    }
}

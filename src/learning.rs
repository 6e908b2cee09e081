//! Learning Feedback Engine
//!
//! Periodically rebuilds per-(channel, time slot) weights from the outcome
//! history. Slots that have been both reliable and busy enough to trust get
//! a priority bonus; sparse or failing slots stay neutral. The table is a
//! cache over the outcome log and can be rebuilt from scratch at any time.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, RwLock};
use tracing::{debug, info, warn};

use crate::recorder::Outcome;
use crate::store::{OutcomeStore, StoreError};

/// Discretized time-of-day/day-of-week bucket
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TimeSlot {
    /// 0 = Monday .. 6 = Sunday
    pub weekday: u8,
    /// 0..=23
    pub hour: u8,
}

impl TimeSlot {
    pub fn from_timestamp(timestamp: i64) -> Self {
        let dt = chrono::DateTime::<Utc>::from_timestamp(timestamp, 0).unwrap_or_default();
        Self {
            weekday: dt.weekday().num_days_from_monday() as u8,
            hour: dt.hour() as u8,
        }
    }
}

/// Immutable weight snapshot consumed by the queue at peek time
#[derive(Debug, Default, Clone)]
pub struct WeightTable {
    scores: HashMap<String, HashMap<TimeSlot, f64>>,
}

impl WeightTable {
    /// Priority bonus for a channel in a time slot; 0 when nothing is known
    pub fn bonus(&self, channel: &str, slot: TimeSlot) -> f64 {
        self.scores
            .get(channel)
            .and_then(|slots| slots.get(&slot))
            .copied()
            .unwrap_or(0.0)
    }

    /// Number of (channel, slot) buckets with a score
    pub fn len(&self) -> usize {
        self.scores.values().map(|slots| slots.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Learning engine configuration
#[derive(Debug, Clone)]
pub struct LearningConfig {
    /// Trailing window of outcome history to learn from
    pub lookback: Duration,
    /// How often the periodic task recomputes
    pub interval: Duration,
    /// Upper bound of the normalized per-channel bonus
    pub max_bonus: f64,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            lookback: Duration::from_secs(30 * 86_400),
            interval: Duration::from_secs(3_600),
            max_bonus: 2.0,
        }
    }
}

/// Rebuilds the weight table from outcome history on a fixed period.
///
/// Owns the table exclusively; everyone else reads snapshots. The swap is a
/// single write, so readers never observe a half-updated table, and a crash
/// mid-recompute just leaves the previous table in place.
pub struct LearningEngine {
    store: Arc<dyn OutcomeStore>,
    config: LearningConfig,
    weights: RwLock<Arc<WeightTable>>,
}

impl LearningEngine {
    pub fn new(store: Arc<dyn OutcomeStore>, config: LearningConfig) -> Self {
        Self {
            store,
            config,
            weights: RwLock::new(Arc::new(WeightTable::default())),
        }
    }

    /// Current weight snapshot
    pub async fn current(&self) -> Arc<WeightTable> {
        self.weights.read().await.clone()
    }

    /// Rebuild the weight table from the trailing outcome history.
    ///
    /// Pure with respect to its input: identical history yields an identical
    /// table. Returns the number of scored buckets.
    pub async fn recompute(&self, now: i64) -> Result<usize, StoreError> {
        let from = now - self.config.lookback.as_secs() as i64;
        let outcomes = self.store.read_outcomes(from, now).await?;

        let table = build_table(&outcomes, self.config.max_bonus);
        let buckets = table.len();
        *self.weights.write().await = Arc::new(table);

        debug!(
            "Recomputed channel weights: {} buckets from {} outcomes",
            buckets,
            outcomes.len()
        );
        Ok(buckets)
    }

    /// Periodic recompute loop; cancellable via the shutdown channel
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Learning engine started (every {:?}, lookback {:?})",
            self.config.interval, self.config.lookback
        );
        let mut ticker = tokio::time::interval(self.config.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let now = Utc::now().timestamp();
                    if let Err(e) = self.recompute(now).await {
                        // stale weights stay in place until the next cycle
                        warn!("Weight recompute failed, keeping current table: {e}");
                    }
                }
                res = shutdown.changed() => {
                    if res.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("Learning engine stopped");
    }
}

/// Score every (channel, slot) bucket, then normalize per channel so one
/// channel's learned scale never dominates cross-channel priority
/// comparisons.
pub(crate) fn build_table(outcomes: &[Outcome], max_bonus: f64) -> WeightTable {
    // (channel, slot) -> (successes, attempts)
    let mut buckets: HashMap<String, HashMap<TimeSlot, (u64, u64)>> = HashMap::new();
    for outcome in outcomes {
        let slot = TimeSlot::from_timestamp(outcome.timestamp);
        let counts = buckets
            .entry(outcome.channel.clone())
            .or_default()
            .entry(slot)
            .or_insert((0, 0));
        counts.1 += 1;
        if outcome.succeeded {
            counts.0 += 1;
        }
    }

    let mut scores = HashMap::new();
    for (channel, slots) in buckets {
        // success_rate * ln(1 + volume): rewards reliable slots with enough
        // samples, damping noisy low-volume outliers
        let raw: HashMap<TimeSlot, f64> = slots
            .into_iter()
            .map(|(slot, (successes, attempts))| {
                let success_rate = successes as f64 / attempts as f64;
                (slot, success_rate * (1.0 + attempts as f64).ln())
            })
            .collect();

        let peak = raw.values().copied().fold(0.0_f64, f64::max);
        let normalized = if peak > 0.0 {
            raw.into_iter()
                .map(|(slot, score)| (slot, score / peak * max_bonus))
                .collect()
        } else {
            raw
        };
        scores.insert(channel, normalized);
    }

    WeightTable { scores }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::Action;
    use crate::channel::ChannelError;
    use crate::store::MemoryStore;
    use serde_json::json;

    fn outcome(channel: &str, timestamp: i64, succeeded: bool) -> Outcome {
        let action = Action::publish(channel, json!({}));
        if succeeded {
            Outcome::success(&action, 5, timestamp)
        } else {
            Outcome::failure(&action, &ChannelError::Timeout, 5, timestamp)
        }
    }

    fn ts(day_offset: i64, hour: u8) -> i64 {
        // 2026-08-03 00:00:00 UTC, a Monday
        let monday_midnight = 1_785_715_200;
        monday_midnight + day_offset * 86_400 + hour as i64 * 3_600
    }

    #[test]
    fn test_time_slot_from_timestamp() {
        let slot = TimeSlot::from_timestamp(ts(0, 9));
        assert_eq!(slot.weekday, 0);
        assert_eq!(slot.hour, 9);

        let slot = TimeSlot::from_timestamp(ts(5, 23));
        assert_eq!(slot.weekday, 5);
        assert_eq!(slot.hour, 23);
    }

    #[tokio::test]
    async fn test_empty_history_yields_all_zero_scores() {
        let store = Arc::new(MemoryStore::new());
        let engine = LearningEngine::new(store, LearningConfig::default());

        let buckets = engine.recompute(ts(0, 12)).await.unwrap();
        assert_eq!(buckets, 0);

        let table = engine.current().await;
        assert!(table.is_empty());
        assert_eq!(table.bonus("twitter", TimeSlot::from_timestamp(ts(0, 9))), 0.0);
    }

    #[tokio::test]
    async fn test_recompute_is_idempotent() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..10 {
            store
                .append_outcome(&outcome("twitter", ts(0, 9) + i, i % 3 != 0))
                .await
                .unwrap();
        }
        let engine = LearningEngine::new(store, LearningConfig::default());

        engine.recompute(ts(1, 0)).await.unwrap();
        let first = engine.current().await;
        engine.recompute(ts(1, 0)).await.unwrap();
        let second = engine.current().await;

        let slot = TimeSlot::from_timestamp(ts(0, 9));
        assert_eq!(first.len(), second.len());
        assert_eq!(first.bonus("twitter", slot), second.bonus("twitter", slot));
    }

    #[tokio::test]
    async fn test_volume_damps_low_sample_slots() {
        let store = Arc::new(MemoryStore::new());
        // slot A: 10 successes; slot B: 2 successes; both perfect rates
        for i in 0..10 {
            store
                .append_outcome(&outcome("twitter", ts(0, 9) + i, true))
                .await
                .unwrap();
        }
        for i in 0..2 {
            store
                .append_outcome(&outcome("twitter", ts(0, 15) + i, true))
                .await
                .unwrap();
        }
        let engine = LearningEngine::new(store, LearningConfig::default());
        engine.recompute(ts(1, 0)).await.unwrap();

        let table = engine.current().await;
        let busy = table.bonus("twitter", TimeSlot::from_timestamp(ts(0, 9)));
        let sparse = table.bonus("twitter", TimeSlot::from_timestamp(ts(0, 15)));
        assert!(busy > sparse);
        assert!(sparse > 0.0);
    }

    #[tokio::test]
    async fn test_per_channel_normalization_bounds_bonus() {
        let config = LearningConfig::default();
        let store = Arc::new(MemoryStore::new());
        // twitter has far more volume than mastodon; after per-channel
        // normalization both peaks sit at max_bonus
        for i in 0..100 {
            store
                .append_outcome(&outcome("twitter", ts(0, 9) + i, true))
                .await
                .unwrap();
        }
        for i in 0..4 {
            store
                .append_outcome(&outcome("mastodon", ts(0, 9) + i, true))
                .await
                .unwrap();
        }
        let engine = LearningEngine::new(store, config.clone());
        engine.recompute(ts(1, 0)).await.unwrap();

        let table = engine.current().await;
        let slot = TimeSlot::from_timestamp(ts(0, 9));
        let twitter = table.bonus("twitter", slot);
        let mastodon = table.bonus("mastodon", slot);
        assert!((twitter - config.max_bonus).abs() < 1e-9);
        assert!((mastodon - config.max_bonus).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_all_failures_score_zero() {
        let store = Arc::new(MemoryStore::new());
        for i in 0..5 {
            store
                .append_outcome(&outcome("discord", ts(2, 20) + i, false))
                .await
                .unwrap();
        }
        let engine = LearningEngine::new(store, LearningConfig::default());
        engine.recompute(ts(3, 0)).await.unwrap();

        let table = engine.current().await;
        assert_eq!(table.bonus("discord", TimeSlot::from_timestamp(ts(2, 20))), 0.0);
    }

    #[tokio::test]
    async fn test_lookback_excludes_old_outcomes() {
        let store = Arc::new(MemoryStore::new());
        let config = LearningConfig {
            lookback: Duration::from_secs(86_400),
            ..Default::default()
        };
        let now = ts(10, 0);
        // inside the window
        store
            .append_outcome(&outcome("twitter", now - 3_600, true))
            .await
            .unwrap();
        // outside the window
        store
            .append_outcome(&outcome("twitter", now - 3 * 86_400, true))
            .await
            .unwrap();

        let engine = LearningEngine::new(store, config);
        let buckets = engine.recompute(now).await.unwrap();
        assert_eq!(buckets, 1);
    }
}

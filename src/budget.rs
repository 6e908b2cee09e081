//! Rate Budget Tracker
//!
//! Per-channel action budgets over fixed hourly and daily windows.
//!
//! Features:
//! - Hourly and daily limits enforced simultaneously per channel
//! - Admission requires remaining capacity in every configured window
//! - Denials report how long until the soonest exhausted window resets
//! - Per-channel critical sections; channels never block each other
//! - Window state snapshots for persistence across restarts

use std::collections::HashMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, warn};

/// Window granularity for a channel limit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Granularity {
    Hourly,
    Daily,
}

impl Granularity {
    pub fn duration_secs(&self) -> i64 {
        match self {
            Self::Hourly => 3_600,
            Self::Daily => 86_400,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
        }
    }
}

/// One limit: at most `limit` grants per window of `granularity`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowLimit {
    pub granularity: Granularity,
    pub limit: u32,
}

impl WindowLimit {
    pub fn hourly(limit: u32) -> Self {
        Self {
            granularity: Granularity::Hourly,
            limit,
        }
    }

    pub fn daily(limit: u32) -> Self {
        Self {
            granularity: Granularity::Daily,
            limit,
        }
    }
}

/// Result of an admission check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    Granted,
    /// Denied; `retry_after` is seconds until the soonest exhausted window
    /// resets
    Denied { retry_after: i64 },
}

impl Admission {
    pub fn is_granted(&self) -> bool {
        matches!(self, Self::Granted)
    }
}

/// State of one counting window; serializable so it survives restarts
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct WindowState {
    pub granularity: Granularity,
    pub limit: u32,
    pub window_start: i64,
    pub consumed: u32,
}

impl WindowState {
    fn new(limit: WindowLimit, now: i64) -> Self {
        let duration = limit.granularity.duration_secs();
        Self {
            granularity: limit.granularity,
            limit: limit.limit,
            // align to wall-clock boundaries, matching calendar buckets
            window_start: now - now.rem_euclid(duration),
            consumed: 0,
        }
    }

    /// Advance past expired windows. Moves `window_start` forward by whole
    /// multiples of the duration only; never rewinds, never carries credit.
    fn roll(&mut self, now: i64) {
        let duration = self.granularity.duration_secs();
        if now >= self.window_start + duration {
            let elapsed = now - self.window_start;
            self.window_start += (elapsed / duration) * duration;
            self.consumed = 0;
        }
    }

    fn remaining(&self) -> u32 {
        self.limit.saturating_sub(self.consumed)
    }

    fn reset_in(&self, now: i64) -> i64 {
        (self.window_start + self.granularity.duration_secs() - now).max(0)
    }
}

/// All windows for one channel. Mutated only under that channel's mutex.
#[derive(Debug)]
struct ChannelState {
    windows: Vec<WindowState>,
}

impl ChannelState {
    fn new(limits: &[WindowLimit], now: i64) -> Self {
        Self {
            windows: limits.iter().map(|l| WindowState::new(*l, now)).collect(),
        }
    }

    fn try_consume(&mut self, now: i64, cost: u32) -> Admission {
        for window in &mut self.windows {
            window.roll(now);
        }

        let mut retry_after: Option<i64> = None;
        for window in &self.windows {
            if window.remaining() < cost {
                let wait = window.reset_in(now);
                retry_after = Some(retry_after.map_or(wait, |r| r.min(wait)));
            }
        }

        if let Some(retry_after) = retry_after {
            return Admission::Denied { retry_after };
        }

        for window in &mut self.windows {
            window.consumed += cost;
        }
        Admission::Granted
    }
}

/// Usage of one window, for the operator surface
#[derive(Debug, Clone, Serialize)]
pub struct WindowUsage {
    pub granularity: &'static str,
    pub consumed: u32,
    pub limit: u32,
    pub remaining: u32,
    pub resets_in_secs: i64,
}

/// Per-channel budget usage
#[derive(Debug, Clone, Serialize)]
pub struct BudgetStatus {
    pub channel: String,
    pub windows: Vec<WindowUsage>,
}

/// Tracks action budgets for every configured channel.
///
/// The channel map is read-mostly; each channel's window state sits behind
/// its own mutex, so admission checks for different channels never contend.
pub struct BudgetTracker {
    limits: HashMap<String, Vec<WindowLimit>>,
    channels: RwLock<HashMap<String, Arc<Mutex<ChannelState>>>>,
}

impl BudgetTracker {
    pub fn new(limits: HashMap<String, Vec<WindowLimit>>) -> Self {
        Self {
            limits,
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Channels with configured limits
    pub fn configured_channels(&self) -> Vec<String> {
        self.limits.keys().cloned().collect()
    }

    async fn channel_state(&self, channel: &str, now: i64) -> Option<Arc<Mutex<ChannelState>>> {
        if let Some(state) = self.channels.read().await.get(channel) {
            return Some(state.clone());
        }
        let limits = self.limits.get(channel)?;
        let mut map = self.channels.write().await;
        Some(
            map.entry(channel.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(ChannelState::new(limits, now))))
                .clone(),
        )
    }

    /// Check whether one action may run on `channel` now, consuming one unit
    /// from every window if so.
    ///
    /// Channels without configured limits are allowed through with a warning
    /// rather than blocked; limits are an explicit opt-in per channel.
    pub async fn try_consume(&self, channel: &str, now: i64, cost: u32) -> Admission {
        let Some(state) = self.channel_state(channel, now).await else {
            warn!("No rate limits configured for channel {channel}, allowing");
            return Admission::Granted;
        };

        let admission = state.lock().await.try_consume(now, cost);
        match admission {
            Admission::Granted => debug!("Budget granted for {channel}"),
            Admission::Denied { retry_after } => {
                debug!("Budget denied for {channel}, resets in {retry_after}s")
            }
        }
        admission
    }

    /// Current usage for every configured channel
    pub async fn usage(&self, now: i64) -> Vec<BudgetStatus> {
        let mut statuses = Vec::new();
        let mut channels: Vec<&String> = self.limits.keys().collect();
        channels.sort();

        for channel in channels {
            let Some(state) = self.channel_state(channel, now).await else {
                continue;
            };
            let mut state = state.lock().await;
            for window in &mut state.windows {
                window.roll(now);
            }
            statuses.push(BudgetStatus {
                channel: channel.clone(),
                windows: state
                    .windows
                    .iter()
                    .map(|w| WindowUsage {
                        granularity: w.granularity.as_str(),
                        consumed: w.consumed,
                        limit: w.limit,
                        remaining: w.remaining(),
                        resets_in_secs: w.reset_in(now),
                    })
                    .collect(),
            });
        }
        statuses
    }

    /// Clear all counters for a channel (operator action). Returns false for
    /// unconfigured channels.
    pub async fn reset(&self, channel: &str, now: i64) -> bool {
        let Some(limits) = self.limits.get(channel) else {
            return false;
        };
        let mut map = self.channels.write().await;
        map.insert(
            channel.to_string(),
            Arc::new(Mutex::new(ChannelState::new(limits, now))),
        );
        debug!("Reset budget counters for {channel}");
        true
    }

    /// Snapshot a channel's window state for persistence
    pub async fn snapshot(&self, channel: &str, now: i64) -> Option<Vec<WindowState>> {
        let state = self.channel_state(channel, now).await?;
        let state = state.lock().await;
        Some(state.windows.clone())
    }

    /// Restore persisted window state so a restart keeps the current
    /// window's consumption. Limits come from configuration; only matching
    /// windows' start/consumed carry over, rolled forward to `now`.
    pub async fn restore(&self, channel: &str, persisted: &[WindowState], now: i64) {
        let Some(limits) = self.limits.get(channel) else {
            return;
        };

        let mut state = ChannelState::new(limits, now);
        for window in &mut state.windows {
            if let Some(saved) = persisted
                .iter()
                .find(|s| s.granularity == window.granularity)
            {
                if saved.window_start <= window.window_start + window.granularity.duration_secs() {
                    window.window_start = saved.window_start;
                    window.consumed = saved.consumed;
                }
            }
            window.roll(now);
        }

        let mut map = self.channels.write().await;
        map.insert(channel.to_string(), Arc::new(Mutex::new(state)));
        debug!("Restored budget window state for {channel}");
    }
}

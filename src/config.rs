//! Configuration management
//!
//! Everything tunable loads from environment variables with production
//! defaults, so a bare `herald` binary runs out of the box.

use std::collections::HashMap;
use std::time::Duration;

use anyhow::{bail, Context, Result};

use crate::budget::WindowLimit;
use crate::dispatch::DispatcherConfig;
use crate::learning::LearningConfig;
use crate::recorder::RecorderConfig;

/// Service configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Redis URL for the outcome log and budget state (optional; the
    /// in-memory store is the fallback)
    pub redis_url: Option<String>,

    /// Hourly/daily action limits per channel
    pub channel_limits: HashMap<String, Vec<WindowLimit>>,

    pub dispatcher: DispatcherConfig,
    pub learning: LearningConfig,
    pub recorder: RecorderConfig,
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let redis_url = std::env::var("HERALD_REDIS_URL").ok();

        let channel_limits = match std::env::var("HERALD_CHANNEL_LIMITS") {
            Ok(raw) => parse_channel_limits(&raw).context("invalid HERALD_CHANNEL_LIMITS")?,
            Err(_) => default_channel_limits(),
        };

        let mut dispatcher = DispatcherConfig::default();
        if let Some(v) = env_parse::<u64>("HERALD_POLL_INTERVAL_MS")? {
            dispatcher.poll_interval = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<usize>("HERALD_MAX_CONCURRENT")? {
            dispatcher.max_concurrent = v.max(1);
        }
        if let Some(v) = env_parse::<usize>("HERALD_MAX_CONCURRENT_PER_CHANNEL")? {
            dispatcher.max_concurrent_per_channel = (v > 0).then_some(v);
        }
        if let Some(v) = env_parse::<u64>("HERALD_CALL_TIMEOUT_SECS")? {
            dispatcher.call_timeout = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u32>("HERALD_MAX_ATTEMPTS")? {
            dispatcher.max_attempts = v.max(1);
        }
        if let Some(v) = env_parse::<u64>("HERALD_BACKOFF_BASE_SECS")? {
            dispatcher.backoff_base = Duration::from_secs(v);
        }
        if let Some(v) = env_parse::<u64>("HERALD_BACKOFF_MAX_SECS")? {
            dispatcher.backoff_max = Duration::from_secs(v);
        }

        let mut learning = LearningConfig::default();
        if let Some(v) = env_parse::<u64>("HERALD_LEARNING_INTERVAL_SECS")? {
            learning.interval = Duration::from_secs(v.max(1));
        }
        if let Some(v) = env_parse::<u64>("HERALD_LEARNING_LOOKBACK_DAYS")? {
            learning.lookback = Duration::from_secs(v * 86_400);
        }
        if let Some(v) = env_parse::<f64>("HERALD_LEARNING_MAX_BONUS")? {
            learning.max_bonus = v.max(0.0);
        }

        Ok(Self {
            redis_url,
            channel_limits,
            dispatcher,
            learning,
            recorder: RecorderConfig::default(),
        })
    }

    /// Tight timings for tests: fast polling, no backoff waits
    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            redis_url: None,
            channel_limits: default_channel_limits(),
            dispatcher: DispatcherConfig {
                poll_interval: Duration::from_millis(10),
                backoff_base: Duration::from_millis(0),
                ..Default::default()
            },
            learning: LearningConfig::default(),
            recorder: RecorderConfig::default(),
        }
    }
}

/// Production defaults per channel
pub fn default_channel_limits() -> HashMap<String, Vec<WindowLimit>> {
    let mut limits = HashMap::new();
    limits.insert(
        "twitter".to_string(),
        vec![WindowLimit::hourly(5), WindowLimit::daily(50)],
    );
    limits.insert(
        "mastodon".to_string(),
        vec![WindowLimit::hourly(10), WindowLimit::daily(100)],
    );
    limits.insert(
        "discord".to_string(),
        vec![WindowLimit::hourly(20), WindowLimit::daily(200)],
    );
    limits
}

/// Parse `"twitter=5/50,mastodon=10/100"` into per-channel hourly/daily
/// limits
pub fn parse_channel_limits(raw: &str) -> Result<HashMap<String, Vec<WindowLimit>>> {
    let mut limits = HashMap::new();
    for entry in raw.split(',').filter(|e| !e.trim().is_empty()) {
        let (channel, caps) = entry
            .split_once('=')
            .with_context(|| format!("expected channel=hourly/daily, got '{entry}'"))?;
        let channel = channel.trim();
        if channel.is_empty() {
            bail!("empty channel name in '{entry}'");
        }
        let (hourly, daily) = caps
            .split_once('/')
            .with_context(|| format!("expected hourly/daily caps, got '{caps}'"))?;
        let hourly: u32 = hourly
            .trim()
            .parse()
            .with_context(|| format!("invalid hourly cap in '{entry}'"))?;
        let daily: u32 = daily
            .trim()
            .parse()
            .with_context(|| format!("invalid daily cap in '{entry}'"))?;
        limits.insert(
            channel.to_string(),
            vec![WindowLimit::hourly(hourly), WindowLimit::daily(daily)],
        );
    }
    if limits.is_empty() {
        bail!("no channel limits configured");
    }
    Ok(limits)
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Result<Option<T>>
where
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => {
            let value = raw
                .parse()
                .with_context(|| format!("invalid {name}: '{raw}'"))?;
            Ok(Some(value))
        }
        Err(_) => Ok(None),
    }
}

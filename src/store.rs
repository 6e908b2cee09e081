//! Persistent Store
//!
//! The external key-value collaborator: an append-only outcome log with
//! ranged reads for the learning engine, plus budget window state so a
//! restart does not grant a fresh budget mid-window.
//!
//! Redis when configured; an in-memory implementation serves as the local
//! fallback and the test double.

use std::collections::HashMap;

use async_trait::async_trait;
use redis::AsyncCommands;
use tokio::sync::RwLock;
use tracing::debug;

use crate::budget::WindowState;
use crate::recorder::Outcome;

/// Store failures. Never propagated into the action lifecycle; callers log
/// and carry on.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("store unavailable: {0}")]
    Unavailable(String),
}

/// Append-only outcome log plus budget state, keyed per channel.
#[async_trait]
pub trait OutcomeStore: Send + Sync {
    /// Append one outcome, keyed by (channel, timestamp, action_id)
    async fn append_outcome(&self, outcome: &Outcome) -> Result<(), StoreError>;

    /// Read outcomes with `from <= timestamp <= to` across all channels
    async fn read_outcomes(&self, from: i64, to: i64) -> Result<Vec<Outcome>, StoreError>;

    /// Persist a channel's current budget windows
    async fn save_budget(&self, channel: &str, windows: &[WindowState]) -> Result<(), StoreError>;

    /// Load a channel's persisted budget windows, if any
    async fn load_budget(&self, channel: &str) -> Result<Option<Vec<WindowState>>, StoreError>;
}

/// Redis-backed store.
///
/// Outcomes live in one sorted set per channel scored by timestamp, which
/// makes the learning engine's ranged reads a single ZRANGEBYSCORE; budget
/// windows are plain JSON values.
pub struct RedisStore {
    conn: redis::aio::ConnectionManager,
}

impl RedisStore {
    pub async fn connect(url: &str) -> Result<Self, StoreError> {
        let client = redis::Client::open(url)?;
        let conn = client.get_connection_manager().await?;
        debug!("Connected to redis at {url}");
        Ok(Self { conn })
    }

    fn outcome_key(channel: &str) -> String {
        format!("herald:outcomes:{channel}")
    }

    fn budget_key(channel: &str) -> String {
        format!("herald:budget:{channel}")
    }
}

#[async_trait]
impl OutcomeStore for RedisStore {
    async fn append_outcome(&self, outcome: &Outcome) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let member = serde_json::to_string(outcome)?;
        let _: i64 = conn
            .zadd(Self::outcome_key(&outcome.channel), member, outcome.timestamp)
            .await?;
        let _: i64 = conn.sadd("herald:channels", &outcome.channel).await?;
        Ok(())
    }

    async fn read_outcomes(&self, from: i64, to: i64) -> Result<Vec<Outcome>, StoreError> {
        let mut conn = self.conn.clone();
        let channels: Vec<String> = conn.smembers("herald:channels").await?;

        let mut outcomes = Vec::new();
        for channel in channels {
            let raw: Vec<String> = conn
                .zrangebyscore(Self::outcome_key(&channel), from, to)
                .await?;
            for entry in raw {
                outcomes.push(serde_json::from_str(&entry)?);
            }
        }
        Ok(outcomes)
    }

    async fn save_budget(&self, channel: &str, windows: &[WindowState]) -> Result<(), StoreError> {
        let mut conn = self.conn.clone();
        let value = serde_json::to_string(windows)?;
        let _: () = conn.set(Self::budget_key(channel), value).await?;
        Ok(())
    }

    async fn load_budget(&self, channel: &str) -> Result<Option<Vec<WindowState>>, StoreError> {
        let mut conn = self.conn.clone();
        let value: Option<String> = conn.get(Self::budget_key(channel)).await?;
        match value {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }
}

/// In-memory store: the fallback when redis is not configured, and the
/// default test double.
#[derive(Default)]
pub struct MemoryStore {
    outcomes: RwLock<Vec<Outcome>>,
    budgets: RwLock<HashMap<String, Vec<WindowState>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl OutcomeStore for MemoryStore {
    async fn append_outcome(&self, outcome: &Outcome) -> Result<(), StoreError> {
        self.outcomes.write().await.push(outcome.clone());
        Ok(())
    }

    async fn read_outcomes(&self, from: i64, to: i64) -> Result<Vec<Outcome>, StoreError> {
        let outcomes = self.outcomes.read().await;
        let mut matching: Vec<Outcome> = outcomes
            .iter()
            .filter(|o| o.timestamp >= from && o.timestamp <= to)
            .cloned()
            .collect();
        matching.sort_by_key(|o| o.timestamp);
        Ok(matching)
    }

    async fn save_budget(&self, channel: &str, windows: &[WindowState]) -> Result<(), StoreError> {
        self.budgets
            .write()
            .await
            .insert(channel.to_string(), windows.to_vec());
        Ok(())
    }

    async fn load_budget(&self, channel: &str) -> Result<Option<Vec<WindowState>>, StoreError> {
        Ok(self.budgets.read().await.get(channel).cloned())
    }
}

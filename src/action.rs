//! Action Data Model
//!
//! The unit of autonomous work: one action targets one channel and carries
//! an opaque payload for that channel's adapter.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// What an action does on its channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    /// Publish a new piece of content
    Publish,
    /// Reply to a mention or notification
    Reply,
    /// Create or capture a payment order
    Charge,
}

impl ActionKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Publish => "publish",
            Self::Reply => "reply",
            Self::Charge => "charge",
        }
    }
}

/// A single unit of work targeting one channel.
///
/// Everything except `priority`, `not_before` and `attempt_count` is fixed
/// at enqueue time; those three are owned by the scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Action {
    /// Unique ID, assigned when the action is created
    pub id: String,
    /// Target channel name (twitter, mastodon, discord, ...)
    pub channel: String,
    /// What to do
    pub kind: ActionKind,
    /// Channel-specific payload (status text, reply body, order details)
    pub payload: Value,
    /// Base priority; higher dispatches first
    pub priority: i32,
    /// Unix timestamp before which the action must not dispatch
    pub not_before: i64,
    /// Creation timestamp
    pub created_at: i64,
    /// Attempts made so far
    pub attempt_count: u32,
}

impl Action {
    /// Create a new action, ready to dispatch immediately
    pub fn new(channel: &str, kind: ActionKind, payload: Value) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            channel: channel.to_string(),
            kind,
            payload,
            priority: 0,
            not_before: now,
            created_at: now,
            attempt_count: 0,
        }
    }

    /// Create a publish action
    pub fn publish(channel: &str, payload: Value) -> Self {
        Self::new(channel, ActionKind::Publish, payload)
    }

    /// Create a reply action
    pub fn reply(channel: &str, payload: Value) -> Self {
        Self::new(channel, ActionKind::Reply, payload)
    }

    /// Create a charge action
    pub fn charge(channel: &str, payload: Value) -> Self {
        Self::new(channel, ActionKind::Charge, payload)
    }

    /// Set base priority
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Set the earliest dispatch time
    pub fn with_not_before(mut self, not_before: i64) -> Self {
        self.not_before = not_before;
        self
    }

    /// Check if the action may dispatch at `now`
    pub fn is_ready(&self, now: i64) -> bool {
        now >= self.not_before
    }
}

/// Producer-facing enqueue request; the service assigns the id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ActionRequest {
    pub channel: String,
    pub kind: ActionKind,
    pub payload: Value,
    #[serde(default)]
    pub priority: i32,
    /// Earliest dispatch time; omitted means immediately
    #[serde(default)]
    pub not_before: Option<i64>,
}

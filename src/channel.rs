//! Channel Adapter Contract
//!
//! Universal interface for platform adapters, plus the error taxonomy the
//! dispatcher's retry decisions are built on. One implementation per
//! platform; the dispatcher treats them all uniformly.

use async_trait::async_trait;
use tracing::info;

use crate::action::Action;

/// Error types for channel operations.
///
/// The adapter classifies its platform's failures into these variants; the
/// dispatcher alone decides retry vs dead-letter from the classification.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ChannelError {
    #[error("request timed out")]
    Timeout,

    #[error("network error: {0}")]
    Network(String),

    #[error("server error: {0}")]
    Server(String),

    #[error("platform rate limited: retry after {0} seconds")]
    PlatformLimited(u64),

    #[error("authentication failed: {0}")]
    AuthFailed(String),

    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    #[error("content rejected: {0}")]
    ContentRejected(String),
}

impl ChannelError {
    /// Transient errors are retried with backoff; permanent ones dead-letter.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::Network(_) | Self::Server(_) | Self::PlatformLimited(_)
        )
    }

    /// Stable tag recorded alongside outcomes
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::Network(_) => "network",
            Self::Server(_) => "server",
            Self::PlatformLimited(_) => "platform_limited",
            Self::AuthFailed(_) => "auth_failed",
            Self::InvalidPayload(_) => "invalid_payload",
            Self::ContentRejected(_) => "content_rejected",
        }
    }
}

/// Channel adapter - implement for each platform.
///
/// `perform` executes exactly one action against the platform. The call runs
/// under the dispatcher's deadline; an adapter does not need its own timeout.
#[async_trait]
pub trait ChannelAdapter: Send + Sync {
    /// Channel name identifier
    fn name(&self) -> &str;

    /// Perform one action against the platform
    async fn perform(&self, action: &Action) -> Result<(), ChannelError>;
}

/// Adapter that logs the action and reports success.
///
/// Stands in for real platform adapters in dry runs and local development,
/// so the daemon exercises the full scheduling path without credentials.
pub struct LogAdapter {
    name: String,
}

impl LogAdapter {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }
}

#[async_trait]
impl ChannelAdapter for LogAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&self, action: &Action) -> Result<(), ChannelError> {
        info!(
            "[dry-run] {} {} on {}: {}",
            action.kind.as_str(),
            action.id,
            self.name,
            action.payload
        );
        Ok(())
    }
}

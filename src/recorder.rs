//! Outcome Recorder
//!
//! Append-only attempt telemetry. Recording never blocks or fails an
//! action's state transition: outcomes go through a bounded channel to a
//! background writer that retries persistence on its own schedule.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::action::{Action, ActionKind};
use crate::channel::ChannelError;
use crate::store::OutcomeStore;

/// Result of one dispatch attempt. One outcome per attempt, not per action.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Outcome {
    pub action_id: String,
    pub channel: String,
    pub kind: ActionKind,
    pub succeeded: bool,
    /// Error classification tag when the attempt failed
    pub error_kind: Option<String>,
    pub latency_ms: u64,
    pub timestamp: i64,
}

impl Outcome {
    pub fn success(action: &Action, latency_ms: u64, timestamp: i64) -> Self {
        Self {
            action_id: action.id.clone(),
            channel: action.channel.clone(),
            kind: action.kind,
            succeeded: true,
            error_kind: None,
            latency_ms,
            timestamp,
        }
    }

    pub fn failure(action: &Action, error: &ChannelError, latency_ms: u64, timestamp: i64) -> Self {
        Self {
            action_id: action.id.clone(),
            channel: action.channel.clone(),
            kind: action.kind,
            succeeded: false,
            error_kind: Some(error.kind().to_string()),
            latency_ms,
            timestamp,
        }
    }
}

/// Recorder configuration
#[derive(Debug, Clone)]
pub struct RecorderConfig {
    /// In-flight outcome buffer size
    pub buffer_size: usize,
    /// Persistence attempts per outcome before giving up
    pub write_attempts: u32,
    /// Delay between persistence attempts
    pub retry_delay: Duration,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            buffer_size: 256,
            write_attempts: 3,
            retry_delay: Duration::from_millis(500),
        }
    }
}

/// Handle for submitting outcomes. Cheap to clone.
#[derive(Clone)]
pub struct OutcomeRecorder {
    tx: mpsc::Sender<Outcome>,
    dropped: Arc<AtomicU64>,
}

impl OutcomeRecorder {
    /// Spawn the background writer and return the submission handle
    pub fn spawn(
        store: Arc<dyn OutcomeStore>,
        config: RecorderConfig,
        shutdown: watch::Receiver<bool>,
    ) -> (Self, JoinHandle<()>) {
        let (tx, rx) = mpsc::channel(config.buffer_size);
        let dropped = Arc::new(AtomicU64::new(0));
        let handle = tokio::spawn(writer_loop(store, rx, config, shutdown));
        (Self { tx, dropped }, handle)
    }

    /// Record one attempt outcome. Never blocks; when the buffer is full the
    /// outcome is dropped and counted, not propagated as an error.
    pub fn record(&self, outcome: Outcome) {
        if self.tx.try_send(outcome).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            warn!("Outcome buffer full, dropping record");
        }
    }

    /// Outcomes lost to a full buffer since startup
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

async fn writer_loop(
    store: Arc<dyn OutcomeStore>,
    mut rx: mpsc::Receiver<Outcome>,
    config: RecorderConfig,
    mut shutdown: watch::Receiver<bool>,
) {
    debug!("Outcome writer started");
    loop {
        tokio::select! {
            maybe = rx.recv() => match maybe {
                Some(outcome) => write_with_retry(&*store, &outcome, &config).await,
                None => break,
            },
            res = shutdown.changed() => {
                if res.is_err() || *shutdown.borrow() {
                    // flush whatever is already buffered before exiting
                    while let Ok(outcome) = rx.try_recv() {
                        write_with_retry(&*store, &outcome, &config).await;
                    }
                    break;
                }
            }
        }
    }
    debug!("Outcome writer stopped");
}

async fn write_with_retry(store: &dyn OutcomeStore, outcome: &Outcome, config: &RecorderConfig) {
    for attempt in 1..=config.write_attempts {
        match store.append_outcome(outcome).await {
            Ok(()) => return,
            Err(e) if attempt < config.write_attempts => {
                debug!("Outcome write failed (attempt {attempt}): {e}");
                tokio::time::sleep(config.retry_delay).await;
            }
            Err(e) => {
                warn!(
                    "Outcome write abandoned after {} attempts: {}",
                    config.write_attempts, e
                );
            }
        }
    }
}

//! Dispatcher
//!
//! The scheduling loop: pulls admissible actions from the queue, runs them
//! through channel adapters under a bounded worker pool, retries transient
//! failures with jittered exponential backoff, and dead-letters the rest.
//!
//! State machine per action:
//! `Queued -> Admitted -> InFlight -> {Succeeded | RetryScheduled -> Queued | DeadLettered}`

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use rand::Rng;
use serde::Serialize;
use tokio::sync::{watch, Mutex, OwnedSemaphorePermit, RwLock, Semaphore};
use tracing::{debug, info, warn};

use crate::action::Action;
use crate::budget::{Admission, BudgetTracker};
use crate::channel::{ChannelAdapter, ChannelError};
use crate::learning::LearningEngine;
use crate::queue::ActionQueue;
use crate::recorder::{Outcome, OutcomeRecorder};
use crate::store::OutcomeStore;

/// Dispatcher configuration
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// How often the loop polls when nothing is ready
    pub poll_interval: Duration,
    /// Global cap on concurrent adapter calls
    pub max_concurrent: usize,
    /// Optional cap on concurrent adapter calls per channel
    pub max_concurrent_per_channel: Option<usize>,
    /// Deadline for one adapter call; overruns count as transient failures
    pub call_timeout: Duration,
    /// Attempts before a transiently failing action dead-letters
    pub max_attempts: u32,
    /// First retry delay; doubles each attempt
    pub backoff_base: Duration,
    /// Upper bound on any retry delay
    pub backoff_max: Duration,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            max_concurrent: 8,
            max_concurrent_per_channel: Some(2),
            call_timeout: Duration::from_secs(30),
            max_attempts: 5,
            backoff_base: Duration::from_secs(2),
            backoff_max: Duration::from_secs(900),
        }
    }
}

/// Terminal record of an action that failed permanently or ran out of
/// retries. Stays inspectable until an operator purges it.
#[derive(Debug, Clone, Serialize)]
pub struct DeadLetter {
    pub action: Action,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: i64,
}

/// An action that passed admission control and left the queue. Carries its
/// per-channel concurrency slot for the duration of the attempt.
pub struct Admitted {
    pub action: Action,
    channel_permit: Option<OwnedSemaphorePermit>,
}

/// Dispatch counters for the operator surface
#[derive(Debug, Clone, Serialize)]
pub struct DispatchStats {
    pub in_flight: usize,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub outcomes_dropped: u64,
}

/// The scheduling engine. Exclusively owns in-flight action mutation;
/// everything it shares (queue, budgets, weights) is touched only through
/// the owning component's interface.
pub struct Dispatcher {
    config: DispatcherConfig,
    queue: Arc<Mutex<ActionQueue>>,
    budget: Arc<BudgetTracker>,
    adapters: HashMap<String, Arc<dyn ChannelAdapter>>,
    recorder: OutcomeRecorder,
    learning: Arc<LearningEngine>,
    store: Arc<dyn OutcomeStore>,
    dead_letters: RwLock<Vec<DeadLetter>>,
    global_slots: Arc<Semaphore>,
    channel_slots: HashMap<String, Arc<Semaphore>>,
    in_flight: AtomicUsize,
    succeeded: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
}

impl Dispatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: DispatcherConfig,
        queue: Arc<Mutex<ActionQueue>>,
        budget: Arc<BudgetTracker>,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
        recorder: OutcomeRecorder,
        learning: Arc<LearningEngine>,
        store: Arc<dyn OutcomeStore>,
    ) -> Self {
        let channel_slots = match config.max_concurrent_per_channel {
            Some(cap) => adapters
                .iter()
                .map(|a| (a.name().to_string(), Arc::new(Semaphore::new(cap))))
                .collect(),
            None => HashMap::new(),
        };
        let adapters = adapters
            .into_iter()
            .map(|a| (a.name().to_string(), a))
            .collect();

        Self {
            global_slots: Arc::new(Semaphore::new(config.max_concurrent)),
            config,
            queue,
            budget,
            adapters,
            recorder,
            learning,
            store,
            dead_letters: RwLock::new(Vec::new()),
            channel_slots,
            in_flight: AtomicUsize::new(0),
            succeeded: AtomicU64::new(0),
            retried: AtomicU64::new(0),
            dead_lettered: AtomicU64::new(0),
        }
    }

    /// One admission step: pick the best ready action and take it through
    /// admission control. Returns the admitted action (now removed from the
    /// queue), or None when nothing can dispatch right now.
    ///
    /// A budget denial advances the action's `not_before` to the window
    /// reset, so rate-limit backoff surfaces as rescheduling rather than a
    /// busy spin. A channel at its concurrency cap defers briefly instead.
    pub async fn poll_once(&self, now: i64) -> Option<Admitted> {
        let weights = self.learning.current().await;
        let mut queue = self.queue.lock().await;

        let candidate = queue.peek_ready(now, &weights)?;
        let id = candidate.id.clone();
        let channel = candidate.channel.clone();

        // simultaneity cap, independent of the volume budget
        let channel_permit = match self.channel_slots.get(&channel) {
            Some(slots) => match slots.clone().try_acquire_owned() {
                Ok(permit) => Some(permit),
                Err(_) => {
                    debug!("Channel {channel} at concurrency cap, deferring {id}");
                    queue.reschedule(&id, now + 1);
                    return None;
                }
            },
            None => None,
        };

        match self.budget.try_consume(&channel, now, 1).await {
            Admission::Granted => {
                let action = queue.remove(&id)?;
                drop(queue);
                self.persist_budget(&channel, now).await;
                debug!("Admitted {id} on {channel}");
                Some(Admitted {
                    action,
                    channel_permit,
                })
            }
            Admission::Denied { retry_after } => {
                queue.reschedule(&id, now + retry_after);
                debug!("Budget exhausted on {channel}, deferred {id} for {retry_after}s");
                None
            }
        }
    }

    /// Run one admitted action through its adapter and apply the resulting
    /// state transition. The queue lock is never held across the call.
    pub async fn execute(&self, admitted: Admitted) {
        let Admitted {
            mut action,
            channel_permit,
        } = admitted;

        let Some(adapter) = self.adapters.get(&action.channel).cloned() else {
            // enqueue-time validation makes this unreachable in practice
            let now = Utc::now().timestamp();
            action.attempt_count += 1;
            self.dead_letter(action, "no adapter registered".to_string(), now)
                .await;
            return;
        };

        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let start = Instant::now();
        let result = match tokio::time::timeout(self.config.call_timeout, adapter.perform(&action))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout),
        };
        let latency_ms = start.elapsed().as_millis() as u64;
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        let now = Utc::now().timestamp();
        action.attempt_count += 1;

        match result {
            Ok(()) => {
                self.recorder.record(Outcome::success(&action, latency_ms, now));
                self.succeeded.fetch_add(1, Ordering::Relaxed);
                info!(
                    "Dispatched {} {} to {} in {}ms",
                    action.kind.as_str(),
                    action.id,
                    action.channel,
                    latency_ms
                );
            }
            Err(error) => {
                self.recorder
                    .record(Outcome::failure(&action, &error, latency_ms, now));

                if error.is_transient() && action.attempt_count < self.config.max_attempts {
                    let delay = backoff_delay(action.attempt_count, &self.config);
                    warn!(
                        "Transient failure for {} on {} (attempt {}): {}; retrying in {:?}",
                        action.id, action.channel, action.attempt_count, error, delay
                    );
                    action.not_before = now + delay.as_secs() as i64;
                    self.retried.fetch_add(1, Ordering::Relaxed);
                    self.queue.lock().await.enqueue(action);
                } else {
                    self.dead_letter(action, error.to_string(), now).await;
                }
            }
        }

        // the channel slot stays occupied for the whole attempt
        drop(channel_permit);
    }

    /// Scheduling loop. Blocks while the worker pool is saturated, polls
    /// when idle, exits once the shutdown signal flips, and drains in-flight
    /// work before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        info!(
            "Dispatcher started ({} workers, {} channels)",
            self.config.max_concurrent,
            self.adapters.len()
        );

        loop {
            if *shutdown.borrow() {
                break;
            }

            let permit = tokio::select! {
                permit = self.global_slots.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
                res = shutdown.changed() => {
                    if res.is_err() {
                        break;
                    }
                    continue;
                }
            };

            let now = Utc::now().timestamp();
            match self.poll_once(now).await {
                Some(admitted) => {
                    let dispatcher = Arc::clone(&self);
                    tokio::spawn(async move {
                        dispatcher.execute(admitted).await;
                        drop(permit);
                    });
                }
                None => {
                    drop(permit);
                    tokio::select! {
                        _ = tokio::time::sleep(self.config.poll_interval) => {}
                        _ = shutdown.changed() => {}
                    }
                }
            }
        }

        // wait for in-flight dispatches to finish
        let _ = self
            .global_slots
            .acquire_many(self.config.max_concurrent as u32)
            .await;
        info!("Dispatcher stopped");
    }

    async fn dead_letter(&self, action: Action, reason: String, now: i64) {
        warn!(
            "Dead-lettering {} on {} after {} attempts: {}",
            action.id, action.channel, action.attempt_count, reason
        );
        self.dead_lettered.fetch_add(1, Ordering::Relaxed);
        self.dead_letters.write().await.push(DeadLetter {
            attempts: action.attempt_count,
            reason,
            failed_at: now,
            action,
        });
    }

    async fn persist_budget(&self, channel: &str, now: i64) {
        let Some(snapshot) = self.budget.snapshot(channel, now).await else {
            return;
        };
        if let Err(e) = self.store.save_budget(channel, &snapshot).await {
            warn!("Failed to persist budget state for {channel}: {e}");
        }
    }

    /// Current dead-letter list, oldest first
    pub async fn dead_letters(&self) -> Vec<DeadLetter> {
        self.dead_letters.read().await.clone()
    }

    /// Drop all dead letters (operator action). Returns how many were purged.
    pub async fn purge_dead_letters(&self) -> usize {
        let mut letters = self.dead_letters.write().await;
        let purged = letters.len();
        letters.clear();
        if purged > 0 {
            info!("Purged {purged} dead letters");
        }
        purged
    }

    pub fn stats(&self) -> DispatchStats {
        DispatchStats {
            in_flight: self.in_flight.load(Ordering::SeqCst),
            succeeded: self.succeeded.load(Ordering::Relaxed),
            retried: self.retried.load(Ordering::Relaxed),
            dead_lettered: self.dead_lettered.load(Ordering::Relaxed),
            outcomes_dropped: self.recorder.dropped(),
        }
    }
}

/// Deterministic backoff curve: `base * 2^attempt`, clamped to
/// `[base, backoff_max]`. Non-decreasing in the attempt count.
pub fn backoff_curve(attempt: u32, config: &DispatcherConfig) -> Duration {
    let base = config.backoff_base.as_secs_f64();
    let raw = base * 2_f64.powi(attempt.min(32) as i32);
    Duration::from_secs_f64(raw.clamp(base, config.backoff_max.as_secs_f64()))
}

/// Backoff with uniform jitter in [0.5, 1.5), clamped to the same bounds as
/// the deterministic curve
pub fn backoff_delay(attempt: u32, config: &DispatcherConfig) -> Duration {
    let base = config.backoff_base.as_secs_f64();
    let jitter: f64 = rand::thread_rng().gen_range(0.5..1.5);
    let raw = backoff_curve(attempt, config).as_secs_f64() * jitter;
    Duration::from_secs_f64(raw.clamp(base, config.backoff_max.as_secs_f64()))
}

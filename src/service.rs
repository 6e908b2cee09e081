//! Herald Service
//!
//! Wires the scheduler together and owns the background task lifecycle.
//! Producers talk to `enqueue`; operators read `status` and manage the
//! dead-letter list and budgets. Everything else runs on its own loops.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use chrono::Utc;
use serde::Serialize;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::action::{Action, ActionRequest};
use crate::budget::{BudgetStatus, BudgetTracker};
use crate::channel::ChannelAdapter;
use crate::config::Config;
use crate::dispatch::{DeadLetter, Dispatcher};
use crate::learning::LearningEngine;
use crate::queue::ActionQueue;
use crate::recorder::OutcomeRecorder;
use crate::store::OutcomeStore;

/// Rejections at the producer boundary. Malformed actions never reach the
/// queue.
#[derive(Debug, thiserror::Error)]
pub enum EnqueueError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("empty payload")]
    EmptyPayload,
}

/// Read-only introspection snapshot for operators
#[derive(Debug, Clone, Serialize)]
pub struct StatusReport {
    pub queue_depth: usize,
    pub queue_by_channel: HashMap<String, usize>,
    pub in_flight: usize,
    pub budgets: Vec<BudgetStatus>,
    pub dead_letters: Vec<DeadLetter>,
    pub succeeded: u64,
    pub retried: u64,
    pub dead_lettered: u64,
    pub outcomes_dropped: u64,
}

/// The assembled agent: queue, budgets, dispatcher, recorder and learning
/// engine behind one handle.
pub struct HeraldService {
    queue: Arc<Mutex<ActionQueue>>,
    budget: Arc<BudgetTracker>,
    dispatcher: Arc<Dispatcher>,
    learning: Arc<LearningEngine>,
    store: Arc<dyn OutcomeStore>,
    channels: HashSet<String>,
    shutdown_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl HeraldService {
    /// Assemble the service. Must run inside a tokio runtime; the outcome
    /// writer starts immediately, the scheduling loops start with `start`.
    pub fn new(
        config: Config,
        adapters: Vec<Arc<dyn ChannelAdapter>>,
        store: Arc<dyn OutcomeStore>,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let channels: HashSet<String> = adapters.iter().map(|a| a.name().to_string()).collect();
        let queue = Arc::new(Mutex::new(ActionQueue::new()));
        let budget = Arc::new(BudgetTracker::new(config.channel_limits));
        let learning = Arc::new(LearningEngine::new(store.clone(), config.learning));

        let (recorder, recorder_handle) =
            OutcomeRecorder::spawn(store.clone(), config.recorder, shutdown_rx);

        let dispatcher = Arc::new(Dispatcher::new(
            config.dispatcher,
            queue.clone(),
            budget.clone(),
            adapters,
            recorder,
            learning.clone(),
            store.clone(),
        ));

        Self {
            queue,
            budget,
            dispatcher,
            learning,
            store,
            channels,
            shutdown_tx,
            tasks: Mutex::new(vec![recorder_handle]),
        }
    }

    /// Restore persisted budget state and start the scheduling loops
    pub async fn start(&self) {
        let now = Utc::now().timestamp();
        for channel in self.budget.configured_channels() {
            match self.store.load_budget(&channel).await {
                Ok(Some(windows)) => self.budget.restore(&channel, &windows, now).await,
                Ok(None) => {}
                Err(e) => warn!("Could not load budget state for {channel}: {e}"),
            }
        }

        let mut tasks = self.tasks.lock().await;
        tasks.push(tokio::spawn(
            self.dispatcher.clone().run(self.shutdown_tx.subscribe()),
        ));
        tasks.push(tokio::spawn(
            self.learning.clone().run(self.shutdown_tx.subscribe()),
        ));
        info!("Herald service started ({} channels)", self.channels.len());
    }

    /// Producer surface: queue one action for dispatch. Returns its id.
    pub async fn enqueue(&self, request: ActionRequest) -> Result<String, EnqueueError> {
        if !self.channels.contains(&request.channel) {
            return Err(EnqueueError::UnknownChannel(request.channel));
        }
        if request.payload.is_null() {
            return Err(EnqueueError::EmptyPayload);
        }

        let mut action = Action::new(&request.channel, request.kind, request.payload)
            .with_priority(request.priority);
        if let Some(not_before) = request.not_before {
            action = action.with_not_before(not_before);
        }
        let id = action.id.clone();

        self.queue.lock().await.enqueue(action);
        Ok(id)
    }

    /// Withdraw a queued action. Returns false once it is in flight or done.
    pub async fn cancel(&self, id: &str) -> bool {
        self.queue.lock().await.remove(id).is_some()
    }

    /// Operator surface: queue depth, budget headroom, dead letters, counters
    pub async fn status(&self) -> StatusReport {
        let now = Utc::now().timestamp();
        let (queue_depth, queue_by_channel) = {
            let queue = self.queue.lock().await;
            (queue.len(), queue.depth_by_channel())
        };
        let stats = self.dispatcher.stats();

        StatusReport {
            queue_depth,
            queue_by_channel,
            in_flight: stats.in_flight,
            budgets: self.budget.usage(now).await,
            dead_letters: self.dispatcher.dead_letters().await,
            succeeded: stats.succeeded,
            retried: stats.retried,
            dead_lettered: stats.dead_lettered,
            outcomes_dropped: stats.outcomes_dropped,
        }
    }

    /// Drop all dead letters; returns how many were purged
    pub async fn purge_dead_letters(&self) -> usize {
        self.dispatcher.purge_dead_letters().await
    }

    /// Clear a channel's budget counters; returns false for unknown channels
    pub async fn reset_budget(&self, channel: &str) -> bool {
        let now = Utc::now().timestamp();
        if !self.budget.reset(channel, now).await {
            return false;
        }
        if let Some(snapshot) = self.budget.snapshot(channel, now).await {
            if let Err(e) = self.store.save_budget(channel, &snapshot).await {
                warn!("Could not persist budget reset for {channel}: {e}");
            }
        }
        true
    }

    /// Stop all loops and wait for in-flight work to drain
    pub async fn shutdown(&self) {
        info!("Herald service shutting down");
        let _ = self.shutdown_tx.send(true);

        let handles: Vec<JoinHandle<()>> = self.tasks.lock().await.drain(..).collect();
        for result in futures_util::future::join_all(handles).await {
            if let Err(e) = result {
                warn!("Background task ended abnormally: {e}");
            }
        }
        info!("Herald service stopped");
    }
}

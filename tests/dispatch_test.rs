//! Dispatcher State Machine Integration Tests
//!
//! Drives single admission/dispatch cycles against scripted adapters so
//! every transition is deterministic: no background loop, no wall-clock
//! races beyond the outcome writer's small flush delay.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use herald::{
    Action, ActionQueue, BudgetTracker, ChannelAdapter, ChannelError, Dispatcher,
    DispatcherConfig, LearningConfig, LearningEngine, MemoryStore, OutcomeRecorder, OutcomeStore,
    RecorderConfig, WindowLimit,
};
use serde_json::json;
use tokio::sync::{watch, Mutex};

/// Adapter that replays a scripted sequence of results, then succeeds
struct ScriptedAdapter {
    name: String,
    script: Mutex<Vec<Result<(), ChannelError>>>,
}

impl ScriptedAdapter {
    fn new(name: &str, script: Vec<Result<(), ChannelError>>) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            script: Mutex::new(script),
        })
    }
}

#[async_trait]
impl ChannelAdapter for ScriptedAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&self, _action: &Action) -> Result<(), ChannelError> {
        let mut script = self.script.lock().await;
        if script.is_empty() {
            Ok(())
        } else {
            script.remove(0)
        }
    }
}

/// Adapter that never answers within any reasonable deadline
struct StalledAdapter {
    name: String,
}

#[async_trait]
impl ChannelAdapter for StalledAdapter {
    fn name(&self) -> &str {
        &self.name
    }

    async fn perform(&self, _action: &Action) -> Result<(), ChannelError> {
        tokio::time::sleep(Duration::from_secs(60)).await;
        Ok(())
    }
}

struct Harness {
    queue: Arc<Mutex<ActionQueue>>,
    dispatcher: Arc<Dispatcher>,
    store: Arc<MemoryStore>,
    _shutdown_tx: watch::Sender<bool>,
}

fn fast_config() -> DispatcherConfig {
    DispatcherConfig {
        backoff_base: Duration::from_secs(0),
        call_timeout: Duration::from_secs(5),
        ..Default::default()
    }
}

fn harness(
    limits: Vec<(&str, Vec<WindowLimit>)>,
    adapters: Vec<Arc<dyn ChannelAdapter>>,
    config: DispatcherConfig,
) -> Harness {
    let store = Arc::new(MemoryStore::new());
    let store_dyn: Arc<dyn OutcomeStore> = store.clone();
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (recorder, _writer) =
        OutcomeRecorder::spawn(store_dyn.clone(), RecorderConfig::default(), shutdown_rx);

    let queue = Arc::new(Mutex::new(ActionQueue::new()));
    let budget = Arc::new(BudgetTracker::new(
        limits
            .into_iter()
            .map(|(channel, windows)| (channel.to_string(), windows))
            .collect::<HashMap<_, _>>(),
    ));
    let learning = Arc::new(LearningEngine::new(store_dyn.clone(), LearningConfig::default()));
    let dispatcher = Arc::new(Dispatcher::new(
        config,
        queue.clone(),
        budget,
        adapters,
        recorder,
        learning,
        store_dyn,
    ));

    Harness {
        queue,
        dispatcher,
        store,
        _shutdown_tx: shutdown_tx,
    }
}

fn ready_action(channel: &str) -> Action {
    Action::publish(channel, json!({"text": "scheduled post"})).with_not_before(0)
}

async fn flush_outcomes() {
    tokio::time::sleep(Duration::from_millis(100)).await;
}

#[tokio::test]
async fn test_success_path_records_outcome() {
    let h = harness(
        vec![("twitter", vec![WindowLimit::hourly(5)])],
        vec![ScriptedAdapter::new("twitter", vec![])],
        fast_config(),
    );
    let now = chrono::Utc::now().timestamp();

    h.queue.lock().await.enqueue(ready_action("twitter"));
    let admitted = h.dispatcher.poll_once(now).await.expect("action admitted");
    h.dispatcher.execute(admitted).await;

    assert_eq!(h.dispatcher.stats().succeeded, 1);
    assert!(h.queue.lock().await.is_empty());
    assert!(h.dispatcher.dead_letters().await.is_empty());

    flush_outcomes().await;
    let outcomes = h.store.read_outcomes(0, i64::MAX).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert!(outcomes[0].succeeded);
    assert!(outcomes[0].error_kind.is_none());
}

#[tokio::test]
async fn test_budget_caps_dispatches_and_defers_the_rest() {
    let h = harness(
        vec![("twitter", vec![WindowLimit::hourly(5)])],
        vec![ScriptedAdapter::new("twitter", vec![])],
        fast_config(),
    );
    let now = chrono::Utc::now().timestamp();

    let mut ids = Vec::new();
    for _ in 0..7 {
        let action = ready_action("twitter");
        ids.push(action.id.clone());
        h.queue.lock().await.enqueue(action);
    }

    // exactly five admissions fit the hourly window
    for _ in 0..5 {
        let admitted = h.dispatcher.poll_once(now).await.expect("within budget");
        h.dispatcher.execute(admitted).await;
    }

    // the remaining two are denied and pushed to the next window start
    assert!(h.dispatcher.poll_once(now).await.is_none());
    assert!(h.dispatcher.poll_once(now).await.is_none());

    assert_eq!(h.dispatcher.stats().succeeded, 5);
    let queue = h.queue.lock().await;
    assert_eq!(queue.len(), 2);

    let window_reset = now - now.rem_euclid(3_600) + 3_600;
    let deferred: Vec<_> = ids.iter().filter_map(|id| queue.get(id)).collect();
    assert_eq!(deferred.len(), 2);
    for action in deferred {
        assert_eq!(action.not_before, window_reset);
        assert_eq!(action.attempt_count, 0);
    }
}

#[tokio::test]
async fn test_permanent_failure_dead_letters_immediately() {
    let h = harness(
        vec![("twitter", vec![WindowLimit::hourly(5)])],
        vec![ScriptedAdapter::new(
            "twitter",
            vec![Err(ChannelError::AuthFailed("token expired".into()))],
        )],
        fast_config(),
    );
    let now = chrono::Utc::now().timestamp();

    h.queue.lock().await.enqueue(ready_action("twitter"));
    let admitted = h.dispatcher.poll_once(now).await.unwrap();
    h.dispatcher.execute(admitted).await;

    let letters = h.dispatcher.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 1);
    assert!(letters[0].reason.contains("authentication failed"));

    // no retry was scheduled
    assert!(h.queue.lock().await.is_empty());
    assert_eq!(h.dispatcher.stats().retried, 0);
    assert_eq!(h.dispatcher.stats().dead_lettered, 1);

    flush_outcomes().await;
    let outcomes = h.store.read_outcomes(0, i64::MAX).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].error_kind.as_deref(), Some("auth_failed"));
}

#[tokio::test]
async fn test_transient_failure_retries_then_succeeds() {
    let h = harness(
        vec![("mastodon", vec![WindowLimit::hourly(10)])],
        vec![ScriptedAdapter::new(
            "mastodon",
            vec![Err(ChannelError::Server("502 bad gateway".into()))],
        )],
        fast_config(),
    );
    let now = chrono::Utc::now().timestamp();

    h.queue.lock().await.enqueue(ready_action("mastodon"));

    // first attempt fails and reschedules
    let admitted = h.dispatcher.poll_once(now).await.unwrap();
    h.dispatcher.execute(admitted).await;
    assert_eq!(h.dispatcher.stats().retried, 1);
    assert_eq!(h.queue.lock().await.len(), 1);

    // second attempt succeeds (zero base backoff keeps it ready)
    let later = chrono::Utc::now().timestamp() + 1;
    let admitted = h.dispatcher.poll_once(later).await.expect("retry is ready");
    assert_eq!(admitted.action.attempt_count, 1);
    h.dispatcher.execute(admitted).await;

    assert_eq!(h.dispatcher.stats().succeeded, 1);
    assert!(h.queue.lock().await.is_empty());
    assert!(h.dispatcher.dead_letters().await.is_empty());

    flush_outcomes().await;
    let outcomes = h.store.read_outcomes(0, i64::MAX).await.unwrap();
    assert_eq!(outcomes.len(), 2);
    assert!(!outcomes[0].succeeded);
    assert!(outcomes[1].succeeded);
}

#[tokio::test]
async fn test_exhausted_retries_dead_letter_for_good() {
    let config = DispatcherConfig {
        max_attempts: 3,
        ..fast_config()
    };
    let h = harness(
        // no limits configured: admission is budget-free for this channel
        vec![],
        vec![ScriptedAdapter::new(
            "discord",
            vec![
                Err(ChannelError::Timeout),
                Err(ChannelError::Timeout),
                Err(ChannelError::Timeout),
            ],
        )],
        config,
    );

    h.queue.lock().await.enqueue(ready_action("discord"));

    for attempt in 1..=3 {
        let now = chrono::Utc::now().timestamp() + attempt;
        let admitted = h
            .dispatcher
            .poll_once(now)
            .await
            .expect("still retryable or final attempt");
        h.dispatcher.execute(admitted).await;
    }

    let letters = h.dispatcher.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert_eq!(letters[0].attempts, 3);
    assert!(h.queue.lock().await.is_empty());
    assert_eq!(h.dispatcher.stats().retried, 2);

    // dead letters stay inspectable until purged
    assert_eq!(h.dispatcher.purge_dead_letters().await, 1);
    assert!(h.dispatcher.dead_letters().await.is_empty());
}

#[tokio::test]
async fn test_older_action_beats_newer_high_priority_on_same_channel() {
    let h = harness(
        vec![("twitter", vec![WindowLimit::hourly(1)])],
        vec![ScriptedAdapter::new("twitter", vec![])],
        fast_config(),
    );
    let now = chrono::Utc::now().timestamp();

    let mut waiting = ready_action("twitter");
    waiting.created_at = now - 600;
    let waiting_id = waiting.id.clone();

    let mut latecomer = ready_action("twitter").with_priority(9);
    latecomer.created_at = now;

    h.queue.lock().await.enqueue(latecomer);
    h.queue.lock().await.enqueue(waiting);

    // budget allows a single dispatch; the longest-waiting action wins even
    // though the newer one outranks it
    let admitted = h.dispatcher.poll_once(now).await.unwrap();
    assert_eq!(admitted.action.id, waiting_id);
    h.dispatcher.execute(admitted).await;

    assert!(h.dispatcher.poll_once(now).await.is_none());
    assert_eq!(h.queue.lock().await.len(), 1);
}

#[tokio::test]
async fn test_adapter_deadline_counts_as_transient() {
    let config = DispatcherConfig {
        call_timeout: Duration::from_millis(50),
        max_attempts: 1,
        ..fast_config()
    };
    let h = harness(
        vec![],
        vec![Arc::new(StalledAdapter {
            name: "twitter".into(),
        })],
        config,
    );
    let now = chrono::Utc::now().timestamp();

    h.queue.lock().await.enqueue(ready_action("twitter"));
    let admitted = h.dispatcher.poll_once(now).await.unwrap();
    h.dispatcher.execute(admitted).await;

    // single-attempt budget turns the timeout into a dead letter
    let letters = h.dispatcher.dead_letters().await;
    assert_eq!(letters.len(), 1);
    assert!(letters[0].reason.contains("timed out"));

    flush_outcomes().await;
    let outcomes = h.store.read_outcomes(0, i64::MAX).await.unwrap();
    assert_eq!(outcomes.len(), 1);
    assert_eq!(outcomes[0].error_kind.as_deref(), Some("timeout"));
}

#[tokio::test]
async fn test_per_channel_concurrency_cap_defers_simultaneous_work() {
    let config = DispatcherConfig {
        max_concurrent_per_channel: Some(1),
        ..fast_config()
    };
    let h = harness(
        vec![("twitter", vec![WindowLimit::hourly(10)])],
        vec![ScriptedAdapter::new("twitter", vec![])],
        config,
    );
    let now = chrono::Utc::now().timestamp();

    let first = ready_action("twitter");
    let second = ready_action("twitter");
    let second_id = second.id.clone();
    h.queue.lock().await.enqueue(first);
    h.queue.lock().await.enqueue(second);

    // the first admission holds the channel's only slot
    let admitted = h.dispatcher.poll_once(now).await.expect("slot available");

    // the second is briefly deferred rather than dispatched concurrently
    assert!(h.dispatcher.poll_once(now).await.is_none());
    {
        let queue = h.queue.lock().await;
        assert_eq!(queue.get(&second_id).unwrap().not_before, now + 1);
    }

    // once the first completes, the slot frees up
    h.dispatcher.execute(admitted).await;
    let admitted = h
        .dispatcher
        .poll_once(now + 1)
        .await
        .expect("slot released");
    assert_eq!(admitted.action.id, second_id);
    h.dispatcher.execute(admitted).await;

    assert_eq!(h.dispatcher.stats().succeeded, 2);
}

//! Herald
//!
//! Always-on autonomous action agent: producers enqueue actions (publish,
//! reply, charge) for external channels; the scheduler decides what runs
//! when, under per-channel budgets and a bounded worker pool, and learns
//! better dispatch times from the outcomes it records.
//!
//! # Architecture
//!
//! ```text
//! Producers ──► enqueue ──► Action Queue ──► Dispatcher ──► Channel Adapters
//!                               ▲               │  │
//!                 weight bonus  │               │  └── Outcome Recorder ──► Store
//!                               │               │                            │
//!                        Learning Engine ◄──────┴─── budget checks           │
//!                               └────────────── outcome history ◄────────────┘
//! ```
//!
//! Rate budgets bound how many actions each channel gets per hour and day;
//! the concurrency caps bound how many run at once; transient failures
//! retry with jittered exponential backoff; permanent failures land in the
//! dead-letter list for operators.

pub mod action;
pub mod budget;
pub mod channel;
pub mod config;
pub mod dispatch;
pub mod learning;
pub mod queue;
pub mod recorder;
pub mod service;
pub mod store;

pub use action::{Action, ActionKind, ActionRequest};
pub use budget::{Admission, BudgetStatus, BudgetTracker, Granularity, WindowLimit};
pub use channel::{ChannelAdapter, ChannelError, LogAdapter};
pub use config::Config;
pub use dispatch::{DeadLetter, Dispatcher, DispatcherConfig};
pub use learning::{LearningConfig, LearningEngine, TimeSlot, WeightTable};
pub use queue::ActionQueue;
pub use recorder::{Outcome, OutcomeRecorder, RecorderConfig};
pub use service::{EnqueueError, HeraldService, StatusReport};
pub use store::{MemoryStore, OutcomeStore, RedisStore, StoreError};

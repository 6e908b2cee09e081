//! Action Queue
//!
//! Priority-aware backlog of pending actions. A time-ordered index keeps
//! readiness checks proportional to the number of ready actions, not the
//! backlog. Effective priority is computed lazily at peek time from the
//! learned weight table, so weight changes take effect without re-sorting
//! anything.

use std::collections::{BTreeSet, HashMap};

use tracing::debug;

use crate::action::Action;
use crate::learning::{TimeSlot, WeightTable};

/// Ordered backlog with readiness and priority indices.
///
/// Selection order: effective priority descending, then `not_before`
/// ascending, then `created_at` ascending. Within the winning channel the
/// oldest ready action goes first regardless of priority, so a late
/// high-priority action cannot starve one that was already waiting when
/// budget is scarce.
#[derive(Default)]
pub struct ActionQueue {
    actions: HashMap<String, Action>,
    /// (not_before, created_at, id): iteration in this order visits ready
    /// entries first and stops at the first future one
    time_index: BTreeSet<(i64, i64, String)>,
}

impl ActionQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.actions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.actions.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Action> {
        self.actions.get(id)
    }

    /// Backlog size per channel, for the operator surface
    pub fn depth_by_channel(&self) -> HashMap<String, usize> {
        let mut depths: HashMap<String, usize> = HashMap::new();
        for action in self.actions.values() {
            *depths.entry(action.channel.clone()).or_default() += 1;
        }
        depths
    }

    /// Add an action to the backlog
    pub fn enqueue(&mut self, action: Action) {
        debug!(
            "Queued {} {} for {} (priority {})",
            action.kind.as_str(),
            action.id,
            action.channel,
            action.priority
        );
        self.time_index
            .insert((action.not_before, action.created_at, action.id.clone()));
        self.actions.insert(action.id.clone(), action);
    }

    /// Withdraw an action. Only possible while it is queued; in-flight
    /// actions are past the point of cancellation.
    pub fn remove(&mut self, id: &str) -> Option<Action> {
        let action = self.actions.remove(id)?;
        self.time_index
            .remove(&(action.not_before, action.created_at, action.id.clone()));
        Some(action)
    }

    /// Move an action's earliest dispatch time
    pub fn reschedule(&mut self, id: &str, not_before: i64) -> bool {
        let Some(action) = self.actions.get_mut(id) else {
            return false;
        };
        self.time_index
            .remove(&(action.not_before, action.created_at, action.id.clone()));
        action.not_before = not_before;
        self.time_index
            .insert((action.not_before, action.created_at, action.id.clone()));
        true
    }

    /// Next action to dispatch at `now`, or None when nothing is ready.
    ///
    /// Scores ready actions as `base priority + learned bonus` for the
    /// action's channel in the current time slot, then applies the
    /// same-channel oldest-first override.
    pub fn peek_ready(&self, now: i64, weights: &WeightTable) -> Option<&Action> {
        let slot = TimeSlot::from_timestamp(now);

        let mut best: Option<(&Action, f64)> = None;
        for (not_before, _, id) in &self.time_index {
            if *not_before > now {
                break;
            }
            let Some(action) = self.actions.get(id) else {
                continue;
            };
            let score = action.priority as f64 + weights.bonus(&action.channel, slot);
            // iteration order already favors earlier (not_before, created_at)
            // among equal scores, so only a strictly better score replaces
            let replace = match best {
                None => true,
                Some((_, best_score)) => score > best_score,
            };
            if replace {
                best = Some((action, score));
            }
        }
        let chosen = best?.0;

        // same-channel fairness: dispatch the longest-waiting ready action
        // on the chosen channel, whatever its own priority
        let mut oldest: Option<&Action> = None;
        for (not_before, _, id) in &self.time_index {
            if *not_before > now {
                break;
            }
            let Some(action) = self.actions.get(id) else {
                continue;
            };
            if action.channel != chosen.channel {
                continue;
            }
            let replace = match oldest {
                None => true,
                Some(current) => (action.created_at, &action.id) < (current.created_at, &current.id),
            };
            if replace {
                oldest = Some(action);
            }
        }
        oldest
    }
}

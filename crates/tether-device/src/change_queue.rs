//! # State Change Journal
//!
//! A bounded FIFO of state deltas waiting to be uploaded. The cloud push
//! loop drains it atomically; overload folds the oldest entries together
//! so recent changes stay fresh while memory stays bounded.
//!
//! ## Merging Rules
//! ```text
//! ┌─────────────────────────────────────────────────────────────────────────┐
//! │                      Change Queue Behavior                              │
//! │                                                                         │
//! │  SAME TIMESTAMP                                                        │
//! │  ──────────────                                                        │
//! │  notify(t, {x:1})  notify(t, {y:2})  notify(t, {x:3})                  │
//! │      └──────────────────┬────────────────┘                              │
//! │                 one entry (t, {x:3, y:2})                               │
//! │                                                                         │
//! │  CAPACITY PRESSURE (max = 2)                                           │
//! │  ───────────────────────────                                           │
//! │  [(t0, {a:1, b:2}), (t1, {a:3, c:4})] + notify(t2, {d:5})              │
//! │      └─ oldest two fold: newer values win, timestamp = later ─┘         │
//! │  [(t1, {a:3, b:2, c:4}), (t2, {d:5})]                                   │
//! │                                                                         │
//! │  The update id counts every notify call and never goes backwards,      │
//! │  not even when the queue is drained.                                   │
//! └─────────────────────────────────────────────────────────────────────────┘
//! ```

use std::collections::{BTreeMap, VecDeque};

use chrono::{DateTime, Utc};
use tether_core::PropValue;

/// One recorded delta: the properties that changed at `timestamp`,
/// keyed by qualified name.
#[derive(Debug, Clone, PartialEq)]
pub struct StateChange {
    pub timestamp: DateTime<Utc>,
    pub changed: BTreeMap<String, PropValue>,
}

/// One-shot observer fired with the update id at the next drain, or
/// immediately when the queue is already empty.
pub type StateUpdatedCallback = Box<dyn FnOnce(u64) + Send>;

// =============================================================================
// StateChangeQueue
// =============================================================================

/// Bounded journal of [`StateChange`] entries.
///
/// Not internally synchronized; the owning [`StateManager`] serializes
/// access. Callbacks fire inline and must not call back into the owner.
///
/// [`StateManager`]: crate::state_manager::StateManager
pub struct StateChangeQueue {
    max_size: usize,
    changes: VecDeque<StateChange>,
    last_update_id: u64,
    pending_callbacks: Vec<StateUpdatedCallback>,
}

impl StateChangeQueue {
    pub fn new(max_size: usize) -> Self {
        StateChangeQueue {
            max_size: max_size.max(1),
            changes: VecDeque::new(),
            last_update_id: 0,
            pending_callbacks: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    /// Monotonically non-decreasing counter of recorded updates. Does
    /// not move on drain.
    pub fn last_state_change_id(&self) -> u64 {
        self.last_update_id
    }

    /// Records a delta. An entry adjacent to another with the same
    /// timestamp is merged into it, newer values overwriting older for
    /// the same key. When the queue would exceed its capacity, the two
    /// oldest entries are folded together first.
    pub fn notify_properties_updated(
        &mut self,
        timestamp: DateTime<Utc>,
        changed: BTreeMap<String, PropValue>,
    ) {
        self.last_update_id += 1;

        if let Some(last) = self.changes.back_mut() {
            if last.timestamp == timestamp {
                last.changed.extend(changed);
                return;
            }
        }
        self.changes.push_back(StateChange { timestamp, changed });
        self.enforce_capacity();
    }

    /// Drains the queue and returns the recorded changes in order.
    /// Observers registered while the queue was non-empty fire now with
    /// the current update id.
    pub fn get_and_clear_recorded_state_changes(&mut self) -> Vec<StateChange> {
        let changes = self.changes.drain(..).collect();
        let id = self.last_update_id;
        for callback in self.pending_callbacks.drain(..) {
            callback(id);
        }
        changes
    }

    /// Registers a one-shot update observer. Fires immediately when the
    /// queue has nothing pending, otherwise at the next drain.
    pub fn add_on_state_updated_callback(&mut self, callback: StateUpdatedCallback) {
        if self.changes.is_empty() {
            callback(self.last_update_id);
        } else {
            self.pending_callbacks.push(callback);
        }
    }

    /// Puts previously drained changes back at the front of the queue,
    /// oldest first, after a failed upload. The update id is untouched;
    /// these entries were already counted.
    pub fn restore(&mut self, changes: Vec<StateChange>) {
        for change in changes.into_iter().rev() {
            self.changes.push_front(change);
        }
        self.enforce_capacity();
    }

    fn enforce_capacity(&mut self) {
        while self.changes.len() > self.max_size {
            // Fold the oldest entry into the one after it. The newer
            // entry's values win on key collision and its timestamp is
            // kept, so the queue ages from the front.
            let Some(oldest) = self.changes.pop_front() else {
                return;
            };
            if let Some(next) = self.changes.front_mut() {
                for (key, value) in oldest.changed {
                    next.changed.entry(key).or_insert(value);
                }
            }
        }
    }
}

// =============================================================================
// Unit Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tether_core::PropValue;

    fn at(seconds: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + seconds, 0).unwrap()
    }

    fn delta(pairs: &[(&str, i64)]) -> BTreeMap<String, PropValue> {
        pairs
            .iter()
            .map(|(name, value)| (name.to_string(), PropValue::Integer(*value)))
            .collect()
    }

    #[test]
    fn test_empty() {
        let mut queue = StateChangeQueue::new(100);
        assert!(queue.is_empty());
        assert_eq!(queue.last_state_change_id(), 0);
        assert!(queue.get_and_clear_recorded_state_changes().is_empty());
    }

    #[test]
    fn test_update_one() {
        let mut queue = StateChangeQueue::new(100);
        queue.notify_properties_updated(at(0), delta(&[("prop.name", 23)]));
        assert!(!queue.is_empty());
        assert_eq!(queue.last_state_change_id(), 1);

        let changes = queue.get_and_clear_recorded_state_changes();
        assert_eq!(queue.last_state_change_id(), 1);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].timestamp, at(0));
        assert_eq!(changes[0].changed, delta(&[("prop.name", 23)]));
        assert!(queue.is_empty());
        assert!(queue.get_and_clear_recorded_state_changes().is_empty());
    }

    #[test]
    fn test_update_many_keeps_order() {
        let mut queue = StateChangeQueue::new(100);
        queue.notify_properties_updated(at(0), delta(&[("prop.name1", 23)]));
        queue.notify_properties_updated(at(1), delta(&[("prop.name1", 17), ("prop.name2", 1)]));

        assert_eq!(queue.last_state_change_id(), 2);
        let changes = queue.get_and_clear_recorded_state_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].timestamp, at(0));
        assert_eq!(changes[1].timestamp, at(1));
        assert_eq!(changes[1].changed.len(), 2);
    }

    #[test]
    fn test_group_by_timestamp() {
        let mut queue = StateChangeQueue::new(100);
        queue.notify_properties_updated(at(0), delta(&[("prop.name1", 1)]));
        queue.notify_properties_updated(at(0), delta(&[("prop.name2", 2)]));
        queue.notify_properties_updated(at(0), delta(&[("prop.name1", 3)]));
        queue.notify_properties_updated(at(60), delta(&[("prop.name1", 4)]));

        assert_eq!(queue.last_state_change_id(), 4);
        let changes = queue.get_and_clear_recorded_state_changes();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].timestamp, at(0));
        assert_eq!(
            changes[0].changed,
            delta(&[("prop.name1", 3), ("prop.name2", 2)])
        );
        assert_eq!(changes[1].timestamp, at(60));
        assert_eq!(changes[1].changed, delta(&[("prop.name1", 4)]));
    }

    #[test]
    fn test_max_queue_size_folds_oldest_two() {
        let mut queue = StateChangeQueue::new(2);
        queue.notify_properties_updated(at(0), delta(&[("prop.name1", 1), ("prop.name2", 2)]));
        queue.notify_properties_updated(at(60), delta(&[("prop.name1", 3), ("prop.name3", 4)]));
        queue.notify_properties_updated(at(180), delta(&[("prop.name10", 10), ("prop.name11", 11)]));

        assert_eq!(queue.last_state_change_id(), 3);
        let changes = queue.get_and_clear_recorded_state_changes();
        assert_eq!(changes.len(), 2);

        // Oldest two merged: newer values win, timestamp is the later one.
        assert_eq!(changes[0].timestamp, at(60));
        assert_eq!(
            changes[0].changed,
            delta(&[("prop.name1", 3), ("prop.name2", 2), ("prop.name3", 4)])
        );
        assert_eq!(changes[1].timestamp, at(180));
        assert_eq!(
            changes[1].changed,
            delta(&[("prop.name10", 10), ("prop.name11", 11)])
        );
    }

    #[test]
    fn test_bound_preserves_key_union_and_latest_values() {
        let mut queue = StateChangeQueue::new(3);
        for i in 0..10 {
            queue.notify_properties_updated(at(i * 60), delta(&[("prop.rolling", i), ("prop.keep", 0)]));
        }
        let changes = queue.get_and_clear_recorded_state_changes();
        assert_eq!(changes.len(), 3);

        let winner = changes
            .iter()
            .rev()
            .find_map(|c| c.changed.get("prop.rolling"))
            .unwrap();
        assert_eq!(winner, &PropValue::Integer(9));
        assert!(changes
            .iter()
            .any(|c| c.changed.contains_key("prop.keep")));
    }

    #[test]
    fn test_update_id_is_monotonic_across_drains() {
        let mut queue = StateChangeQueue::new(2);
        let mut previous = queue.last_state_change_id();
        for i in 0..7 {
            queue.notify_properties_updated(at(i), delta(&[("prop.x", i)]));
            assert!(queue.last_state_change_id() >= previous);
            previous = queue.last_state_change_id();
            if i % 3 == 0 {
                queue.get_and_clear_recorded_state_changes();
                assert_eq!(queue.last_state_change_id(), previous);
            }
        }
        assert_eq!(queue.last_state_change_id(), 7);
    }

    #[test]
    fn test_immediate_state_change_notification() {
        let mut queue = StateChangeQueue::new(100);
        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        queue.add_on_state_updated_callback(Box::new(move |id| {
            assert_eq!(id, 0);
            flag.store(true, Ordering::SeqCst);
        }));
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_delayed_state_change_notification() {
        let mut queue = StateChangeQueue::new(100);
        queue.notify_properties_updated(at(0), delta(&[("prop.name1", 1)]));

        let called = Arc::new(AtomicBool::new(false));
        let flag = called.clone();
        queue.add_on_state_updated_callback(Box::new(move |id| {
            assert_eq!(id, 1);
            flag.store(true, Ordering::SeqCst);
        }));
        assert!(!called.load(Ordering::SeqCst));

        queue.get_and_clear_recorded_state_changes();
        assert!(called.load(Ordering::SeqCst));
    }

    #[test]
    fn test_restore_requeues_without_counting() {
        let mut queue = StateChangeQueue::new(4);
        queue.notify_properties_updated(at(0), delta(&[("prop.a", 1)]));
        queue.notify_properties_updated(at(60), delta(&[("prop.b", 2)]));
        let drained = queue.get_and_clear_recorded_state_changes();
        assert_eq!(queue.last_state_change_id(), 2);

        queue.notify_properties_updated(at(120), delta(&[("prop.c", 3)]));
        queue.restore(drained);
        assert_eq!(queue.last_state_change_id(), 3);

        let changes = queue.get_and_clear_recorded_state_changes();
        let timestamps: Vec<_> = changes.iter().map(|c| c.timestamp).collect();
        assert_eq!(timestamps, vec![at(0), at(60), at(120)]);
    }
}

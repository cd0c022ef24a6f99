//! Timeout wheels and single timers
//!
//! Wheels are keyed by stable ids and resolved through the cache when they
//! fire, so a story removed in the meantime simply produces nothing.

use std::collections::{BTreeSet, HashMap};
use std::hash::Hash;

use chrono::{DateTime, Utc};

use ephemera_core::{StoryFullId, StoryGlobalId};

/// Deadlines keyed by id; setting a key again replaces its deadline
#[derive(Debug)]
pub struct MultiTimeout<K> {
    by_deadline: BTreeSet<(DateTime<Utc>, K)>,
    deadlines: HashMap<K, DateTime<Utc>>,
}

impl<K> Default for MultiTimeout<K> {
    fn default() -> Self {
        Self {
            by_deadline: BTreeSet::new(),
            deadlines: HashMap::new(),
        }
    }
}

impl<K: Copy + Ord + Hash> MultiTimeout<K> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&mut self, key: K, at: DateTime<Utc>) {
        if let Some(previous) = self.deadlines.insert(key, at) {
            self.by_deadline.remove(&(previous, key));
        }
        self.by_deadline.insert((at, key));
    }

    /// Set only if no earlier deadline is pending
    pub fn set_if_earlier(&mut self, key: K, at: DateTime<Utc>) {
        match self.deadlines.get(&key) {
            Some(current) if *current <= at => {}
            _ => self.set(key, at),
        }
    }

    pub fn cancel(&mut self, key: K) -> bool {
        match self.deadlines.remove(&key) {
            Some(at) => {
                self.by_deadline.remove(&(at, key));
                true
            }
            None => false,
        }
    }

    pub fn deadline(&self, key: K) -> Option<DateTime<Utc>> {
        self.deadlines.get(&key).copied()
    }

    pub fn has_timeout(&self, key: K) -> bool {
        self.deadlines.contains_key(&key)
    }

    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        self.by_deadline.first().map(|(at, _)| *at)
    }

    /// Remove and return every key due at `now`, earliest first
    pub fn pop_due(&mut self, now: DateTime<Utc>) -> Vec<K> {
        let mut due = Vec::new();
        while let Some(&(at, key)) = self.by_deadline.first() {
            if at > now {
                break;
            }
            self.by_deadline.pop_first();
            self.deadlines.remove(&key);
            due.push(key);
        }
        due
    }

    pub fn len(&self) -> usize {
        self.deadlines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deadlines.is_empty()
    }

    pub fn clear(&mut self) {
        self.by_deadline.clear();
        self.deadlines.clear();
    }
}

/// A timer that fired
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerEvent {
    Reload(StoryGlobalId),
    Expire(StoryGlobalId),
    PollViewers(StoryGlobalId),
    /// Reload of a story the cache may not hold yet
    RetryReload(StoryFullId),
    FlushViews,
    RefreshInteractionInfo,
    RetrySend,
    CollectGarbage,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
enum SingleTimer {
    FlushViews,
    RefreshInteractionInfo,
    RetrySend,
    CollectGarbage,
}

impl SingleTimer {
    fn event(self) -> TimerEvent {
        match self {
            SingleTimer::FlushViews => TimerEvent::FlushViews,
            SingleTimer::RefreshInteractionInfo => TimerEvent::RefreshInteractionInfo,
            SingleTimer::RetrySend => TimerEvent::RetrySend,
            SingleTimer::CollectGarbage => TimerEvent::CollectGarbage,
        }
    }
}

/// All engine timers
#[derive(Debug, Default)]
pub struct Scheduler {
    pub reload: MultiTimeout<StoryGlobalId>,
    pub expire: MultiTimeout<StoryGlobalId>,
    pub viewers: MultiTimeout<StoryGlobalId>,
    pub reload_retry: MultiTimeout<StoryFullId>,
    singles: MultiTimeout<SingleTimer>,
}

impl Scheduler {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn schedule_view_flush(&mut self, at: DateTime<Utc>) {
        self.singles.set_if_earlier(SingleTimer::FlushViews, at);
    }

    pub fn has_view_flush(&self) -> bool {
        self.singles.has_timeout(SingleTimer::FlushViews)
    }

    pub fn schedule_interaction_refresh(&mut self, at: DateTime<Utc>) {
        self.singles.set_if_earlier(SingleTimer::RefreshInteractionInfo, at);
    }

    pub fn schedule_send_retry(&mut self, at: DateTime<Utc>) {
        self.singles.set(SingleTimer::RetrySend, at);
    }

    pub fn schedule_gc(&mut self, at: DateTime<Utc>) {
        self.singles.set_if_earlier(SingleTimer::CollectGarbage, at);
    }

    /// Drop every timer that belongs to a story
    pub fn cancel_story(&mut self, global_id: StoryGlobalId) {
        self.reload.cancel(global_id);
        self.expire.cancel(global_id);
        self.viewers.cancel(global_id);
    }

    /// Earliest pending deadline across all timers
    pub fn next_deadline(&self) -> Option<DateTime<Utc>> {
        [
            self.reload.next_deadline(),
            self.expire.next_deadline(),
            self.viewers.next_deadline(),
            self.reload_retry.next_deadline(),
            self.singles.next_deadline(),
        ]
        .into_iter()
        .flatten()
        .min()
    }

    /// Timers due at `now`; each fires once per scheduling
    pub fn due(&mut self, now: DateTime<Utc>) -> Vec<TimerEvent> {
        let mut events = Vec::new();
        events.extend(self.expire.pop_due(now).into_iter().map(TimerEvent::Expire));
        events.extend(self.reload.pop_due(now).into_iter().map(TimerEvent::Reload));
        events.extend(self.reload_retry.pop_due(now).into_iter().map(TimerEvent::RetryReload));
        events.extend(self.viewers.pop_due(now).into_iter().map(TimerEvent::PollViewers));
        events.extend(self.singles.pop_due(now).into_iter().map(SingleTimer::event));
        events
    }

    pub fn clear(&mut self) {
        self.reload.clear();
        self.expire.clear();
        self.viewers.clear();
        self.reload_retry.clear();
        self.singles.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ephemera_core::unix_time;

    #[test]
    fn test_set_replaces_deadline() {
        let mut wheel = MultiTimeout::new();
        wheel.set(StoryGlobalId(1), unix_time(100));
        wheel.set(StoryGlobalId(1), unix_time(50));
        assert_eq!(wheel.len(), 1);
        assert_eq!(wheel.next_deadline(), Some(unix_time(50)));
        assert!(wheel.pop_due(unix_time(49)).is_empty());
        assert_eq!(wheel.pop_due(unix_time(50)), vec![StoryGlobalId(1)]);
        assert!(wheel.is_empty());
    }

    #[test]
    fn test_pop_due_in_deadline_order() {
        let mut wheel = MultiTimeout::new();
        wheel.set(StoryGlobalId(3), unix_time(30));
        wheel.set(StoryGlobalId(1), unix_time(10));
        wheel.set(StoryGlobalId(2), unix_time(20));
        wheel.set(StoryGlobalId(4), unix_time(40));
        assert_eq!(
            wheel.pop_due(unix_time(30)),
            vec![StoryGlobalId(1), StoryGlobalId(2), StoryGlobalId(3)]
        );
        assert_eq!(wheel.next_deadline(), Some(unix_time(40)));
    }

    #[test]
    fn test_cancel_and_set_if_earlier() {
        let mut wheel = MultiTimeout::new();
        wheel.set_if_earlier(StoryGlobalId(1), unix_time(20));
        wheel.set_if_earlier(StoryGlobalId(1), unix_time(30));
        assert_eq!(wheel.deadline(StoryGlobalId(1)), Some(unix_time(20)));
        assert!(wheel.cancel(StoryGlobalId(1)));
        assert!(!wheel.cancel(StoryGlobalId(1)));
        assert_eq!(wheel.next_deadline(), None);
    }

    #[test]
    fn test_scheduler_collects_all_kinds() {
        let mut scheduler = Scheduler::new();
        scheduler.expire.set(StoryGlobalId(1), unix_time(10));
        scheduler.viewers.set(StoryGlobalId(2), unix_time(10));
        scheduler.schedule_view_flush(unix_time(5));
        scheduler.schedule_gc(unix_time(100));
        assert_eq!(scheduler.next_deadline(), Some(unix_time(5)));

        let events = scheduler.due(unix_time(10));
        assert_eq!(
            events,
            vec![
                TimerEvent::Expire(StoryGlobalId(1)),
                TimerEvent::PollViewers(StoryGlobalId(2)),
                TimerEvent::FlushViews,
            ]
        );
        assert!(scheduler.due(unix_time(10)).is_empty());
        assert_eq!(scheduler.next_deadline(), Some(unix_time(100)));
    }

    #[test]
    fn test_cancel_story_clears_wheels() {
        let mut scheduler = Scheduler::new();
        let id = StoryGlobalId(7);
        scheduler.reload.set(id, unix_time(1));
        scheduler.expire.set(id, unix_time(2));
        scheduler.viewers.set(id, unix_time(3));
        scheduler.cancel_story(id);
        assert_eq!(scheduler.next_deadline(), None);
    }
}

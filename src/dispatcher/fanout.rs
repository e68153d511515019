//! Per-group fan-out buffer.
//!
//! Holds the most recent events of the group (for resume) and an index of
//! live sessions keyed by entity id. `publish` is called by the single
//! consumer task. It appends to the ring and then hands the event to every
//! matching session, all under the ring lock, so a resuming subscriber
//! sees each event exactly once: either from the ring or from the live
//! feed, never both.
//!
//! No await happens while the ring lock or an index shard is held.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use dashmap::DashMap;

use super::session::{SessionFilter, SessionShared, SessionStats, Subscription};
use crate::metrics;
use crate::types::{Event, SequenceToken};

/// Outcome of one publish.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PublishOutcome {
    /// Sessions the event was queued for.
    pub delivered: usize,
    /// Sessions that evicted an older event to make room.
    pub evicted: usize,
}

pub struct FanoutBuffer {
    group: String,
    capacity: usize,
    session_capacity: usize,
    recent: Mutex<VecDeque<Arc<Event>>>,
    sessions: DashMap<String, Vec<Arc<SessionShared>>>,
    session_count: AtomicUsize,
}

impl FanoutBuffer {
    pub fn new(group: &str, capacity: usize, session_capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            group: group.to_string(),
            capacity: capacity.max(1),
            session_capacity,
            recent: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 4096))),
            sessions: DashMap::new(),
            session_count: AtomicUsize::new(0),
        })
    }

    fn recent(&self) -> MutexGuard<'_, VecDeque<Arc<Event>>> {
        self.recent.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Append an event and deliver it to every matching session.
    pub fn publish(&self, event: Event) -> PublishOutcome {
        let event = Arc::new(event);
        let mut outcome = PublishOutcome::default();

        let mut recent = self.recent();
        if recent.len() >= self.capacity {
            recent.pop_front();
        }
        recent.push_back(event.clone());

        if let Some(sessions) = self.sessions.get(&event.entity_id) {
            for session in sessions.iter().filter(|s| s.filter.matches(&event)) {
                if session.deliver(event.clone()) {
                    outcome.evicted += 1;
                }
                outcome.delivered += 1;
            }
        }
        drop(recent);

        if outcome.delivered > 0 {
            metrics::record_delivered(&self.group, outcome.delivered as u64);
        }
        if outcome.evicted > 0 {
            metrics::record_dropped(&self.group, outcome.evicted as u64);
        }
        outcome
    }

    /// Open a session for `filter`.
    ///
    /// With `after`, events still in the ring that follow `after` and match
    /// the filter are queued first.
    pub fn subscribe(
        self: &Arc<Self>,
        filter: SessionFilter,
        after: Option<SequenceToken>,
    ) -> Subscription {
        let shared = Arc::new(SessionShared::new(filter, self.session_capacity));

        {
            let recent = self.recent();
            if let Some(after) = after {
                let first = after.next();
                recent
                    .iter()
                    .filter(|e| {
                        e.sequence_token.partition == first.partition
                            && e.sequence_token >= first
                            && shared.filter.matches(e)
                    })
                    .for_each(|e| {
                        shared.deliver(e.clone());
                    });
            }
            self.sessions
                .entry(shared.filter.entity_id.clone())
                .or_default()
                .push(shared.clone());
        }

        let count = self.session_count.fetch_add(1, Ordering::SeqCst) + 1;
        metrics::set_active_sessions(&self.group, count);
        tracing::debug!(
            group = %self.group,
            session_id = %shared.id,
            entity_id = %shared.filter.entity_id,
            item_id = ?shared.filter.item_id,
            "Session opened"
        );

        Subscription::new(shared, Arc::downgrade(self))
    }

    pub(crate) fn unregister(&self, session: &Arc<SessionShared>) {
        let mut removed = false;
        if let Some(mut sessions) = self.sessions.get_mut(&session.filter.entity_id) {
            let before = sessions.len();
            sessions.retain(|s| !Arc::ptr_eq(s, session));
            removed = sessions.len() < before;
        }
        self.sessions
            .remove_if(&session.filter.entity_id, |_, sessions| sessions.is_empty());

        if removed {
            let count = self.session_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
            metrics::set_active_sessions(&self.group, count);
            tracing::debug!(group = %self.group, session_id = %session.id, "Session closed");
        }
    }

    /// Close every session. Their handles observe end-of-stream.
    pub fn close_all(&self) {
        for entry in self.sessions.iter() {
            for session in entry.value() {
                session.close();
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.session_count.load(Ordering::SeqCst)
    }

    /// Events queued across all sessions.
    pub fn queued(&self) -> usize {
        self.sessions
            .iter()
            .map(|e| e.value().iter().map(|s| s.queued()).sum::<usize>())
            .sum()
    }

    pub fn buffered(&self) -> usize {
        self.recent().len()
    }

    pub fn sessions(&self) -> Vec<SessionStats> {
        self.sessions
            .iter()
            .flat_map(|e| e.value().iter().map(|s| s.stats()).collect::<Vec<_>>())
            .collect()
    }
}

impl std::fmt::Debug for FanoutBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FanoutBuffer")
            .field("group", &self.group)
            .field("capacity", &self.capacity)
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use serde_json::json;

    fn event(entity: &str, item: &str, offset: i64) -> Event {
        Event {
            entity_id: entity.to_string(),
            item_id: Some(item.to_string()),
            timestamp: Utc::now(),
            payload: json!({"value": offset}),
            sequence_token: SequenceToken::new(0, offset),
        }
    }

    #[test]
    fn test_publish_only_reaches_matching_entity() {
        let fanout = FanoutBuffer::new("Weld", 16, 16);
        let a = fanout.subscribe(SessionFilter::entity("A42"), None);
        let b = fanout.subscribe(SessionFilter::entity("B17"), None);

        let outcome = fanout.publish(event("A42", "avail", 0));
        assert_eq!(outcome.delivered, 1);
        assert!(a.try_recv().is_some());
        assert!(b.try_recv().is_none());
    }

    #[test]
    fn test_item_filter_applied_at_delivery() {
        let fanout = FanoutBuffer::new("Weld", 16, 16);
        let all = fanout.subscribe(SessionFilter::entity("A42"), None);
        let avail = fanout.subscribe(SessionFilter::item("A42", "avail"), None);

        fanout.publish(event("A42", "avail", 0));
        fanout.publish(event("A42", "temp", 1));

        assert_eq!(all.stats().queued, 2);
        assert_eq!(avail.stats().queued, 1);
        assert_eq!(avail.try_recv().unwrap().item_id.as_deref(), Some("avail"));
    }

    #[test]
    fn test_ring_is_bounded() {
        let fanout = FanoutBuffer::new("Weld", 3, 16);
        for i in 0..10 {
            fanout.publish(event("A42", "x", i));
        }
        assert_eq!(fanout.buffered(), 3);
    }

    #[test]
    fn test_resume_after_token_replays_ring_once() {
        let fanout = FanoutBuffer::new("Weld", 16, 16);
        for i in 0..5 {
            fanout.publish(event("A42", "x", i));
        }
        let sub = fanout.subscribe(SessionFilter::entity("A42"), Some(SequenceToken::new(0, 2)));
        fanout.publish(event("A42", "x", 5));

        let offsets: Vec<_> = std::iter::from_fn(|| sub.try_recv())
            .map(|e| e.sequence_token.offset)
            .collect();
        assert_eq!(offsets, vec![3, 4, 5]);
    }

    #[test]
    fn test_resume_at_head_or_other_partition_replays_nothing() {
        let fanout = FanoutBuffer::new("Weld", 16, 16);
        for i in 0..3 {
            fanout.publish(event("A42", "x", i));
        }
        let at_head = fanout.subscribe(SessionFilter::entity("A42"), Some(SequenceToken::new(0, 2)));
        let elsewhere = fanout.subscribe(SessionFilter::entity("A42"), Some(SequenceToken::new(1, 0)));
        assert!(at_head.try_recv().is_none());
        assert!(elsewhere.try_recv().is_none());
    }

    #[test]
    fn test_drop_unregisters() {
        let fanout = FanoutBuffer::new("Weld", 16, 16);
        let a = fanout.subscribe(SessionFilter::entity("A42"), None);
        let a2 = fanout.subscribe(SessionFilter::entity("A42"), None);
        assert_eq!(fanout.session_count(), 2);

        drop(a);
        assert_eq!(fanout.session_count(), 1);
        assert_eq!(fanout.publish(event("A42", "x", 0)).delivered, 1);

        drop(a2);
        assert_eq!(fanout.session_count(), 0);
        assert_eq!(fanout.publish(event("A42", "x", 1)).delivered, 0);
    }

    #[test]
    fn test_slow_session_evicts_only_its_own_events() {
        let fanout = FanoutBuffer::new("Weld", 64, 4);
        let slow = fanout.subscribe(SessionFilter::entity("A42"), None);
        let fast = fanout.subscribe(SessionFilter::entity("A42"), None);

        let mut fast_seen = Vec::new();
        for i in 0..20 {
            fanout.publish(event("A42", "x", i));
            while let Some(e) = fast.try_recv() {
                fast_seen.push(e.sequence_token.offset);
            }
        }

        assert_eq!(fast_seen, (0..20).collect::<Vec<_>>());
        let slow_stats = slow.stats();
        assert_eq!(slow_stats.queued, 4);
        assert_eq!(slow_stats.dropped, 16);
        assert_eq!(slow.try_recv().unwrap().sequence_token.offset, 16);
    }

    #[test]
    fn test_close_all_ends_sessions() {
        let fanout = FanoutBuffer::new("Weld", 16, 16);
        let sub = fanout.subscribe(SessionFilter::entity("A42"), None);
        fanout.publish(event("A42", "x", 0));
        fanout.close_all();
        assert!(sub.is_closed());
        assert!(sub.try_recv().is_none());
    }
}

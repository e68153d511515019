//! Subscription sessions.
//!
//! A session is split in two halves:
//!
//! - [`SessionShared`]: the bounded delivery queue, owned jointly by the
//!   fan-out index (writer side) and the subscriber's handle (reader side).
//! - [`Subscription`]: the handle held by the connection task. Dropping it
//!   unregisters the session and frees its queue immediately.
//!
//! The writer never blocks. When the queue is full the oldest queued event is
//! evicted for that session only.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};

use serde::Serialize;
use tokio::sync::Notify;
use uuid::Uuid;

use super::fanout::FanoutBuffer;
use crate::types::{Event, SequenceToken};

/// Which events a session wants.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct SessionFilter {
    pub entity_id: String,
    pub item_id: Option<String>,
}

impl SessionFilter {
    pub fn entity(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            item_id: None,
        }
    }

    pub fn item(entity_id: impl Into<String>, item_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            item_id: Some(item_id.into()),
        }
    }

    #[inline]
    pub fn matches(&self, event: &Event) -> bool {
        self.entity_id == event.entity_id
            && match &self.item_id {
                Some(item) => event.item_id.as_deref() == Some(item.as_str()),
                None => true,
            }
    }
}

/// Delivery counters of one session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionStats {
    pub session_id: Uuid,
    pub filter: SessionFilter,
    pub delivered: u64,
    pub dropped: u64,
    pub queued: usize,
    pub cursor: Option<SequenceToken>,
}

pub(crate) struct SessionShared {
    pub(crate) id: Uuid,
    pub(crate) filter: SessionFilter,
    capacity: usize,
    queue: Mutex<VecDeque<Arc<Event>>>,
    ready: Notify,
    closed: AtomicBool,
    delivered: AtomicU64,
    dropped: AtomicU64,
    cursor: Mutex<Option<SequenceToken>>,
}

impl SessionShared {
    pub(crate) fn new(filter: SessionFilter, capacity: usize) -> Self {
        Self {
            id: Uuid::new_v4(),
            filter,
            capacity: capacity.max(1),
            queue: Mutex::new(VecDeque::with_capacity(capacity.clamp(1, 64))),
            ready: Notify::new(),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
            dropped: AtomicU64::new(0),
            cursor: Mutex::new(None),
        }
    }

    fn queue(&self) -> MutexGuard<'_, VecDeque<Arc<Event>>> {
        self.queue.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Enqueue an event. Returns true if an older event was evicted.
    pub(crate) fn deliver(&self, event: Arc<Event>) -> bool {
        if self.is_closed() {
            return false;
        }
        let evicted = {
            let mut queue = self.queue();
            let evicted = if queue.len() >= self.capacity {
                queue.pop_front();
                true
            } else {
                false
            };
            queue.push_back(event);
            evicted
        };
        if evicted {
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        self.ready.notify_one();
        evicted
    }

    pub(crate) fn close(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.queue().clear();
            self.ready.notify_one();
        }
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub(crate) fn queued(&self) -> usize {
        self.queue().len()
    }

    fn pop(&self) -> Option<Arc<Event>> {
        let event = self.queue().pop_front()?;
        self.delivered.fetch_add(1, Ordering::Relaxed);
        *self.cursor.lock().unwrap_or_else(|p| p.into_inner()) = Some(event.sequence_token);
        Some(event)
    }

    pub(crate) fn stats(&self) -> SessionStats {
        SessionStats {
            session_id: self.id,
            filter: self.filter.clone(),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            queued: self.queued(),
            cursor: *self.cursor.lock().unwrap_or_else(|p| p.into_inner()),
        }
    }
}

/// A subscriber's handle on its session.
///
/// The session lives as long as this handle. It ends when the handle is
/// dropped (client disconnect), when [`close`](Self::close) is called, or
/// when the Dispatcher shuts down.
pub struct Subscription {
    shared: Arc<SessionShared>,
    fanout: Weak<FanoutBuffer>,
}

impl Subscription {
    pub(crate) fn new(shared: Arc<SessionShared>, fanout: Weak<FanoutBuffer>) -> Self {
        Self { shared, fanout }
    }

    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    pub fn filter(&self) -> &SessionFilter {
        &self.shared.filter
    }

    /// Next queued event, waiting for one if necessary.
    ///
    /// Returns `None` once the session is closed.
    pub async fn recv(&self) -> Option<Arc<Event>> {
        loop {
            if self.shared.is_closed() {
                return None;
            }
            if let Some(event) = self.shared.pop() {
                return Some(event);
            }
            self.shared.ready.notified().await;
        }
    }

    /// Next queued event without waiting.
    pub fn try_recv(&self) -> Option<Arc<Event>> {
        if self.shared.is_closed() {
            return None;
        }
        self.shared.pop()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.is_closed()
    }

    pub fn close(&self) {
        self.shared.close();
    }

    pub fn stats(&self) -> SessionStats {
        self.shared.stats()
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.close();
        if let Some(fanout) = self.fanout.upgrade() {
            fanout.unregister(&self.shared);
        }
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.shared.id)
            .field("filter", &self.shared.filter)
            .field("closed", &self.shared.is_closed())
            .finish()
    }
}

//! Notification Queue: deferred, coalesced change delivery.
//!
//! Keys that changed (remote push, local write, forced `notify`) are
//! appended to a pending list; the first key queued while idle schedules a
//! single flush task on the client's task channel. The flush snapshots the
//! list, sorts it and drops duplicates, so each key is delivered at most
//! once per flush and in an order independent of arrival.
//!
//! Nothing here invokes listeners. The client runs the flush on its own
//! dispatch loop, outside any lock.

use std::collections::BTreeMap;
use std::sync::mpsc::{self, Receiver, Sender};

use crate::engine::SubscriptionId;
use crate::key::key_is_below;
use crate::value::Entry;

/// Work item on a client's task channel.
#[derive(Debug)]
pub(crate) enum Task {
    /// An engine callback reported a change below a watched directory
    RemoteChange { subscription: SubscriptionId, entry: Entry },
    /// Deliver the pending notification list
    FlushNotifies,
}

/// Single-consumer task channel. The sending half is cloned into engine
/// callbacks, which may run on any thread.
pub(crate) fn task_channel() -> (Sender<Task>, Receiver<Task>) {
    mpsc::channel()
}

/// Flush lifecycle of a [`NotifyQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushState {
    /// Nothing pending, no flush scheduled
    Idle,
    /// Keys pending and exactly one flush scheduled
    Queued,
    /// A flush is delivering its snapshot
    Flushing,
}

/// Pending changed keys and the flush state machine.
#[derive(Debug)]
pub struct NotifyQueue {
    pending: Vec<String>,
    state: FlushState,
}

impl Default for NotifyQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl NotifyQueue {
    pub fn new() -> Self {
        Self { pending: Vec::new(), state: FlushState::Idle }
    }

    /// Append `key`; returns true when the caller must schedule a flush.
    ///
    /// Duplicates are kept here and merged at flush time. While a flush is
    /// running, its snapshot is already taken, so a key queued from a
    /// listener schedules the next flush.
    pub fn queue(&mut self, key: &str) -> bool {
        tracing::trace!(key, pending = self.pending.len(), "Queueing notify");
        self.pending.push(key.to_string());
        if self.state == FlushState::Queued {
            return false;
        }
        self.state = FlushState::Queued;
        true
    }

    /// Snapshot-and-clear the pending list: sorted, duplicates removed.
    pub fn begin_flush(&mut self) -> Vec<String> {
        let mut keys = std::mem::take(&mut self.pending);
        self.state = FlushState::Flushing;
        keys.sort_unstable();
        keys.dedup();
        keys
    }

    /// Return to idle unless a new flush was queued meanwhile.
    pub fn end_flush(&mut self) {
        if self.state == FlushState::Flushing {
            self.state = FlushState::Idle;
        }
    }

    /// Discard everything pending; returns how many keys were dropped.
    pub fn cancel(&mut self) -> usize {
        let dropped = self.pending.len();
        self.pending.clear();
        self.state = FlushState::Idle;
        dropped
    }

    pub fn state(&self) -> FlushState {
        self.state
    }

    /// Keys queued and not yet flushed (duplicates included).
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }
}

/// Identifier returned by `notify_add`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u32);

/// Namespace-scoped listeners, in registration order.
#[derive(Debug)]
pub struct ListenerTable<L> {
    next_id: u32,
    listeners: BTreeMap<ListenerId, (String, L)>,
}

impl<L> Default for ListenerTable<L> {
    fn default() -> Self {
        Self { next_id: 1, listeners: BTreeMap::new() }
    }
}

impl<L: Clone> ListenerTable<L> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, namespace: &str, listener: L) -> ListenerId {
        let id = ListenerId(self.next_id);
        self.next_id += 1;
        self.listeners.insert(id, (namespace.to_string(), listener));
        id
    }

    pub fn remove(&mut self, id: ListenerId) -> bool {
        self.listeners.remove(&id).is_some()
    }

    /// Listeners whose namespace is `key` or one of its ancestors.
    ///
    /// Cloned out so the caller can invoke them with no lock held.
    pub fn matching(&self, key: &str) -> Vec<(ListenerId, L)> {
        self.listeners
            .iter()
            .filter(|(_, (namespace, _))| key_is_below(namespace, key))
            .map(|(id, (_, l))| (*id, l.clone()))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.listeners.len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.is_empty()
    }
}

/// Identifier returned when connecting a signal handler.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct HandlerId(pub u32);

/// Un-scoped handlers for a client-wide signal.
#[derive(Debug)]
pub struct HandlerTable<H> {
    next_id: u32,
    handlers: BTreeMap<HandlerId, H>,
}

impl<H> Default for HandlerTable<H> {
    fn default() -> Self {
        Self { next_id: 1, handlers: BTreeMap::new() }
    }
}

impl<H: Clone> HandlerTable<H> {
    pub fn connect(&mut self, handler: H) -> HandlerId {
        let id = HandlerId(self.next_id);
        self.next_id += 1;
        self.handlers.insert(id, handler);
        id
    }

    pub fn disconnect(&mut self, id: HandlerId) -> bool {
        self.handlers.remove(&id).is_some()
    }

    pub fn snapshot(&self) -> Vec<H> {
        self.handlers.values().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

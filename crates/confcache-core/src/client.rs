//! Client Facade: the public API over the cache, the directory registry
//! and the notification queue.
//!
//! # Threading
//!
//! A `Client` is a cheap handle (`Arc` inside) and may be cloned and sent
//! between threads, but notifications are delivered only by whoever drives
//! [`Client::dispatch_pending`] / [`Client::wait_and_dispatch`]. Engine
//! callbacks never touch cache state directly: they push a task onto the
//! client's channel, and the dispatch loop applies it.
//!
//! Listeners and signal handlers are invoked with no internal lock held,
//! so they may call back into the client (read, write, add listeners).
//! A reentrant `dispatch_pending` from inside a listener returns 0.
//!
//! A listener that panics unwinds through the dispatch call; the rest of
//! that flush is lost, and the client stays usable.

use std::fmt;
use std::sync::mpsc::{Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;

use hashbrown::HashMap;
use parking_lot::Mutex;

use crate::changeset::{ChangeSet, ChangeTarget};
use crate::config::{Config, PreloadType};
use crate::engine::{Engine, SubscriptionId, UnsetFlags};
use crate::error::{report_globally, ConfError, ConfResult, ErrorHandling};
use crate::key::validate_key;
use crate::notify::{task_channel, HandlerId, HandlerTable, ListenerId, ListenerTable, NotifyQueue, Task};
use crate::registry::{AddOutcome, DirectoryRegistry, ReleaseOutcome, Subscriber, WatchedDirectory};
use crate::store::{CacheResult, EntryStore};
use crate::value::{Entry, FromValue, Schema, Value};

/// Per-namespace change listener.
pub type Listener = Arc<dyn Fn(&Client, ListenerId, &Entry) + Send + Sync>;

/// Catch-all change handler: key and new value (`None` when unset).
pub type ValueChangedHandler = Arc<dyn Fn(&Client, &str, Option<&Value>) + Send + Sync>;

/// Handler for every error the client runs into.
pub type ErrorHandler = Arc<dyn Fn(&Client, &ConfError) + Send + Sync>;

#[derive(Clone)]
enum Signal {
    ValueChanged(ValueChangedHandler),
    Error(ErrorHandler),
}

/// Mutable client state, guarded by one lock.
struct ClientState {
    store: EntryStore,
    registry: DirectoryRegistry,
    queue: NotifyQueue,
    listeners: ListenerTable<Listener>,
    signals: HandlerTable<Signal>,
}

struct ClientInner {
    engine: Arc<dyn Engine>,
    config: Config,
    state: Mutex<ClientState>,
    tasks_tx: Sender<Task>,
    tasks_rx: Mutex<Receiver<Task>>,
}

/// Subscription traffic for the registry, routed to the engine.
///
/// Every subscription's callback only forwards into the task channel.
struct EngineSubscriber<'a> {
    engine: &'a dyn Engine,
    tasks: &'a Sender<Task>,
}

impl Subscriber for EngineSubscriber<'_> {
    fn subscribe(&mut self, dir: &str) -> ConfResult<SubscriptionId> {
        let tasks = self.tasks.clone();
        let callback = Arc::new(move |subscription: SubscriptionId, entry: Entry| {
            let key = entry.key.clone();
            if tasks.send(Task::RemoteChange { subscription, entry }).is_err() {
                tracing::warn!(key = %key, %subscription, "Dropping remote change for a torn down client");
            }
        });
        self.engine.notify_add(dir, callback)
    }

    fn unsubscribe(&mut self, id: SubscriptionId) {
        self.engine.notify_remove(id);
    }
}

impl ClientInner {
    fn subscriber(&self) -> EngineSubscriber<'_> {
        EngineSubscriber { engine: self.engine.as_ref(), tasks: &self.tasks_tx }
    }

    /// Queue `key` and schedule a flush if none is pending.
    fn queue_notify(&self, state: &mut ClientState, key: &str) {
        if state.queue.queue(key) && self.tasks_tx.send(Task::FlushNotifies).is_err() {
            tracing::warn!(key, "Task channel closed, notification dropped");
        }
    }

    fn engine_id(&self) -> usize {
        engine_id(&self.engine)
    }

    /// Release all remote state; returns the number of discarded
    /// notifications.
    fn teardown(&mut self) -> usize {
        let state = self.state.get_mut();
        let discarded = state.queue.cancel();
        let mut sub = EngineSubscriber { engine: self.engine.as_ref(), tasks: &self.tasks_tx };
        state.registry.release_all(&mut sub);
        state.store.clear();
        discarded
    }
}

impl Drop for ClientInner {
    fn drop(&mut self) {
        let discarded = self.teardown();

        let id = engine_id(&self.engine);
        let mut clients = clients().lock();
        if clients.get(&id).map_or(false, |w| w.strong_count() == 0) {
            clients.remove(&id);
        }
        tracing::debug!(discarded, "Client torn down");
    }
}

/// Process-wide engine -> client table.
type ClientTable = Mutex<HashMap<usize, Weak<ClientInner>>>;

static CLIENTS: OnceLock<ClientTable> = OnceLock::new();

fn clients() -> &'static ClientTable {
    CLIENTS.get_or_init(|| Mutex::new(HashMap::new()))
}

fn engine_id(engine: &Arc<dyn Engine>) -> usize {
    Arc::as_ptr(engine) as *const () as usize
}

/// Caching, notifying front end to one [`Engine`].
#[derive(Clone)]
pub struct Client {
    inner: Arc<ClientInner>,
}

impl fmt::Debug for Client {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("Client")
            .field("engine", &format_args!("{:#x}", self.inner.engine_id()))
            .field("watched_dirs", &state.registry.len())
            .field("cached_entries", &state.store.len())
            .field("pending_notifications", &state.queue.pending_len())
            .finish()
    }
}

impl Client {
    /// The client for `engine`, created on first use.
    ///
    /// Every live client is registered by engine instance, so callers
    /// sharing an engine share one cache. `config` only applies when a
    /// new client is created.
    pub fn for_engine(engine: Arc<dyn Engine>, config: Config) -> ConfResult<Client> {
        let id = engine_id(&engine);
        let mut table = clients().lock();

        if let Some(inner) = table.get(&id).and_then(Weak::upgrade) {
            tracing::debug!(engine = id, "Reusing registered client");
            return Ok(Client { inner });
        }

        config.validate().map_err(|reason| ConfError::InvalidValue {
            reason: format!("invalid client configuration: {}", reason),
        })?;

        let (tasks_tx, tasks_rx) = task_channel();
        let inner = Arc::new(ClientInner {
            engine,
            config,
            state: Mutex::new(ClientState {
                store: EntryStore::new(),
                registry: DirectoryRegistry::new(),
                queue: NotifyQueue::new(),
                listeners: ListenerTable::new(),
                signals: HandlerTable::default(),
            }),
            tasks_tx,
            tasks_rx: Mutex::new(tasks_rx),
        });
        table.insert(id, Arc::downgrade(&inner));
        tracing::debug!(engine = id, "Registered new client");
        Ok(Client { inner })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.inner.engine
    }

    // ------------------------------------------------------------------
    // Error reporting
    // ------------------------------------------------------------------

    /// Broadcast `error` to the error handlers (and globally in `All` mode).
    fn handle_error(&self, error: &ConfError) {
        let handlers: Vec<ErrorHandler> = self
            .inner
            .state
            .lock()
            .signals
            .snapshot()
            .into_iter()
            .filter_map(|s| match s {
                Signal::Error(h) => Some(h),
                Signal::ValueChanged(_) => None,
            })
            .collect();

        for handler in handlers {
            handler(self, error);
        }
        if self.inner.config.error_handling == ErrorHandling::All {
            report_globally(error, false);
        }
    }

    fn reported(&self, error: ConfError) -> ConfError {
        self.handle_error(&error);
        error
    }

    fn report_unreturned(&self, error: &ConfError) {
        if self.inner.config.error_handling == ErrorHandling::Unreturned {
            report_globally(error, true);
        }
    }

    fn checked_key(&self, key: &str) -> ConfResult<()> {
        validate_key(key).map_err(|e| self.reported(e))
    }

    // ------------------------------------------------------------------
    // Directories
    // ------------------------------------------------------------------

    /// Watch `dir` and preload it.
    ///
    /// A subscription failure leaves the directory registered without
    /// remote notifications (see [`retry_subscriptions`](Self::retry_subscriptions))
    /// and is returned; no preload happens then.
    pub fn add_dir(&self, dir: &str, preload: PreloadType) -> ConfResult<()> {
        self.checked_key(dir)?;

        let outcome = {
            let mut state = self.inner.state.lock();
            let mut sub = self.inner.subscriber();
            state.registry.add(dir, &mut sub)
        };

        match outcome {
            Ok(AddOutcome::Inserted) => tracing::debug!(dir, "Added directory"),
            Ok(AddOutcome::Referenced { ref_count }) => tracing::debug!(dir, ref_count, "Directory already added"),
            Err(e) => return Err(self.reported(e)),
        }
        self.preload(dir, preload)
    }

    /// [`add_dir`](Self::add_dir) with the configured default preload.
    pub fn add_dir_default(&self, dir: &str) -> ConfResult<()> {
        self.add_dir(dir, self.inner.config.default_preload)
    }

    /// Drop one reference to `dir`.
    ///
    /// On the last reference the directory's subscription is released,
    /// cached entries no other watch covers are evicted, and directories
    /// that relied on it acquire their own subscriptions. A directory that
    /// still cannot subscribe goes to the error handlers; the removal itself
    /// succeeds regardless (see [`retry_subscriptions`](Self::retry_subscriptions)).
    pub fn remove_dir(&self, dir: &str) -> ConfResult<()> {
        self.checked_key(dir)?;

        let resubscribed = {
            let mut guard = self.inner.state.lock();
            let mut sub = self.inner.subscriber();
            let ClientState { store, registry, .. } = &mut *guard;

            match registry.release(dir, &mut sub) {
                ReleaseOutcome::NotWatched | ReleaseOutcome::StillReferenced { .. } => return Ok(()),
                ReleaseOutcome::Removed => {}
            }
            let evicted = store.invalidate_prefix_except(dir, |k| registry.covers(k));
            tracing::debug!(dir, evicted = evicted.len(), "Removed directory");
            registry.resubscribe_uncovered(&mut sub)
        };

        if let Err(e) = resubscribed {
            tracing::warn!(dir, error = %e, "Watched directory still without a subscription");
            self.handle_error(&e);
        }
        Ok(())
    }

    /// Try again to subscribe every watched directory left without one.
    ///
    /// Returns the number of subscriptions acquired. Nothing retries on
    /// its own.
    pub fn retry_subscriptions(&self) -> ConfResult<usize> {
        let result = {
            let mut state = self.inner.state.lock();
            let mut sub = self.inner.subscriber();
            state.registry.resubscribe_uncovered(&mut sub)
        };
        result.map_err(|e| self.reported(e))
    }

    /// Fetch `dir` into the cache. `dir` must be watched.
    ///
    /// Listing failures are logged and leave that directory unmarked;
    /// they do not fail the call.
    pub fn preload(&self, dir: &str, preload: PreloadType) -> ConfResult<()> {
        self.checked_key(dir)?;
        if preload == PreloadType::None {
            return Ok(());
        }
        if !self.inner.state.lock().registry.covers(dir) {
            return Err(self.reported(ConfError::NotFound { key: dir.to_string() }));
        }

        let depth = match preload {
            PreloadType::Recursive => self.inner.config.max_preload_depth,
            _ => 1,
        };
        self.preload_dir(dir, depth);
        Ok(())
    }

    fn preload_dir(&self, dir: &str, depth: usize) {
        tracing::trace!(dir, "REMOTE: All entries");
        match self.inner.engine.all_entries(dir) {
            Ok(entries) => {
                let mut state = self.inner.state.lock();
                for entry in entries {
                    state.store.insert_or_update(entry, false);
                }
                state.store.mark_complete(dir);
            }
            Err(e) => tracing::warn!(dir, error = %e, "Failure during preload"),
        }

        if depth <= 1 {
            return;
        }
        tracing::trace!(dir, "REMOTE: All dirs");
        match self.inner.engine.all_dirs(dir) {
            Ok(subdirs) => {
                for subdir in subdirs {
                    self.preload_dir(&subdir, depth - 1);
                }
            }
            Err(e) => tracing::warn!(dir, error = %e, "Failure during recursive preload"),
        }
    }

    // ------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------

    /// Value of `key`, falling back to its schema default.
    pub fn get(&self, key: &str) -> ConfResult<Option<Value>> {
        Ok(self.get_entry(key, true)?.value)
    }

    /// Value of `key` as set by a user, ignoring schema defaults.
    pub fn get_without_default(&self, key: &str) -> ConfResult<Option<Value>> {
        Ok(self.get_entry(key, false)?.value)
    }

    /// Full entry for `key`.
    ///
    /// Served from the cache when possible. On a miss the engine is asked
    /// and, if `key` lies under a watched directory, the answer cached.
    pub fn get_entry(&self, key: &str, use_default: bool) -> ConfResult<Entry> {
        self.checked_key(key)?;

        let lookup = self.inner.state.lock().store.lookup(key);
        let entry = match lookup {
            CacheResult::Hit(entry) => {
                tracing::trace!(key, "CACHED: Query");
                entry
            }
            CacheResult::NegativeHit => {
                tracing::trace!(key, "CACHED: Known absent");
                return Ok(Entry::unset(key));
            }
            CacheResult::Miss => {
                tracing::trace!(key, "REMOTE: Query");
                let entry = self.inner.engine.get_entry(key, true).map_err(|e| self.reported(e))?;
                let mut state = self.inner.state.lock();
                if state.registry.covers(key) {
                    state.store.insert_or_update(entry.clone(), false);
                }
                entry
            }
        };

        if entry.is_default && !use_default {
            return Ok(Entry { value: None, is_default: false, ..entry });
        }
        Ok(entry)
    }

    /// Default the schema for `key` provides.
    pub fn get_default_from_schema(&self, key: &str) -> ConfResult<Option<Value>> {
        self.checked_key(key)?;

        if let CacheResult::Hit(entry) = self.inner.state.lock().store.lookup(key) {
            if entry.is_default {
                tracing::trace!(key, "CACHED: Schema default");
                return Ok(entry.value);
            }
        }
        tracing::trace!(key, "REMOTE: Schema default");
        self.inner.engine.default_from_schema(key).map_err(|e| self.reported(e))
    }

    fn get_typed<T: FromValue>(&self, key: &str) -> ConfResult<Option<T>> {
        self.get(key)?
            .map(|value| value.extract(key))
            .transpose()
            .map_err(|e| self.reported(e))
    }

    pub fn get_int(&self, key: &str) -> ConfResult<Option<i32>> {
        self.get_typed(key)
    }

    pub fn get_float(&self, key: &str) -> ConfResult<Option<f64>> {
        self.get_typed(key)
    }

    pub fn get_bool(&self, key: &str) -> ConfResult<Option<bool>> {
        self.get_typed(key)
    }

    pub fn get_string(&self, key: &str) -> ConfResult<Option<String>> {
        self.get_typed(key)
    }

    pub fn get_schema(&self, key: &str) -> ConfResult<Option<Schema>> {
        self.get_typed(key)
    }

    /// List value of `key` with items of type `T`.
    pub fn get_list<T: FromValue>(&self, key: &str) -> ConfResult<Option<Vec<T>>> {
        self.get(key)?
            .map(|value| value.into_list(key))
            .transpose()
            .map_err(|e| self.reported(e))
    }

    /// Pair value of `key` with members of types `A` and `B`.
    pub fn get_pair<A: FromValue, B: FromValue>(&self, key: &str) -> ConfResult<Option<(A, B)>> {
        self.get(key)?
            .map(|value| value.into_pair(key))
            .transpose()
            .map_err(|e| self.reported(e))
    }

    /// Entries that are immediate children of `dir`, sorted by key.
    ///
    /// A directory already fully cached is answered locally. Otherwise
    /// the listing is fetched, and cached when `dir` is watched.
    pub fn all_entries(&self, dir: &str) -> ConfResult<Vec<Entry>> {
        self.checked_key(dir)?;

        {
            let state = self.inner.state.lock();
            if state.store.is_complete(dir) {
                tracing::trace!(dir, "CACHED: All entries");
                let mut entries = state.store.entries_in_dir(dir);
                entries.retain(|e| e.value.is_some());
                return Ok(entries);
            }
        }

        tracing::trace!(dir, "REMOTE: All entries");
        let mut entries = self.inner.engine.all_entries(dir).map_err(|e| self.reported(e))?;
        entries.sort_by(|a, b| a.key.cmp(&b.key));

        let mut state = self.inner.state.lock();
        if state.registry.covers(dir) {
            for entry in &entries {
                state.store.insert_or_update(entry.clone(), false);
            }
            state.store.mark_complete(dir);
        }
        Ok(entries)
    }

    /// Immediate subdirectories of `dir`. Never cached.
    pub fn all_dirs(&self, dir: &str) -> ConfResult<Vec<String>> {
        self.checked_key(dir)?;
        tracing::trace!(dir, "REMOTE: All dirs");
        self.inner.engine.all_dirs(dir).map_err(|e| self.reported(e))
    }

    pub fn dir_exists(&self, dir: &str) -> ConfResult<bool> {
        self.checked_key(dir)?;
        tracing::trace!(dir, "REMOTE: Dir exists");
        self.inner.engine.dir_exists(dir).map_err(|e| self.reported(e))
    }

    /// Whether a write to `key` would be accepted.
    ///
    /// A key known absent from the cache carries no writability, so the
    /// engine is asked.
    pub fn key_is_writable(&self, key: &str) -> ConfResult<bool> {
        self.checked_key(key)?;

        let lookup = self.inner.state.lock().store.lookup(key);
        match lookup {
            CacheResult::Hit(entry) => {
                tracing::trace!(key, "CACHED: Writability");
                Ok(entry.is_writable)
            }
            CacheResult::NegativeHit => {
                tracing::trace!(key, "REMOTE: Writability of absent key");
                let entry = self.inner.engine.get_entry(key, true).map_err(|e| self.reported(e))?;
                Ok(entry.is_writable)
            }
            CacheResult::Miss => Ok(self.get_entry(key, true)?.is_writable),
        }
    }

    /// What the cache alone knows about `key`.
    pub fn cache_lookup(&self, key: &str) -> CacheResult {
        self.inner.state.lock().store.lookup(key)
    }

    // ------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------

    /// Write `value` to `key` through the engine.
    ///
    /// The cached entry is dropped and completeness marks above `key`
    /// cleared, so the next read refetches. A watched key is queued for
    /// notification.
    pub fn set(&self, key: &str, value: &Value) -> ConfResult<()> {
        self.checked_key(key)?;
        value.validate().map_err(|e| self.reported(e))?;

        tracing::trace!(key, value = %value, "REMOTE: Setting value");
        self.inner.engine.set(key, value).map_err(|e| self.reported(e))?;
        self.invalidate_written(key);
        Ok(())
    }

    pub fn set_int(&self, key: &str, value: i32) -> ConfResult<()> {
        self.set(key, &Value::Int(value))
    }

    pub fn set_float(&self, key: &str, value: f64) -> ConfResult<()> {
        self.set(key, &Value::Float(value))
    }

    pub fn set_bool(&self, key: &str, value: bool) -> ConfResult<()> {
        self.set(key, &Value::Bool(value))
    }

    pub fn set_string(&self, key: &str, value: &str) -> ConfResult<()> {
        self.set(key, &Value::String(value.to_string()))
    }

    pub fn set_schema(&self, key: &str, value: Schema) -> ConfResult<()> {
        self.set(key, &Value::Schema(Box::new(value)))
    }

    pub fn set_list<T: FromValue + Into<Value>>(&self, key: &str, items: Vec<T>) -> ConfResult<()> {
        self.set(key, &Value::list_of(items))
    }

    pub fn set_pair<A: Into<Value>, B: Into<Value>>(&self, key: &str, car: A, cdr: B) -> ConfResult<()> {
        let value = Value::pair(car.into(), cdr.into()).map_err(|e| self.reported(e))?;
        self.set(key, &value)
    }

    pub fn unset(&self, key: &str) -> ConfResult<()> {
        self.checked_key(key)?;

        tracing::trace!(key, "REMOTE: Unsetting");
        self.inner.engine.unset(key).map_err(|e| self.reported(e))?;
        self.invalidate_written(key);
        Ok(())
    }

    /// Unset `key` and everything below it.
    pub fn recursive_unset(&self, key: &str, flags: UnsetFlags) -> ConfResult<()> {
        self.checked_key(key)?;

        tracing::trace!(key, "REMOTE: Recursive unset");
        self.inner.engine.recursive_unset(key, flags).map_err(|e| self.reported(e))?;

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        let evicted = state.store.invalidate_prefix(key);
        state.store.invalidate_marks_above(key);
        if state.registry.covers(key) {
            self.inner.queue_notify(state, key);
        }
        for evicted_key in &evicted {
            if evicted_key != key {
                self.inner.queue_notify(state, evicted_key);
            }
        }
        Ok(())
    }

    fn invalidate_written(&self, key: &str) {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        state.store.remove(key);
        state.store.invalidate_marks_above(key);
        if state.registry.covers(key) {
            self.inner.queue_notify(state, key);
        }
    }

    pub fn suggest_sync(&self) -> ConfResult<()> {
        tracing::trace!("REMOTE: Suggesting sync");
        self.inner.engine.suggest_sync().map_err(|e| self.reported(e))
    }

    /// Forget every cached entry and completeness mark.
    pub fn clear_cache(&self) {
        self.inner.state.lock().store.clear();
        tracing::debug!("Cache cleared");
    }

    // ------------------------------------------------------------------
    // Notifications
    // ------------------------------------------------------------------

    /// Call `listener` for every change at or below `namespace`.
    ///
    /// Changes are only seen for keys under a watched directory.
    pub fn notify_add<F>(&self, namespace: &str, listener: F) -> ConfResult<ListenerId>
    where
        F: Fn(&Client, ListenerId, &Entry) + Send + Sync + 'static,
    {
        self.checked_key(namespace)?;
        let id = self.inner.state.lock().listeners.add(namespace, Arc::new(listener));
        tracing::debug!(namespace, listener = id.0, "Added listener");
        Ok(id)
    }

    pub fn notify_remove(&self, id: ListenerId) -> bool {
        self.inner.state.lock().listeners.remove(id)
    }

    /// Queue a notification for `key` as if it had changed.
    pub fn notify(&self, key: &str) -> ConfResult<()> {
        self.checked_key(key)?;
        let mut guard = self.inner.state.lock();
        self.inner.queue_notify(&mut guard, key);
        Ok(())
    }

    pub fn connect_value_changed<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Client, &str, Option<&Value>) + Send + Sync + 'static,
    {
        self.inner.state.lock().signals.connect(Signal::ValueChanged(Arc::new(handler)))
    }

    pub fn connect_error<F>(&self, handler: F) -> HandlerId
    where
        F: Fn(&Client, &ConfError) + Send + Sync + 'static,
    {
        self.inner.state.lock().signals.connect(Signal::Error(Arc::new(handler)))
    }

    pub fn disconnect(&self, id: HandlerId) -> bool {
        self.inner.state.lock().signals.disconnect(id)
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// Handle queued tasks without blocking; returns how many ran.
    ///
    /// At most `dispatch_budget` tasks run per call.
    pub fn dispatch_pending(&self) -> usize {
        let Some(rx) = self.inner.tasks_rx.try_lock() else {
            return 0;
        };
        self.drain(&rx, 0)
    }

    /// Block up to `timeout` for a task, then handle what is queued.
    pub fn wait_and_dispatch(&self, timeout: Duration) -> usize {
        let Some(rx) = self.inner.tasks_rx.try_lock() else {
            return 0;
        };
        match rx.recv_timeout(timeout) {
            Ok(task) => {
                self.run_task(task);
                self.drain(&rx, 1)
            }
            Err(RecvTimeoutError::Timeout | RecvTimeoutError::Disconnected) => 0,
        }
    }

    fn drain(&self, rx: &Receiver<Task>, mut handled: usize) -> usize {
        let limit = self.inner.config.task_limit();
        while handled < limit {
            match rx.try_recv() {
                Ok(task) => {
                    self.run_task(task);
                    handled += 1;
                }
                Err(_) => break,
            }
        }
        handled
    }

    fn run_task(&self, task: Task) {
        match task {
            Task::RemoteChange { subscription, entry } => self.apply_remote_change(subscription, entry),
            Task::FlushNotifies => self.flush_notifies(),
        }
    }

    fn apply_remote_change(&self, subscription: SubscriptionId, entry: Entry) {
        tracing::trace!(key = %entry.key, %subscription, "Received notify from engine");

        let mut guard = self.inner.state.lock();
        let state = &mut *guard;
        if !state.registry.covers(&entry.key) {
            tracing::trace!(key = %entry.key, "Ignoring change outside watched directories");
            return;
        }
        let key = entry.key.clone();
        if state.store.insert_or_update(entry, true) {
            self.inner.queue_notify(state, &key);
        }
    }

    /// Deliver every distinct pending key, in key order.
    fn flush_notifies(&self) {
        let keys = self.inner.state.lock().queue.begin_flush();
        tracing::trace!(keys = keys.len(), "Flushing notifications");

        for key in keys {
            let Some(entry) = self.current_for_flush(&key) else {
                continue;
            };

            let (handlers, listeners) = {
                let state = self.inner.state.lock();
                let handlers: Vec<ValueChangedHandler> = state
                    .signals
                    .snapshot()
                    .into_iter()
                    .filter_map(|s| match s {
                        Signal::ValueChanged(h) => Some(h),
                        Signal::Error(_) => None,
                    })
                    .collect();
                (handlers, state.listeners.matching(&key))
            };

            for handler in handlers {
                handler(self, &entry.key, entry.value.as_ref());
            }
            for (id, listener) in listeners {
                listener(self, id, &entry);
            }
        }

        self.inner.state.lock().queue.end_flush();
    }

    /// Entry to deliver for `key`, or `None` if interest in it lapsed.
    fn current_for_flush(&self, key: &str) -> Option<Entry> {
        {
            let state = self.inner.state.lock();
            match state.store.lookup(key) {
                CacheResult::Hit(entry) => return Some(entry),
                CacheResult::NegativeHit => return Some(Entry::unset(key)),
                CacheResult::Miss if !state.registry.covers(key) => {
                    tracing::trace!(key, "Skipping notify for unwatched key");
                    return None;
                }
                CacheResult::Miss => {}
            }
        }

        tracing::trace!(key, "REMOTE: Query");
        match self.inner.engine.get_entry(key, true) {
            Ok(entry) => {
                let mut state = self.inner.state.lock();
                if state.registry.covers(key) {
                    state.store.insert_or_update(entry.clone(), true);
                }
                Some(entry)
            }
            Err(e) => {
                self.handle_error(&e);
                None
            }
        }
    }

    // ------------------------------------------------------------------
    // Change sets
    // ------------------------------------------------------------------

    /// Apply `cs` in key order, stopping at the first failure.
    pub fn commit_change_set(&self, cs: &mut ChangeSet, remove_committed: bool) -> ConfResult<()> {
        cs.commit_to(self, remove_committed)
    }

    /// Change set that would restore the current values of `cs`'s keys.
    pub fn reverse_change_set(&self, cs: &ChangeSet) -> ConfResult<ChangeSet> {
        cs.reverse_from(self)
    }

    pub fn change_set_from_current(&self, keys: &[&str]) -> ConfResult<ChangeSet> {
        ChangeSet::from_current(keys.iter().copied(), self)
    }

    // ------------------------------------------------------------------
    // Introspection
    // ------------------------------------------------------------------

    /// Watched directories in path order.
    pub fn watched_dirs(&self) -> Vec<WatchedDirectory> {
        self.inner.state.lock().registry.iter().cloned().collect()
    }

    pub fn live_subscriptions(&self) -> usize {
        self.inner.state.lock().registry.live_subscriptions()
    }

    /// Keys queued for the next flush, duplicates included.
    pub fn pending_notifications(&self) -> usize {
        self.inner.state.lock().queue.pending_len()
    }

    pub fn cached_entries(&self) -> usize {
        self.inner.state.lock().store.len()
    }

    /// Whether `a` and `b` are handles to the same client.
    pub fn same_client(a: &Client, b: &Client) -> bool {
        Arc::ptr_eq(&a.inner, &b.inner)
    }
}

impl ChangeTarget for Client {
    fn apply_set(&self, key: &str, value: &Value) -> ConfResult<()> {
        self.set(key, value)
    }

    fn apply_unset(&self, key: &str) -> ConfResult<()> {
        self.unset(key)
    }

    fn current_value(&self, key: &str) -> ConfResult<Option<Value>> {
        self.get_without_default(key)
    }
}

/// Report errors from calls whose result the caller will not inspect.
///
/// ```ignore
/// client.set_int("/apps/demo/size", 3).or_report(&client);
/// ```
pub trait UnreturnedExt<T> {
    /// `Some(value)` on success; on failure the error goes to the
    /// unreturned-error path and `None` is returned.
    fn or_report(self, client: &Client) -> Option<T>;
}

impl<T> UnreturnedExt<T> for ConfResult<T> {
    fn or_report(self, client: &Client) -> Option<T> {
        match self {
            Ok(value) => Some(value),
            Err(e) => {
                client.report_unreturned(&e);
                None
            }
        }
    }
}

//! `Engine` implementation over an in-process [`ValueTree`].
//!
//! Reads go through an `RwLock`; writes take the write lock only long
//! enough to update the tree and compute the post-change entries.
//! Subscription callbacks are collected under the subscription lock and
//! invoked after every lock is released, so a callback may call back
//! into the engine.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};

use confcache_core::key::{key_is_below, validate_key};
use confcache_core::{
    ConfError, ConfResult, Engine, Entry, NotifyCallback, Schema, SubscriptionId, UnsetFlags, Value,
};

use crate::tree::ValueTree;

/// Call counters, for checking what the cache kept away from the engine.
#[derive(Debug, Default)]
struct CallStats {
    get_entry: AtomicU64,
    all_entries: AtomicU64,
    all_dirs: AtomicU64,
    writes: AtomicU64,
}

/// In-memory configuration engine.
pub struct LocalEngine {
    tree: RwLock<ValueTree>,
    /// Live subscriptions by id: watched directory and callback
    subscriptions: Mutex<BTreeMap<SubscriptionId, (String, NotifyCallback)>>,
    next_subscription: AtomicU64,
    stats: CallStats,
    /// When false, every call fails with `EngineUnavailable`
    available: AtomicBool,
    refuse_subscriptions: AtomicBool,
    /// Keys whose writes fail with `EngineUnavailable`
    failing_writes: Mutex<HashSet<String>>,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    pub fn new() -> Self {
        Self {
            tree: RwLock::new(ValueTree::new()),
            subscriptions: Mutex::new(BTreeMap::new()),
            next_subscription: AtomicU64::new(1),
            stats: CallStats::default(),
            available: AtomicBool::new(true),
            refuse_subscriptions: AtomicBool::new(false),
            failing_writes: Mutex::new(HashSet::new()),
        }
    }

    /// Store a schema value at `schema_key`.
    pub fn install_schema(&self, schema_key: &str, schema: Schema) {
        self.tree.write().install_schema(schema_key, schema);
    }

    /// Let `key` fall back to the default of the schema at `schema_key`.
    pub fn associate_schema(&self, key: &str, schema_key: &str) {
        self.tree.write().associate_schema(key, schema_key);
    }

    /// Refuse writes at or below `prefix` with `PermissionDenied`.
    pub fn set_read_only(&self, prefix: &str) {
        self.tree.write().set_read_only(prefix);
    }

    /// Pin `key` to `value`; writes to it fail with `Overridden`.
    pub fn set_mandatory(&self, key: &str, value: Value) {
        self.tree.write().set_mandatory(key, value);
    }

    pub fn create_dir(&self, dir: &str) {
        self.tree.write().create_dir(dir);
    }

    /// Simulate the engine going away (`false`) or coming back.
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Make writes to `key` fail until [`clear_faults`](Self::clear_faults).
    pub fn fail_writes_to(&self, key: &str) {
        self.failing_writes.lock().insert(key.to_string());
    }

    /// Refuse new subscriptions while `refuse` is true.
    pub fn fail_subscriptions(&self, refuse: bool) {
        self.refuse_subscriptions.store(refuse, Ordering::SeqCst);
    }

    pub fn clear_faults(&self) {
        self.failing_writes.lock().clear();
        self.refuse_subscriptions.store(false, Ordering::SeqCst);
        self.available.store(true, Ordering::SeqCst);
    }

    pub fn get_entry_calls(&self) -> u64 {
        self.stats.get_entry.load(Ordering::Relaxed)
    }

    pub fn all_entries_calls(&self) -> u64 {
        self.stats.all_entries.load(Ordering::Relaxed)
    }

    pub fn all_dirs_calls(&self) -> u64 {
        self.stats.all_dirs.load(Ordering::Relaxed)
    }

    pub fn write_calls(&self) -> u64 {
        self.stats.writes.load(Ordering::Relaxed)
    }

    pub fn reset_counters(&self) {
        self.stats.get_entry.store(0, Ordering::Relaxed);
        self.stats.all_entries.store(0, Ordering::Relaxed);
        self.stats.all_dirs.store(0, Ordering::Relaxed);
        self.stats.writes.store(0, Ordering::Relaxed);
    }

    pub fn live_subscriptions(&self) -> usize {
        self.subscriptions.lock().len()
    }

    /// Directories with a live subscription, sorted.
    pub fn subscribed_dirs(&self) -> Vec<String> {
        let mut dirs: Vec<String> = self.subscriptions.lock().values().map(|(dir, _)| dir.clone()).collect();
        dirs.sort();
        dirs
    }

    /// Number of user-set values held.
    pub fn len(&self) -> usize {
        self.tree.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.tree.read().is_empty()
    }

    fn check_available(&self) -> ConfResult<()> {
        if self.available.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(ConfError::EngineUnavailable { message: "local engine is offline".into() })
        }
    }

    fn check_write(&self, key: &str) -> ConfResult<()> {
        self.check_available()?;
        validate_key(key)?;
        if self.failing_writes.lock().contains(key) {
            return Err(ConfError::EngineUnavailable { message: format!("write to {} failed", key) });
        }
        self.stats.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Deliver each changed entry to every subscription above its key.
    fn fire(&self, changed: Vec<Entry>) {
        if changed.is_empty() {
            return;
        }
        let subscriptions: Vec<(SubscriptionId, String, NotifyCallback)> = self
            .subscriptions
            .lock()
            .iter()
            .map(|(id, (dir, callback))| (*id, dir.clone(), callback.clone()))
            .collect();

        for entry in changed {
            for (id, dir, callback) in &subscriptions {
                if key_is_below(dir, &entry.key) {
                    tracing::trace!(key = %entry.key, subscription = %id, "Firing change notification");
                    callback(*id, entry.clone());
                }
            }
        }
    }
}

impl std::fmt::Debug for LocalEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalEngine")
            .field("values", &self.len())
            .field("subscriptions", &self.live_subscriptions())
            .finish()
    }
}

impl Engine for LocalEngine {
    fn get_entry(&self, key: &str, use_default: bool) -> ConfResult<Entry> {
        self.check_available()?;
        validate_key(key)?;
        self.stats.get_entry.fetch_add(1, Ordering::Relaxed);
        Ok(self.tree.read().entry(key, use_default))
    }

    fn set(&self, key: &str, value: &Value) -> ConfResult<()> {
        self.check_write(key)?;
        value.validate()?;
        let changed = {
            let mut tree = self.tree.write();
            tree.set(key, value.clone())?;
            tree.entry(key, true)
        };
        self.fire(vec![changed]);
        Ok(())
    }

    fn unset(&self, key: &str) -> ConfResult<()> {
        self.check_write(key)?;
        let changed = {
            let mut tree = self.tree.write();
            if !tree.unset(key)? {
                return Ok(());
            }
            tree.entry(key, true)
        };
        self.fire(vec![changed]);
        Ok(())
    }

    fn recursive_unset(&self, key: &str, flags: UnsetFlags) -> ConfResult<()> {
        self.check_write(key)?;
        let changed: Vec<Entry> = {
            let mut tree = self.tree.write();
            let keys = tree.recursive_unset(key, flags.unset_schema_names);
            keys.iter().map(|k| tree.entry(k, true)).collect()
        };
        self.fire(changed);
        Ok(())
    }

    fn all_entries(&self, dir: &str) -> ConfResult<Vec<Entry>> {
        self.check_available()?;
        validate_key(dir)?;
        self.stats.all_entries.fetch_add(1, Ordering::Relaxed);
        Ok(self.tree.read().entries(dir))
    }

    fn all_dirs(&self, dir: &str) -> ConfResult<Vec<String>> {
        self.check_available()?;
        validate_key(dir)?;
        self.stats.all_dirs.fetch_add(1, Ordering::Relaxed);
        Ok(self.tree.read().subdirs(dir))
    }

    fn notify_add(&self, dir: &str, callback: NotifyCallback) -> ConfResult<SubscriptionId> {
        self.check_available()?;
        validate_key(dir)?;
        if self.refuse_subscriptions.load(Ordering::SeqCst) {
            return Err(ConfError::EngineUnavailable { message: format!("cannot watch {}", dir) });
        }
        let id = SubscriptionId(self.next_subscription.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.lock().insert(id, (dir.to_string(), callback));
        tracing::debug!(dir, subscription = %id, "Subscription added");
        Ok(id)
    }

    fn notify_remove(&self, id: SubscriptionId) {
        if self.subscriptions.lock().remove(&id).is_some() {
            tracing::debug!(subscription = %id, "Subscription removed");
        }
    }

    fn default_from_schema(&self, key: &str) -> ConfResult<Option<Value>> {
        self.check_available()?;
        validate_key(key)?;
        Ok(self.tree.read().schema_default(key))
    }

    fn dir_exists(&self, dir: &str) -> ConfResult<bool> {
        self.check_available()?;
        validate_key(dir)?;
        Ok(self.tree.read().dir_exists(dir))
    }

    fn suggest_sync(&self) -> ConfResult<()> {
        self.check_available()
    }
}

//! The Engine collaborator: the remote source of truth.
//!
//! The client never assumes anything about how an engine stores values
//! or talks to a daemon. It only needs the calls below. Engines may invoke
//! notification callbacks from any thread; the client's callback merely
//! hands the change to its own task queue.

use std::fmt;
use std::sync::Arc;

use crate::error::ConfResult;
use crate::key;
use crate::value::{Entry, Value};

/// Handle of a remote directory subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Remote change callback: the subscription it fired for and the new entry.
pub type NotifyCallback = Arc<dyn Fn(SubscriptionId, Entry) + Send + Sync>;

/// Options for [`Engine::recursive_unset`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct UnsetFlags {
    /// Also drop the schema associations of the unset keys
    pub unset_schema_names: bool,
}

/// A configuration engine.
///
/// Implementations must be usable from the thread that drives the client;
/// `Send + Sync` lets a client handle move between threads.
pub trait Engine: Send + Sync {
    /// Entry for `key`. Absent keys yield an entry with `value: None`,
    /// never an error. With `use_default`, a schema default is returned
    /// (flagged `is_default`) when no value is set.
    fn get_entry(&self, key: &str, use_default: bool) -> ConfResult<Entry>;

    fn set(&self, key: &str, value: &Value) -> ConfResult<()>;

    fn unset(&self, key: &str) -> ConfResult<()>;

    /// Unset `key` and everything below it.
    fn recursive_unset(&self, key: &str, flags: UnsetFlags) -> ConfResult<()>;

    /// Entries that are immediate children of `dir`.
    fn all_entries(&self, dir: &str) -> ConfResult<Vec<Entry>>;

    /// Absolute paths of the immediate subdirectories of `dir`.
    fn all_dirs(&self, dir: &str) -> ConfResult<Vec<String>>;

    /// Subscribe to changes at or below `dir`.
    fn notify_add(&self, dir: &str, callback: NotifyCallback) -> ConfResult<SubscriptionId>;

    fn notify_remove(&self, id: SubscriptionId);

    /// Default value the schema for `key` provides, ignoring any set value.
    fn default_from_schema(&self, key: &str) -> ConfResult<Option<Value>> {
        let entry = self.get_entry(key, true)?;
        Ok(if entry.is_default { entry.value } else { None })
    }

    fn dir_exists(&self, dir: &str) -> ConfResult<bool> {
        if dir == key::ROOT {
            return Ok(true);
        }
        Ok(!self.all_entries(dir)?.is_empty() || !self.all_dirs(dir)?.is_empty())
    }

    /// Hint that pending writes should reach permanent storage.
    fn suggest_sync(&self) -> ConfResult<()> {
        Ok(())
    }
}

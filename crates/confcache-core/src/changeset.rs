//! Change-Set Engine: batches of pending writes.
//!
//! A `ChangeSet` is built entirely client-side. Nothing reaches the engine
//! until it is committed against a [`ChangeTarget`] (normally a `Client`),
//! which applies the changes in key order and stops at the first failure.

use std::collections::BTreeMap;

use crate::error::{ConfError, ConfResult};
use crate::value::{FromValue, Schema, Value};

/// One scheduled write: `new_value == None` is an unset.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingChange {
    pub key: String,
    pub new_value: Option<Value>,
}

/// Where a change set is applied and read back from.
pub trait ChangeTarget {
    fn apply_set(&self, key: &str, value: &Value) -> ConfResult<()>;
    fn apply_unset(&self, key: &str) -> ConfResult<()>;
    /// The value currently set for `key`, ignoring schema defaults.
    fn current_value(&self, key: &str) -> ConfResult<Option<Value>>;
}

/// Key-ordered collection of pending changes, one per key.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeSet {
    changes: BTreeMap<String, Option<Value>>,
}

impl ChangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `key = value`, replacing any earlier change to `key`.
    pub fn set(&mut self, key: &str, value: impl Into<Value>) {
        self.changes.insert(key.to_string(), Some(value.into()));
    }

    pub fn set_int(&mut self, key: &str, value: i32) {
        self.set(key, Value::Int(value));
    }

    pub fn set_float(&mut self, key: &str, value: f64) {
        self.set(key, Value::Float(value));
    }

    pub fn set_bool(&mut self, key: &str, value: bool) {
        self.set(key, Value::Bool(value));
    }

    pub fn set_string(&mut self, key: &str, value: &str) {
        self.set(key, Value::String(value.to_string()));
    }

    pub fn set_schema(&mut self, key: &str, value: Schema) {
        self.set(key, Value::Schema(Box::new(value)));
    }

    pub fn set_list<T: FromValue + Into<Value>>(&mut self, key: &str, items: Vec<T>) {
        self.set(key, Value::list_of(items));
    }

    pub fn set_pair<A: Into<Value>, B: Into<Value>>(&mut self, key: &str, car: A, cdr: B) {
        self.set(key, Value::Pair(Box::new(car.into()), Box::new(cdr.into())));
    }

    /// Schedule an unset of `key`.
    pub fn unset(&mut self, key: &str) {
        self.changes.insert(key.to_string(), None);
    }

    /// Forget any change to `key`; returns whether there was one.
    pub fn remove(&mut self, key: &str) -> bool {
        self.changes.remove(key).is_some()
    }

    pub fn clear(&mut self) {
        self.changes.clear();
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn contains(&self, key: &str) -> bool {
        self.changes.contains_key(key)
    }

    /// `None` if `key` has no change; `Some(None)` for a scheduled unset.
    pub fn check_value(&self, key: &str) -> Option<Option<&Value>> {
        self.changes.get(key).map(Option::as_ref)
    }

    /// Changes in key order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<&Value>)> {
        self.changes.iter().map(|(k, v)| (k.as_str(), v.as_ref()))
    }

    /// Owned copies of the changes, in key order.
    pub fn pending(&self) -> Vec<PendingChange> {
        self.changes
            .iter()
            .map(|(key, new_value)| PendingChange { key: key.clone(), new_value: new_value.clone() })
            .collect()
    }

    /// Apply every change to `target` in key order, stopping at the first
    /// failure.
    ///
    /// Changes applied before the failure stay in effect. With
    /// `remove_committed`, each applied change leaves the set, so after a
    /// failure only the failing key and the ones after it remain.
    pub fn commit_to<T: ChangeTarget + ?Sized>(&mut self, target: &T, remove_committed: bool) -> ConfResult<()> {
        let keys: Vec<String> = self.changes.keys().cloned().collect();

        for key in keys {
            let Some(change) = self.changes.get(&key) else {
                continue;
            };
            let result = match change {
                Some(value) => target.apply_set(&key, value),
                None => target.apply_unset(&key),
            };
            if let Err(e) = result {
                tracing::debug!(key = %key, error = %e, "Change set commit stopped");
                return Err(ConfError::CommitFailed { key, source: Box::new(e) });
            }
            if remove_committed {
                self.changes.remove(&key);
            }
        }
        Ok(())
    }

    /// Change set restoring the current values of this set's keys.
    ///
    /// Keys with no current value become unsets. This is a snapshot:
    /// writes made between building and committing it are not detected.
    pub fn reverse_from<T: ChangeTarget + ?Sized>(&self, target: &T) -> ConfResult<ChangeSet> {
        Self::from_current(self.changes.keys().map(String::as_str), target)
    }

    /// Change set holding the current values of `keys`.
    pub fn from_current<'a, I, T>(keys: I, target: &T) -> ConfResult<ChangeSet>
    where
        I: IntoIterator<Item = &'a str>,
        T: ChangeTarget + ?Sized,
    {
        let mut snapshot = ChangeSet::new();
        for key in keys {
            match target.current_value(key)? {
                Some(value) => snapshot.set(key, value),
                None => snapshot.unset(key),
            }
        }
        Ok(snapshot)
    }
}

impl<'a> IntoIterator for &'a ChangeSet {
    type Item = (&'a str, Option<&'a Value>);
    type IntoIter = Box<dyn Iterator<Item = Self::Item> + 'a>;

    fn into_iter(self) -> Self::IntoIter {
        Box::new(self.iter())
    }
}

//! In-memory key tree behind `LocalEngine`.
//!
//! Plain data, no locking. Directories are implied by the keys below them
//! plus any created explicitly. Schemas are ordinary values of type
//! `Schema` stored at their own keys, and a key picks up a default by
//! being associated with one.

use std::collections::{BTreeMap, BTreeSet};

use confcache_core::key::{self, child_toward, key_is_below, key_is_strictly_below, parent_dir};
use confcache_core::{ConfError, ConfResult, Entry, Schema, Value};

/// Keys, schema associations and write policy.
#[derive(Debug, Default)]
pub struct ValueTree {
    /// User-set values (schemas included)
    values: BTreeMap<String, Value>,
    /// Values that win over user settings and refuse writes
    mandatory: BTreeMap<String, Value>,
    /// key -> schema key
    schema_names: BTreeMap<String, String>,
    /// Directories created without any key below them
    dirs: BTreeSet<String>,
    /// Prefixes under which writes are refused
    read_only: Vec<String>,
}

impl ValueTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry for `key` as the engine reports it.
    pub fn entry(&self, key: &str, use_default: bool) -> Entry {
        let schema_name = self.schema_names.get(key).cloned();

        let mut entry = if let Some(value) = self.mandatory.get(key) {
            Entry::new(key, value.clone()).with_writable(false)
        } else if let Some(value) = self.values.get(key) {
            Entry::new(key, value.clone()).with_writable(self.is_writable(key))
        } else {
            let default = if use_default { self.schema_default(key) } else { None };
            let entry = match default {
                Some(value) => Entry::new(key, value).with_default(true),
                None => Entry::unset(key),
            };
            entry.with_writable(self.is_writable(key))
        };
        entry.schema_name = schema_name;
        entry
    }

    /// Default carried by the schema associated with `key`.
    pub fn schema_default(&self, key: &str) -> Option<Value> {
        let schema_key = self.schema_names.get(key)?;
        match self.values.get(schema_key)? {
            Value::Schema(schema) => schema.default_value.as_deref().cloned(),
            _ => None,
        }
    }

    pub fn is_writable(&self, key: &str) -> bool {
        !self.mandatory.contains_key(key) && !self.read_only.iter().any(|prefix| key_is_below(prefix, key))
    }

    /// Check the write policy for `key`.
    pub fn check_writable(&self, key: &str) -> ConfResult<()> {
        if self.mandatory.contains_key(key) {
            return Err(ConfError::Overridden { key: key.to_string() });
        }
        if self.read_only.iter().any(|prefix| key_is_below(prefix, key)) {
            return Err(ConfError::PermissionDenied { key: key.to_string() });
        }
        Ok(())
    }

    pub fn set(&mut self, key: &str, value: Value) -> ConfResult<()> {
        self.check_writable(key)?;
        self.values.insert(key.to_string(), value);
        Ok(())
    }

    /// Remove the user value of `key`; returns whether there was one.
    pub fn unset(&mut self, key: &str) -> ConfResult<bool> {
        self.check_writable(key)?;
        Ok(self.values.remove(key).is_some())
    }

    /// Remove every writable value at or below `key`.
    ///
    /// Returns the keys that lost a value (or schema association), sorted.
    pub fn recursive_unset(&mut self, key: &str, unset_schema_names: bool) -> Vec<String> {
        let doomed: Vec<String> = self
            .values
            .keys()
            .filter(|k| key_is_below(key, k) && self.is_writable(k))
            .cloned()
            .collect();
        for k in &doomed {
            self.values.remove(k);
        }

        let mut changed: BTreeSet<String> = doomed.into_iter().collect();
        if unset_schema_names {
            let dropped: Vec<String> = self.schema_names.keys().filter(|k| key_is_below(key, k)).cloned().collect();
            for k in dropped {
                self.schema_names.remove(&k);
                changed.insert(k);
            }
        }
        self.dirs.retain(|d| !key_is_strictly_below(key, d));
        changed.into_iter().collect()
    }

    pub fn install_schema(&mut self, schema_key: &str, schema: Schema) {
        self.values.insert(schema_key.to_string(), Value::Schema(Box::new(schema)));
    }

    pub fn associate_schema(&mut self, key: &str, schema_key: &str) {
        self.schema_names.insert(key.to_string(), schema_key.to_string());
    }

    pub fn set_mandatory(&mut self, key: &str, value: Value) {
        self.mandatory.insert(key.to_string(), value);
    }

    pub fn set_read_only(&mut self, prefix: &str) {
        self.read_only.push(prefix.to_string());
    }

    pub fn create_dir(&mut self, dir: &str) {
        if dir != key::ROOT {
            self.dirs.insert(dir.to_string());
        }
    }

    /// Every key with something to report: a value, a mandatory value or
    /// a schema association.
    fn known_keys(&self) -> BTreeSet<&str> {
        self.values
            .keys()
            .chain(self.mandatory.keys())
            .chain(self.schema_names.keys())
            .map(String::as_str)
            .collect()
    }

    /// Immediate child entries of `dir` that have a value, sorted by key.
    pub fn entries(&self, dir: &str) -> Vec<Entry> {
        self.known_keys()
            .into_iter()
            .filter(|k| *k != dir && parent_dir(k) == dir)
            .map(|k| self.entry(k, true))
            .filter(|e| e.value.is_some())
            .collect()
    }

    /// Immediate subdirectories of `dir`, sorted.
    pub fn subdirs(&self, dir: &str) -> Vec<String> {
        let keys = self.known_keys();
        let mut found = BTreeSet::new();

        for path in keys.iter().copied().chain(self.dirs.iter().map(String::as_str)) {
            if let Some(child) = child_toward(dir, path) {
                let is_key_itself = child == path && keys.contains(path) && !self.dirs.contains(path);
                if !is_key_itself {
                    found.insert(child);
                }
            }
        }
        found.into_iter().map(str::to_string).collect()
    }

    pub fn dir_exists(&self, dir: &str) -> bool {
        dir == key::ROOT
            || self.dirs.contains(dir)
            || self.known_keys().into_iter().any(|k| key_is_strictly_below(dir, k))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

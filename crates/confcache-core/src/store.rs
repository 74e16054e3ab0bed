//! Entry Store: the client-side cache of engine answers.
//!
//! Two structures live here:
//!
//! - **Entries**: absolute key -> cached `Entry` (including explicit
//!   "unset" answers). Callers always receive clones.
//! - **Completeness marks**: directories whose full set of immediate
//!   children has been fetched. A key missing from the entries map whose
//!   parent directory is marked complete is known not to exist, so it is
//!   answered without a round trip.
//!
//! A mark must never outlive a change below its directory; every
//! mutation path goes through `invalidate_*` so the invariant holds.

use hashbrown::{HashMap, HashSet};

use crate::key::{self, key_is_below, parent_dir};
use crate::value::Entry;

/// Answer of a cache lookup.
#[derive(Debug, Clone, PartialEq)]
pub enum CacheResult {
    /// The key is cached (possibly as an explicit unset)
    Hit(Entry),
    /// Not cached, but its directory is complete: the key does not exist
    NegativeHit,
    /// Unknown; the engine must be asked
    Miss,
}

impl CacheResult {
    pub fn is_miss(&self) -> bool {
        matches!(self, CacheResult::Miss)
    }
}

/// Keyed entry cache plus completeness tracking.
#[derive(Debug, Default)]
pub struct EntryStore {
    /// Cached engine answers by absolute key
    entries: HashMap<String, Entry>,
    /// Directories whose immediate children are all cached
    complete_dirs: HashSet<String>,
}

impl EntryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look `key` up without touching the engine.
    pub fn lookup(&self, key: &str) -> CacheResult {
        if let Some(entry) = self.entries.get(key) {
            return CacheResult::Hit(entry.clone());
        }
        if key != key::ROOT && self.complete_dirs.contains(parent_dir(key)) {
            tracing::trace!(key, "Negative cache hit");
            return CacheResult::NegativeHit;
        }
        CacheResult::Miss
    }

    /// Borrowing lookup for internal callers that copy selectively.
    pub(crate) fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    /// Insert or refresh an entry; returns whether the visible state changed.
    ///
    /// An entry equal to the cached one (value and default flag) still
    /// replaces the stored metadata but reports `false`, so no listener
    /// is woken. With `preserve_schema_name`, a cached schema name is
    /// carried onto a replacement that lacks one (remote pushes do not
    /// always resend it).
    pub fn insert_or_update(&mut self, mut entry: Entry, preserve_schema_name: bool) -> bool {
        match self.entries.get_mut(&entry.key) {
            Some(existing) => {
                let changed = !existing.same_state(&entry);
                if preserve_schema_name && entry.schema_name.is_none() {
                    entry.schema_name = existing.schema_name.take();
                }
                if changed {
                    tracing::trace!(key = %entry.key, "Updating value in the cache");
                } else {
                    tracing::trace!(key = %entry.key, "Value hasn't actually changed");
                }
                *existing = entry;
                changed
            }
            None => {
                tracing::trace!(key = %entry.key, "Added value to the cache");
                self.entries.insert(entry.key.clone(), entry);
                true
            }
        }
    }

    /// Drop one cached entry, returning it.
    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        self.entries.remove(key)
    }

    /// Record that every immediate child of `dir` is cached.
    pub fn mark_complete(&mut self, dir: &str) {
        tracing::trace!(dir, "Mark as fully cached");
        self.complete_dirs.insert(dir.to_string());
    }

    pub fn is_complete(&self, dir: &str) -> bool {
        self.complete_dirs.contains(dir)
    }

    /// Clear the marks of every directory containing `key`.
    ///
    /// Called for any write to `key`: the directories above it can no
    /// longer claim a complete view.
    pub fn invalidate_marks_above(&mut self, key: &str) {
        for dir in key::ancestors(key) {
            if self.complete_dirs.remove(dir) {
                tracing::trace!(dir, "No longer fully cached");
            }
        }
    }

    /// Remove entries and marks at or below `dir`.
    ///
    /// Returns the keys of the evicted entries.
    pub fn invalidate_prefix(&mut self, dir: &str) -> Vec<String> {
        self.invalidate_prefix_except(dir, |_| false)
    }

    /// Like [`invalidate_prefix`](Self::invalidate_prefix), keeping any
    /// entry or mark for which `keep` returns true.
    ///
    /// Used when a watch is dropped while another watched directory still
    /// covers part of the subtree.
    pub fn invalidate_prefix_except<F>(&mut self, dir: &str, keep: F) -> Vec<String>
    where
        F: Fn(&str) -> bool,
    {
        let evicted: Vec<String> = self
            .entries
            .keys()
            .filter(|k| key_is_below(dir, k) && !keep(k))
            .cloned()
            .collect();
        for k in &evicted {
            self.entries.remove(k);
        }

        self.complete_dirs.retain(|d| {
            let drop = key_is_below(dir, d) && !keep(d);
            if drop {
                tracing::trace!(dir = %d, "No longer fully cached");
            }
            !drop
        });

        evicted
    }

    /// Cached entries that are immediate children of `dir`, sorted by key.
    pub fn entries_in_dir(&self, dir: &str) -> Vec<Entry> {
        let mut results: Vec<Entry> = self
            .entries
            .values()
            .filter(|e| e.key != dir && parent_dir(&e.key) == dir)
            .cloned()
            .collect();
        results.sort_by(|a, b| a.key.cmp(&b.key));
        results
    }

    /// Drop everything. Callers hold the store exclusively, so no
    /// partially cleared state is ever observable.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.complete_dirs.clear();
    }

    /// Number of cached entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of directories marked complete.
    pub fn complete_count(&self) -> usize {
        self.complete_dirs.len()
    }
}

//! Directory Registry: reference-counted directory watches.
//!
//! Watched directories are kept sorted by path, so a directory's
//! descendants are one contiguous range starting at `dir + "/"` and its
//! ancestors are found by walking parent paths. That makes the overlap
//! scan a pair of bounded lookups instead of a pass over every watch.
//!
//! Invariant: within any ancestor/descendant chain of watched
//! directories at most one holds a live remote subscription, and it is
//! the outermost one that could acquire it. Descendants ride on it.
//!
//! The registry never calls the engine itself; subscription traffic goes
//! through the [`Subscriber`] seam so the algorithm is testable alone.

use std::collections::BTreeMap;
use std::ops::Bound;

use crate::engine::SubscriptionId;
use crate::error::{ConfError, ConfResult};
use crate::key::{self, descendant_prefix};

/// Acquires and releases remote directory subscriptions.
pub trait Subscriber {
    fn subscribe(&mut self, dir: &str) -> ConfResult<SubscriptionId>;
    fn unsubscribe(&mut self, id: SubscriptionId);
}

/// One watched directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchedDirectory {
    pub path: String,
    /// Live engine subscription, `None` when covered by an ancestor
    /// (or when acquiring one failed)
    pub remote_subscription: Option<SubscriptionId>,
    /// Outstanding `add` calls
    pub ref_count: u32,
}

impl WatchedDirectory {
    fn new(path: &str) -> Self {
        Self { path: path.to_string(), remote_subscription: None, ref_count: 1 }
    }
}

/// Result of [`DirectoryRegistry::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddOutcome {
    /// First reference; the directory was inserted
    Inserted,
    /// Already watched; reference count bumped
    Referenced { ref_count: u32 },
}

/// Result of [`DirectoryRegistry::release`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The directory was not watched
    NotWatched,
    /// Other references remain
    StillReferenced { ref_count: u32 },
    /// Last reference dropped; the directory is gone and its
    /// subscription (if any) released
    Removed,
}

/// Sorted set of watched directories.
#[derive(Debug, Default)]
pub struct DirectoryRegistry {
    dirs: BTreeMap<String, WatchedDirectory>,
}

impl DirectoryRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Watch `dir`, or add a reference if already watched.
    ///
    /// A new directory free-rides on an ancestor's live subscription when
    /// there is one. Otherwise it subscribes, and only once that succeeds
    /// are the subscriptions of watched descendants torn down (their
    /// coverage is now subsumed). If subscribing fails, the directory is
    /// still inserted, without a subscription, and the error returned.
    pub fn add<S: Subscriber + ?Sized>(&mut self, dir: &str, sub: &mut S) -> ConfResult<AddOutcome> {
        if let Some(existing) = self.dirs.get_mut(dir) {
            existing.ref_count += 1;
            return Ok(AddOutcome::Referenced { ref_count: existing.ref_count });
        }

        let mut watched = WatchedDirectory::new(dir);
        let result = match self.covering_subscriber(dir) {
            Some(ancestor) => {
                tracing::debug!(dir, ancestor, "Directory covered by an existing watch");
                Ok(AddOutcome::Inserted)
            }
            None => {
                tracing::trace!(dir, "REMOTE: Adding notify to engine");
                match sub.subscribe(dir) {
                    Ok(id) => {
                        watched.remote_subscription = Some(id);
                        self.release_descendants(dir, sub);
                        Ok(AddOutcome::Inserted)
                    }
                    Err(e) => Err(ConfError::SubscriptionFailed {
                        dir: dir.to_string(),
                        source: Box::new(e),
                    }),
                }
            }
        };

        self.dirs.insert(dir.to_string(), watched);
        result
    }

    /// Drop one reference to `dir`.
    ///
    /// At zero the directory is deleted and its subscription released.
    /// Follow with [`resubscribe_uncovered`](Self::resubscribe_uncovered)
    /// once the caller has purged its cache, so directories that deferred
    /// to this one acquire their own subscriptions.
    pub fn release<S: Subscriber + ?Sized>(&mut self, dir: &str, sub: &mut S) -> ReleaseOutcome {
        let Some(watched) = self.dirs.get_mut(dir) else {
            tracing::warn!(dir, "Directory was not being monitored");
            return ReleaseOutcome::NotWatched;
        };

        watched.ref_count = watched.ref_count.saturating_sub(1);
        if watched.ref_count > 0 {
            return ReleaseOutcome::StillReferenced { ref_count: watched.ref_count };
        }

        if let Some(removed) = self.dirs.remove(dir) {
            if let Some(id) = removed.remote_subscription {
                tracing::trace!(dir, "REMOTE: Removing notify from engine");
                sub.unsubscribe(id);
            }
        }
        ReleaseOutcome::Removed
    }

    /// Give every uncovered directory without a subscription its own.
    ///
    /// Walks directories in path order, so an ancestor that subscribes is
    /// seen before its descendants, which then stay covered. All
    /// directories are attempted; the first failure is returned. Returns
    /// the number of subscriptions acquired.
    pub fn resubscribe_uncovered<S: Subscriber + ?Sized>(&mut self, sub: &mut S) -> ConfResult<usize> {
        let candidates: Vec<String> = self
            .dirs
            .values()
            .filter(|w| w.remote_subscription.is_none())
            .map(|w| w.path.clone())
            .collect();

        let mut acquired = 0;
        let mut first_error = None;

        for dir in candidates {
            let still_bare = self.dirs.get(&dir).map_or(false, |w| w.remote_subscription.is_none());
            if !still_bare || self.covering_subscriber(&dir).is_some() {
                continue;
            }

            tracing::trace!(dir = %dir, "REMOTE: Adding notify to engine");
            match sub.subscribe(&dir) {
                Ok(id) => {
                    if let Some(w) = self.dirs.get_mut(&dir) {
                        w.remote_subscription = Some(id);
                    }
                    self.release_descendants(&dir, sub);
                    acquired += 1;
                }
                Err(e) => {
                    tracing::warn!(dir = %dir, error = %e, "Failed to re-acquire directory subscription");
                    if first_error.is_none() {
                        first_error = Some(ConfError::SubscriptionFailed { dir, source: Box::new(e) });
                    }
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(acquired),
        }
    }

    /// True iff `key` is a watched directory or lies under one.
    pub fn covers(&self, key: &str) -> bool {
        self.dirs.contains_key(key) || key::ancestors(key).any(|dir| self.dirs.contains_key(dir))
    }

    pub fn is_watched(&self, dir: &str) -> bool {
        self.dirs.contains_key(dir)
    }

    pub fn get(&self, dir: &str) -> Option<&WatchedDirectory> {
        self.dirs.get(dir)
    }

    /// Watched directories in path order.
    pub fn iter(&self) -> impl Iterator<Item = &WatchedDirectory> {
        self.dirs.values()
    }

    /// Number of directories holding a live subscription.
    pub fn live_subscriptions(&self) -> usize {
        self.dirs.values().filter(|w| w.remote_subscription.is_some()).count()
    }

    pub fn len(&self) -> usize {
        self.dirs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dirs.is_empty()
    }

    /// Release every subscription and forget every directory.
    pub fn release_all<S: Subscriber + ?Sized>(&mut self, sub: &mut S) {
        for (dir, watched) in std::mem::take(&mut self.dirs) {
            if let Some(id) = watched.remote_subscription {
                tracing::trace!(dir = %dir, "REMOTE: Removing notify from engine");
                sub.unsubscribe(id);
            }
        }
    }

    /// Nearest proper ancestor of `dir` holding a live subscription.
    fn covering_subscriber<'a>(&self, dir: &'a str) -> Option<&'a str> {
        key::ancestors(dir).find(|ancestor| {
            self.dirs.get(*ancestor).map_or(false, |w| w.remote_subscription.is_some())
        })
    }

    /// Tear down subscriptions held strictly below `dir`.
    fn release_descendants<S: Subscriber + ?Sized>(&mut self, dir: &str, sub: &mut S) {
        let prefix = descendant_prefix(dir);
        let range = self
            .dirs
            .range_mut::<str, _>((Bound::Included(prefix.as_str()), Bound::Unbounded))
            .take_while(|(path, _)| path.starts_with(&prefix));

        for (path, watched) in range {
            if path == dir {
                continue;
            }
            if let Some(id) = watched.remote_subscription.take() {
                tracing::debug!(dir = %path, ancestor = dir, "Subscription subsumed by ancestor watch");
                sub.unsubscribe(id);
            }
        }
    }
}

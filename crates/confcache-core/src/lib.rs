//! ConfCache Core: client-side configuration cache and change dispatcher
//!
//! Sits between application code and a remote configuration engine and
//! keeps a coherent local view of the directories the application
//! watches.
//!
//! # Architecture
//!
//! - **Read path**: answer from the entry cache, including "known absent"
//!   answers for fully fetched directories; fetch from the engine on miss
//! - **Write path**: engine first, then drop the cached entry and any
//!   completeness mark above it
//! - **Watches**: reference-counted directories, one remote subscription
//!   per ancestor chain
//! - **Notifications**: changed keys are queued, then flushed once per
//!   dispatch tick in sorted order, each distinct key delivered once
//! - **Change sets**: client-side write batches with fail-fast commit and
//!   snapshot reversal
//!
//! # No Transport
//!
//! This crate knows nothing about daemons, wire formats or storage.
//! Engines implement the [`Engine`] trait; an in-process engine lives in
//! a separate crate (confcache-local).

pub mod changeset;
pub mod client;
pub mod config;
pub mod engine;
pub mod error;
pub mod key;
pub mod notify;
pub mod registry;
pub mod store;
pub mod value;

// Re-export key types for convenience
pub use changeset::{ChangeSet, ChangeTarget, PendingChange};
pub use client::{Client, ErrorHandler, Listener, UnreturnedExt, ValueChangedHandler};
pub use config::{Config, PreloadType};
pub use engine::{Engine, NotifyCallback, SubscriptionId, UnsetFlags};
pub use error::{set_global_error_handler, ConfError, ConfResult, ErrorHandling, GlobalErrorHandler};
pub use notify::{HandlerId, ListenerId};
pub use registry::WatchedDirectory;
pub use store::CacheResult;
pub use value::{Entry, FromValue, Schema, Value, ValueType};

//! In-process configuration engine for ConfCache
//!
//! Implements the core crate's `Engine` trait over an in-memory key tree,
//! for hosts that keep their configuration in-process and for exercising
//! a `Client` end to end.
//!
//! # Features
//!
//! - Values, explicit directories and schema defaults
//! - Write policy: read-only prefixes (`PermissionDenied`) and mandatory
//!   keys (`Overridden`)
//! - Directory subscriptions fired synchronously by every write, outside
//!   the engine's locks
//! - Fault injection and call counters for tests

pub mod engine;
pub mod tree;

pub use engine::LocalEngine;
pub use tree::ValueTree;

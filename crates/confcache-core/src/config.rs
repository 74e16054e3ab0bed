//! Configuration management for ConfCache clients
//!
//! Provides presets for the two usual kinds of host (an interactive
//! application reacting to changes, a batch tool making bulk edits) and
//! a `validate()` check for hand-built configurations.

use serde::{Deserialize, Serialize};

use crate::error::ErrorHandling;

/// How much of a directory `add_dir`/`preload` fetches up front.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PreloadType {
    /// Fetch nothing; entries are cached on first read
    None,
    /// Fetch the immediate entries of the directory
    #[default]
    OneLevel,
    /// Fetch the directory and every subdirectory below it
    Recursive,
}

/// ConfCache client configuration with host presets
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Preload used by `add_dir` when the caller passes none
    pub default_preload: PreloadType,
    /// Which errors are reported beyond being returned
    pub error_handling: ErrorHandling,
    /// Deepest subdirectory level a recursive preload descends to
    pub max_preload_depth: usize,
    /// Tasks handled per `dispatch_pending` call (0 = unlimited)
    pub dispatch_budget: usize,
}

impl Config {
    /// Interactive application: one-level preload, unreturned errors logged
    pub fn interactive() -> Self {
        Self {
            default_preload: PreloadType::OneLevel,
            error_handling: ErrorHandling::Unreturned,
            max_preload_depth: 16,
            dispatch_budget: 256,
        }
    }

    /// Batch tool: no preload, every error reported, drain fully
    pub fn batch() -> Self {
        Self {
            default_preload: PreloadType::None,
            error_handling: ErrorHandling::All,
            max_preload_depth: 64,
            dispatch_budget: 0,
        }
    }

    /// Validate all configuration parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.max_preload_depth == 0 {
            return Err("max_preload_depth must be > 0".into());
        }
        if self.max_preload_depth > 1024 {
            return Err("max_preload_depth must be <= 1024".into());
        }
        if self.default_preload == PreloadType::Recursive && self.max_preload_depth < 2 {
            return Err("recursive default_preload needs max_preload_depth >= 2".into());
        }
        Ok(())
    }

    /// Effective per-call task limit.
    pub(crate) fn task_limit(&self) -> usize {
        if self.dispatch_budget == 0 {
            usize::MAX
        } else {
            self.dispatch_budget
        }
    }
}

impl Default for Config {
    fn default() -> Self { Self::interactive() }
}

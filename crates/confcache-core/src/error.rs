//! Error types for ConfCache operations
//!
//! All client, registry and engine failures are represented by the
//! ConfError enum. Engine errors are propagated verbatim; the client only
//! adds `InvalidKey`/`InvalidValue` (rejected before any engine call) and
//! the commit/subscription wrappers that name the key or directory at fault.

use std::sync::Arc;

use parking_lot::RwLock;
use thiserror::Error;

use crate::value::ValueType;

/// ConfCache error types with detailed context
#[derive(Debug, Clone, Error)]
pub enum ConfError {
    /// Key or directory does not exist where existence is required
    #[error("No such key or directory: {key}")]
    NotFound {
        /// The absent key
        key: String,
    },

    /// Stored value has a different type than the accessor asked for
    #[error("Expected `{expected}' got `{found}' for key {key}")]
    TypeMismatch {
        /// Key whose value was checked
        key: String,
        /// Type the caller asked for
        expected: ValueType,
        /// Type actually stored
        found: ValueType,
    },

    /// The configuration engine could not be reached or failed internally
    #[error("Configuration engine unavailable: {message}")]
    EngineUnavailable {
        /// Human-readable description from the engine
        message: String,
    },

    /// Write refused because the key is not writable for this user
    #[error("Permission denied writing {key}")]
    PermissionDenied {
        /// Key the write was aimed at
        key: String,
    },

    /// Write accepted but shadowed by a mandatory setting
    #[error("Value for {key} is overridden by a mandatory setting")]
    Overridden {
        /// Key the write was aimed at
        key: String,
    },

    /// No configuration source accepts writes for this key
    #[error("No writable database available for {key}")]
    NoWritableDatabase {
        /// Key the write was aimed at
        key: String,
    },

    /// Malformed key or directory path
    #[error("Invalid key `{key}': {reason}")]
    InvalidKey {
        /// The rejected path
        key: String,
        /// Which rule it broke
        reason: String,
    },

    /// Malformed value (heterogeneous list, nested list, ...)
    #[error("Invalid value: {reason}")]
    InvalidValue {
        /// Which rule it broke
        reason: String,
    },

    /// A change-set commit stopped at this key
    #[error("Failed to commit change to {key}: {source}")]
    CommitFailed {
        /// First key whose change could not be applied
        key: String,
        /// The underlying failure
        #[source]
        source: Box<ConfError>,
    },

    /// The engine refused a directory subscription
    #[error("Failed to watch {dir}: {source}")]
    SubscriptionFailed {
        /// Directory that stays registered without a remote subscription
        dir: String,
        /// The underlying failure
        #[source]
        source: Box<ConfError>,
    },
}

impl ConfError {
    /// Errors the default reporting path stays silent about.
    ///
    /// They usually reflect site policy rather than a fault.
    pub fn is_benign(&self) -> bool {
        match self {
            ConfError::Overridden { .. } | ConfError::NoWritableDatabase { .. } => true,
            ConfError::CommitFailed { source, .. } => source.is_benign(),
            _ => false,
        }
    }

    /// The key or directory this error is about, if any.
    pub fn key(&self) -> Option<&str> {
        match self {
            ConfError::NotFound { key }
            | ConfError::TypeMismatch { key, .. }
            | ConfError::PermissionDenied { key }
            | ConfError::Overridden { key }
            | ConfError::NoWritableDatabase { key }
            | ConfError::InvalidKey { key, .. }
            | ConfError::CommitFailed { key, .. } => Some(key),
            ConfError::SubscriptionFailed { dir, .. } => Some(dir),
            ConfError::EngineUnavailable { .. } | ConfError::InvalidValue { .. } => None,
        }
    }

    pub(crate) fn type_mismatch(key: &str, expected: ValueType, found: ValueType) -> Self {
        ConfError::TypeMismatch { key: key.to_string(), expected, found }
    }
}

/// Result type alias for ConfCache operations
pub type ConfResult<T> = Result<T, ConfError>;

/// How a client reports errors beyond returning them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorHandling {
    /// Only return errors
    None,
    /// Report errors the caller explicitly declined to inspect
    #[default]
    Unreturned,
    /// Report every error
    All,
}

/// Process-wide error handler type.
pub type GlobalErrorHandler = Arc<dyn Fn(&ConfError) + Send + Sync>;

static GLOBAL_ERROR_HANDLER: RwLock<Option<GlobalErrorHandler>> = parking_lot::const_rwlock(None);

/// Install (or with `None`, remove) the process-wide error handler.
///
/// When installed it replaces the default logging path for reported
/// errors. It observes errors only; it cannot retry or swallow them.
pub fn set_global_error_handler(handler: Option<GlobalErrorHandler>) {
    *GLOBAL_ERROR_HANDLER.write() = handler;
}

/// Report an error through the global handler, or log it.
pub(crate) fn report_globally(error: &ConfError, quiet_if_benign: bool) {
    let handler = GLOBAL_ERROR_HANDLER.read().clone();
    match handler {
        Some(handler) => handler(error),
        None => {
            if quiet_if_benign && error.is_benign() {
                return;
            }
            tracing::error!(error = %error, "ConfCache error");
        }
    }
}

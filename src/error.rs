//! Error types for the module lifecycle core.
//!
//! `ModuleError` is the single error enum returned by construction, accessors
//! and the home-thread hand-off. It follows three categories:
//!
//! 1. **Construction errors** - `Configuration`, `UnresolvedConnector`,
//!    `CapabilityMismatch`, `UnknownHook`, `Create`
//!    - Raised while building a module instance; no instance is produced.
//!    - Recovery: fix the module configuration or the registry wiring.
//!
//! 2. **Lifecycle errors** - `Hook`, `WrongThread`, `HandoffOnHomeThread`, `HomeThreadGone`
//!    - Hook errors only escape `trigger()` for `run`, `stop`, `lock`,
//!      `unlock` and `runlock`. Activation and deactivation failures are
//!      reported as a failed [`TransitionOutcome`](crate::state_machine::TransitionOutcome)
//!      instead and never show up here.
//!
//! 3. **Accessor errors** - `UnknownOption`, `OptionType`, `UnknownConnector`,
//!    `ConnectorUnavailable`, `ConnectorType`, `InvalidStatusVariables`
//!
//! `NotificationError` is separate: notification problems are logged by the
//! notifier and never returned to the caller.

use crate::state::LifecycleEvent;
use std::thread::ThreadId;
use thiserror::Error;

/// Convenience alias for results using the module error type.
pub type AppResult<T> = std::result::Result<T, ModuleError>;

/// Primary error type for module construction and lifecycle control.
#[derive(Error, Debug)]
pub enum ModuleError {
    /// A config option was missing (with `missing = error`), failed its check,
    /// or could not be converted/constructed.
    ///
    /// **Error Type**: Permanent - the module is never constructed.
    #[error("Module '{module}': configuration error in option '{option}': {reason}")]
    Configuration {
        /// Module instance name.
        module: String,
        /// Offending option name.
        option: String,
        /// Human readable reason.
        reason: String,
    },

    /// A required connector had no resolved target at construction time.
    #[error("Module '{module}': required connector '{connector}' ({capability}) is not connected")]
    UnresolvedConnector {
        /// Module instance name.
        module: String,
        /// Connector name.
        connector: String,
        /// Declared capability.
        capability: String,
    },

    /// A connector was bound to a target exposing a different capability.
    #[error(
        "Module '{module}': connector '{connector}' requires '{expected}' but target '{target}' provides '{found}'"
    )]
    CapabilityMismatch {
        /// Module instance name.
        module: String,
        /// Connector name.
        connector: String,
        /// Declared capability.
        expected: String,
        /// Name of the bound target module.
        target: String,
        /// Capability the target provides.
        found: String,
    },

    /// An extra hook was registered under a name that is not a hook point.
    #[error("Module '{module}': unknown hook '{hook}'")]
    UnknownHook {
        /// Module instance name.
        module: String,
        /// Hook name as given by the host.
        hook: String,
    },

    /// `Module::create` failed after options were bound.
    #[error("Module '{module}': failed to create instance: {source}")]
    Create {
        /// Module instance name.
        module: String,
        /// Underlying error from the module implementation.
        #[source]
        source: anyhow::Error,
    },

    /// A hook for a non-lifecycle event (`run`, `stop`, `lock`, ...) failed.
    #[error("Module '{module}': error during {event}: {source}")]
    Hook {
        /// Module instance name.
        module: String,
        /// Event whose hook failed.
        event: LifecycleEvent,
        /// Error raised by the hook.
        #[source]
        source: anyhow::Error,
    },

    /// `trigger()` was called away from the module's home thread.
    #[error("Module '{module}': transition requested from thread {current:?}, home thread is {home:?}")]
    WrongThread {
        /// Module instance name.
        module: String,
        /// Home thread of the module.
        home: ThreadId,
        /// Calling thread.
        current: ThreadId,
    },

    /// A blocking hand-off was attempted from the home thread itself.
    #[error("Module '{module}': blocking hand-off called on the home thread")]
    HandoffOnHomeThread {
        /// Module instance name.
        module: String,
    },

    /// The home loop has stopped; the module can no longer be reached.
    #[error("Module '{0}': home thread is gone")]
    HomeThreadGone(String),

    /// `spawn()` was called for a module type that is not threaded.
    #[error("Module '{0}' is not threaded; drive it from the host thread")]
    NotThreaded(String),

    /// `build()` was called for a threaded module type.
    #[error("Module '{0}' is threaded; construct it with spawn()")]
    Threaded(String),

    /// The OS refused to start a home thread.
    #[error("Failed to spawn home thread: {0}")]
    Spawn(#[from] std::io::Error),

    /// No config option with this name was declared.
    #[error("Module '{module}': unknown config option '{option}'")]
    UnknownOption {
        /// Module instance name.
        module: String,
        /// Requested option name.
        option: String,
    },

    /// A bound option value does not deserialize into the requested type.
    #[error("Module '{module}': option '{option}' has unexpected type: {source}")]
    OptionType {
        /// Module instance name.
        module: String,
        /// Requested option name.
        option: String,
        /// Deserialization error.
        #[source]
        source: serde_json::Error,
    },

    /// No connector with this name was declared.
    #[error("Module '{module}': unknown connector '{connector}'")]
    UnknownConnector {
        /// Module instance name.
        module: String,
        /// Requested connector name.
        connector: String,
    },

    /// The connector slot is empty or its target has been dropped.
    #[error("Module '{module}': connector '{connector}' is not connected")]
    ConnectorUnavailable {
        /// Module instance name.
        module: String,
        /// Connector name.
        connector: String,
    },

    /// The connected target is not of the requested type.
    #[error("Module '{module}': connector '{connector}' target is not a {requested}")]
    ConnectorType {
        /// Module instance name.
        module: String,
        /// Connector name.
        connector: String,
        /// Requested Rust type name.
        requested: &'static str,
    },

    /// A status variable replacement was not a mapping.
    #[error("Module '{module}': status variables must be a mapping, got {found}")]
    InvalidStatusVariables {
        /// Module instance name.
        module: String,
        /// JSON type that was passed instead.
        found: &'static str,
    },

    /// Host configuration could not be loaded.
    #[error("Host configuration error: {0}")]
    HostConfig(#[from] figment::Error),

    /// Host configuration loaded but is semantically invalid.
    #[error("Host configuration validation error: {0}")]
    InvalidHostConfig(String),
}

impl ModuleError {
    /// Whether this error was raised while constructing an instance.
    pub fn is_construction_error(&self) -> bool {
        matches!(
            self,
            ModuleError::Configuration { .. }
                | ModuleError::UnresolvedConnector { .. }
                | ModuleError::CapabilityMismatch { .. }
                | ModuleError::UnknownHook { .. }
                | ModuleError::Create { .. }
        )
    }
}

/// Problems with a notification payload. Logged locally, never returned.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum NotificationError {
    /// Title was empty or whitespace only.
    #[error("{kind} message title must not be empty")]
    EmptyTitle {
        /// "pop-up" or "balloon".
        kind: &'static str,
    },
}

/// JSON type name for error messages.
pub(crate) fn json_type_name(value: &serde_json::Value) -> &'static str {
    match value {
        serde_json::Value::Null => "null",
        serde_json::Value::Bool(_) => "bool",
        serde_json::Value::Number(_) => "number",
        serde_json::Value::String(_) => "string",
        serde_json::Value::Array(_) => "array",
        serde_json::Value::Object(_) => "object",
    }
}

//! Lifecycle states, events and the fixed transition table.
//!
//! Every module instance moves through the same four states:
//!
//! ```text
//!                 activate
//!  deactivated ──────────────> idle <────── unlock ──────┐
//!       ^                      │  ^                       │
//!       │                  run │  │ stop                  │
//!       │                      v  │                       │
//!       │                     running ──── lock ────> locked
//!       │                                   <── runlock ──┘
//!       └──────────── deactivate (from idle | running | locked)
//! ```
//!
//! The table is a `const` and shared by every module type. There are no
//! implicit transitions: anything not listed in [`TRANSITIONS`] is rejected.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// Lifecycle state of a module instance.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleState {
    /// Constructed but not active. Initial state.
    #[default]
    Deactivated,
    /// Active and ready for work.
    Idle,
    /// Active and busy.
    Running,
    /// Active and reserved by another party.
    Locked,
}

impl ModuleState {
    /// All states, in declaration order.
    pub const ALL: [ModuleState; 4] = [
        ModuleState::Deactivated,
        ModuleState::Idle,
        ModuleState::Running,
        ModuleState::Locked,
    ];

    /// Lowercase name as used in logs and on the wire.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleState::Deactivated => "deactivated",
            ModuleState::Idle => "idle",
            ModuleState::Running => "running",
            ModuleState::Locked => "locked",
        }
    }

    /// Whether the module is active (any state other than `deactivated`).
    pub fn is_active(&self) -> bool {
        !matches!(self, ModuleState::Deactivated)
    }
}

impl fmt::Display for ModuleState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A named lifecycle event that may move a module between states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LifecycleEvent {
    /// `deactivated -> idle`
    Activate,
    /// `idle | running | locked -> deactivated`
    Deactivate,
    /// `idle -> running`
    Run,
    /// `running -> idle`
    Stop,
    /// `idle | running -> locked`
    Lock,
    /// `locked -> idle`
    Unlock,
    /// `locked -> running`
    Runlock,
}

impl LifecycleEvent {
    /// All events, in declaration order.
    pub const ALL: [LifecycleEvent; 7] = [
        LifecycleEvent::Activate,
        LifecycleEvent::Deactivate,
        LifecycleEvent::Run,
        LifecycleEvent::Stop,
        LifecycleEvent::Lock,
        LifecycleEvent::Unlock,
        LifecycleEvent::Runlock,
    ];

    /// Lowercase event name.
    pub fn as_str(&self) -> &'static str {
        match self {
            LifecycleEvent::Activate => "activate",
            LifecycleEvent::Deactivate => "deactivate",
            LifecycleEvent::Run => "run",
            LifecycleEvent::Stop => "stop",
            LifecycleEvent::Lock => "lock",
            LifecycleEvent::Unlock => "unlock",
            LifecycleEvent::Runlock => "runlock",
        }
    }

    /// Destination state when this event fires from `source`, if the edge exists.
    pub fn destination(&self, source: ModuleState) -> Option<ModuleState> {
        TRANSITIONS
            .iter()
            .find(|(event, src, _)| event == self && *src == source)
            .map(|(_, _, dst)| *dst)
    }

    /// Activation and deactivation contain hook failures instead of propagating them.
    pub fn is_guarded(&self) -> bool {
        matches!(self, LifecycleEvent::Activate | LifecycleEvent::Deactivate)
    }

    /// Noun used in log lines ("activation", "deactivation", ...).
    pub fn noun(&self) -> &'static str {
        match self {
            LifecycleEvent::Activate => "activation",
            LifecycleEvent::Deactivate => "deactivation",
            LifecycleEvent::Run => "run",
            LifecycleEvent::Stop => "stop",
            LifecycleEvent::Lock => "lock",
            LifecycleEvent::Unlock => "unlock",
            LifecycleEvent::Runlock => "runlock",
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LifecycleEvent {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        LifecycleEvent::ALL
            .iter()
            .find(|event| event.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Unknown lifecycle event '{}'", s))
    }
}

/// The fixed transition table: `(event, source, destination)`.
pub const TRANSITIONS: [(LifecycleEvent, ModuleState, ModuleState); 10] = [
    (LifecycleEvent::Activate, ModuleState::Deactivated, ModuleState::Idle),
    (LifecycleEvent::Deactivate, ModuleState::Idle, ModuleState::Deactivated),
    (LifecycleEvent::Deactivate, ModuleState::Running, ModuleState::Deactivated),
    (LifecycleEvent::Deactivate, ModuleState::Locked, ModuleState::Deactivated),
    (LifecycleEvent::Run, ModuleState::Idle, ModuleState::Running),
    (LifecycleEvent::Stop, ModuleState::Running, ModuleState::Idle),
    (LifecycleEvent::Lock, ModuleState::Idle, ModuleState::Locked),
    (LifecycleEvent::Lock, ModuleState::Running, ModuleState::Locked),
    (LifecycleEvent::Unlock, ModuleState::Locked, ModuleState::Idle),
    (LifecycleEvent::Runlock, ModuleState::Locked, ModuleState::Running),
];

/// Where a hook attaches in a transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    /// Runs first (`onbefore<event>`).
    Before(LifecycleEvent),
    /// Runs second, before the state is committed (`on<event>`).
    On(LifecycleEvent),
}

impl HookPoint {
    /// The event this hook point belongs to.
    pub fn event(&self) -> LifecycleEvent {
        match self {
            HookPoint::Before(event) | HookPoint::On(event) => *event,
        }
    }
}

impl fmt::Display for HookPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookPoint::Before(event) => write!(f, "onbefore{}", event),
            HookPoint::On(event) => write!(f, "on{}", event),
        }
    }
}

impl FromStr for HookPoint {
    type Err = String;

    /// Accepts `onbefore<event>`, `on<event>` and a bare `<event>` (same as `on<event>`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(event) = s.strip_prefix("onbefore") {
            return event
                .parse()
                .map(HookPoint::Before)
                .map_err(|_| format!("Unknown hook '{}'", s));
        }
        let event = s.strip_prefix("on").unwrap_or(s);
        event
            .parse()
            .map(HookPoint::On)
            .map_err(|_| format!("Unknown hook '{}'", s))
    }
}

/// A committed (or about to be committed) transition.
///
/// Published to subscribers after the state changed. Receivers get their own
/// clone; nothing can mutate a payload once it is sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StateChange {
    /// Name of the module instance.
    pub module: Arc<str>,
    /// Event that fired.
    pub event: LifecycleEvent,
    /// State before the transition.
    pub source: ModuleState,
    /// State after the transition.
    pub destination: ModuleState,
}

impl fmt::Display for StateChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} ({} -> {})",
            self.module, self.event, self.source, self.destination
        )
    }
}

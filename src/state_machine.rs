//! The module lifecycle state machine.
//!
//! `ModuleStateMachine<T>` owns the current state and the hooks, and runs a
//! transition against a hook target `T` (the module instance). A transition
//! runs, in order:
//!
//! 1. the `onbefore<event>` hooks,
//! 2. the `on<event>` hooks,
//! 3. the state mutation,
//! 4. delivery of the [`StateChange`] to every subscriber.
//!
//! Hooks registered at the same point run in registration order. Errors in
//! steps 1-2 abort the transition before the state changes. For `activate`
//! and `deactivate` the error is logged and returned as
//! [`TransitionOutcome::Failed`]; for every other event it propagates as
//! [`ModuleError::Hook`].
//!
//! The machine is synchronous and never yields mid-transition. It has no
//! notion of threads; the home-thread rule is enforced by
//! [`ModuleCore`](crate::core::ModuleCore).

use crate::error::{AppResult, ModuleError};
use crate::state::{HookPoint, LifecycleEvent, ModuleState, StateChange};
use std::collections::HashMap;
use std::fmt;
use parking_lot::Mutex;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error};

/// A lifecycle hook run against the hook target `T`.
pub type Hook<T> = Box<dyn FnMut(&mut T, &StateChange) -> anyhow::Result<()> + Send>;

/// Why an activation or deactivation did not commit.
#[derive(Debug)]
pub struct TransitionFailure {
    /// Event that failed.
    pub event: LifecycleEvent,
    /// State the module stayed in.
    pub state: ModuleState,
    /// Error raised by the hook.
    pub error: anyhow::Error,
    /// Rendered error chain (and backtrace when captured), as logged.
    pub trace: String,
}

impl fmt::Display for TransitionFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Error during {}: {:#}", self.event.noun(), self.error)
    }
}

/// Result of a `trigger()` call that did not propagate an error.
#[derive(Debug)]
pub enum TransitionOutcome {
    /// The transition ran and the state changed.
    Committed(StateChange),
    /// No edge for this event from the current state. Nothing happened.
    Rejected {
        /// Requested event name.
        event: String,
        /// State at the time of the request.
        state: ModuleState,
    },
    /// An activation/deactivation hook failed. The state did not change.
    Failed(TransitionFailure),
}

impl TransitionOutcome {
    /// `true` only if the state changed.
    pub fn is_committed(&self) -> bool {
        matches!(self, TransitionOutcome::Committed(_))
    }

    /// The committed change, if any.
    pub fn change(&self) -> Option<&StateChange> {
        match self {
            TransitionOutcome::Committed(change) => Some(change),
            _ => None,
        }
    }

    /// The failure, if a guarded hook failed.
    pub fn failure(&self) -> Option<&TransitionFailure> {
        match self {
            TransitionOutcome::Failed(failure) => Some(failure),
            _ => None,
        }
    }
}

impl From<TransitionOutcome> for bool {
    fn from(outcome: TransitionOutcome) -> Self {
        outcome.is_committed()
    }
}

/// Receiving end of a state-change subscription.
pub type StateChangeReceiver = mpsc::UnboundedReceiver<StateChange>;

/// Subscriber list for committed transitions.
///
/// Every subscriber owns an unbounded queue, so a reader that falls behind
/// still sees every transition in commit order. Clones share the list.
/// Dropped receivers are pruned on the next publish.
#[derive(Debug, Clone, Default)]
pub struct StateChanges {
    subscribers: Arc<Mutex<Vec<mpsc::UnboundedSender<StateChange>>>>,
}

impl StateChanges {
    /// Add a subscriber. It sees transitions committed from now on.
    pub fn subscribe(&self) -> StateChangeReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.subscribers.lock().push(tx);
        rx
    }

    /// Number of live subscribers.
    pub fn subscriber_count(&self) -> usize {
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|tx| !tx.is_closed());
        subscribers.len()
    }

    fn publish(&self, change: &StateChange) {
        self.subscribers
            .lock()
            .retain(|tx| tx.send(change.clone()).is_ok());
    }
}

/// Lifecycle state machine for one module instance.
pub struct ModuleStateMachine<T> {
    module: Arc<str>,
    state: ModuleState,
    hooks: HashMap<HookPoint, Vec<Hook<T>>>,
    changes: StateChanges,
    state_tx: watch::Sender<ModuleState>,
}

impl<T> fmt::Debug for ModuleStateMachine<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let hooks: HashMap<String, usize> = self
            .hooks
            .iter()
            .map(|(point, hooks)| (point.to_string(), hooks.len()))
            .collect();
        f.debug_struct("ModuleStateMachine")
            .field("module", &self.module)
            .field("state", &self.state)
            .field("hooks", &hooks)
            .finish()
    }
}

impl<T> ModuleStateMachine<T> {
    /// New machine in the `deactivated` state with no hooks.
    pub fn new(module: Arc<str>) -> Self {
        let (state_tx, _) = watch::channel(ModuleState::Deactivated);
        Self {
            module,
            state: ModuleState::Deactivated,
            hooks: HashMap::new(),
            changes: StateChanges::default(),
            state_tx,
        }
    }

    /// Append a hook at `point`. Hooks are never removed.
    pub fn add_hook(&mut self, point: HookPoint, hook: Hook<T>) {
        self.hooks.entry(point).or_default().push(hook);
    }

    /// Number of hooks registered at `point`.
    pub fn hook_count(&self, point: HookPoint) -> usize {
        self.hooks.get(&point).map_or(0, Vec::len)
    }

    /// Current state.
    pub fn current(&self) -> ModuleState {
        self.state
    }

    /// Whether `event` has an edge from the current state.
    pub fn can(&self, event: LifecycleEvent) -> bool {
        event.destination(self.state).is_some()
    }

    /// Subscribe to committed transitions.
    pub fn subscribe(&self) -> StateChangeReceiver {
        self.changes.subscribe()
    }

    /// Shared subscriber list, for handing out subscriptions elsewhere.
    pub fn changes(&self) -> StateChanges {
        self.changes.clone()
    }

    /// Watch the current state from any thread.
    pub fn watch(&self) -> watch::Receiver<ModuleState> {
        self.state_tx.subscribe()
    }

    /// Fire `event` against `target`.
    pub fn trigger(&mut self, event: LifecycleEvent, target: &mut T) -> AppResult<TransitionOutcome> {
        let source = self.state;
        let Some(destination) = event.destination(source) else {
            return Ok(TransitionOutcome::Rejected {
                event: event.to_string(),
                state: source,
            });
        };

        let change = StateChange {
            module: Arc::clone(&self.module),
            event,
            source,
            destination,
        };

        if event.is_guarded() {
            debug!(
                module = %self.module,
                event = %event,
                thread = ?std::thread::current().id(),
                "{} in thread",
                capitalize(event.noun())
            );
        }

        let result = self
            .run_hooks(HookPoint::Before(event), target, &change)
            .and_then(|()| self.run_hooks(HookPoint::On(event), target, &change));

        if let Err(err) = result {
            if event.is_guarded() {
                let trace = format!("{:?}", err);
                error!(
                    module = %self.module,
                    event = %event,
                    error = %trace,
                    "Error during {}",
                    event.noun()
                );
                return Ok(TransitionOutcome::Failed(TransitionFailure {
                    event,
                    state: source,
                    error: err,
                    trace,
                }));
            }
            return Err(ModuleError::Hook {
                module: self.module.to_string(),
                event,
                source: err,
            });
        }

        self.state = destination;
        self.state_tx.send_replace(destination);
        self.changes.publish(&change);
        Ok(TransitionOutcome::Committed(change))
    }

    /// Fire an event by name. Unknown names are rejected like missing edges.
    pub fn trigger_named(&mut self, event: &str, target: &mut T) -> AppResult<TransitionOutcome> {
        match event.parse::<LifecycleEvent>() {
            Ok(event) => self.trigger(event, target),
            Err(_) => Ok(TransitionOutcome::Rejected {
                event: event.to_string(),
                state: self.state,
            }),
        }
    }

    fn run_hooks(&mut self, point: HookPoint, target: &mut T, change: &StateChange) -> anyhow::Result<()> {
        if let Some(hooks) = self.hooks.get_mut(&point) {
            for hook in hooks.iter_mut() {
                hook(target, change)?;
            }
        }
        Ok(())
    }
}

fn capitalize(word: &str) -> String {
    let mut chars = word.chars();
    match chars.next() {
        Some(first) => first.to_uppercase().chain(chars).collect(),
        None => String::new(),
    }
}

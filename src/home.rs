//! Home-thread hand-off.
//!
//! Transitions run only on a module's home thread. Other threads reach the
//! module through a [`ModuleHandle`], which queues commands for the
//! [`HomeLoop`] draining them on the home thread.
//!
//! Threaded module types get a dedicated thread from
//! [`ModuleBuilder::spawn`]. Unthreaded ones are built on the host thread and
//! [`attach`](ModuleCore::attach)ed; the host then drains the loop itself.
//!
//! The blocking calls (`trigger`, `invoke`, `shutdown`) use
//! `blocking_send`/`blocking_recv` and must not be called from inside an
//! async runtime. Use [`ModuleHandle::trigger_async`] there.

use crate::core::{ModuleBuilder, ModuleCore};
use crate::error::{AppResult, ModuleError};
use crate::module::Module;
use crate::state::{LifecycleEvent, ModuleState};
use crate::state_machine::{StateChangeReceiver, StateChanges, TransitionOutcome};
use parking_lot::Mutex;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::{mpsc as std_mpsc, Arc};
use std::thread::{self, JoinHandle, ThreadId};
use tokio::sync::{mpsc, oneshot, watch};
use tracing::{debug, info, warn};

/// Capacity of a spawned module's command queue.
pub const HOME_QUEUE_CAPACITY: usize = 32;

type Invocation<M> = Box<dyn FnOnce(&mut ModuleCore<M>) + Send>;

/// Commands executed on the home thread.
pub enum HomeCommand<M: Module> {
    /// Fire a lifecycle event and report the outcome.
    Trigger {
        /// Event to fire.
        event: LifecycleEvent,
        /// Receives the outcome once the transition ran.
        reply: oneshot::Sender<AppResult<TransitionOutcome>>,
    },
    /// Run a closure against the core.
    Invoke(Invocation<M>),
    /// Stop the loop and hand the core back.
    Shutdown(oneshot::Sender<ModuleCore<M>>),
}

impl<M: Module> fmt::Debug for HomeCommand<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HomeCommand::Trigger { event, .. } => f.debug_struct("Trigger").field("event", event).finish(),
            HomeCommand::Invoke(_) => f.write_str("Invoke"),
            HomeCommand::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

/// Cloneable, thread-safe handle to a module living on its home thread.
pub struct ModuleHandle<M: Module> {
    name: Arc<str>,
    home_thread: ThreadId,
    commands: mpsc::Sender<HomeCommand<M>>,
    state: watch::Receiver<ModuleState>,
    changes: StateChanges,
    thread: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl<M: Module> Clone for ModuleHandle<M> {
    fn clone(&self) -> Self {
        Self {
            name: Arc::clone(&self.name),
            home_thread: self.home_thread,
            commands: self.commands.clone(),
            state: self.state.clone(),
            changes: self.changes.clone(),
            thread: Arc::clone(&self.thread),
        }
    }
}

impl<M: Module> fmt::Debug for ModuleHandle<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleHandle")
            .field("name", &self.name)
            .field("home_thread", &self.home_thread)
            .field("state", &*self.state.borrow())
            .finish()
    }
}

impl<M: Module> ModuleHandle<M> {
    /// Name of the module behind the handle.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Thread the module's transitions run on.
    pub fn home_thread(&self) -> ThreadId {
        self.home_thread
    }

    /// Current state, as last committed on the home thread.
    pub fn state(&self) -> ModuleState {
        *self.state.borrow()
    }

    /// Receiver that can await state changes.
    pub fn state_receiver(&self) -> watch::Receiver<ModuleState> {
        self.state.clone()
    }

    /// Subscribe to committed transitions.
    pub fn subscribe(&self) -> StateChangeReceiver {
        self.changes.subscribe()
    }

    /// Fire an event on the home thread and wait until the transition ran.
    pub fn trigger(&self, event: LifecycleEvent) -> AppResult<TransitionOutcome> {
        self.ensure_foreign_thread()?;
        let (reply, outcome) = oneshot::channel();
        self.send_blocking(HomeCommand::Trigger { event, reply })?;
        outcome.blocking_recv().map_err(|_| self.gone())?
    }

    /// Async variant of [`trigger`](Self::trigger).
    ///
    /// Refused on the home thread like the blocking calls: the reply would
    /// wait on a loop that the awaiting task keeps from running.
    pub async fn trigger_async(&self, event: LifecycleEvent) -> AppResult<TransitionOutcome> {
        self.ensure_foreign_thread()?;
        let (reply, outcome) = oneshot::channel();
        self.commands
            .send(HomeCommand::Trigger { event, reply })
            .await
            .map_err(|_| self.gone())?;
        outcome.await.map_err(|_| self.gone())?
    }

    /// Run `f` against the core on the home thread and return its result.
    pub fn invoke<R, F>(&self, f: F) -> AppResult<R>
    where
        R: Send + 'static,
        F: FnOnce(&mut ModuleCore<M>) -> R + Send + 'static,
    {
        self.ensure_foreign_thread()?;
        let (reply, result) = oneshot::channel();
        self.send_blocking(HomeCommand::Invoke(Box::new(move |core| {
            // The caller may have given up waiting.
            let _ = reply.send(f(core));
        })))?;
        result.blocking_recv().map_err(|_| self.gone())
    }

    /// Stop the home loop and take the core back, e.g. to harvest its status variables.
    ///
    /// Deactivate first: the core is returned in whatever state it is in.
    pub fn shutdown(&self) -> AppResult<ModuleCore<M>> {
        self.ensure_foreign_thread()?;
        let (reply, core) = oneshot::channel();
        self.send_blocking(HomeCommand::Shutdown(reply))?;
        let core = core.blocking_recv().map_err(|_| self.gone())?;

        if let Some(thread) = self.thread.lock().take() {
            if thread.join().is_err() {
                warn!(module = %self.name, "Home thread panicked during shutdown");
            }
        }
        Ok(core)
    }

    fn set_thread(&self, thread: JoinHandle<()>) {
        *self.thread.lock() = Some(thread);
    }

    fn send_blocking(&self, command: HomeCommand<M>) -> AppResult<()> {
        self.commands.blocking_send(command).map_err(|_| self.gone())
    }

    fn ensure_foreign_thread(&self) -> AppResult<()> {
        if thread::current().id() == self.home_thread {
            return Err(ModuleError::HandoffOnHomeThread {
                module: self.name.to_string(),
            });
        }
        Ok(())
    }

    fn gone(&self) -> ModuleError {
        ModuleError::HomeThreadGone(self.name.to_string())
    }
}

/// Command loop of one module, drained on its home thread.
pub struct HomeLoop<M: Module> {
    core: Option<ModuleCore<M>>,
    commands: mpsc::Receiver<HomeCommand<M>>,
}

impl<M: Module> fmt::Debug for HomeLoop<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HomeLoop")
            .field("core", &self.core)
            .finish_non_exhaustive()
    }
}

impl<M: Module> HomeLoop<M> {
    /// Execute every queued command without blocking. Returns how many ran.
    pub fn run_pending(&mut self) -> usize {
        let mut ran = 0;
        while self.core.is_some() {
            let Ok(command) = self.commands.try_recv() else {
                break;
            };
            ran += 1;
            if self.execute(command).is_break() {
                break;
            }
        }
        ran
    }

    /// Block until shut down or every handle is dropped.
    ///
    /// Returns the core if the loop ended because all handles were dropped.
    pub fn run(mut self) -> Option<ModuleCore<M>> {
        while self.core.is_some() {
            let Some(command) = self.commands.blocking_recv() else {
                debug!("All module handles dropped, leaving home loop");
                break;
            };
            if self.execute(command).is_break() {
                break;
            }
        }
        self.core
    }

    /// Whether a shutdown command has been executed.
    pub fn is_shut_down(&self) -> bool {
        self.core.is_none()
    }

    /// Direct access to the core on the home thread.
    pub fn core_mut(&mut self) -> Option<&mut ModuleCore<M>> {
        self.core.as_mut()
    }

    fn execute(&mut self, command: HomeCommand<M>) -> ControlFlow<()> {
        let Some(core) = self.core.as_mut() else {
            return ControlFlow::Break(());
        };
        match command {
            HomeCommand::Trigger { event, reply } => {
                let _ = reply.send(core.trigger(event));
                ControlFlow::Continue(())
            }
            HomeCommand::Invoke(f) => {
                f(core);
                ControlFlow::Continue(())
            }
            HomeCommand::Shutdown(reply) => {
                if let Some(core) = self.core.take() {
                    info!(module = %core.name(), state = %core.current_state(), "Leaving home loop");
                    let _ = reply.send(core);
                }
                ControlFlow::Break(())
            }
        }
    }
}

impl<M: Module> ModuleCore<M> {
    /// Split into a handle for other threads and the loop to drain on the home thread.
    pub fn attach(self, capacity: usize) -> (ModuleHandle<M>, HomeLoop<M>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = ModuleHandle {
            name: self.info().shared_name(),
            home_thread: self.home_thread(),
            commands: tx,
            state: self.watch_state(),
            changes: self.changes(),
            thread: Arc::new(Mutex::new(None)),
        };
        (
            handle,
            HomeLoop {
                core: Some(self),
                commands: rx,
            },
        )
    }
}

impl<M: Module> ModuleBuilder<M> {
    /// Construct a threaded module on its own home thread.
    ///
    /// Construction errors are returned here, synchronously.
    pub fn spawn(self) -> AppResult<ModuleHandle<M>> {
        if !M::THREADED {
            return Err(ModuleError::NotThreaded(self.name().to_string()));
        }
        let name = self.name().to_string();
        let (ready_tx, ready_rx) = std_mpsc::sync_channel(1);

        let thread = thread::Builder::new()
            .name(format!("mod-{}", name))
            .spawn(move || {
                let core = match self.build_here() {
                    Ok(core) => core,
                    Err(err) => {
                        let _ = ready_tx.send(Err(err));
                        return;
                    }
                };
                let (handle, home) = core.attach(HOME_QUEUE_CAPACITY);
                if ready_tx.send(Ok(handle)).is_err() {
                    return;
                }
                home.run();
            })?;

        let handle = ready_rx
            .recv()
            .map_err(|_| ModuleError::HomeThreadGone(name.clone()))??;
        handle.set_thread(thread);
        debug!(module = %name, "Home thread started");
        Ok(handle)
    }
}

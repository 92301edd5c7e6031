//! Module construction and the per-instance lifecycle orchestrator.
//!
//! [`ModuleBuilder`] takes the host's inputs (manager, name, raw config,
//! connector bindings, persisted status variables, extra hooks) and produces
//! a [`ModuleCore`] in the `deactivated` state. Construction order:
//!
//! 1. extra hook names are resolved (unknown names fail),
//! 2. connectors are resolved against the registry's bindings,
//! 3. config options are bound,
//! 4. [`Module::create`] builds the user struct,
//! 5. the state machine is wired with the built-in hooks, then the extra ones.
//!
//! Any failure in 1-4 means no instance exists.

use crate::config_option::ConfigOptions;
use crate::connector::{ConnectorBinding, Connectors};
use crate::error::{AppResult, ModuleError};
use crate::module::{ManagerHandle, Module, ModuleContext, ModuleInfo};
use crate::state::{HookPoint, LifecycleEvent, ModuleState, StateChange};
use crate::state_machine::{Hook, ModuleStateMachine, StateChangeReceiver, StateChanges, TransitionOutcome};
use crate::status_var::StatusStore;
use anyhow::Context;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info};

/// The hook target: the user struct plus everything the framework keeps next to it.
pub struct ModuleInstance<M> {
    ctx: ModuleContext,
    status: StatusStore,
    bound: BTreeSet<&'static str>,
    module: M,
}

impl<M: Module> ModuleInstance<M> {
    /// The user struct.
    pub fn module(&self) -> &M {
        &self.module
    }

    /// The user struct, mutably.
    pub fn module_mut(&mut self) -> &mut M {
        &mut self.module
    }

    /// Identity, options, connectors and manager of this instance.
    pub fn context(&self) -> &ModuleContext {
        &self.ctx
    }

    /// The live status store.
    pub fn status(&self) -> &StatusStore {
        &self.status
    }

    /// Whether the status variable was bound by an activation.
    pub fn is_bound(&self, name: &str) -> bool {
        self.bound.contains(name)
    }

    /// Store -> constructor -> field, for every declared status variable.
    fn restore_status_variables(&mut self) -> anyhow::Result<()> {
        for var in M::schema().status_vars() {
            var.restore(&mut self.module, &self.ctx, &self.status)
                .with_context(|| format!("failed to restore status variable '{}'", var.name()))?;
            self.bound.insert(var.name());
        }
        debug!(module = %self.ctx.name(), count = self.bound.len(), "Status variables restored");
        Ok(())
    }

    /// Field -> representer -> store, for every bound status variable.
    ///
    /// A failing representer is logged and only that variable is skipped.
    fn dump_status_variables(&mut self) {
        for var in M::schema().status_vars() {
            if !self.bound.contains(var.name()) {
                continue;
            }
            match var.represent(&mut self.module, &self.ctx) {
                Ok(value) => self.status.insert(var.name(), value),
                Err(err) => error!(
                    module = %self.ctx.name(),
                    status_var = var.name(),
                    error = %format!("{:#}", err),
                    "Failed to save status variable"
                ),
            }
        }
    }
}

fn restore_then_activate<M: Module>(instance: &mut ModuleInstance<M>, _: &StateChange) -> anyhow::Result<()> {
    instance.restore_status_variables()?;
    instance.module.on_activate(&instance.ctx)
}

fn deactivate_then_save<M: Module>(instance: &mut ModuleInstance<M>, _: &StateChange) -> anyhow::Result<()> {
    let result = instance.module.on_deactivate(&instance.ctx);
    instance.dump_status_variables();
    result
}

enum HookSlot {
    Named(String),
    Point(HookPoint),
}

/// Host-side constructor for a [`ModuleCore`].
pub struct ModuleBuilder<M: Module> {
    manager: Arc<dyn ManagerHandle>,
    name: String,
    config: Map<String, Value>,
    connections: BTreeMap<String, ConnectorBinding>,
    status_variables: Map<String, Value>,
    hooks: Vec<(HookSlot, Hook<ModuleInstance<M>>)>,
}

impl<M: Module> ModuleBuilder<M> {
    /// Builder for a module named `name`, hosted by `manager`.
    pub fn new(manager: Arc<dyn ManagerHandle>, name: impl Into<String>) -> Self {
        Self {
            manager,
            name: name.into(),
            config: Map::new(),
            connections: BTreeMap::new(),
            status_variables: Map::new(),
            hooks: Vec::new(),
        }
    }

    /// Name the instance will carry.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Raw module configuration.
    pub fn config(mut self, config: Map<String, Value>) -> Self {
        self.config = config;
        self
    }

    /// Connector bindings produced by the registry, by connector name.
    pub fn connections(mut self, connections: BTreeMap<String, ConnectorBinding>) -> Self {
        self.connections = connections;
        self
    }

    /// Status variables persisted by a previous instance.
    pub fn status_variables(mut self, values: Map<String, Value>) -> Self {
        self.status_variables = values;
        self
    }

    /// Extra hook by name: `onbefore<event>`, `on<event>` or a bare event (= `on<event>`).
    ///
    /// Unknown names fail [`build`](Self::build).
    pub fn hook<F>(mut self, name: &str, hook: F) -> Self
    where
        F: FnMut(&mut ModuleInstance<M>, &StateChange) -> anyhow::Result<()> + Send + 'static,
    {
        self.hooks.push((HookSlot::Named(name.to_string()), Box::new(hook)));
        self
    }

    /// Extra hook at a typed hook point.
    pub fn hook_at<F>(mut self, point: HookPoint, hook: F) -> Self
    where
        F: FnMut(&mut ModuleInstance<M>, &StateChange) -> anyhow::Result<()> + Send + 'static,
    {
        self.hooks.push((HookSlot::Point(point), Box::new(hook)));
        self
    }

    /// Construct the instance on the current thread, which becomes its home thread.
    ///
    /// Threaded module types are refused with [`ModuleError::Threaded`]; they
    /// get their home thread from [`spawn`](Self::spawn).
    pub fn build(self) -> AppResult<ModuleCore<M>> {
        if M::THREADED {
            return Err(ModuleError::Threaded(self.name));
        }
        self.build_here()
    }

    /// Construction proper, on whichever thread calls it.
    pub(crate) fn build_here(self) -> AppResult<ModuleCore<M>> {
        let schema = M::schema();
        let name = self.name;

        let mut extra = Vec::with_capacity(self.hooks.len());
        for (slot, hook) in self.hooks {
            let point = match slot {
                HookSlot::Point(point) => point,
                HookSlot::Named(hook_name) => {
                    hook_name
                        .parse::<HookPoint>()
                        .map_err(|_| ModuleError::UnknownHook {
                            module: name.clone(),
                            hook: hook_name.clone(),
                        })?
                }
            };
            extra.push((point, hook));
        }

        let connectors = Connectors::bind(&name, schema.connectors(), &self.connections)?;
        let info = ModuleInfo::new(name.as_str(), M::BASE, M::THREADED);
        let options = ConfigOptions::bind(schema.config_options(), &info, &self.config)?;
        let ctx = ModuleContext::new(info, options, self.config, connectors, self.manager);

        let module = M::create(&ctx).map_err(|source| ModuleError::Create {
            module: name.clone(),
            source,
        })?;

        let mut fsm = ModuleStateMachine::new(Arc::from(name.as_str()));
        fsm.add_hook(
            HookPoint::Before(LifecycleEvent::Activate),
            Box::new(restore_then_activate::<M>),
        );
        fsm.add_hook(
            HookPoint::On(LifecycleEvent::Deactivate),
            Box::new(deactivate_then_save::<M>),
        );
        for (point, hook) in extra {
            fsm.add_hook(point, hook);
        }

        info!(
            module = %name,
            base = %ctx.info().base(),
            uuid = %ctx.info().uuid(),
            threaded = M::THREADED,
            "Module constructed"
        );

        Ok(ModuleCore {
            instance: ModuleInstance {
                ctx,
                status: StatusStore::new(self.status_variables),
                bound: BTreeSet::new(),
                module,
            },
            fsm,
            home_thread: thread::current().id(),
        })
    }
}

/// One module instance with its state machine, pinned to its home thread.
pub struct ModuleCore<M: Module> {
    instance: ModuleInstance<M>,
    fsm: ModuleStateMachine<ModuleInstance<M>>,
    home_thread: ThreadId,
}

impl<M: Module> fmt::Debug for ModuleCore<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleCore")
            .field("info", self.info())
            .field("state", &self.current_state())
            .field("home_thread", &self.home_thread)
            .finish_non_exhaustive()
    }
}

impl<M: Module> ModuleCore<M> {
    /// Fire a lifecycle event. Must run on the home thread.
    pub fn trigger(&mut self, event: LifecycleEvent) -> AppResult<TransitionOutcome> {
        self.ensure_home_thread()?;
        self.fsm.trigger(event, &mut self.instance)
    }

    /// Fire a lifecycle event by name. Unknown names are rejected.
    pub fn trigger_named(&mut self, event: &str) -> AppResult<TransitionOutcome> {
        self.ensure_home_thread()?;
        self.fsm.trigger_named(event, &mut self.instance)
    }

    /// Shorthand for `trigger(LifecycleEvent::Activate)`.
    pub fn activate(&mut self) -> AppResult<TransitionOutcome> {
        self.trigger(LifecycleEvent::Activate)
    }

    /// Shorthand for `trigger(LifecycleEvent::Deactivate)`.
    pub fn deactivate(&mut self) -> AppResult<TransitionOutcome> {
        self.trigger(LifecycleEvent::Deactivate)
    }

    /// Current lifecycle state.
    pub fn current_state(&self) -> ModuleState {
        self.fsm.current()
    }

    /// Subscribe to committed transitions. Nothing is dropped for slow readers.
    pub fn subscribe(&self) -> StateChangeReceiver {
        self.fsm.subscribe()
    }

    /// Observe the current state from any thread.
    pub fn watch_state(&self) -> watch::Receiver<ModuleState> {
        self.fsm.watch()
    }

    /// Deep copy of the status store.
    pub fn status_variables(&self) -> Map<String, Value> {
        self.instance.status.snapshot()
    }

    /// Replace the whole status store. Non-mappings are rejected and logged.
    pub fn set_status_variables(&mut self, values: Value) -> AppResult<()> {
        let name = self.instance.ctx.info().shared_name();
        self.instance.status.replace_from_value(&name, values)
    }

    /// Save every bound status variable now, without deactivating.
    pub fn dump_status_variables(&mut self) {
        self.instance.dump_status_variables();
    }

    /// Bound value of a declared config option.
    pub fn option(&self, name: &str) -> Option<&Value> {
        self.instance.ctx.option(name)
    }

    /// Bound value of a declared config option, deserialized.
    pub fn option_as<T: DeserializeOwned>(&self, name: &str) -> AppResult<T> {
        self.instance.ctx.option_as(name)
    }

    /// Current provider behind a connector.
    pub fn connector<T>(&self, name: &str) -> AppResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.instance.ctx.connector(name)
    }

    /// Queue a pop-up notification for the display.
    pub fn pop_up(&self, title: &str, message: &str) {
        self.instance.ctx.pop_up(title, message);
    }

    /// Queue a balloon notification for the display.
    pub fn balloon(&self, title: &str, message: &str, duration: Option<Duration>) {
        self.instance.ctx.balloon(title, message, duration);
    }

    /// Identity of the instance.
    pub fn info(&self) -> &ModuleInfo {
        self.instance.ctx.info()
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        self.instance.ctx.name()
    }

    /// Raw configuration the instance was built from.
    pub fn configuration(&self) -> &Map<String, Value> {
        self.instance.ctx.configuration()
    }

    /// Context handed to the user struct's callbacks.
    pub fn context(&self) -> &ModuleContext {
        &self.instance.ctx
    }

    /// The user struct.
    pub fn module(&self) -> &M {
        &self.instance.module
    }

    /// The user struct, mutably.
    pub fn module_mut(&mut self) -> &mut M {
        &mut self.instance.module
    }

    /// Thread the core was built on. Transitions run only there.
    pub fn home_thread(&self) -> ThreadId {
        self.home_thread
    }

    pub(crate) fn changes(&self) -> StateChanges {
        self.fsm.changes()
    }

    fn ensure_home_thread(&self) -> AppResult<()> {
        let current = thread::current().id();
        if current != self.home_thread {
            return Err(ModuleError::WrongThread {
                module: self.name().to_string(),
                home: self.home_thread,
                current,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config_option::{ConfigOption, MissingPolicy};
    use crate::module::{HeadlessManager, ModuleSchema};
    use crate::status_var::StatusVar;
    use anyhow::bail;
    use once_cell::sync::Lazy;
    use serde_json::json;
    use tracing_test::traced_test;

    struct Counter {
        x: i64,
        count: u32,
        activate_count: Option<u32>,
        fail_deactivate: bool,
        activations: u32,
    }

    impl Module for Counter {
        fn schema() -> &'static ModuleSchema<Self> {
            static SCHEMA: Lazy<ModuleSchema<Counter>> = Lazy::new(|| {
                ModuleSchema::builder()
                    .option(ConfigOption::new("x", json!(1)).missing(MissingPolicy::Warn))
                    .option(ConfigOption::new("activate_count", json!(null)))
                    .option(ConfigOption::new("fail_deactivate", json!(false)))
                    .status_var(StatusVar::new("count", json!(0), |m: &mut Counter| &mut m.count))
                    .build()
            });
            &SCHEMA
        }

        fn create(ctx: &ModuleContext) -> anyhow::Result<Self> {
            let x: i64 = ctx.option_as("x")?;
            if x < 0 {
                bail!("x must be non-negative, got {}", x);
            }
            Ok(Self {
                x,
                count: 0,
                activate_count: ctx.option_as("activate_count")?,
                fail_deactivate: ctx.option_as("fail_deactivate")?,
                activations: 0,
            })
        }

        fn on_activate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            self.activations += 1;
            if let Some(count) = self.activate_count {
                self.count = count;
            }
            Ok(())
        }

        fn on_deactivate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            if self.fail_deactivate {
                bail!("shutter did not close");
            }
            Ok(())
        }
    }

    struct Strict;

    impl Module for Strict {
        fn schema() -> &'static ModuleSchema<Self> {
            static SCHEMA: Lazy<ModuleSchema<Strict>> =
                Lazy::new(|| ModuleSchema::builder().option(ConfigOption::required("port")).build());
            &SCHEMA
        }

        fn create(_ctx: &ModuleContext) -> anyhow::Result<Self> {
            Ok(Strict)
        }

        fn on_activate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_deactivate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn counter(config: Value) -> ModuleBuilder<Counter> {
        let config = match config {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        ModuleBuilder::new(Arc::new(HeadlessManager), "counter").config(config)
    }

    #[test]
    #[traced_test]
    fn missing_option_uses_default_with_one_warning() {
        let core = counter(json!({})).build().unwrap();
        assert_eq!(core.module().x, 1);
        assert_eq!(core.option("x"), Some(&json!(1)));

        logs_assert(|lines: &[&str]| {
            let warnings = lines
                .iter()
                .filter(|line| line.contains("WARN") && line.contains(">>x<<"))
                .count();
            match warnings {
                1 => Ok(()),
                n => Err(format!("expected one warning naming x, got {}", n)),
            }
        });
    }

    #[test]
    fn count_set_in_on_activate_is_persisted() {
        let mut core = counter(json!({"activate_count": 5})).build().unwrap();
        assert!(core.activate().unwrap().is_committed());
        assert!(core.deactivate().unwrap().is_committed());
        assert_eq!(core.status_variables()["count"], json!(5));
    }

    #[test]
    fn status_variables_restore_on_every_activation() {
        let mut core = counter(json!({}))
            .status_variables(Map::from_iter([("count".to_string(), json!(3))]))
            .build()
            .unwrap();
        assert!(!core.instance.is_bound("count"));

        core.activate().unwrap();
        assert_eq!(core.module().count, 3);
        assert!(core.instance.is_bound("count"));

        core.module_mut().count = 8;
        core.deactivate().unwrap();
        core.module_mut().count = 0;
        core.activate().unwrap();
        assert_eq!(core.module().count, 8);
        assert_eq!(core.module().activations, 2);
    }

    #[test]
    #[traced_test]
    fn failing_on_deactivate_still_saves_status() {
        let mut core = counter(json!({"fail_deactivate": true})).build().unwrap();
        core.activate().unwrap();
        core.module_mut().count = 11;

        let outcome = core.deactivate().unwrap();
        assert!(!outcome.is_committed());
        let failure = outcome.failure().unwrap();
        assert!(failure.trace.contains("shutter did not close"));
        assert_eq!(core.current_state(), ModuleState::Idle);
        assert_eq!(core.status_variables()["count"], json!(11));
        assert!(logs_contain("Error during deactivation"));
    }

    #[test]
    fn required_option_absent_prevents_construction() {
        let err = ModuleBuilder::<Strict>::new(Arc::new(HeadlessManager), "stage")
            .build()
            .unwrap_err();
        assert!(matches!(err, ModuleError::Configuration { ref option, .. } if option == "port"));
        assert!(err.is_construction_error());
    }

    #[test]
    fn failing_create_prevents_construction() {
        let err = counter(json!({"x": -1})).build().unwrap_err();
        assert!(matches!(err, ModuleError::Create { .. }));
    }

    #[test]
    fn run_from_deactivated_is_rejected() {
        let mut core = counter(json!({})).build().unwrap();
        let outcome = core.trigger(LifecycleEvent::Run).unwrap();
        assert!(!outcome.is_committed());
        assert_eq!(core.current_state(), ModuleState::Deactivated);
        assert_eq!(core.module().activations, 0);
    }

    #[test]
    fn lock_then_deactivate() {
        let mut core = counter(json!({})).build().unwrap();
        core.activate().unwrap();
        assert!(core.trigger(LifecycleEvent::Lock).unwrap().is_committed());
        assert_eq!(core.current_state(), ModuleState::Locked);
        assert!(core.deactivate().unwrap().is_committed());
        assert_eq!(core.current_state(), ModuleState::Deactivated);
    }

    #[test]
    fn extra_hooks_run_after_builtin_hooks() {
        let mut core = counter(json!({}))
            .hook_at(HookPoint::Before(LifecycleEvent::Activate), |inst, _| {
                // The built-in hook already restored and activated.
                assert!(inst.is_bound("count"));
                assert_eq!(inst.module().activations, 1);
                Ok(())
            })
            .hook("ondeactivate", |inst, change| {
                assert_eq!(change.destination, ModuleState::Deactivated);
                assert_eq!(inst.status().get("count"), Some(&json!(2)));
                Ok(())
            })
            .build()
            .unwrap();

        core.activate().unwrap();
        core.module_mut().count = 2;
        assert!(core.deactivate().unwrap().is_committed());
    }

    #[test]
    fn unknown_hook_name_fails_construction() {
        let err = counter(json!({}))
            .hook("onfrobnicate", |_, _| Ok(()))
            .build()
            .unwrap_err();
        assert!(matches!(err, ModuleError::UnknownHook { ref hook, .. } if hook == "onfrobnicate"));
    }

    #[test]
    fn unguarded_hook_error_propagates() {
        let mut core = counter(json!({}))
            .hook("run", |_, _| anyhow::bail!("no trigger source"))
            .build()
            .unwrap();
        core.activate().unwrap();
        let err = core.trigger(LifecycleEvent::Run).unwrap_err();
        assert!(matches!(err, ModuleError::Hook { event: LifecycleEvent::Run, .. }));
        assert_eq!(core.current_state(), ModuleState::Idle);
    }

    #[test]
    fn trigger_from_foreign_thread_is_refused() {
        let core = counter(json!({})).build().unwrap();
        let home = core.home_thread();

        let (core, result) = thread::spawn(move || {
            let mut core = core;
            let result = core.activate();
            (core, result)
        })
        .join()
        .unwrap();

        assert!(matches!(result, Err(ModuleError::WrongThread { home: h, .. }) if h == home));
        assert_eq!(core.current_state(), ModuleState::Deactivated);
    }

    #[test]
    #[traced_test]
    fn non_mapping_status_replacement_is_a_noop() {
        let mut core = counter(json!({})).build().unwrap();
        core.set_status_variables(json!({"count": 4})).unwrap();
        assert!(core.set_status_variables(json!("count=4")).is_err());
        assert_eq!(core.status_variables()["count"], json!(4));
        assert!(logs_contain("status variables must be a mapping"));
    }

    struct Camera;

    impl Module for Camera {
        const THREADED: bool = true;

        fn schema() -> &'static ModuleSchema<Self> {
            static SCHEMA: Lazy<ModuleSchema<Camera>> = Lazy::new(|| ModuleSchema::builder().build());
            &SCHEMA
        }

        fn create(_ctx: &ModuleContext) -> anyhow::Result<Self> {
            Ok(Camera)
        }

        fn on_activate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            Ok(())
        }

        fn on_deactivate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn threaded_type_is_not_built_in_place() {
        let err = ModuleBuilder::<Camera>::new(Arc::new(HeadlessManager), "camera")
            .build()
            .unwrap_err();
        assert!(matches!(err, ModuleError::Threaded(ref name) if name == "camera"));
    }

    #[test]
    fn slow_subscriber_sees_every_cycle() {
        let mut core = counter(json!({})).build().unwrap();
        let mut changes = core.subscribe();
        for _ in 0..40 {
            assert!(core.activate().unwrap().is_committed());
            assert!(core.deactivate().unwrap().is_committed());
        }

        let seen: Vec<_> = std::iter::from_fn(|| changes.try_recv().ok()).collect();
        assert_eq!(seen.len(), 80);
        assert!(seen
            .iter()
            .step_by(2)
            .all(|change| change.destination == ModuleState::Idle));
        assert_eq!(seen[79].destination, ModuleState::Deactivated);
    }

    #[test]
    fn configuration_is_kept_verbatim() {
        let core = counter(json!({"x": 4, "comment": "bench 2"})).build().unwrap();
        assert_eq!(core.configuration()["comment"], json!("bench 2"));
        assert_eq!(core.option_as::<i64>("x").unwrap(), 4);
        assert!(core.option("comment").is_none());
    }
}

//! The module trait, its static schema and the per-instance context.
//!
//! A module type declares its config options, status variables and
//! connectors once, in a [`ModuleSchema`] built lazily on first use:
//!
//! ```rust,ignore
//! impl Module for Counter {
//!     fn schema() -> &'static ModuleSchema<Self> {
//!         static SCHEMA: Lazy<ModuleSchema<Counter>> = Lazy::new(|| {
//!             ModuleSchema::builder()
//!                 .option(ConfigOption::new("x", json!(1)).missing(MissingPolicy::Warn))
//!                 .status_var(StatusVar::new("count", json!(0), |m: &mut Counter| &mut m.count))
//!                 .connector(ConnectorSpec::new("meter", "power_meter"))
//!                 .build()
//!         });
//!         &SCHEMA
//!     }
//!     // create / on_activate / on_deactivate ...
//! }
//! ```
//!
//! Everything an instance needs at runtime (identity, bound options,
//! connectors, the manager and the notifier) lives in its [`ModuleContext`].

use crate::config_option::{ConfigOption, ConfigOptions};
use crate::connector::{ConnectorSpec, Connectors};
use crate::error::AppResult;
use crate::notification::{DisplayQueue, Notifier};
use crate::status_var::StatusVar;
use chrono::{Local, NaiveDate};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Broad category of a module.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModuleBase {
    /// Instrument driver.
    Hardware,
    /// Measurement or processing logic.
    #[default]
    Logic,
    /// User interface panel.
    Gui,
}

impl ModuleBase {
    /// Lowercase name.
    pub fn as_str(&self) -> &'static str {
        match self {
            ModuleBase::Hardware => "hardware",
            ModuleBase::Logic => "logic",
            ModuleBase::Gui => "gui",
        }
    }
}

impl fmt::Display for ModuleBase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity of one module instance.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModuleInfo {
    name: Arc<str>,
    uuid: Uuid,
    base: ModuleBase,
    threaded: bool,
}

impl ModuleInfo {
    /// New identity with a fresh random uuid.
    pub fn new(name: impl Into<Arc<str>>, base: ModuleBase, threaded: bool) -> Self {
        Self {
            name: name.into(),
            uuid: Uuid::new_v4(),
            base,
            threaded,
        }
    }

    /// Instance name, unique within the host.
    pub fn name(&self) -> &str {
        &self.name
    }

    pub(crate) fn shared_name(&self) -> Arc<str> {
        Arc::clone(&self.name)
    }

    /// Random per-instance id.
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Category the module type declared.
    pub fn base(&self) -> ModuleBase {
        self.base
    }

    /// Whether the instance owns a dedicated home thread.
    pub fn is_threaded(&self) -> bool {
        self.threaded
    }
}

/// What a module may ask of the host that created it.
///
/// All methods have headless defaults.
pub trait ManagerHandle: Send + Sync {
    /// Queue of an interactive display, if the host runs one.
    fn display(&self) -> Option<DisplayQueue> {
        None
    }

    /// Root for measurement data. `None` falls back to `~/Data`.
    fn data_root(&self) -> Option<PathBuf> {
        None
    }

    /// Whether data directories are split per day.
    fn daily_data_dirs(&self) -> bool {
        true
    }
}

/// Manager of a host without a display, using default data locations.
#[derive(Debug, Clone, Copy, Default)]
pub struct HeadlessManager;

impl ManagerHandle for HeadlessManager {}

/// Static declarations of a module type.
pub struct ModuleSchema<M> {
    config_options: Vec<ConfigOption>,
    status_vars: Vec<StatusVar<M>>,
    connectors: Vec<ConnectorSpec>,
}

impl<M> fmt::Debug for ModuleSchema<M> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleSchema")
            .field("config_options", &self.config_options)
            .field("status_vars", &self.status_vars)
            .field("connectors", &self.connectors)
            .finish()
    }
}

impl<M: 'static> ModuleSchema<M> {
    /// Start an empty schema.
    pub fn builder() -> ModuleSchemaBuilder<M> {
        ModuleSchemaBuilder {
            schema: ModuleSchema {
                config_options: Vec::new(),
                status_vars: Vec::new(),
                connectors: Vec::new(),
            },
        }
    }

    /// Declared config options, in declaration order.
    pub fn config_options(&self) -> &[ConfigOption] {
        &self.config_options
    }

    /// Declared status variables, in declaration order.
    pub fn status_vars(&self) -> &[StatusVar<M>] {
        &self.status_vars
    }

    /// Declared connectors, in declaration order.
    pub fn connectors(&self) -> &[ConnectorSpec] {
        &self.connectors
    }
}

/// Builder for [`ModuleSchema`].
pub struct ModuleSchemaBuilder<M> {
    schema: ModuleSchema<M>,
}

impl<M: 'static> ModuleSchemaBuilder<M> {
    /// Declare a config option.
    pub fn option(mut self, option: ConfigOption) -> Self {
        self.schema.config_options.push(option);
        self
    }

    /// Declare a status variable.
    pub fn status_var(mut self, var: impl Into<StatusVar<M>>) -> Self {
        self.schema.status_vars.push(var.into());
        self
    }

    /// Declare a connector.
    pub fn connector(mut self, connector: ConnectorSpec) -> Self {
        self.schema.connectors.push(connector);
        self
    }

    /// Finish the schema, usually inside a `Lazy` static.
    pub fn build(self) -> ModuleSchema<M> {
        self.schema
    }
}

/// A pluggable unit with a managed lifecycle.
///
/// The framework binds options and connectors, calls [`Module::create`],
/// and afterwards drives `on_activate` / `on_deactivate` through the state
/// machine. Status variables are restored right before `on_activate` and
/// saved right after `on_deactivate`.
pub trait Module: Send + Sized + 'static {
    /// Give every instance a dedicated home thread.
    const THREADED: bool = false;

    /// Category reported in [`ModuleInfo`].
    const BASE: ModuleBase = ModuleBase::Logic;

    /// Static declarations of this type.
    fn schema() -> &'static ModuleSchema<Self>;

    /// Build the instance once options and connectors are bound.
    fn create(ctx: &ModuleContext) -> anyhow::Result<Self>;

    /// Bring the module up. Status variables are already restored.
    fn on_activate(&mut self, ctx: &ModuleContext) -> anyhow::Result<()>;

    /// Shut the module down. Status variables are saved afterwards, even on error.
    fn on_deactivate(&mut self, ctx: &ModuleContext) -> anyhow::Result<()>;
}

/// Runtime surroundings of one module instance.
#[derive(Clone)]
pub struct ModuleContext {
    info: ModuleInfo,
    options: ConfigOptions,
    configuration: Map<String, Value>,
    connectors: Connectors,
    manager: Arc<dyn ManagerHandle>,
    notifier: Notifier,
}

impl fmt::Debug for ModuleContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModuleContext")
            .field("info", &self.info)
            .field("options", &self.options)
            .field("connectors", &self.connectors)
            .finish_non_exhaustive()
    }
}

impl ModuleContext {
    pub(crate) fn new(
        info: ModuleInfo,
        options: ConfigOptions,
        configuration: Map<String, Value>,
        connectors: Connectors,
        manager: Arc<dyn ManagerHandle>,
    ) -> Self {
        let notifier = Notifier::new(info.shared_name(), Arc::clone(&manager));
        Self {
            info,
            options,
            configuration,
            connectors,
            manager,
            notifier,
        }
    }

    /// Identity of the instance.
    pub fn info(&self) -> &ModuleInfo {
        &self.info
    }

    /// Instance name.
    pub fn name(&self) -> &str {
        self.info.name()
    }

    /// Options bound at construction.
    pub fn options(&self) -> &ConfigOptions {
        &self.options
    }

    /// Bound JSON value of an option.
    pub fn option(&self, name: &str) -> Option<&Value> {
        self.options.get(name)
    }

    /// Bound option deserialized into `T`.
    pub fn option_as<T: DeserializeOwned>(&self, name: &str) -> AppResult<T> {
        self.options.value(name)
    }

    /// Raw configuration as given by the host, before option binding.
    pub fn configuration(&self) -> &Map<String, Value> {
        &self.configuration
    }

    /// Resolved connectors.
    pub fn connectors(&self) -> &Connectors {
        &self.connectors
    }

    /// Live target of a connector.
    pub fn connector<T>(&self, name: &str) -> AppResult<Arc<T>>
    where
        T: ?Sized + Send + Sync + 'static,
    {
        self.connectors.get(name)
    }

    /// The hosting manager.
    pub fn manager(&self) -> &Arc<dyn ManagerHandle> {
        &self.manager
    }

    /// Notification sender bound to this instance's name.
    pub fn notifier(&self) -> &Notifier {
        &self.notifier
    }

    /// Show a modal dialog, or log it when no display is attached.
    pub fn pop_up(&self, title: &str, message: &str) {
        self.notifier.pop_up(title, message);
    }

    /// Show a tray balloon, or log it when no display is attached.
    pub fn balloon(&self, title: &str, message: &str, duration: Option<Duration>) {
        self.notifier.balloon(title, message, duration);
    }

    /// Default directory for today's data of this module. Not created.
    pub fn default_data_dir(&self) -> PathBuf {
        self.data_dir_on(Local::now().date_naive())
    }

    /// Default data directory for a given day.
    ///
    /// `<root>/<YYYY>/<MM>/<YYYYMMDD>/<module>` with daily directories,
    /// `<root>/<module>` without.
    pub fn data_dir_on(&self, date: NaiveDate) -> PathBuf {
        let mut dir = self.data_root();
        if self.manager.daily_data_dirs() {
            dir.push(date.format("%Y").to_string());
            dir.push(date.format("%m").to_string());
            dir.push(date.format("%Y%m%d").to_string());
        }
        dir.push(self.name());
        dir
    }

    fn data_root(&self) -> PathBuf {
        self.manager
            .data_root()
            .or_else(|| dirs::home_dir().map(|home| home.join("Data")))
            .unwrap_or_else(|| PathBuf::from("Data"))
    }
}


#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    struct FlatManager(PathBuf);

    impl ManagerHandle for FlatManager {
        fn data_root(&self) -> Option<PathBuf> {
            Some(self.0.clone())
        }

        fn daily_data_dirs(&self) -> bool {
            false
        }
    }

    struct DailyManager;

    impl ManagerHandle for DailyManager {
        fn data_root(&self) -> Option<PathBuf> {
            Some(PathBuf::from("/srv/data"))
        }
    }

    fn context_with(manager: Arc<dyn ManagerHandle>) -> ModuleContext {
        ModuleContext::new(
            ModuleInfo::new("odmr", ModuleBase::Logic, false),
            ConfigOptions::default(),
            Map::new(),
            Connectors::default(),
            manager,
        )
    }

    #[test]
    fn daily_data_dir_layout() {
        let ctx = context_with(Arc::new(DailyManager));
        let date = NaiveDate::from_ymd_opt(2024, 3, 7).unwrap();
        assert_eq!(
            ctx.data_dir_on(date),
            Path::new("/srv/data/2024/03/20240307/odmr")
        );
    }

    #[test]
    fn flat_data_dir_layout() {
        let ctx = context_with(Arc::new(FlatManager(PathBuf::from("/tmp/lab"))));
        let date = NaiveDate::from_ymd_opt(2024, 12, 31).unwrap();
        assert_eq!(ctx.data_dir_on(date), Path::new("/tmp/lab/odmr"));
    }

    #[test]
    fn headless_data_root_falls_back_to_home() {
        let ctx = testing::context("scanner");
        let dir = ctx.default_data_dir();
        assert!(dir.ends_with("scanner"));
        if let Some(home) = dirs::home_dir() {
            assert!(dir.starts_with(home.join("Data")));
        }
    }

    #[test]
    fn instances_get_distinct_uuids() {
        let a = ModuleInfo::new("a", ModuleBase::Hardware, true);
        let b = ModuleInfo::new("a", ModuleBase::Hardware, true);
        assert_ne!(a.uuid(), b.uuid());
        assert!(a.is_threaded());
        assert_eq!(a.base().to_string(), "hardware");
    }

    #[test]
    fn headless_manager_has_no_display() {
        assert!(HeadlessManager.display().is_none());
        assert!(HeadlessManager.daily_data_dirs());
    }
}

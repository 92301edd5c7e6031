//! # DAQ Module Core
//!
//! Lifecycle core for the pluggable modules of a laboratory instrument-control
//! application: hardware drivers, measurement logic and GUI panels all share
//! the same activation/deactivation state machine and the same declarative
//! injection of configuration, persisted status and connections to other
//! modules.
//!
//! ## Crate Structure
//!
//! - **`state`**: `ModuleState`, `LifecycleEvent`, hook points and the fixed
//!   transition table.
//! - **`state_machine`**: `ModuleStateMachine`, running hooks and publishing
//!   state changes.
//! - **`module`**: the `Module` trait, its static `ModuleSchema`, instance
//!   identity and the `ModuleContext` handed to module code.
//! - **`config_option`**, **`status_var`**, **`connector`**: the three kinds of
//!   declarations a module type can make.
//! - **`core`**: `ModuleBuilder` and `ModuleCore`, which bind everything
//!   together for one instance.
//! - **`home`**: `ModuleHandle` and `HomeLoop` for reaching a module from
//!   threads other than its home thread.
//! - **`notification`**: pop-ups and balloons routed to the host display.
//! - **`config`**: host configuration (TOML + environment) via Figment.
//! - **`logging`**: tracing-subscriber setup.
//! - **`error`**: `ModuleError` and `NotificationError`.
//!
//! ## Example
//!
//! ```no_run
//! use daq_module::prelude::*;
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! struct Counter {
//!     count: u32,
//! }
//!
//! impl Module for Counter {
//!     fn schema() -> &'static ModuleSchema<Self> {
//!         static SCHEMA: Lazy<ModuleSchema<Counter>> = Lazy::new(|| {
//!             ModuleSchema::builder()
//!                 .option(ConfigOption::new("x", json!(1)).missing(MissingPolicy::Warn))
//!                 .status_var(StatusVar::new("count", json!(0), |m: &mut Counter| &mut m.count))
//!                 .build()
//!         });
//!         &SCHEMA
//!     }
//!
//!     fn create(_ctx: &ModuleContext) -> anyhow::Result<Self> {
//!         Ok(Counter { count: 0 })
//!     }
//!
//!     fn on_activate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
//!         self.count += 1;
//!         Ok(())
//!     }
//!
//!     fn on_deactivate(&mut self, _ctx: &ModuleContext) -> anyhow::Result<()> {
//!         Ok(())
//!     }
//! }
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut core = ModuleBuilder::<Counter>::new(Arc::new(HeadlessManager), "counter").build()?;
//! core.activate()?;
//! core.deactivate()?;
//! assert_eq!(core.status_variables()["count"], json!(1));
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod config_option;
pub mod connector;
pub mod core;
pub mod error;
pub mod home;
pub mod logging;
pub mod module;
pub mod notification;
pub mod state;
pub mod state_machine;
pub mod status_var;

pub use crate::core::{ModuleBuilder, ModuleCore, ModuleInstance};
pub use error::{AppResult, ModuleError, NotificationError};
pub use home::{HomeLoop, ModuleHandle};
pub use module::{HeadlessManager, ManagerHandle, Module, ModuleBase, ModuleContext, ModuleInfo, ModuleSchema};
pub use state::{HookPoint, LifecycleEvent, ModuleState, StateChange};
pub use state_machine::{StateChangeReceiver, StateChanges, TransitionFailure, TransitionOutcome};

/// Everything needed to declare and drive a module.
pub mod prelude {
    pub use crate::config_option::{ConfigOption, MissingPolicy};
    pub use crate::connector::{ConnectorBinding, ConnectorSpec, ConnectorTarget};
    pub use crate::core::{ModuleBuilder, ModuleCore, ModuleInstance};
    pub use crate::error::{AppResult, ModuleError};
    pub use crate::home::{HomeLoop, ModuleHandle};
    pub use crate::module::{HeadlessManager, ManagerHandle, Module, ModuleBase, ModuleContext, ModuleSchema};
    pub use crate::notification::{DisplayQueue, Notification, NotificationKind};
    pub use crate::state::{HookPoint, LifecycleEvent, ModuleState, StateChange};
    pub use crate::state_machine::{StateChangeReceiver, TransitionOutcome};
    pub use crate::status_var::StatusVar;
    pub use once_cell::sync::Lazy;
}

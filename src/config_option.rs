//! Declarative configuration options.
//!
//! A module type declares its options once in its [`ModuleSchema`](crate::module::ModuleSchema).
//! At construction every option is resolved against the raw host configuration
//! and the result is frozen in [`ConfigOptions`]. Nothing re-applies
//! configuration later.
//!
//! ```rust,ignore
//! ConfigOption::new("exposure_ms", json!(100.0))
//!     .missing(MissingPolicy::Warn)
//!     .with_checker(|v| v.as_f64().is_some_and(|ms| ms > 0.0))
//! ```

use crate::error::{AppResult, ModuleError};
use crate::module::ModuleInfo;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};

/// Checker callback: `true` if the raw value is acceptable.
pub type Checker = Arc<dyn Fn(&Value) -> bool + Send + Sync>;

/// Converter callback: forces a type interpretation, fails on bad input.
pub type Converter = Arc<dyn Fn(Value) -> anyhow::Result<Value> + Send + Sync>;

/// Constructor callback: builds the final value with access to the instance identity.
pub type OptionConstructor = Arc<dyn Fn(&ModuleInfo, Value) -> anyhow::Result<Value> + Send + Sync>;

/// What to do when an option is absent from the raw configuration.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MissingPolicy {
    /// Refuse to construct the module.
    Error,
    /// Use the default and log a warning.
    Warn,
    /// Use the default and log at info level.
    Info,
    /// Use the default quietly.
    #[default]
    Silent,
}

/// Declaration of one configuration option.
#[derive(Clone)]
pub struct ConfigOption {
    name: &'static str,
    default: Value,
    missing: MissingPolicy,
    checker: Option<Checker>,
    converter: Option<Converter>,
    constructor: Option<OptionConstructor>,
}

impl fmt::Debug for ConfigOption {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConfigOption")
            .field("name", &self.name)
            .field("default", &self.default)
            .field("missing", &self.missing)
            .field("checker", &self.checker.as_ref().map(|_| "<fn>"))
            .field("converter", &self.converter.as_ref().map(|_| "<fn>"))
            .field("constructor", &self.constructor.as_ref().map(|_| "<fn>"))
            .finish()
    }
}

impl ConfigOption {
    /// Declare an option with a default and the `silent` missing policy.
    pub fn new(name: &'static str, default: Value) -> Self {
        Self {
            name,
            default,
            missing: MissingPolicy::Silent,
            checker: None,
            converter: None,
            constructor: None,
        }
    }

    /// Declare an option that must be present in the configuration.
    pub fn required(name: &'static str) -> Self {
        Self::new(name, Value::Null).missing(MissingPolicy::Error)
    }

    /// Set the missing policy.
    pub fn missing(mut self, policy: MissingPolicy) -> Self {
        self.missing = policy;
        self
    }

    /// Attach a checker. Only values present in the raw configuration are checked.
    pub fn with_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn(&Value) -> bool + Send + Sync + 'static,
    {
        self.checker = Some(Arc::new(checker));
        self
    }

    /// Attach a converter.
    pub fn with_converter<F>(mut self, converter: F) -> Self
    where
        F: Fn(Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.converter = Some(Arc::new(converter));
        self
    }

    /// Attach a constructor function.
    pub fn with_constructor<F>(mut self, constructor: F) -> Self
    where
        F: Fn(&ModuleInfo, Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        self.constructor = Some(Arc::new(constructor));
        self
    }

    /// Option name as it appears in the configuration.
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Default used when the option is absent.
    pub fn default_value(&self) -> &Value {
        &self.default
    }

    /// Missing policy.
    pub fn missing_policy(&self) -> MissingPolicy {
        self.missing
    }

    /// Run the checker, if any. Without a checker every value passes.
    pub fn check(&self, value: &Value) -> bool {
        self.checker.as_ref().map_or(true, |checker| checker(value))
    }

    /// Run the converter, if any. Without a converter the value passes through.
    pub fn convert(&self, value: Value) -> anyhow::Result<Value> {
        match &self.converter {
            Some(converter) => converter(value),
            None => Ok(value),
        }
    }

    /// Resolve this option against a raw configuration.
    pub(crate) fn resolve(&self, info: &ModuleInfo, config: &Map<String, Value>) -> AppResult<Value> {
        let raw = match config.get(self.name) {
            Some(value) => {
                if !self.check(value) {
                    return Err(self.error(info, format!("value {} rejected by checker", value)));
                }
                value.clone()
            }
            None => {
                let msg = format!(
                    "No ConfigOption >>{}<< configured, using default value {} instead.",
                    self.name, self.default
                );
                match self.missing {
                    MissingPolicy::Error => {
                        return Err(self.error(info, "required option not given in configuration".into()));
                    }
                    MissingPolicy::Warn => warn!(module = %info.name(), "{}", msg),
                    MissingPolicy::Info => info!(module = %info.name(), "{}", msg),
                    MissingPolicy::Silent => {}
                }
                self.default.clone()
            }
        };

        let converted = self
            .convert(raw)
            .map_err(|e| self.error(info, format!("conversion failed: {:#}", e)))?;

        match &self.constructor {
            Some(constructor) => constructor(info, converted)
                .map_err(|e| self.error(info, format!("constructor failed: {:#}", e))),
            None => Ok(converted),
        }
    }

    fn error(&self, info: &ModuleInfo, reason: String) -> ModuleError {
        ModuleError::Configuration {
            module: info.name().to_string(),
            option: self.name.to_string(),
            reason,
        }
    }
}

/// Options bound to one module instance, in declaration order.
///
/// Read-only after construction.
#[derive(Debug, Clone, Default)]
pub struct ConfigOptions {
    module: String,
    values: Map<String, Value>,
}

impl ConfigOptions {
    /// Resolve every declared option. Fails on the first configuration error.
    pub(crate) fn bind(
        declared: &[ConfigOption],
        info: &ModuleInfo,
        config: &Map<String, Value>,
    ) -> AppResult<Self> {
        let mut values = Map::new();
        for option in declared {
            let value = option.resolve(info, config)?;
            values.insert(option.name().to_string(), value);
        }
        Ok(Self {
            module: info.name().to_string(),
            values,
        })
    }

    /// Bound JSON value of an option.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.values.get(name)
    }

    /// Bound value deserialized into `T`.
    pub fn value<T: DeserializeOwned>(&self, name: &str) -> AppResult<T> {
        let value = self.get(name).ok_or_else(|| ModuleError::UnknownOption {
            module: self.module.clone(),
            option: name.to_string(),
        })?;
        serde_json::from_value(value.clone()).map_err(|source| ModuleError::OptionType {
            module: self.module.clone(),
            option: name.to_string(),
            source,
        })
    }

    /// Iterate over `(name, value)` in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }

    /// Number of bound options.
    pub fn len(&self) -> usize {
        self.values.len()
    }

    /// Whether no options were declared.
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

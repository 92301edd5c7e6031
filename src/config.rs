//! Host configuration using Figment.
//!
//! The host describes itself and the modules it creates in one TOML file:
//!
//! ```toml
//! [application]
//! name = "confocal bench"
//! log_level = "info"
//! data_root = "/srv/data"
//!
//! [[modules]]
//! name = "counter"
//! base = "hardware"
//! [modules.options]
//! x = 3
//! [modules.connect]
//! meter = "newport"
//! ```
//!
//! Environment variables prefixed with `DAQ_MODULE_` override the file.
//! Nested keys are separated by a double underscore, e.g.
//! `DAQ_MODULE_APPLICATION__LOG_LEVEL=debug`.

use crate::error::{AppResult, ModuleError};
use crate::logging::parse_log_level;
use crate::module::{ManagerHandle, ModuleBase};
use crate::notification::DisplayQueue;
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};

/// Prefix of environment overrides.
pub const ENV_PREFIX: &str = "DAQ_MODULE_";

/// Top-level host configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HostConfig {
    /// Application settings
    pub application: ApplicationConfig,
    /// Module definitions, in creation order
    #[serde(default)]
    pub modules: Vec<ModuleDefinition>,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApplicationConfig {
    /// Application name
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Root of measurement data. Defaults to `~/Data`.
    #[serde(default)]
    pub data_root: Option<PathBuf>,
    /// Split data directories per day
    #[serde(default = "default_true")]
    pub daily_data_dirs: bool,
}

/// One module the host should create.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModuleDefinition {
    /// Unique instance name
    pub name: String,
    /// Module category
    #[serde(default)]
    pub base: ModuleBase,
    /// Whether the host creates this module at all
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Raw module configuration, bound to the module's config options
    #[serde(default)]
    pub options: Map<String, Value>,
    /// Connector name -> name of the providing module
    #[serde(default)]
    pub connect: BTreeMap<String, String>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_true() -> bool {
    true
}

impl HostConfig {
    /// Load configuration from a TOML file and `DAQ_MODULE_` environment variables.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        Ok(Self::figment(path.as_ref()).extract()?)
    }

    /// Load and validate.
    pub fn load_validated<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let config = Self::load_from(path)?;
        config.validate()?;
        Ok(config)
    }

    fn figment(path: &Path) -> Figment {
        Figment::new()
            .merge(Toml::file(path))
            .merge(Env::prefixed(ENV_PREFIX).split("__"))
    }

    /// Validate configuration after loading
    pub fn validate(&self) -> AppResult<()> {
        parse_log_level(&self.application.log_level).map_err(ModuleError::InvalidHostConfig)?;

        let mut names = HashSet::new();
        for module in &self.modules {
            if module.name.trim().is_empty() {
                return Err(ModuleError::InvalidHostConfig(
                    "module name must not be empty".to_string(),
                ));
            }
            if !names.insert(module.name.as_str()) {
                return Err(ModuleError::InvalidHostConfig(format!(
                    "Duplicate module name: {}",
                    module.name
                )));
            }
        }

        let known: HashSet<&str> = self.modules.iter().map(|m| m.name.as_str()).collect();
        for module in &self.modules {
            for (connector, target) in &module.connect {
                if !known.contains(target.as_str()) {
                    return Err(ModuleError::InvalidHostConfig(format!(
                        "Module '{}': connector '{}' points to unknown module '{}'",
                        module.name, connector, target
                    )));
                }
            }
        }

        Ok(())
    }

    /// Definition of a module by name.
    pub fn module(&self, name: &str) -> Option<&ModuleDefinition> {
        self.modules.iter().find(|m| m.name == name)
    }

    /// All enabled modules, in creation order.
    pub fn enabled_modules(&self) -> Vec<&ModuleDefinition> {
        self.modules.iter().filter(|m| m.enabled).collect()
    }
}

impl ModuleDefinition {
    /// Copy of the raw module configuration.
    pub fn raw_config(&self) -> Map<String, Value> {
        self.options.clone()
    }
}

/// [`ManagerHandle`] backed by the host configuration.
#[derive(Debug, Clone)]
pub struct HostManager {
    data_root: Option<PathBuf>,
    daily_data_dirs: bool,
    display: Option<DisplayQueue>,
}

impl HostManager {
    /// Headless manager using the application's data settings.
    pub fn new(application: &ApplicationConfig) -> Self {
        Self {
            data_root: application.data_root.clone(),
            daily_data_dirs: application.daily_data_dirs,
            display: None,
        }
    }

    /// Route notifications to an interactive display.
    pub fn with_display(mut self, display: DisplayQueue) -> Self {
        self.display = Some(display);
        self
    }
}

impl ManagerHandle for HostManager {
    fn display(&self) -> Option<DisplayQueue> {
        self.display.clone()
    }

    fn data_root(&self) -> Option<PathBuf> {
        self.data_root.clone()
    }

    fn daily_data_dirs(&self) -> bool {
        self.daily_data_dirs
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use serial_test::serial;
    use std::io::Write;

    const BENCH: &str = r#"
[application]
name = "confocal bench"
data_root = "/srv/data"
daily_data_dirs = false

[[modules]]
name = "newport"
base = "hardware"

[[modules]]
name = "counter"
[modules.options]
x = 3
label = "apd"
[modules.connect]
meter = "newport"
"#;

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn application(log_level: &str) -> ApplicationConfig {
        ApplicationConfig {
            name: "Test".to_string(),
            log_level: log_level.to_string(),
            data_root: None,
            daily_data_dirs: true,
        }
    }

    fn definition(name: &str) -> ModuleDefinition {
        ModuleDefinition {
            name: name.to_string(),
            base: ModuleBase::Logic,
            enabled: true,
            options: Map::new(),
            connect: BTreeMap::new(),
        }
    }

    #[test]
    #[serial]
    fn loads_modules_from_toml() {
        let file = write_config(BENCH);
        let config = HostConfig::load_validated(file.path()).unwrap();

        assert_eq!(config.application.name, "confocal bench");
        assert_eq!(config.application.log_level, "info");
        assert_eq!(config.modules.len(), 2);

        let counter = config.module("counter").unwrap();
        assert_eq!(counter.base, ModuleBase::Logic);
        assert_eq!(counter.raw_config()["x"], json!(3));
        assert_eq!(counter.raw_config()["label"], json!("apd"));
        assert_eq!(counter.connect["meter"], "newport");
        assert_eq!(config.module("newport").unwrap().base, ModuleBase::Hardware);
    }

    #[test]
    #[serial]
    fn environment_overrides_file() {
        let file = write_config(BENCH);
        std::env::set_var("DAQ_MODULE_APPLICATION__LOG_LEVEL", "debug");
        let result = HostConfig::load_from(file.path());
        std::env::remove_var("DAQ_MODULE_APPLICATION__LOG_LEVEL");

        assert_eq!(result.unwrap().application.log_level, "debug");
    }

    #[test]
    #[serial]
    fn missing_application_section_is_an_error() {
        let file = write_config("[[modules]]\nname = \"counter\"\n");
        assert!(matches!(
            HostConfig::load_from(file.path()),
            Err(ModuleError::HostConfig(_))
        ));
    }

    #[test]
    fn invalid_log_level_fails_validation() {
        let config = HostConfig {
            application: application("loud"),
            modules: vec![],
        };
        assert!(matches!(config.validate(), Err(ModuleError::InvalidHostConfig(_))));
    }

    #[test]
    fn duplicate_module_names_fail_validation() {
        let config = HostConfig {
            application: application("info"),
            modules: vec![definition("counter"), definition("counter")],
        };
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("Duplicate module name: counter"));
    }

    #[test]
    fn dangling_connection_fails_validation() {
        let mut counter = definition("counter");
        counter.connect.insert("meter".into(), "thorlabs".into());
        let config = HostConfig {
            application: application("info"),
            modules: vec![counter],
        };
        assert!(config.validate().unwrap_err().to_string().contains("thorlabs"));
    }

    #[test]
    fn disabled_modules_are_skipped() {
        let mut spare = definition("spare");
        spare.enabled = false;
        let config = HostConfig {
            application: application("info"),
            modules: vec![definition("counter"), spare],
        };
        let names: Vec<_> = config.enabled_modules().iter().map(|m| m.name.as_str()).collect();
        assert_eq!(names, ["counter"]);
    }

    #[test]
    fn host_manager_reports_application_settings() {
        let mut app = application("info");
        app.data_root = Some(PathBuf::from("/srv/data"));
        app.daily_data_dirs = false;

        let (queue, _rx) = DisplayQueue::channel(4);
        let manager = HostManager::new(&app).with_display(queue);
        assert_eq!(manager.data_root(), Some(PathBuf::from("/srv/data")));
        assert!(!manager.daily_data_dirs());
        assert!(manager.display().is_some());
        assert!(HostManager::new(&app).display().is_none());
    }
}

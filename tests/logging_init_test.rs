//! Global subscriber installation. Kept in its own test binary since it
//! sets the process-wide dispatcher.

use daq_module::config::{ApplicationConfig, HostConfig};
use daq_module::logging::{self, OutputFormat, TracingConfig};
use tracing::Level;

#[test]
fn init_is_idempotent_and_honours_host_level() {
    let config = HostConfig {
        application: ApplicationConfig {
            name: "bench".to_string(),
            log_level: "debug".to_string(),
            data_root: None,
            daily_data_dirs: true,
        },
        modules: vec![],
    };

    assert!(logging::init_from_config(&config).is_ok());
    assert!(logging::init(TracingConfig::new(Level::WARN).with_format(OutputFormat::Json)).is_ok());
    tracing::info!(module = "bench", "Logging initialised twice");
}

#[test]
fn invalid_host_level_is_reported() {
    let config = HostConfig {
        application: ApplicationConfig {
            name: "bench".to_string(),
            log_level: "chatty".to_string(),
            data_root: None,
            daily_data_dirs: true,
        },
        modules: vec![],
    };
    let err = logging::init_from_config(&config).unwrap_err();
    assert!(err.contains("chatty"));
}

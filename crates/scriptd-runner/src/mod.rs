pub mod config;
pub mod logging;
pub mod paths;
pub mod scripts;
mod service_runner;

pub use config::{ConfigLoadError, LoggingConfig, ScriptdConfig, ScriptsConfig};
pub use logging::{init_logging, init_logging_with_default};
pub use paths::ScriptdPaths;
pub use scripts::{ScriptLoadError, load_module_files};
pub use service_runner::{BuildError, DEFAULT_SWEEP_INTERVAL, ServiceRunner, ServiceRunnerBuilder};

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use scriptd_api::ModuleFile;
use scriptd_host::{Runtime, RuntimeBuilder, RuntimeConfig};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::paths::ScriptdPaths;
use crate::scripts::{ScriptLoadError, load_module_files};

pub const DEFAULT_PROJECT_ID: &str = "default";
pub const DEFAULT_ENTRY: &str = "main";
pub const DEFAULT_EXTENSION: &str = "js";

#[derive(Debug, thiserror::Error)]
pub enum ConfigLoadError {
    #[error("Config file not found")]
    NotFound,

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("IO error reading config: {0}")]
    IoError(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptsConfig {
    /// Directory holding module files; the per-user scripts dir when unset
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,

    /// Module run by the service at startup
    pub entry: String,

    /// Only files with this extension are loaded as modules
    pub extension: String,
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: None,
            entry: DEFAULT_ENTRY.to_string(),
            extension: DEFAULT_EXTENSION.to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Also log to a file in the data directory
    pub file: bool,
}

/// Contents of `config.toml`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScriptdConfig {
    pub project_id: String,
    pub runtime: RuntimeConfig,
    pub scripts: ScriptsConfig,
    pub logging: LoggingConfig,
}

impl Default for ScriptdConfig {
    fn default() -> Self {
        Self {
            project_id: DEFAULT_PROJECT_ID.to_string(),
            runtime: RuntimeConfig::default(),
            scripts: ScriptsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl ScriptdConfig {
    pub fn config_path() -> Result<PathBuf, ConfigLoadError> {
        ScriptdPaths::new()
            .map(|paths| paths.config_file())
            .ok_or_else(|| ConfigLoadError::IoError("Failed to determine config directory".to_string()))
    }

    pub fn load() -> Result<Self, ConfigLoadError> {
        Self::load_from(&Self::config_path()?)
    }

    pub fn load_from(path: &Path) -> Result<Self, ConfigLoadError> {
        if !path.exists() {
            return Err(ConfigLoadError::NotFound);
        }

        let content = fs::read_to_string(path).map_err(|e| ConfigLoadError::IoError(e.to_string()))?;
        let config = Self::parse(&content)?;
        info!(target: "runner", "Loaded config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigLoadError> {
        toml::from_str(content).map_err(|e| ConfigLoadError::ParseError(e.to_string()))
    }

    /// Load the default config file, falling back to defaults only when it is absent
    pub fn load_or_default() -> Result<Self, ConfigLoadError> {
        match Self::load() {
            Err(ConfigLoadError::NotFound) => Ok(Self::default()),
            other => other,
        }
    }

    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let path = Self::config_path()?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> anyhow::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("creating {}", parent.display()))?;
        }

        let content = self.to_toml()?;
        fs::write(path, content).with_context(|| format!("writing {}", path.display()))?;
        info!(target: "runner", "Saved config to {}", path.display());
        Ok(())
    }

    pub fn to_toml(&self) -> anyhow::Result<String> {
        toml::to_string_pretty(self).context("serializing config")
    }

    /// Configured scripts directory, or the per-user default
    pub fn scripts_dir(&self) -> Option<PathBuf> {
        self.scripts
            .dir
            .clone()
            .or_else(|| ScriptdPaths::new().map(|paths| paths.scripts_dir()))
    }

    /// Module files from the scripts directory, filtered by the configured extension
    pub fn module_files(&self) -> Result<Vec<ModuleFile>, ScriptLoadError> {
        let dir = self.scripts_dir().ok_or(ScriptLoadError::NoScriptsDir)?;
        load_module_files(&dir, &self.scripts.extension)
    }

    /// A runtime builder carrying this config's project and tunables
    pub fn runtime_builder(&self) -> RuntimeBuilder {
        Runtime::builder(self.project_id.clone()).with_config(self.runtime.clone())
    }

    /// [`Self::runtime_builder`] preloaded with [`Self::module_files`]
    pub fn runtime_builder_with_scripts(&self) -> Result<RuntimeBuilder, ScriptLoadError> {
        Ok(self.runtime_builder().with_files(self.module_files()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use scriptd_host::OverlapPolicy;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = ScriptdConfig::parse("").unwrap();
        assert_eq!(config, ScriptdConfig::default());
        assert_eq!(config.project_id, "default");
        assert_eq!(config.scripts.entry, "main");
        assert!(!config.logging.file);
    }

    #[test]
    fn test_partial_runtime_section() {
        let config = ScriptdConfig::parse(
            r#"
project_id = "shop"

[runtime]
pool_size = 4
overlap = "allow"

[logging]
file = true
"#,
        )
        .unwrap();

        assert_eq!(config.project_id, "shop");
        assert_eq!(config.runtime.effective_pool_size(), 4);
        assert_eq!(config.runtime.overlap, OverlapPolicy::Allow);
        assert_eq!(config.runtime.task_history, RuntimeConfig::default().task_history);
        assert!(config.logging.file);
    }

    #[test]
    fn test_parse_error() {
        let err = ScriptdConfig::parse("project_id = [").unwrap_err();
        assert!(matches!(err, ConfigLoadError::ParseError(_)));

        let err = ScriptdConfig::parse("[runtime]\noverlap = \"sometimes\"").unwrap_err();
        assert!(matches!(err, ConfigLoadError::ParseError(_)));
    }

    #[test]
    fn test_load_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = ScriptdConfig::load_from(&dir.path().join("config.toml")).unwrap_err();
        assert!(matches!(err, ConfigLoadError::NotFound));
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("config.toml");

        let mut config = ScriptdConfig::default();
        config.project_id = "inventory".to_string();
        config.scripts.dir = Some(dir.path().join("scripts"));
        config.runtime.shutdown_timeout_ms = 500;
        config.save_to(&path).unwrap();

        let loaded = ScriptdConfig::load_from(&path).unwrap();
        assert_eq!(loaded, config);
        assert_eq!(loaded.scripts_dir(), Some(dir.path().join("scripts")));
    }

    #[test]
    fn test_module_files_use_configured_dir_and_extension() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("main.ts"), "src:main").unwrap();
        fs::write(dir.path().join("users.ts"), "src:users").unwrap();
        fs::write(dir.path().join("legacy.js"), "ignored").unwrap();

        let mut config = ScriptdConfig::default();
        config.scripts.dir = Some(dir.path().to_path_buf());
        config.scripts.extension = "ts".to_string();

        let names: Vec<String> = config.module_files().unwrap().into_iter().map(|f| f.name).collect();
        assert_eq!(names, vec!["main", "users"]);

        let engine = std::sync::Arc::new(scriptd_api::NativeEngine::new("native"));
        let rt = tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap();
        let runtime = config
            .runtime_builder_with_scripts()
            .unwrap()
            .with_engine("native", move || Ok(engine))
            .with_handle(rt.handle().clone())
            .build()
            .unwrap();
        assert_eq!(runtime.modules().module_names(), vec!["main", "users"]);
        runtime.shutdown_engine();
    }

    #[test]
    fn test_module_files_missing_dir() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = ScriptdConfig::default();
        config.scripts.dir = Some(dir.path().join("absent"));

        assert!(matches!(
            config.runtime_builder_with_scripts(),
            Err(ScriptLoadError::MissingDirectory(_))
        ));
    }
}

use directories::ProjectDirs;
use std::path::PathBuf;

pub const APP_NAME: &str = "scriptd";

/// Per-user locations for configuration, scripts and logs.
///
/// Follows the platform conventions `directories` resolves: XDG on Linux,
/// `Library/Application Support` on macOS and `%APPDATA%` on Windows.
pub struct ScriptdPaths {
    dirs: ProjectDirs,
}

impl ScriptdPaths {
    /// `None` when no home directory can be determined
    pub fn new() -> Option<Self> {
        ProjectDirs::from("", "", APP_NAME).map(|dirs| Self { dirs })
    }

    pub fn config_dir(&self) -> PathBuf {
        self.dirs.config_dir().to_path_buf()
    }

    pub fn data_dir(&self) -> PathBuf {
        self.dirs.data_dir().to_path_buf()
    }

    pub fn config_file(&self) -> PathBuf {
        self.config_dir().join("config.toml")
    }

    pub fn scripts_dir(&self) -> PathBuf {
        self.config_dir().join("scripts")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir().join("logs")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_paths_contain_app_name() {
        if let Some(paths) = ScriptdPaths::new() {
            assert!(paths.config_file().to_string_lossy().contains(APP_NAME));
            assert!(paths.config_file().ends_with("config.toml"));
            assert!(paths.scripts_dir().ends_with("scripts"));
            assert!(paths.log_dir().starts_with(paths.data_dir()));
        }
    }
}

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use scriptd_api::ModuleFile;

#[derive(Debug, thiserror::Error)]
pub enum ScriptLoadError {
    #[error("script directory {0} does not exist")]
    MissingDirectory(PathBuf),

    #[error("no scripts directory configured and no per-user default available")]
    NoScriptsDir,

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Read every `*.<extension>` file in `dir` as a module named after its stem.
///
/// Unreadable files are skipped with a warning. Hidden files and
/// subdirectories are ignored. The result is sorted by module name.
pub fn load_module_files(dir: &Path, extension: &str) -> Result<Vec<ModuleFile>, ScriptLoadError> {
    if !dir.is_dir() {
        return Err(ScriptLoadError::MissingDirectory(dir.to_path_buf()));
    }

    let entries = fs::read_dir(dir).map_err(|source| ScriptLoadError::Io {
        path: dir.to_path_buf(),
        source,
    })?;

    let mut files = Vec::new();
    for entry in entries.flatten() {
        let path = entry.path();
        if !path.is_file() || path.extension().and_then(|s| s.to_str()) != Some(extension) {
            continue;
        }

        let Some(name) = path.file_stem().and_then(|s| s.to_str()) else {
            continue;
        };
        if name.starts_with('.') {
            continue;
        }

        match fs::read_to_string(&path) {
            Ok(source) => files.push(ModuleFile::new(name, source)),
            Err(e) => warn!(target: "runner", "Failed to read module {}: {}", path.display(), e),
        }
    }

    files.sort_by(|a, b| a.name.cmp(&b.name));
    info!(target: "runner", "Loaded {} module file(s) from {}", files.len(), dir.display());
    Ok(files)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loads_matching_files_sorted() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("users.js"), "exports.list = 1").unwrap();
        fs::write(dir.path().join("main.js"), "require('users')").unwrap();
        fs::write(dir.path().join("notes.txt"), "ignored").unwrap();
        fs::write(dir.path().join(".hidden.js"), "ignored").unwrap();
        fs::create_dir(dir.path().join("lib.js")).unwrap();

        let files = load_module_files(dir.path(), "js").unwrap();
        let names: Vec<&str> = files.iter().map(|f| f.name.as_str()).collect();
        assert_eq!(names, vec!["main", "users"]);
        assert_eq!(files[0].source, "require('users')");
    }

    #[test]
    fn test_names_are_case_sensitive() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("Users.js"), "a").unwrap();

        let files = load_module_files(dir.path(), "js").unwrap();
        assert_eq!(files, vec![ModuleFile::new("Users", "a")]);
    }

    #[test]
    fn test_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let err = load_module_files(&dir.path().join("nope"), "js").unwrap_err();
        assert!(matches!(err, ScriptLoadError::MissingDirectory(_)));
    }
}

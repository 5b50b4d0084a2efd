use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, warn};

use crate::dispatcher::Invoker;
use scriptd_api::{ExportCollector, ModuleExports, ModuleFile, ScriptError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum ModuleError {
    #[error("module '{0}' not found")]
    NotFound(String),

    #[error("cyclic require of module '{0}'")]
    Cycle(String),

    #[error("module '{name}' failed to load: {source}")]
    Execution {
        name: String,
        #[source]
        source: ScriptError,
    },
}

impl From<ModuleError> for ScriptError {
    fn from(e: ModuleError) -> Self {
        match e {
            ModuleError::Execution { source, .. } => source,
            other => ScriptError::Host(other.to_string()),
        }
    }
}

#[derive(Default)]
struct LoaderState {
    cache: HashMap<String, Arc<ModuleExports>>,
    loading: HashSet<String>,
}

/// Resolves `require(name)` against the session's fixed file set.
///
/// Module names are a flat, case-sensitive namespace. A module body runs at
/// most once per successful load; failed loads are not cached and can be
/// retried.
pub struct ModuleLoader {
    files: HashMap<String, ModuleFile>,
    state: Mutex<LoaderState>,
    invoker: Arc<dyn Invoker>,
}

/// Clears a module's loading mark on every exit path
struct LoadingGuard<'a> {
    state: &'a Mutex<LoaderState>,
    name: &'a str,
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        self.state.lock().loading.remove(self.name);
    }
}

impl ModuleLoader {
    pub fn new(files: impl IntoIterator<Item = ModuleFile>, invoker: Arc<dyn Invoker>) -> Self {
        let files = files
            .into_iter()
            .map(|file| (file.name.clone(), file))
            .collect();
        Self {
            files,
            state: Mutex::new(LoaderState::default()),
            invoker,
        }
    }

    pub fn require(&self, name: &str) -> Result<Arc<ModuleExports>, ModuleError> {
        let file = {
            let mut state = self.state.lock();
            if let Some(exports) = state.cache.get(name) {
                return Ok(exports.clone());
            }
            if state.loading.contains(name) {
                warn!(target: "modules", "Cyclic require of '{}'", name);
                return Err(ModuleError::Cycle(name.to_string()));
            }
            let file = self
                .files
                .get(name)
                .ok_or_else(|| ModuleError::NotFound(name.to_string()))?;
            state.loading.insert(name.to_string());
            file
        };

        let _guard = LoadingGuard {
            state: &self.state,
            name,
        };

        debug!(target: "modules", "Loading module '{}'", name);

        let exports = Arc::new(ModuleExports::new(name));
        self.invoker
            .eval_module(file, ExportCollector::new(exports.clone()))
            .map_err(|source| ModuleError::Execution {
                name: name.to_string(),
                source,
            })?;

        self.state
            .lock()
            .cache
            .insert(name.to_string(), exports.clone());

        debug!(target: "modules", "Loaded module '{}' ({} exports)", name, exports.len());
        Ok(exports)
    }

    pub fn is_loaded(&self, name: &str) -> bool {
        self.state.lock().cache.contains_key(name)
    }

    /// Every module name in the file set, sorted
    pub fn module_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.files.keys().cloned().collect();
        names.sort();
        names
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestInvoker;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_require_caches_exports() {
        let invoker = Arc::new(TestInvoker::new());
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        invoker.engine().define_module("src:math", move |exports| {
            counter.fetch_add(1, Ordering::SeqCst);
            exports.export("pi", json!(3));
            exports.export("e", json!(2));
            Ok(())
        });

        let loader = ModuleLoader::new([ModuleFile::new("math", "src:math")], invoker);
        let first = loader.require("math").unwrap();
        let second = loader.require("math").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(runs.load(Ordering::SeqCst), 1);
        assert_eq!(first.keys(), vec!["e".to_string(), "pi".to_string()]);
        assert!(loader.is_loaded("math"));
    }

    #[test]
    fn test_unknown_module_and_case_sensitivity() {
        let invoker = Arc::new(TestInvoker::new());
        invoker.engine().define_module("src:utils", |_| Ok(()));
        let loader = ModuleLoader::new([ModuleFile::new("utils", "src:utils")], invoker);

        assert!(matches!(loader.require("Utils"), Err(ModuleError::NotFound(_))));
        assert!(matches!(loader.require("missing"), Err(ModuleError::NotFound(_))));
        assert_eq!(loader.module_names(), vec!["utils".to_string()]);
    }

    #[test]
    fn test_failed_load_is_retryable() {
        let invoker = Arc::new(TestInvoker::new());
        let attempts = Arc::new(AtomicUsize::new(0));
        let counter = attempts.clone();
        invoker.engine().define_module("src:flaky", move |exports| {
            if counter.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(ScriptError::Thrown("first load fails".to_string()));
            }
            exports.export("ok", json!(true));
            Ok(())
        });
        let loader = ModuleLoader::new([ModuleFile::new("flaky", "src:flaky")], invoker);

        let err = loader.require("flaky").unwrap_err();
        assert!(matches!(err, ModuleError::Execution { .. }));
        assert!(!loader.is_loaded("flaky"));

        let exports = loader.require("flaky").unwrap();
        assert_eq!(exports.get("ok").unwrap().as_json(), Some(&json!(true)));
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }
}

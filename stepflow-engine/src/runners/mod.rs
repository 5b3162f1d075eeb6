// Runners Module
// Recipe and plugin executors, and the registry that resolves step types to them

pub mod script;

pub use script::{ScriptConfig, ScriptExecutor, ScriptRunner};

use crate::expression::ImplicitInput;
use crate::parser::models::{ArgumentMap, KindTag, OutputMap};

use indexmap::IndexMap;
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// File name suffixes tried when looking a type up in a search directory
const SCRIPT_SUFFIXES: &[&str] = &["", ".sh", ".py"];

/// Suffixes of a type's default argument file
const DEFAULTS_SUFFIXES: &[&str] = &[".parset", ".yaml", ".yml"];

/// Errors raised by a recipe or plugin
#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("failed to start '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("'{program}' exited with code {code:?}: {stderr}")]
    ExitStatus {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("'{program}' timed out after {timeout:?}")]
    Timeout { program: String, timeout: Duration },

    #[error("{0}")]
    Failed(String),
}

impl ExecutorError {
    pub fn failed(message: impl Into<String>) -> Self {
        ExecutorError::Failed(message.into())
    }
}

/// Everything an executor receives for one step run
#[derive(Debug, Clone)]
pub struct Invocation {
    pub kind: KindTag,
    pub type_id: String,
    pub step_name: String,
    /// Positional arguments, references resolved
    pub cmdline: Vec<String>,
    /// Named arguments, references resolved
    pub arguments: ArgumentMap,
    /// Resolved argument file written for this run
    pub argument_file: Option<PathBuf>,
    pub environment: IndexMap<String, String>,
    /// Artifact-list outputs this step consumes
    pub implicit_inputs: Vec<ImplicitInput>,
    pub working_dir: PathBuf,
}

/// Trait for recipe and plugin executors
#[async_trait::async_trait]
pub trait StepExecutor: Send + Sync {
    /// Run one step. `Ok(None)` means the step produced no result entry.
    async fn execute(&self, invocation: &Invocation) -> Result<Option<OutputMap>, ExecutorError>;
}

/// An executor found for a step type, with its default argument file
#[derive(Clone)]
pub struct ResolvedExecutor {
    pub executor: Arc<dyn StepExecutor>,
    pub default_arguments: Option<PathBuf>,
}

impl fmt::Debug for ResolvedExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResolvedExecutor")
            .field("default_arguments", &self.default_arguments)
            .finish_non_exhaustive()
    }
}

/// Registered executors and search paths for one kind
#[derive(Default, Clone)]
struct KindRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
    defaults: HashMap<String, PathBuf>,
    search_dirs: Vec<PathBuf>,
}

impl KindRegistry {
    fn resolve(&self, type_id: &str, runner: &ScriptRunner) -> Option<ResolvedExecutor> {
        if let Some(executor) = self.executors.get(type_id) {
            return Some(ResolvedExecutor {
                executor: executor.clone(),
                default_arguments: self.defaults.get(type_id).cloned(),
            });
        }

        for dir in &self.search_dirs {
            if let Some(path) = find_script(dir, type_id) {
                let default_arguments = self
                    .defaults
                    .get(type_id)
                    .cloned()
                    .or_else(|| find_defaults(dir, type_id));
                return Some(ResolvedExecutor {
                    executor: Arc::new(ScriptExecutor::new(path, runner.clone())),
                    default_arguments,
                });
            }
        }

        None
    }
}

/// Registry resolving `(kind, type)` to an executor. Recipes and plugins
/// share the contract but use separate tables and search paths.
#[derive(Clone, Default)]
pub struct ExecutorRegistry {
    recipes: KindRegistry,
    plugins: KindRegistry,
    runner: ScriptRunner,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a directory searched for recipe files
    pub fn with_recipe_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.recipes.search_dirs.push(dir.as_ref().to_path_buf());
        self
    }

    /// Add a directory searched for plugin files
    pub fn with_plugin_dir(mut self, dir: impl AsRef<Path>) -> Self {
        self.plugins.search_dirs.push(dir.as_ref().to_path_buf());
        self
    }

    /// Configure how file-backed recipes and plugins are run
    pub fn with_script_config(mut self, config: ScriptConfig) -> Self {
        self.runner = ScriptRunner::with_config(config);
        self
    }

    /// Register an in-process recipe
    pub fn register_recipe(mut self, type_id: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.recipes.executors.insert(type_id.into(), executor);
        self
    }

    /// Register an in-process plugin
    pub fn register_plugin(mut self, type_id: impl Into<String>, executor: Arc<dyn StepExecutor>) -> Self {
        self.plugins.executors.insert(type_id.into(), executor);
        self
    }

    /// Set the default argument file of a type
    pub fn with_defaults(mut self, kind: KindTag, type_id: impl Into<String>, path: impl AsRef<Path>) -> Self {
        let table = match kind {
            KindTag::Plugin => &mut self.plugins,
            _ => &mut self.recipes,
        };
        table.defaults.insert(type_id.into(), path.as_ref().to_path_buf());
        self
    }

    /// Resolve a recipe or plugin type; `None` for unknown types or other kinds
    pub fn resolve(&self, kind: KindTag, type_id: &str) -> Option<ResolvedExecutor> {
        match kind {
            KindTag::Recipe => self.recipes.resolve(type_id, &self.runner),
            KindTag::Plugin => self.plugins.resolve(type_id, &self.runner),
            KindTag::Loop | KindTag::Pipeline => None,
        }
    }

    pub fn contains(&self, kind: KindTag, type_id: &str) -> bool {
        self.resolve(kind, type_id).is_some()
    }
}

impl fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut recipes: Vec<&String> = self.recipes.executors.keys().collect();
        let mut plugins: Vec<&String> = self.plugins.executors.keys().collect();
        recipes.sort();
        plugins.sort();
        f.debug_struct("ExecutorRegistry")
            .field("recipes", &recipes)
            .field("plugins", &plugins)
            .field("recipe_dirs", &self.recipes.search_dirs)
            .field("plugin_dirs", &self.plugins.search_dirs)
            .finish()
    }
}

fn find_script(dir: &Path, type_id: &str) -> Option<PathBuf> {
    SCRIPT_SUFFIXES
        .iter()
        .map(|suffix| dir.join(format!("{}{}", type_id, suffix)))
        .find(|path| path.is_file())
}

fn find_defaults(dir: &Path, type_id: &str) -> Option<PathBuf> {
    DEFAULTS_SUFFIXES
        .iter()
        .map(|suffix| dir.join(format!("{}{}", type_id, suffix)))
        .find(|path| path.is_file())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::Value;

    struct Constant;

    #[async_trait::async_trait]
    impl StepExecutor for Constant {
        async fn execute(&self, _invocation: &Invocation) -> Result<Option<OutputMap>, ExecutorError> {
            let mut outputs = OutputMap::new();
            outputs.insert("ok".to_string(), Value::Bool(true));
            Ok(Some(outputs))
        }
    }

    #[test]
    fn test_registered_recipe_resolves_for_its_kind_only() {
        let registry = ExecutorRegistry::new().register_recipe("const", Arc::new(Constant));
        assert!(registry.contains(KindTag::Recipe, "const"));
        assert!(!registry.contains(KindTag::Plugin, "const"));
        assert!(!registry.contains(KindTag::Loop, "const"));
        assert!(!registry.contains(KindTag::Recipe, "other"));
    }

    #[test]
    fn test_search_dir_lookup_with_defaults() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("calibrate.sh"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("calibrate.parset"), "solint = 1\n").unwrap();
        std::fs::write(dir.path().join("image"), "#!/bin/sh\n").unwrap();

        let registry = ExecutorRegistry::new().with_plugin_dir(dir.path());

        let resolved = registry.resolve(KindTag::Plugin, "calibrate").unwrap();
        assert_eq!(
            resolved.default_arguments,
            Some(dir.path().join("calibrate.parset"))
        );

        let resolved = registry.resolve(KindTag::Plugin, "image").unwrap();
        assert!(resolved.default_arguments.is_none());

        // Plugin directories are not searched for recipes
        assert!(registry.resolve(KindTag::Recipe, "image").is_none());
    }

    #[test]
    fn test_explicit_defaults_take_priority() {
        let registry = ExecutorRegistry::new()
            .register_recipe("const", Arc::new(Constant))
            .with_defaults(KindTag::Recipe, "const", "/etc/const.parset");
        let resolved = registry.resolve(KindTag::Recipe, "const").unwrap();
        assert_eq!(
            resolved.default_arguments,
            Some(PathBuf::from("/etc/const.parset"))
        );
    }

    #[tokio::test]
    async fn test_registered_executor_runs() {
        let registry = ExecutorRegistry::new().register_recipe("const", Arc::new(Constant));
        let resolved = registry.resolve(KindTag::Recipe, "const").unwrap();
        let invocation = Invocation {
            kind: KindTag::Recipe,
            type_id: "const".to_string(),
            step_name: "a".to_string(),
            cmdline: Vec::new(),
            arguments: ArgumentMap::new(),
            argument_file: None,
            environment: IndexMap::new(),
            implicit_inputs: Vec::new(),
            working_dir: PathBuf::from("."),
        };
        let outputs = resolved.executor.execute(&invocation).await.unwrap().unwrap();
        assert_eq!(outputs.get("ok"), Some(&Value::Bool(true)));
    }
}

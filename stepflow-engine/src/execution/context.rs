// Runtime Execution Context
// Engine configuration and the state owned by the dispatch loop during one run

use crate::execution::expansion::LoopState;
use crate::parser::models::{OutputMap, ResultDict, Value};
use crate::parser::parset::Parset;

use indexmap::IndexMap;
use std::path::{Path, PathBuf};

/// Key holding the top-level step list
pub const STEPS_KEY: &str = "pipeline.steps";

/// Key declaring the pipeline's default artifact list
pub const MAPFILE_KEY: &str = "pipeline.mapfile";

/// ResultDict entry seeded with the run's global values
pub const INPUT_ENTRY: &str = "input";

/// Configuration for a pipeline run
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Job name; names the runtime subdirectory and a seeded ResultDict entry
    pub job_name: String,
    /// Working directory handed to every executor
    pub working_dir: PathBuf,
    /// Root under which per-job argument files are written
    pub runtime_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            job_name: "job".to_string(),
            working_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            runtime_dir: default_runtime_dir(),
        }
    }
}

impl EngineConfig {
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Self::default()
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = dir.into();
        self
    }

    pub fn with_runtime_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.runtime_dir = dir.into();
        self
    }

    /// `<runtime_dir>/<job>`
    pub fn job_dir(&self) -> PathBuf {
        self.runtime_dir.join(&self.job_name)
    }

    /// Directory holding the per-step argument files
    pub fn parset_dir(&self) -> PathBuf {
        self.job_dir().join("parsets")
    }

    /// Argument file path of a (disambiguated) step name
    pub fn argument_file(&self, step_name: &str) -> PathBuf {
        self.parset_dir().join(format!("{}.parset", step_name))
    }
}

/// User cache directory, falling back to the system temp directory
pub fn default_runtime_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stepflow")
}

/// State of one run, owned exclusively by the dispatch loop
#[derive(Debug)]
pub struct RunContext {
    /// Run configuration; sub-pipeline imports are merged in as they run
    pub parset: Parset,
    pub results: ResultDict,
    /// Active loops, innermost last
    pub loops: Vec<LoopState>,
    /// Recipe and plugin steps in the order they completed
    pub executed: Vec<String>,
    /// Number of visits per loop step
    pub loop_visits: IndexMap<String, usize>,
    /// Sub-pipeline files currently being imported
    pub includes: Vec<PathBuf>,
    base_dir: PathBuf,
}

impl RunContext {
    /// Create the context and seed the ResultDict
    pub fn new(parset: Parset, config: &EngineConfig) -> Self {
        let base_dir = parset.base_dir();
        let results = seed_results(&parset, config);
        let includes = parset.source().map(|p| vec![canonical(p)]).unwrap_or_default();

        Self {
            parset,
            results,
            loops: Vec::new(),
            executed: Vec::new(),
            loop_visits: IndexMap::new(),
            includes,
            base_dir,
        }
    }

    /// Directory relative paths in the top-level configuration resolve against
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn record_visit(&mut self, loop_name: &str) -> usize {
        let visits = self.loop_visits.entry(loop_name.to_string()).or_default();
        *visits += 1;
        *visits
    }

    /// Mark the innermost active loop for termination
    pub fn request_break(&mut self) -> Option<&str> {
        let state = self.loops.last_mut()?;
        state.break_requested = true;
        Some(state.name.as_str())
    }
}

fn seed_results(parset: &Parset, config: &EngineConfig) -> ResultDict {
    let mut entry = OutputMap::new();
    entry.insert(
        "parset".to_string(),
        Value::from(
            parset
                .source()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ),
    );
    entry.insert(
        "parset_dir".to_string(),
        Value::from(config.parset_dir().display().to_string()),
    );
    entry.insert("job_name".to_string(), Value::from(config.job_name.as_str()));
    entry.insert(
        "working_directory".to_string(),
        Value::from(config.working_dir.display().to_string()),
    );
    entry.insert(
        "runtime_directory".to_string(),
        Value::from(config.runtime_dir.display().to_string()),
    );
    if let Some(mapfile) = parset.get(MAPFILE_KEY) {
        entry.insert("mapfile".to_string(), Value::from(mapfile));
    }

    let mut results = ResultDict::new();
    results.record(INPUT_ENTRY, entry.clone());
    results.record(config.job_name.clone(), entry);
    results
}

/// Canonical form of a path for include-cycle checks; falls back to the
/// path itself when it cannot be resolved
pub fn canonical(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths() {
        let config = EngineConfig::new("L123").with_runtime_dir("/runtime");
        assert_eq!(config.job_dir(), PathBuf::from("/runtime/L123"));
        assert_eq!(
            config.argument_file("calibrate1"),
            PathBuf::from("/runtime/L123/parsets/calibrate1.parset")
        );
    }

    #[test]
    fn test_default_runtime_dir_is_named() {
        assert!(default_runtime_dir().ends_with("stepflow"));
    }

    #[test]
    fn test_seeded_entries() {
        let parset = Parset::from_parset_str("pipeline.mapfile = /data/in.map\n").unwrap();
        let config = EngineConfig::new("L123")
            .with_runtime_dir("/runtime")
            .with_working_dir("/work");
        let ctx = RunContext::new(parset, &config);

        for entry in [INPUT_ENTRY, "L123"] {
            assert_eq!(
                ctx.results.output(entry, "job_name"),
                Some(&Value::from("L123"))
            );
            assert_eq!(
                ctx.results.output(entry, "working_directory"),
                Some(&Value::from("/work"))
            );
            assert_eq!(
                ctx.results.output(entry, "mapfile"),
                Some(&Value::from("/data/in.map"))
            );
        }
        assert!(ctx.includes.is_empty());
    }

    #[test]
    fn test_request_break_targets_innermost_loop() {
        let mut ctx = RunContext::new(Parset::new(), &EngineConfig::new("job"));
        assert!(ctx.request_break().is_none());

        ctx.loops.push(LoopState::new("outer", 2));
        ctx.loops.push(LoopState::new("inner", 2));
        assert_eq!(ctx.request_break(), Some("inner"));
        assert!(ctx.loops[1].break_requested);
        assert!(!ctx.loops[0].break_requested);
    }
}

pub mod run;
pub mod validate;

use std::path::{Path, PathBuf};

use clap::Args;
use color_eyre::eyre::bail;
use color_eyre::Result;

use stepflow_engine::{EngineConfig, ExecutorRegistry, Parset, ScriptConfig};

/// Options shared by every command that loads a pipeline
#[derive(Args, Debug, Clone)]
pub struct PipelineArgs {
    /// Path to the pipeline configuration (.parset, .yaml)
    pub pipeline: PathBuf,

    /// Directory searched for recipes (can be repeated)
    #[arg(long = "recipe-dir", value_name = "DIR")]
    pub recipe_dirs: Vec<PathBuf>,

    /// Directory searched for plugins (can be repeated)
    #[arg(long = "plugin-dir", value_name = "DIR")]
    pub plugin_dirs: Vec<PathBuf>,

    /// Override a pipeline value (can be repeated, format: name=value)
    #[arg(long = "set", value_name = "NAME=VALUE")]
    pub overrides: Vec<String>,

    /// Job name (default: the pipeline file stem)
    #[arg(long, value_name = "NAME")]
    pub job: Option<String>,

    /// Root directory for per-job argument files
    #[arg(long, value_name = "DIR")]
    pub runtime_dir: Option<PathBuf>,

    /// Working directory handed to recipes
    #[arg(long, short = 'w', value_name = "DIR")]
    pub working_dir: Option<PathBuf>,

    /// Kill recipe processes after this many seconds
    #[arg(long, value_name = "SECONDS")]
    pub timeout: Option<u64>,
}

impl PipelineArgs {
    /// Load the configuration and append `--set` overrides
    pub fn load(&self) -> Result<Parset> {
        if !self.pipeline.exists() {
            bail!("Pipeline file not found: {}", self.pipeline.display());
        }

        let mut parset = Parset::from_file(&self.pipeline)?;
        apply_overrides(&mut parset, &self.overrides)?;
        Ok(parset)
    }

    pub fn registry(&self) -> ExecutorRegistry {
        let mut registry = ExecutorRegistry::new().with_script_config(ScriptConfig {
            timeout: self.timeout.map(std::time::Duration::from_secs),
            fail_on_stderr: false,
        });
        for dir in &self.recipe_dirs {
            registry = registry.with_recipe_dir(dir);
        }
        for dir in &self.plugin_dirs {
            registry = registry.with_plugin_dir(dir);
        }
        registry
    }

    pub fn config(&self) -> Result<EngineConfig> {
        let mut config = EngineConfig::new(self.job_name());
        config.working_dir = match &self.working_dir {
            Some(dir) => dir.clone(),
            None => std::env::current_dir()?,
        };
        if let Some(dir) = &self.runtime_dir {
            config.runtime_dir = dir.clone();
        }
        Ok(config)
    }

    fn job_name(&self) -> String {
        self.job.clone().unwrap_or_else(|| file_stem(&self.pipeline))
    }
}

fn file_stem(path: &Path) -> String {
    path.file_stem()
        .and_then(|n| n.to_str())
        .unwrap_or("pipeline")
        .to_string()
}

/// Append each `name=value` as a `! name = value` override so it wins over
/// any declaration in the file
fn apply_overrides(parset: &mut Parset, overrides: &[String]) -> Result<()> {
    for entry in overrides {
        let Some((name, value)) = entry.split_once('=') else {
            bail!("Invalid override format '{}'. Expected name=value", entry);
        };
        let name = name.trim();
        if name.is_empty() {
            bail!("Invalid override format '{}'. Name is empty", entry);
        }

        let key = format!("! {}", name);
        parset.remove(&key);
        parset.insert(key, value.trim());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overrides_are_appended_last() {
        let mut parset =
            Parset::from_parset_str("! out = /a\npipeline.replace.out = /b\nx = {{ out }}\n").unwrap();
        apply_overrides(&mut parset, &["out=/c".to_string()]).unwrap();

        let last = parset.keys().last().cloned();
        assert_eq!(last.as_deref(), Some("! out"));
        assert_eq!(parset.get("! out"), Some("/c"));
    }

    #[test]
    fn test_invalid_override() {
        let mut parset = Parset::new();
        assert!(apply_overrides(&mut parset, &["novalue".to_string()]).is_err());
        assert!(apply_overrides(&mut parset, &["=x".to_string()]).is_err());
    }

    #[test]
    fn test_load_applies_set_flags() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("calib.parset");
        std::fs::write(&path, "pipeline.steps = [prep]\n! solint = 1\n").unwrap();

        let args = PipelineArgs {
            pipeline: path,
            recipe_dirs: vec![],
            plugin_dirs: vec![],
            overrides: vec!["solint=4".to_string()],
            job: None,
            runtime_dir: Some(dir.path().join("runtime")),
            working_dir: Some(dir.path().to_path_buf()),
            timeout: None,
        };

        let parset = args.load().unwrap();
        assert_eq!(parset.get("! solint"), Some("4"));

        let config = args.config().unwrap();
        assert_eq!(config.job_name, "calib");
        assert_eq!(config.runtime_dir, dir.path().join("runtime"));
    }

    #[test]
    fn test_missing_pipeline_file() {
        let args = PipelineArgs {
            pipeline: PathBuf::from("/nonexistent/pipeline.parset"),
            recipe_dirs: vec![],
            plugin_dirs: vec![],
            overrides: vec![],
            job: Some("j".to_string()),
            runtime_dir: None,
            working_dir: None,
            timeout: None,
        };
        assert!(args.load().is_err());
        assert_eq!(args.job_name(), "j");
    }

    #[test]
    fn test_job_name_defaults_to_file_stem() {
        assert_eq!(file_stem(Path::new("/pipelines/L12345.parset")), "L12345");
    }
}

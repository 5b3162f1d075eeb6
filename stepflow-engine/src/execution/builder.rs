// Step Definition Builder
// Turns step names into structured Step records and writes their argument files

use crate::error::{ConfigError, EngineError, EngineResult};
use crate::execution::context::EngineConfig;
use crate::parser::models::{ArgumentMap, KindTag, Step, StepKind};
use crate::parser::parset::{parse_environment, parse_list, write_argument_file, Parset};
use crate::runners::ExecutorRegistry;

use indexmap::IndexMap;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Pair each declared name with the unique name its occurrence runs under.
/// The first occurrence keeps the name; later ones get `1`, `2`, ... appended.
pub fn disambiguate(names: &[String]) -> Vec<(String, String)> {
    let mut seen: HashMap<&str, usize> = HashMap::new();
    names
        .iter()
        .map(|base| {
            let count = seen.entry(base.as_str()).or_insert(0);
            let name = if *count == 0 {
                base.clone()
            } else {
                format!("{}{}", base, count)
            };
            *count += 1;
            (base.clone(), name)
        })
        .collect()
}

/// Builds steps from the run configuration
pub struct StepBuilder<'a> {
    parset: &'a Parset,
    registry: &'a ExecutorRegistry,
    config: &'a EngineConfig,
    /// Directory relative paths resolve against
    base_dir: &'a Path,
}

impl<'a> StepBuilder<'a> {
    pub fn new(
        parset: &'a Parset,
        registry: &'a ExecutorRegistry,
        config: &'a EngineConfig,
        base_dir: &'a Path,
    ) -> Self {
        Self {
            parset,
            registry,
            config,
            base_dir,
        }
    }

    /// Build one step and write its argument file
    pub fn build(&self, base: &str, name: &str) -> EngineResult<Step> {
        let mut step = self.describe(base, name)?;

        if step.is_executable() {
            let path = self.config.argument_file(name);
            write_argument_file(&path, &step.arguments).map_err(|e| EngineError::io(&path, e))?;
            debug!(step = %name, file = %path.display(), "wrote argument file");
            step.argument_file = Some(path);
        }

        Ok(step)
    }

    /// Build one step without touching the filesystem
    pub fn describe(&self, base: &str, name: &str) -> EngineResult<Step> {
        let control = self.parset.subset(&format!("{}.control.", base));
        let kind_name = control.get("kind").map(String::as_str).unwrap_or("recipe");
        let tag = KindTag::parse(kind_name).ok_or_else(|| ConfigError::UnknownKind {
            step: name.to_string(),
            kind: kind_name.to_string(),
        })?;

        let (kind, arguments) = match tag {
            KindTag::Recipe | KindTag::Plugin => {
                let type_id = require_type(&control, name, tag)?;
                let resolved = self.registry.resolve(tag, type_id).ok_or_else(|| {
                    ConfigError::UnknownType {
                        step: name.to_string(),
                        kind: tag.to_string(),
                        type_id: type_id.to_string(),
                    }
                })?;
                let arguments =
                    self.merge_arguments(base, name, &control, resolved.default_arguments.as_deref())?;
                let kind = match tag {
                    KindTag::Plugin => StepKind::Plugin {
                        type_id: type_id.to_string(),
                    },
                    _ => StepKind::Recipe {
                        type_id: type_id.to_string(),
                    },
                };
                (kind, arguments)
            }
            KindTag::Loop => (loop_kind(&control, name)?, ArgumentMap::new()),
            KindTag::Pipeline => {
                let type_id = require_type(&control, name, tag)?;
                let path = self.resolve_path(type_id);
                if !path.is_file() {
                    return Err(ConfigError::MissingPipelineFile {
                        step: name.to_string(),
                        path,
                    }
                    .into());
                }
                let arguments = self.merge_arguments(base, name, &control, None)?;
                let mapfile_in = arguments
                    .get("mapfile_in")
                    .or_else(|| control.get("mapfile_in"))
                    .cloned();
                (StepKind::Pipeline { path, mapfile_in }, arguments)
            }
        };

        Ok(Step {
            name: name.to_string(),
            base: base.to_string(),
            kind,
            cmdline: self
                .parset
                .get_list(&format!("{}.cmdline", base))
                .unwrap_or_default(),
            environment: environment(&control),
            control,
            arguments,
            argument_file: None,
        })
    }

    /// Check a step list before anything runs. Loop bodies are checked
    /// recursively; a loop that contains itself is rejected.
    pub fn validate(&self, names: &[String]) -> EngineResult<()> {
        let mut active_loops = Vec::new();
        self.validate_list(names, &mut active_loops)
    }

    fn validate_list(&self, names: &[String], active_loops: &mut Vec<String>) -> EngineResult<()> {
        for (base, name) in disambiguate(names) {
            let step = self.describe(&base, &name)?;
            if let StepKind::Loop { loopsteps, .. } = &step.kind {
                if active_loops.contains(&base) {
                    return Err(ConfigError::InvalidLoop {
                        step: name,
                        message: "loop body contains the loop itself".to_string(),
                    }
                    .into());
                }
                active_loops.push(base);
                self.validate_list(loopsteps, active_loops)?;
                active_loops.pop();
            }
        }
        Ok(())
    }

    /// Merge arguments from, lowest to highest precedence: `control.argfile`,
    /// the type's default file, `control.parset`, inline `argument.*`
    fn merge_arguments(
        &self,
        base: &str,
        name: &str,
        control: &IndexMap<String, String>,
        defaults: Option<&Path>,
    ) -> EngineResult<ArgumentMap> {
        let mut merged = ArgumentMap::new();

        if let Some(file) = control.get("argfile") {
            self.merge_file(&mut merged, name, &self.resolve_path(file))?;
        }
        if let Some(file) = defaults {
            self.merge_file(&mut merged, name, file)?;
        }
        if let Some(file) = control.get("parset") {
            self.merge_file(&mut merged, name, &self.resolve_path(file))?;
        }

        merged.extend(self.parset.subset(&format!("{}.argument.", base)));
        Ok(merged)
    }

    fn merge_file(&self, merged: &mut ArgumentMap, name: &str, path: &Path) -> EngineResult<()> {
        let file = Parset::from_file(path).map_err(|source| ConfigError::ArgumentFile {
            step: name.to_string(),
            path: path.to_path_buf(),
            source,
        })?;
        merged.extend(file.iter().map(|(k, v)| (k.clone(), v.clone())));
        Ok(())
    }

    fn resolve_path(&self, value: &str) -> PathBuf {
        let path = Path::new(value);
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.base_dir.join(path)
        }
    }
}

fn require_type<'c>(
    control: &'c IndexMap<String, String>,
    name: &str,
    tag: KindTag,
) -> Result<&'c str, ConfigError> {
    control
        .get("type")
        .map(|t| t.trim())
        .filter(|t| !t.is_empty())
        .ok_or_else(|| ConfigError::MissingType {
            step: name.to_string(),
            kind: tag.to_string(),
        })
}

fn loop_kind(control: &IndexMap<String, String>, name: &str) -> Result<StepKind, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidLoop {
        step: name.to_string(),
        message,
    };

    let raw = control
        .get("loopcount")
        .ok_or_else(|| invalid("missing 'control.loopcount'".to_string()))?;
    let loopcount = raw
        .trim()
        .parse::<usize>()
        .ok()
        .filter(|n| *n > 0)
        .ok_or_else(|| invalid(format!("loopcount '{}' is not a positive integer", raw)))?;

    let loopsteps = control
        .get("loopsteps")
        .map(|v| parse_list(v))
        .unwrap_or_default();
    if loopsteps.is_empty() {
        return Err(invalid("missing or empty 'control.loopsteps'".to_string()));
    }

    Ok(StepKind::Loop {
        loopcount,
        loopsteps,
    })
}

/// `control.environment` as a `{K: v}` string, then `control.environment.K` keys
fn environment(control: &IndexMap<String, String>) -> IndexMap<String, String> {
    let mut env = control
        .get("environment")
        .map(|v| parse_environment(v))
        .unwrap_or_default();
    env.extend(control.iter().filter_map(|(k, v)| {
        k.strip_prefix("environment.")
            .map(|var| (var.to_string(), v.clone()))
    }));
    env
}

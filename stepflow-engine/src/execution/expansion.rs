// Loop and Sub-pipeline Expansion
// Loop counter/break bookkeeping and namespace-prefixed import of nested pipelines

use crate::error::ConfigError;
use crate::execution::context::{canonical, RunContext, MAPFILE_KEY};
use crate::expression::{override_name, rename_markers, rename_references, OverrideTable};
use crate::parser::models::{ArgumentMap, KindTag, OutputMap, Value};
use crate::parser::parset::{format_list, parse_list, Parset};

use std::collections::HashSet;
use std::path::{Path, PathBuf};

/// Maximum sub-pipeline inclusion depth
pub const MAX_NESTING: usize = 32;

/// Override bound to a sub-pipeline's effective artifact input
const MAPFILE_IN: &str = "mapfile_in";

// =============================================================================
// Loops
// =============================================================================

/// Counter and break flag of one active loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoopState {
    pub name: String,
    pub loopcount: usize,
    /// Iterations started so far
    pub counter: usize,
    pub break_requested: bool,
}

/// Outcome of visiting a loop step
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopVisit {
    /// Run the body once more. `last` is set when this pass reaches `loopcount`.
    Iterate { counter: usize, last: bool },
    /// The loop is done and must be popped
    Finished,
}

impl LoopState {
    pub fn new(name: impl Into<String>, loopcount: usize) -> Self {
        Self {
            name: name.into(),
            loopcount,
            counter: 0,
            break_requested: false,
        }
    }

    /// Advance the loop by one visit. The pass that reaches `loopcount` still
    /// runs the body; the visit after it finishes the loop.
    pub fn visit(&mut self) -> LoopVisit {
        if self.break_requested {
            return LoopVisit::Finished;
        }
        self.counter += 1;
        if self.counter >= self.loopcount {
            self.break_requested = true;
        }
        LoopVisit::Iterate {
            counter: self.counter,
            last: self.break_requested,
        }
    }
}

/// ResultDict entry owned by a loop step
pub fn loop_entry(counter: i64, break_flag: bool) -> OutputMap {
    let mut entry = OutputMap::new();
    entry.insert("counter".to_string(), Value::from(counter));
    entry.insert("break".to_string(), Value::Bool(break_flag));
    entry
}

// =============================================================================
// Sub-pipelines
// =============================================================================

/// Keys and step list produced by importing a sub-pipeline under a prefix
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SubPipelineImport {
    /// Rewritten entries to merge into the run configuration, in order
    pub entries: Vec<(String, String)>,
    /// Prefixed top-level step list of the sub-pipeline
    pub steps: Vec<String>,
    /// Effective artifact input, if any
    pub mapfile: Option<String>,
}

impl SubPipelineImport {
    pub fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|(k, _)| k.clone()).collect()
    }
}

fn prefixed(parent: &str, name: &str) -> String {
    format!("{}-{}", parent, name)
}

/// Every step name declared or referenced as a step inside the sub-pipeline
fn internal_names(sub: &Parset, steps: &[String]) -> HashSet<String> {
    let mut names: HashSet<String> = steps.iter().cloned().collect();

    for (key, value) in sub.iter() {
        if override_name(key).is_some() || key.starts_with("pipeline.") {
            continue;
        }
        if let Some((name, _)) = key.split_once('.') {
            names.insert(name.to_string());
        }
        if key.ends_with(".control.loopsteps") {
            names.extend(parse_list(value));
        }
    }

    names
}

fn absolutize(value: &str, base_dir: &Path) -> String {
    let path = Path::new(value);
    if value.is_empty() || path.is_absolute() {
        value.to_string()
    } else {
        base_dir.join(path).display().to_string()
    }
}

/// Rewrite a sub-pipeline's configuration under `parent`:
///
/// * step keys, loop bodies and the step list are prefixed with `<parent>-`
/// * references to internal steps and markers of the sub-pipeline's own
///   overrides follow the rename
/// * the parent's arguments replace same-named overrides
/// * the effective artifact input (`mapfile_in`, else the sub-pipeline's
///   `pipeline.mapfile`) is bound to `<parent>-mapfile_in`
///
/// Relative file paths in the sub-pipeline are made absolute against its own
/// directory so they survive the merge into the parent configuration.
pub fn import_sub_pipeline(
    sub: &Parset,
    parent: &str,
    parent_arguments: &ArgumentMap,
    mapfile_in: Option<String>,
    steps_key: &str,
) -> Result<SubPipelineImport, ConfigError> {
    let steps = sub.step_list(steps_key).ok_or_else(|| {
        let origin = sub
            .source()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| parent.to_string());
        ConfigError::MissingStepList(format!("{} in {}", steps_key, origin))
    })?;

    let internal = internal_names(sub, &steps);
    let mut overrides: HashSet<String> = OverrideTable::collect(sub)
        .names()
        .cloned()
        .collect();

    let mapfile = mapfile_in.or_else(|| sub.get(MAPFILE_KEY).map(str::to_string));
    if mapfile.is_some() {
        overrides.insert(MAPFILE_IN.to_string());
    }

    let rename_step = |step: &str| internal.contains(step).then(|| prefixed(parent, step));
    let rename_override = |name: &str| overrides.contains(name).then(|| prefixed(parent, name));
    let rewrite =
        |value: &str| rename_markers(&rename_references(value, &rename_step), &rename_override);
    let mapfile = mapfile.map(|value| rewrite(&value));

    let base_dir = sub.base_dir();
    let mut entries = Vec::with_capacity(sub.len());

    for (key, value) in sub.iter() {
        if let Some(name) = override_name(key) {
            entries.push((format!("! {}", prefixed(parent, name)), rewrite(value)));
            continue;
        }
        if key.starts_with("pipeline.") {
            continue;
        }

        let value = if key.ends_with(".control.loopsteps") {
            let body: Vec<String> = parse_list(value)
                .iter()
                .map(|name| prefixed(parent, name))
                .collect();
            format_list(&body)
        } else if key.ends_with(".control.argfile")
            || key.ends_with(".control.parset")
            || is_pipeline_type_key(sub, key)
        {
            absolutize(&rewrite(value), &base_dir)
        } else {
            rewrite(value)
        };

        entries.push((prefixed(parent, key), value));
    }

    for (name, value) in parent_arguments {
        if overrides.contains(name) && name != MAPFILE_IN {
            entries.push((format!("! {}", prefixed(parent, name)), value.clone()));
        }
    }

    if let Some(mapfile) = &mapfile {
        entries.push((format!("! {}", prefixed(parent, MAPFILE_IN)), mapfile.clone()));
    }

    Ok(SubPipelineImport {
        entries,
        steps: steps.iter().map(|name| prefixed(parent, name)).collect(),
        mapfile,
    })
}

/// `<step>.control.type` of a step whose kind is `pipeline`
fn is_pipeline_type_key(sub: &Parset, key: &str) -> bool {
    let Some(step) = key.strip_suffix(".control.type") else {
        return false;
    };
    sub.get(&format!("{}.control.kind", step))
        .and_then(KindTag::parse)
        == Some(KindTag::Pipeline)
}

/// Push a sub-pipeline file onto the include stack, rejecting cycles and
/// excessive nesting
pub fn push_include(ctx: &mut RunContext, step: &str, path: &Path) -> Result<(), ConfigError> {
    if ctx.includes.len() > MAX_NESTING {
        return Err(ConfigError::NestingTooDeep {
            step: step.to_string(),
            max: MAX_NESTING,
        });
    }

    let canonical_path = canonical(path);
    if ctx.includes.contains(&canonical_path) {
        return Err(ConfigError::IncludeCycle {
            step: step.to_string(),
            path: path.to_path_buf(),
        });
    }

    ctx.includes.push(canonical_path);
    Ok(())
}

pub fn pop_include(ctx: &mut RunContext) -> Option<PathBuf> {
    ctx.includes.pop()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::execution::context::{EngineConfig, STEPS_KEY};

    fn sub_pipeline() -> Parset {
        Parset::from_parset_str(
            r#"
pipeline.steps = [prep, iterate]
pipeline.mapfile = /data/default.map
! workdir = /scratch
prep.control.type = prep
prep.argument.out = {{ workdir }}/prep.map
prep.argument.in = {{ mapfile_in }}
iterate.control.kind = loop
iterate.control.loopcount = 2
iterate.control.loopsteps = [solve]
solve.control.type = solve
solve.argument.input = prep.output.mapfile
solve.argument.parent = setup.output.mapfile
"#,
        )
        .unwrap()
    }

    fn lookup<'a>(import: &'a SubPipelineImport, key: &str) -> Option<&'a str> {
        import
            .entries
            .iter()
            .rev()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_loop_three_passes_four_visits() {
        let mut state = LoopState::new("iterate", 3);
        let visits: Vec<LoopVisit> = (0..4).map(|_| state.visit()).collect();
        assert_eq!(
            visits,
            vec![
                LoopVisit::Iterate { counter: 1, last: false },
                LoopVisit::Iterate { counter: 2, last: false },
                LoopVisit::Iterate { counter: 3, last: true },
                LoopVisit::Finished,
            ]
        );
    }

    #[test]
    fn test_loop_break_request_finishes_next_visit() {
        let mut state = LoopState::new("iterate", 10);
        assert_eq!(state.visit(), LoopVisit::Iterate { counter: 1, last: false });
        state.break_requested = true;
        assert_eq!(state.visit(), LoopVisit::Finished);
    }

    #[test]
    fn test_loop_entry() {
        let entry = loop_entry(-1, false);
        assert_eq!(entry.get("counter"), Some(&Value::Number(-1.0)));
        assert_eq!(entry.get("break"), Some(&Value::Bool(false)));
    }

    #[test]
    fn test_import_prefixes_steps_and_references() {
        let import =
            import_sub_pipeline(&sub_pipeline(), "cal", &ArgumentMap::new(), None, STEPS_KEY).unwrap();

        assert_eq!(import.steps, vec!["cal-prep", "cal-iterate"]);
        assert_eq!(lookup(&import, "cal-prep.control.type"), Some("prep"));
        assert_eq!(
            lookup(&import, "cal-iterate.control.loopsteps"),
            Some("[cal-solve]")
        );
        assert_eq!(
            lookup(&import, "cal-solve.argument.input"),
            Some("cal-prep.output.mapfile")
        );
        // References to parent steps are left alone
        assert_eq!(
            lookup(&import, "cal-solve.argument.parent"),
            Some("setup.output.mapfile")
        );
        assert!(lookup(&import, "pipeline.steps").is_none());
    }

    #[test]
    fn test_import_prefixes_overrides_and_markers() {
        let import =
            import_sub_pipeline(&sub_pipeline(), "cal", &ArgumentMap::new(), None, STEPS_KEY).unwrap();

        assert_eq!(lookup(&import, "! cal-workdir"), Some("/scratch"));
        assert_eq!(
            lookup(&import, "cal-prep.argument.out"),
            Some("{{ cal-workdir }}/prep.map")
        );
        assert_eq!(
            lookup(&import, "cal-prep.argument.in"),
            Some("{{ cal-mapfile_in }}")
        );
        assert_eq!(lookup(&import, "! cal-mapfile_in"), Some("/data/default.map"));
        assert_eq!(import.mapfile.as_deref(), Some("/data/default.map"));
    }

    #[test]
    fn test_parent_arguments_and_mapfile_override() {
        let mut args = ArgumentMap::new();
        args.insert("workdir".to_string(), "/fast".to_string());
        args.insert("unrelated".to_string(), "x".to_string());

        let import = import_sub_pipeline(
            &sub_pipeline(),
            "cal",
            &args,
            Some("/tmp/x.map".to_string()),
            STEPS_KEY,
        )
        .unwrap();

        assert_eq!(lookup(&import, "! cal-workdir"), Some("/fast"));
        assert!(lookup(&import, "! cal-unrelated").is_none());
        assert_eq!(lookup(&import, "! cal-mapfile_in"), Some("/tmp/x.map"));
        assert_eq!(import.mapfile.as_deref(), Some("/tmp/x.map"));
    }

    #[test]
    fn test_default_mapfile_is_recorded_as_bound() {
        let sub = Parset::from_parset_str(
            "pipeline.steps = [prep]\n\
             pipeline.mapfile = {{ workdir }}/prep.output.mapfile\n\
             ! workdir = /scratch\n\
             prep.control.type = prep\n",
        )
        .unwrap();

        let import = import_sub_pipeline(&sub, "cal", &ArgumentMap::new(), None, STEPS_KEY).unwrap();

        let bound = lookup(&import, "! cal-mapfile_in");
        assert_eq!(bound, Some("{{ cal-workdir }}/cal-prep.output.mapfile"));
        assert_eq!(import.mapfile.as_deref(), bound);
    }

    #[test]
    fn test_two_imports_never_share_names() {
        let sub = sub_pipeline();
        let a = import_sub_pipeline(&sub, "first", &ArgumentMap::new(), None, STEPS_KEY).unwrap();
        let b = import_sub_pipeline(&sub, "second", &ArgumentMap::new(), None, STEPS_KEY).unwrap();

        let a_keys: HashSet<String> = a.keys().into_iter().collect();
        assert!(b.keys().iter().all(|k| !a_keys.contains(k)));
        assert!(b.steps.iter().all(|s| !a.steps.contains(s)));
    }

    #[test]
    fn test_missing_step_list() {
        let sub = Parset::from_parset_str("prep.control.type = prep\n").unwrap();
        let err = import_sub_pipeline(&sub, "cal", &ArgumentMap::new(), None, STEPS_KEY).unwrap_err();
        assert!(matches!(err, ConfigError::MissingStepList(_)));
    }

    #[test]
    fn test_include_cycle_detected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sub.parset");
        std::fs::write(&path, "pipeline.steps = [a]\n").unwrap();

        let mut ctx = RunContext::new(Parset::new(), &EngineConfig::new("job"));
        push_include(&mut ctx, "outer", &path).unwrap();
        let err = push_include(&mut ctx, "inner", &path).unwrap_err();
        assert!(matches!(err, ConfigError::IncludeCycle { .. }));

        pop_include(&mut ctx);
        assert!(push_include(&mut ctx, "again", &path).is_ok());
    }

    #[test]
    fn test_nesting_limit() {
        let mut ctx = RunContext::new(Parset::new(), &EngineConfig::new("job"));
        for depth in 0..=MAX_NESTING {
            ctx.includes.push(PathBuf::from(format!("/p/{}.parset", depth)));
        }
        let err = push_include(&mut ctx, "deep", Path::new("/p/next.parset")).unwrap_err();
        assert!(matches!(err, ConfigError::NestingTooDeep { max: MAX_NESTING, .. }));
    }
}

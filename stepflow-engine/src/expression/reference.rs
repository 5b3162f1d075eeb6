// Step Output References
// Parses `<step>.output.<key>` tokens once and evaluates them against the result dictionary

use crate::parser::models::{ArgumentMap, ResultDict};

use once_cell::sync::Lazy;
use regex::Regex;
use thiserror::Error;

static REFERENCE_REGEX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"([A-Za-z0-9_][A-Za-z0-9_\-]*)\.output\.([A-Za-z0-9_]+)")
        .expect("Invalid reference pattern")
});

/// Substring an output key must contain to count as an artifact list
const ARTIFACT_MARKER: &str = "mapfile";

/// Errors raised while evaluating references
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ResolveError {
    #[error("'{argument}' references step '{step}' which has not produced results")]
    MissingStep { argument: String, step: String },

    #[error("'{argument}' references '{step}.output.{key}' but step '{step}' has no output '{key}'")]
    MissingKey {
        argument: String,
        step: String,
        key: String,
    },
}

/// One piece of a parsed value
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Segment {
    Literal(String),
    Ref { step: String, key: String },
}

/// A value split into literal text and output references
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Template {
    segments: Vec<Segment>,
}

impl Template {
    pub fn parse(input: &str) -> Self {
        let mut segments = Vec::new();
        let mut last = 0;

        for caps in REFERENCE_REGEX.captures_iter(input) {
            let whole = caps.get(0).expect("group 0 always matches");
            if whole.start() > last {
                segments.push(Segment::Literal(input[last..whole.start()].to_string()));
            }
            segments.push(Segment::Ref {
                step: caps[1].to_string(),
                key: caps[2].to_string(),
            });
            last = whole.end();
        }

        if last < input.len() {
            segments.push(Segment::Literal(input[last..].to_string()));
        }

        Self { segments }
    }

    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    pub fn has_references(&self) -> bool {
        self.segments
            .iter()
            .any(|s| matches!(s, Segment::Ref { .. }))
    }

    /// `(step, key)` pairs referenced by this template, in order
    pub fn references(&self) -> impl Iterator<Item = (&str, &str)> {
        self.segments.iter().filter_map(|s| match s {
            Segment::Ref { step, key } => Some((step.as_str(), key.as_str())),
            Segment::Literal(_) => None,
        })
    }

    /// Substitute every reference with the string form of the referenced output
    pub fn evaluate(&self, argument: &str, results: &ResultDict) -> Result<String, ResolveError> {
        let mut out = String::new();
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Ref { step, key } => {
                    let outputs = results.get(step).ok_or_else(|| ResolveError::MissingStep {
                        argument: argument.to_string(),
                        step: step.clone(),
                    })?;
                    let value = outputs.get(key).ok_or_else(|| ResolveError::MissingKey {
                        argument: argument.to_string(),
                        step: step.clone(),
                        key: key.clone(),
                    })?;
                    out.push_str(&value.as_string());
                }
            }
        }
        Ok(out)
    }
}

/// Artifact-list output referenced by an argument; passed to the executor
/// as an extra input so it can track file provenance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImplicitInput {
    /// Argument that holds the reference
    pub argument: String,
    pub step: String,
    pub key: String,
    /// Resolved value (usually a path to an artifact list file)
    pub value: String,
}

/// Arguments after reference substitution
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResolvedArguments {
    pub values: ArgumentMap,
    pub implicit_inputs: Vec<ImplicitInput>,
}

/// Resolve every argument of a step in declaration order
pub fn resolve_arguments(
    arguments: &ArgumentMap,
    results: &ResultDict,
) -> Result<ResolvedArguments, ResolveError> {
    let mut resolved = ResolvedArguments::default();

    for (name, raw) in arguments {
        let template = Template::parse(raw);
        if !template.has_references() {
            resolved.values.insert(name.clone(), raw.clone());
            continue;
        }

        for (step, key) in template.references() {
            if key.contains(ARTIFACT_MARKER) && !name.contains(ARTIFACT_MARKER) {
                let value = results
                    .output(step, key)
                    .map(|v| v.as_string())
                    .unwrap_or_default();
                resolved.implicit_inputs.push(ImplicitInput {
                    argument: name.clone(),
                    step: step.to_string(),
                    key: key.to_string(),
                    value,
                });
            }
        }

        resolved
            .values
            .insert(name.clone(), template.evaluate(name, results)?);
    }

    Ok(resolved)
}

/// Resolve positional arguments; errors name the argument by position
pub fn resolve_cmdline(cmdline: &[String], results: &ResultDict) -> Result<Vec<String>, ResolveError> {
    cmdline
        .iter()
        .enumerate()
        .map(|(idx, raw)| Template::parse(raw).evaluate(&format!("cmdline[{}]", idx), results))
        .collect()
}

/// Rewrite references to the given step names through `rename`, leaving
/// all other text untouched
pub fn rename_references(value: &str, rename: impl Fn(&str) -> Option<String>) -> String {
    let template = Template::parse(value);
    if !template.has_references() {
        return value.to_string();
    }

    let mut out = String::with_capacity(value.len());
    for segment in template.segments() {
        match segment {
            Segment::Literal(text) => out.push_str(text),
            Segment::Ref { step, key } => {
                let step = rename(step).unwrap_or_else(|| step.clone());
                out.push_str(&format!("{}.output.{}", step, key));
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::models::{OutputMap, Value};

    fn results() -> ResultDict {
        let mut results = ResultDict::new();
        let mut prep = OutputMap::new();
        prep.insert("mapfile".to_string(), Value::from("/tmp/x.map"));
        prep.insert("count".to_string(), Value::Number(3.0));
        results.record("prep", prep);
        results
    }

    #[test]
    fn test_parse_segments() {
        let template = Template::parse("in=prep.output.mapfile;n=sub-cal.output.count");
        assert_eq!(
            template.segments(),
            &[
                Segment::Literal("in=".to_string()),
                Segment::Ref {
                    step: "prep".to_string(),
                    key: "mapfile".to_string()
                },
                Segment::Literal(";n=".to_string()),
                Segment::Ref {
                    step: "sub-cal".to_string(),
                    key: "count".to_string()
                },
            ]
        );
    }

    #[test]
    fn test_token_free_values_are_unchanged() {
        let results = results();
        for value in ["", "plain", "/data/prep.map", "output.mapfile", "a.outputs.b"] {
            let template = Template::parse(value);
            assert!(!template.has_references());
            assert_eq!(template.evaluate("arg", &results).unwrap(), value);
        }
    }

    #[test]
    fn test_evaluate_substitutes_string_form() {
        let results = results();
        let template = Template::parse("prep.output.mapfile:prep.output.count");
        assert_eq!(template.evaluate("arg", &results).unwrap(), "/tmp/x.map:3");
    }

    #[test]
    fn test_missing_step_is_typed_error() {
        let err = Template::parse("ghost.output.mapfile")
            .evaluate("instrument", &results())
            .unwrap_err();
        assert_eq!(
            err,
            ResolveError::MissingStep {
                argument: "instrument".to_string(),
                step: "ghost".to_string()
            }
        );
    }

    #[test]
    fn test_missing_key_is_typed_error() {
        let err = Template::parse("prep.output.nope")
            .evaluate("instrument", &results())
            .unwrap_err();
        assert!(matches!(err, ResolveError::MissingKey { ref key, .. } if key == "nope"));
    }

    #[test]
    fn test_resolve_arguments_reports_implicit_inputs() {
        let mut args = ArgumentMap::new();
        args.insert("instrument".to_string(), "prep.output.mapfile".to_string());
        args.insert("mapfile_in".to_string(), "prep.output.mapfile".to_string());
        args.insert("n".to_string(), "prep.output.count".to_string());

        let resolved = resolve_arguments(&args, &results()).unwrap();
        assert_eq!(resolved.values["instrument"], "/tmp/x.map");
        assert_eq!(resolved.values["mapfile_in"], "/tmp/x.map");
        assert_eq!(resolved.values["n"], "3");
        assert_eq!(resolved.implicit_inputs.len(), 1);
        assert_eq!(resolved.implicit_inputs[0].argument, "instrument");
        assert_eq!(resolved.implicit_inputs[0].value, "/tmp/x.map");
    }

    #[test]
    fn test_resolve_arguments_keeps_order() {
        let mut args = ArgumentMap::new();
        args.insert("z".to_string(), "1".to_string());
        args.insert("a".to_string(), "prep.output.count".to_string());
        let resolved = resolve_arguments(&args, &results()).unwrap();
        let keys: Vec<&String> = resolved.values.keys().collect();
        assert_eq!(keys, vec!["z", "a"]);
    }

    #[test]
    fn test_resolve_cmdline() {
        let cmdline = vec!["--in".to_string(), "prep.output.mapfile".to_string()];
        assert_eq!(
            resolve_cmdline(&cmdline, &results()).unwrap(),
            vec!["--in", "/tmp/x.map"]
        );
        let bad = vec!["ghost.output.x".to_string()];
        assert!(matches!(
            resolve_cmdline(&bad, &results()),
            Err(ResolveError::MissingStep { ref argument, .. }) if argument == "cmdline[0]"
        ));
    }

    #[test]
    fn test_rename_references() {
        let renamed = rename_references("prep.output.mapfile,other.output.x", |step| {
            (step == "prep").then(|| format!("sub-{}", step))
        });
        assert_eq!(renamed, "sub-prep.output.mapfile,other.output.x");
    }
}

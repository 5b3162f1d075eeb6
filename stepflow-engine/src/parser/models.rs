// Step Data Models
// Structured step records, output values and the per-run result dictionary

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// Ordered mapping of named arguments (declaration order is preserved)
pub type ArgumentMap = IndexMap<String, String>;

/// Flat output mapping returned by a recipe or plugin
pub type OutputMap = IndexMap<String, Value>;

// =============================================================================
// Steps
// =============================================================================

/// Kind of a step as declared by `control.kind`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KindTag {
    Recipe,
    Plugin,
    Loop,
    Pipeline,
}

impl KindTag {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "recipe" => Some(KindTag::Recipe),
            "plugin" => Some(KindTag::Plugin),
            "loop" => Some(KindTag::Loop),
            "pipeline" => Some(KindTag::Pipeline),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            KindTag::Recipe => "recipe",
            KindTag::Plugin => "plugin",
            KindTag::Loop => "loop",
            KindTag::Pipeline => "pipeline",
        }
    }
}

impl fmt::Display for KindTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Execution strategy of a step, one variant per declared kind
#[derive(Debug, Clone, PartialEq)]
pub enum StepKind {
    /// Run a named recipe through the recipe executor
    Recipe { type_id: String },
    /// Run a named plugin through the plugin loader
    Plugin { type_id: String },
    /// Re-run `loopsteps` up to `loopcount` times
    Loop {
        loopcount: usize,
        loopsteps: Vec<String>,
    },
    /// Inline the steps of another pipeline file
    Pipeline {
        path: PathBuf,
        mapfile_in: Option<String>,
    },
}

impl StepKind {
    pub fn tag(&self) -> KindTag {
        match self {
            StepKind::Recipe { .. } => KindTag::Recipe,
            StepKind::Plugin { .. } => KindTag::Plugin,
            StepKind::Loop { .. } => KindTag::Loop,
            StepKind::Pipeline { .. } => KindTag::Pipeline,
        }
    }

    /// Executor type id for recipe and plugin steps
    pub fn type_id(&self) -> Option<&str> {
        match self {
            StepKind::Recipe { type_id } | StepKind::Plugin { type_id } => Some(type_id),
            _ => None,
        }
    }
}

/// One materialized occurrence of a declared step
#[derive(Debug, Clone)]
pub struct Step {
    /// Unique name (carries a numeric suffix when the base name repeats)
    pub name: String,
    /// Configuration prefix the step was built from
    pub base: String,
    pub kind: StepKind,
    /// Raw `control` section
    pub control: ArgumentMap,
    /// Merged named arguments, before reference resolution
    pub arguments: ArgumentMap,
    /// Positional arguments
    pub cmdline: Vec<String>,
    /// Environment passed through to the executor
    pub environment: IndexMap<String, String>,
    /// Argument file written for recipe and plugin steps
    pub argument_file: Option<PathBuf>,
}

impl Step {
    pub fn is_executable(&self) -> bool {
        matches!(self.kind, StepKind::Recipe { .. } | StepKind::Plugin { .. })
    }
}

// =============================================================================
// Results
// =============================================================================

/// Run-scoped store of every executed step's outputs
#[derive(Debug, Clone, Default)]
pub struct ResultDict {
    entries: IndexMap<String, OutputMap>,
}

impl ResultDict {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, step: &str) -> Option<&OutputMap> {
        self.entries.get(step)
    }

    /// Look up a single output of a step
    pub fn output(&self, step: &str, key: &str) -> Option<&Value> {
        self.entries.get(step).and_then(|outputs| outputs.get(key))
    }

    pub fn contains(&self, step: &str) -> bool {
        self.entries.contains_key(step)
    }

    /// Record the outputs of `step`. Only the step itself writes its entry;
    /// a repeated run of the same step (loop bodies) replaces it.
    pub fn record(&mut self, step: impl Into<String>, outputs: OutputMap) {
        self.entries.insert(step.into(), outputs);
    }

    /// Set a single key inside an existing entry, creating the entry if needed
    pub fn set(&mut self, step: &str, key: impl Into<String>, value: Value) {
        self.entries
            .entry(step.to_string())
            .or_default()
            .insert(key.into(), value);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &OutputMap)> {
        self.entries.iter()
    }
}

// =============================================================================
// Output values
// =============================================================================

/// Output value produced by an executor
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    #[default]
    Null,
    Bool(bool),
    Number(f64),
    String(String),
    Array(Vec<Value>),
    Object(IndexMap<String, Value>),
}

impl Value {
    /// Interpret the value as a control flag. Strings count only when they
    /// spell a true value, so `"false"` stays false.
    pub fn as_flag(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Number(n) => *n != 0.0,
            Value::String(s) => matches!(
                s.trim().to_ascii_lowercase().as_str(),
                "true" | "yes" | "1"
            ),
            _ => false,
        }
    }

    /// Text substituted for a reference. Integral numbers drop the fraction;
    /// arrays and objects render as JSON.
    pub fn as_string(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Bool(b) => b.to_string(),
            Value::Number(n) if n.fract() == 0.0 && n.is_finite() => (*n as i64).to_string(),
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            Value::Array(_) | Value::Object(_) => serde_json::to_string(self).unwrap_or_default(),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.as_string())
    }
}

impl From<i64> for Value {
    fn from(n: i64) -> Self {
        Value::Number(n as f64)
    }
}

impl From<String> for Value {
    fn from(s: String) -> Self {
        Value::String(s)
    }
}

impl From<&str> for Value {
    fn from(s: &str) -> Self {
        Value::String(s.to_string())
    }
}

// Engine Errors
// Configuration errors raised before execution and the umbrella error type

use crate::expression::ResolveError;
use crate::parser::error::ParseError;
use crate::runners::ExecutorError;

use std::path::PathBuf;
use thiserror::Error;

pub type EngineResult<T> = Result<T, EngineError>;

/// Errors in the pipeline configuration. All of them are detected while
/// building steps, before the offending step runs.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("no step list found under '{0}'")]
    MissingStepList(String),

    #[error("step '{step}' has unknown kind '{kind}'")]
    UnknownKind { step: String, kind: String },

    #[error("step '{step}' of kind {kind} has no 'control.type'")]
    MissingType { step: String, kind: String },

    #[error("step '{step}': no {kind} named '{type_id}' is registered or found in the search path")]
    UnknownType {
        step: String,
        kind: String,
        type_id: String,
    },

    #[error("loop step '{step}': {message}")]
    InvalidLoop { step: String, message: String },

    #[error("pipeline step '{step}': file {} does not exist", path.display())]
    MissingPipelineFile { step: String, path: PathBuf },

    #[error("pipeline step '{step}' includes {} which is already being imported", path.display())]
    IncludeCycle { step: String, path: PathBuf },

    #[error("pipeline step '{step}': sub-pipelines nested deeper than {max} levels")]
    NestingTooDeep { step: String, max: usize },

    #[error("step '{step}': failed to read argument file {}: {source}", path.display())]
    ArgumentFile {
        step: String,
        path: PathBuf,
        #[source]
        source: ParseError,
    },

    #[error("step '{step}': failed to load pipeline {}: {source}", path.display())]
    PipelineFile {
        step: String,
        path: PathBuf,
        #[source]
        source: ParseError,
    },
}

/// Umbrella error for engine operations
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("parse error: {0}")]
    Parse(#[from] ParseError),

    #[error("step '{step}': {source}")]
    Resolve {
        step: String,
        #[source]
        source: ResolveError,
    },

    #[error("step '{step}' failed: {source}")]
    Executor {
        step: String,
        #[source]
        source: ExecutorError,
    },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl EngineError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        EngineError::Io {
            path: path.into(),
            source,
        }
    }

    /// Whether the error is a configuration problem rather than a runtime failure
    pub fn is_config(&self) -> bool {
        matches!(self, EngineError::Config(_) | EngineError::Parse(_))
    }
}

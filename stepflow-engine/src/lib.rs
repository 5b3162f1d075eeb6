// Stepflow Engine Library
// Declarative step execution: configuration, reference resolution, dispatch

pub mod error;
pub mod execution;
pub mod expression;
pub mod parser;
pub mod runners;

// Re-export commonly used types
pub use error::{ConfigError, EngineError, EngineResult};

// Re-export parser types
pub use parser::{
    ArgumentMap, KindTag, OutputMap, ParseError, ParseErrorKind, ParseResult, Parset, ResultDict,
    Step, StepKind, Value,
};

// Re-export expression types
pub use expression::{resolve_variables, OverrideTable, ResolveError, Template};

// Re-export execution types
pub use execution::{
    EngineConfig, ExecutionEvent, ExecutionResult, PipelineExecutor, ProgressSender, StepBuilder,
};

// Re-export runner types
pub use runners::{
    ExecutorError, ExecutorRegistry, Invocation, ScriptConfig, ScriptExecutor, ScriptRunner,
    StepExecutor,
};

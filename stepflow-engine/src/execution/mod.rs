// Execution Engine Module
// Step building, dispatch, loop and sub-pipeline expansion, progress events

pub mod builder;
pub mod context;
pub mod events;
pub mod executor;
pub mod expansion;

// Re-export key types
pub use builder::{disambiguate, StepBuilder};
pub use context::{default_runtime_dir, EngineConfig, RunContext, STEPS_KEY};
pub use events::{progress_channel, EventSender, ExecutionEvent, ProgressReceiver, ProgressSender};
pub use executor::{ExecutionResult, PipelineExecutor};
pub use expansion::{import_sub_pipeline, LoopState, LoopVisit, SubPipelineImport, MAX_NESTING};

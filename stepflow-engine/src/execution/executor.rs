// Pipeline Executor
// Recursive dispatch of step lists with in-place loop and sub-pipeline expansion

use crate::error::{ConfigError, EngineError, EngineResult};
use crate::execution::builder::{disambiguate, StepBuilder};
use crate::execution::context::{EngineConfig, RunContext, STEPS_KEY};
use crate::execution::events::{EventSender, ExecutionEvent, ProgressSender};
use crate::execution::expansion::{
    import_sub_pipeline, loop_entry, pop_include, push_include, LoopState, LoopVisit,
};
use crate::expression::{
    resolve_arguments, resolve_cmdline, resolve_variables, resolve_variables_for, ResolveError,
    Template,
};
use crate::parser::models::{ArgumentMap, OutputMap, ResultDict, Step, StepKind, Value};
use crate::parser::parset::{write_argument_file, Parset};
use crate::runners::{ExecutorRegistry, Invocation};

use indexmap::IndexMap;
use std::future::Future;
use std::path::Path;
use std::pin::Pin;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Output key a step sets to stop the innermost active loop
pub const BREAK_KEY: &str = "break";

/// Result of a pipeline run
#[derive(Debug)]
pub struct ExecutionResult {
    pub job_name: String,
    /// Whether every step completed
    pub success: bool,
    /// ResultDict at the end of the run (partial when the run aborted)
    pub results: ResultDict,
    /// Recipe and plugin steps in completion order
    pub executed: Vec<String>,
    /// Number of visits per loop step
    pub loop_visits: IndexMap<String, usize>,
    /// Step the run aborted at
    pub failed_step: Option<String>,
    /// Error that aborted the run
    pub error: Option<EngineError>,
    pub duration: Duration,
}

impl ExecutionResult {
    /// Number of times a step ran
    pub fn run_count(&self, step: &str) -> usize {
        self.executed.iter().filter(|s| *s == step).count()
    }
}

/// Error that stops the run, tagged with the step it happened at
struct Abort {
    step: String,
    error: EngineError,
}

impl Abort {
    fn at(step: &str, error: impl Into<EngineError>) -> Self {
        Self {
            step: step.to_string(),
            error: error.into(),
        }
    }
}

type RunFuture<'a> = Pin<Box<dyn Future<Output = Result<(), Abort>> + Send + 'a>>;

/// Pipeline executor
pub struct PipelineExecutor {
    registry: ExecutorRegistry,
    config: EngineConfig,
    /// Progress event sender
    event_tx: Option<ProgressSender>,
}

impl PipelineExecutor {
    pub fn new(registry: ExecutorRegistry, config: EngineConfig) -> Self {
        Self {
            registry,
            config,
            event_tx: None,
        }
    }

    /// Set progress event sender
    pub fn with_progress(mut self, tx: ProgressSender) -> Self {
        self.event_tx = Some(tx);
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn registry(&self) -> &ExecutorRegistry {
        &self.registry
    }

    /// Load a configuration file and run it
    pub async fn execute_file(&self, path: impl AsRef<Path>) -> EngineResult<ExecutionResult> {
        let parset = Parset::from_file(path)?;
        self.execute(parset).await
    }

    /// Apply overrides and check the top-level step list without running
    /// anything. Returns the configuration after override expansion and the
    /// step list.
    pub fn validate(&self, mut parset: Parset) -> EngineResult<(Parset, Vec<String>)> {
        resolve_variables(&mut parset);

        let names = parset
            .step_list(STEPS_KEY)
            .filter(|names| !names.is_empty())
            .ok_or_else(|| ConfigError::MissingStepList(STEPS_KEY.to_string()))?;

        let base_dir = parset.base_dir();
        StepBuilder::new(&parset, &self.registry, &self.config, &base_dir).validate(&names)?;

        Ok((parset, names))
    }

    /// Run a pipeline. Configuration errors found before the first step are
    /// returned as `Err`; failures during the run are reported in the result.
    pub async fn execute(&self, parset: Parset) -> EngineResult<ExecutionResult> {
        let (parset, names) = self.validate(parset)?;
        let mut ctx = RunContext::new(parset, &self.config);
        let start = Instant::now();

        info!(job = %self.config.job_name, steps = names.len(), "starting pipeline run");
        self.event_tx
            .send_event(ExecutionEvent::pipeline_started(&self.config.job_name, names.len()));

        let outcome = self.run_list(&mut ctx, names).await;
        let duration = start.elapsed();

        let (failed_step, error) = match outcome {
            Ok(()) => {
                info!(
                    job = %self.config.job_name,
                    executed = ctx.executed.len(),
                    ?duration,
                    "pipeline run completed"
                );
                (None, None)
            }
            Err(abort) => {
                warn!(step = %abort.step, error = %abort.error, "pipeline run aborted at step {}", abort.step);
                self.event_tx
                    .send_event(ExecutionEvent::step_failed(&abort.step, abort.error.to_string()));
                (Some(abort.step), Some(abort.error))
            }
        };

        let success = error.is_none();
        self.event_tx.send_event(ExecutionEvent::pipeline_completed(
            &self.config.job_name,
            success,
            ctx.executed.len(),
            duration,
        ));

        Ok(ExecutionResult {
            job_name: self.config.job_name.clone(),
            success,
            results: ctx.results,
            executed: ctx.executed,
            loop_visits: ctx.loop_visits,
            failed_step,
            error,
            duration,
        })
    }

    /// Run a step list in order. Loop and sub-pipeline bodies run to
    /// completion before the next sibling.
    fn run_list<'a>(&'a self, ctx: &'a mut RunContext, names: Vec<String>) -> RunFuture<'a> {
        Box::pin(async move {
            for (base, name) in disambiguate(&names) {
                let step = StepBuilder::new(&ctx.parset, &self.registry, &self.config, ctx.base_dir())
                    .build(&base, &name)
                    .map_err(|e| Abort::at(&name, e))?;

                match &step.kind {
                    StepKind::Recipe { .. } | StepKind::Plugin { .. } => {
                        self.dispatch(ctx, &step).await?
                    }
                    StepKind::Loop {
                        loopcount,
                        loopsteps,
                    } => self.run_loop(ctx, &step, *loopcount, loopsteps).await?,
                    StepKind::Pipeline { path, mapfile_in } => {
                        self.run_pipeline(ctx, &step, path, mapfile_in.as_deref())
                            .await?
                    }
                }
            }
            Ok(())
        })
    }

    /// Resolve and execute one recipe or plugin step
    async fn dispatch(&self, ctx: &mut RunContext, step: &Step) -> Result<(), Abort> {
        let kind = step.kind.tag();
        let type_id = step.kind.type_id().unwrap_or_default();

        let resolved = resolve_arguments(&step.arguments, &ctx.results).map_err(|source| {
            Abort::at(
                &step.name,
                EngineError::Resolve {
                    step: step.name.clone(),
                    source,
                },
            )
        })?;
        let cmdline = resolve_cmdline(&step.cmdline, &ctx.results).map_err(|source| {
            Abort::at(
                &step.name,
                EngineError::Resolve {
                    step: step.name.clone(),
                    source,
                },
            )
        })?;

        if let Some(path) = &step.argument_file {
            write_argument_file(path, &resolved.values)
                .map_err(|e| Abort::at(&step.name, EngineError::io(path, e)))?;
        }

        for input in &resolved.implicit_inputs {
            debug!(
                step = %step.name,
                argument = %input.argument,
                source = %format!("{}.output.{}", input.step, input.key),
                "implicit artifact input"
            );
        }

        let executor = self
            .registry
            .resolve(kind, type_id)
            .ok_or_else(|| {
                Abort::at(
                    &step.name,
                    ConfigError::UnknownType {
                        step: step.name.clone(),
                        kind: kind.to_string(),
                        type_id: type_id.to_string(),
                    },
                )
            })?
            .executor;

        let invocation = Invocation {
            kind,
            type_id: type_id.to_string(),
            step_name: step.name.clone(),
            cmdline,
            arguments: resolved.values,
            argument_file: step.argument_file.clone(),
            environment: step.environment.clone(),
            implicit_inputs: resolved.implicit_inputs,
            working_dir: self.config.working_dir.clone(),
        };

        info!(step = %step.name, %kind, type_id, "running step");
        self.event_tx
            .send_event(ExecutionEvent::step_started(&step.name, kind, type_id));
        let started = Instant::now();

        let outputs = executor.execute(&invocation).await.map_err(|source| {
            Abort::at(
                &step.name,
                EngineError::Executor {
                    step: step.name.clone(),
                    source,
                },
            )
        })?;

        ctx.executed.push(step.name.clone());
        let output_count = outputs.as_ref().map(OutputMap::len).unwrap_or(0);

        match outputs {
            Some(outputs) => {
                let wants_break = outputs.get(BREAK_KEY).map(Value::as_flag).unwrap_or(false);
                ctx.results.record(step.name.clone(), outputs);
                if wants_break {
                    match ctx.request_break().map(str::to_string) {
                        Some(loop_name) => {
                            debug!(step = %step.name, %loop_name, "break requested");
                            ctx.results.set(&loop_name, BREAK_KEY, Value::Bool(true));
                        }
                        None => warn!(step = %step.name, "break requested outside of a loop"),
                    }
                }
            }
            None => debug!(step = %step.name, "step returned no result"),
        }

        self.event_tx.send_event(ExecutionEvent::step_completed(
            &step.name,
            output_count,
            started.elapsed(),
        ));
        Ok(())
    }

    /// Visit a loop step until its counter or a break request finishes it
    async fn run_loop(
        &self,
        ctx: &mut RunContext,
        step: &Step,
        loopcount: usize,
        loopsteps: &[String],
    ) -> Result<(), Abort> {
        if ctx.loops.iter().any(|l| l.name == step.name) {
            return Err(Abort::at(
                &step.name,
                ConfigError::InvalidLoop {
                    step: step.name.clone(),
                    message: "loop body contains the loop itself".to_string(),
                },
            ));
        }
        ctx.loops.push(LoopState::new(&step.name, loopcount));

        loop {
            ctx.record_visit(&step.name);
            let visit = match ctx.loops.last_mut() {
                Some(state) => state.visit(),
                None => LoopVisit::Finished,
            };

            match visit {
                LoopVisit::Finished => {
                    ctx.loops.pop();
                    ctx.results.record(step.name.clone(), loop_entry(-1, false));
                    debug!(step = %step.name, "loop finished");
                    self.event_tx
                        .send_event(ExecutionEvent::loop_visited(&step.name, -1, loopcount, true));
                    return Ok(());
                }
                LoopVisit::Iterate { counter, last } => {
                    ctx.results
                        .record(step.name.clone(), loop_entry(counter as i64, last));
                    debug!(step = %step.name, counter, loopcount, "loop iteration");
                    self.event_tx.send_event(ExecutionEvent::loop_visited(
                        &step.name,
                        counter as i64,
                        loopcount,
                        false,
                    ));
                    self.run_list(ctx, loopsteps.to_vec()).await?;
                }
            }
        }
    }

    /// Import a sub-pipeline under the step's name and run its steps
    async fn run_pipeline(
        &self,
        ctx: &mut RunContext,
        step: &Step,
        path: &Path,
        mapfile_in: Option<&str>,
    ) -> Result<(), Abort> {
        push_include(ctx, &step.name, path).map_err(|e| Abort::at(&step.name, e))?;

        let sub = Parset::from_file(path).map_err(|source| {
            Abort::at(
                &step.name,
                ConfigError::PipelineFile {
                    step: step.name.clone(),
                    path: path.to_path_buf(),
                    source,
                },
            )
        })?;

        let resolve_error = |source: ResolveError| {
            Abort::at(
                &step.name,
                EngineError::Resolve {
                    step: step.name.clone(),
                    source,
                },
            )
        };
        let arguments: ArgumentMap = resolve_arguments(&step.arguments, &ctx.results)
            .map_err(resolve_error)?
            .values;
        let mapfile_in = mapfile_in
            .map(|raw| Template::parse(raw).evaluate("mapfile_in", &ctx.results))
            .transpose()
            .map_err(resolve_error)?;

        let import = import_sub_pipeline(&sub, &step.name, &arguments, mapfile_in, STEPS_KEY)
            .map_err(|e| Abort::at(&step.name, e))?;

        let keys = import.keys();
        for (key, value) in import.entries {
            ctx.parset.insert(key, value);
        }
        resolve_variables_for(&mut ctx.parset, &keys);

        let mut entry = OutputMap::new();
        if let Some(mapfile) = &import.mapfile {
            entry.insert("mapfile".to_string(), Value::from(mapfile.as_str()));
        }
        ctx.results.record(step.name.clone(), entry);

        info!(
            step = %step.name,
            path = %path.display(),
            steps = import.steps.len(),
            "inlined sub-pipeline"
        );
        self.event_tx.send_event(ExecutionEvent::sub_pipeline_inlined(
            &step.name,
            path.display().to_string(),
            import.steps.clone(),
        ));

        StepBuilder::new(&ctx.parset, &self.registry, &self.config, ctx.base_dir())
            .validate(&import.steps)
            .map_err(|e| Abort::at(&step.name, e))?;

        self.run_list(ctx, import.steps).await?;
        pop_include(ctx);
        Ok(())
    }
}

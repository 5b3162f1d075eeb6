use crate::commands::PipelineArgs;
use crate::output;

use clap::Args;
use color_eyre::Result;

use stepflow_engine::execution::events::progress_channel;
use stepflow_engine::{ExecutionEvent, PipelineExecutor};

/// Run a pipeline
#[derive(Args, Debug)]
pub struct RunArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Print every ResultDict entry when the run ends
    #[arg(long)]
    pub results: bool,
}

pub async fn execute(args: RunArgs) -> Result<()> {
    output::status("Loading", &format!("{}", args.pipeline.pipeline.display()));
    let parset = args.pipeline.load()?;
    let config = args.pipeline.config()?;

    output::info(&format!(
        "Job '{}', argument files under {}",
        config.job_name,
        config.parset_dir().display()
    ));

    let (tx, mut rx) = progress_channel();
    let executor = PipelineExecutor::new(args.pipeline.registry(), config).with_progress(tx);

    // Spawn execution in background
    let exec_handle = tokio::spawn(async move { executor.execute(parset).await });

    // Process events in the foreground
    while let Some(event) = rx.recv().await {
        match &event {
            ExecutionEvent::PipelineStarted {
                job_name,
                total_steps,
            } => {
                eprintln!();
                output::header(&format!("Pipeline '{}' ({} steps)", job_name, total_steps));
            }

            ExecutionEvent::StepStarted {
                step_name,
                kind,
                type_id,
            } => {
                eprintln!("  [{}] {} ({})", kind, step_name, type_id);
            }

            ExecutionEvent::StepCompleted {
                outputs, duration, ..
            } => {
                output::dim_success(&format!(
                    "      OK ({:.2}s, {} outputs)",
                    duration.as_secs_f64(),
                    outputs
                ));
            }

            ExecutionEvent::LoopVisited {
                step_name,
                counter,
                loopcount,
                finished,
            } => {
                if *finished {
                    output::dim(&format!("  [loop] {} done", step_name));
                } else {
                    output::loop_header(step_name, *counter, *loopcount);
                }
            }

            ExecutionEvent::SubPipelineInlined {
                step_name,
                path,
                steps,
            } => {
                output::dim(&format!(
                    "  [pipeline] {} <- {} ({} steps)",
                    step_name,
                    path,
                    steps.len()
                ));
            }

            ExecutionEvent::StepFailed { step_name, error } => {
                output::error(&format!("step '{}': {}", step_name, error));
            }

            ExecutionEvent::PipelineCompleted {
                success,
                steps_executed,
                duration,
                ..
            } => {
                eprintln!();
                if *success {
                    output::success(&format!(
                        "Pipeline completed: {} steps in {:.2}s",
                        steps_executed,
                        duration.as_secs_f64()
                    ));
                } else {
                    output::failure(&format!(
                        "Pipeline failed after {} steps ({:.2}s)",
                        steps_executed,
                        duration.as_secs_f64()
                    ));
                }
            }
        }
    }

    // Configuration errors surface here, before any step ran
    let result = exec_handle.await??;

    if args.results {
        println!();
        for (step, outputs) in result.results.iter() {
            println!("{}: {}", step, serde_json::to_string(outputs)?);
        }
    }

    if let Some(step) = &result.failed_step {
        output::error(&format!("pipeline run aborted at step {}", step));
        std::process::exit(1);
    }

    Ok(())
}

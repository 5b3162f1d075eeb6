use crate::commands::PipelineArgs;
use crate::output;

use clap::Args;
use color_eyre::Result;

use stepflow_engine::{EngineError, PipelineExecutor};

/// Check a pipeline configuration without running it
#[derive(Args, Debug)]
pub struct ValidateArgs {
    #[command(flatten)]
    pub pipeline: PipelineArgs,

    /// Print the configuration after override expansion
    #[arg(long)]
    pub expanded: bool,
}

pub fn execute(args: ValidateArgs) -> Result<()> {
    output::status("Validating", &format!("{}", args.pipeline.pipeline.display()));

    // Step 1: Parse the configuration
    let parset = match args.pipeline.load() {
        Ok(p) => p,
        Err(e) => {
            output::error(&format!("{}", e));
            std::process::exit(1);
        }
    };
    output::check(&format!("Configuration loaded: {} keys", parset.len()));

    // Step 2: Build and check every declared step
    let executor = PipelineExecutor::new(args.pipeline.registry(), args.pipeline.config()?);
    let (expanded, steps) = match executor.validate(parset) {
        Ok(validated) => validated,
        Err(EngineError::Parse(e)) => {
            output::error(&format!("Parse error: {}", e));
            if let Some(suggestion) = &e.suggestion {
                output::info(&format!("  Suggestion: {}", suggestion));
            }
            std::process::exit(1);
        }
        Err(e) => {
            output::error(&format!("{}", e));
            std::process::exit(1);
        }
    };

    output::check(&format!("{} top-level steps", steps.len()));
    for step in &steps {
        output::dim(&format!("    - {}", step));
    }

    if args.expanded {
        println!();
        print!("{}", expanded.to_parset_string());
    }

    eprintln!();
    output::success("Pipeline is valid");

    Ok(())
}

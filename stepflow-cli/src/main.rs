mod commands;
mod output;

use clap::{Parser, Subcommand};
use color_eyre::Result;
use tracing::debug;
use tracing_subscriber::EnvFilter;

/// Run declarative step pipelines
#[derive(Parser, Debug)]
#[command(name = "stepflow", version, about)]
struct Cli {
    /// Increase logging verbosity (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run a pipeline
    Run(commands::run::RunArgs),
    /// Check a pipeline configuration without running it
    Validate(commands::validate::ValidateArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Command::Run(args) => commands::run::execute(args).await,
        Command::Validate(args) => commands::validate::execute(args),
    }
}

/// `RUST_LOG` wins; otherwise the level follows the `-v` count
fn init_logging(verbose: u8) {
    let default_level = match verbose {
        0 => "warn",
        1 => "info",
        2 => "debug",
        _ => "trace",
    };
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(verbose >= 2)
        .with_line_number(verbose >= 3)
        .with_writer(std::io::stderr)
        .init();

    debug!("stepflow started with verbosity level: {}", verbose);
}

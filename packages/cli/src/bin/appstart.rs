// ABOUTME: Entry point for the appstart command line tool
// ABOUTME: Parses arguments, installs logging and dispatches to run or init

use clap::{Parser, Subcommand};
use colored::*;
use std::process;

mod appstart_cli;

use appstart_cli::init::InitArgs;
use appstart_cli::run::RunArgs;

#[derive(Parser)]
#[command(name = "appstart")]
#[command(about = "Run an application and its API server in local containers. \
If using for the first time, run 'appstart init' to build the devappserver base image.")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Build and run the application sandbox until interrupted
    Run(RunArgs),
    /// Build the devappserver base image from a local Cloud SDK
    Init(InitArgs),
}

fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .compact()
        .init();
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    init_logging();

    let result = match cli.command {
        Commands::Run(args) => appstart_cli::run::execute(args).await,
        Commands::Init(args) => appstart_cli::init::execute(args).await,
    };

    if let Err(e) = result {
        eprintln!("{} {:#}", "Error:".red().bold(), e);
        process::exit(1);
    }
}

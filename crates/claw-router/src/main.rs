//! Alert router binary entrypoint.

use std::io::{self, Write};
use std::process::ExitCode;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::EnvFilter;

use claw_router::cli::{Cli, Commands, LogFormat};
use claw_router::commands::{RunCommand, TestCommand, ValidateCommand};
use claw_router::output::OutputFormat;

const DEFAULT_FILTER: &str = "claw_router=info,claw_routing=info";

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    let runtime = match tokio::runtime::Runtime::new() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("Failed to create async runtime: {e}");
            return ExitCode::FAILURE;
        }
    };

    match runtime.block_on(run(cli)) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let format = OutputFormat::new(cli.format);

    match &cli.command {
        Commands::Validate(args) => {
            let mut stdout = io::stdout().lock();
            ValidateCommand::new(args)
                .execute(&mut stdout, &format)
                .with_context(|| format!("validating {}", args.tree.display()))?;
            stdout.flush()?;
        }
        Commands::Test(args) => {
            let mut stdout = io::stdout().lock();
            TestCommand::new(args)
                .execute(&mut stdout, &format)
                .with_context(|| format!("evaluating {}", args.tree.display()))?;
            stdout.flush()?;
        }
        Commands::Run(args) => {
            let summary = RunCommand::new(args).execute().await.context("router failed")?;
            if summary.rejected > 0 {
                tracing::warn!(rejected = summary.rejected, "some input lines were not routed");
            }
        }
    }

    Ok(())
}

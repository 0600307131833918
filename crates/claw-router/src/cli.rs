//! Command-line argument parsing with clap.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand, ValueEnum};

/// Clawbernetes alert router.
#[derive(Parser, Debug, Clone)]
#[command(name = "claw-router")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Output format.
    #[arg(short, long, value_enum, default_value_t = Format::Table)]
    pub format: Format,

    /// Log line format on stderr.
    #[arg(long, value_enum, env = "CLAW_ROUTER_LOG_FORMAT", default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,

    /// Subcommand to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Output format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum Format {
    /// Human-readable table format.
    #[default]
    Table,
    /// JSON output for scripting.
    Json,
}

/// Log format options.
#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum, Default)]
pub enum LogFormat {
    /// Human-readable lines.
    #[default]
    Text,
    /// One JSON object per line.
    Json,
}

/// Top-level subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Commands {
    /// Parse and compile a routing tree file.
    Validate(ValidateArgs),

    /// Show which routes an alert with the given labels would reach.
    Test(TestArgs),

    /// Route alerts read from stdin and write notifications to stdout.
    Run(RunArgs),
}

/// Arguments for the validate command.
#[derive(Parser, Debug, Clone)]
pub struct ValidateArgs {
    /// Routing tree file (JSON or YAML).
    #[arg(required = true)]
    pub tree: PathBuf,

    /// Engine config with time interval definitions.
    #[arg(short, long, env = "CLAW_ROUTER_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Arguments for the test command.
#[derive(Parser, Debug, Clone)]
pub struct TestArgs {
    /// Routing tree file (JSON or YAML).
    #[arg(required = true)]
    pub tree: PathBuf,

    /// Alert labels (KEY=VALUE).
    #[arg(short, long = "label", value_name = "KEY=VALUE", value_parser = parse_label)]
    pub labels: Vec<(String, String)>,

    /// Evaluate mute intervals at this RFC 3339 instant instead of now.
    #[arg(long)]
    pub at: Option<String>,

    /// Engine config with time interval definitions.
    #[arg(short, long, env = "CLAW_ROUTER_CONFIG")]
    pub config: Option<PathBuf>,
}

/// Arguments for the run command.
#[derive(Parser, Debug, Clone)]
pub struct RunArgs {
    /// Routing tree file (JSON or YAML), watched for changes.
    #[arg(short, long, env = "CLAW_ROUTER_TREE")]
    pub tree: PathBuf,

    /// Engine config file (TOML).
    #[arg(short, long, env = "CLAW_ROUTER_CONFIG")]
    pub config: Option<PathBuf>,

    /// Quiet period after a tree file change before it is re-read.
    #[arg(long, default_value = "250ms", value_parser = humantime::parse_duration)]
    pub debounce: Duration,

    /// Exit without flushing pending groups.
    #[arg(long)]
    pub no_flush: bool,
}

/// Parses a `KEY=VALUE` label argument.
///
/// # Errors
///
/// Returns an error if there is no `=` or the key is empty.
pub fn parse_label(s: &str) -> Result<(String, String), String> {
    match s.split_once('=') {
        Some((key, value)) if !key.is_empty() => Ok((key.to_string(), value.to_string())),
        Some(_) => Err(format!("empty label name in '{s}'")),
        None => Err(format!("expected KEY=VALUE, got '{s}'")),
    }
}

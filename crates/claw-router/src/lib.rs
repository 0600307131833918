//! # claw-router
//!
//! Command-line front end for `claw-routing`.
//!
//! - `validate` compiles a routing tree file and prints its outline
//! - `test` shows which routes a label set would reach, and which are muted
//! - `run` routes JSON alerts from stdin and writes notifications to stdout
//!
//! Tree files may be JSON or YAML. Engine settings, including the mute time
//! interval definitions, come from an optional TOML file.
//!
//! ```text
//!  stdin (alerts) ──► RoutingEngine ──► JsonLinesSink ──► stdout
//!                          ▲
//!                FileTreeSource (watches the tree file)
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod cli;
pub mod commands;
pub mod error;
pub mod output;
pub mod sink;
pub mod source;

pub use cli::{Cli, Commands, Format, LogFormat};
pub use error::CliError;
pub use output::OutputFormat;
pub use sink::JsonLinesSink;
pub use source::FileTreeSource;

//! CLI command implementations.
//!
//! - [`validate`] - Compile a routing tree file and print its outline
//! - [`test_route`] - Dry-run label sets against a tree
//! - [`run`] - Serve a tree, routing alerts from stdin

pub mod run;
pub mod test_route;
pub mod validate;

pub use run::{RunCommand, RunSummary};
pub use test_route::TestCommand;
pub use validate::ValidateCommand;

use std::path::Path;

use claw_routing::EngineConfig;

use crate::error::CliError;

/// Loads the engine config, falling back to defaults without a file.
pub(crate) fn load_config(path: Option<&Path>) -> Result<EngineConfig, CliError> {
    match path {
        Some(path) => Ok(EngineConfig::from_file(path)?),
        None => Ok(EngineConfig::default()),
    }
}

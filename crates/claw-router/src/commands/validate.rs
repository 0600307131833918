//! Routing tree validation.

use std::io::Write;

use claw_routing::{CompiledTree, RegexCache};
use tracing::debug;

use crate::cli::ValidateArgs;
use crate::commands::load_config;
use crate::error::CliError;
use crate::output::{OutputFormat, ValidationReport};
use crate::source::load_tree;

/// Validate command executor.
#[derive(Debug)]
pub struct ValidateCommand<'a> {
    args: &'a ValidateArgs,
}

impl<'a> ValidateCommand<'a> {
    /// Create a new validate command.
    #[must_use]
    pub const fn new(args: &'a ValidateArgs) -> Self {
        Self { args }
    }

    /// Compiles the tree and reports its shape.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree or config cannot be loaded, or the tree
    /// does not compile.
    pub fn report(&self) -> Result<ValidationReport, CliError> {
        let config = load_config(self.args.config.as_deref())?;
        let tree = load_tree(&self.args.tree)?;
        let compiled = CompiledTree::compile(&tree, &config.mute_resolver()?, &RegexCache::new())?;
        debug!(tree = compiled.name(), routes = compiled.len(), "tree compiled");

        Ok(ValidationReport {
            tree: compiled.name().to_string(),
            resource_version: compiled.resource_version().to_string(),
            routes: compiled.len(),
            outline: compiled.render(),
        })
    }

    /// Execute the validate command.
    ///
    /// # Errors
    ///
    /// Returns an error if validation or output fails.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let report = self.report()?;
        format.write(writer, &report)
    }
}

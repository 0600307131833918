//! Output formatting for CLI commands.
//!
//! Supports table (human-readable) and JSON output formats.

use std::io::Write;

use serde::Serialize;

use claw_routing::{EffectiveConfig, LabelSet, MatchedRoute, RouteKey};

use crate::cli::Format;
use crate::error::CliError;

/// Output formatter that handles both table and JSON output.
#[derive(Debug, Clone)]
pub struct OutputFormat {
    format: Format,
}

impl OutputFormat {
    /// Create a new output formatter.
    #[must_use]
    pub const fn new(format: Format) -> Self {
        Self { format }
    }

    /// Write a serializable value to the output.
    ///
    /// # Errors
    ///
    /// Returns an error if serialization or writing fails.
    pub fn write<W, T>(&self, writer: &mut W, value: &T) -> Result<(), CliError>
    where
        W: Write,
        T: Serialize + TableDisplay,
    {
        match self.format {
            Format::Json => {
                serde_json::to_writer_pretty(&mut *writer, value)
                    .map_err(|e| CliError::Format(format!("JSON serialization failed: {e}")))?;
                writeln!(writer)?;
            }
            Format::Table => value.write_table(writer)?,
        }
        Ok(())
    }
}

impl Default for OutputFormat {
    fn default() -> Self {
        Self::new(Format::Table)
    }
}

/// Trait for types that can be displayed as a table.
pub trait TableDisplay {
    /// Write the value as a human-readable table.
    ///
    /// # Errors
    ///
    /// Returns an error if writing fails.
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError>;
}

/// Result of compiling a tree file.
#[derive(Debug, Clone, Serialize)]
pub struct ValidationReport {
    /// Tree name.
    pub tree: String,
    /// Resource version, if the file carries one.
    pub resource_version: String,
    /// Number of routes, root included.
    pub routes: usize,
    /// Indented outline of the compiled tree.
    pub outline: String,
}

impl TableDisplay for ValidationReport {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        writeln!(writer, "Routing tree {} is valid", self.tree)?;
        writeln!(writer, "══════════════════════════════════")?;
        if !self.resource_version.is_empty() {
            writeln!(writer, "Version:  {}", self.resource_version)?;
        }
        writeln!(writer, "Routes:   {}", self.routes)?;
        writeln!(writer)?;
        write!(writer, "{}", self.outline)?;
        Ok(())
    }
}

/// One selected route.
#[derive(Debug, Clone, Serialize)]
pub struct RouteRow {
    /// Route key.
    pub route: RouteKey,
    /// Effective settings.
    #[serde(flatten)]
    pub config: EffectiveConfig,
}

impl From<&MatchedRoute> for RouteRow {
    fn from(route: &MatchedRoute) -> Self {
        Self {
            route: route.route_key.clone(),
            config: route.config.as_ref().clone(),
        }
    }
}

/// Result of a dry run.
#[derive(Debug, Clone, Serialize)]
pub struct RouteMatches {
    /// Labels evaluated.
    pub labels: LabelSet,
    /// Selected routes in evaluation order.
    pub routes: Vec<RouteRow>,
    /// Routes that matched but are muted right now.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub muted: Vec<RouteKey>,
}

fn human(d: std::time::Duration) -> String {
    humantime::format_duration(d).to_string()
}

impl TableDisplay for RouteMatches {
    fn write_table<W: Write>(&self, writer: &mut W) -> Result<(), CliError> {
        if self.routes.is_empty() {
            writeln!(writer, "No routes selected")?;
        } else {
            writeln!(
                writer,
                "{:<16}  {:<20}  {:<24}  {:>8}  {:>8}  {:>8}",
                "ROUTE", "RECEIVER", "GROUP BY", "WAIT", "INTERVAL", "REPEAT"
            )?;
            writeln!(writer, "{}", "─".repeat(94))?;
            for row in &self.routes {
                writeln!(
                    writer,
                    "{:<16}  {:<20}  {:<24}  {:>8}  {:>8}  {:>8}",
                    row.route.as_str(),
                    truncate(&row.config.receiver, 20),
                    truncate(&row.config.group_by.to_string(), 24),
                    human(row.config.group_wait),
                    human(row.config.group_interval),
                    human(row.config.repeat_interval),
                )?;
            }
        }
        if !self.muted.is_empty() {
            writeln!(writer)?;
            let muted: Vec<&str> = self.muted.iter().map(RouteKey::as_str).collect();
            writeln!(writer, "Muted: {}", muted.join(", "))?;
        }
        Ok(())
    }
}

/// Truncates `s` to at most `max` characters, marking the cut with `…`.
fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(1)).collect();
        format!("{kept}…")
    }
}

//! Dry-run routing for a label set.

use std::io::Write;

use chrono::{DateTime, Utc};
use claw_routing::{walker, CompiledTree, LabelSet, RegexCache};

use crate::cli::TestArgs;
use crate::commands::load_config;
use crate::error::CliError;
use crate::output::{OutputFormat, RouteMatches, RouteRow};
use crate::source::load_tree;

/// Test command executor.
#[derive(Debug)]
pub struct TestCommand<'a> {
    args: &'a TestArgs,
}

impl<'a> TestCommand<'a> {
    /// Create a new test command.
    #[must_use]
    pub const fn new(args: &'a TestArgs) -> Self {
        Self { args }
    }

    fn instant(&self) -> Result<DateTime<Utc>, CliError> {
        match self.args.at.as_deref() {
            Some(at) => DateTime::parse_from_rfc3339(at)
                .map(|t| t.with_timezone(&Utc))
                .map_err(|e| CliError::InvalidArgument(format!("--at {at}: {e}"))),
            None => Ok(Utc::now()),
        }
    }

    /// Evaluates the labels against the tree.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree or config cannot be loaded, or `--at`
    /// is not an RFC 3339 timestamp.
    pub fn evaluate(&self) -> Result<RouteMatches, CliError> {
        let now = self.instant()?;
        let config = load_config(self.args.config.as_deref())?;
        let tree = load_tree(&self.args.tree)?;
        let compiled = CompiledTree::compile(&tree, &config.mute_resolver()?, &RegexCache::new())?;

        let labels: LabelSet = self.args.labels.iter().cloned().collect();
        let evaluation = walker::evaluate(&labels, &compiled, now);
        Ok(RouteMatches {
            labels,
            routes: evaluation.matched.iter().map(RouteRow::from).collect(),
            muted: evaluation.muted,
        })
    }

    /// Execute the test command.
    ///
    /// # Errors
    ///
    /// Returns an error if evaluation or output fails.
    pub fn execute<W: Write>(&self, writer: &mut W, format: &OutputFormat) -> Result<(), CliError> {
        let matches = self.evaluate()?;
        format.write(writer, &matches)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    const TREE: &str = r#"{
  "metadata": {"name": "main"},
  "spec": {
    "defaults": {"receiver": "ops", "group_by": ["alertname"]},
    "routes": [
      {"receiver": "pager", "continue": true,
       "matchers": [{"label": "severity", "type": "=", "value": "critical"}]},
      {"receiver": "dba", "mute_time_intervals": ["weekends"],
       "matchers": [{"label": "team", "type": "=~", "value": "db|storage"}]}
    ]
  }
}"#;

    const CONFIG: &str = r#"
[[time_intervals]]
name = "weekends"
[[time_intervals.time_intervals]]
weekdays = ["saturday:sunday"]
"#;

    struct Files {
        _dir: tempfile::TempDir,
        tree: PathBuf,
        config: PathBuf,
    }

    fn files() -> Files {
        let dir = tempfile::tempdir().unwrap();
        let tree = dir.path().join("tree.json");
        let config = dir.path().join("router.toml");
        std::fs::write(&tree, TREE).unwrap();
        std::fs::write(&config, CONFIG).unwrap();
        Files { _dir: dir, tree, config }
    }

    fn args(files: &Files, labels: &[(&str, &str)], at: &str) -> TestArgs {
        TestArgs {
            tree: files.tree.clone(),
            labels: labels
                .iter()
                .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
                .collect(),
            at: Some(at.to_string()),
            config: Some(files.config.clone()),
        }
    }

    fn receivers(matches: &RouteMatches) -> Vec<&str> {
        matches.routes.iter().map(|r| r.config.receiver.as_str()).collect()
    }

    #[test]
    fn continue_fans_out_on_weekdays() {
        let files = files();
        // a Monday
        let args = args(&files, &[("severity", "critical"), ("team", "db")], "2024-01-08T10:00:00Z");
        let matches = TestCommand::new(&args).evaluate().unwrap();
        assert_eq!(receivers(&matches), vec!["pager", "dba"]);
        assert!(matches.muted.is_empty());
    }

    #[test]
    fn weekend_mute_is_reported() {
        let files = files();
        // a Saturday
        let args = args(&files, &[("severity", "critical"), ("team", "db")], "2024-01-13T10:00:00Z");
        let matches = TestCommand::new(&args).evaluate().unwrap();
        assert_eq!(receivers(&matches), vec!["pager"]);
        assert_eq!(matches.muted.len(), 1);
        assert_eq!(matches.muted[0].as_str(), "root/1");
    }

    #[test]
    fn unmatched_labels_fall_back_to_defaults() {
        let files = files();
        let args = args(&files, &[("team", "web")], "2024-01-08T10:00:00Z");
        let matches = TestCommand::new(&args).evaluate().unwrap();
        assert_eq!(receivers(&matches), vec!["ops"]);
        assert_eq!(matches.routes[0].route.as_str(), "root");
    }

    #[test]
    fn bad_timestamp() {
        let files = files();
        let args = args(&files, &[], "next tuesday");
        assert!(matches!(
            TestCommand::new(&args).evaluate(),
            Err(CliError::InvalidArgument(_))
        ));
    }

    #[test]
    fn json_output() {
        let files = files();
        let args = args(&files, &[("team", "storage")], "2024-01-08T10:00:00Z");
        let mut out = Vec::new();
        TestCommand::new(&args)
            .execute(&mut out, &OutputFormat::new(crate::cli::Format::Json))
            .unwrap();
        let value: serde_json::Value = serde_json::from_slice(&out).unwrap();
        assert_eq!(value["routes"][0]["receiver"], "dba");
        assert_eq!(value["labels"]["team"], "storage");
    }
}

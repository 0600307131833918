//! Serve a routing tree.
//!
//! Alerts arrive on stdin as one JSON object per line. Notifications leave
//! through a [`DispatchSink`], stdout by default. The tree file is watched
//! and reloaded on change; a broken edit keeps the running tree.

use std::future::Future;
use std::sync::Arc;

use claw_routing::{Alert, DispatchSink, RoutingEngine, RoutingError, TreeSource};
use serde::Serialize;
use tokio::io::{AsyncBufRead, AsyncBufReadExt};
use tracing::{debug, info, warn};

use crate::cli::RunArgs;
use crate::commands::load_config;
use crate::error::CliError;
use crate::sink::JsonLinesSink;
use crate::source::{load_tree, FileTreeSource};

/// Counters for one run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunSummary {
    /// Alerts accepted by the engine.
    pub alerts: usize,
    /// Input lines that were not valid alerts.
    pub rejected: usize,
    /// Notifications sent by the final flush.
    pub flushed: usize,
}

/// Run command executor.
#[derive(Debug)]
pub struct RunCommand<'a> {
    args: &'a RunArgs,
}

impl<'a> RunCommand<'a> {
    /// Create a new run command.
    #[must_use]
    pub const fn new(args: &'a RunArgs) -> Self {
        Self { args }
    }

    /// Routes stdin to stdout until EOF or Ctrl-C.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree or config cannot be loaded or the engine
    /// fails to start.
    pub async fn execute(&self) -> Result<RunSummary, CliError> {
        let input = tokio::io::BufReader::new(tokio::io::stdin());
        let interrupted = async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "cannot listen for Ctrl-C");
                std::future::pending::<()>().await;
            }
        };
        self.serve(input, Arc::new(JsonLinesSink::stdout()), interrupted).await
    }

    /// Routes alerts read from `input` into `sink` until `input` ends or
    /// `shutdown` completes.
    ///
    /// # Errors
    ///
    /// Returns an error if the tree or config cannot be loaded or the engine
    /// fails to start.
    pub async fn serve<R, F>(&self, input: R, sink: Arc<dyn DispatchSink>, shutdown: F) -> Result<RunSummary, CliError>
    where
        R: AsyncBufRead + Unpin,
        F: Future<Output = ()>,
    {
        let config = load_config(self.args.config.as_deref())?;
        let tree = load_tree(&self.args.tree)?;
        let engine = RoutingEngine::start(config, &tree, sink)?;

        let source: Arc<dyn TreeSource> = Arc::new(FileTreeSource::new(&self.args.tree, self.args.debounce));
        engine.sync(source.as_ref()).await?;
        let watcher = engine.watch(source).await?;
        info!(tree = tree.name(), "routing alerts from stdin");

        let mut summary = RunSummary::default();
        let mut lines = input.lines();
        tokio::pin!(shutdown);
        loop {
            let line = tokio::select! {
                line = lines.next_line() => line,
                () = &mut shutdown => {
                    info!("interrupted");
                    break;
                }
            };
            let line = match line {
                Ok(Some(line)) => line,
                Ok(None) => {
                    debug!("input closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "reading input failed");
                    break;
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            let alert: Alert = match serde_json::from_str(&line) {
                Ok(alert) => alert,
                Err(e) => {
                    warn!(error = %e, "skipping malformed alert");
                    summary.rejected += 1;
                    continue;
                }
            };
            match engine.ingest(alert).await {
                Ok(groups) => {
                    debug!(groups = groups.len(), "alert routed");
                    summary.alerts += 1;
                }
                Err(RoutingError::EngineStopped) => break,
                Err(e) => {
                    warn!(error = %e, "alert not routed");
                    summary.rejected += 1;
                }
            }
        }

        summary.flushed = engine.shutdown(!self.args.no_flush).await?;
        watcher.abort();
        info!(
            alerts = summary.alerts,
            rejected = summary.rejected,
            flushed = summary.flushed,
            "router stopped"
        );
        Ok(summary)
    }
}

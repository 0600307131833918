//! The routing engine.
//!
//! [`RoutingEngine`] owns the snapshot store and the background tasks: one
//! task per group shard, the timer wheel and the dispatcher. Handles are
//! cheap to clone and can be shared by any number of ingesting callers.
//!
//! ```text
//!  ingest ──► walker ──► shard[hash(group)] ──► dispatcher ──► sink
//!                           ▲      │                │
//!                           │      ▼                │
//!                           └── timer wheel ◄───────┘ delivery reports
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, trace, warn};

use crate::clock::{Clock, SystemClock};
use crate::config::EngineConfig;
use crate::dispatch::{self, DispatchSink};
use crate::error::{Result, RoutingError};
use crate::group::{GroupId, GroupSummary};
use crate::schema::{OperatorState, RoutingTree};
use crate::shard::{self, Shard, ShardMessage, ShardSettings};
use crate::store::{SnapshotStore, TreeEvent, TreeSnapshot, TreeSource};
use crate::timer;
use crate::types::{Alert, Fingerprint, LabelSet};
use crate::walker::{self, Evaluation};

/// Handle to a running routing engine.
#[derive(Debug, Clone)]
pub struct RoutingEngine {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    config: EngineConfig,
    store: SnapshotStore,
    clock: Arc<dyn Clock>,
    shards: Vec<mpsc::Sender<ShardMessage>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    stopped: AtomicBool,
}

impl RoutingEngine {
    /// Starts an engine on the current tokio runtime.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the configuration or the initial
    /// tree is invalid.
    pub fn start(config: EngineConfig, tree: &RoutingTree, sink: Arc<dyn DispatchSink>) -> Result<Self> {
        Self::start_with_clock(config, tree, sink, Arc::new(SystemClock))
    }

    /// Starts an engine that reads wall-clock time from `clock`.
    ///
    /// `clock` drives mute interval checks and timestamps. Group timers
    /// always run on the tokio clock.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the configuration or the initial
    /// tree is invalid.
    pub fn start_with_clock(
        config: EngineConfig,
        tree: &RoutingTree,
        sink: Arc<dyn DispatchSink>,
        clock: Arc<dyn Clock>,
    ) -> Result<Self> {
        config.validate()?;
        let store = SnapshotStore::new(tree, config.mute_resolver()?, clock.now())?;
        let snapshot = store.load();

        let (timers, timer_rx) = timer::channel();
        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let settings = ShardSettings {
            retention: config.group_retention,
            max_groups: config.max_groups_per_shard,
        };

        let mut shards = Vec::with_capacity(config.shards);
        let mut tasks = Vec::with_capacity(config.shards + 2);
        for index in 0..config.shards {
            let (tx, rx) = mpsc::channel(config.queue_capacity);
            let shard = Shard::new(
                index,
                Arc::clone(&snapshot),
                timers.clone(),
                notify_tx.clone(),
                Arc::clone(&clock),
                settings.clone(),
            );
            tasks.push(shard.spawn(rx));
            shards.push(tx);
        }
        // the shards hold the only remaining senders, so the wheel and the
        // dispatcher stop once every shard has stopped
        drop(timers);
        drop(notify_tx);
        tasks.push(timer::spawn(timer_rx, shards.clone()));
        tasks.push(dispatch::spawn(notify_rx, sink, config.retry.clone(), shards.clone()));

        info!(
            shards = config.shards,
            tree = snapshot.name(),
            version = snapshot.resource_version(),
            "routing engine started"
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                store,
                clock,
                shards,
                tasks: Mutex::new(tasks),
                stopped: AtomicBool::new(false),
            }),
        })
    }

    /// Engine configuration.
    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.inner.config
    }

    /// True until [`shutdown`](Self::shutdown) is called.
    #[must_use]
    pub fn is_running(&self) -> bool {
        !self.inner.stopped.load(Ordering::SeqCst)
    }

    /// The snapshot in force.
    #[must_use]
    pub fn snapshot(&self) -> Arc<TreeSnapshot> {
        self.inner.store.load()
    }

    /// Dry-runs the walker for a label set against the current tree.
    #[must_use]
    pub fn evaluate(&self, labels: &LabelSet) -> Evaluation {
        walker::evaluate(labels, self.snapshot().tree(), self.inner.clock.now())
    }

    async fn send(&self, shard: usize, message: ShardMessage) -> Result<()> {
        let tx = self
            .inner
            .shards
            .get(shard)
            .ok_or_else(|| RoutingError::evaluation(format!("no shard {shard}")))?;
        tx.send(message).await.map_err(|_| RoutingError::EngineStopped)
    }

    fn ensure_running(&self) -> Result<()> {
        if self.is_running() {
            Ok(())
        } else {
            Err(RoutingError::EngineStopped)
        }
    }

    /// Routes an alert and hands it to the owning shard of every group it
    /// lands in. Returns those groups in route order.
    ///
    /// Waits only for queue space, never for notification delivery.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::EngineStopped` after shutdown.
    pub async fn ingest(&self, alert: Alert) -> Result<Vec<GroupId>> {
        self.ensure_running()?;
        let snapshot = self.snapshot();
        let routed = shard::route_alert(&snapshot, &alert, self.inner.clock.now(), self.inner.shards.len());
        trace!(
            fingerprint = %alert.fingerprint(),
            routes = routed.len(),
            "alert routed"
        );

        let mut groups = Vec::with_capacity(routed.len());
        for (index, group, message) in routed {
            self.send(index, message).await?;
            groups.push(group);
        }
        Ok(groups)
    }

    /// Resolves an alert in every group holding it.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::EngineStopped` after shutdown.
    pub async fn resolve(&self, fingerprint: &Fingerprint) -> Result<()> {
        self.ensure_running()?;
        for index in 0..self.inner.shards.len() {
            self.send(
                index,
                ShardMessage::Resolve {
                    fingerprint: fingerprint.clone(),
                },
            )
            .await?;
        }
        Ok(())
    }

    /// Sends every non-empty group now, regardless of its timers.
    ///
    /// Returns the number of notifications handed to the dispatcher.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::EngineStopped` after shutdown.
    pub async fn flush(&self) -> Result<usize> {
        self.ensure_running()?;
        let mut sent = 0;
        for index in 0..self.inner.shards.len() {
            let (reply, rx) = oneshot::channel();
            self.send(index, ShardMessage::Flush { reply }).await?;
            sent += rx.await.map_err(|_| RoutingError::EngineStopped)?;
        }
        debug!(sent, "forced flush");
        Ok(sent)
    }

    /// Summaries of every live group, ordered by id.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::EngineStopped` after shutdown.
    pub async fn groups(&self) -> Result<Vec<GroupSummary>> {
        self.ensure_running()?;
        let mut all = Vec::new();
        for index in 0..self.inner.shards.len() {
            let (reply, rx) = oneshot::channel();
            self.send(index, ShardMessage::Groups { reply }).await?;
            all.extend(rx.await.map_err(|_| RoutingError::EngineStopped)?);
        }
        all.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(all)
    }

    /// Compiles `tree` and makes it current.
    ///
    /// Groups whose route disappeared or changed are dropped; matching
    /// alerts rebuild them against the new tree.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the tree does not compile, in which
    /// case the current tree stays in force, or `EngineStopped` after
    /// shutdown.
    pub async fn reload(&self, tree: &RoutingTree) -> Result<Arc<TreeSnapshot>> {
        self.ensure_running()?;
        let snapshot = self.inner.store.apply(tree, self.inner.clock.now())?;
        for index in 0..self.inner.shards.len() {
            self.send(index, ShardMessage::Reload(Arc::clone(&snapshot)))
                .await?;
        }
        Ok(snapshot)
    }

    fn manages(&self, name: &str) -> bool {
        self.inner
            .config
            .tree_name
            .as_deref()
            .is_none_or(|managed| managed == name)
    }

    /// Applies one change from a tree source and records the outcome in the
    /// tree's status under the configured operator id.
    ///
    /// A deleted tree leaves the last applied version in force.
    ///
    /// # Errors
    ///
    /// Returns an error if the status cannot be written or the engine has
    /// stopped. A tree that fails to compile is reported in its status,
    /// not as an error.
    pub async fn reconcile(&self, source: &dyn TreeSource, event: TreeEvent) -> Result<()> {
        match event {
            TreeEvent::Applied(tree) => {
                if !self.manages(tree.name()) {
                    trace!(tree = tree.name(), "ignoring unmanaged tree");
                    return Ok(());
                }
                let version = tree.resource_version().to_string();
                let state = match self.reload(&tree).await {
                    Ok(_) => OperatorState::success(&version),
                    Err(e) if e.is_config() => OperatorState::error(&version, e.to_string()),
                    Err(e) => return Err(e),
                };
                let states = BTreeMap::from([(self.inner.config.operator_id.clone(), state)]);
                source.update_status(tree.name(), states).await
            }
            TreeEvent::Deleted(name) => {
                if self.manages(&name) {
                    warn!(tree = %name, "routing tree deleted, keeping last applied version");
                }
                Ok(())
            }
        }
    }

    /// Reconciles the trees a source currently holds.
    ///
    /// With `tree_name` configured only that tree is fetched; otherwise every
    /// listed tree is applied in list order.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::TreeNotFound` if the configured tree is absent,
    /// or any error from [`reconcile`](Self::reconcile).
    pub async fn sync(&self, source: &dyn TreeSource) -> Result<()> {
        let trees = match self.inner.config.tree_name.as_deref() {
            Some(name) => vec![source.get(name).await?],
            None => source.list().await?.items,
        };
        for tree in trees {
            self.reconcile(source, TreeEvent::Applied(tree)).await?;
        }
        Ok(())
    }

    /// Follows a source's change stream until it closes or the engine stops.
    ///
    /// # Errors
    ///
    /// Returns an error if the source refuses the subscription.
    pub async fn watch(&self, source: Arc<dyn TreeSource>) -> Result<JoinHandle<()>> {
        let mut events = source.watch().await?;
        let engine = self.clone();
        Ok(tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                match engine.reconcile(source.as_ref(), event).await {
                    Ok(()) => {}
                    Err(RoutingError::EngineStopped) => break,
                    Err(e) => warn!(error = %e, "reconcile failed"),
                }
            }
            debug!("tree watch ended");
        }))
    }

    /// Stops every shard and waits for the background tasks.
    ///
    /// With `flush`, every non-empty group is sent first and those
    /// notifications are delivered (or given up on) before this returns.
    /// Returns the number of notifications sent by the final flush.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::EngineStopped` if the engine was already
    /// stopped.
    pub async fn shutdown(&self, flush: bool) -> Result<usize> {
        if self.inner.stopped.swap(true, Ordering::SeqCst) {
            return Err(RoutingError::EngineStopped);
        }

        let mut sent = 0;
        for tx in &self.inner.shards {
            let (reply, rx) = oneshot::channel();
            if tx.send(ShardMessage::Shutdown { flush, reply }).await.is_ok() {
                sent += rx.await.unwrap_or(0);
            }
        }

        let tasks = std::mem::take(&mut *self.inner.tasks.lock());
        for task in tasks {
            if let Err(e) = task.await {
                error!(error = %e, "engine task failed");
            }
        }
        info!(sent, "routing engine stopped");
        Ok(sent)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::dispatch::RecordingSink;
    use crate::schema::{Matcher, OperatorStateKind, Route, RouteDefaults};
    use crate::store::MemoryTreeSource;
    use chrono::{TimeZone, Utc};
    use std::time::Duration;

    fn config() -> EngineConfig {
        EngineConfig {
            shards: 2,
            ..EngineConfig::default()
        }
    }

    fn tree(name: &str, db_receiver: &str) -> RoutingTree {
        RoutingTree::new(
            name,
            RouteDefaults::new("ops"),
            vec![Route::new().matcher(Matcher::eq("team", "db")).receiver(db_receiver)],
        )
    }

    fn engine(config: EngineConfig) -> (RoutingEngine, Arc<RecordingSink>) {
        let sink = Arc::new(RecordingSink::new());
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 8, 9, 0, 0).unwrap()));
        let engine = RoutingEngine::start_with_clock(config, &tree("main", "dba"), sink.clone(), clock).unwrap();
        (engine, sink)
    }

    mod lifecycle_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn ingest_returns_groups() {
            let (engine, _) = engine(config());
            let groups = engine
                .ingest(Alert::from_pairs([("alertname", "Down"), ("team", "db")]))
                .await
                .unwrap();
            assert_eq!(groups.len(), 1);
            assert_eq!(groups[0].route.as_str(), "root/0");
            engine.shutdown(false).await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn stopped_engine_rejects_calls() {
            let (engine, _) = engine(config());
            engine.shutdown(false).await.unwrap();
            assert!(!engine.is_running());
            let result = engine.ingest(Alert::from_pairs([("a", "b")])).await;
            assert!(matches!(result, Err(RoutingError::EngineStopped)));
            assert!(matches!(engine.shutdown(false).await, Err(RoutingError::EngineStopped)));
        }

        #[tokio::test(start_paused = true)]
        async fn shutdown_flushes_and_delivers() {
            let (engine, sink) = engine(config());
            engine.ingest(Alert::from_pairs([("team", "db")])).await.unwrap();
            engine.ingest(Alert::from_pairs([("team", "web")])).await.unwrap();
            assert_eq!(engine.shutdown(true).await.unwrap(), 2);
            let mut receivers = sink.receivers();
            receivers.sort();
            assert_eq!(receivers, vec!["dba", "ops"]);
        }

        #[test]
        fn invalid_config_is_rejected() {
            let sink = Arc::new(RecordingSink::new());
            let config = EngineConfig {
                shards: 0,
                ..EngineConfig::default()
            };
            let result = RoutingEngine::start(config, &tree("main", "dba"), sink);
            assert!(matches!(result, Err(RoutingError::Config { .. })));
        }

        #[tokio::test(start_paused = true)]
        async fn evaluate_is_a_dry_run() {
            let (engine, _) = engine(config());
            let evaluation = engine.evaluate(&crate::types::labels([("team", "db")]));
            assert_eq!(evaluation.matched.len(), 1);
            assert_eq!(evaluation.matched[0].receiver(), "dba");
            assert!(engine.groups().await.unwrap().is_empty());
            engine.shutdown(false).await.unwrap();
        }
    }

    mod reconcile_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn writes_success_state() {
            let (engine, _) = engine(config());
            let source = MemoryTreeSource::new();
            let stored = source.apply(tree("main", "dba-2"));
            engine
                .reconcile(&source, TreeEvent::Applied(stored.clone()))
                .await
                .unwrap();

            let states = source.operator_states("main");
            let state = &states["claw-router"];
            assert_eq!(state.state, OperatorStateKind::Success);
            assert_eq!(state.last_evaluation, stored.resource_version());
            assert_eq!(engine.snapshot().resource_version(), stored.resource_version());
            engine.shutdown(false).await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn invalid_tree_reports_error_and_keeps_current() {
            let (engine, _) = engine(config());
            let before = engine.snapshot().generation();
            let source = MemoryTreeSource::new();
            let broken = RoutingTree::new(
                "main",
                RouteDefaults::new("ops"),
                vec![Route::new().matcher(Matcher::re("team", "(")).receiver("x")],
            );
            let stored = source.apply(broken);
            engine
                .reconcile(&source, TreeEvent::Applied(stored))
                .await
                .unwrap();

            let state = &source.operator_states("main")["claw-router"];
            assert_eq!(state.state, OperatorStateKind::Error);
            assert!(state.descriptive_state.is_some());
            assert_eq!(engine.snapshot().generation(), before);
            engine.shutdown(false).await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn unmanaged_trees_are_ignored() {
            let (engine, _) = engine(EngineConfig {
                tree_name: Some("main".to_string()),
                ..config()
            });
            let source = MemoryTreeSource::new();
            let other = source.apply(tree("other", "x"));
            engine
                .reconcile(&source, TreeEvent::Applied(other))
                .await
                .unwrap();
            assert!(source.operator_states("other").is_empty());
            assert_eq!(engine.snapshot().generation(), 1);
            engine.shutdown(false).await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn deletion_keeps_last_applied() {
            let (engine, _) = engine(config());
            let source = MemoryTreeSource::new();
            engine
                .reconcile(&source, TreeEvent::Deleted("main".to_string()))
                .await
                .unwrap();
            assert_eq!(engine.snapshot().name(), "main");
            engine.shutdown(false).await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn sync_fetches_named_tree() {
            let (engine, _) = engine(EngineConfig {
                tree_name: Some("main".to_string()),
                ..config()
            });
            let source = MemoryTreeSource::new();
            assert!(matches!(
                engine.sync(&source).await,
                Err(RoutingError::TreeNotFound { .. })
            ));
            source.apply(tree("main", "dba-2"));
            engine.sync(&source).await.unwrap();
            assert_eq!(engine.snapshot().generation(), 2);
            engine.shutdown(false).await.unwrap();
        }

        #[tokio::test(start_paused = true)]
        async fn watch_follows_changes() {
            let (engine, _) = engine(config());
            let source = Arc::new(MemoryTreeSource::new());
            let watcher = engine.watch(source.clone()).await.unwrap();

            source.apply(tree("main", "dba-2"));
            tokio::time::sleep(Duration::from_millis(10)).await;
            let evaluation = engine.evaluate(&crate::types::labels([("team", "db")]));
            assert_eq!(evaluation.matched[0].receiver(), "dba-2");

            engine.shutdown(false).await.unwrap();
            // the next event finds the engine stopped and ends the watch
            source.apply(tree("main", "dba-3"));
            watcher.await.unwrap();
        }
    }
}

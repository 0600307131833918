//! Routing tree store adapter.
//!
//! A [`TreeSource`] is where routing tree resources live. The engine reads
//! the active tree from it, follows its change stream, and writes operator
//! status back. [`SnapshotStore`] holds the compiled tree currently in force
//! behind an [`ArcSwap`]: evaluations load the pointer without locking, and a
//! reload that fails to compile leaves the last good snapshot in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arc_swap::ArcSwap;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::error::{Result, RoutingError};
use crate::matcher::RegexCache;
use crate::mute::MuteResolver;
use crate::schema::{OperatorState, RoutingTree, RoutingTreeList};
use crate::tree::CompiledTree;

/// Capacity of a watch stream.
const WATCH_BUFFER: usize = 64;

/// A change to a routing tree resource.
#[derive(Debug, Clone, PartialEq)]
pub enum TreeEvent {
    /// Created or updated.
    Applied(RoutingTree),
    /// Removed; carries the tree name.
    Deleted(String),
}

/// Store holding routing tree resources.
#[async_trait]
pub trait TreeSource: Send + Sync {
    /// Fetches a tree by name.
    async fn get(&self, name: &str) -> Result<RoutingTree>;

    /// Lists every tree.
    async fn list(&self) -> Result<RoutingTreeList>;

    /// Subscribes to changes made after the call.
    async fn watch(&self) -> Result<mpsc::Receiver<TreeEvent>>;

    /// Merges operator states into a tree's status.
    async fn update_status(&self, name: &str, states: BTreeMap<String, OperatorState>) -> Result<()>;
}

/// In-process [`TreeSource`].
///
/// Every write bumps a store-wide resource version, like a control plane
/// would.
#[derive(Debug, Default)]
pub struct MemoryTreeSource {
    trees: RwLock<HashMap<String, RoutingTree>>,
    watchers: Mutex<Vec<mpsc::Sender<TreeEvent>>>,
    version: Mutex<u64>,
}

impl MemoryTreeSource {
    /// Creates an empty source.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn next_version(&self) -> String {
        let mut version = self.version.lock();
        *version += 1;
        version.to_string()
    }

    fn notify(&self, event: &TreeEvent) {
        let mut watchers = self.watchers.lock();
        watchers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("tree watcher lagging, event dropped");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Creates or replaces a tree and notifies watchers.
    ///
    /// Returns the stored resource with its new resource version.
    pub fn apply(&self, tree: RoutingTree) -> RoutingTree {
        let mut tree = tree;
        tree.metadata.resource_version = Some(self.next_version());
        if let Some(existing) = self.trees.read().get(tree.name()) {
            tree.status = existing.status.clone();
        }
        self.trees
            .write()
            .insert(tree.name().to_string(), tree.clone());
        debug!(tree = tree.name(), version = tree.resource_version(), "tree applied");
        self.notify(&TreeEvent::Applied(tree.clone()));
        tree
    }

    /// Removes a tree and notifies watchers. Returns false if it did not exist.
    pub fn delete(&self, name: &str) -> bool {
        let removed = self.trees.write().remove(name).is_some();
        if removed {
            self.notify(&TreeEvent::Deleted(name.to_string()));
        }
        removed
    }

    /// Operator states currently recorded for a tree.
    #[must_use]
    pub fn operator_states(&self, name: &str) -> BTreeMap<String, OperatorState> {
        self.trees
            .read()
            .get(name)
            .map(|t| t.status.operator_states.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl TreeSource for MemoryTreeSource {
    async fn get(&self, name: &str) -> Result<RoutingTree> {
        self.trees
            .read()
            .get(name)
            .cloned()
            .ok_or_else(|| RoutingError::TreeNotFound {
                name: name.to_string(),
            })
    }

    async fn list(&self) -> Result<RoutingTreeList> {
        let mut items: Vec<RoutingTree> = self.trees.read().values().cloned().collect();
        items.sort_by(|a, b| a.name().cmp(b.name()));
        let mut list = RoutingTreeList::new(items);
        list.metadata.resource_version = Some(self.version.lock().to_string());
        Ok(list)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<TreeEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        self.watchers.lock().push(tx);
        Ok(rx)
    }

    async fn update_status(&self, name: &str, states: BTreeMap<String, OperatorState>) -> Result<()> {
        let mut trees = self.trees.write();
        let tree = trees.get_mut(name).ok_or_else(|| RoutingError::TreeNotFound {
            name: name.to_string(),
        })?;
        tree.status.operator_states.extend(states);
        Ok(())
    }
}

/// A compiled tree in force, tagged with its load generation.
#[derive(Debug)]
pub struct TreeSnapshot {
    tree: CompiledTree,
    generation: u64,
    loaded_at: DateTime<Utc>,
}

impl TreeSnapshot {
    /// The compiled tree.
    #[must_use]
    pub const fn tree(&self) -> &CompiledTree {
        &self.tree
    }

    /// Increases by one with every successful load.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// When the snapshot was installed.
    #[must_use]
    pub const fn loaded_at(&self) -> DateTime<Utc> {
        self.loaded_at
    }

    /// Tree name.
    #[must_use]
    pub fn name(&self) -> &str {
        self.tree.name()
    }

    /// Resource version the snapshot was compiled from.
    #[must_use]
    pub fn resource_version(&self) -> &str {
        self.tree.resource_version()
    }
}

/// The active snapshot plus what is needed to compile the next one.
#[derive(Debug)]
pub struct SnapshotStore {
    current: ArcSwap<TreeSnapshot>,
    regex: RegexCache,
    mute: MuteResolver,
    apply_lock: Mutex<()>,
}

impl SnapshotStore {
    /// Compiles the initial tree.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the tree does not compile.
    pub fn new(tree: &RoutingTree, mute: MuteResolver, now: DateTime<Utc>) -> Result<Self> {
        let regex = RegexCache::new();
        let compiled = CompiledTree::compile(tree, &mute, &regex)?;
        info!(
            tree = compiled.name(),
            version = compiled.resource_version(),
            routes = compiled.len(),
            "routing tree loaded"
        );
        let snapshot = TreeSnapshot {
            tree: compiled,
            generation: 1,
            loaded_at: now,
        };
        Ok(Self {
            current: ArcSwap::from_pointee(snapshot),
            regex,
            mute,
            apply_lock: Mutex::new(()),
        })
    }

    /// The snapshot in force. Lock-free.
    #[must_use]
    pub fn load(&self) -> Arc<TreeSnapshot> {
        self.current.load_full()
    }

    /// Compiles `tree` and makes it the active snapshot.
    ///
    /// Evaluations already holding the previous snapshot finish against it.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the tree does not compile; the
    /// previous snapshot stays active.
    pub fn apply(&self, tree: &RoutingTree, now: DateTime<Utc>) -> Result<Arc<TreeSnapshot>> {
        let _guard = self.apply_lock.lock();
        let previous = self.current.load();

        let compiled = match CompiledTree::compile(tree, &self.mute, &self.regex) {
            Ok(compiled) => compiled,
            Err(e) => {
                warn!(
                    tree = tree.name(),
                    version = tree.resource_version(),
                    active = previous.resource_version(),
                    error = %e,
                    "rejected routing tree, keeping last good version"
                );
                return Err(e);
            }
        };

        let snapshot = Arc::new(TreeSnapshot {
            tree: compiled,
            generation: previous.generation + 1,
            loaded_at: now,
        });
        self.current.store(Arc::clone(&snapshot));
        info!(
            tree = snapshot.name(),
            version = snapshot.resource_version(),
            generation = snapshot.generation,
            routes = snapshot.tree.len(),
            "routing tree reloaded"
        );
        Ok(snapshot)
    }

    /// Regex cache shared by every compile.
    #[must_use]
    pub const fn regex_cache(&self) -> &RegexCache {
        &self.regex
    }

    /// Mute resolver trees are validated against.
    #[must_use]
    pub const fn mute(&self) -> &MuteResolver {
        &self.mute
    }
}

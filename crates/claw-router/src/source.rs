//! File-backed routing tree source.
//!
//! The tree lives in a single JSON or YAML file. Its directory is watched
//! through `notify` so that edits, atomic replaces and removals are all
//! seen; operator status is kept in memory and logged, since the file
//! belongs to whoever edits it.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::hash::{Hash, Hasher};
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use claw_routing::{
    OperatorState, OperatorStateKind, Result, RoutingError, RoutingTree, RoutingTreeList,
    TreeEvent, TreeSource,
};

use crate::error::CliError;

const WATCH_BUFFER: usize = 16;

/// Tree file encodings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Encoding {
    Json,
    Yaml,
}

impl Encoding {
    fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|e| e.to_str()) {
            Some("json") => Self::Json,
            _ => Self::Yaml,
        }
    }
}

/// Parses a routing tree from file contents.
///
/// Without a `resourceVersion` in the file, one is derived from the content
/// so that every edit yields a new version.
///
/// # Errors
///
/// Returns an error if the contents do not describe a routing tree.
pub fn parse_tree(path: &Path, content: &str) -> std::result::Result<RoutingTree, CliError> {
    let mut tree: RoutingTree = match Encoding::for_path(path) {
        Encoding::Json => serde_json::from_str(content).map_err(|e| CliError::file(path, e.to_string()))?,
        Encoding::Yaml => serde_yaml::from_str(content).map_err(|e| CliError::file(path, e.to_string()))?,
    };
    if tree.metadata.resource_version.is_none() {
        tree.metadata.resource_version = Some(content_version(content));
    }
    if tree.metadata.name.is_empty() {
        let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or("default");
        tree.metadata.name = stem.to_string();
    }
    Ok(tree)
}

/// Reads and parses a routing tree file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or parsed.
pub fn load_tree(path: &Path) -> std::result::Result<RoutingTree, CliError> {
    let content = std::fs::read_to_string(path).map_err(|e| CliError::file(path, e.to_string()))?;
    parse_tree(path, &content)
}

fn content_version(content: &str) -> String {
    let mut hasher = DefaultHasher::new();
    content.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

/// A [`TreeSource`] over one file.
#[derive(Debug)]
pub struct FileTreeSource {
    path: PathBuf,
    debounce: Duration,
    states: Mutex<BTreeMap<String, OperatorState>>,
}

impl FileTreeSource {
    /// Creates a source for `path`. While watched, a change is read once
    /// the file has been quiet for `debounce`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>, debounce: Duration) -> Self {
        Self {
            path: path.into(),
            debounce,
            states: Mutex::new(BTreeMap::new()),
        }
    }

    /// The watched file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Operator states reported so far.
    #[must_use]
    pub fn operator_states(&self) -> BTreeMap<String, OperatorState> {
        self.states.lock().clone()
    }

    fn read(&self) -> Result<RoutingTree> {
        load_tree(&self.path).map_err(|e| RoutingError::Serialization(e.to_string()))
    }
}

#[async_trait]
impl TreeSource for FileTreeSource {
    async fn get(&self, name: &str) -> Result<RoutingTree> {
        let tree = self.read()?;
        if tree.name() == name {
            Ok(tree)
        } else {
            Err(RoutingError::TreeNotFound {
                name: name.to_string(),
            })
        }
    }

    async fn list(&self) -> Result<RoutingTreeList> {
        let tree = self.read()?;
        let mut list = RoutingTreeList::new(vec![tree.clone()]);
        list.metadata.resource_version = tree.metadata.resource_version;
        Ok(list)
    }

    async fn watch(&self) -> Result<mpsc::Receiver<TreeEvent>> {
        let (tx, rx) = mpsc::channel(WATCH_BUFFER);
        let (changed_tx, changed_rx) = mpsc::unbounded_channel();
        let file_name = self.path.file_name().map(ToOwned::to_owned);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) => {
                let ours = event.paths.iter().any(|p| p.file_name() == file_name.as_deref());
                if ours && touches_content(&event.kind) {
                    let _ = changed_tx.send(());
                }
            }
            Err(e) => warn!(error = %e, "filesystem watcher error"),
        })
        .map_err(|e| RoutingError::Watch(e.to_string()))?;

        // the directory, so replacing or removing the file keeps the watch alive
        let dir = watch_dir(&self.path);
        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .map_err(|e| RoutingError::Watch(format!("{}: {e}", dir.display())))?;
        info!(path = %self.path.display(), "watching routing tree file");

        let initial = std::fs::read_to_string(&self.path).ok();
        tokio::spawn(follow(watcher, self.path.clone(), self.debounce, initial, changed_rx, tx));
        Ok(rx)
    }

    async fn update_status(&self, name: &str, states: BTreeMap<String, OperatorState>) -> Result<()> {
        for (operator, state) in &states {
            match state.state {
                OperatorStateKind::Error => warn!(
                    tree = name,
                    operator = %operator,
                    version = %state.last_evaluation,
                    error = state.descriptive_state.as_deref().unwrap_or(""),
                    "routing tree rejected"
                ),
                _ => info!(
                    tree = name,
                    operator = %operator,
                    version = %state.last_evaluation,
                    state = state.state.as_str(),
                    "routing tree status"
                ),
            }
        }
        self.states.lock().extend(states);
        Ok(())
    }
}

fn watch_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

const fn touches_content(kind: &EventKind) -> bool {
    matches!(kind, EventKind::Create(_) | EventKind::Modify(_) | EventKind::Remove(_))
}

/// Emits an event whenever the file content changes, until the receiver
/// goes away. Owns the watcher for as long as it runs.
async fn follow(
    _watcher: RecommendedWatcher,
    path: PathBuf,
    debounce: Duration,
    mut last: Option<String>,
    mut changed: mpsc::UnboundedReceiver<()>,
    tx: mpsc::Sender<TreeEvent>,
) {
    let mut last_name: Option<String> = last
        .as_deref()
        .and_then(|c| parse_tree(&path, c).ok())
        .map(|t| t.name().to_string());

    loop {
        tokio::select! {
            change = changed.recv() => {
                if change.is_none() {
                    break;
                }
            }
            () = tx.closed() => break,
        }
        // one save tends to raise several events
        tokio::time::sleep(debounce).await;
        while changed.try_recv().is_ok() {}

        let current = tokio::fs::read_to_string(&path).await.ok();
        if current == last {
            continue;
        }
        let event = match current.as_deref() {
            Some(content) => match parse_tree(&path, content) {
                Ok(tree) => {
                    last_name = Some(tree.name().to_string());
                    Some(TreeEvent::Applied(tree))
                }
                Err(e) => {
                    warn!(error = %e, "routing tree file unreadable, keeping current tree");
                    None
                }
            },
            None => last_name.take().map(TreeEvent::Deleted),
        };
        last = current;

        if let Some(event) = event {
            debug!(path = %path.display(), "routing tree file changed");
            if tx.send(event).await.is_err() {
                break;
            }
        }
    }
    debug!(path = %path.display(), "stopped watching routing tree file");
}

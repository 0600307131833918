//! Compiled routing trees.
//!
//! [`CompiledTree::compile`] validates a [`RoutingTree`] resource and flattens
//! it into an arena of [`RouteNode`]s. Every node carries a fully resolved
//! [`EffectiveConfig`]: inheritance runs once here, so the walker never asks
//! "is this field set?". Children are referenced by index; the parent index is
//! kept for diagnostics only.

use std::collections::hash_map::DefaultHasher;
use std::fmt::{self, Write as _};
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, RoutingError};
use crate::matcher::{matches_all, CompiledMatcher, RegexCache};
use crate::mute::MuteResolver;
use crate::schema::{Matcher, Route, RoutingTree};
use crate::types::LabelSet;

/// Maximum nesting of routes below the root.
pub const MAX_ROUTE_DEPTH: usize = 64;

/// `group_wait` when neither a route nor the defaults set one.
pub const DEFAULT_GROUP_WAIT: Duration = Duration::from_secs(30);

/// `group_interval` when neither a route nor the defaults set one.
pub const DEFAULT_GROUP_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// `repeat_interval` when neither a route nor the defaults set one.
pub const DEFAULT_REPEAT_INTERVAL: Duration = Duration::from_secs(4 * 60 * 60);

/// `group_by` entry meaning "every label".
pub const GROUP_BY_ALL: &str = "...";

/// Index of a node in a [`CompiledTree`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId(usize);

impl NodeId {
    /// The synthetic root built from the tree defaults.
    pub const ROOT: Self = Self(0);

    /// Position in the arena.
    #[must_use]
    pub const fn index(self) -> usize {
        self.0
    }
}

/// Stable identity of a route: its index path from the root, e.g. `root/0/2`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RouteKey(String);

impl RouteKey {
    /// Key of the root route.
    #[must_use]
    pub fn root() -> Self {
        Self("root".to_string())
    }

    pub(crate) fn child(&self, index: usize) -> Self {
        Self(format!("{}/{index}", self.0))
    }

    /// Returns the key as a string.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which labels form the group key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "mode", content = "labels")]
pub enum GroupBy {
    /// Every label of the alert.
    All,
    /// The listed labels, sorted and deduplicated.
    Labels(Vec<String>),
}

impl GroupBy {
    fn from_list(labels: &[String]) -> Result<Self> {
        if labels.is_empty() {
            return Ok(Self::All);
        }
        if labels.iter().any(|l| l == GROUP_BY_ALL) {
            if labels.len() > 1 {
                return Err(RoutingError::config(format!(
                    "group_by '{GROUP_BY_ALL}' cannot be combined with other labels"
                )));
            }
            return Ok(Self::All);
        }
        if labels.iter().any(String::is_empty) {
            return Err(RoutingError::config("group_by contains an empty label name"));
        }
        let mut sorted = labels.to_vec();
        sorted.sort();
        sorted.dedup();
        Ok(Self::Labels(sorted))
    }

    /// Projects an alert's labels onto the group-by set.
    ///
    /// Labels listed but absent on the alert are left out.
    #[must_use]
    pub fn project(&self, labels: &LabelSet) -> LabelSet {
        match self {
            Self::All => labels.clone(),
            Self::Labels(names) => names
                .iter()
                .filter_map(|n| labels.get(n).map(|v| (n.clone(), v.clone())))
                .collect(),
        }
    }
}

impl fmt::Display for GroupBy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::All => f.write_str(GROUP_BY_ALL),
            Self::Labels(names) => f.write_str(&names.join(",")),
        }
    }
}

/// Fully resolved settings of one route.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EffectiveConfig {
    /// Receiver name.
    pub receiver: String,
    /// Group key labels.
    pub group_by: GroupBy,
    /// Delay before a new group's first notification.
    #[serde(with = "humantime_serde")]
    pub group_wait: Duration,
    /// Minimum delay between notifications carrying new alerts.
    #[serde(with = "humantime_serde")]
    pub group_interval: Duration,
    /// Delay before re-sending an unchanged notification.
    #[serde(with = "humantime_serde")]
    pub repeat_interval: Duration,
    /// This route's own mute intervals (not inherited).
    pub mute_time_intervals: Vec<String>,
}

/// A compiled route.
#[derive(Debug, Clone)]
pub struct RouteNode {
    id: NodeId,
    parent: Option<NodeId>,
    key: RouteKey,
    depth: usize,
    matchers: Vec<CompiledMatcher>,
    continue_matching: bool,
    config: Arc<EffectiveConfig>,
    children: Vec<NodeId>,
    fingerprint: u64,
}

impl RouteNode {
    /// Arena index.
    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    /// Parent node, `None` for the root. Diagnostics only.
    #[must_use]
    pub const fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    /// Stable path key.
    #[must_use]
    pub const fn key(&self) -> &RouteKey {
        &self.key
    }

    /// Depth below the root (root is 0).
    #[must_use]
    pub const fn depth(&self) -> usize {
        self.depth
    }

    /// `continue` flag.
    #[must_use]
    pub const fn continue_matching(&self) -> bool {
        self.continue_matching
    }

    /// Resolved settings.
    #[must_use]
    pub fn config(&self) -> &Arc<EffectiveConfig> {
        &self.config
    }

    /// Child indices in evaluation order.
    #[must_use]
    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// Hash over this route's matchers, flags, resolved settings and all of
    /// its ancestors'. Changes whenever anything that decides what lands in
    /// this route's groups changes.
    #[must_use]
    pub const fn fingerprint(&self) -> u64 {
        self.fingerprint
    }

    /// Conjunction of this node's matchers.
    #[must_use]
    pub fn matches(&self, labels: &LabelSet) -> bool {
        matches_all(&self.matchers, labels)
    }
}

/// A validated, immutable routing tree.
#[derive(Debug, Clone)]
pub struct CompiledTree {
    name: String,
    resource_version: String,
    nodes: Vec<RouteNode>,
    mute: MuteResolver,
}

struct Inherited<'a> {
    receiver: &'a str,
    group_by: &'a [String],
    group_wait: Duration,
    group_interval: Duration,
    repeat_interval: Duration,
}

impl CompiledTree {
    /// Validates and compiles a routing tree resource.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Config` if the defaults have no receiver, a
    /// duration or regex is malformed, a mute interval is unknown, or the tree
    /// is nested deeper than [`MAX_ROUTE_DEPTH`]. The error names the route.
    pub fn compile(tree: &RoutingTree, mute: &MuteResolver, cache: &RegexCache) -> Result<Self> {
        let defaults = &tree.spec.defaults;
        if defaults.receiver.is_empty() {
            return Err(RoutingError::config("defaults.receiver is required"));
        }

        let empty = Vec::new();
        let base = Inherited {
            receiver: &defaults.receiver,
            group_by: defaults.group_by.as_ref().unwrap_or(&empty),
            group_wait: DEFAULT_GROUP_WAIT,
            group_interval: DEFAULT_GROUP_INTERVAL,
            repeat_interval: DEFAULT_REPEAT_INTERVAL,
        };

        // The root is a route with no matchers carrying the defaults' settings.
        let root = Route {
            continue_matching: false,
            matchers: Vec::new(),
            group_by: defaults.group_by.clone(),
            group_wait: defaults.group_wait.clone(),
            group_interval: defaults.group_interval.clone(),
            repeat_interval: defaults.repeat_interval.clone(),
            mute_time_intervals: Vec::new(),
            receiver: Some(defaults.receiver.clone()),
            routes: tree.spec.routes.clone(),
        };

        let mut compiled = Self {
            name: tree.name().to_string(),
            resource_version: tree.resource_version().to_string(),
            nodes: Vec::new(),
            mute: mute.clone(),
        };
        compiled.add_node(&root, None, RouteKey::root(), 0, &base, 0, cache)?;

        debug!(
            tree = %compiled.name,
            version = %compiled.resource_version,
            routes = compiled.nodes.len(),
            "compiled routing tree"
        );
        Ok(compiled)
    }

    #[allow(clippy::too_many_arguments)]
    fn add_node(
        &mut self,
        route: &Route,
        parent: Option<NodeId>,
        key: RouteKey,
        depth: usize,
        inherited: &Inherited<'_>,
        parent_fingerprint: u64,
        cache: &RegexCache,
    ) -> Result<NodeId> {
        if depth > MAX_ROUTE_DEPTH {
            return Err(RoutingError::config(format!(
                "route {key}: nesting exceeds maximum depth of {MAX_ROUTE_DEPTH}"
            )));
        }

        let at_route = |e: RoutingError| match e {
            RoutingError::Config { reason } => RoutingError::config(format!("route {key}: {reason}")),
            other => other,
        };

        let matchers = route
            .matchers
            .iter()
            .map(|m| CompiledMatcher::compile(m, cache))
            .collect::<Result<Vec<_>>>()
            .map_err(at_route)?;
        self.mute.validate(&route.mute_time_intervals).map_err(at_route)?;

        let receiver = route
            .receiver
            .as_deref()
            .filter(|r| !r.is_empty())
            .unwrap_or(inherited.receiver);
        let group_by_list = route
            .group_by
            .as_deref()
            .filter(|g| !g.is_empty())
            .unwrap_or(inherited.group_by);
        let group_wait = resolve_duration("group_wait", route.group_wait.as_deref(), inherited.group_wait, true)
            .map_err(at_route)?;
        let group_interval = resolve_duration(
            "group_interval",
            route.group_interval.as_deref(),
            inherited.group_interval,
            false,
        )
        .map_err(at_route)?;
        let repeat_interval = resolve_duration(
            "repeat_interval",
            route.repeat_interval.as_deref(),
            inherited.repeat_interval,
            false,
        )
        .map_err(at_route)?;

        let config = EffectiveConfig {
            receiver: receiver.to_string(),
            group_by: GroupBy::from_list(group_by_list).map_err(at_route)?,
            group_wait,
            group_interval,
            repeat_interval,
            mute_time_intervals: route.mute_time_intervals.clone(),
        };
        let fingerprint = route_fingerprint(
            parent_fingerprint,
            &route.matchers,
            route.continue_matching,
            &config,
        );

        let id = NodeId(self.nodes.len());
        self.nodes.push(RouteNode {
            id,
            parent,
            key: key.clone(),
            depth,
            matchers,
            continue_matching: route.continue_matching,
            config: Arc::new(config),
            children: Vec::with_capacity(route.routes.len()),
            fingerprint,
        });

        let next = Inherited {
            receiver,
            group_by: group_by_list,
            group_wait,
            group_interval,
            repeat_interval,
        };
        for (i, child) in route.routes.iter().enumerate() {
            let child_id = self.add_node(
                child,
                Some(id),
                key.child(i),
                depth + 1,
                &next,
                fingerprint,
                cache,
            )?;
            self.nodes[id.0].children.push(child_id);
        }

        Ok(id)
    }

    /// Tree name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Resource version this tree was compiled from.
    #[must_use]
    pub fn resource_version(&self) -> &str {
        &self.resource_version
    }

    /// The synthetic root.
    #[must_use]
    pub fn root(&self) -> &RouteNode {
        &self.nodes[NodeId::ROOT.0]
    }

    /// Node by index.
    ///
    /// # Panics
    ///
    /// Panics if `id` does not belong to this tree.
    #[must_use]
    pub fn node(&self, id: NodeId) -> &RouteNode {
        &self.nodes[id.0]
    }

    /// Looks a node up by its path key.
    #[must_use]
    pub fn find(&self, key: &RouteKey) -> Option<&RouteNode> {
        self.nodes.iter().find(|n| &n.key == key)
    }

    /// All nodes in pre-order.
    pub fn iter(&self) -> impl Iterator<Item = &RouteNode> {
        self.nodes.iter()
    }

    /// Number of nodes, root included.
    #[must_use]
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    /// Always false: a compiled tree has at least its root.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    /// Mute interval resolver the tree was validated against.
    #[must_use]
    pub const fn mute(&self) -> &MuteResolver {
        &self.mute
    }

    /// Human-readable outline of the tree with resolved settings.
    #[must_use]
    pub fn render(&self) -> String {
        let mut out = String::new();
        for node in &self.nodes {
            let c = &node.config;
            let indent = "  ".repeat(node.depth);
            let matchers: Vec<String> = node.matchers.iter().map(render_matcher).collect();
            let _ = write!(
                out,
                "{indent}{} receiver={} group_by=[{}] wait={} interval={} repeat={}",
                node.key,
                c.receiver,
                c.group_by,
                humantime::format_duration(c.group_wait),
                humantime::format_duration(c.group_interval),
                humantime::format_duration(c.repeat_interval),
            );
            if !matchers.is_empty() {
                let _ = write!(out, " match={{{}}}", matchers.join(", "));
            }
            if node.continue_matching {
                out.push_str(" continue");
            }
            if !c.mute_time_intervals.is_empty() {
                let _ = write!(out, " mute=[{}]", c.mute_time_intervals.join(","));
            }
            out.push('\n');
        }
        out
    }
}

fn render_matcher(m: &CompiledMatcher) -> String {
    format!("{}{}{:?}", m.label(), m.match_type().as_symbol(), m.value())
}

fn resolve_duration(field: &str, value: Option<&str>, inherited: Duration, allow_zero: bool) -> Result<Duration> {
    let Some(raw) = value.filter(|v| !v.is_empty()) else {
        return Ok(inherited);
    };
    let parsed = humantime::parse_duration(raw)
        .map_err(|e| RoutingError::config(format!("invalid {field} {raw:?}: {e}")))?;
    if !allow_zero && parsed.is_zero() {
        return Err(RoutingError::config(format!("{field} must be greater than zero")));
    }
    Ok(parsed)
}

fn route_fingerprint(parent: u64, matchers: &[Matcher], continue_matching: bool, config: &EffectiveConfig) -> u64 {
    let mut hasher = DefaultHasher::new();
    parent.hash(&mut hasher);
    matchers.hash(&mut hasher);
    continue_matching.hash(&mut hasher);
    config.hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mute::{StaticIntervalRegistry, TimeIntervalSpec, TimeRangeSpec};
    use crate::schema::RouteDefaults;
    use crate::types::labels;

    fn compile(tree: &RoutingTree) -> Result<CompiledTree> {
        CompiledTree::compile(tree, &MuteResolver::empty(), &RegexCache::new())
    }

    fn defaults() -> RouteDefaults {
        RouteDefaults {
            receiver: "ops".to_string(),
            group_by: Some(vec!["alertname".to_string()]),
            group_wait: Some("10s".to_string()),
            group_interval: None,
            repeat_interval: Some("1h".to_string()),
        }
    }

    mod inheritance_tests {
        use super::*;

        #[test]
        fn root_carries_defaults() {
            let tree = compile(&RoutingTree::new("t", defaults(), vec![])).unwrap();
            assert_eq!(tree.len(), 1);
            let root = tree.root();
            assert_eq!(root.key(), &RouteKey::root());
            assert_eq!(root.config().receiver, "ops");
            assert_eq!(root.config().group_wait, Duration::from_secs(10));
            assert_eq!(root.config().group_interval, DEFAULT_GROUP_INTERVAL);
            assert_eq!(root.config().repeat_interval, Duration::from_secs(3600));
            assert_eq!(root.config().group_by, GroupBy::Labels(vec!["alertname".to_string()]));
        }

        #[test]
        fn child_overrides_field_by_field() {
            let routes = vec![Route::new()
                .matcher(Matcher::eq("team", "db"))
                .receiver("dba")
                .group_wait("1m")
                .route(Route::new().matcher(Matcher::eq("severity", "critical")).repeat_interval("5m"))];
            let tree = compile(&RoutingTree::new("t", defaults(), routes)).unwrap();

            let db = tree.node(tree.root().children()[0]);
            assert_eq!(db.key().as_str(), "root/0");
            assert_eq!(db.config().receiver, "dba");
            assert_eq!(db.config().group_wait, Duration::from_secs(60));
            assert_eq!(db.config().repeat_interval, Duration::from_secs(3600));

            let crit = tree.node(db.children()[0]);
            assert_eq!(crit.key().as_str(), "root/0/0");
            assert_eq!(crit.parent(), Some(db.id()));
            assert_eq!(crit.depth(), 2);
            assert_eq!(crit.config().receiver, "dba");
            assert_eq!(crit.config().group_wait, Duration::from_secs(60));
            assert_eq!(crit.config().repeat_interval, Duration::from_secs(300));
            assert_eq!(crit.config().group_by, GroupBy::Labels(vec!["alertname".to_string()]));
        }

        #[test]
        fn empty_receiver_and_group_by_inherit() {
            let mut route = Route::new().group_by(Vec::<String>::new());
            route.receiver = Some(String::new());
            let tree = compile(&RoutingTree::new("t", defaults(), vec![route])).unwrap();
            let child = tree.node(tree.root().children()[0]);
            assert_eq!(child.config().receiver, "ops");
            assert_eq!(child.config().group_by, GroupBy::Labels(vec!["alertname".to_string()]));
        }

        #[test]
        fn mute_intervals_are_not_inherited() {
            let mut registry = StaticIntervalRegistry::new();
            registry
                .insert(
                    crate::mute::TimeInterval::compile(&TimeIntervalSpec {
                        name: "weekends".to_string(),
                        time_intervals: vec![TimeRangeSpec::default()],
                    })
                    .unwrap(),
                )
                .unwrap();
            let mute = MuteResolver::new(Arc::new(registry));
            let routes = vec![Route::new()
                .mute_time_interval("weekends")
                .route(Route::new().receiver("child"))];
            let tree =
                CompiledTree::compile(&RoutingTree::new("t", defaults(), routes), &mute, &RegexCache::new())
                    .unwrap();
            let parent = tree.node(tree.root().children()[0]);
            let child = tree.node(parent.children()[0]);
            assert_eq!(parent.config().mute_time_intervals, vec!["weekends".to_string()]);
            assert!(child.config().mute_time_intervals.is_empty());
        }

        #[test]
        fn builtin_timing_defaults() {
            let tree = compile(&RoutingTree::new("t", RouteDefaults::new("ops"), vec![])).unwrap();
            let c = tree.root().config();
            assert_eq!(c.group_wait, DEFAULT_GROUP_WAIT);
            assert_eq!(c.group_interval, DEFAULT_GROUP_INTERVAL);
            assert_eq!(c.repeat_interval, DEFAULT_REPEAT_INTERVAL);
            assert_eq!(c.group_by, GroupBy::All);
        }
    }

    mod validation_tests {
        use super::*;

        fn reason(tree: &RoutingTree) -> String {
            match compile(tree) {
                Err(RoutingError::Config { reason }) => reason,
                other => panic!("expected Config error, got {other:?}"),
            }
        }

        #[test]
        fn missing_default_receiver() {
            let r = reason(&RoutingTree::new("t", RouteDefaults::default(), vec![]));
            assert!(r.contains("receiver"));
        }

        #[test]
        fn invalid_regex_names_route() {
            let routes = vec![
                Route::new().receiver("a"),
                Route::new().route(Route::new().matcher(Matcher::re("x", "(")).receiver("b")),
            ];
            let r = reason(&RoutingTree::new("t", defaults(), routes));
            assert!(r.starts_with("route root/1/0:"), "{r}");
            assert!(r.contains("invalid regex"));
        }

        #[test]
        fn unknown_mute_interval() {
            let routes = vec![Route::new().mute_time_interval("holidays")];
            let r = reason(&RoutingTree::new("t", defaults(), routes));
            assert!(r.contains("holidays"));
        }

        #[test]
        fn bad_duration() {
            let routes = vec![Route::new().group_wait("soon")];
            let r = reason(&RoutingTree::new("t", defaults(), routes));
            assert!(r.contains("group_wait"));
        }

        #[test]
        fn zero_repeat_interval_rejected_but_zero_wait_allowed() {
            let zero_repeat = vec![Route::new().repeat_interval("0s")];
            assert!(reason(&RoutingTree::new("t", defaults(), zero_repeat)).contains("repeat_interval"));

            let zero_wait = vec![Route::new().group_wait("0s")];
            assert!(compile(&RoutingTree::new("t", defaults(), zero_wait)).is_ok());
        }

        #[test]
        fn wildcard_group_by_must_stand_alone() {
            let routes = vec![Route::new().group_by(["...", "team"])];
            assert!(reason(&RoutingTree::new("t", defaults(), routes)).contains("..."));
        }

        #[test]
        fn depth_is_bounded() {
            let mut route = Route::new().receiver("leaf");
            for _ in 0..=MAX_ROUTE_DEPTH {
                route = Route::new().route(route);
            }
            assert!(reason(&RoutingTree::new("t", defaults(), vec![route])).contains("depth"));
        }
    }

    mod fingerprint_tests {
        use super::*;

        fn leaf_fingerprint(tree: &RoutingTree) -> u64 {
            let compiled = compile(tree).unwrap();
            let first = compiled.node(compiled.root().children()[0]);
            compiled.node(first.children()[0]).fingerprint()
        }

        fn tree_with(parent_value: &str, leaf_receiver: &str) -> RoutingTree {
            RoutingTree::new(
                "t",
                defaults(),
                vec![Route::new()
                    .matcher(Matcher::eq("team", parent_value))
                    .route(Route::new().receiver(leaf_receiver))],
            )
        }

        #[test]
        fn stable_across_compiles() {
            assert_eq!(leaf_fingerprint(&tree_with("db", "a")), leaf_fingerprint(&tree_with("db", "a")));
        }

        #[test]
        fn changes_with_own_config() {
            assert_ne!(leaf_fingerprint(&tree_with("db", "a")), leaf_fingerprint(&tree_with("db", "b")));
        }

        #[test]
        fn changes_with_ancestor_matchers() {
            assert_ne!(leaf_fingerprint(&tree_with("db", "a")), leaf_fingerprint(&tree_with("web", "a")));
        }
    }

    #[test]
    fn group_by_projection_skips_absent_labels() {
        let by = GroupBy::Labels(vec!["cluster".to_string(), "team".to_string()]);
        let set = labels([("team", "db"), ("instance", "x")]);
        assert_eq!(by.project(&set), labels([("team", "db")]));
        assert_eq!(GroupBy::All.project(&set), set);
    }

    #[test]
    fn find_by_key_and_render() {
        let routes = vec![Route::new()
            .matcher(Matcher::eq("team", "db"))
            .receiver("dba")
            .continue_matching(true)];
        let tree = compile(&RoutingTree::new("t", defaults(), routes)).unwrap();
        let key = RouteKey::root().child(0);
        assert_eq!(tree.find(&key).map(|n| n.config().receiver.as_str()), Some("dba"));
        assert!(tree.find(&RouteKey::root().child(5)).is_none());

        let rendered = tree.render();
        assert!(rendered.contains("root receiver=ops"));
        assert!(rendered.contains("  root/0 receiver=dba"));
        assert!(rendered.contains("continue"));
    }
}

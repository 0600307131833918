//! Wire schema of the `RoutingTree` resource.
//!
//! These types mirror the resource as it is stored by the hosting control
//! plane. They are plain data: nothing here is validated or resolved. Use
//! [`crate::tree::CompiledTree::compile`] to turn a [`RoutingTree`] into
//! something the walker can evaluate.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, RoutingError};

/// API group/version of the resource.
pub const API_VERSION: &str = "notifications.alerting.grafana.app/v0alpha1";

/// Resource kind.
pub const KIND: &str = "RoutingTree";

/// List kind.
pub const LIST_KIND: &str = "RoutingTreeList";

/// The comparison a [`Matcher`] applies to a label value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MatchType {
    /// Exact equality (`=`).
    #[serde(rename = "=")]
    Equal,
    /// Negated equality (`!=`).
    #[serde(rename = "!=")]
    NotEqual,
    /// Regular expression match (`=~`).
    #[serde(rename = "=~")]
    Regex,
    /// Negated regular expression match (`!~`).
    #[serde(rename = "!~")]
    NotRegex,
}

impl MatchType {
    /// Returns the operator symbol.
    #[must_use]
    pub const fn as_symbol(&self) -> &'static str {
        match self {
            Self::Equal => "=",
            Self::NotEqual => "!=",
            Self::Regex => "=~",
            Self::NotRegex => "!~",
        }
    }

    /// Returns true for the two regex operators.
    #[must_use]
    pub const fn is_regex(&self) -> bool {
        matches!(self, Self::Regex | Self::NotRegex)
    }
}

impl fmt::Display for MatchType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_symbol())
    }
}

/// A single label predicate.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Matcher {
    /// Label name to test.
    pub label: String,
    /// Operator.
    #[serde(rename = "type")]
    pub match_type: MatchType,
    /// Literal value or regex pattern.
    pub value: String,
}

impl Matcher {
    /// Creates a matcher.
    #[must_use]
    pub fn new(label: impl Into<String>, match_type: MatchType, value: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            match_type,
            value: value.into(),
        }
    }

    /// `label = value`.
    #[must_use]
    pub fn eq(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(label, MatchType::Equal, value)
    }

    /// `label != value`.
    #[must_use]
    pub fn ne(label: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(label, MatchType::NotEqual, value)
    }

    /// `label =~ pattern`.
    #[must_use]
    pub fn re(label: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(label, MatchType::Regex, pattern)
    }

    /// `label !~ pattern`.
    #[must_use]
    pub fn not_re(label: impl Into<String>, pattern: impl Into<String>) -> Self {
        Self::new(label, MatchType::NotRegex, pattern)
    }
}

impl fmt::Display for Matcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}{:?}", self.label, self.match_type, self.value)
    }
}

/// A node of the routing policy.
///
/// Unset optional fields inherit from the parent route, and ultimately from
/// [`RouteDefaults`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Route {
    /// Whether evaluation continues to later siblings after this route matched.
    #[serde(rename = "continue", default)]
    pub continue_matching: bool,
    /// Conjunction of label predicates.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub matchers: Vec<Matcher>,
    /// Labels to group by; empty inherits.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    /// How long to wait before the first notification of a new group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<String>,
    /// Minimum time between notifications about new alerts in a group.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<String>,
    /// How long before re-sending an unchanged notification.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,
    /// Named intervals during which this route is muted.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub mute_time_intervals: Vec<String>,
    /// Receiver name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
    /// Child routes, in evaluation order.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub routes: Vec<Route>,
}

impl Route {
    /// Creates an empty route that inherits everything.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a matcher.
    #[must_use]
    pub fn matcher(mut self, matcher: Matcher) -> Self {
        self.matchers.push(matcher);
        self
    }

    /// Sets the receiver.
    #[must_use]
    pub fn receiver(mut self, receiver: impl Into<String>) -> Self {
        self.receiver = Some(receiver.into());
        self
    }

    /// Sets `continue`.
    #[must_use]
    pub const fn continue_matching(mut self, value: bool) -> Self {
        self.continue_matching = value;
        self
    }

    /// Sets the group-by labels.
    #[must_use]
    pub fn group_by<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.group_by = Some(labels.into_iter().map(Into::into).collect());
        self
    }

    /// Sets `group_wait`.
    #[must_use]
    pub fn group_wait(mut self, value: impl Into<String>) -> Self {
        self.group_wait = Some(value.into());
        self
    }

    /// Sets `group_interval`.
    #[must_use]
    pub fn group_interval(mut self, value: impl Into<String>) -> Self {
        self.group_interval = Some(value.into());
        self
    }

    /// Sets `repeat_interval`.
    #[must_use]
    pub fn repeat_interval(mut self, value: impl Into<String>) -> Self {
        self.repeat_interval = Some(value.into());
        self
    }

    /// Adds a mute time interval reference.
    #[must_use]
    pub fn mute_time_interval(mut self, name: impl Into<String>) -> Self {
        self.mute_time_intervals.push(name.into());
        self
    }

    /// Appends a child route.
    #[must_use]
    pub fn route(mut self, child: Route) -> Self {
        self.routes.push(child);
        self
    }
}

/// Top-level fallback values.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteDefaults {
    /// Receiver for alerts no route claims. Required.
    #[serde(default)]
    pub receiver: String,
    /// Default group-by labels.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_by: Option<Vec<String>>,
    /// Default `group_wait`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_wait: Option<String>,
    /// Default `group_interval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub group_interval: Option<String>,
    /// Default `repeat_interval`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repeat_interval: Option<String>,
}

impl RouteDefaults {
    /// Creates defaults with the given receiver.
    #[must_use]
    pub fn new(receiver: impl Into<String>) -> Self {
        Self {
            receiver: receiver.into(),
            ..Self::default()
        }
    }
}

/// `spec` of a routing tree resource.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoutingTreeSpec {
    /// Fallback values.
    pub defaults: RouteDefaults,
    /// Top-level routes in evaluation order.
    #[serde(default)]
    pub routes: Vec<Route>,
}

/// Control-plane object metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectMeta {
    /// Object name.
    #[serde(default)]
    pub name: String,
    /// Namespace, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    /// Opaque version assigned by the store.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Spec generation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub generation: Option<i64>,
    /// Labels.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    /// Annotations.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

/// Outcome of the last evaluation by one operator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperatorStateKind {
    /// The resource version was applied.
    Success,
    /// The resource version was rejected.
    Error,
    /// Not evaluated yet.
    #[default]
    Unknown,
}

impl OperatorStateKind {
    /// Returns the state as a string.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::Error => "error",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for OperatorStateKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State written by an operator after each reconciliation pass.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatorState {
    /// Resource version last evaluated.
    pub last_evaluation: String,
    /// Outcome of that evaluation.
    pub state: OperatorStateKind,
    /// Free-form description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub descriptive_state: Option<String>,
    /// Operator-specific extra information.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<BTreeMap<String, serde_json::Value>>,
}

impl OperatorState {
    /// A successful evaluation of `resource_version`.
    #[must_use]
    pub fn success(resource_version: impl Into<String>) -> Self {
        Self {
            last_evaluation: resource_version.into(),
            state: OperatorStateKind::Success,
            descriptive_state: None,
            details: None,
        }
    }

    /// A failed evaluation of `resource_version`.
    #[must_use]
    pub fn error(resource_version: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            last_evaluation: resource_version.into(),
            state: OperatorStateKind::Error,
            descriptive_state: Some(description.into()),
            details: None,
        }
    }

    /// Attaches a detail entry.
    #[must_use]
    pub fn with_detail(mut self, key: impl Into<String>, value: serde_json::Value) -> Self {
        self.details
            .get_or_insert_with(BTreeMap::new)
            .insert(key.into(), value);
        self
    }
}

/// `status` of a routing tree resource.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTreeStatus {
    /// Operator id to state.
    #[serde(default)]
    pub operator_states: BTreeMap<String, OperatorState>,
    /// Reserved.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub additional_fields: BTreeMap<String, serde_json::Value>,
}

/// The routing tree resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTree {
    /// API group/version.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Resource kind.
    #[serde(default = "default_kind")]
    pub kind: String,
    /// Object metadata.
    #[serde(default)]
    pub metadata: ObjectMeta,
    /// Routing policy.
    pub spec: RoutingTreeSpec,
    /// Operator status; written by the engine, never read for decisions.
    #[serde(default)]
    pub status: RoutingTreeStatus,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

impl RoutingTree {
    /// Creates a tree resource with the given name and policy.
    #[must_use]
    pub fn new(name: impl Into<String>, defaults: RouteDefaults, routes: Vec<Route>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_kind(),
            metadata: ObjectMeta {
                name: name.into(),
                ..ObjectMeta::default()
            },
            spec: RoutingTreeSpec { defaults, routes },
            status: RoutingTreeStatus::default(),
        }
    }

    /// Sets the resource version.
    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.metadata.resource_version = Some(version.into());
        self
    }

    /// Returns the object name.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.metadata.name
    }

    /// Returns the resource version, or an empty string if unset.
    #[must_use]
    pub fn resource_version(&self) -> &str {
        self.metadata.resource_version.as_deref().unwrap_or("")
    }

    /// Parses a resource from JSON.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Serialization` if the JSON does not describe a tree.
    pub fn from_json(json: &str) -> Result<Self> {
        serde_json::from_str(json).map_err(RoutingError::from)
    }

    /// Serializes the resource to pretty JSON.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Serialization` if serialization fails.
    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(RoutingError::from)
    }
}

/// List metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ListMeta {
    /// Version of the list.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_version: Option<String>,
    /// Continuation token.
    #[serde(rename = "continue", default, skip_serializing_if = "Option::is_none")]
    pub continue_token: Option<String>,
}

/// A list of routing trees, as returned by the store's list call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingTreeList {
    /// API group/version.
    #[serde(default = "default_api_version")]
    pub api_version: String,
    /// Always `RoutingTreeList`.
    #[serde(default = "default_list_kind")]
    pub kind: String,
    /// List metadata.
    #[serde(default)]
    pub metadata: ListMeta,
    /// Items.
    pub items: Vec<RoutingTree>,
}

fn default_list_kind() -> String {
    LIST_KIND.to_string()
}

impl RoutingTreeList {
    /// Wraps trees in a list.
    #[must_use]
    pub fn new(items: Vec<RoutingTree>) -> Self {
        Self {
            api_version: default_api_version(),
            kind: default_list_kind(),
            metadata: ListMeta::default(),
            items,
        }
    }
}

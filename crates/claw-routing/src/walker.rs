//! Route tree walker.
//!
//! Depth-first, pre-order selection of the routes an alert belongs to.
//!
//! At each node the matchers are evaluated as a conjunction. A matching node
//! recurses into its children in order, and a matching child with
//! `continue=false` ends evaluation of its later siblings. A matching node is
//! part of the result when it has `continue=true` (emitted before its
//! descendants) or when none of its descendants matched. Muted nodes still
//! count as matched but are left out of the result.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::trace;

use crate::tree::{CompiledTree, EffectiveConfig, NodeId, RouteKey, RouteNode};
use crate::types::{Alert, LabelSet};

/// A route selected for an alert, with its resolved settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MatchedRoute {
    /// Arena index in the snapshot the route was selected from.
    #[serde(skip)]
    pub node: NodeId,
    /// Stable path key.
    pub route_key: RouteKey,
    /// Resolved settings.
    pub config: Arc<EffectiveConfig>,
    /// Fingerprint of the route's configuration at selection time.
    #[serde(skip)]
    pub fingerprint: u64,
}

impl MatchedRoute {
    fn from_node(node: &RouteNode) -> Self {
        Self {
            node: node.id(),
            route_key: node.key().clone(),
            config: Arc::clone(node.config()),
            fingerprint: node.fingerprint(),
        }
    }

    /// Receiver of the route.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.config.receiver
    }
}

/// Full outcome of a walk, including routes skipped for muting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Evaluation {
    /// Routes the alert should be delivered through, in traversal order.
    pub matched: Vec<MatchedRoute>,
    /// Routes that matched but were muted at evaluation time.
    pub muted: Vec<RouteKey>,
}

/// Selects the routes for an alert.
#[must_use]
pub fn route(alert: &Alert, tree: &CompiledTree, now: DateTime<Utc>) -> Vec<MatchedRoute> {
    evaluate(&alert.labels, tree, now).matched
}

/// Walks the tree for a label set and reports matched and muted routes.
#[must_use]
pub fn evaluate(labels: &LabelSet, tree: &CompiledTree, now: DateTime<Utc>) -> Evaluation {
    let mut walk = Walk {
        tree,
        labels,
        now,
        out: Evaluation::default(),
    };
    walk.visit(NodeId::ROOT);
    trace!(
        tree = tree.name(),
        matched = walk.out.matched.len(),
        muted = walk.out.muted.len(),
        "walked routing tree"
    );
    walk.out
}

struct Walk<'a> {
    tree: &'a CompiledTree,
    labels: &'a LabelSet,
    now: DateTime<Utc>,
    out: Evaluation,
}

impl Walk<'_> {
    /// Returns true if `id` matched, whether or not it was emitted.
    fn visit(&mut self, id: NodeId) -> bool {
        let node = self.tree.node(id);
        if !node.matches(self.labels) {
            return false;
        }

        let mute = &node.config().mute_time_intervals;
        let muted = !mute.is_empty() && self.tree.mute().is_muted(mute, self.now);
        if muted {
            self.out.muted.push(node.key().clone());
        }

        if node.continue_matching() && !muted {
            self.out.matched.push(MatchedRoute::from_node(node));
        }

        let mut descendant_matched = false;
        for &child in node.children() {
            if self.visit(child) {
                descendant_matched = true;
                if !self.tree.node(child).continue_matching() {
                    break;
                }
            }
        }

        if !descendant_matched && !node.continue_matching() && !muted {
            self.out.matched.push(MatchedRoute::from_node(node));
        }
        true
    }
}

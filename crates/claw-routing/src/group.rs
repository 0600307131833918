//! Alert grouping.
//!
//! Alerts selected for the same route are bucketed by a [`GroupKey`]: the
//! alert's values for the route's `group_by` labels. A [`Group`] holds the
//! alerts of one bucket keyed by fingerprint, tracks which state of each alert
//! the receiver has last been told about, and owns the group's
//! [`GroupSchedule`].

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Result, RoutingError};
use crate::scheduler::{Deadline, GroupPhase, GroupSchedule};
use crate::tree::{EffectiveConfig, GroupBy, RouteKey};
use crate::types::{Alert, AlertStatus, Fingerprint, LabelSet};
use crate::walker::MatchedRoute;

/// Values of the group-by labels present on an alert, sorted by label name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct GroupKey(LabelSet);

impl GroupKey {
    /// Computes the key of `labels` under `group_by`.
    #[must_use]
    pub fn compute(group_by: &GroupBy, labels: &LabelSet) -> Self {
        Self(group_by.project(labels))
    }

    /// The grouped labels.
    #[must_use]
    pub const fn labels(&self) -> &LabelSet {
        &self.0
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("{")?;
        for (i, (k, v)) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(",")?;
            }
            write!(f, "{k}={v:?}")?;
        }
        f.write_str("}")
    }
}

/// Identity of a group: the route it belongs to plus its key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct GroupId {
    /// Owning route.
    pub route: RouteKey,
    /// Group key within the route.
    pub key: GroupKey,
}

impl GroupId {
    /// Creates an id.
    #[must_use]
    pub const fn new(route: RouteKey, key: GroupKey) -> Self {
        Self { route, key }
    }

    /// Shard that owns this group out of `shards`.
    #[must_use]
    pub fn shard_index(&self, shards: usize) -> usize {
        let mut hasher = DefaultHasher::new();
        self.hash(&mut hasher);
        (hasher.finish() % shards.max(1) as u64) as usize
    }
}

impl fmt::Display for GroupId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.route, self.key)
    }
}

/// An alert as it appears in a notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotifiedAlert {
    /// Alert payload.
    #[serde(flatten)]
    pub alert: Alert,
    /// Status reported to the receiver.
    pub status: AlertStatus,
}

/// Alerts captured by one flush.
#[derive(Debug, Clone, PartialEq)]
pub struct FlushBatch {
    /// Per-group sequence number of the flush.
    pub seq: u64,
    /// The full alert set at flush time, ordered by fingerprint.
    pub alerts: Vec<NotifiedAlert>,
}

/// What an alert update did to a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AlertChange {
    /// New fingerprint in the group.
    Added,
    /// A resolved alert fired again.
    Refired,
    /// Payload refreshed with no status change.
    Updated,
    /// A notified alert was resolved; the receiver will be told once.
    Resolved,
    /// A resolved alert nobody was told about was removed.
    Dropped,
    /// Nothing known about the alert, or already resolved before arrival.
    Ignored,
}

impl AlertChange {
    /// Whether the change must eventually be sent to the receiver.
    #[must_use]
    pub const fn needs_flush(self) -> bool {
        matches!(self, Self::Added | Self::Refired | Self::Resolved)
    }
}

#[derive(Debug, Clone)]
struct Entry {
    alert: Alert,
    status: AlertStatus,
    sent: Option<AlertStatus>,
}

/// Point-in-time view of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GroupSummary {
    /// Group identity.
    pub id: GroupId,
    /// Receiver of the owning route.
    pub receiver: String,
    /// Lifecycle phase.
    pub phase: GroupPhase,
    /// Alerts held, firing or resolved.
    pub alerts: usize,
    /// Alerts currently firing.
    pub firing: usize,
}

/// A bucket of alerts routed to the same route with the same key.
#[derive(Debug, Clone)]
pub struct Group {
    id: GroupId,
    epoch: u64,
    config: Arc<EffectiveConfig>,
    route_fingerprint: u64,
    alerts: BTreeMap<Fingerprint, Entry>,
    schedule: GroupSchedule,
    next_seq: u64,
}

impl Group {
    /// Creates an empty group for `route` and returns its `group_wait` timer.
    ///
    /// `epoch` distinguishes this group from earlier groups with the same id.
    pub fn new(id: GroupId, epoch: u64, route: &MatchedRoute, now: Instant) -> (Self, Deadline) {
        let (schedule, deadline) = GroupSchedule::start(now, &route.config);
        let group = Self {
            id,
            epoch,
            config: Arc::clone(&route.config),
            route_fingerprint: route.fingerprint,
            alerts: BTreeMap::new(),
            schedule,
            next_seq: 0,
        };
        (group, deadline)
    }

    /// Group identity.
    #[must_use]
    pub const fn id(&self) -> &GroupId {
        &self.id
    }

    /// Incarnation of this id.
    #[must_use]
    pub const fn epoch(&self) -> u64 {
        self.epoch
    }

    /// Settings of the owning route.
    #[must_use]
    pub fn config(&self) -> &Arc<EffectiveConfig> {
        &self.config
    }

    /// Fingerprint of the owning route when the group was created.
    #[must_use]
    pub const fn route_fingerprint(&self) -> u64 {
        self.route_fingerprint
    }

    /// Timing state.
    #[must_use]
    pub const fn schedule(&self) -> &GroupSchedule {
        &self.schedule
    }

    /// Mutable timing state.
    pub fn schedule_mut(&mut self) -> &mut GroupSchedule {
        &mut self.schedule
    }

    /// Number of alerts held.
    #[must_use]
    pub fn len(&self) -> usize {
        self.alerts.len()
    }

    /// True if no alerts are held.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.alerts.is_empty()
    }

    /// Number of firing alerts.
    #[must_use]
    pub fn firing_count(&self) -> usize {
        self.alerts
            .values()
            .filter(|e| e.status == AlertStatus::Firing)
            .count()
    }

    /// True if the group holds `fingerprint`.
    #[must_use]
    pub fn contains(&self, fingerprint: &Fingerprint) -> bool {
        self.alerts.contains_key(fingerprint)
    }

    /// Adds or refreshes an alert.
    ///
    /// Idempotent per fingerprint: re-ingesting a known alert replaces its
    /// payload without producing a change to send.
    pub fn ingest(&mut self, alert: Alert, status: AlertStatus) -> AlertChange {
        let fingerprint = alert.fingerprint();
        let Some(entry) = self.alerts.get_mut(&fingerprint) else {
            if status == AlertStatus::Resolved {
                return AlertChange::Ignored;
            }
            self.alerts.insert(
                fingerprint,
                Entry {
                    alert,
                    status,
                    sent: None,
                },
            );
            return AlertChange::Added;
        };

        let previous = entry.status;
        entry.alert = alert;
        match (previous, status) {
            (AlertStatus::Resolved, AlertStatus::Firing) => {
                entry.status = AlertStatus::Firing;
                AlertChange::Refired
            }
            (AlertStatus::Firing, AlertStatus::Resolved) => self.resolve(&fingerprint),
            _ => AlertChange::Updated,
        }
    }

    /// Marks an alert resolved.
    ///
    /// An alert the receiver never heard about is removed on the spot; one
    /// that was notified stays until its resolution has been delivered.
    pub fn resolve(&mut self, fingerprint: &Fingerprint) -> AlertChange {
        let Some(entry) = self.alerts.get_mut(fingerprint) else {
            return AlertChange::Ignored;
        };
        if entry.sent.is_none() {
            self.alerts.remove(fingerprint);
            return AlertChange::Dropped;
        }
        if entry.status == AlertStatus::Resolved {
            return AlertChange::Updated;
        }
        entry.status = AlertStatus::Resolved;
        AlertChange::Resolved
    }

    /// Resolves every firing alert whose `ends_at` has passed by `now`.
    ///
    /// Returns the number of alerts resolved or dropped.
    pub fn expire(&mut self, now: DateTime<Utc>) -> usize {
        let ended: Vec<Fingerprint> = self
            .alerts
            .iter()
            .filter(|(_, e)| e.status == AlertStatus::Firing && e.alert.status_at(now) == AlertStatus::Resolved)
            .map(|(fp, _)| fp.clone())
            .collect();
        for fingerprint in &ended {
            self.resolve(fingerprint);
        }
        ended.len()
    }

    /// True if some alert's state differs from what the receiver last got.
    #[must_use]
    pub fn has_unsent_changes(&self) -> bool {
        self.alerts.values().any(|e| e.sent != Some(e.status))
    }

    /// Captures the full alert set for a notification and records it as sent.
    ///
    /// Returns `None` when the group holds no alerts.
    pub fn begin_flush(&mut self) -> Option<FlushBatch> {
        if self.alerts.is_empty() {
            return None;
        }
        let alerts = self
            .alerts
            .values_mut()
            .map(|entry| {
                entry.sent = Some(entry.status);
                NotifiedAlert {
                    alert: entry.alert.clone(),
                    status: entry.status,
                }
            })
            .collect();
        let seq = self.next_seq;
        self.next_seq += 1;
        Some(FlushBatch { seq, alerts })
    }

    /// Applies the delivery outcome of a flushed batch.
    ///
    /// On success, resolved alerts whose resolution was delivered are removed.
    /// On failure, every alert still in the state that was sent is marked
    /// unsent so the next flush carries it again. Returns the number of alerts
    /// removed.
    pub fn complete_flush(&mut self, delivered: &[(Fingerprint, AlertStatus)], success: bool) -> usize {
        let mut removed = 0;
        for (fingerprint, status) in delivered {
            let Some(entry) = self.alerts.get_mut(fingerprint) else {
                continue;
            };
            if entry.sent != Some(*status) {
                continue;
            }
            if !success {
                entry.sent = None;
            } else if *status == AlertStatus::Resolved && entry.status == AlertStatus::Resolved {
                self.alerts.remove(fingerprint);
                removed += 1;
            }
        }
        removed
    }

    /// Checks that the alert set and the schedule agree.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Evaluation` naming the group.
    pub fn check_invariants(&self) -> Result<()> {
        let empty_phase = self.schedule.phase() == GroupPhase::Empty;
        if self.alerts.is_empty() != empty_phase {
            return Err(RoutingError::evaluation(format!(
                "group {}: {} alerts in phase {}",
                self.id,
                self.alerts.len(),
                self.schedule.phase()
            )));
        }
        self.schedule
            .check_invariants()
            .map_err(|e| RoutingError::evaluation(format!("group {}: {e}", self.id)))
    }

    /// Point-in-time view.
    #[must_use]
    pub fn summary(&self) -> GroupSummary {
        GroupSummary {
            id: self.id.clone(),
            receiver: self.config.receiver.clone(),
            phase: self.schedule.phase(),
            alerts: self.alerts.len(),
            firing: self.firing_count(),
        }
    }
}

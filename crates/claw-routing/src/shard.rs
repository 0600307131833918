//! Group shards.
//!
//! Every group lives on exactly one shard, picked by hashing its
//! [`GroupId`]. A shard is a single task that owns its groups outright and
//! handles one [`ShardMessage`] at a time, so a group is only ever mutated by
//! its shard. Timers and delivery outcomes come back as messages too.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, trace, warn};

use crate::clock::Clock;
use crate::dispatch::{overall_status, DeliveryReport, Notification};
use crate::group::{Group, GroupId, GroupKey, GroupSummary};
use crate::scheduler::{Deadline, FlushReason, GroupPhase, TimerAction};
use crate::store::TreeSnapshot;
use crate::timer::{TimerHandle, TimerRequest};
use crate::tree::RouteKey;
use crate::types::{Alert, AlertStatus, Fingerprint};
use crate::walker::{self, MatchedRoute};

/// Work for a shard.
#[derive(Debug)]
pub enum ShardMessage {
    /// Add or refresh an alert in one group.
    Ingest {
        /// Snapshot the alert was routed against.
        snapshot: Arc<TreeSnapshot>,
        /// The route selected for the alert.
        route: MatchedRoute,
        /// Target group.
        group: GroupId,
        /// The alert.
        alert: Alert,
        /// Status at routing time.
        status: AlertStatus,
    },
    /// Resolve an alert in every group holding it.
    Resolve {
        /// The alert's fingerprint.
        fingerprint: Fingerprint,
    },
    /// A group timer fired.
    Timer(TimerRequest),
    /// A notification was delivered or given up on.
    Delivered(DeliveryReport),
    /// A new tree is in force.
    Reload(Arc<TreeSnapshot>),
    /// Send every non-empty group now. Replies with the notification count.
    Flush {
        /// Reply channel.
        reply: oneshot::Sender<usize>,
    },
    /// Report the groups held.
    Groups {
        /// Reply channel.
        reply: oneshot::Sender<Vec<GroupSummary>>,
    },
    /// Stop after optionally flushing. Replies with the notification count.
    Shutdown {
        /// Flush every group first.
        flush: bool,
        /// Reply channel.
        reply: oneshot::Sender<usize>,
    },
}

/// Routes an alert and builds one ingest message per selected route,
/// along with the target group and the index of the shard that owns it.
pub(crate) fn route_alert(
    snapshot: &Arc<TreeSnapshot>,
    alert: &Alert,
    now: DateTime<Utc>,
    shards: usize,
) -> Vec<(usize, GroupId, ShardMessage)> {
    let status = alert.status_at(now);
    walker::route(alert, snapshot.tree(), now)
        .into_iter()
        .map(|route| {
            let key = GroupKey::compute(&route.config.group_by, &alert.labels);
            let group = GroupId::new(route.route_key.clone(), key);
            let shard = group.shard_index(shards);
            let message = ShardMessage::Ingest {
                snapshot: Arc::clone(snapshot),
                route,
                group: group.clone(),
                alert: alert.clone(),
                status,
            };
            (shard, group, message)
        })
        .collect()
}

/// Settings shared by all shards.
#[derive(Debug, Clone)]
pub(crate) struct ShardSettings {
    pub(crate) retention: Duration,
    pub(crate) max_groups: usize,
}

/// One shard's state. Owned by its task.
#[derive(Debug)]
pub(crate) struct Shard {
    index: usize,
    groups: HashMap<GroupId, Group>,
    snapshot: Arc<TreeSnapshot>,
    timers: TimerHandle,
    notifications: mpsc::UnboundedSender<Notification>,
    clock: Arc<dyn Clock>,
    settings: ShardSettings,
    next_epoch: u64,
}

fn arm(timers: &TimerHandle, shard: usize, group: &Group, deadline: Deadline) {
    timers.arm(TimerRequest {
        shard,
        group: group.id().clone(),
        epoch: group.epoch(),
        deadline,
    });
}

impl Shard {
    pub(crate) fn new(
        index: usize,
        snapshot: Arc<TreeSnapshot>,
        timers: TimerHandle,
        notifications: mpsc::UnboundedSender<Notification>,
        clock: Arc<dyn Clock>,
        settings: ShardSettings,
    ) -> Self {
        Self {
            index,
            groups: HashMap::new(),
            snapshot,
            timers,
            notifications,
            clock,
            settings,
            next_epoch: 0,
        }
    }

    pub(crate) fn spawn(self, rx: mpsc::Receiver<ShardMessage>) -> JoinHandle<()> {
        tokio::spawn(self.run(rx))
    }

    async fn run(mut self, mut rx: mpsc::Receiver<ShardMessage>) {
        while let Some(message) = rx.recv().await {
            if let ShardMessage::Shutdown { flush, reply } = message {
                let sent = if flush { self.flush_all() } else { 0 };
                let _ = reply.send(sent);
                break;
            }
            self.handle(message);
        }
        debug!(shard = self.index, groups = self.groups.len(), "shard stopped");
    }

    pub(crate) fn handle(&mut self, message: ShardMessage) {
        match message {
            ShardMessage::Ingest {
                snapshot,
                route,
                group,
                alert,
                status,
            } => self.ingest(snapshot, &route, group, alert, status),
            ShardMessage::Resolve { fingerprint } => self.resolve(&fingerprint),
            ShardMessage::Timer(request) => self.on_timer(&request),
            ShardMessage::Delivered(report) => self.on_delivered(&report),
            ShardMessage::Reload(snapshot) => self.apply_snapshot(snapshot),
            ShardMessage::Flush { reply } => {
                let _ = reply.send(self.flush_all());
            }
            ShardMessage::Groups { reply } => {
                let _ = reply.send(self.summaries());
            }
            ShardMessage::Shutdown { reply, .. } => {
                let _ = reply.send(0);
            }
        }
    }

    fn ingest(
        &mut self,
        snapshot: Arc<TreeSnapshot>,
        route: &MatchedRoute,
        id: GroupId,
        alert: Alert,
        status: AlertStatus,
    ) {
        let now = Instant::now();
        if snapshot.generation() > self.snapshot.generation() {
            self.apply_snapshot(snapshot);
        } else if !self.route_is_current(route) {
            debug!(
                shard = self.index,
                route = %route.route_key,
                "route changed since the alert was evaluated, discarding"
            );
            return;
        }

        if !self.groups.contains_key(&id) {
            if status == AlertStatus::Resolved {
                return;
            }
            if !self.make_room() {
                warn!(
                    shard = self.index,
                    group = %id,
                    limit = self.settings.max_groups,
                    "group limit reached, alert not grouped"
                );
                return;
            }
            let epoch = self.next_epoch;
            self.next_epoch += 1;
            let (group, deadline) = Group::new(id.clone(), epoch, route, now);
            arm(&self.timers, self.index, &group, deadline);
            debug!(shard = self.index, group = %id, receiver = route.receiver(), "group created");
            self.groups.insert(id.clone(), group);
        }

        let Some(group) = self.groups.get_mut(&id) else {
            return;
        };
        let config = Arc::clone(group.config());
        let change = group.ingest(alert, status);
        trace!(group = %id, ?change, "alert ingested");
        if change.needs_flush() {
            if let Some(deadline) = group.schedule_mut().on_change(now, &config) {
                arm(&self.timers, self.index, group, deadline);
            }
        }
        self.settle(&id, now);
    }

    fn resolve(&mut self, fingerprint: &Fingerprint) {
        let now = Instant::now();
        let mut ids: Vec<GroupId> = self
            .groups
            .iter()
            .filter(|(_, g)| g.contains(fingerprint))
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();

        for id in ids {
            let Some(group) = self.groups.get_mut(&id) else {
                continue;
            };
            let config = Arc::clone(group.config());
            let change = group.resolve(fingerprint);
            trace!(group = %id, %fingerprint, ?change, "alert resolved");
            if change.needs_flush() {
                if let Some(deadline) = group.schedule_mut().on_change(now, &config) {
                    arm(&self.timers, self.index, group, deadline);
                }
            }
            self.settle(&id, now);
        }
    }

    fn on_timer(&mut self, request: &TimerRequest) {
        let now = Instant::now();
        let Some(group) = self.groups.get_mut(&request.group) else {
            trace!(group = %request.group, "timer for released group");
            return;
        };
        if group.epoch() != request.epoch {
            return;
        }
        let d = request.deadline;
        match group.schedule_mut().on_timer(d.kind, d.generation, d.at) {
            TimerAction::Stale => trace!(group = %request.group, kind = ?d.kind, "stale timer"),
            TimerAction::Release => {
                self.groups.remove(&request.group);
                debug!(shard = self.index, group = %request.group, "empty group released");
            }
            TimerAction::Flush(reason) => {
                self.flush_group(&request.group, reason, now);
                self.settle(&request.group, now);
            }
        }
    }

    /// Returns true if a notification was handed to the dispatcher.
    fn flush_group(&mut self, id: &GroupId, reason: FlushReason, now: Instant) -> bool {
        let Some(group) = self.groups.get_mut(id) else {
            return false;
        };
        let expired = group.expire(self.clock.now());
        if expired > 0 {
            debug!(shard = self.index, group = %id, expired, "ended alerts resolved");
        }
        let config = Arc::clone(group.config());
        let schedule = group.schedule();
        let repeat_owed = schedule.phase() == GroupPhase::Active && schedule.repeat_at().is_none();
        let should_send = match reason {
            FlushReason::GroupWait | FlushReason::GroupInterval => {
                group.has_unsent_changes() || (repeat_owed && !group.is_empty())
            }
            FlushReason::Repeat | FlushReason::Forced => !group.is_empty(),
        };
        if !should_send {
            trace!(group = %id, ?reason, "nothing to send");
            return false;
        }

        let mute = &config.mute_time_intervals;
        if !mute.is_empty() && self.snapshot.tree().mute().is_muted(mute, self.clock.now()) {
            if let Some(deadline) = group.schedule_mut().defer(now, &config) {
                arm(&self.timers, self.index, group, deadline);
            }
            info!(
                shard = self.index,
                group = %id,
                receiver = %config.receiver,
                "route muted, notification deferred"
            );
            return false;
        }

        let Some(batch) = group.begin_flush() else {
            return false;
        };
        let repeat = group.schedule_mut().on_flushed(now, &config);
        arm(&self.timers, self.index, group, repeat);

        let notification = Notification {
            receiver: config.receiver.clone(),
            group: id.clone(),
            group_labels: id.key.labels().clone(),
            status: overall_status(&batch.alerts),
            reason,
            alerts: batch.alerts,
            route: config,
            seq: batch.seq,
            created_at: self.clock.now(),
            shard: self.index,
            epoch: group.epoch(),
        };
        debug!(
            shard = self.index,
            group = %id,
            receiver = %notification.receiver,
            ?reason,
            alerts = notification.alerts.len(),
            "group flushed"
        );
        if let Err(mpsc::error::SendError(notification)) = self.notifications.send(notification) {
            warn!(group = %id, "dispatcher stopped, notification kept for the next flush");
            group.complete_flush(&notification.delivered(), false);
            return false;
        }
        true
    }

    fn on_delivered(&mut self, report: &DeliveryReport) {
        let now = Instant::now();
        let Some(group) = self.groups.get_mut(&report.group) else {
            return;
        };
        if group.epoch() != report.epoch {
            return;
        }
        let removed = group.complete_flush(&report.delivered, report.success);
        if report.success {
            trace!(group = %report.group, seq = report.seq, removed, "delivery confirmed");
        } else {
            let config = Arc::clone(group.config());
            if let Some(deadline) = group.schedule_mut().defer(now, &config) {
                arm(&self.timers, self.index, group, deadline);
            }
            warn!(
                shard = self.index,
                group = %report.group,
                seq = report.seq,
                "delivery failed, alerts kept for the next flush"
            );
        }
        self.settle(&report.group, now);
    }

    /// Moves a drained group to Empty and resets a group that violates its
    /// invariants.
    fn settle(&mut self, id: &GroupId, now: Instant) {
        let Some(group) = self.groups.get_mut(id) else {
            return;
        };
        if group.is_empty() && group.schedule().phase() != GroupPhase::Empty {
            let deadline = group.schedule_mut().on_emptied(now, self.settings.retention);
            arm(&self.timers, self.index, group, deadline);
            debug!(shard = self.index, group = %id, "group emptied");
        }
        if let Err(e) = group.check_invariants() {
            error!(shard = self.index, group = %id, error = %e, "resetting group");
            self.groups.remove(id);
        }
    }

    fn route_is_current(&self, route: &MatchedRoute) -> bool {
        self.snapshot
            .tree()
            .find(&route.route_key)
            .is_some_and(|node| node.fingerprint() == route.fingerprint)
    }

    fn apply_snapshot(&mut self, snapshot: Arc<TreeSnapshot>) {
        if snapshot.generation() <= self.snapshot.generation() {
            return;
        }
        let routes: HashMap<&RouteKey, u64> = snapshot
            .tree()
            .iter()
            .map(|node| (node.key(), node.fingerprint()))
            .collect();
        let before = self.groups.len();
        self.groups
            .retain(|id, group| routes.get(&id.route) == Some(&group.route_fingerprint()));
        let dropped = before - self.groups.len();
        if dropped > 0 {
            info!(
                shard = self.index,
                dropped,
                version = snapshot.resource_version(),
                "dropped groups of changed routes"
            );
        }
        self.snapshot = snapshot;
    }

    /// Releases Empty groups once the limit is reached. Returns false if no
    /// room is left for a new group.
    fn make_room(&mut self) -> bool {
        if self.groups.len() < self.settings.max_groups {
            return true;
        }
        let before = self.groups.len();
        self.groups
            .retain(|_, group| group.schedule().phase() != GroupPhase::Empty);
        let released = before - self.groups.len();
        if released > 0 {
            debug!(shard = self.index, released, "released empty groups early");
        }
        self.groups.len() < self.settings.max_groups
    }

    fn flush_all(&mut self) -> usize {
        let now = Instant::now();
        let mut ids: Vec<GroupId> = self.groups.keys().cloned().collect();
        ids.sort();
        let mut sent = 0;
        for id in &ids {
            if self.flush_group(id, FlushReason::Forced, now) {
                sent += 1;
            }
            self.settle(id, now);
        }
        sent
    }

    fn summaries(&self) -> Vec<GroupSummary> {
        let mut summaries: Vec<GroupSummary> = self.groups.values().map(Group::summary).collect();
        summaries.sort_by(|a, b| a.id.cmp(&b.id));
        summaries
    }
}

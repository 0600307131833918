//! Notification delivery.
//!
//! Shards hand every [`Notification`] to the dispatcher task and move on.
//! The dispatcher delivers each one in its own task through a
//! [`DispatchSink`], retrying transient failures with bounded exponential
//! backoff, and reports the outcome back to the owning shard as a
//! [`DeliveryReport`].

use std::fmt;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tracing::{debug, error, info, warn};

use crate::config::RetryConfig;
use crate::error::{Result, RoutingError};
use crate::group::{GroupId, NotifiedAlert};
use crate::scheduler::FlushReason;
use crate::shard::ShardMessage;
use crate::tree::EffectiveConfig;
use crate::types::{AlertStatus, Fingerprint, LabelSet};

/// A grouped alert set addressed to one receiver.
#[derive(Debug, Clone, Serialize)]
pub struct Notification {
    /// Receiver name.
    pub receiver: String,
    /// Group the alerts belong to.
    pub group: GroupId,
    /// Values of the group-by labels.
    pub group_labels: LabelSet,
    /// Overall status: firing if any alert fires.
    pub status: AlertStatus,
    /// What triggered the flush.
    pub reason: FlushReason,
    /// The full alert set of the group.
    pub alerts: Vec<NotifiedAlert>,
    /// Settings of the route the group belongs to.
    pub route: Arc<EffectiveConfig>,
    /// Per-group sequence number.
    pub seq: u64,
    /// When the flush happened.
    pub created_at: DateTime<Utc>,
    #[serde(skip)]
    pub(crate) shard: usize,
    #[serde(skip)]
    pub(crate) epoch: u64,
}

impl Notification {
    /// Firing alerts only.
    pub fn firing(&self) -> impl Iterator<Item = &NotifiedAlert> {
        self.alerts.iter().filter(|a| a.status == AlertStatus::Firing)
    }

    /// Resolved alerts only.
    pub fn resolved(&self) -> impl Iterator<Item = &NotifiedAlert> {
        self.alerts.iter().filter(|a| a.status == AlertStatus::Resolved)
    }

    pub(crate) fn delivered(&self) -> Vec<(Fingerprint, AlertStatus)> {
        self.alerts
            .iter()
            .map(|a| (a.alert.fingerprint(), a.status))
            .collect()
    }
}

/// Overall status of an alert set.
pub(crate) fn overall_status(alerts: &[NotifiedAlert]) -> AlertStatus {
    if alerts.iter().any(|a| a.status == AlertStatus::Firing) {
        AlertStatus::Firing
    } else {
        AlertStatus::Resolved
    }
}

/// Errors a sink can report.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DispatchError {
    /// The receiver could not be reached; worth retrying.
    #[error("receiver unavailable: {0}")]
    Unavailable(String),
    /// The receiver refused the notification; retrying will not help.
    #[error("notification rejected: {0}")]
    Rejected(String),
}

impl DispatchError {
    /// Whether the dispatcher should retry.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

/// External notification pipeline.
#[async_trait]
pub trait DispatchSink: Send + Sync + fmt::Debug {
    /// Delivers one notification.
    async fn dispatch(&self, notification: &Notification) -> std::result::Result<(), DispatchError>;

    /// Name used in logs.
    fn name(&self) -> &str;
}

/// Logs every notification through `tracing` and accepts it.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogSink;

#[async_trait]
impl DispatchSink for LogSink {
    async fn dispatch(&self, notification: &Notification) -> std::result::Result<(), DispatchError> {
        info!(
            receiver = %notification.receiver,
            group = %notification.group,
            status = %notification.status,
            reason = ?notification.reason,
            alerts = notification.alerts.len(),
            "notification"
        );
        Ok(())
    }

    fn name(&self) -> &str {
        "log"
    }
}

/// Keeps every delivered notification in memory. Can be told to fail.
#[derive(Debug, Default, Clone)]
pub struct RecordingSink {
    delivered: Arc<Mutex<Vec<Notification>>>,
    failures: Arc<AtomicU32>,
    attempts: Arc<AtomicU32>,
}

impl RecordingSink {
    /// Creates an empty sink.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `count` dispatch attempts fail as unavailable.
    pub fn fail_next(&self, count: u32) {
        self.failures.store(count, Ordering::SeqCst);
    }

    /// Delivered notifications in delivery order.
    #[must_use]
    pub fn notifications(&self) -> Vec<Notification> {
        self.delivered.lock().clone()
    }

    /// Receivers of delivered notifications in delivery order.
    #[must_use]
    pub fn receivers(&self) -> Vec<String> {
        self.delivered.lock().iter().map(|n| n.receiver.clone()).collect()
    }

    /// Number of delivered notifications.
    #[must_use]
    pub fn len(&self) -> usize {
        self.delivered.lock().len()
    }

    /// True if nothing was delivered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.delivered.lock().is_empty()
    }

    /// Dispatch attempts so far, failed ones included.
    #[must_use]
    pub fn attempts(&self) -> u32 {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Forgets delivered notifications.
    pub fn clear(&self) {
        self.delivered.lock().clear();
    }
}

#[async_trait]
impl DispatchSink for RecordingSink {
    async fn dispatch(&self, notification: &Notification) -> std::result::Result<(), DispatchError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(DispatchError::Unavailable("simulated outage".to_string()));
        }
        self.delivered.lock().push(notification.clone());
        Ok(())
    }

    fn name(&self) -> &str {
        "recording"
    }
}

/// Outcome of delivering one notification, sent back to its shard.
#[derive(Debug, Clone)]
pub struct DeliveryReport {
    /// Group the notification came from.
    pub group: GroupId,
    /// Incarnation of that group.
    pub epoch: u64,
    /// Sequence number of the flush.
    pub seq: u64,
    /// Alerts and the status each was reported with.
    pub delivered: Vec<(Fingerprint, AlertStatus)>,
    /// Whether the sink accepted the notification.
    pub success: bool,
}

/// Delivers a notification, retrying retryable failures per `retry`.
///
/// Returns the number of attempts made.
///
/// # Errors
///
/// Returns `RoutingError::TransientDispatch` once attempts are exhausted or
/// the sink rejects the notification.
pub async fn deliver_with_retry(
    sink: &dyn DispatchSink,
    notification: &Notification,
    retry: &RetryConfig,
) -> Result<u32> {
    let mut attempt = 0;
    loop {
        attempt += 1;
        match sink.dispatch(notification).await {
            Ok(()) => {
                debug!(
                    sink = sink.name(),
                    receiver = %notification.receiver,
                    group = %notification.group,
                    attempt,
                    "notification delivered"
                );
                return Ok(attempt);
            }
            Err(e) if e.is_retryable() && retry.should_retry(attempt) => {
                let delay = retry.delay_for_attempt(attempt);
                warn!(
                    sink = sink.name(),
                    receiver = %notification.receiver,
                    attempt,
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "dispatch failed, retrying"
                );
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                return Err(RoutingError::TransientDispatch {
                    receiver: notification.receiver.clone(),
                    reason: format!("{e} after {attempt} attempt(s)"),
                });
            }
        }
    }
}

/// Runs the dispatcher until every notification sender is dropped, then
/// waits for in-flight deliveries.
pub(crate) fn spawn(
    rx: mpsc::UnboundedReceiver<Notification>,
    sink: Arc<dyn DispatchSink>,
    retry: RetryConfig,
    shards: Vec<mpsc::Sender<ShardMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(run(rx, sink, retry, shards))
}

async fn run(
    mut rx: mpsc::UnboundedReceiver<Notification>,
    sink: Arc<dyn DispatchSink>,
    retry: RetryConfig,
    shards: Vec<mpsc::Sender<ShardMessage>>,
) {
    let mut in_flight = JoinSet::new();

    loop {
        tokio::select! {
            notification = rx.recv() => match notification {
                Some(notification) => {
                    let Some(shard) = shards.get(notification.shard).cloned() else {
                        error!(shard = notification.shard, "notification from unknown shard");
                        continue;
                    };
                    in_flight.spawn(deliver(notification, Arc::clone(&sink), retry.clone(), shard));
                }
                None => break,
            },
            Some(joined) = in_flight.join_next(), if !in_flight.is_empty() => {
                if let Err(e) = joined {
                    error!(error = %e, "delivery task failed");
                }
            }
        }
    }

    while let Some(joined) = in_flight.join_next().await {
        if let Err(e) = joined {
            error!(error = %e, "delivery task failed");
        }
    }
    debug!("dispatcher stopped");
}

async fn deliver(
    notification: Notification,
    sink: Arc<dyn DispatchSink>,
    retry: RetryConfig,
    shard: mpsc::Sender<ShardMessage>,
) {
    let success = match deliver_with_retry(sink.as_ref(), &notification, &retry).await {
        Ok(_) => true,
        Err(e) => {
            error!(group = %notification.group, error = %e, "notification not delivered");
            false
        }
    };

    let report = DeliveryReport {
        delivered: notification.delivered(),
        group: notification.group,
        epoch: notification.epoch,
        seq: notification.seq,
        success,
    };
    if shard.send(ShardMessage::Delivered(report)).await.is_err() {
        debug!("shard stopped before delivery report");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::group::GroupKey;
    use crate::tree::{GroupBy, RouteKey};
    use crate::types::Alert;
    use std::time::Duration;

    fn notification(alerts: Vec<NotifiedAlert>) -> Notification {
        Notification {
            receiver: "ops".to_string(),
            group: GroupId::new(RouteKey::root(), GroupKey::default()),
            group_labels: LabelSet::new(),
            status: overall_status(&alerts),
            reason: FlushReason::GroupWait,
            alerts,
            route: Arc::new(EffectiveConfig {
                receiver: "ops".to_string(),
                group_by: GroupBy::All,
                group_wait: Duration::from_secs(30),
                group_interval: Duration::from_secs(300),
                repeat_interval: Duration::from_secs(3600),
                mute_time_intervals: Vec::new(),
            }),
            seq: 0,
            created_at: Utc::now(),
            shard: 0,
            epoch: 0,
        }
    }

    fn notified(name: &str, status: AlertStatus) -> NotifiedAlert {
        NotifiedAlert {
            alert: Alert::from_pairs([("alertname", name)]),
            status,
        }
    }

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(1),
            multiplier: 2.0,
            max_attempts,
        }
    }

    #[derive(Debug)]
    struct RejectingSink;

    #[async_trait]
    impl DispatchSink for RejectingSink {
        async fn dispatch(&self, _: &Notification) -> std::result::Result<(), DispatchError> {
            Err(DispatchError::Rejected("bad payload".to_string()))
        }

        fn name(&self) -> &str {
            "rejecting"
        }
    }

    mod notification_tests {
        use super::*;

        #[test]
        fn status_is_firing_if_any_alert_fires() {
            let n = notification(vec![
                notified("a", AlertStatus::Resolved),
                notified("b", AlertStatus::Firing),
            ]);
            assert_eq!(n.status, AlertStatus::Firing);
            assert_eq!(n.firing().count(), 1);
            assert_eq!(n.resolved().count(), 1);

            let all_resolved = notification(vec![notified("a", AlertStatus::Resolved)]);
            assert_eq!(all_resolved.status, AlertStatus::Resolved);
        }

        #[test]
        fn serializes_without_internal_fields() {
            let n = notification(vec![notified("a", AlertStatus::Firing)]);
            let json = serde_json::to_value(&n).unwrap();
            assert_eq!(json["receiver"], "ops");
            assert_eq!(json["alerts"][0]["status"], "firing");
            assert_eq!(json["alerts"][0]["labels"]["alertname"], "a");
            assert!(json.get("shard").is_none());
            assert!(json.get("epoch").is_none());
        }
    }

    mod retry_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn retries_until_success() {
            let sink = RecordingSink::new();
            sink.fail_next(2);
            let n = notification(vec![notified("a", AlertStatus::Firing)]);

            let started = tokio::time::Instant::now();
            let attempts = deliver_with_retry(&sink, &n, &fast_retry(5)).await.unwrap();
            assert_eq!(attempts, 3);
            assert_eq!(sink.len(), 1);
            // 100ms + 200ms of backoff
            assert!(started.elapsed() >= Duration::from_millis(300));
        }

        #[tokio::test(start_paused = true)]
        async fn gives_up_after_max_attempts() {
            let sink = RecordingSink::new();
            sink.fail_next(10);
            let n = notification(vec![notified("a", AlertStatus::Firing)]);

            let err = deliver_with_retry(&sink, &n, &fast_retry(3)).await.unwrap_err();
            assert!(matches!(err, RoutingError::TransientDispatch { ref receiver, .. } if receiver == "ops"));
            assert_eq!(sink.attempts(), 3);
            assert!(sink.is_empty());
        }

        #[tokio::test(start_paused = true)]
        async fn rejection_is_not_retried() {
            let n = notification(vec![notified("a", AlertStatus::Firing)]);
            let err = deliver_with_retry(&RejectingSink, &n, &fast_retry(5)).await.unwrap_err();
            match err {
                RoutingError::TransientDispatch { reason, .. } => assert!(reason.contains("1 attempt")),
                other => panic!("unexpected {other:?}"),
            }
        }
    }

    mod dispatcher_tests {
        use super::*;

        #[tokio::test(start_paused = true)]
        async fn reports_outcome_to_owning_shard() {
            let sink = RecordingSink::new();
            sink.fail_next(5);
            let (shard_tx, mut shard_rx) = mpsc::channel(4);
            let (tx, rx) = mpsc::unbounded_channel();
            let dispatcher = spawn(rx, Arc::new(sink.clone()), fast_retry(2), vec![shard_tx]);

            tx.send(notification(vec![notified("a", AlertStatus::Firing)])).unwrap();
            match shard_rx.recv().await {
                Some(ShardMessage::Delivered(report)) => {
                    assert!(!report.success);
                    assert_eq!(report.delivered.len(), 1);
                    assert_eq!(report.delivered[0].1, AlertStatus::Firing);
                }
                other => panic!("unexpected {other:?}"),
            }

            sink.fail_next(0);
            tx.send(notification(vec![notified("a", AlertStatus::Firing)])).unwrap();
            match shard_rx.recv().await {
                Some(ShardMessage::Delivered(report)) => assert!(report.success),
                other => panic!("unexpected {other:?}"),
            }

            drop(tx);
            dispatcher.await.unwrap();
            assert_eq!(sink.len(), 1);
        }
    }
}

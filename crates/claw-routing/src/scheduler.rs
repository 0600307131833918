//! Notification timing for a single group.
//!
//! [`GroupSchedule`] is a plain state machine: it never sleeps and never
//! touches a timer itself. Every transition returns the [`Deadline`] the
//! caller must arm, and every fired timer is checked against the schedule's
//! generation and the deadline recorded in its slot, so a timer that was
//! superseded or cancelled is ignored when it eventually fires.
//!
//! ```text
//!  Pending --group_wait--> Active --group_interval / repeat--> Active
//!     |                      |
//!     +------ emptied -------+--> Empty --retention--> released
//!                                   |
//!                                   +-- new alert --> Active / Pending
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::error::{Result, RoutingError};
use crate::tree::EffectiveConfig;

/// Lifecycle phase of a group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupPhase {
    /// Waiting out `group_wait` before the first notification.
    Pending,
    /// Notified at least once; repeat and coalescing timers apply.
    Active,
    /// No alerts left; kept around for the retention window.
    Empty,
}

impl fmt::Display for GroupPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Active => "active",
            Self::Empty => "empty",
        };
        f.write_str(s)
    }
}

/// What a timer is for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TimerKind {
    /// First flush of a new group.
    GroupWait,
    /// Coalesced flush of changes in an active group.
    GroupInterval,
    /// Re-send of an unchanged group.
    Repeat,
    /// Release of an empty group.
    Retention,
}

/// Why a notification was sent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlushReason {
    /// `group_wait` elapsed.
    GroupWait,
    /// `group_interval` elapsed with unsent changes.
    GroupInterval,
    /// `repeat_interval` elapsed.
    Repeat,
    /// Requested by the caller.
    Forced,
}

/// A timer the caller must arm.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Deadline {
    /// Slot the timer belongs to.
    pub kind: TimerKind,
    /// When it fires.
    pub at: Instant,
    /// Schedule generation at arming time.
    pub generation: u64,
}

/// Result of delivering a fired timer to the schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerAction {
    /// Superseded or cancelled; nothing to do.
    Stale,
    /// Send the group now.
    Flush(FlushReason),
    /// Drop the group.
    Release,
}

/// Timing state of one group.
#[derive(Debug, Clone)]
pub struct GroupSchedule {
    phase: GroupPhase,
    generation: u64,
    first_alert_at: Instant,
    last_flush_at: Option<Instant>,
    pending: Option<(TimerKind, Instant)>,
    repeat_at: Option<Instant>,
    retain_until: Option<Instant>,
}

impl GroupSchedule {
    /// Starts a schedule for a group whose first alert arrived at `now`.
    pub fn start(now: Instant, timing: &EffectiveConfig) -> (Self, Deadline) {
        let mut schedule = Self {
            phase: GroupPhase::Pending,
            generation: 0,
            first_alert_at: now,
            last_flush_at: None,
            pending: None,
            repeat_at: None,
            retain_until: None,
        };
        let deadline = schedule.arm_pending(TimerKind::GroupWait, now + timing.group_wait);
        (schedule, deadline)
    }

    /// Current phase.
    #[must_use]
    pub const fn phase(&self) -> GroupPhase {
        self.phase
    }

    /// Bumped whenever outstanding timers are invalidated.
    #[must_use]
    pub const fn generation(&self) -> u64 {
        self.generation
    }

    /// When the current batch started.
    #[must_use]
    pub const fn first_alert_at(&self) -> Instant {
        self.first_alert_at
    }

    /// When the group was last flushed.
    #[must_use]
    pub const fn last_flush_at(&self) -> Option<Instant> {
        self.last_flush_at
    }

    /// The armed flush timer, if any.
    #[must_use]
    pub const fn pending_flush(&self) -> Option<(TimerKind, Instant)> {
        self.pending
    }

    /// The armed repeat timer, if any.
    #[must_use]
    pub const fn repeat_at(&self) -> Option<Instant> {
        self.repeat_at
    }

    fn arm_pending(&mut self, kind: TimerKind, at: Instant) -> Deadline {
        self.pending = Some((kind, at));
        Deadline {
            kind,
            at,
            generation: self.generation,
        }
    }

    /// The group's alert set changed in a way that needs a notification.
    ///
    /// Returns the timer to arm, or `None` if a flush is already pending.
    /// During `group_wait` later alerts join the batch without extending the
    /// wait. An active group coalesces changes until `group_interval` after
    /// its last flush. An empty group is revived.
    pub fn on_change(&mut self, now: Instant, timing: &EffectiveConfig) -> Option<Deadline> {
        if self.phase == GroupPhase::Empty {
            return Some(self.revive(now, timing));
        }
        if self.pending.is_some() {
            return None;
        }
        let deadline = match (self.phase, self.last_flush_at) {
            (GroupPhase::Active, Some(last)) => self.arm_pending(
                TimerKind::GroupInterval,
                (last + timing.group_interval).max(now),
            ),
            _ => self.arm_pending(
                TimerKind::GroupWait,
                (self.first_alert_at + timing.group_wait).max(now),
            ),
        };
        Some(deadline)
    }

    fn revive(&mut self, now: Instant, timing: &EffectiveConfig) -> Deadline {
        self.generation += 1;
        self.retain_until = None;
        match self.last_flush_at {
            Some(last) => {
                self.phase = GroupPhase::Active;
                self.arm_pending(TimerKind::GroupInterval, (last + timing.group_interval).max(now))
            }
            None => {
                self.phase = GroupPhase::Pending;
                self.first_alert_at = now;
                self.arm_pending(TimerKind::GroupWait, now + timing.group_wait)
            }
        }
    }

    /// Delivers a fired timer. Consumes the slot when the timer is current.
    pub fn on_timer(&mut self, kind: TimerKind, generation: u64, at: Instant) -> TimerAction {
        if generation != self.generation {
            return TimerAction::Stale;
        }
        match kind {
            TimerKind::GroupWait | TimerKind::GroupInterval => {
                if self.pending != Some((kind, at)) {
                    return TimerAction::Stale;
                }
                self.pending = None;
                if kind == TimerKind::GroupWait {
                    TimerAction::Flush(FlushReason::GroupWait)
                } else {
                    TimerAction::Flush(FlushReason::GroupInterval)
                }
            }
            TimerKind::Repeat => {
                if self.repeat_at != Some(at) {
                    return TimerAction::Stale;
                }
                self.repeat_at = None;
                TimerAction::Flush(FlushReason::Repeat)
            }
            TimerKind::Retention => {
                if self.phase == GroupPhase::Empty && self.retain_until == Some(at) {
                    TimerAction::Release
                } else {
                    TimerAction::Stale
                }
            }
        }
    }

    /// A notification was handed off at `now`. Arms the repeat timer.
    ///
    /// Any pending coalescing timer is cancelled since the notification
    /// carried every change.
    pub fn on_flushed(&mut self, now: Instant, timing: &EffectiveConfig) -> Deadline {
        self.phase = GroupPhase::Active;
        self.last_flush_at = Some(now);
        self.pending = None;
        let at = now + timing.repeat_interval;
        self.repeat_at = Some(at);
        Deadline {
            kind: TimerKind::Repeat,
            at,
            generation: self.generation,
        }
    }

    /// Postpones a flush by one `group_interval` from `now`.
    ///
    /// Used when the route is muted at flush time or a delivery failed.
    /// Returns `None` if a flush is already pending.
    pub fn defer(&mut self, now: Instant, timing: &EffectiveConfig) -> Option<Deadline> {
        if self.pending.is_some() || self.phase == GroupPhase::Empty {
            return None;
        }
        Some(self.arm_pending(TimerKind::GroupInterval, now + timing.group_interval))
    }

    /// The last alert left the group. Cancels every timer and arms retention.
    pub fn on_emptied(&mut self, now: Instant, retention: Duration) -> Deadline {
        self.generation += 1;
        self.phase = GroupPhase::Empty;
        self.pending = None;
        self.repeat_at = None;
        let at = now + retention;
        self.retain_until = Some(at);
        Deadline {
            kind: TimerKind::Retention,
            at,
            generation: self.generation,
        }
    }

    /// Checks internal consistency.
    ///
    /// # Errors
    ///
    /// Returns `RoutingError::Evaluation` describing the first violation.
    pub fn check_invariants(&self) -> Result<()> {
        match self.phase {
            GroupPhase::Pending if self.last_flush_at.is_some() => {
                Err(RoutingError::evaluation("pending group has already been flushed"))
            }
            GroupPhase::Pending if self.repeat_at.is_some() => {
                Err(RoutingError::evaluation("pending group has a repeat timer"))
            }
            GroupPhase::Active if self.last_flush_at.is_none() => {
                Err(RoutingError::evaluation("active group was never flushed"))
            }
            GroupPhase::Empty if self.pending.is_some() || self.repeat_at.is_some() => {
                Err(RoutingError::evaluation("empty group still has flush timers"))
            }
            GroupPhase::Empty if self.retain_until.is_none() => {
                Err(RoutingError::evaluation("empty group has no retention deadline"))
            }
            _ => Ok(()),
        }
    }
}

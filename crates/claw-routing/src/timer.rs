//! Shared timer wheel.
//!
//! One task owns a [`DelayQueue`] holding every group timer of the engine.
//! Shards arm timers through a [`TimerHandle`]; when a timer expires the
//! wheel sends it back to the owning shard as [`ShardMessage::Timer`]. The
//! wheel never looks at group state, so a cancelled timer still fires and is
//! discarded by the shard. A shard whose queue is full gets its timer again
//! after [`RETRY_DELAY`]; the wheel never waits on one shard.

use std::time::Duration;

use futures::StreamExt;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tokio_util::time::DelayQueue;
use tracing::{debug, trace};

use crate::group::GroupId;
use crate::scheduler::Deadline;
use crate::shard::ShardMessage;

/// Delay before a timer refused by a full shard queue is offered again.
pub const RETRY_DELAY: Duration = Duration::from_millis(10);

/// A timer armed for a group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimerRequest {
    /// Owning shard.
    pub shard: usize,
    /// Target group.
    pub group: GroupId,
    /// Incarnation of the group the timer was armed for.
    pub epoch: u64,
    /// Slot, instant and generation.
    pub deadline: Deadline,
}

/// Arms timers on the wheel. Never blocks.
#[derive(Debug, Clone)]
pub struct TimerHandle {
    tx: mpsc::UnboundedSender<TimerRequest>,
}

impl TimerHandle {
    /// Arms a timer. Dropped silently once the wheel has stopped.
    pub fn arm(&self, request: TimerRequest) {
        if self.tx.send(request).is_err() {
            debug!("timer wheel stopped, dropping timer");
        }
    }
}

/// Creates a handle and the receiving end for [`spawn`].
pub(crate) fn channel() -> (TimerHandle, mpsc::UnboundedReceiver<TimerRequest>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (TimerHandle { tx }, rx)
}

/// Runs the wheel until every [`TimerHandle`] is dropped.
pub(crate) fn spawn(
    rx: mpsc::UnboundedReceiver<TimerRequest>,
    shards: Vec<mpsc::Sender<ShardMessage>>,
) -> JoinHandle<()> {
    tokio::spawn(run(rx, shards))
}

async fn run(mut rx: mpsc::UnboundedReceiver<TimerRequest>, shards: Vec<mpsc::Sender<ShardMessage>>) {
    let mut queue: DelayQueue<TimerRequest> = DelayQueue::new();

    loop {
        tokio::select! {
            request = rx.recv() => match request {
                Some(request) => {
                    let at = request.deadline.at;
                    queue.insert_at(request, at);
                }
                None => break,
            },
            Some(expired) = queue.next(), if !queue.is_empty() => {
                let request = expired.into_inner();
                trace!(group = %request.group, kind = ?request.deadline.kind, "timer fired");
                let Some(shard) = shards.get(request.shard) else {
                    continue;
                };
                match shard.try_send(ShardMessage::Timer(request.clone())) {
                    Ok(()) => {}
                    Err(TrySendError::Full(_)) => {
                        trace!(shard = request.shard, group = %request.group, "shard queue full, timer requeued");
                        queue.insert(request, RETRY_DELAY);
                    }
                    Err(TrySendError::Closed(_)) => debug!("shard stopped, dropping fired timer"),
                }
            }
        }
    }

    debug!(pending = queue.len(), "timer wheel stopped");
}

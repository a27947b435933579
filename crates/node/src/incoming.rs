//! Inbound message queue.
//!
//! A bounded single-consumer channel of deadline-tagged messages feeding the
//! pacemaker main loop. The receiving shim stamps each message with a 5 s
//! deadline; expiry and epoch filtering happen on dequeue inside the
//! pacemaker.

use crate::metrics;
use meridian_bft::IncomingMsg;
use meridian_messages::ConsensusMessage;
use meridian_types::Address;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::{info, warn};

/// Deadline applied to inbound messages at enqueue time.
pub const IN_QUEUE_TTL: Duration = Duration::from_secs(5);
/// Default channel capacity.
pub const IN_QUEUE_CAPACITY: usize = 2048;

/// Producer half of the inbound queue. Cloneable; the single consumer is the
/// pacemaker main loop.
#[derive(Clone)]
pub struct IncomingQueue {
    tx: mpsc::Sender<IncomingMsg>,
}

impl IncomingQueue {
    pub fn channel(capacity: usize) -> (Self, mpsc::Receiver<IncomingMsg>) {
        let (tx, rx) = mpsc::channel(capacity);
        (Self { tx }, rx)
    }

    /// Enqueue a freshly received message with a new deadline.
    pub fn add(&self, msg: ConsensusMessage, peer: Address) -> bool {
        let now = Instant::now();
        let mi = IncomingMsg {
            msg,
            peer,
            enqueued_at: now,
            expire_at: now + IN_QUEUE_TTL,
            requeued: false,
        };
        self.push(mi)
    }

    /// Put a message back to wait for its parent. The pacemaker marks it as
    /// requeued so the second pass cannot loop; the original deadline keeps
    /// ticking.
    pub fn requeue(&self, mi: IncomingMsg) -> bool {
        info!(msg = %mi.msg, "requeue msg to wait for parent");
        self.push(mi)
    }

    fn push(&self, mi: IncomingMsg) -> bool {
        match self.tx.try_send(mi) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(mi)) => {
                warn!(msg = %mi.msg, "incoming queue full, dropped");
                metrics::metrics()
                    .msgs_dropped
                    .with_label_values(&["queue_full"])
                    .inc();
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }
}

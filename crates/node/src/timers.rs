//! Timer plumbing for the consensus main loop.
//!
//! The round timer is single-shot: exactly one is live at a time and
//! re-arming aborts the prior task. Beats are delivered through the beat
//! channel after a delay.

use meridian_bft::{BeatInfo, RoundTimeoutInfo};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

/// The single-shot round timer.
pub struct RoundTimer {
    handle: Option<JoinHandle<()>>,
    tx: mpsc::Sender<RoundTimeoutInfo>,
}

impl RoundTimer {
    pub fn new(tx: mpsc::Sender<RoundTimeoutInfo>) -> Self {
        Self { handle: None, tx }
    }

    /// Arm the timer for a round, cancelling any prior one.
    pub fn reset(&mut self, round: u32, counter: u64, interval: Duration) {
        self.cancel();
        let tx = self.tx.clone();
        let handle = tokio::spawn(async move {
            trace!(round, ?interval, "round timer armed");
            tokio::time::sleep(interval).await;
            let _ = tx.send(RoundTimeoutInfo { round, counter }).await;
        });
        self.handle = Some(handle);
        debug!(round, ?interval, counter, "round timer set");
    }

    pub fn cancel(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
            debug!("round timer cancelled");
        }
    }

    pub fn is_armed(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }
}

impl Drop for RoundTimer {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Deliver a beat after `delay`.
pub fn schedule_beat(tx: mpsc::Sender<BeatInfo>, info: BeatInfo, delay: Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let _ = tx.send(info).await;
    });
}

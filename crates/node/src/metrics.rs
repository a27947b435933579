//! Node metrics using the native prometheus client.
//!
//! The core surfaces counters and gauges only; there is no operator-facing
//! error stream.

use meridian_bft::PacemakerStats;
use prometheus::{
    register_counter, register_counter_vec, register_gauge, Counter, CounterVec, Gauge,
};
use std::sync::OnceLock;

static METRICS: OnceLock<Metrics> = OnceLock::new();

/// Role gauge values.
pub const ROLE_OBSERVER: f64 = 0.0;
pub const ROLE_VALIDATOR: f64 = 1.0;
pub const ROLE_LEADER: f64 = 2.0;

pub struct Metrics {
    /// 1 while the pacemaker main loop is running.
    pub running: Gauge,
    /// Observer / validator / leader for the current round.
    pub role: Gauge,
    /// Current consensus round.
    pub round: Gauge,
    /// Current epoch.
    pub epoch: Gauge,
    /// Depth of the outgoing queue.
    pub out_queue_depth: Gauge,
    /// Drafts pruned from the proposal space since start.
    pub pruned_drafts: Gauge,
    /// Exponential-backoff counter of the round timer.
    pub timeout_counter: Gauge,

    pub msgs_sent: Counter,
    pub msgs_received: Counter,
    /// Dropped messages by reason: expired, queue_full, decode, signature,
    /// unknown_sender.
    pub msgs_dropped: CounterVec,
}

impl Metrics {
    fn new() -> Self {
        Self {
            running: register_gauge!("meridian_pacemaker_running", "Pacemaker main loop running")
                .unwrap(),
            role: register_gauge!(
                "meridian_pacemaker_role",
                "Role in the current round (0=observer, 1=validator, 2=leader)"
            )
            .unwrap(),
            round: register_gauge!("meridian_pacemaker_round", "Current consensus round").unwrap(),
            epoch: register_gauge!("meridian_pacemaker_epoch", "Current epoch").unwrap(),
            out_queue_depth: register_gauge!(
                "meridian_out_queue_depth",
                "Outgoing queue depth"
            )
            .unwrap(),
            pruned_drafts: register_gauge!(
                "meridian_pruned_drafts",
                "Drafts pruned from the proposal space"
            )
            .unwrap(),
            timeout_counter: register_gauge!(
                "meridian_timeout_counter",
                "Round timer backoff counter"
            )
            .unwrap(),
            msgs_sent: register_counter!(
                "meridian_messages_sent_total",
                "Consensus messages sent"
            )
            .unwrap(),
            msgs_received: register_counter!(
                "meridian_messages_received_total",
                "Consensus messages received"
            )
            .unwrap(),
            msgs_dropped: register_counter_vec!(
                "meridian_messages_dropped_total",
                "Consensus messages dropped",
                &["reason"]
            )
            .unwrap(),
        }
    }
}

/// Global metrics handle.
pub fn metrics() -> &'static Metrics {
    METRICS.get_or_init(Metrics::new)
}

/// Push the pacemaker's counters into the exported gauges.
pub fn observe_pacemaker(stats: &PacemakerStats) {
    let m = metrics();
    m.round.set(stats.current_round as f64);
    m.epoch.set(stats.epoch as f64);
    m.pruned_drafts.set(stats.pruned_drafts as f64);
    m.timeout_counter.set(stats.timeout_counter as f64);
    m.role.set(if stats.is_round_proposer {
        ROLE_LEADER
    } else if stats.in_committee {
        ROLE_VALIDATOR
    } else {
        ROLE_OBSERVER
    });
}

/// Render the registry in the prometheus text format.
pub fn gather() -> String {
    use prometheus::Encoder;
    let encoder = prometheus::TextEncoder::new();
    let mut buf = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buf).is_err() {
        return String::new();
    }
    String::from_utf8(buf).unwrap_or_default()
}

//! Pacemaker configuration.

use std::time::Duration;

/// Minimum number of M-blocks per epoch before a K-block may be proposed.
pub const MIN_M_BLOCKS_AN_EPOCH: u32 = 4;

/// Tunable parameters for the pacemaker.
#[derive(Clone, Debug)]
pub struct PacemakerConfig {
    /// Base round timeout for regular proposals.
    pub round_timeout: Duration,
    /// Base round timeout when a K-block proposal is in flight. K-blocks
    /// carry reward payloads and take longer to validate.
    pub round_timeout_long: Duration,
    /// Minimum M-blocks before a K-block may end the epoch.
    pub min_m_blocks: u32,
    /// Delay before the initial beat after Regulate.
    pub beat_init_delay: Duration,
    /// Delay before the beat scheduled on a QCHigh advance.
    pub beat_on_higher_qc_delay: Duration,
    /// Delay before the beat scheduled on a TC/QC advance from timeouts.
    pub beat_on_timeout_delay: Duration,
    /// Gas limit stamped into proposed headers.
    pub gas_limit: u64,
}

impl Default for PacemakerConfig {
    fn default() -> Self {
        Self {
            round_timeout: Duration::from_secs(12),
            round_timeout_long: Duration::from_secs(21),
            min_m_blocks: MIN_M_BLOCKS_AN_EPOCH,
            beat_init_delay: Duration::from_micros(500),
            beat_on_higher_qc_delay: Duration::from_millis(1000),
            beat_on_timeout_delay: Duration::from_millis(500),
            gas_limit: 20_000_000,
        }
    }
}

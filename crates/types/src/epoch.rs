//! Epoch lifecycle types.

use serde::{Deserialize, Serialize};

/// Emitted when a K-block commits, ending the epoch.
///
/// The epoch controller reacts by regulating the pacemaker into the next
/// committee.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct EpochEndInfo {
    pub height: u32,
    pub last_k_block_height: u32,
    pub nonce: u64,
    pub epoch: u64,
}

//! Committee membership and leader election.

use crate::bitfield::SignerBitfield;
use crate::crypto::{Address, BlsPublicKey};
use std::fmt;
use std::sync::Arc;

/// Strict two-thirds majority on integers: `count * 3 > n * 2`.
///
/// Never computed in floating point.
pub fn majority_two_third(count: u32, n: u32) -> bool {
    (count as u64) * 3 > (n as u64) * 2
}

/// A committee member.
#[derive(Clone)]
pub struct Validator {
    pub address: Address,
    pub bls_pub_key: BlsPublicKey,
    /// Reachable IP for the pacemaker HTTP endpoint.
    pub network_addr: String,
}

impl fmt::Debug for Validator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Validator({} @ {})", self.address, self.network_addr)
    }
}

/// The fixed membership of one epoch. Rounds rotate through members
/// deterministically.
#[derive(Clone, Debug)]
pub struct Committee {
    pub epoch: u64,
    validators: Vec<Validator>,
}

impl Committee {
    pub fn new(epoch: u64, validators: Vec<Validator>) -> Self {
        Self { epoch, validators }
    }

    pub fn size(&self) -> usize {
        self.validators.len()
    }

    pub fn members(&self) -> &[Validator] {
        &self.validators
    }

    pub fn member_at(&self, index: usize) -> Option<&Validator> {
        self.validators.get(index)
    }

    pub fn index_of(&self, address: &Address) -> Option<u32> {
        self.validators
            .iter()
            .position(|v| v.address == *address)
            .map(|i| i as u32)
    }

    /// Deterministic proposer for a round: round-robin over the committee.
    pub fn proposer_for(&self, round: u32) -> &Validator {
        &self.validators[round as usize % self.validators.len()]
    }

    /// Resolve the public keys of the signers named by a bitfield.
    ///
    /// Returns None if the bitfield length does not match the committee or
    /// any index is out of range.
    pub fn keys_for_bitfield(&self, bitfield: &SignerBitfield) -> Option<Vec<BlsPublicKey>> {
        if bitfield.len() != self.validators.len() {
            return None;
        }
        let mut keys = Vec::with_capacity(bitfield.count_set());
        for idx in bitfield.set_indices() {
            keys.push(self.validators.get(idx)?.bls_pub_key.clone());
        }
        Some(keys)
    }
}

/// Answers committee membership per epoch.
///
/// Production implementations derive the next committee from the committed
/// K-block's committee-info payload; tests and bootstrap use
/// [`StaticCommittee`].
pub trait CommitteeOracle: Send + Sync {
    fn committee_for_epoch(&self, epoch: u64) -> Option<Arc<Committee>>;
}

/// A single committee reused for every epoch.
pub struct StaticCommittee {
    committee: Arc<Committee>,
}

impl StaticCommittee {
    pub fn new(committee: Committee) -> Self {
        Self {
            committee: Arc::new(committee),
        }
    }
}

impl CommitteeOracle for StaticCommittee {
    fn committee_for_epoch(&self, _epoch: u64) -> Option<Arc<Committee>> {
        Some(self.committee.clone())
    }
}

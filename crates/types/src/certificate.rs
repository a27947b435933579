//! Quorum and timeout certificates.

use crate::bitfield::SignerBitfield;
use crate::committee::{majority_two_third, Committee};
use crate::crypto::{verify_aggregate, Address, BlsSignature};
use crate::hash::Hash;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Evidence of proposer or voter misbehavior observed while forming a
/// certificate (two different vote hashes under one sealed key).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Violation {
    pub voter_index: u32,
    pub address: Address,
    pub msg_hash_a: Hash,
    pub msg_hash_b: Hash,
}

/// Aggregated witness of a two-thirds supermajority voting for a specific
/// block at a specific (height, round).
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct QuorumCertificate {
    pub height: u32,
    pub round: u32,
    pub epoch: u64,
    pub voter_bitfield: SignerBitfield,
    pub voter_msg_hash: Hash,
    pub voter_agg_sig: Vec<u8>,
    pub voter_violations: Vec<Violation>,
}

impl QuorumCertificate {
    /// The QC that certifies the genesis block. Carries no signatures.
    pub fn genesis() -> Self {
        Self {
            height: 0,
            round: 0,
            epoch: 0,
            voter_bitfield: SignerBitfield::new(0),
            voter_msg_hash: Hash::ZERO,
            voter_agg_sig: Vec::new(),
            voter_violations: Vec::new(),
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.height == 0 && self.voter_agg_sig.is_empty()
    }

    /// A QC is valid iff the bit-array carries a strict two-thirds majority
    /// of the committee and the aggregated signature verifies against the
    /// aggregate public key of exactly those signers.
    pub fn verify(&self, committee: &Committee) -> bool {
        if self.is_genesis() {
            return true;
        }
        let count = self.voter_bitfield.count_set();
        if !majority_two_third(count as u32, committee.size() as u32) {
            return false;
        }
        let Some(signers) = committee.keys_for_bitfield(&self.voter_bitfield) else {
            return false;
        };
        let Ok(agg) = BlsSignature::from_bytes(&self.voter_agg_sig) else {
            return false;
        };
        verify_aggregate(&signers, &self.voter_msg_hash, &agg)
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("qc serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    pub fn compact_string(&self) -> String {
        format!("QC(H:{},R:{},E:{})", self.height, self.round, self.epoch)
    }
}

impl fmt::Display for QuorumCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.compact_string())
    }
}

/// Aggregated witness of a two-thirds supermajority wishing to advance to a
/// specific round. Same structure as a QC but keyed by (epoch, wish-round)
/// and aggregated over the wish-vote hash.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct TimeoutCertificate {
    pub epoch: u64,
    pub wish_round: u32,
    pub voter_bitfield: SignerBitfield,
    pub voter_msg_hash: Hash,
    pub voter_agg_sig: Vec<u8>,
}

impl TimeoutCertificate {
    pub fn verify(&self, committee: &Committee) -> bool {
        let count = self.voter_bitfield.count_set();
        if !majority_two_third(count as u32, committee.size() as u32) {
            return false;
        }
        let Some(signers) = committee.keys_for_bitfield(&self.voter_bitfield) else {
            return false;
        };
        let Ok(agg) = BlsSignature::from_bytes(&self.voter_agg_sig) else {
            return false;
        };
        verify_aggregate(&signers, &self.voter_msg_hash, &agg)
    }
}

impl fmt::Display for TimeoutCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "TC(E:{},W:{})", self.epoch, self.wish_round)
    }
}

//! Vote accumulation and certificate formation.
//!
//! Both managers are single-writer: only the pacemaker task touches them.
//! A tally seals the moment a certificate forms; votes arriving for a sealed
//! key are ignored, so a certificate is emitted exactly once per key.

use meridian_types::{
    aggregate_signatures, majority_two_third, BlsSignature, Hash, QuorumCertificate,
    SignerBitfield, TimeoutCertificate,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use tracing::{debug, info, warn};

/// One recorded vote: the signed hash and the parsed signature handle used
/// for aggregation.
#[derive(Clone)]
struct RecordedVote {
    hash: Hash,
    parsed: BlsSignature,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct QcVoteKey {
    height: u32,
    round: u32,
    block_id: Hash,
}

/// Accumulates proposal votes per (height, round, block-id) and emits a
/// quorum certificate at strict two-thirds majority.
pub struct QcVoteManager {
    votes: HashMap<QcVoteKey, BTreeMap<u32, RecordedVote>>,
    sealed: HashSet<QcVoteKey>,
    committee_size: u32,
}

impl QcVoteManager {
    pub fn new(committee_size: u32) -> Self {
        Self {
            votes: HashMap::new(),
            sealed: HashSet::new(),
            committee_size,
        }
    }

    /// Record a vote. Returns the freshly formed QC when this vote reaches
    /// the two-thirds threshold; `None` otherwise, including for votes on a
    /// sealed key and duplicate signer indices.
    #[allow(clippy::too_many_arguments)]
    pub fn add_vote(
        &mut self,
        index: u32,
        epoch: u64,
        height: u32,
        round: u32,
        block_id: Hash,
        signature: &[u8],
        hash: Hash,
    ) -> Option<QuorumCertificate> {
        let key = QcVoteKey {
            height,
            round,
            block_id,
        };
        if self.sealed.contains(&key) {
            return None;
        }
        let parsed = match BlsSignature::from_bytes(signature) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(%err, index, height, round, "load vote signature failed");
                return None;
            }
        };

        let tally = self.votes.entry(key).or_default();
        if tally.contains_key(&index) {
            return None;
        }
        tally.insert(index, RecordedVote { hash, parsed });

        let count = tally.len() as u32;
        if majority_two_third(count, self.committee_size) {
            info!(
                height,
                round,
                block_id = %block_id,
                voted = %format!("{}/{}", count, self.committee_size),
                "QC formed, future votes on this key will be ignored"
            );
            self.sealed.insert(key);
            return self.aggregate(height, round, block_id, epoch);
        }
        debug!(count, committee_size = self.committee_size, "vote counted");
        None
    }

    /// Deterministically aggregate the recorded votes under a key.
    ///
    /// All recorded hashes must be identical; a divergence means the proposer
    /// equivocated, in which case no QC is produced.
    pub fn aggregate(
        &mut self,
        height: u32,
        round: u32,
        block_id: Hash,
        epoch: u64,
    ) -> Option<QuorumCertificate> {
        let key = QcVoteKey {
            height,
            round,
            block_id,
        };
        self.sealed.insert(key);
        let tally = self.votes.get(&key)?;

        let mut bitfield = SignerBitfield::new(self.committee_size as usize);
        let mut sigs = Vec::with_capacity(tally.len());
        let mut msg_hash: Option<Hash> = None;
        for (index, vote) in tally {
            match msg_hash {
                None => msg_hash = Some(vote.hash),
                Some(expected) if expected != vote.hash => {
                    warn!(
                        height,
                        round,
                        block_id = %block_id,
                        index,
                        "divergent vote hashes under sealed key, proposer equivocated"
                    );
                    return None;
                }
                Some(_) => {}
            }
            if bitfield.set(*index as usize).is_err() {
                warn!(index, "vote index out of committee range");
                return None;
            }
            sigs.push(vote.parsed.clone());
        }

        let agg = match aggregate_signatures(&sigs) {
            Ok(agg) => agg,
            Err(err) => {
                warn!(%err, height, round, "vote aggregation failed");
                return None;
            }
        };

        Some(QuorumCertificate {
            height,
            round,
            epoch,
            voter_bitfield: bitfield,
            voter_msg_hash: msg_hash?,
            voter_agg_sig: agg.to_bytes(),
            voter_violations: Vec::new(),
        })
    }

    /// Number of distinct signers recorded for a key.
    pub fn count(&self, height: u32, round: u32, block_id: Hash) -> u32 {
        let key = QcVoteKey {
            height,
            round,
            block_id,
        };
        self.votes.get(&key).map(|t| t.len() as u32).unwrap_or(0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
struct TcVoteKey {
    epoch: u64,
    wish_round: u32,
}

/// Accumulates wish-round votes per (epoch, wish-round) and emits a timeout
/// certificate at strict two-thirds majority. Structurally identical to
/// [`QcVoteManager`] with a different key.
pub struct TcVoteManager {
    votes: HashMap<TcVoteKey, BTreeMap<u32, RecordedVote>>,
    sealed: HashSet<TcVoteKey>,
    committee_size: u32,
}

impl TcVoteManager {
    pub fn new(committee_size: u32) -> Self {
        Self {
            votes: HashMap::new(),
            sealed: HashSet::new(),
            committee_size,
        }
    }

    pub fn add_vote(
        &mut self,
        index: u32,
        epoch: u64,
        wish_round: u32,
        signature: &[u8],
        hash: Hash,
    ) -> Option<TimeoutCertificate> {
        let key = TcVoteKey { epoch, wish_round };
        if self.sealed.contains(&key) {
            return None;
        }
        let parsed = match BlsSignature::from_bytes(signature) {
            Ok(sig) => sig,
            Err(err) => {
                warn!(%err, index, wish_round, "load wish vote signature failed");
                return None;
            }
        };

        let tally = self.votes.entry(key).or_default();
        if tally.contains_key(&index) {
            return None;
        }
        tally.insert(index, RecordedVote { hash, parsed });

        let count = tally.len() as u32;
        if majority_two_third(count, self.committee_size) {
            info!(
                epoch,
                wish_round,
                voted = %format!("{}/{}", count, self.committee_size),
                "TC formed"
            );
            self.sealed.insert(key);
            return self.aggregate(epoch, wish_round);
        }
        None
    }

    pub fn aggregate(&mut self, epoch: u64, wish_round: u32) -> Option<TimeoutCertificate> {
        let key = TcVoteKey { epoch, wish_round };
        self.sealed.insert(key);
        let tally = self.votes.get(&key)?;

        let mut bitfield = SignerBitfield::new(self.committee_size as usize);
        let mut sigs = Vec::with_capacity(tally.len());
        let mut msg_hash: Option<Hash> = None;
        for (index, vote) in tally {
            match msg_hash {
                None => msg_hash = Some(vote.hash),
                Some(expected) if expected != vote.hash => {
                    warn!(epoch, wish_round, index, "divergent wish vote hashes");
                    return None;
                }
                Some(_) => {}
            }
            if bitfield.set(*index as usize).is_err() {
                warn!(index, "wish vote index out of committee range");
                return None;
            }
            sigs.push(vote.parsed.clone());
        }

        let agg = match aggregate_signatures(&sigs) {
            Ok(agg) => agg,
            Err(err) => {
                warn!(%err, epoch, wish_round, "wish vote aggregation failed");
                return None;
            }
        };

        Some(TimeoutCertificate {
            epoch,
            wish_round,
            voter_bitfield: bitfield,
            voter_msg_hash: msg_hash?,
            voter_agg_sig: agg.to_bytes(),
        })
    }

    pub fn count(&self, epoch: u64, wish_round: u32) -> u32 {
        let key = TcVoteKey { epoch, wish_round };
        self.votes.get(&key).map(|t| t.len() as u32).unwrap_or(0)
    }
}

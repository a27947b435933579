//! Wire messages for the Meridian pacemaker.
//!
//! Three message kinds flow between committee members: proposals, votes and
//! timeouts (wish-round votes). Inbound messages are modeled as a tagged sum
//! with exhaustive matching in the main loop.
//!
//! Every message carries two signatures:
//!
//! - a sender-level secp256k1 signature over the canonical wire hash, applied
//!   by the [`envelope`] layer, and
//! - a BLS component over the domain-separated vote hash, carried inside the
//!   payload and aggregated by the vote managers.

mod envelope;

pub use envelope::{CodecError, Envelope, ENVELOPE_MAGIC};

use meridian_types::{keccak256, Address, Hash, TimeoutCertificate};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A block proposal for (height, round), carrying the encoded block and an
/// optional timeout certificate that justified entering the round.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct ProposalMessage {
    pub height: u32,
    pub round: u32,
    pub parent_height: u32,
    pub parent_round: u32,
    pub proposer_id: Address,
    pub proposer_bls_pub: Vec<u8>,
    pub last_k_block_height: u32,
    pub epoch: u64,
    pub block_bytes: Vec<u8>,
    pub block_type: u8,
    pub timeout_cert: Option<TimeoutCertificate>,
    pub timestamp: u64,
}

/// A vote for a proposal, unicast to the next round's proposer.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct VoteMessage {
    pub epoch: u64,
    pub vote_height: u32,
    pub vote_round: u32,
    pub vote_block_id: Hash,
    pub signer_index: u32,
    pub vote_signature: Vec<u8>,
    pub vote_hash: Hash,
    pub timestamp: u64,
}

/// A wish-round vote, unicast to the wished round's proposer on timeout.
///
/// Piggy-backs the sender's last proposal vote so a stuck-but-almost-formed
/// QC can still complete, and the sender's QCHigh so the proposer catches up.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub struct TimeoutMessage {
    pub epoch: u64,
    pub wish_round: u32,
    pub signer_index: u32,
    pub wish_vote_sig: Vec<u8>,
    pub wish_vote_hash: Hash,
    pub last_vote_height: u32,
    pub last_vote_round: u32,
    pub last_vote_block_id: Hash,
    pub last_vote_signature: Vec<u8>,
    pub last_vote_hash: Hash,
    /// Encoded [`meridian_types::QuorumCertificate`].
    pub qc_high: Vec<u8>,
    pub timestamp: u64,
}

/// Tagged sum of every inbound consensus message.
#[derive(Clone, PartialEq, Debug, Serialize, Deserialize)]
pub enum ConsensusMessage {
    Proposal(ProposalMessage),
    Vote(VoteMessage),
    Timeout(TimeoutMessage),
}

impl ConsensusMessage {
    /// Wire type tag used in the envelope.
    pub fn type_byte(&self) -> u8 {
        match self {
            ConsensusMessage::Proposal(_) => 1,
            ConsensusMessage::Vote(_) => 2,
            ConsensusMessage::Timeout(_) => 3,
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ConsensusMessage::Proposal(_) => "Proposal",
            ConsensusMessage::Vote(_) => "Vote",
            ConsensusMessage::Timeout(_) => "Timeout",
        }
    }

    pub fn epoch(&self) -> u64 {
        match self {
            ConsensusMessage::Proposal(m) => m.epoch,
            ConsensusMessage::Vote(m) => m.epoch,
            ConsensusMessage::Timeout(m) => m.epoch,
        }
    }

    /// Canonical hash signed by the sender key: keccak over the domain tag
    /// and the fixed-field payload serialization.
    pub fn signing_hash(&self) -> Hash {
        let body = bincode::serialize(self).expect("message serialization is infallible");
        let mut buf = Vec::with_capacity(8 + body.len());
        buf.extend_from_slice(b"Meridian");
        buf.extend_from_slice(&body);
        keccak256(&buf)
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("message serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        bincode::deserialize(bytes).map_err(CodecError::Payload)
    }
}

impl fmt::Display for ConsensusMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConsensusMessage::Proposal(m) => {
                write!(f, "Proposal(H:{},R:{},E:{})", m.height, m.round, m.epoch)
            }
            ConsensusMessage::Vote(m) => write!(
                f,
                "Vote(H:{},R:{},B:{})",
                m.vote_height, m.vote_round, m.vote_block_id
            ),
            ConsensusMessage::Timeout(m) => {
                write!(f, "Timeout(E:{},W:{})", m.epoch, m.wish_round)
            }
        }
    }
}

//! Block and header types.
//!
//! Three block kinds flow through consensus: ordinary in-epoch M-blocks,
//! epoch-ending K-blocks (carrying PoW metadata and the next committee), and
//! the stop-committee trailer issued right after a K-block to finalize the
//! epoch handoff.

use crate::certificate::QuorumCertificate;
use crate::crypto::Address;
use crate::hash::{keccak256, Hash};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Block wire-format version magic.
pub const BLOCK_MAGIC: [u8; 4] = [0x76, 0x01, 0x00, 0x00];

/// Kind of a block within an epoch.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Serialize, Deserialize)]
#[repr(u8)]
pub enum BlockType {
    MBlock = 0,
    KBlock = 1,
    StopCommittee = 2,
}

impl BlockType {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(BlockType::MBlock),
            1 => Some(BlockType::KBlock),
            2 => Some(BlockType::StopCommittee),
            _ => None,
        }
    }
}

impl fmt::Display for BlockType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockType::MBlock => f.write_str("mBlock"),
            BlockType::KBlock => f.write_str("kBlock"),
            BlockType::StopCommittee => f.write_str("sBlock"),
        }
    }
}

/// Proof-of-work metadata carried by K-blocks.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct KBlockData {
    pub nonce: u64,
    pub raw: Vec<u8>,
}

/// Next-epoch committee membership, embedded in K-blocks.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct CommitteeInfo {
    pub address: Address,
    pub bls_pub_key: Vec<u8>,
    pub network_addr: String,
}

/// Block header. Immutable once signed by the proposer.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct BlockHeader {
    pub height: u32,
    pub parent_id: Hash,
    pub timestamp: u64,
    pub block_type: BlockType,
    pub last_k_block_height: u32,
    pub gas_limit: u64,
    pub gas_used: u64,
    pub total_score: u64,
    pub txs_root: Hash,
    pub receipts_root: Hash,
    pub state_root: Hash,
    pub magic: [u8; 4],
    /// Proposer signature over [`BlockHeader::signing_hash`].
    pub proposer_signature: Vec<u8>,
}

impl BlockHeader {
    /// Hash the header with the signature field cleared; this is what the
    /// proposer signs.
    pub fn signing_hash(&self) -> Hash {
        let mut unsigned = self.clone();
        unsigned.proposer_signature = Vec::new();
        let encoded = bincode::serialize(&unsigned).expect("header serialization is infallible");
        keccak256(&encoded)
    }

    /// Block id: hash over the full header including the proposer signature.
    pub fn id(&self) -> Hash {
        let encoded = bincode::serialize(self).expect("header serialization is infallible");
        keccak256(&encoded)
    }
}

/// A full block: header, certifying QC for the parent, and payload.
#[derive(Clone, PartialEq, Eq, Debug, Serialize, Deserialize)]
pub struct Block {
    pub header: BlockHeader,
    /// Certifies this block's parent.
    pub qc: QuorumCertificate,
    /// Opaque transaction payloads; execution is external to the core.
    pub transactions: Vec<Vec<u8>>,
    pub k_block_data: Option<KBlockData>,
    pub committee_info: Vec<CommitteeInfo>,
}

impl Block {
    pub fn id(&self) -> Hash {
        self.header.id()
    }

    pub fn number(&self) -> u32 {
        self.header.height
    }

    pub fn block_type(&self) -> BlockType {
        self.header.block_type
    }

    pub fn is_k_block(&self) -> bool {
        self.header.block_type == BlockType::KBlock
    }

    pub fn parent_id(&self) -> Hash {
        self.header.parent_id
    }

    pub fn last_k_block_height(&self) -> u32 {
        self.header.last_k_block_height
    }

    pub fn encode(&self) -> Vec<u8> {
        bincode::serialize(self).expect("block serialization is infallible")
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(bytes)
    }

    /// Root over the transaction payload hashes.
    pub fn compute_txs_root(transactions: &[Vec<u8>]) -> Hash {
        let mut buf = Vec::with_capacity(transactions.len() * 32);
        for tx in transactions {
            buf.extend_from_slice(keccak256(tx).as_bytes());
        }
        keccak256(&buf)
    }

    /// Short human-readable form for logs.
    pub fn compact_string(&self) -> String {
        format!(
            "({}:{} {})",
            self.header.height,
            self.header.block_type,
            self.id()
        )
    }
}

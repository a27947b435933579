//! Domain-separated construction of every hash that gets BLS-signed.
//!
//! Both the signer and every verifier must rebuild these hashes bit-for-bit,
//! so all field layouts here are fixed-width little-endian.

use crate::hash::{keccak256, Hash};

pub const DOMAIN_BLOCK_VOTE: &[u8] = b"BlockVote";
pub const DOMAIN_WISH_VOTE: &[u8] = b"WishRound";

/// The hash a committee member BLS-signs when voting for a proposal.
///
/// Binds the block type, height, id, transactions root and state root, so a
/// vote cannot be replayed for a different block or a tampered payload.
pub fn proposal_vote_hash(
    block_type: u8,
    height: u32,
    block_id: &Hash,
    txs_root: &Hash,
    state_root: &Hash,
) -> Hash {
    let mut msg = Vec::with_capacity(DOMAIN_BLOCK_VOTE.len() + 1 + 4 + 32 * 3);
    msg.extend_from_slice(DOMAIN_BLOCK_VOTE);
    msg.push(block_type);
    msg.extend_from_slice(&height.to_le_bytes());
    msg.extend_from_slice(block_id.as_bytes());
    msg.extend_from_slice(txs_root.as_bytes());
    msg.extend_from_slice(state_root.as_bytes());
    keccak256(&msg)
}

/// The hash a committee member BLS-signs when wishing to enter a round.
pub fn wish_vote_hash(epoch: u64, wish_round: u32) -> Hash {
    let mut msg = Vec::with_capacity(DOMAIN_WISH_VOTE.len() + 8 + 4);
    msg.extend_from_slice(DOMAIN_WISH_VOTE);
    msg.extend_from_slice(&epoch.to_le_bytes());
    msg.extend_from_slice(&wish_round.to_le_bytes());
    keccak256(&msg)
}

//! Proposal validation: header and body checks performed before execution.

use crate::error::BftError;
use meridian_types::{Block, BlockHeader, BlockType, BLOCK_MAGIC};

/// Clock skew tolerated on proposal timestamps, in seconds.
const MAX_TIMESTAMP_AHEAD: u64 = 10;

/// Validate a proposed block's header against its parent.
///
/// The `last_k_block_height` expectation derives from the parent header, not
/// from the committed chain: blocks built on an uncommitted K-block are
/// legitimate pipeline members.
pub fn validate_block_header(header: &BlockHeader, parent: &BlockHeader, now: u64) -> Result<(), BftError> {
    if header.timestamp <= parent.timestamp {
        return Err(BftError::Consensus(format!(
            "block timestamp behind parent: parent {}, current {}",
            parent.timestamp, header.timestamp
        )));
    }
    if header.timestamp > now + MAX_TIMESTAMP_AHEAD {
        return Err(BftError::Consensus(format!(
            "block timestamp too far in the future: now {}, current {}",
            now, header.timestamp
        )));
    }
    if header.gas_used > header.gas_limit {
        return Err(BftError::Consensus(format!(
            "block gas used exceeds limit: limit {}, used {}",
            header.gas_limit, header.gas_used
        )));
    }
    if header.total_score <= parent.total_score {
        return Err(BftError::Consensus(format!(
            "block total score invalid: parent {}, current {}",
            parent.total_score, header.total_score
        )));
    }

    if header.block_type == BlockType::KBlock {
        // A K-block is its own epoch boundary.
        if header.last_k_block_height != header.height {
            return Err(BftError::Consensus(format!(
                "kBlock lastKBlockHeight invalid: height {}, claimed {}",
                header.height, header.last_k_block_height
            )));
        }
    } else {
        let expected = if parent.block_type == BlockType::KBlock {
            parent.height
        } else {
            parent.last_k_block_height
        };
        if header.last_k_block_height != expected {
            return Err(BftError::Consensus(format!(
                "block lastKBlockHeight invalid: expected {}, current {}",
                expected, header.last_k_block_height
            )));
        }
    }

    Ok(())
}

/// Validate a proposed block's body.
pub fn validate_block_body(block: &Block) -> Result<(), BftError> {
    if block.header.magic != BLOCK_MAGIC {
        return Err(BftError::Consensus(format!(
            "block magic mismatch, has {:?}, expect {:?}",
            block.header.magic, BLOCK_MAGIC
        )));
    }
    let txs_root = Block::compute_txs_root(&block.transactions);
    if block.header.txs_root != txs_root {
        return Err(BftError::Consensus(format!(
            "block txs root mismatch: want {:?}, have {:?}",
            block.header.txs_root, txs_root
        )));
    }
    if block.is_k_block() && block.k_block_data.is_none() {
        return Err(BftError::Consensus("kBlock without pow data".to_string()));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{Hash, QuorumCertificate};

    fn header(height: u32, timestamp: u64, total_score: u64) -> BlockHeader {
        BlockHeader {
            height,
            parent_id: Hash::ZERO,
            timestamp,
            block_type: BlockType::MBlock,
            last_k_block_height: 0,
            gas_limit: 1000,
            gas_used: 0,
            total_score,
            txs_root: Hash::ZERO,
            receipts_root: Hash::ZERO,
            state_root: Hash::ZERO,
            magic: BLOCK_MAGIC,
            proposer_signature: Vec::new(),
        }
    }

    #[test]
    fn timestamp_must_advance() {
        let parent = header(1, 100, 1);
        let child = header(2, 100, 2);
        assert!(matches!(
            validate_block_header(&child, &parent, 200),
            Err(BftError::Consensus(_))
        ));
        let child = header(2, 101, 2);
        assert!(validate_block_header(&child, &parent, 200).is_ok());
    }

    #[test]
    fn future_timestamp_is_rejected() {
        let parent = header(1, 100, 1);
        let child = header(2, 250, 2);
        assert!(validate_block_header(&child, &parent, 200).is_err());
    }

    #[test]
    fn total_score_must_advance() {
        let parent = header(1, 100, 5);
        let child = header(2, 101, 5);
        assert!(validate_block_header(&child, &parent, 200).is_err());
    }

    #[test]
    fn gas_used_bounded_by_limit() {
        let parent = header(1, 100, 1);
        let mut child = header(2, 101, 2);
        child.gas_used = 2000;
        assert!(validate_block_header(&child, &parent, 200).is_err());
    }

    #[test]
    fn last_k_height_follows_parent() {
        // Child of an uncommitted K-block must point at it.
        let mut k_parent = header(5, 100, 5);
        k_parent.block_type = BlockType::KBlock;
        k_parent.last_k_block_height = 5;

        let mut child = header(6, 101, 6);
        child.last_k_block_height = 5;
        assert!(validate_block_header(&child, &k_parent, 200).is_ok());

        child.last_k_block_height = 0;
        assert!(validate_block_header(&child, &k_parent, 200).is_err());
    }

    #[test]
    fn k_block_points_at_itself() {
        let parent = header(4, 100, 4);
        let mut k = header(5, 101, 5);
        k.block_type = BlockType::KBlock;
        k.last_k_block_height = 5;
        assert!(validate_block_header(&k, &parent, 200).is_ok());

        k.last_k_block_height = 4;
        assert!(validate_block_header(&k, &parent, 200).is_err());
    }

    #[test]
    fn body_checks_magic_and_txs_root() {
        let mut block = Block {
            header: header(2, 101, 2),
            qc: QuorumCertificate::genesis(),
            transactions: vec![vec![1, 2, 3]],
            k_block_data: None,
            committee_info: vec![],
        };
        // Wrong txs root.
        assert!(validate_block_body(&block).is_err());
        block.header.txs_root = Block::compute_txs_root(&block.transactions);
        assert!(validate_block_body(&block).is_ok());

        block.header.magic = [0; 4];
        assert!(validate_block_body(&block).is_err());
    }
}

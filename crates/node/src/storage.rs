//! In-memory chain storage.
//!
//! Persistent backends live outside the core behind the
//! [`meridian_bft::ChainStore`] trait; this implementation backs tests and
//! stand-alone nodes.

use meridian_bft::{ChainStore, StoreError};
use meridian_types::{Block, Hash, QuorumCertificate};
use std::collections::HashMap;
use std::sync::Mutex;

struct Inner {
    blocks_by_id: HashMap<Hash, Block>,
    blocks_by_number: HashMap<u32, Hash>,
    best: Hash,
    best_qc: QuorumCertificate,
}

/// A [`ChainStore`] keeping the whole chain in memory.
pub struct MemoryChainStore {
    inner: Mutex<Inner>,
}

impl MemoryChainStore {
    /// Create a store holding only the genesis block, certified by the
    /// genesis QC.
    pub fn new(genesis: Block) -> Self {
        let id = genesis.id();
        let mut blocks_by_id = HashMap::new();
        blocks_by_id.insert(id, genesis);
        let mut blocks_by_number = HashMap::new();
        blocks_by_number.insert(0u32, id);
        Self {
            inner: Mutex::new(Inner {
                blocks_by_id,
                blocks_by_number,
                best: id,
                best_qc: QuorumCertificate::genesis(),
            }),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().expect("store lock").blocks_by_id.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl ChainStore for MemoryChainStore {
    fn best_block(&self) -> Block {
        let inner = self.inner.lock().expect("store lock");
        inner.blocks_by_id[&inner.best].clone()
    }

    fn best_qc(&self) -> QuorumCertificate {
        self.inner.lock().expect("store lock").best_qc.clone()
    }

    fn block_by_id(&self, id: &Hash) -> Option<Block> {
        self.inner
            .lock()
            .expect("store lock")
            .blocks_by_id
            .get(id)
            .cloned()
    }

    fn block_by_number(&self, number: u32) -> Option<Block> {
        let inner = self.inner.lock().expect("store lock");
        inner
            .blocks_by_number
            .get(&number)
            .and_then(|id| inner.blocks_by_id.get(id))
            .cloned()
    }

    fn append(&self, block: &Block, escort_qc: &QuorumCertificate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().expect("store lock");
        let id = block.id();
        if inner.blocks_by_id.contains_key(&id) {
            return Err(StoreError::KnownBlock);
        }
        if !inner.blocks_by_id.contains_key(&block.parent_id()) {
            return Err(StoreError::MissingParent);
        }
        inner.blocks_by_id.insert(id, block.clone());
        inner.blocks_by_number.insert(block.number(), id);
        let best_number = inner.blocks_by_id[&inner.best].number();
        if block.number() > best_number {
            inner.best = id;
            inner.best_qc = escort_qc.clone();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{BlockHeader, BlockType, BLOCK_MAGIC};

    fn make_block(height: u32, parent_id: Hash) -> Block {
        Block {
            header: BlockHeader {
                height,
                parent_id,
                timestamp: height as u64,
                block_type: BlockType::MBlock,
                last_k_block_height: 0,
                gas_limit: 1000,
                gas_used: 0,
                total_score: height as u64,
                txs_root: Block::compute_txs_root(&[]),
                receipts_root: Hash::ZERO,
                state_root: Hash::ZERO,
                magic: BLOCK_MAGIC,
                proposer_signature: Vec::new(),
            },
            qc: QuorumCertificate::genesis(),
            transactions: vec![],
            k_block_data: None,
            committee_info: vec![],
        }
    }

    #[test]
    fn append_advances_best() {
        let genesis = make_block(0, Hash::ZERO);
        let store = MemoryChainStore::new(genesis.clone());

        let b1 = make_block(1, genesis.id());
        let mut qc1 = QuorumCertificate::genesis();
        qc1.height = 1;
        qc1.voter_agg_sig = vec![1];
        store.append(&b1, &qc1).unwrap();

        assert_eq!(store.best_block().id(), b1.id());
        assert_eq!(store.best_qc().height, 1);
        assert_eq!(store.block_by_number(1).unwrap().id(), b1.id());
    }

    #[test]
    fn append_rejects_known_and_orphaned_blocks() {
        let genesis = make_block(0, Hash::ZERO);
        let store = MemoryChainStore::new(genesis.clone());

        assert!(matches!(
            store.append(&genesis, &QuorumCertificate::genesis()),
            Err(StoreError::KnownBlock)
        ));

        let orphan = make_block(5, Hash::new([7; 32]));
        assert!(matches!(
            store.append(&orphan, &QuorumCertificate::genesis()),
            Err(StoreError::MissingParent)
        ));
    }
}

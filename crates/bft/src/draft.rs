//! The proposal DAG of uncommitted blocks.
//!
//! Drafts are stored in a map keyed by block id, with parent links held as
//! ids and resolved through the map at use sites. The DAG is rooted at the
//! committed chain tip, which is kept in the space as a committed wrapper so
//! escort-QC lookups can always terminate.

use crate::error::BftError;
use crate::traits::ExecutedState;
use meridian_types::{proposal_vote_hash, Block, BlockType, Hash, QuorumCertificate};
use std::collections::HashMap;
use tracing::debug;

/// A quorum certificate paired with the draft it certifies.
///
/// `qc.height`/`qc.round` always equal the certified draft's height/round.
#[derive(Clone, Debug)]
pub struct DraftQc {
    pub qc: QuorumCertificate,
    /// Id of the certified draft, resolved through [`DraftSpace`].
    pub qc_node: Option<Hash>,
}

impl DraftQc {
    pub fn new(qc: QuorumCertificate, qc_node: Option<Hash>) -> Self {
        Self { qc, qc_node }
    }

    pub fn compact_string(&self) -> String {
        match self.qc_node {
            Some(node) => format!("DraftQC{{{}, node:{}}}", self.qc.compact_string(), node),
            None => format!("DraftQC{{{}, node:nil}}", self.qc.compact_string()),
        }
    }
}

/// An entry in the proposal DAG.
#[derive(Clone, Debug)]
pub struct DraftBlock {
    pub height: u32,
    pub round: u32,
    pub parent_id: Hash,
    pub justify: DraftQc,
    pub block: Block,
    pub raw_block: Vec<u8>,
    pub block_type: BlockType,

    /// Set for the committed-tip wrapper seeded at Regulate.
    pub committed: bool,

    /// Execution outcome. Mutated exactly once, when validation completes.
    pub executed: Option<ExecutedState>,
    pub success_processed: bool,
    pub process_error: Option<BftError>,
}

impl DraftBlock {
    pub fn id(&self) -> Hash {
        self.block.id()
    }

    /// The hash committee members BLS-sign when voting for this draft.
    pub fn vote_hash(&self) -> Hash {
        proposal_vote_hash(
            self.block_type as u8,
            self.height,
            &self.id(),
            &self.block.header.txs_root,
            &self.block.header.state_root,
        )
    }

    pub fn compact_string(&self) -> String {
        format!(
            "Draft{{(H:{},R:{}), QC:(H:{},R:{}), parent:{}}}",
            self.height,
            self.round,
            self.justify.qc.height,
            self.justify.qc.round,
            self.parent_id
        )
    }
}

/// Does this draft's content match the given QC's voter-message-hash?
///
/// The genesis QC matches the genesis draft without a hash check.
pub(crate) fn draft_matches_qc(draft: &DraftBlock, qc: &QuorumCertificate) -> bool {
    if draft.height == 0 && qc.height == 0 {
        return true;
    }
    draft.height == qc.height && draft.round == qc.round && draft.vote_hash() == qc.voter_msg_hash
}

/// In-memory lookup of uncommitted proposals.
#[derive(Default)]
pub struct DraftSpace {
    drafts: HashMap<Hash, DraftBlock>,
    pruned_total: u64,
}

impl DraftSpace {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.drafts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.drafts.is_empty()
    }

    /// Total drafts removed by pruning since construction.
    pub fn pruned_total(&self) -> u64 {
        self.pruned_total
    }

    /// Insert a draft. Idempotent on id.
    pub fn add(&mut self, draft: DraftBlock) {
        self.drafts.entry(draft.id()).or_insert(draft);
    }

    pub fn get_by_id(&self, id: &Hash) -> Option<&DraftBlock> {
        self.drafts.get(id)
    }

    pub fn get_mut(&mut self, id: &Hash) -> Option<&mut DraftBlock> {
        self.drafts.get_mut(id)
    }

    pub fn get_one(&self, height: u32, round: u32, id: &Hash) -> Option<&DraftBlock> {
        self.drafts
            .get(id)
            .filter(|d| d.height == height && d.round == round)
    }

    /// The draft whose content the given QC certifies.
    pub fn get_one_by_escort_qc(&self, qc: &QuorumCertificate) -> Option<&DraftBlock> {
        self.drafts.values().find(|d| draft_matches_qc(d, qc))
    }

    /// Remove drafts at or below the committed height, except the committed
    /// tip itself. Returns the number pruned.
    pub fn prune_below(&mut self, committed: &Hash, height: u32) -> usize {
        let before = self.drafts.len();
        self.drafts
            .retain(|id, d| id == committed || d.height > height);
        let pruned = before - self.drafts.len();
        if pruned > 0 {
            self.pruned_total += pruned as u64;
            debug!(pruned, height, "pruned drafts below committed height");
        }
        pruned
    }

    /// Drop everything. Used when Regulate reseeds the space for a new epoch.
    pub fn clear(&mut self) {
        self.drafts.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meridian_types::{BlockHeader, BLOCK_MAGIC};

    fn make_draft(height: u32, round: u32, parent_id: Hash, seed: u8) -> DraftBlock {
        let header = BlockHeader {
            height,
            parent_id,
            timestamp: 100 + height as u64,
            block_type: BlockType::MBlock,
            last_k_block_height: 0,
            gas_limit: 1000,
            gas_used: 0,
            total_score: height as u64,
            txs_root: Hash::ZERO,
            receipts_root: Hash::ZERO,
            state_root: Hash::new([seed; 32]),
            magic: BLOCK_MAGIC,
            proposer_signature: Vec::new(),
        };
        let block = Block {
            header,
            qc: QuorumCertificate::genesis(),
            transactions: vec![],
            k_block_data: None,
            committee_info: vec![],
        };
        let raw = block.encode();
        DraftBlock {
            height,
            round,
            parent_id,
            justify: DraftQc::new(QuorumCertificate::genesis(), None),
            block_type: block.block_type(),
            raw_block: raw,
            block,
            committed: false,
            executed: None,
            success_processed: false,
            process_error: None,
        }
    }

    #[test]
    fn add_is_idempotent() {
        let mut space = DraftSpace::new();
        let draft = make_draft(1, 0, Hash::ZERO, 1);
        let id = draft.id();
        space.add(draft.clone());
        space.add(draft);
        assert_eq!(space.len(), 1);
        assert!(space.get_by_id(&id).is_some());
    }

    #[test]
    fn get_one_checks_height_and_round() {
        let mut space = DraftSpace::new();
        let draft = make_draft(3, 1, Hash::ZERO, 2);
        let id = draft.id();
        space.add(draft);
        assert!(space.get_one(3, 1, &id).is_some());
        assert!(space.get_one(3, 2, &id).is_none());
        assert!(space.get_one(4, 1, &id).is_none());
    }

    #[test]
    fn escort_qc_lookup_matches_vote_hash() {
        let mut space = DraftSpace::new();
        let draft = make_draft(2, 1, Hash::ZERO, 3);
        let hash = draft.vote_hash();
        space.add(draft.clone());

        let qc = QuorumCertificate {
            height: 2,
            round: 1,
            epoch: 0,
            voter_bitfield: meridian_types::SignerBitfield::new(4),
            voter_msg_hash: hash,
            voter_agg_sig: vec![1],
            voter_violations: vec![],
        };
        let found = space.get_one_by_escort_qc(&qc).expect("escort lookup");
        assert_eq!(found.id(), draft.id());

        // A QC over different content finds nothing.
        let mut other = qc.clone();
        other.voter_msg_hash = Hash::new([9; 32]);
        assert!(space.get_one_by_escort_qc(&other).is_none());
    }

    #[test]
    fn prune_keeps_committed_tip() {
        let mut space = DraftSpace::new();
        let tip = make_draft(5, 0, Hash::ZERO, 4);
        let tip_id = tip.id();
        let low = make_draft(4, 0, Hash::ZERO, 5);
        let high = make_draft(6, 0, tip_id, 6);
        let high_id = high.id();
        space.add(tip);
        space.add(low);
        space.add(high);

        let pruned = space.prune_below(&tip_id, 5);
        assert_eq!(pruned, 1);
        assert!(space.get_by_id(&tip_id).is_some());
        assert!(space.get_by_id(&high_id).is_some());
        assert_eq!(space.pruned_total(), 1);
    }
}

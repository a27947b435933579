//! External collaborator interfaces.
//!
//! The core never executes transactions, stores blocks or mines PoW itself;
//! it reaches those subsystems through the traits below.

use meridian_types::{Block, BlockHeader, Hash, QuorumCertificate};
use thiserror::Error;

/// A staged execution result: the state produced by running a block on top
/// of its parent, not yet written back.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExecutedState {
    pub state_root: Hash,
    pub receipts_root: Hash,
    /// Checkpoint id used to revert the state engine if the commit fails.
    pub checkpoint: u64,
}

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("parent state unavailable for root {0}")]
    ParentStateUnavailable(Hash),
    #[error("block validation failed: {0}")]
    Invalid(String),
}

/// Executes a block against its parent state and returns the staged result.
///
/// Execution is synchronous from the pacemaker's perspective.
pub trait BlockExecutor: Send + Sync {
    fn execute(
        &self,
        parent: &BlockHeader,
        block: &Block,
        now: u64,
    ) -> Result<ExecutedState, ExecutionError>;

    /// Revert the state engine to a previously returned checkpoint.
    fn revert_to(&self, checkpoint: u64);
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("block already in chain store")]
    KnownBlock,
    #[error("parent not in chain store")]
    MissingParent,
    #[error("store corrupt: {0}")]
    Corrupt(String),
}

/// Chain storage: best-block/best-QC queries and atomic append-with-QC.
pub trait ChainStore: Send + Sync {
    fn best_block(&self) -> Block;
    fn best_qc(&self) -> QuorumCertificate;
    fn block_by_id(&self, id: &Hash) -> Option<Block>;
    fn block_by_number(&self, number: u32) -> Option<Block>;
    /// Atomically append a block together with the QC that certifies it.
    fn append(&self, block: &Block, escort_qc: &QuorumCertificate) -> Result<(), StoreError>;
}

/// Result of a proof-of-work round, attached to K-blocks.
#[derive(Clone, Debug, Default)]
pub struct PowResult {
    pub nonce: u64,
    pub raw: Vec<u8>,
    /// Opaque reward payloads built by the external reward builder.
    pub rewards: Vec<Vec<u8>>,
}

/// Decision feed from the proof-of-work pool.
#[derive(Clone, Debug, Default)]
pub struct PowDecision {
    pub propose_k_block: bool,
    pub result: Option<PowResult>,
}

pub trait PowOracle: Send + Sync {
    fn decision(&self) -> PowDecision;
}

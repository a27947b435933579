//! Error kinds surfaced by the consensus core.
//!
//! All of these are absorbed at the pacemaker main loop; none propagates to
//! the transport.

use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum BftError {
    /// CreateLeaf was called with a null parent; the propose attempt is
    /// abandoned.
    #[error("parent block empty")]
    ParentBlockEmpty,

    /// Proposed round is not strictly above the parent and justify rounds.
    #[error("invalid round to propose")]
    InvalidRound,

    /// Commit attempted for a block already in the chain store.
    #[error("known block")]
    KnownBlock,

    /// The parent block cannot be found during validation.
    #[error("parent missing")]
    ParentMissing,

    /// The parent header cannot be found during validation.
    #[error("parent header missing")]
    ParentHeaderMissing,

    /// Header, body, receipt or state-root check failed. The proposal is not
    /// voted on and there is no retry.
    #[error("consensus error: {0}")]
    Consensus(String),

    /// Malformed wire content; peer-level violation.
    #[error("decode error: {0}")]
    Decode(String),

    /// Bad sender or BLS signature; payload dropped.
    #[error("signature error: {0}")]
    Signature(String),

    /// Chain storage failure during commit.
    #[error("store error: {0}")]
    Store(String),

    /// No committee is known for the current epoch.
    #[error("no committee for epoch {0}")]
    NoCommittee(u64),
}

//! Core types for Meridian consensus.
//!
//! This crate provides the foundational types used throughout the consensus
//! implementation:
//!
//! - **Primitives**: Hash, cryptographic keys and signatures
//! - **Consensus types**: Block, QuorumCertificate, TimeoutCertificate
//! - **Committee**: validator set, proposer rotation, quorum arithmetic
//! - **Signing**: domain-separated vote-hash construction
//!
//! # Design Philosophy
//!
//! This crate is self-contained with minimal dependencies. It does not depend
//! on any other workspace crates, making it the foundation layer.

mod bitfield;
mod block;
mod certificate;
mod committee;
mod crypto;
mod epoch;
mod hash;
mod signing;

pub use bitfield::{BitfieldError, SignerBitfield};
pub use block::{Block, BlockHeader, BlockType, CommitteeInfo, KBlockData, BLOCK_MAGIC};
pub use certificate::{QuorumCertificate, TimeoutCertificate, Violation};
pub use committee::{
    majority_two_third, Committee, CommitteeOracle, StaticCommittee, Validator,
};
pub use crypto::{
    aggregate_signatures, verify_aggregate, Address, AggregateError, BlsKeyPair,
    BlsPublicKey, BlsSecretKey, BlsSignature, CryptoError, NodeKeyPair, NodeSecretKey,
    SenderSignature,
};
pub use epoch::EpochEndInfo;
pub use hash::{keccak256, Hash};
pub use signing::{proposal_vote_hash, wish_vote_hash, DOMAIN_BLOCK_VOTE, DOMAIN_WISH_VOTE};

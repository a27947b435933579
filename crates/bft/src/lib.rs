//! BFT consensus state machine.
//!
//! This crate provides the pipelined three-chain HotStuff pacemaker at the
//! heart of Meridian consensus.
//!
//! # Architecture
//!
//! The pacemaker processes inputs synchronously and returns actions:
//!
//! - `on_beat` → build and broadcast a proposal if we are the round proposer
//! - `on_receive_proposal` → validate, execute, vote
//! - `on_receive_vote` → collect votes, form a QC at two-thirds majority
//! - `on_receive_timeout` → collect wish votes, form a timeout certificate
//! - `on_round_timeout` → advance the round, notify the next proposer
//!
//! All I/O is performed by the runner via returned [`Action`]s. Block
//! execution and chain storage are external collaborators reached through
//! the [`BlockExecutor`] and [`ChainStore`] traits.
//!
//! # Terminology
//!
//! - **Round**: the unit of progress within an epoch; each round has one
//!   deterministic proposer.
//! - **Draft**: an uncommitted, possibly-executed block held in the proposal
//!   DAG rooted at the committed chain tip.
//! - **QCHigh**: the locally observed QC with the greatest (height, round).
//! - **Three-chain rule**: a block `b` commits when `b ← b' ← b'' ← bnew`
//!   with each arrow a direct QC and `b'.parent == b`.
//!
//! # Safety
//!
//! - A replica publishes at most one vote per round (`last_voting_height` is
//!   monotone) and only votes for proposals extending `block_locked`.
//! - Vote tallies seal on QC formation; late votes are ignored.
//! - `current_round`, `block_locked.height` and `QCHigh` are monotone within
//!   an epoch.
//!
//! # Liveness
//!
//! - Round timers back off exponentially under repeated timeouts.
//! - Timed-out replicas send wish votes to the next proposer; a two-thirds
//!   timeout certificate lets it propose immediately.

mod config;
mod draft;
mod error;
mod pacemaker;
mod traits;
mod types;
mod validate;
mod vote_manager;

pub use config::PacemakerConfig;
pub use draft::{DraftBlock, DraftQc, DraftSpace};
pub use error::BftError;
pub use pacemaker::{Pacemaker, PacemakerStats};
pub use traits::{
    BlockExecutor, ChainStore, ExecutedState, ExecutionError, PowDecision, PowOracle,
    PowResult, StoreError,
};
pub use types::{
    Action, BeatInfo, BeatReason, IncomingMsg, RoundTimeoutInfo, RoundUpdateReason, TimerKind,
};
pub use vote_manager::{QcVoteManager, TcVoteManager};

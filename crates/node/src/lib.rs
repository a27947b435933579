//! Runtime plumbing for the Meridian pacemaker.
//!
//! The [`runner`] module owns the single-threaded consensus main loop and the
//! epoch controller; everything else decouples that loop from the outside
//! world:
//!
//! - [`outgoing`] — bounded, TTL-policed worker pool posting sealed envelopes
//!   to peers over HTTP
//! - [`incoming`] — the single-consumer inbound queue feeding the main loop
//! - [`server`] — the HTTP shim accepting peer envelopes and serving metrics
//! - [`timers`] — the single-shot round timer and delayed beat scheduling
//! - [`metrics`] — prometheus gauges and counters
//! - [`storage`] — an in-memory [`meridian_bft::ChainStore`] implementation

pub mod incoming;
pub mod metrics;
pub mod outgoing;
pub mod runner;
pub mod server;
pub mod storage;
pub mod timers;

pub use incoming::{IncomingQueue, IN_QUEUE_TTL};
pub use outgoing::{OutgoingParcel, OutgoingQueue, OUT_QUEUE_CAPACITY, OUT_QUEUE_TTL};
pub use runner::{ConsensusRunner, NodeConfig, ShutdownHandle};
pub use storage::MemoryChainStore;

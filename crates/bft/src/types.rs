//! Event and action types for the pacemaker.

use meridian_messages::ConsensusMessage;
use meridian_types::{Address, EpochEndInfo};
use std::fmt;
use std::time::{Duration, Instant};

/// Why a beat was scheduled.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum BeatReason {
    /// First beat after Regulate.
    OnInit,
    /// QCHigh advanced; the next proposer should move immediately.
    OnHigherQc,
    /// A timeout certificate formed.
    OnTimeout,
}

impl fmt::Display for BeatReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BeatReason::OnInit => f.write_str("Init"),
            BeatReason::OnHigherQc => f.write_str("HigherQC"),
            BeatReason::OnTimeout => f.write_str("Timeout"),
        }
    }
}

/// Why the pacemaker is entering a round.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum RoundUpdateReason {
    OnBeat,
    OnRegularProposal,
    OnKBlockProposal,
    OnTimeoutCertProposal,
    OnTimeout,
}

impl fmt::Display for RoundUpdateReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RoundUpdateReason::OnBeat => f.write_str("Beat"),
            RoundUpdateReason::OnRegularProposal => f.write_str("RegularProposal"),
            RoundUpdateReason::OnKBlockProposal => f.write_str("KBlockProposal"),
            RoundUpdateReason::OnTimeoutCertProposal => f.write_str("TimeoutCertProposal"),
            RoundUpdateReason::OnTimeout => f.write_str("Timeout"),
        }
    }
}

/// How the round timer is being re-armed.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum TimerKind {
    /// Reset the backoff counter; arm at the regular base interval.
    Init,
    /// Reset the backoff counter; arm at the long (K-block) base interval.
    InitLong,
    /// Increment the backoff counter; arm at `base << (counter - 1)`.
    Inc,
}

/// Payload of the beat channel.
#[derive(Clone, Copy, Debug)]
pub struct BeatInfo {
    pub epoch: u64,
    pub round: u32,
    pub reason: BeatReason,
}

/// Payload of the round-timeout channel.
#[derive(Clone, Copy, Debug)]
pub struct RoundTimeoutInfo {
    pub round: u32,
    pub counter: u64,
}

/// A deserialized inbound message with its delivery deadline.
#[derive(Clone, Debug)]
pub struct IncomingMsg {
    pub msg: ConsensusMessage,
    pub peer: Address,
    pub enqueued_at: Instant,
    pub expire_at: Instant,
    /// Set once the message has been re-enqueued to wait for its parent.
    /// A second requeue attempt drops the message instead.
    pub requeued: bool,
}

impl IncomingMsg {
    pub fn expired(&self) -> bool {
        Instant::now() > self.expire_at
    }
}

/// Commands the pacemaker wants performed.
///
/// Actions are executed by the runner; the state machine itself never touches
/// the network or timers.
#[derive(Clone, Debug)]
pub enum Action {
    /// Send to every committee member, including this replica via loopback.
    Broadcast { msg: ConsensusMessage },

    /// Send to a single committee member.
    Unicast { to: Address, msg: ConsensusMessage },

    /// Arm the single-shot round timer. Re-arming cancels the prior timer.
    StartRoundTimer {
        round: u32,
        counter: u64,
        interval: Duration,
    },

    /// Cancel the round timer without re-arming.
    StopRoundTimer,

    /// Deliver a beat after a delay.
    ScheduleBeat {
        epoch: u64,
        round: u32,
        reason: BeatReason,
        delay: Duration,
    },

    /// A K-block committed; the epoch is over.
    EpochEnd(EpochEndInfo),

    /// Put a proposal back on the incoming queue to wait for its parent.
    Requeue(IncomingMsg),
}

impl Action {
    pub fn type_name(&self) -> &'static str {
        match self {
            Action::Broadcast { .. } => "Broadcast",
            Action::Unicast { .. } => "Unicast",
            Action::StartRoundTimer { .. } => "StartRoundTimer",
            Action::StopRoundTimer => "StopRoundTimer",
            Action::ScheduleBeat { .. } => "ScheduleBeat",
            Action::EpochEnd(_) => "EpochEnd",
            Action::Requeue(_) => "Requeue",
        }
    }
}

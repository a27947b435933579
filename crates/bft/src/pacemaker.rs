//! The pacemaker: a single-writer state machine driving pipelined
//! three-chain HotStuff rounds.
//!
//! All state mutation happens on the owning task; handlers return
//! [`Action`]s for the runner to execute. Block execution is synchronous from
//! the handlers' perspective.

use crate::config::PacemakerConfig;
use crate::draft::{draft_matches_qc, DraftBlock, DraftQc, DraftSpace};
use crate::error::BftError;
use crate::traits::{BlockExecutor, ChainStore, PowOracle, PowResult, StoreError};
use crate::types::{
    Action, BeatReason, IncomingMsg, RoundTimeoutInfo, RoundUpdateReason, TimerKind,
};
use crate::validate::{validate_block_body, validate_block_header};
use crate::vote_manager::{QcVoteManager, TcVoteManager};
use meridian_messages::{ConsensusMessage, ProposalMessage, TimeoutMessage, VoteMessage};
use meridian_types::{
    wish_vote_hash, Block, BlockHeader, BlockType, BlsKeyPair, BlsSignature, Committee,
    CommitteeInfo, CommitteeOracle, EpochEndInfo, Hash, KBlockData, NodeKeyPair,
    QuorumCertificate, TimeoutCertificate, Validator, BLOCK_MAGIC,
};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tracing::{debug, error, info, instrument, warn};

/// Counters and gauges the node exports for this pacemaker.
#[derive(Clone, Copy, Debug)]
pub struct PacemakerStats {
    pub epoch: u64,
    pub current_round: u32,
    pub in_committee: bool,
    pub is_round_proposer: bool,
    pub draft_count: usize,
    pub pruned_drafts: u64,
    pub timeout_counter: u64,
    pub last_voting_height: u32,
}

pub struct Pacemaker {
    config: PacemakerConfig,
    bls_key: BlsKeyPair,
    node_key: NodeKeyPair,
    oracle: Arc<dyn CommitteeOracle>,
    chain: Arc<dyn ChainStore>,
    executor: Arc<dyn BlockExecutor>,
    pow: Arc<dyn PowOracle>,

    committee: Arc<Committee>,
    my_index: Option<u32>,
    epoch: u64,
    last_k_block_height: u32,
    min_m_blocks: u32,

    // HotStuff state
    current_round: u32,
    last_voting_height: u32,
    last_vote_msg: Option<VoteMessage>,
    qc_high: DraftQc,
    block_locked: Hash,
    locked_height: u32,
    tc_high: Option<TimeoutCertificate>,

    // Duplicate-beat suppression. Starts at −1 so the first beat at round 0
    // is allowed.
    last_on_beat_round: i32,
    timeout_counter: u64,

    drafts: DraftSpace,
    qc_votes: QcVoteManager,
    tc_votes: TcVoteManager,
}

fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

impl Pacemaker {
    pub fn new(
        config: PacemakerConfig,
        bls_key: BlsKeyPair,
        node_key: NodeKeyPair,
        oracle: Arc<dyn CommitteeOracle>,
        chain: Arc<dyn ChainStore>,
        executor: Arc<dyn BlockExecutor>,
        pow: Arc<dyn PowOracle>,
    ) -> Self {
        let min_m_blocks = config.min_m_blocks;
        Self {
            config,
            bls_key,
            node_key,
            oracle,
            chain,
            executor,
            pow,
            committee: Arc::new(Committee::new(0, Vec::new())),
            my_index: None,
            epoch: 0,
            last_k_block_height: 0,
            min_m_blocks,
            current_round: 0,
            last_voting_height: 0,
            last_vote_msg: None,
            qc_high: DraftQc::new(QuorumCertificate::genesis(), None),
            block_locked: Hash::ZERO,
            locked_height: 0,
            tc_high: None,
            last_on_beat_round: -1,
            timeout_counter: 0,
            drafts: DraftSpace::new(),
            qc_votes: QcVoteManager::new(0),
            tc_votes: TcVoteManager::new(0),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Committee accessors
    // ═══════════════════════════════════════════════════════════════════════

    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    pub fn current_round(&self) -> u32 {
        self.current_round
    }

    pub fn committee(&self) -> Arc<Committee> {
        self.committee.clone()
    }

    pub fn stats(&self) -> PacemakerStats {
        PacemakerStats {
            epoch: self.epoch,
            current_round: self.current_round,
            in_committee: self.my_index.is_some(),
            is_round_proposer: self.am_i_round_proposer(self.current_round),
            draft_count: self.drafts.len(),
            pruned_drafts: self.drafts.pruned_total(),
            timeout_counter: self.timeout_counter,
            last_voting_height: self.last_voting_height,
        }
    }

    fn round_proposer(&self, round: u32) -> Option<Validator> {
        if self.committee.size() == 0 {
            return None;
        }
        Some(self.committee.proposer_for(round).clone())
    }

    fn am_i_round_proposer(&self, round: u32) -> bool {
        self.my_index.is_some()
            && self
                .round_proposer(round)
                .is_some_and(|p| p.address == self.node_key.address)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Regulate (epoch entry)
    // ═══════════════════════════════════════════════════════════════════════

    /// Re-seed the pacemaker from the committed chain tip. Called on startup
    /// and after every K-block commit.
    pub fn regulate(&mut self) -> Result<Vec<Action>, BftError> {
        let best = self.chain.best_block();
        let best_qc = self.chain.best_qc();

        let (round, epoch) = if best.is_k_block() || best.number() == 0 {
            let epoch = if best.is_k_block() {
                best_qc.epoch + 1
            } else {
                best_qc.epoch
            };
            (0u32, epoch)
        } else {
            (best_qc.round + 1, best_qc.epoch)
        };

        let committee = self
            .oracle
            .committee_for_epoch(epoch)
            .ok_or(BftError::NoCommittee(epoch))?;

        info!(
            best = %best.compact_string(),
            qc = %best_qc.compact_string(),
            epoch,
            round,
            "pacemaker regulate"
        );

        self.my_index = committee.index_of(&self.node_key.address);
        self.qc_votes = QcVoteManager::new(committee.size() as u32);
        self.tc_votes = TcVoteManager::new(committee.size() as u32);
        self.committee = committee;
        self.epoch = epoch;
        self.last_k_block_height = best.last_k_block_height();
        self.min_m_blocks = self.config.min_m_blocks;

        // Seed the draft space with the committed tip so escort-QC lookups
        // and parent walks terminate.
        let best_id = best.id();
        let wrapper = DraftBlock {
            height: best.number(),
            round: best_qc.round,
            parent_id: best.parent_id(),
            justify: DraftQc::new(best.qc.clone(), None),
            block_type: best.block_type(),
            raw_block: best.encode(),
            block: best.clone(),
            committed: true,
            executed: None,
            success_processed: true,
            process_error: None,
        };
        self.drafts.clear();
        self.drafts.add(wrapper);

        self.block_locked = best_id;
        self.locked_height = best.number();
        self.qc_high = DraftQc::new(best_qc, Some(best_id));
        self.last_voting_height = 0;
        self.last_vote_msg = None;
        self.tc_high = None;
        self.timeout_counter = 0;
        self.current_round = round;
        self.last_on_beat_round = round as i32 - 1;

        Ok(vec![Action::ScheduleBeat {
            epoch,
            round,
            reason: BeatReason::OnInit,
            delay: self.config.beat_init_delay,
        }])
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Inbound dispatch
    // ═══════════════════════════════════════════════════════════════════════

    /// Route a dequeued inbound message. Expired messages and messages from
    /// another epoch are discarded here.
    pub fn handle_incoming(&mut self, mi: IncomingMsg) -> Vec<Action> {
        if mi.expired() {
            info!(msg = %mi.msg, "incoming msg expired, dropped");
            return Vec::new();
        }
        if mi.msg.epoch() != self.epoch {
            info!(
                msg_epoch = mi.msg.epoch(),
                local_epoch = self.epoch,
                msg = %mi.msg,
                "rcvd message with mismatched epoch"
            );
            return Vec::new();
        }
        match mi.msg.clone() {
            ConsensusMessage::Proposal(msg) => self.on_receive_proposal(mi, msg),
            ConsensusMessage::Vote(msg) => self.on_receive_vote(msg),
            ConsensusMessage::Timeout(msg) => self.on_receive_timeout(msg),
        }
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OnBeat / OnPropose
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, reason), fields(reason = %reason))]
    pub fn on_beat(&mut self, epoch: u64, round: u32, reason: BeatReason) -> Vec<Action> {
        if epoch < self.epoch {
            warn!(
                beat_epoch = epoch,
                local_epoch = self.epoch,
                "outdated onBeat, skip"
            );
            return Vec::new();
        }
        if epoch == self.epoch && (round as i64) <= self.last_on_beat_round as i64 {
            warn!(
                round,
                last_on_beat_round = self.last_on_beat_round,
                "duplicate onBeat, skip"
            );
            return Vec::new();
        }
        self.last_on_beat_round = round as i32;
        info!(epoch, round, %reason, "OnBeat");

        if self
            .drafts
            .get_one_by_escort_qc(&self.qc_high.qc)
            .is_none()
        {
            warn!(qc = %self.qc_high.qc, "no draft behind QCHigh, skip beat");
            return Vec::new();
        }

        let mut actions = Vec::new();
        if reason == BeatReason::OnInit {
            actions.extend(self.reset_round_timer(round, TimerKind::Init));
        }

        if !self.am_i_round_proposer(round) {
            info!(round, "I am NOT round proposer");
            return actions;
        }

        let (_, timer_actions) = self.enter_round(round, RoundUpdateReason::OnBeat);
        actions.extend(timer_actions);
        info!(round, "I AM round proposer");

        actions.extend(self.on_propose(self.qc_high.clone(), round));
        actions
    }

    fn on_propose(&mut self, justify: DraftQc, round: u32) -> Vec<Action> {
        let Some(parent_id) = self
            .drafts
            .get_one_by_escort_qc(&justify.qc)
            .map(|d| d.id())
        else {
            warn!(qc = %justify.qc, "could not address parent for propose");
            return Vec::new();
        };

        let bnew = match self.create_leaf(parent_id, &justify, round) {
            Ok(bnew) => bnew,
            Err(err) => {
                error!(%err, round, "could not create leaf");
                return Vec::new();
            }
        };

        if bnew.height <= bnew.block.qc.height {
            error!(
                proposed_qc_height = bnew.block.qc.height,
                proposed_height = bnew.height,
                "proposed block refers to an invalid qc"
            );
            return Vec::new();
        }

        let msg = self.build_proposal_message(&bnew);
        self.tc_high = None;

        // Create the slot in the proposal space directly; the broadcast loops
        // back to this replica through the message bus.
        self.drafts.add(bnew);

        vec![Action::Broadcast { msg }]
    }

    fn create_leaf(
        &mut self,
        parent_id: Hash,
        justify: &DraftQc,
        round: u32,
    ) -> Result<DraftBlock, BftError> {
        let parent = self
            .drafts
            .get_by_id(&parent_id)
            .cloned()
            .ok_or(BftError::ParentBlockEmpty)?;

        info!(
            round,
            qc = %justify.qc,
            parent_height = parent.height,
            parent_round = parent.round,
            "CreateLeaf"
        );

        let timeout = self.tc_high.is_some();
        let mut propose_k_block = false;
        let mut pow_result: Option<PowResult> = None;
        if parent.height + 1 - parent.block.last_k_block_height() >= self.min_m_blocks && !timeout
        {
            let decision = self.pow.decision();
            propose_k_block = decision.propose_k_block && decision.result.is_some();
            pow_result = decision.result;
        }

        let propose_stop_committee = parent.block_type == BlockType::KBlock;

        if self.epoch != 0 && round != 0 {
            if round <= justify.qc.round {
                warn!(round, qc_round = justify.qc.round, "invalid round to propose");
                return Err(BftError::InvalidRound);
            }
            if round <= parent.round {
                warn!(round, parent_round = parent.round, "invalid round to propose");
                return Err(BftError::InvalidRound);
            }
        }

        if propose_stop_committee {
            self.build_leaf(&parent, justify, round, BlockType::StopCommittee, None, vec![])
        } else if propose_k_block {
            let result = pow_result.expect("checked above");
            let k_data = KBlockData {
                nonce: result.nonce,
                raw: result.raw.clone(),
            };
            self.build_leaf(
                &parent,
                justify,
                round,
                BlockType::KBlock,
                Some(k_data),
                result.rewards,
            )
        } else {
            self.build_leaf(&parent, justify, round, BlockType::MBlock, None, vec![])
        }
    }

    fn build_leaf(
        &mut self,
        parent: &DraftBlock,
        justify: &DraftQc,
        round: u32,
        block_type: BlockType,
        k_data: Option<KBlockData>,
        transactions: Vec<Vec<u8>>,
    ) -> Result<DraftBlock, BftError> {
        let height = parent.height + 1;
        let last_k_block_height = if block_type == BlockType::KBlock {
            height
        } else {
            parent.block.last_k_block_height()
        };
        let timestamp = unix_now().max(parent.block.header.timestamp + 1);

        // K-blocks carry the next epoch's membership for the committee
        // handoff.
        let committee_info = if block_type == BlockType::KBlock {
            self.oracle
                .committee_for_epoch(self.epoch + 1)
                .map(|c| {
                    c.members()
                        .iter()
                        .map(|v| CommitteeInfo {
                            address: v.address,
                            bls_pub_key: v.bls_pub_key.to_bytes(),
                            network_addr: v.network_addr.clone(),
                        })
                        .collect()
                })
                .unwrap_or_default()
        } else {
            Vec::new()
        };

        let mut block = Block {
            header: BlockHeader {
                height,
                parent_id: parent.id(),
                timestamp,
                block_type,
                last_k_block_height,
                gas_limit: self.config.gas_limit,
                gas_used: 0,
                total_score: parent.block.header.total_score + 1,
                txs_root: Block::compute_txs_root(&transactions),
                receipts_root: Hash::ZERO,
                state_root: Hash::ZERO,
                magic: BLOCK_MAGIC,
                proposer_signature: Vec::new(),
            },
            qc: justify.qc.clone(),
            transactions,
            k_block_data: k_data,
            committee_info,
        };

        // Execute on top of the parent to stamp the resulting roots before
        // sealing the header.
        let executed = self
            .executor
            .execute(&parent.block.header, &block, unix_now())
            .map_err(|err| BftError::Consensus(err.to_string()))?;
        block.header.state_root = executed.state_root;
        block.header.receipts_root = executed.receipts_root;

        let signing_hash = block.header.signing_hash();
        block.header.proposer_signature =
            self.node_key.secret.sign_recoverable(&signing_hash).0.to_vec();

        let raw_block = block.encode();
        Ok(DraftBlock {
            height,
            round,
            parent_id: parent.id(),
            justify: justify.clone(),
            block_type,
            raw_block,
            block,
            committed: false,
            executed: Some(executed),
            success_processed: true,
            process_error: None,
        })
    }

    fn build_proposal_message(&self, bnew: &DraftBlock) -> ConsensusMessage {
        let parent = self.drafts.get_by_id(&bnew.parent_id);
        ConsensusMessage::Proposal(ProposalMessage {
            height: bnew.height,
            round: bnew.round,
            parent_height: parent.map(|p| p.height).unwrap_or(0),
            parent_round: parent.map(|p| p.round).unwrap_or(0),
            proposer_id: self.node_key.address,
            proposer_bls_pub: self.bls_key.public.to_bytes(),
            last_k_block_height: self.last_k_block_height,
            epoch: self.epoch,
            block_bytes: bnew.raw_block.clone(),
            block_type: bnew.block_type as u8,
            timeout_cert: self.tc_high.clone(),
            timestamp: unix_now(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OnReceiveProposal
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, mi, msg), fields(height = msg.height, round = msg.round))]
    fn on_receive_proposal(&mut self, mut mi: IncomingMsg, msg: ProposalMessage) -> Vec<Action> {
        if msg.height < self.locked_height {
            info!(
                height = msg.height,
                locked_height = self.locked_height,
                "outdated proposal, dropped"
            );
            return Vec::new();
        }

        let block = match Block::decode(&msg.block_bytes) {
            Ok(block) => block,
            Err(err) => {
                warn!(%err, "could not decode proposed block");
                return Vec::new();
            }
        };

        // The round proposer is deterministic; anyone else is an imposter.
        if !self
            .round_proposer(msg.round)
            .is_some_and(|p| p.address == msg.proposer_id)
        {
            warn!(round = msg.round, proposer = %msg.proposer_id, "proposal from wrong proposer");
            return Vec::new();
        }

        // Address the parent draft; out-of-order delivery gets one second
        // chance through the queue.
        let Some(parent) = self
            .drafts
            .get_one(msg.parent_height, msg.parent_round, &block.parent_id())
            .cloned()
        else {
            if mi.requeued {
                warn!(
                    parent_height = msg.parent_height,
                    parent_round = msg.parent_round,
                    "parent draft still missing after requeue, dropped"
                );
                return Vec::new();
            }
            warn!(
                parent_height = msg.parent_height,
                parent_round = msg.parent_round,
                parent = %block.parent_id(),
                "could not get parent draft, throw it back in queue"
            );
            mi.requeued = true;
            return vec![Action::Requeue(mi)];
        };

        // The embedded QC must certify the parent we resolved; otherwise a
        // fork of an unknown ancestor is in play and we stay silent.
        if !draft_matches_qc(&parent, &block.qc) {
            warn!(
                qc_height = block.qc.height,
                qc_round = block.qc.round,
                parent = %parent.id(),
                "parent doesn't match qc from proposal, potential fork"
            );
            return Vec::new();
        }

        let justify = DraftQc::new(block.qc.clone(), Some(parent.id()));
        let valid_timeout = self.verify_timeout_cert(&msg.timeout_cert, msg.round);

        let block_id = block.id();
        if self.drafts.get_by_id(&block_id).is_none() {
            let block_type = match BlockType::from_u8(msg.block_type) {
                Some(bt) if bt == block.block_type() => bt,
                _ => {
                    warn!(block_type = msg.block_type, "proposal block type mismatch");
                    return Vec::new();
                }
            };
            self.drafts.add(DraftBlock {
                height: msg.height,
                round: msg.round,
                parent_id: parent.id(),
                justify: justify.clone(),
                block_type,
                raw_block: msg.block_bytes.clone(),
                block,
                committed: false,
                executed: None,
                success_processed: false,
                process_error: None,
            });
        }

        let bnew = self
            .drafts
            .get_by_id(&block_id)
            .expect("inserted above")
            .clone();

        let mut actions = Vec::new();

        if bnew.height > self.last_voting_height && self.extends_from_locked(block_id) {
            let reason = if valid_timeout {
                RoundUpdateReason::OnTimeoutCertProposal
            } else if bnew.block_type == BlockType::KBlock {
                RoundUpdateReason::OnKBlockProposal
            } else {
                RoundUpdateReason::OnRegularProposal
            };
            let (_, timer_actions) = self.enter_round(bnew.round, reason);
            actions.extend(timer_actions);

            // Parent round and justify round must both be strictly below the
            // proposal round.
            let parent_round = parent.round;
            let justify_round = justify.qc.round;
            if parent_round > 0 && justify_round > 0 {
                if parent_round >= bnew.round {
                    error!(parent_round, round = bnew.round, "parent round must be strictly lower");
                    return actions;
                }
                if justify_round >= bnew.round {
                    error!(justify_round, round = bnew.round, "justify round must be strictly lower");
                    return actions;
                }
            }

            match self.validate_proposal(block_id) {
                Ok(()) => {
                    if let Some(vote) = self.build_vote_message(&block_id) {
                        if let Some(next_proposer) = self.round_proposer(bnew.round + 1) {
                            actions.push(Action::Unicast {
                                to: next_proposer.address,
                                msg: ConsensusMessage::Vote(vote.clone()),
                            });
                        }
                        self.last_voting_height = bnew.height;
                        self.last_vote_msg = Some(vote);
                    }
                }
                Err(err) => {
                    error!(%err, block = %block_id, "validate proposal failed");
                    return actions;
                }
            }
        }

        actions.extend(self.update(block_id));
        actions
    }

    /// Is `block_locked` an ancestor of the draft via parent pointers?
    fn extends_from_locked(&self, mut id: Hash) -> bool {
        loop {
            if id == self.block_locked {
                return true;
            }
            match self.drafts.get_by_id(&id) {
                Some(d) if d.height > self.locked_height => id = d.parent_id,
                _ => return false,
            }
        }
    }

    fn verify_timeout_cert(&self, tc: &Option<TimeoutCertificate>, round: u32) -> bool {
        let Some(tc) = tc else { return false };
        if tc.epoch != self.epoch || tc.wish_round != round {
            return false;
        }
        if tc.voter_msg_hash != wish_vote_hash(tc.epoch, tc.wish_round) {
            warn!(%tc, "timeout cert hash mismatch");
            return false;
        }
        tc.verify(&self.committee)
    }

    /// Run header, body and execution checks for a draft, recording the
    /// outcome on the draft itself.
    fn validate_proposal(&mut self, id: Hash) -> Result<(), BftError> {
        let draft = self
            .drafts
            .get_by_id(&id)
            .cloned()
            .ok_or(BftError::ParentMissing)?;
        if draft.success_processed {
            return Ok(());
        }

        let result = self.validate_proposal_inner(&draft);
        if let Some(entry) = self.drafts.get_mut(&id) {
            match &result {
                Ok(executed) => {
                    entry.executed = Some(executed.clone());
                    entry.success_processed = true;
                    entry.process_error = None;
                }
                Err(err) => {
                    entry.success_processed = false;
                    entry.process_error = Some(err.clone());
                }
            }
        }
        result.map(|_| ())
    }

    fn validate_proposal_inner(
        &self,
        draft: &DraftBlock,
    ) -> Result<crate::traits::ExecutedState, BftError> {
        let id = draft.id();
        if self.chain.block_by_id(&id).is_some() {
            return Err(BftError::KnownBlock);
        }

        let parent_header = self
            .drafts
            .get_by_id(&draft.parent_id)
            .map(|p| p.block.header.clone())
            .or_else(|| self.chain.block_by_id(&draft.parent_id).map(|b| b.header))
            .ok_or(BftError::ParentHeaderMissing)?;

        let now = unix_now();
        validate_block_header(&draft.block.header, &parent_header, now)?;
        validate_block_body(&draft.block)?;

        let executed = self
            .executor
            .execute(&parent_header, &draft.block, now)
            .map_err(|err| BftError::Consensus(err.to_string()))?;
        if executed.state_root != draft.block.header.state_root {
            return Err(BftError::Consensus(format!(
                "state root mismatch: want {:?}, have {:?}",
                draft.block.header.state_root, executed.state_root
            )));
        }
        if executed.receipts_root != draft.block.header.receipts_root {
            return Err(BftError::Consensus(format!(
                "receipts root mismatch: want {:?}, have {:?}",
                draft.block.header.receipts_root, executed.receipts_root
            )));
        }
        Ok(executed)
    }

    fn build_vote_message(&self, id: &Hash) -> Option<VoteMessage> {
        let index = self.my_index?;
        let draft = self.drafts.get_by_id(id)?;
        let vote_hash = draft.vote_hash();
        let vote_signature = self.bls_key.secret.sign(&vote_hash);
        Some(VoteMessage {
            epoch: self.epoch,
            vote_height: draft.height,
            vote_round: draft.round,
            vote_block_id: draft.id(),
            signer_index: index,
            vote_signature: vote_signature.to_bytes(),
            vote_hash,
            timestamp: unix_now(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OnReceiveVote
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, msg), fields(height = msg.vote_height, round = msg.vote_round))]
    fn on_receive_vote(&mut self, msg: VoteMessage) -> Vec<Action> {
        let height = msg.vote_height;
        let round = msg.vote_round;

        if round < self.current_round {
            info!(
                current_round = self.current_round,
                vote_round = round,
                "outdated vote, dropped"
            );
            return Vec::new();
        }
        if !self.am_i_round_proposer(round + 1) {
            info!(round, "invalid vote, I'm not the expected next proposer");
            return Vec::new();
        }

        let Some(b) = self.drafts.get_one(height, round, &msg.vote_block_id) else {
            warn!(block = %msg.vote_block_id, "can not get voted draft");
            return Vec::new();
        };

        // The vote must be over exactly the content we hold; anything else is
        // a vote for a different block wearing the same id.
        if msg.vote_hash != b.vote_hash() {
            warn!(voter = msg.signer_index, "vote hash does not match draft content");
            return Vec::new();
        }
        if !self.verify_member_signature(msg.signer_index, &msg.vote_hash, &msg.vote_signature) {
            warn!(voter = msg.signer_index, "invalid vote signature");
            return Vec::new();
        }

        let Some(qc) = self.qc_votes.add_vote(
            msg.signer_index,
            self.epoch,
            height,
            round,
            msg.vote_block_id,
            &msg.vote_signature,
            msg.vote_hash,
        ) else {
            return Vec::new();
        };

        let qc_node = self.drafts.get_one_by_escort_qc(&qc).map(|d| d.id());
        let changed = self.update_qc_high(DraftQc::new(qc.clone(), qc_node));
        if changed {
            return vec![Action::ScheduleBeat {
                epoch: self.epoch,
                round: qc.round + 1,
                reason: BeatReason::OnHigherQc,
                delay: self.config.beat_on_higher_qc_delay,
            }];
        }
        Vec::new()
    }

    fn verify_member_signature(&self, index: u32, hash: &Hash, signature: &[u8]) -> bool {
        let Some(member) = self.committee.member_at(index as usize) else {
            return false;
        };
        let Ok(sig) = BlsSignature::from_bytes(signature) else {
            return false;
        };
        member.bls_pub_key.verify(hash, &sig)
    }

    // ═══════════════════════════════════════════════════════════════════════
    // OnReceiveTimeout
    // ═══════════════════════════════════════════════════════════════════════

    #[instrument(skip(self, msg), fields(wish_round = msg.wish_round))]
    fn on_receive_timeout(&mut self, msg: TimeoutMessage) -> Vec<Action> {
        if !self.am_i_round_proposer(msg.wish_round) {
            debug!(
                epoch = msg.epoch,
                wish_round = msg.wish_round,
                "invalid timeout msg, I'm not the expected proposer"
            );
            return Vec::new();
        }

        let mut tc_updated = false;
        let mut qc_updated = false;

        // Wish vote: verify and tally towards a TC.
        let expected_wish = wish_vote_hash(msg.epoch, msg.wish_round);
        if msg.wish_vote_hash == expected_wish
            && self.verify_member_signature(msg.signer_index, &msg.wish_vote_hash, &msg.wish_vote_sig)
        {
            if let Some(tc) = self.tc_votes.add_vote(
                msg.signer_index,
                msg.epoch,
                msg.wish_round,
                &msg.wish_vote_sig,
                msg.wish_vote_hash,
            ) {
                self.tc_high = Some(tc);
                tc_updated = true;
            }
        } else {
            warn!(voter = msg.signer_index, "invalid wish vote in timeout msg");
        }

        // Piggy-backed last vote: a stuck-but-almost-formed QC can still
        // complete here.
        if !msg.last_vote_signature.is_empty()
            && self.verify_member_signature(
                msg.signer_index,
                &msg.last_vote_hash,
                &msg.last_vote_signature,
            )
        {
            if let Some(qc) = self.qc_votes.add_vote(
                msg.signer_index,
                self.epoch,
                msg.last_vote_height,
                msg.last_vote_round,
                msg.last_vote_block_id,
                &msg.last_vote_signature,
                msg.last_vote_hash,
            ) {
                let qc_node = self.drafts.get_one_by_escort_qc(&qc).map(|d| d.id());
                if self.update_qc_high(DraftQc::new(qc, qc_node)) {
                    qc_updated = true;
                }
            }
        }

        // The sender's QCHigh may be ahead of ours.
        match QuorumCertificate::decode(&msg.qc_high) {
            Ok(qc) if qc.is_genesis() || qc.verify(&self.committee) => {
                let qc_node = self.drafts.get_one_by_escort_qc(&qc).map(|d| d.id());
                if self.update_qc_high(DraftQc::new(qc, qc_node)) {
                    qc_updated = true;
                }
            }
            Ok(_) => warn!("timeout msg carries invalid QCHigh"),
            Err(err) => warn!(%err, "could not decode QCHigh in timeout msg"),
        }

        let mut actions = Vec::new();
        if qc_updated {
            actions.push(Action::ScheduleBeat {
                epoch: self.epoch,
                round: self.qc_high.qc.round + 1,
                reason: BeatReason::OnHigherQc,
                delay: self.config.beat_on_timeout_delay,
            });
        }
        if tc_updated {
            let round = self.tc_high.as_ref().expect("just set").wish_round;
            actions.push(Action::ScheduleBeat {
                epoch: self.epoch,
                round,
                reason: BeatReason::OnHigherQc,
                delay: self.config.beat_on_timeout_delay,
            });
        }
        actions
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Update (three-chain commit rule)
    // ═══════════════════════════════════════════════════════════════════════

    /// b_exec ← b_lock ← b ← b' ← b'' ← bnew*
    fn update(&mut self, bnew_id: Hash) -> Vec<Action> {
        let Some(bnew) = self.drafts.get_by_id(&bnew_id).cloned() else {
            return Vec::new();
        };

        // Pre-commit phase: QCHigh always advances to the proposal's justify.
        self.update_qc_high(bnew.justify.clone());

        let Some(b2) = bnew
            .justify
            .qc_node
            .and_then(|id| self.drafts.get_by_id(&id))
            .cloned()
        else {
            debug!("b'' is empty, early termination of Update");
            return Vec::new();
        };
        if b2.committed {
            debug!(b2 = %b2.compact_string(), "b'' is committed");
            return Vec::new();
        }
        let Some(b1) = b2
            .justify
            .qc_node
            .and_then(|id| self.drafts.get_by_id(&id))
            .cloned()
        else {
            debug!("b' is empty, early termination of Update");
            return Vec::new();
        };
        let Some(b0) = b1
            .justify
            .qc_node
            .and_then(|id| self.drafts.get_by_id(&id))
            .cloned()
        else {
            debug!("b is empty, early termination of Update");
            return Vec::new();
        };

        debug!(bnew = %bnew.compact_string(), b2 = %b2.compact_string(), b1 = %b1.compact_string(), b0 = %b0.compact_string(), "Update");

        // Commit requires a direct parent link.
        if b1.parent_id != b0.id() {
            return Vec::new();
        }

        // Every draft on b'.parent, b'.parent.parent, ... above the locked
        // height commits in height order, each escorted by its child's
        // embedded QC.
        let mut commit_ready: Vec<(Hash, QuorumCertificate)> = Vec::new();
        let mut child = b1.clone();
        loop {
            let parent_id = child.parent_id;
            let Some(parent) = self.drafts.get_by_id(&parent_id).cloned() else {
                break;
            };
            if parent.height <= self.locked_height {
                break;
            }
            commit_ready.push((parent_id, child.block.qc.clone()));
            child = parent;
        }
        commit_ready.reverse();

        let actions = self.on_commit(&commit_ready);

        // Commit phase on b.
        self.block_locked = b0.id();
        self.locked_height = b0.height;
        actions
    }

    fn on_commit(&mut self, commit_ready: &[(Hash, QuorumCertificate)]) -> Vec<Action> {
        let mut actions = Vec::new();
        for (id, escort_qc) in commit_ready {
            let Some(draft) = self.drafts.get_by_id(id).cloned() else {
                warn!("skip commit of missing draft");
                continue;
            };
            if draft.committed || self.chain.block_by_id(id).is_some() {
                debug!(height = draft.height, "skip commit of known block");
                continue;
            }
            if !draft.success_processed {
                error!(
                    height = draft.height,
                    round = draft.round,
                    err = ?draft.process_error,
                    "process of this proposal failed, skip commit"
                );
                if draft.process_error != Some(BftError::KnownBlock) {
                    if let Some(executed) = &draft.executed {
                        self.executor.revert_to(executed.checkpoint);
                    }
                }
                continue;
            }

            match self.chain.append(&draft.block, escort_qc) {
                Ok(()) => {
                    info!(
                        block = %draft.block.compact_string(),
                        escort = %escort_qc,
                        "committed block"
                    );
                }
                Err(StoreError::KnownBlock) => {
                    debug!(height = draft.height, "block already in chain");
                }
                Err(err) => {
                    warn!(%err, block = %draft.block.compact_string(), "commit failed");
                    if let Some(executed) = &draft.executed {
                        self.executor.revert_to(executed.checkpoint);
                    }
                    continue;
                }
            }

            if let Some(entry) = self.drafts.get_mut(id) {
                entry.committed = true;
            }
            self.drafts.prune_below(id, draft.height);

            if draft.block_type == BlockType::KBlock {
                info!(
                    height = draft.height,
                    round = draft.round,
                    "committed a kblock, epoch ends"
                );
                self.last_k_block_height = draft.height;
                let nonce = draft
                    .block
                    .k_block_data
                    .as_ref()
                    .map(|d| d.nonce)
                    .unwrap_or_default();
                actions.push(Action::EpochEnd(EpochEndInfo {
                    height: draft.height,
                    last_k_block_height: draft.block.last_k_block_height(),
                    nonce,
                    epoch: self.epoch,
                }));
            }
        }
        actions
    }

    /// Advance QCHigh if the candidate is strictly greater under
    /// lexicographic (height, round) order.
    fn update_qc_high(&mut self, candidate: DraftQc) -> bool {
        let cur = &self.qc_high.qc;
        let cand = &candidate.qc;
        let updated = cand.height > cur.height
            || (cand.height == cur.height && cand.round > cur.round);
        if updated {
            debug!(from = %self.qc_high.compact_string(), to = %candidate.compact_string(), "QCHigh updated");
            self.qc_high = candidate;
        }
        updated
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Round timeout
    // ═══════════════════════════════════════════════════════════════════════

    pub fn on_round_timeout(&mut self, info: RoundTimeoutInfo) -> Vec<Action> {
        warn!(
            round = info.round,
            counter = self.timeout_counter,
            "round timeout"
        );

        let (updated, mut actions) =
            self.enter_round(info.round + 1, RoundUpdateReason::OnTimeout);
        if updated {
            let msg = self.build_timeout_message();
            if let Some(proposer) = self.round_proposer(self.current_round) {
                actions.push(Action::Unicast {
                    to: proposer.address,
                    msg,
                });
            }
        }
        actions
    }

    fn build_timeout_message(&self) -> ConsensusMessage {
        let wish_round = self.current_round;
        let wish_hash = wish_vote_hash(self.epoch, wish_round);
        let wish_sig = self.bls_key.secret.sign(&wish_hash);

        let (lv_height, lv_round, lv_block_id, lv_sig, lv_hash) = match &self.last_vote_msg {
            Some(v) => (
                v.vote_height,
                v.vote_round,
                v.vote_block_id,
                v.vote_signature.clone(),
                v.vote_hash,
            ),
            None => (0, 0, Hash::ZERO, Vec::new(), Hash::ZERO),
        };

        ConsensusMessage::Timeout(TimeoutMessage {
            epoch: self.epoch,
            wish_round,
            signer_index: self.my_index.unwrap_or(0),
            wish_vote_sig: wish_sig.to_bytes(),
            wish_vote_hash: wish_hash,
            last_vote_height: lv_height,
            last_vote_round: lv_round,
            last_vote_block_id: lv_block_id,
            last_vote_signature: lv_sig,
            last_vote_hash: lv_hash,
            qc_high: self.qc_high.qc.encode(),
            timestamp: unix_now(),
        })
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Round entry and the round timer
    // ═══════════════════════════════════════════════════════════════════════

    /// Apply a round-entry reason. Returns whether `current_round` advanced,
    /// plus the timer actions to execute.
    fn enter_round(&mut self, round: u32, reason: RoundUpdateReason) -> (bool, Vec<Action>) {
        let mut actions = Vec::new();
        let mut updated = false;

        match reason {
            RoundUpdateReason::OnBeat | RoundUpdateReason::OnRegularProposal => {
                if round > self.current_round {
                    updated = true;
                    actions = self.reset_round_timer(round, TimerKind::Init);
                } else if round == self.current_round && self.am_i_round_proposer(round) {
                    actions = self.reset_round_timer(round, TimerKind::Init);
                }
            }
            RoundUpdateReason::OnKBlockProposal => {
                if round > self.current_round {
                    updated = true;
                    actions = self.reset_round_timer(round, TimerKind::InitLong);
                } else if round == self.current_round && self.am_i_round_proposer(round) {
                    actions = self.reset_round_timer(round, TimerKind::InitLong);
                }
            }
            RoundUpdateReason::OnTimeoutCertProposal => {
                if round >= self.current_round {
                    updated = round > self.current_round;
                    actions = self.reset_round_timer(round, TimerKind::Init);
                }
            }
            RoundUpdateReason::OnTimeout => {
                updated = round > self.current_round;
                actions = self.reset_round_timer(round, TimerKind::Inc);
            }
        }

        if updated {
            let old = self.current_round;
            self.current_round = round;
            let proposer = self
                .round_proposer(round)
                .map(|p| p.network_addr)
                .unwrap_or_default();
            info!(old, new = round, %reason, proposer = %proposer, "update round");
        }
        (updated, actions)
    }

    /// Cancel the live timer and arm a fresh single-shot one.
    fn reset_round_timer(&mut self, round: u32, kind: TimerKind) -> Vec<Action> {
        let base = match kind {
            TimerKind::Init => {
                self.timeout_counter = 0;
                self.config.round_timeout
            }
            TimerKind::InitLong => {
                self.timeout_counter = 0;
                self.config.round_timeout_long
            }
            TimerKind::Inc => {
                self.timeout_counter += 1;
                self.config.round_timeout
            }
        };
        let interval = Self::timeout_interval(base, self.timeout_counter);
        info!(
            round,
            interval_s = interval.as_secs(),
            counter = self.timeout_counter,
            "start round timer"
        );
        vec![
            Action::StopRoundTimer,
            Action::StartRoundTimer {
                round,
                counter: self.timeout_counter,
                interval,
            },
        ]
    }

    /// `base << (counter - 1)`, saturating instead of overflowing for large
    /// counters.
    fn timeout_interval(base: Duration, counter: u64) -> Duration {
        let power = counter.saturating_sub(1).min(u32::MAX as u64) as u32;
        let mult = 1u64.checked_shl(power).unwrap_or(u64::MAX);
        let ms = (base.as_millis() as u64).saturating_mul(mult);
        Duration::from_millis(ms)
    }
}

//! End-to-end consensus drills over an in-process committee.
//!
//! Four pacemakers share a lossless in-memory bus; the harness executes
//! returned actions in FIFO order, so message interleavings follow real
//! dispatch order while timers are collapsed to explicit calls. The pipeline
//! is self-perpetuating, so runs are step-bounded or predicate-bounded.

use meridian_bft::{
    Action, BeatReason, BlockExecutor, ChainStore, ExecutedState, ExecutionError, IncomingMsg,
    Pacemaker, PacemakerConfig, PowDecision, PowOracle, PowResult, RoundTimeoutInfo, StoreError,
};
use meridian_messages::ConsensusMessage;
use meridian_types::{
    keccak256, Address, Block, BlockHeader, BlockType, BlsKeyPair, Committee, EpochEndInfo, Hash,
    NodeKeyPair, QuorumCertificate, StaticCommittee, Validator, BLOCK_MAGIC,
};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

// ═══════════════════════════════════════════════════════════════════════════
// Test collaborators
// ═══════════════════════════════════════════════════════════════════════════

struct TestExecutor;

impl BlockExecutor for TestExecutor {
    fn execute(
        &self,
        parent: &BlockHeader,
        block: &Block,
        _now: u64,
    ) -> Result<ExecutedState, ExecutionError> {
        // Deterministic pseudo-state so every replica derives the same roots.
        let mut buf = Vec::new();
        buf.extend_from_slice(parent.state_root.as_bytes());
        buf.extend_from_slice(&block.header.height.to_le_bytes());
        buf.extend_from_slice(block.header.txs_root.as_bytes());
        Ok(ExecutedState {
            state_root: keccak256(&buf),
            receipts_root: Hash::ZERO,
            checkpoint: block.header.height as u64,
        })
    }

    fn revert_to(&self, _checkpoint: u64) {}
}

struct TestPow {
    propose: AtomicBool,
}

impl TestPow {
    fn new(propose: bool) -> Self {
        Self {
            propose: AtomicBool::new(propose),
        }
    }
}

impl PowOracle for TestPow {
    fn decision(&self) -> PowDecision {
        if self.propose.load(Ordering::Relaxed) {
            PowDecision {
                propose_k_block: true,
                result: Some(PowResult {
                    nonce: 777,
                    raw: vec![0xca, 0xfe],
                    rewards: vec![],
                }),
            }
        } else {
            PowDecision::default()
        }
    }
}

struct MemChain {
    inner: Mutex<MemChainInner>,
}

struct MemChainInner {
    blocks_by_id: HashMap<Hash, Block>,
    blocks_by_number: HashMap<u32, Hash>,
    best: Hash,
    best_qc: QuorumCertificate,
}

impl MemChain {
    fn new(genesis: Block) -> Self {
        let id = genesis.id();
        let mut blocks_by_id = HashMap::new();
        blocks_by_id.insert(id, genesis);
        let mut blocks_by_number = HashMap::new();
        blocks_by_number.insert(0, id);
        Self {
            inner: Mutex::new(MemChainInner {
                blocks_by_id,
                blocks_by_number,
                best: id,
                best_qc: QuorumCertificate::genesis(),
            }),
        }
    }
}

impl ChainStore for MemChain {
    fn best_block(&self) -> Block {
        let inner = self.inner.lock().unwrap();
        inner.blocks_by_id[&inner.best].clone()
    }

    fn best_qc(&self) -> QuorumCertificate {
        self.inner.lock().unwrap().best_qc.clone()
    }

    fn block_by_id(&self, id: &Hash) -> Option<Block> {
        self.inner.lock().unwrap().blocks_by_id.get(id).cloned()
    }

    fn block_by_number(&self, number: u32) -> Option<Block> {
        let inner = self.inner.lock().unwrap();
        inner
            .blocks_by_number
            .get(&number)
            .and_then(|id| inner.blocks_by_id.get(id))
            .cloned()
    }

    fn append(&self, block: &Block, escort_qc: &QuorumCertificate) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().unwrap();
        let id = block.id();
        if inner.blocks_by_id.contains_key(&id) {
            return Err(StoreError::KnownBlock);
        }
        if !inner.blocks_by_id.contains_key(&block.parent_id()) {
            return Err(StoreError::MissingParent);
        }
        inner.blocks_by_id.insert(id, block.clone());
        inner.blocks_by_number.insert(block.number(), id);
        if block.number() > inner.blocks_by_id[&inner.best].number() {
            inner.best = id;
            inner.best_qc = escort_qc.clone();
        }
        Ok(())
    }
}

fn make_genesis() -> Block {
    Block {
        header: BlockHeader {
            height: 0,
            parent_id: Hash::ZERO,
            timestamp: 0,
            block_type: BlockType::MBlock,
            last_k_block_height: 0,
            gas_limit: 20_000_000,
            gas_used: 0,
            total_score: 0,
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

// ═══════════════════════════════════════════════════════════════════════════
// Harness
// ═══════════════════════════════════════════════════════════════════════════

struct TestNode {
    pm: Pacemaker,
    addr: Address,
    chain: Arc<MemChain>,
    epoch_ends: Vec<EpochEndInfo>,
}

enum BusEvent {
    Deliver {
        target: usize,
        mi: IncomingMsg,
    },
    Beat {
        target: usize,
        epoch: u64,
        round: u32,
        reason: BeatReason,
    },
}

struct Harness {
    nodes: Vec<TestNode>,
    queue: VecDeque<BusEvent>,
    /// Nodes whose outbound traffic is silently dropped (fault injection).
    muted: Vec<usize>,
}

impl Harness {
    fn new(n: usize, pow: bool) -> Self {
        let keys: Vec<(BlsKeyPair, NodeKeyPair)> = (0..n)
            .map(|_| (BlsKeyPair::generate(), NodeKeyPair::generate()))
            .collect();
        let validators: Vec<Validator> = keys
            .iter()
            .enumerate()
            .map(|(i, (bls, node))| Validator {
                address: node.address,
                bls_pub_key: bls.public.clone(),
                network_addr: format!("127.0.0.{}", i + 1),
            })
            .collect();
        let committee = Committee::new(0, validators);

        let genesis = make_genesis();
        let mut nodes = Vec::new();
        for (bls, node_key) in keys {
            let addr = node_key.address;
            let chain = Arc::new(MemChain::new(genesis.clone()));
            let oracle = Arc::new(StaticCommittee::new(committee.clone()));
            let config = PacemakerConfig {
                min_m_blocks: 1,
                ..PacemakerConfig::default()
            };
            let pm = Pacemaker::new(
                config,
                bls,
                node_key,
                oracle,
                chain.clone(),
                Arc::new(TestExecutor),
                Arc::new(TestPow::new(pow)),
            );
            nodes.push(TestNode {
                pm,
                addr,
                chain,
                epoch_ends: Vec::new(),
            });
        }

        Self {
            nodes,
            queue: VecDeque::new(),
            muted: Vec::new(),
        }
    }

    fn start(&mut self) {
        for i in 0..self.nodes.len() {
            let actions = self.nodes[i].pm.regulate().unwrap();
            self.enqueue_actions(i, actions);
        }
    }

    fn index_of(&self, addr: &Address) -> Option<usize> {
        self.nodes.iter().position(|n| n.addr == *addr)
    }

    fn wrap(&self, msg: ConsensusMessage, from: usize) -> IncomingMsg {
        IncomingMsg {
            msg,
            peer: self.nodes[from].addr,
            enqueued_at: Instant::now(),
            expire_at: Instant::now() + Duration::from_secs(60),
            requeued: false,
        }
    }

    fn enqueue_actions(&mut self, from: usize, actions: Vec<Action>) {
        if self.muted.contains(&from) {
            return;
        }
        for action in actions {
            match action {
                Action::Broadcast { msg } => {
                    for target in 0..self.nodes.len() {
                        self.queue.push_back(BusEvent::Deliver {
                            target,
                            mi: self.wrap(msg.clone(), from),
                        });
                    }
                }
                Action::Unicast { to, msg } => {
                    if let Some(target) = self.index_of(&to) {
                        self.queue.push_back(BusEvent::Deliver {
                            target,
                            mi: self.wrap(msg, from),
                        });
                    }
                }
                Action::ScheduleBeat {
                    epoch,
                    round,
                    reason,
                    ..
                } => {
                    self.queue.push_back(BusEvent::Beat {
                        target: from,
                        epoch,
                        round,
                        reason,
                    });
                }
                Action::Requeue(mi) => {
                    self.queue.push_back(BusEvent::Deliver { target: from, mi });
                }
                Action::EpochEnd(info) => {
                    self.nodes[from].epoch_ends.push(info);
                }
                Action::StartRoundTimer { .. } | Action::StopRoundTimer => {}
            }
        }
    }

    /// Pump the bus until `pred` holds or `max_steps` events have run.
    fn run_until<F: Fn(&Harness) -> bool>(&mut self, max_steps: usize, pred: F) -> bool {
        for _ in 0..max_steps {
            if pred(self) {
                return true;
            }
            let Some(event) = self.queue.pop_front() else {
                return pred(self);
            };
            match event {
                BusEvent::Deliver { target, mi } => {
                    let actions = self.nodes[target].pm.handle_incoming(mi);
                    self.enqueue_actions(target, actions);
                }
                BusEvent::Beat {
                    target,
                    epoch,
                    round,
                    reason,
                } => {
                    let actions = self.nodes[target].pm.on_beat(epoch, round, reason);
                    self.enqueue_actions(target, actions);
                }
            }
        }
        pred(self)
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Scenarios
// ═══════════════════════════════════════════════════════════════════════════

/// Happy path with n = 4: the pipelined rounds commit height 1 on every
/// replica, with identical block ids (S1).
#[test]
fn happy_path_commits_height_one() {
    let mut harness = Harness::new(4, false);
    harness.start();

    let done = harness.run_until(2000, |h| {
        h.nodes.iter().all(|n| n.chain.best_block().number() >= 1)
    });
    assert!(done, "pipeline should commit height 1 on all replicas");

    let heights: Vec<u32> = harness
        .nodes
        .iter()
        .map(|n| n.chain.best_block().number())
        .collect();
    let max_common = *heights.iter().min().unwrap();
    for h in 1..=max_common {
        let ids: Vec<Hash> = harness
            .nodes
            .iter()
            .map(|n| n.chain.block_by_number(h).unwrap().id())
            .collect();
        assert!(
            ids.windows(2).all(|w| w[0] == w[1]),
            "divergent commit at height {h}"
        );
    }

    // The escort QC stored with the tip verifies against the committee keys
    // named by its bit-array (S5 end to end).
    let committee = harness.nodes[0].pm.committee();
    assert!(harness.nodes[0].chain.best_qc().verify(&committee));
}

/// Proposer of round 0 stays silent; the other three time out, wish into
/// round 1, and the round-1 proposer recovers with a timeout certificate.
#[test]
fn timeout_recovery_via_timeout_certificate() {
    let mut harness = Harness::new(4, false);
    harness.start();
    harness.muted.push(0);
    harness.run_until(200, |_| false);

    // Nothing committed: round 0's proposer is mute.
    assert_eq!(harness.nodes[1].chain.best_block().number(), 0);

    // The three live replicas' round timers expire; each wishes into round 1
    // towards proposer(1).
    for i in 1..4 {
        let actions = harness.nodes[i]
            .pm
            .on_round_timeout(RoundTimeoutInfo { round: 0, counter: 0 });
        harness.enqueue_actions(i, actions);
        assert_eq!(harness.nodes[i].pm.current_round(), 1);
    }

    // Scenario 3: proposer(1) collects the three wish votes, forms a TC, and
    // its next proposal is accepted on the TC path. Receivers vote, so the
    // pipeline advances again (it will stall once rotation returns to the
    // mute proposer, which is the next timeout's problem).
    let recovered = harness.run_until(2000, |h| {
        (1..4).all(|i| h.nodes[i].pm.stats().last_voting_height >= 1)
    });
    assert!(
        recovered,
        "receivers must accept the TC proposal and vote on height 1"
    );
    assert!(harness.nodes[2].pm.current_round() >= 1);
}

/// A committed K-block ends the epoch: EpochEnd fires with the K-block's
/// height and nonce, and Regulate restarts at round 0 on the K-block tip.
#[test]
fn k_block_commit_ends_epoch_and_regulates() {
    let mut harness = Harness::new(4, true);
    harness.start();

    let ended = harness.run_until(2000, |h| !h.nodes[0].epoch_ends.is_empty());
    assert!(ended, "K-block commit must emit EpochEnd");

    let node = &harness.nodes[0];
    let committed_k = node.chain.block_by_number(1).expect("height 1 committed");
    assert!(committed_k.is_k_block());
    assert_eq!(committed_k.last_k_block_height(), 1);

    let info = *node.epoch_ends.first().unwrap();
    assert_eq!(info.height, 1);
    assert_eq!(info.last_k_block_height, 1);
    assert_eq!(info.nonce, 777);
    assert_eq!(info.epoch, 0);

    // At EpochEnd the chain tip is exactly the K-block; Regulate restarts
    // round 0 on top of it in the next epoch.
    assert!(harness.nodes[0].chain.best_block().is_k_block());
    let node = &mut harness.nodes[0];
    node.pm.regulate().unwrap();
    assert_eq!(node.pm.current_round(), 0);
    assert_eq!(node.pm.epoch(), info.epoch + 1);
    let stats = node.pm.stats();
    assert_eq!(stats.last_voting_height, 0);
    assert_eq!(stats.timeout_counter, 0);
}

/// A child proposal arriving before its parent is requeued exactly once,
/// then processed normally once the parent shows up.
#[test]
fn out_of_order_child_is_requeued_once() {
    let mut harness = Harness::new(4, false);
    harness.start();
    harness.queue.clear(); // drive everything by hand

    // Round 0: node 0 proposes height 1.
    let mut parent_proposal = None;
    for action in harness.nodes[0].pm.on_beat(0, 0, BeatReason::OnInit) {
        if let Action::Broadcast { msg } = action {
            parent_proposal = Some(msg);
        }
    }
    let parent_proposal = parent_proposal.expect("round-0 proposal");

    // Deliver it to nodes 0..=2 and funnel their votes to node 1, the
    // proposer of round 1.
    let mut votes = Vec::new();
    for i in 0..3 {
        let mi = harness.wrap(parent_proposal.clone(), 0);
        for action in harness.nodes[i].pm.handle_incoming(mi) {
            if let Action::Unicast { msg, .. } = action {
                votes.push(msg);
            }
        }
    }
    assert_eq!(votes.len(), 3, "three replicas should vote on height 1");

    let mut beat = None;
    for (i, vote) in votes.into_iter().enumerate() {
        let mi = harness.wrap(vote, i);
        for action in harness.nodes[1].pm.handle_incoming(mi) {
            if let Action::ScheduleBeat {
                epoch,
                round,
                reason,
                ..
            } = action
            {
                beat = Some((epoch, round, reason));
            }
        }
    }
    let (epoch, round, reason) = beat.expect("QC over height 1 schedules a beat");

    // Round 1: node 1 proposes height 2.
    let mut child_proposal = None;
    for action in harness.nodes[1].pm.on_beat(epoch, round, reason) {
        if let Action::Broadcast { msg } = action {
            child_proposal = Some(msg);
        }
    }
    let child_proposal = child_proposal.expect("round-1 proposal");

    // Node 3 never saw the parent. Child first: requeued, flagged.
    let mi = harness.wrap(child_proposal.clone(), 1);
    let actions = harness.nodes[3].pm.handle_incoming(mi);
    let requeued = actions
        .iter()
        .find_map(|a| match a {
            Action::Requeue(mi) => Some(mi.clone()),
            _ => None,
        })
        .expect("child without parent must be requeued");
    assert!(requeued.requeued);

    // A second pass while the parent is still missing drops the message
    // instead of looping.
    let actions = harness.nodes[3].pm.handle_incoming(requeued.clone());
    assert!(
        actions.iter().all(|a| !matches!(a, Action::Requeue(_))),
        "requeue happens at most once per message"
    );

    // Parent arrives and node 3 votes on it.
    let mi = harness.wrap(parent_proposal, 0);
    let actions = harness.nodes[3].pm.handle_incoming(mi);
    assert!(actions.iter().any(|a| matches!(a, Action::Unicast { .. })));

    // A fresh copy of the child now resolves its parent and gets a vote.
    let mi = harness.wrap(child_proposal, 1);
    let actions = harness.nodes[3].pm.handle_incoming(mi);
    assert!(
        actions.iter().any(|a| matches!(a, Action::Unicast { .. })),
        "child must be processed normally once the parent is present"
    );
    assert!(actions.iter().all(|a| !matches!(a, Action::Requeue(_))));
}

//! The consensus main loop and epoch controller.
//!
//! A single task owns the pacemaker and multiplexes its inputs with a biased
//! select in strict priority order: command (Regulate) > epoch-end >
//! round-timeout > beat > inbound. The loop never blocks on network I/O;
//! sends are offloaded to the outgoing queue.

use crate::incoming::{IncomingQueue, IN_QUEUE_CAPACITY};
use crate::metrics;
use crate::outgoing::{OutgoingParcel, OutgoingQueue, OUT_QUEUE_CAPACITY, PACEMAKER_PORT};
use crate::server::ServerState;
use crate::timers::{schedule_beat, RoundTimer};
use meridian_bft::{Action, BeatInfo, IncomingMsg, Pacemaker, RoundTimeoutInfo};
use meridian_messages::{ConsensusMessage, Envelope};
use meridian_types::{Address, Committee, EpochEndInfo, NodeSecretKey};
use std::sync::{Arc, RwLock};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error, info, warn};

/// Regulate is the only command; it fully re-seeds the pacemaker.
#[derive(Clone, Copy, Debug)]
pub enum Command {
    Regulate,
}

/// Runtime knobs for the node plumbing.
#[derive(Clone, Debug)]
pub struct NodeConfig {
    /// Port peers listen on for `/pacemaker`.
    pub pacemaker_port: u16,
    pub in_queue_capacity: usize,
    pub out_queue_capacity: usize,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            pacemaker_port: PACEMAKER_PORT,
            in_queue_capacity: IN_QUEUE_CAPACITY,
            out_queue_capacity: OUT_QUEUE_CAPACITY,
        }
    }
}

/// Handle for shutting down a running [`ConsensusRunner`].
///
/// When dropped, signals the runner to exit gracefully.
#[derive(Debug)]
pub struct ShutdownHandle {
    tx: Option<oneshot::Sender<()>>,
}

impl ShutdownHandle {
    /// Trigger shutdown (consumes the handle).
    pub fn shutdown(mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

impl Drop for ShutdownHandle {
    fn drop(&mut self) {
        if let Some(tx) = self.tx.take() {
            let _ = tx.send(());
        }
    }
}

/// Owns the pacemaker and drives it from the multiplexed channels.
pub struct ConsensusRunner {
    pm: Pacemaker,
    node_secret: NodeSecretKey,
    local_address: Address,

    committee: Arc<RwLock<Arc<Committee>>>,
    outgoing: OutgoingQueue,
    incoming: IncomingQueue,
    incoming_rx: mpsc::Receiver<IncomingMsg>,

    cmd_tx: mpsc::Sender<Command>,
    cmd_rx: mpsc::Receiver<Command>,
    epoch_end_tx: mpsc::Sender<EpochEndInfo>,
    epoch_end_rx: mpsc::Receiver<EpochEndInfo>,
    beat_tx: mpsc::Sender<BeatInfo>,
    beat_rx: mpsc::Receiver<BeatInfo>,
    timeout_rx: mpsc::Receiver<RoundTimeoutInfo>,

    round_timer: RoundTimer,
    shutdown_rx: oneshot::Receiver<()>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl ConsensusRunner {
    pub fn new(pm: Pacemaker, node_secret: NodeSecretKey, config: NodeConfig) -> Self {
        let local_address = node_secret.address();
        let (incoming, incoming_rx) = IncomingQueue::channel(config.in_queue_capacity);
        let outgoing =
            OutgoingQueue::with_capacity(config.out_queue_capacity, config.pacemaker_port);
        let (cmd_tx, cmd_rx) = mpsc::channel(2);
        let (epoch_end_tx, epoch_end_rx) = mpsc::channel(2);
        let (beat_tx, beat_rx) = mpsc::channel(8);
        let (timeout_tx, timeout_rx) = mpsc::channel(8);
        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let round_timer = RoundTimer::new(timeout_tx);

        Self {
            committee: Arc::new(RwLock::new(pm.committee())),
            pm,
            node_secret,
            local_address,
            outgoing,
            incoming,
            incoming_rx,
            cmd_tx,
            cmd_rx,
            epoch_end_tx,
            epoch_end_rx,
            beat_tx,
            beat_rx,
            timeout_rx,
            round_timer,
            shutdown_rx,
            shutdown_tx: Some(shutdown_tx),
        }
    }

    /// State shared with the HTTP shim.
    pub fn server_state(&self) -> ServerState {
        ServerState {
            queue: self.incoming.clone(),
            committee: self.committee.clone(),
        }
    }

    /// Take the shutdown handle. Can only be taken once.
    pub fn shutdown_handle(&mut self) -> Option<ShutdownHandle> {
        self.shutdown_tx
            .take()
            .map(|tx| ShutdownHandle { tx: Some(tx) })
    }

    /// Run the main loop until shutdown.
    pub async fn run(mut self) {
        self.outgoing.start();
        metrics::metrics().running.set(1.0);
        info!(address = %self.local_address, "consensus runner started");

        // Startup is a Regulate.
        self.do_regulate();

        loop {
            tokio::select! {
                biased;

                _ = &mut self.shutdown_rx => {
                    info!("shutdown signal received");
                    break;
                }

                Some(cmd) = self.cmd_rx.recv() => {
                    match cmd {
                        Command::Regulate => self.do_regulate(),
                    }
                }

                Some(info) = self.epoch_end_rx.recv() => {
                    info!(
                        height = info.height,
                        nonce = info.nonce,
                        epoch = info.epoch,
                        "handle epoch end"
                    );
                    self.schedule_regulate();
                }

                Some(ti) = self.timeout_rx.recv() => {
                    let actions = self.pm.on_round_timeout(ti);
                    self.process_actions(actions);
                }

                Some(beat) = self.beat_rx.recv() => {
                    let actions = self.pm.on_beat(beat.epoch, beat.round, beat.reason);
                    self.process_actions(actions);
                }

                Some(mi) = self.incoming_rx.recv() => {
                    let actions = self.pm.handle_incoming(mi);
                    self.process_actions(actions);
                }
            }

            metrics::observe_pacemaker(&self.pm.stats());
        }

        // Shutdown: stop the timer, close the outgoing queue and wait for
        // its workers to drain.
        self.round_timer.cancel();
        self.outgoing.shutdown().await;
        metrics::metrics().running.set(0.0);
    }

    /// Regulate the pacemaker into the current epoch and publish the fresh
    /// committee to the HTTP shim.
    fn do_regulate(&mut self) {
        match self.pm.regulate() {
            Ok(actions) => {
                *self.committee.write().expect("committee lock") = self.pm.committee();
                metrics::observe_pacemaker(&self.pm.stats());
                self.process_actions(actions);
            }
            Err(err) => {
                error!(%err, "regulate failed");
            }
        }
    }

    /// Queue a Regulate, making sure it is the very next command: anything
    /// still pending is drained first so at most one Regulate is queued.
    fn schedule_regulate(&mut self) {
        while self.cmd_rx.try_recv().is_ok() {}
        if self.cmd_tx.try_send(Command::Regulate).is_err() {
            warn!("command channel full, regulate dropped");
        }
    }

    fn process_actions(&mut self, actions: Vec<Action>) {
        for action in actions {
            self.process_action(action);
        }
    }

    fn process_action(&mut self, action: Action) {
        match action {
            Action::Broadcast { msg } => self.broadcast(msg),
            Action::Unicast { to, msg } => self.unicast(to, msg),
            Action::StartRoundTimer {
                round,
                counter,
                interval,
            } => {
                self.round_timer.reset(round, counter, interval);
            }
            Action::StopRoundTimer => self.round_timer.cancel(),
            Action::ScheduleBeat {
                epoch,
                round,
                reason,
                delay,
            } => {
                schedule_beat(
                    self.beat_tx.clone(),
                    BeatInfo {
                        epoch,
                        round,
                        reason,
                    },
                    delay,
                );
            }
            Action::EpochEnd(info) => {
                if self.epoch_end_tx.try_send(info).is_err() {
                    debug!("epoch end already pending");
                }
            }
            Action::Requeue(mi) => {
                self.incoming.requeue(mi);
            }
        }
    }

    /// Send to every committee member; the local replica receives its copy
    /// through the incoming queue directly.
    fn broadcast(&self, msg: ConsensusMessage) {
        let committee = self.committee.read().expect("committee lock").clone();
        let body = Envelope::seal(&msg, &self.node_secret).encode();
        for member in committee.members() {
            if member.address == self.local_address {
                self.incoming.add(msg.clone(), self.local_address);
                continue;
            }
            self.outgoing.add(OutgoingParcel::new(
                member.network_addr.clone(),
                msg.type_name(),
                body.clone(),
                false,
            ));
        }
    }

    fn unicast(&self, to: Address, msg: ConsensusMessage) {
        if to == self.local_address {
            self.incoming.add(msg, self.local_address);
            return;
        }
        let committee = self.committee.read().expect("committee lock").clone();
        let Some(index) = committee.index_of(&to) else {
            warn!(%to, "unicast target not in committee, dropped");
            return;
        };
        let member = committee
            .member_at(index as usize)
            .expect("index from index_of");
        let body = Envelope::seal(&msg, &self.node_secret).encode();
        self.outgoing.add(OutgoingParcel::new(
            member.network_addr.clone(),
            msg.type_name(),
            body,
            false,
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryChainStore;
    use meridian_bft::{
        BlockExecutor, ExecutedState, ExecutionError, PacemakerConfig, PowDecision, PowOracle,
    };
    use meridian_types::{
        keccak256, Block, BlockHeader, BlockType, BlsKeyPair, Hash, NodeKeyPair,
        QuorumCertificate, StaticCommittee, Validator, BLOCK_MAGIC,
    };
    use std::time::Duration;

    struct TestExecutor;
    impl BlockExecutor for TestExecutor {
        fn execute(
            &self,
            parent: &BlockHeader,
            block: &Block,
            _now: u64,
        ) -> Result<ExecutedState, ExecutionError> {
            let mut buf = Vec::new();
            buf.extend_from_slice(parent.state_root.as_bytes());
            buf.extend_from_slice(&block.header.height.to_le_bytes());
            Ok(ExecutedState {
                state_root: keccak256(&buf),
                receipts_root: Hash::ZERO,
                checkpoint: block.header.height as u64,
            })
        }
        fn revert_to(&self, _checkpoint: u64) {}
    }

    struct NeverPow;
    impl PowOracle for NeverPow {
        fn decision(&self) -> PowDecision {
            PowDecision::default()
        }
    }

    fn make_runner() -> ConsensusRunner {
        let bls = BlsKeyPair::generate();
        let node_key = NodeKeyPair::generate();
        let committee = Committee::new(
            0,
            vec![Validator {
                address: node_key.address,
                bls_pub_key: bls.public.clone(),
                network_addr: "127.0.0.1".to_string(),
            }],
        );
        let genesis = Block {
            header: BlockHeader {
                height: 0,
                parent_id: Hash::ZERO,
                timestamp: 0,
                block_type: BlockType::MBlock,
                last_k_block_height: 0,
                gas_limit: 1000,
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
        };
        let secret = node_key.secret.clone();
        let pm = Pacemaker::new(
            PacemakerConfig::default(),
            bls,
            node_key,
            Arc::new(StaticCommittee::new(committee)),
            Arc::new(MemoryChainStore::new(genesis)),
            Arc::new(TestExecutor),
            Arc::new(NeverPow),
        );
        ConsensusRunner::new(pm, secret, NodeConfig::default())
    }

    #[tokio::test]
    async fn runner_starts_and_shuts_down() {
        let mut runner = make_runner();
        let handle = runner.shutdown_handle().expect("first take succeeds");
        assert!(runner.shutdown_handle().is_none());

        let task = tokio::spawn(runner.run());
        tokio::time::sleep(Duration::from_millis(50)).await;
        handle.shutdown();

        tokio::time::timeout(Duration::from_secs(2), task)
            .await
            .expect("runner should exit on shutdown")
            .expect("runner task should not panic");
    }

    #[tokio::test]
    async fn runner_publishes_committee_to_server_state() {
        let mut runner = make_runner();
        let handle = runner.shutdown_handle().unwrap();
        let state = runner.server_state();
        let task = tokio::spawn(runner.run());

        tokio::time::sleep(Duration::from_millis(300)).await;
        handle.shutdown();
        let _ = tokio::time::timeout(Duration::from_secs(2), task).await;

        // The committee snapshot was published for the HTTP shim.
        assert_eq!(state.committee.read().unwrap().size(), 1);
    }
}

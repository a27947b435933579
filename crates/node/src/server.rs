//! Inbound HTTP shim.
//!
//! Peers POST sealed envelopes to `/pacemaker`; the shim opens the envelope,
//! checks committee membership of the recovered sender, and pushes the
//! message onto the incoming queue with a fresh deadline. `/metrics` serves
//! the prometheus registry.

use crate::incoming::IncomingQueue;
use crate::metrics;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::Router;
use meridian_messages::Envelope;
use meridian_types::Committee;
use std::net::SocketAddr;
use std::sync::{Arc, RwLock};
use tracing::{debug, info, warn};

/// Shared state for the HTTP handlers.
#[derive(Clone)]
pub struct ServerState {
    pub queue: IncomingQueue,
    /// Swapped by the runner on every Regulate.
    pub committee: Arc<RwLock<Arc<Committee>>>,
}

pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/pacemaker", post(handle_pacemaker))
        .route("/metrics", get(handle_metrics))
        .with_state(state)
}

/// Bind and serve until the process shuts down.
pub async fn serve(addr: SocketAddr, state: ServerState) -> std::io::Result<()> {
    let listener = tokio::net::TcpListener::bind(addr).await?;
    info!(%addr, "pacemaker endpoint listening");
    axum::serve(listener, router(state)).await
}

async fn handle_pacemaker(State(state): State<ServerState>, body: Bytes) -> StatusCode {
    let (msg, sender) = match Envelope::open(&body) {
        Ok(opened) => opened,
        Err(err) => {
            warn!(%err, "dropping malformed envelope");
            metrics::metrics()
                .msgs_dropped
                .with_label_values(&["decode"])
                .inc();
            return StatusCode::BAD_REQUEST;
        }
    };

    let committee = state.committee.read().expect("committee lock").clone();
    if committee.index_of(&sender).is_none() {
        warn!(%sender, msg = %msg, "dropping envelope from non-committee sender");
        metrics::metrics()
            .msgs_dropped
            .with_label_values(&["unknown_sender"])
            .inc();
        return StatusCode::FORBIDDEN;
    }

    debug!(%sender, msg = %msg, "accepted inbound msg");
    metrics::metrics().msgs_received.inc();
    state.queue.add(msg, sender);
    StatusCode::OK
}

async fn handle_metrics() -> String {
    metrics::gather()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::incoming::IncomingQueue;
    use meridian_messages::{ConsensusMessage, VoteMessage};
    use meridian_types::{keccak256, BlsKeyPair, Hash, NodeKeyPair, Validator};

    fn make_state(member: &NodeKeyPair) -> (ServerState, tokio::sync::mpsc::Receiver<meridian_bft::IncomingMsg>) {
        let (queue, rx) = IncomingQueue::channel(16);
        let committee = Committee::new(
            0,
            vec![Validator {
                address: member.address,
                bls_pub_key: BlsKeyPair::generate().public,
                network_addr: "127.0.0.1".to_string(),
            }],
        );
        (
            ServerState {
                queue,
                committee: Arc::new(RwLock::new(Arc::new(committee))),
            },
            rx,
        )
    }

    fn make_msg() -> ConsensusMessage {
        ConsensusMessage::Vote(VoteMessage {
            epoch: 0,
            vote_height: 1,
            vote_round: 0,
            vote_block_id: keccak256(b"b"),
            signer_index: 0,
            vote_signature: vec![0; 96],
            vote_hash: Hash::ZERO,
            timestamp: 0,
        })
    }

    #[tokio::test]
    async fn committee_envelope_is_enqueued() {
        let member = NodeKeyPair::generate();
        let (state, mut rx) = make_state(&member);
        let bytes = Envelope::seal(&make_msg(), &member.secret).encode();

        let status = handle_pacemaker(State(state), Bytes::from(bytes)).await;
        assert_eq!(status, StatusCode::OK);
        let mi = rx.recv().await.unwrap();
        assert_eq!(mi.peer, member.address);
    }

    #[tokio::test]
    async fn non_committee_sender_is_rejected() {
        let member = NodeKeyPair::generate();
        let outsider = NodeKeyPair::generate();
        let (state, mut rx) = make_state(&member);
        let bytes = Envelope::seal(&make_msg(), &outsider.secret).encode();

        let status = handle_pacemaker(State(state), Bytes::from(bytes)).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_envelope_is_rejected() {
        let member = NodeKeyPair::generate();
        let (state, mut rx) = make_state(&member);

        let status = handle_pacemaker(State(state), Bytes::from(vec![0u8; 8])).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(rx.try_recv().is_err());
    }
}

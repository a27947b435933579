//! Outer wire envelope.
//!
//! # Wire Format
//!
//! ```text
//! [magic: 4 bytes][type: u8][payload_len: u32 LE][payload][sender_signature: 65 bytes]
//! ```
//!
//! The payload is the bincode encoding of a [`ConsensusMessage`]; the sender
//! signature is a recoverable secp256k1 signature over the message's
//! canonical signing hash. Opening an envelope yields the message and the
//! recovered sender address — a mismatch anywhere is a peer-level violation
//! and the payload is dropped.

use crate::ConsensusMessage;
use meridian_types::{Address, NodeSecretKey, SenderSignature};
use thiserror::Error;

/// Envelope magic for the current protocol generation.
pub const ENVELOPE_MAGIC: [u8; 4] = [0x4d, 0x52, 0x44, 0x01];

const HEADER_LEN: usize = 4 + 1 + 4;
const SIGNATURE_LEN: usize = 65;

/// Errors from envelope encoding/decoding.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("bad envelope magic")]
    BadMagic,
    #[error("unknown message type {0}")]
    UnknownType(u8),
    #[error("envelope truncated")]
    Truncated,
    #[error("payload decode error: {0}")]
    Payload(#[source] bincode::Error),
    #[error("type byte {wire} does not match payload type {payload}")]
    TypeMismatch { wire: u8, payload: u8 },
    #[error("sender signature invalid")]
    Signature,
}

/// A sealed consensus message ready for transport.
#[derive(Clone, Debug)]
pub struct Envelope {
    pub magic: [u8; 4],
    pub msg_type: u8,
    pub payload: Vec<u8>,
    pub sender_signature: SenderSignature,
}

impl Envelope {
    /// Sign and frame a message.
    pub fn seal(msg: &ConsensusMessage, key: &NodeSecretKey) -> Self {
        let sender_signature = key.sign_recoverable(&msg.signing_hash());
        Self {
            magic: ENVELOPE_MAGIC,
            msg_type: msg.type_byte(),
            payload: msg.encode(),
            sender_signature,
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut out =
            Vec::with_capacity(HEADER_LEN + self.payload.len() + SIGNATURE_LEN);
        out.extend_from_slice(&self.magic);
        out.push(self.msg_type);
        out.extend_from_slice(&(self.payload.len() as u32).to_le_bytes());
        out.extend_from_slice(&self.payload);
        out.extend_from_slice(&self.sender_signature.0);
        out
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, CodecError> {
        if bytes.len() < HEADER_LEN + SIGNATURE_LEN {
            return Err(CodecError::Truncated);
        }
        let mut magic = [0u8; 4];
        magic.copy_from_slice(&bytes[..4]);
        if magic != ENVELOPE_MAGIC {
            return Err(CodecError::BadMagic);
        }
        let msg_type = bytes[4];
        if !(1..=3).contains(&msg_type) {
            return Err(CodecError::UnknownType(msg_type));
        }
        let len = u32::from_le_bytes(bytes[5..9].try_into().expect("4 bytes")) as usize;
        if bytes.len() != HEADER_LEN + len + SIGNATURE_LEN {
            return Err(CodecError::Truncated);
        }
        let payload = bytes[HEADER_LEN..HEADER_LEN + len].to_vec();
        let mut sig = [0u8; SIGNATURE_LEN];
        sig.copy_from_slice(&bytes[HEADER_LEN + len..]);
        Ok(Self {
            magic,
            msg_type,
            payload,
            sender_signature: SenderSignature(sig),
        })
    }

    /// Verify the envelope and recover the sender.
    ///
    /// Checks that the wire type byte matches the decoded payload and that
    /// the sender signature recovers over the canonical signing hash.
    pub fn open(bytes: &[u8]) -> Result<(ConsensusMessage, Address), CodecError> {
        let envelope = Self::decode(bytes)?;
        let msg = ConsensusMessage::decode(&envelope.payload)?;
        if msg.type_byte() != envelope.msg_type {
            return Err(CodecError::TypeMismatch {
                wire: envelope.msg_type,
                payload: msg.type_byte(),
            });
        }
        let sender = envelope
            .sender_signature
            .recover(&msg.signing_hash())
            .map_err(|_| CodecError::Signature)?;
        Ok((msg, sender))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::VoteMessage;
    use meridian_types::{keccak256, NodeKeyPair};

    fn make_msg() -> ConsensusMessage {
        ConsensusMessage::Vote(VoteMessage {
            epoch: 1,
            vote_height: 2,
            vote_round: 0,
            vote_block_id: keccak256(b"id"),
            signer_index: 0,
            vote_signature: vec![7; 96],
            vote_hash: keccak256(b"hash"),
            timestamp: 42,
        })
    }

    #[test]
    fn seal_open_recovers_sender() {
        let kp = NodeKeyPair::generate();
        let msg = make_msg();
        let bytes = Envelope::seal(&msg, &kp.secret).encode();

        let (opened, sender) = Envelope::open(&bytes).unwrap();
        assert_eq!(opened, msg);
        assert_eq!(sender, kp.address);
    }

    #[test]
    fn tampered_payload_changes_recovered_sender() {
        let kp = NodeKeyPair::generate();
        let mut bytes = Envelope::seal(&make_msg(), &kp.secret).encode();
        // Flip a byte in the middle of the payload.
        let mid = bytes.len() / 2;
        bytes[mid] ^= 0xff;

        match Envelope::open(&bytes) {
            Ok((_, sender)) => assert_ne!(sender, kp.address),
            Err(_) => {}
        }
    }

    #[test]
    fn bad_magic_is_rejected() {
        let kp = NodeKeyPair::generate();
        let mut bytes = Envelope::seal(&make_msg(), &kp.secret).encode();
        bytes[0] = 0x00;
        assert!(matches!(Envelope::open(&bytes), Err(CodecError::BadMagic)));
    }

    #[test]
    fn truncated_envelope_is_rejected() {
        let kp = NodeKeyPair::generate();
        let bytes = Envelope::seal(&make_msg(), &kp.secret).encode();
        assert!(matches!(
            Envelope::open(&bytes[..bytes.len() - 10]),
            Err(CodecError::Truncated)
        ));
    }

    #[test]
    fn unknown_type_byte_is_rejected() {
        let kp = NodeKeyPair::generate();
        let mut bytes = Envelope::seal(&make_msg(), &kp.secret).encode();
        bytes[4] = 9;
        assert!(matches!(
            Envelope::open(&bytes),
            Err(CodecError::UnknownType(9))
        ));
    }
}

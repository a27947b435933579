//! Cryptographic primitives for consensus.
//!
//! Two schemes are in play:
//!
//! - **BLS12-381** (via `blst::min_pk`) for votes. Per-signer signatures
//!   aggregate into a single 96-byte signature; the committee bit-array is the
//!   only witness needed to rebuild the aggregate public key.
//! - **secp256k1** (via `k256`) for the sender-level envelope signature. The
//!   65-byte recoverable form lets receivers derive the sender address without
//!   a lookup.
//!
//! The BLS system parameters are fixed at the curve level, so a key pair
//! handle can be shared by reference across verification sites.

use crate::hash::{keccak256, Hash};
use blst::min_pk::{
    AggregatePublicKey, AggregateSignature, PublicKey as BlstPublicKey,
    SecretKey as BlstSecretKey, Signature as BlstSignature,
};
use blst::BLST_ERROR;
use k256::ecdsa::{RecoveryId, Signature as K256Signature, SigningKey, VerifyingKey};
use k256::elliptic_curve::sec1::ToEncodedPoint;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

pub const BLS_SIGNATURE_SIZE: usize = 96;
pub const BLS_PUBLIC_KEY_SIZE: usize = 48;
pub const SENDER_SIGNATURE_SIZE: usize = 65;
pub const ADDRESS_SIZE: usize = 20;

/// Domain separation tag for all BLS signatures in the protocol.
const BLS_DST: &[u8] = b"MERIDIAN_BFT_BLS_SIG_V1";

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid key bytes")]
    InvalidKey,
    #[error("invalid signature bytes")]
    InvalidSignature,
    #[error("signature recovery failed")]
    RecoveryFailed,
}

#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("invalid signature in aggregation input")]
    InvalidSignature,
    #[error("empty aggregation input")]
    Empty,
}

// ═══════════════════════════════════════════════════════════════════════════
// BLS (vote signatures)
// ═══════════════════════════════════════════════════════════════════════════

/// BLS secret key.
#[derive(Clone)]
pub struct BlsSecretKey {
    inner: BlstSecretKey,
}

impl BlsSecretKey {
    /// Generate a fresh key from OS randomness.
    pub fn generate() -> Self {
        let mut ikm = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut ikm);
        Self {
            inner: BlstSecretKey::key_gen(&ikm, &[]).expect("ikm is 32 bytes"),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let inner = BlstSecretKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn public_key(&self) -> BlsPublicKey {
        BlsPublicKey {
            inner: self.inner.sk_to_pk(),
        }
    }

    /// Sign a 32-byte message hash.
    pub fn sign(&self, hash: &Hash) -> BlsSignature {
        BlsSignature {
            inner: self.inner.sign(hash.as_bytes(), BLS_DST, &[]),
        }
    }
}

/// BLS public key (48 bytes compressed).
#[derive(Clone, PartialEq, Eq)]
pub struct BlsPublicKey {
    inner: BlstPublicKey,
}

impl BlsPublicKey {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let inner = BlstPublicKey::from_bytes(bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }

    /// Verify a per-signer signature over a 32-byte message hash.
    pub fn verify(&self, hash: &Hash, sig: &BlsSignature) -> bool {
        sig.inner
            .verify(true, hash.as_bytes(), BLS_DST, &[], &self.inner, true)
            == BLST_ERROR::BLST_SUCCESS
    }
}

impl fmt::Debug for BlsPublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsPublicKey({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// BLS signature (96 bytes).
#[derive(Clone, PartialEq, Eq)]
pub struct BlsSignature {
    inner: BlstSignature,
}

impl BlsSignature {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let inner = BlstSignature::from_bytes(bytes).map_err(|_| CryptoError::InvalidSignature)?;
        Ok(Self { inner })
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.inner.to_bytes().to_vec()
    }
}

impl fmt::Debug for BlsSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BlsSignature({})", hex::encode(&self.to_bytes()[..8]))
    }
}

/// BLS key pair.
#[derive(Clone)]
pub struct BlsKeyPair {
    pub secret: BlsSecretKey,
    pub public: BlsPublicKey,
}

impl BlsKeyPair {
    pub fn generate() -> Self {
        let secret = BlsSecretKey::generate();
        let public = secret.public_key();
        Self { secret, public }
    }
}

/// Aggregate per-signer signatures into a single compact signature.
///
/// Aggregation is order-independent. Fails with `InvalidSignature` if any
/// input fails group validation.
pub fn aggregate_signatures(sigs: &[BlsSignature]) -> Result<BlsSignature, AggregateError> {
    if sigs.is_empty() {
        return Err(AggregateError::Empty);
    }
    let refs: Vec<&BlstSignature> = sigs.iter().map(|s| &s.inner).collect();
    let agg = AggregateSignature::aggregate(&refs, true)
        .map_err(|_| AggregateError::InvalidSignature)?;
    Ok(BlsSignature {
        inner: agg.to_signature(),
    })
}

/// Verify an aggregated signature against the aggregate public key of the
/// given signers over a 32-byte message hash.
pub fn verify_aggregate(signers: &[BlsPublicKey], hash: &Hash, agg: &BlsSignature) -> bool {
    if signers.is_empty() {
        return false;
    }
    let refs: Vec<&BlstPublicKey> = signers.iter().map(|p| &p.inner).collect();
    let agg_pk = match AggregatePublicKey::aggregate(&refs, true) {
        Ok(pk) => pk.to_public_key(),
        Err(_) => return false,
    };
    agg.inner
        .verify(true, hash.as_bytes(), BLS_DST, &[], &agg_pk, true)
        == BLST_ERROR::BLST_SUCCESS
}

// ═══════════════════════════════════════════════════════════════════════════
// secp256k1 (sender-level envelope signatures)
// ═══════════════════════════════════════════════════════════════════════════

/// 20-byte account-style address derived from a secp256k1 public key.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    pub const ZERO: Address = Address([0u8; ADDRESS_SIZE]);

    pub fn from_public_key(key: &VerifyingKey) -> Self {
        // Uncompressed SEC1 encoding is 0x04 || x || y; the address is the
        // last 20 bytes of keccak(x || y).
        let encoded = key.to_encoded_point(false);
        let digest = keccak256(&encoded.as_bytes()[1..]);
        let mut out = [0u8; ADDRESS_SIZE];
        out.copy_from_slice(&digest.as_bytes()[12..]);
        Address(out)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(&self.0[..4]))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address(0x{})", hex::encode(self.0))
    }
}

/// Recoverable sender signature: 64-byte signature plus 1-byte recovery id.
#[derive(Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SenderSignature(#[serde(with = "serde_bytes_65")] pub [u8; SENDER_SIGNATURE_SIZE]);

impl SenderSignature {
    /// Recover the signing address from the signature and the signed hash.
    pub fn recover(&self, hash: &Hash) -> Result<Address, CryptoError> {
        let sig = K256Signature::from_slice(&self.0[..64])
            .map_err(|_| CryptoError::InvalidSignature)?;
        let recid =
            RecoveryId::from_byte(self.0[64]).ok_or(CryptoError::InvalidSignature)?;
        let key = VerifyingKey::recover_from_prehash(hash.as_bytes(), &sig, recid)
            .map_err(|_| CryptoError::RecoveryFailed)?;
        Ok(Address::from_public_key(&key))
    }
}

impl fmt::Debug for SenderSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SenderSignature({})", hex::encode(&self.0[..8]))
    }
}

/// secp256k1 secret key for the node identity.
#[derive(Clone)]
pub struct NodeSecretKey {
    inner: SigningKey,
}

impl NodeSecretKey {
    pub fn generate() -> Self {
        Self {
            inner: SigningKey::random(&mut rand::thread_rng()),
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, CryptoError> {
        let inner = SigningKey::from_slice(bytes).map_err(|_| CryptoError::InvalidKey)?;
        Ok(Self { inner })
    }

    pub fn address(&self) -> Address {
        Address::from_public_key(self.inner.verifying_key())
    }

    /// Sign a 32-byte hash, producing the 65-byte recoverable form.
    pub fn sign_recoverable(&self, hash: &Hash) -> SenderSignature {
        let (sig, recid) = self
            .inner
            .sign_prehash_recoverable(hash.as_bytes())
            .expect("prehash is 32 bytes");
        let mut out = [0u8; SENDER_SIGNATURE_SIZE];
        out[..64].copy_from_slice(&sig.to_bytes());
        out[64] = recid.to_byte();
        SenderSignature(out)
    }
}

/// Node identity key pair (secp256k1) plus derived address.
#[derive(Clone)]
pub struct NodeKeyPair {
    pub secret: NodeSecretKey,
    pub address: Address,
}

impl NodeKeyPair {
    pub fn generate() -> Self {
        let secret = NodeSecretKey::generate();
        let address = secret.address();
        Self { secret, address }
    }
}

/// Fixed-size serde helper for the 65-byte signature.
mod serde_bytes_65 {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 65], s: S) -> Result<S::Ok, S::Error> {
        s.serialize_bytes(bytes)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<[u8; 65], D::Error> {
        let v: Vec<u8> = Vec::deserialize(d)?;
        if v.len() != 65 {
            return Err(D::Error::custom("expected 65 bytes"));
        }
        let mut out = [0u8; 65];
        out.copy_from_slice(&v);
        Ok(out)
    }
}

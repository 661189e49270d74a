//! # Hashing and Signatures
//!
//! - **Hostname hashing**: BLAKE3 truncated to 128 bits ([`HostnameHash`]),
//!   with a 32-bit fold for local cache keys
//! - **Signatures**: Domain-separated Ed25519 signing and verification
//!
//! Domain separation prevents a signature over a registration from being
//! replayed as any other signed structure.

use ed25519_dalek::{Signature, VerifyingKey};
use serde::{Deserialize, Serialize};

use crate::identity::{Keypair, PublicKey};

/// Domain separation prefix for registration request signatures.
pub const REGISTER_SIGNATURE_DOMAIN: &[u8] = b"andna-register-v1:";

/// Length of a full hostname hash in bytes.
pub const HASH_LEN: usize = 16;

/// Error type for signature verification failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureError {
    /// Signature is missing (empty).
    Missing,
    /// Signature has invalid length (expected 64 bytes for Ed25519).
    InvalidLength,
    /// Cryptographic verification failed.
    VerificationFailed,
    /// The public key is not a valid Ed25519 point.
    InvalidPublicKey,
}

impl std::fmt::Display for SignatureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureError::Missing => write!(f, "signature is missing"),
            SignatureError::InvalidLength => write!(f, "signature has invalid length"),
            SignatureError::VerificationFailed => write!(f, "signature verification failed"),
            SignatureError::InvalidPublicKey => write!(f, "invalid public key"),
        }
    }
}

impl std::error::Error for SignatureError {}

/// Fixed-width digest of a hostname (or of a peer address, for counter-node
/// placement).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct HostnameHash([u8; HASH_LEN]);

impl HostnameHash {
    #[inline]
    pub fn from_bytes(bytes: [u8; HASH_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; HASH_LEN] {
        &self.0
    }

    /// Hash of a hostname. Hostnames are case-insensitive.
    pub fn of_hostname(hostname: &str) -> Self {
        hash_fixed(hostname.to_ascii_lowercase().as_bytes())
    }

    /// 32-bit digest used as key by the local and resolved-name caches.
    pub fn short(&self) -> u32 {
        fold_32(&self.0)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }
}

impl std::fmt::Debug for HostnameHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "HostnameHash({})", hex::encode(&self.0[..8]))
    }
}

impl std::fmt::Display for HostnameHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", hex::encode(self.0))
    }
}

pub fn hash_fixed(data: &[u8]) -> HostnameHash {
    let digest = blake3::hash(data);
    let mut out = [0u8; HASH_LEN];
    out.copy_from_slice(&digest.as_bytes()[..HASH_LEN]);
    HostnameHash(out)
}

pub fn hash_32(data: &[u8]) -> u32 {
    hash_fixed(data).short()
}

fn fold_32(bytes: &[u8; HASH_LEN]) -> u32 {
    bytes
        .chunks_exact(4)
        .map(|w| u32::from_be_bytes([w[0], w[1], w[2], w[3]]))
        .fold(0, |acc, w| acc ^ w)
}

/// Sign data with domain separation.
pub fn sign_with_domain(keypair: &Keypair, domain: &[u8], data: &[u8]) -> Vec<u8> {
    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);
    keypair.sign(&prefixed).to_bytes().to_vec()
}

/// Verify a signature with domain separation against an embedded public key.
pub fn verify_with_domain(
    public_key: &PublicKey,
    domain: &[u8],
    data: &[u8],
    signature: &[u8],
) -> Result<(), SignatureError> {
    if signature.is_empty() {
        return Err(SignatureError::Missing);
    }
    let sig_bytes: [u8; 64] = signature
        .try_into()
        .map_err(|_| SignatureError::InvalidLength)?;
    let verifying_key = VerifyingKey::from_bytes(public_key.as_bytes())
        .map_err(|_| SignatureError::InvalidPublicKey)?;
    let sig = Signature::from_bytes(&sig_bytes);

    let mut prefixed = Vec::with_capacity(domain.len() + data.len());
    prefixed.extend_from_slice(domain);
    prefixed.extend_from_slice(data);

    verifying_key
        .verify_strict(&prefixed, &sig)
        .map_err(|_| SignatureError::VerificationFailed)
}

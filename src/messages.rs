//! # Wire Protocol Messages
//!
//! Every message exchanged between ANDNA peers, and the bincode codec used to
//! put them on the wire. Deserialization is always size-bounded.
//!
//! | Request | Response |
//! |---------|----------|
//! | `Register` | [`RegisterReply`] |
//! | `CheckCounter` | [`CounterReply`] |
//! | `Resolve` | [`ResolveResponse`] |
//! | `ReverseResolve` | [`ReverseResolveReply`] |
//! | `GetSingleCache` | `SingleCache(Option<AndnaCacheEntry>)` |
//! | `SpreadCache` | `Ack` |
//! | `GetFullCache` | [`FullCacheReply`] |
//!
//! ## Signatures
//!
//! A registration is signed over its identifying fields plus a BLAKE3 digest
//! of its service records. The digest travels in counter checks so the
//! counter peer can verify the registrant's signature without receiving the
//! records. The `forward` and `flooded` routing flags are not signed: relays
//! and flood senders rewrite them.

use bincode::Options;
use rand::RngCore;
use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::cache::{AndnaCacheEntry, CounterCacheEntry};
use crate::crypto::{self, HostnameHash, REGISTER_SIGNATURE_DOMAIN, SignatureError};
use crate::error::AndnaError;
use crate::identity::{Keypair, PublicKey};
use crate::records::{ServiceRecord, ServiceSelector};
use crate::topology::PeerAddress;

/// Maximum encoded message size. Full-cache transfers are the largest
/// messages and stay well below it with default bounds.
pub const MAX_MESSAGE_SIZE: u64 = 4 * 1024 * 1024;

/// Returns bincode options with size limits enforced.
/// SECURITY: Always use this for deserialization to prevent OOM attacks.
fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_MESSAGE_SIZE)
        .with_fixint_encoding()
}

pub fn serialize<T: Serialize>(value: &T) -> Result<Vec<u8>, bincode::Error> {
    bincode_options().serialize(value)
}

/// Deserialize with size bounds enforced.
/// SECURITY: Use this instead of raw bincode::deserialize.
pub fn deserialize_bounded<T: DeserializeOwned>(bytes: &[u8]) -> Result<T, bincode::Error> {
    bincode_options().deserialize(bytes)
}

pub fn new_request_id() -> u64 {
    rand::rngs::OsRng.next_u64()
}

/// BLAKE3 of the bincode encoding of a record list.
pub fn records_digest(records: &[ServiceRecord]) -> [u8; 32] {
    let encoded = serialize(&records).unwrap_or_default();
    *blake3::hash(&encoded).as_bytes()
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFlags {
    /// The requester already holds this hostname and is refreshing it.
    pub update: bool,
    /// Remove the listed records instead of replacing the record set.
    pub delete: bool,
}

/// Fields covered by a registration signature.
#[derive(Serialize)]
struct SignedRegistration {
    request_id: u64,
    requester: PeerAddress,
    hostname_hash: HostnameHash,
    public_key: PublicKey,
    update_counter: u32,
    records_digest: [u8; 32],
    flags: RegisterFlags,
}

impl SignedRegistration {
    fn encode(&self) -> Vec<u8> {
        serialize(self).unwrap_or_default()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub request_id: u64,
    pub requester: PeerAddress,
    pub hostname_hash: HostnameHash,
    pub public_key: PublicKey,
    pub update_counter: u32,
    pub records: Vec<ServiceRecord>,
    pub flags: RegisterFlags,
    /// Set when the receiver is a border peer that must relay the request.
    pub forward: bool,
    /// Set on group re-broadcasts of an accepted registration.
    pub flooded: bool,
    pub signature: Vec<u8>,
}

impl RegisterRequest {
    /// Builds and signs a fresh registration.
    pub fn signed(
        keypair: &Keypair,
        requester: PeerAddress,
        hostname_hash: HostnameHash,
        update_counter: u32,
        records: Vec<ServiceRecord>,
        flags: RegisterFlags,
    ) -> Self {
        let mut request = Self {
            request_id: new_request_id(),
            requester,
            hostname_hash,
            public_key: keypair.public_key(),
            update_counter,
            records,
            flags,
            forward: false,
            flooded: false,
            signature: Vec::new(),
        };
        request.signature =
            crypto::sign_with_domain(keypair, REGISTER_SIGNATURE_DOMAIN, &request.signed_payload());
        request
    }

    fn signed_payload(&self) -> Vec<u8> {
        SignedRegistration {
            request_id: self.request_id,
            requester: self.requester,
            hostname_hash: self.hostname_hash,
            public_key: self.public_key,
            update_counter: self.update_counter,
            records_digest: records_digest(&self.records),
            flags: self.flags,
        }
        .encode()
    }

    pub fn verify(&self) -> Result<(), SignatureError> {
        crypto::verify_with_domain(
            &self.public_key,
            REGISTER_SIGNATURE_DOMAIN,
            &self.signed_payload(),
            &self.signature,
        )
    }

    /// The counter-check derived from this registration.
    pub fn counter_check(&self, hash_owner: PeerAddress, just_check: bool) -> CheckCounterRequest {
        CheckCounterRequest {
            request_id: self.request_id,
            requester: self.requester,
            hostname_hash: self.hostname_hash,
            public_key: self.public_key,
            update_counter: self.update_counter,
            records_digest: records_digest(&self.records),
            flags: self.flags,
            signature: self.signature.clone(),
            hash_owner,
            just_check,
            forward: false,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum RegisterReply {
    Accepted { update_counter: u32 },
    Rejected(AndnaError),
    /// Already processed under the same request id.
    Ignored,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckCounterRequest {
    pub request_id: u64,
    pub requester: PeerAddress,
    pub hostname_hash: HostnameHash,
    pub public_key: PublicKey,
    pub update_counter: u32,
    pub records_digest: [u8; 32],
    pub flags: RegisterFlags,
    pub signature: Vec<u8>,
    /// Hash-gnode that asked for the check.
    pub hash_owner: PeerAddress,
    /// Verify without advancing the stored counter.
    pub just_check: bool,
    pub forward: bool,
}

impl CheckCounterRequest {
    pub fn verify(&self) -> Result<(), SignatureError> {
        let payload = SignedRegistration {
            request_id: self.request_id,
            requester: self.requester,
            hostname_hash: self.hostname_hash,
            public_key: self.public_key,
            update_counter: self.update_counter,
            records_digest: self.records_digest,
            flags: self.flags,
        }
        .encode();
        crypto::verify_with_domain(
            &self.public_key,
            REGISTER_SIGNATURE_DOMAIN,
            &payload,
            &self.signature,
        )
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CounterReply {
    Accepted,
    Rejected(AndnaError),
    Ignored,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub request_id: u64,
    pub requester: PeerAddress,
    pub hostname_hash: HostnameHash,
    pub selector: ServiceSelector,
    pub forward: bool,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolveReply {
    /// Milliseconds since the active claim was last registered. Relative so
    /// the requester can rebase it on its own clock.
    pub elapsed_ms: u64,
    pub records: Vec<ServiceRecord>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResolveResponse {
    Found(ResolveReply),
    Rejected(AndnaError),
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReverseResolveReply {
    pub hostnames: Vec<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetSingleCacheRequest {
    pub request_id: u64,
    pub requester: PeerAddress,
    pub hostname_hash: HostnameHash,
    /// Peers already asked, the original requester included.
    pub excluded: Vec<PeerAddress>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpreadCacheInstruction {
    pub request_id: u64,
    pub sender: PeerAddress,
    pub hostname_hash: HostnameHash,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FullCacheReply {
    pub andna: Vec<AndnaCacheEntry>,
    pub counter: Vec<CounterCacheEntry>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AndnaRequest {
    Register(RegisterRequest),
    CheckCounter(CheckCounterRequest),
    Resolve(ResolveRequest),
    ReverseResolve,
    GetSingleCache(GetSingleCacheRequest),
    SpreadCache(SpreadCacheInstruction),
    GetFullCache,
}

impl AndnaRequest {
    pub fn kind(&self) -> &'static str {
        match self {
            AndnaRequest::Register(_) => "register",
            AndnaRequest::CheckCounter(_) => "check_counter",
            AndnaRequest::Resolve(_) => "resolve",
            AndnaRequest::ReverseResolve => "reverse_resolve",
            AndnaRequest::GetSingleCache(_) => "get_single_cache",
            AndnaRequest::SpreadCache(_) => "spread_cache",
            AndnaRequest::GetFullCache => "get_full_cache",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum AndnaResponse {
    Register(RegisterReply),
    CheckCounter(CounterReply),
    Resolve(ResolveResponse),
    ReverseResolve(ReverseResolveReply),
    SingleCache(Option<AndnaCacheEntry>),
    Ack,
    FullCache(FullCacheReply),
}

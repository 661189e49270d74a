//! # ANDNA - Decentralized Hostname Registration and Resolution
//!
//! ANDNA lets any node of a hierarchical mesh register hostnames (with
//! SRV-style service records) for its own address, and lets any node
//! resolve them, without a central authority.
//!
//! ## Architecture
//!
//! - A hostname hash is mapped onto its **hash-gnode**, the peer responsible
//!   for it, by walking the group hierarchy from the coarsest level down.
//! - A registration is signed by the registrant, committed by the hash-gnode
//!   into a bounded queue of competing claims, and approved by an
//!   independent **counter node** located from the registrant's address.
//! - Accepted registrations are flooded to the hash-gnode's group, which
//!   keeps backups; flood ids are deduplicated through small rings.
//! - Peers that inherit a hash after a topology change fetch its entry from
//!   the previous owner.
//!
//! Group membership and packet transport are collaborators behind the
//! [`Topology`] and [`AndnaRpc`] traits.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `node` | [`AndnaNode`] handle: state, lifecycle, maintenance loop |
//! | `register` | Registration protocol (requester, hash-gnode, counter node) |
//! | `resolve` | Forward and reverse resolution |
//! | `spread` | Cache migration between owners and on group join |
//! | `flood` | Group broadcast and flood dedup |
//! | `locator` | Hash-gnode location |
//! | `cache` | Local, ANDNA, counter and resolved-name caches |
//! | `records` | Service records and selection |
//! | `topology` | Peer addresses, groups, the `Topology` trait |
//! | `identity` | Ed25519 keypairs and public keys |
//! | `crypto` | Hostname hashing and domain-separated signatures |
//! | `messages` | Wire messages and bounded codec |
//! | `protocols` | Transport and handler traits |
//! | `network` | In-process transport |
//! | `storage` | Persistence of caches and keypair |
//! | `config` | Tunables and the hostnames file |
//! | `error` | Protocol rejection reasons |

pub mod cache;
pub mod config;
pub mod crypto;
pub mod error;
pub mod flood;
pub mod identity;
pub mod locator;
pub mod messages;
pub mod network;
mod node;
pub mod protocols;
pub mod records;
mod register;
mod resolve;
mod spread;
pub mod storage;
pub mod topology;

pub use cache::{AndnaCacheEntry, LocalCacheEntry, QueueSlot};
pub use config::{AndnaConfig, HostnameSpec, load_hostnames, parse_hostnames};
pub use crypto::HostnameHash;
pub use error::AndnaError;
pub use identity::{Keypair, PublicKey};
pub use locator::{Located, Relation, locate};
pub use messages::ResolveReply;
pub use network::{InProcessNetwork, PeerRegistry};
pub use node::{AndnaNode, CacheStats, SweepReport};
pub use protocols::{AndnaRpc, RequestHandler};
pub use records::{Protocol, RecordTarget, ServiceRecord, ServiceSelector, parse_service};
pub use topology::{GroupPosition, MeshView, PeerAddress, PeerState, StaticTopology, Topology};

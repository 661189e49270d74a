//! # Hash-gnode Location
//!
//! Maps a hostname hash onto the peer currently responsible for it.
//!
//! The hash is folded into a synthetic [`PeerAddress`]. Starting at the
//! coarsest level, the locator looks for the occupied group nearest to the
//! synthetic position (scanning outward, `+d` before `-d`). If that group
//! contains the local node the search descends one level; otherwise the
//! request has to leave the local group and the locator returns a border
//! gateway into the occupied group. At the finest level the occupied peer
//! itself is the hash-gnode.
//!
//! Every level is scanned at most once and each step descends one level, so
//! a lookup costs at most `LEVELS * GROUP_WIDTH` oracle queries.
//!
//! Excluded peers let a node ask "who was responsible before me?": a group is
//! skipped when every live member it reports is excluded.

use crate::crypto::{HASH_LEN, HostnameHash};
use crate::topology::{GROUP_WIDTH, GroupPosition, LEVELS, PeerAddress, PeerState, Topology};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Relation {
    /// The local node is the hash-gnode.
    IAmOwner,
    /// Another peer of the local finest group is the hash-gnode; it can be
    /// contacted directly.
    GroupMember,
    /// The hash-gnode lies outside the local group; the address is the border
    /// peer to hand the request to.
    ForwardToBorderPeer,
    /// No live peer could be found.
    NotFound,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Located {
    pub address: PeerAddress,
    pub relation: Relation,
    /// True when some level resolved to a neighbour of the synthetic
    /// position rather than the position itself.
    pub rounded: bool,
}

impl Located {
    fn not_found(self_addr: PeerAddress) -> Self {
        Self {
            address: self_addr,
            relation: Relation::NotFound,
            rounded: false,
        }
    }
}

/// Folds a hash into the address space.
pub fn synthetic_address(hash: &HostnameHash) -> PeerAddress {
    let bytes = hash.as_bytes();
    let mut octets = [0u8; LEVELS];
    for i in 0..HASH_LEN {
        octets[i % LEVELS] ^= bytes[i];
    }
    PeerAddress::new(octets)
}

/// Hash used to place the counter node of a registrant: derived from the
/// registrant's address, never from the hostname.
pub fn counter_hash(requester: &PeerAddress) -> HostnameHash {
    crate::crypto::hash_fixed(&requester.octets())
}

pub fn locate<T: Topology + ?Sized>(
    topology: &T,
    hash: &HostnameHash,
    excluded_peers: &[PeerAddress],
    exclude_self: bool,
) -> Located {
    let self_addr = topology.self_address();
    let target = synthetic_address(hash);

    let mut excluded: Vec<PeerAddress> = excluded_peers.to_vec();
    if exclude_self {
        excluded.push(self_addr);
    }
    excluded.sort_unstable();
    excluded.dedup();

    let mut group = GroupPosition::root();
    let mut rounded = false;

    for depth in 0..LEVELS {
        let wanted = target.position(depth);
        let Some(found) = scan_level(topology, &group, wanted, &excluded) else {
            return Located::not_found(self_addr);
        };
        rounded |= found != wanted;
        let candidate = group.child(found);

        if depth == LEVELS - 1 {
            let Some(address) = candidate.as_peer() else {
                return Located::not_found(self_addr);
            };
            let relation = if address == self_addr {
                Relation::IAmOwner
            } else {
                Relation::GroupMember
            };
            return Located {
                address,
                relation,
                rounded,
            };
        }

        if !topology.am_member_of(&candidate) {
            return match topology.border_gateway(&candidate, &excluded) {
                Some(address) => Located {
                    address,
                    relation: Relation::ForwardToBorderPeer,
                    rounded,
                },
                None => Located::not_found(self_addr),
            };
        }

        group = candidate;
    }

    Located::not_found(self_addr)
}

/// Nearest usable position to `wanted` inside `parent`, scanning outward.
fn scan_level<T: Topology + ?Sized>(
    topology: &T,
    parent: &GroupPosition,
    wanted: u8,
    excluded: &[PeerAddress],
) -> Option<u8> {
    let wanted = wanted as isize;
    for distance in 0..GROUP_WIDTH as isize {
        let up = wanted + distance;
        let down = wanted - distance;
        let up_in_range = up < GROUP_WIDTH as isize;
        let down_in_range = distance > 0 && down >= 0;
        if !up_in_range && down < 0 {
            break;
        }
        if up_in_range && usable(topology, parent, up as u8, excluded) {
            return Some(up as u8);
        }
        if down_in_range && usable(topology, parent, down as u8, excluded) {
            return Some(down as u8);
        }
    }
    None
}

fn usable<T: Topology + ?Sized>(
    topology: &T,
    parent: &GroupPosition,
    position: u8,
    excluded: &[PeerAddress],
) -> bool {
    match topology.locate_group_member(parent, position) {
        PeerState::Down => false,
        PeerState::Up { members } => {
            if excluded.is_empty() {
                return true;
            }
            let group = parent.child(position);
            let excluded_inside = excluded.iter().filter(|a| group.contains(a)).count();
            (excluded_inside as u32) < members
        }
    }
}

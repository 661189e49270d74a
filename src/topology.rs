//! # Hierarchical Group Topology
//!
//! Peers are addressed by a path through nested groups: [`LEVELS`] positions,
//! each in `0..GROUP_WIDTH`, index 0 being the coarsest level. An address
//! renders as a dotted quad (`10.0.3.7`), the finest position last.
//!
//! The routing substrate that tracks group membership is outside this crate.
//! It is consumed through the [`Topology`] trait; [`StaticTopology`] is a
//! full-knowledge implementation backed by a shared [`MeshView`], used by the
//! in-process network, the tests and the standalone binary.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};

use serde::{Deserialize, Serialize};

/// Number of hierarchical levels in an address.
pub const LEVELS: usize = 4;

/// Number of positions inside one group at any level.
pub const GROUP_WIDTH: usize = 256;

/// Address of a single peer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PeerAddress([u8; LEVELS]);

impl PeerAddress {
    pub const fn new(octets: [u8; LEVELS]) -> Self {
        Self(octets)
    }

    pub fn octets(&self) -> [u8; LEVELS] {
        self.0
    }

    /// Position of this peer inside its group at `depth`.
    pub fn position(&self, depth: usize) -> u8 {
        self.0[depth]
    }

    /// The group containing this peer whose path has `len` components.
    pub fn group(&self, len: usize) -> GroupPosition {
        GroupPosition {
            path: self.0[..len.min(LEVELS)].to_vec(),
        }
    }

    /// The finest group containing this peer (all levels but the last).
    pub fn local_group(&self) -> GroupPosition {
        self.group(LEVELS - 1)
    }
}

impl From<Ipv4Addr> for PeerAddress {
    fn from(addr: Ipv4Addr) -> Self {
        Self(addr.octets())
    }
}

impl From<PeerAddress> for Ipv4Addr {
    fn from(addr: PeerAddress) -> Self {
        Ipv4Addr::from(addr.0)
    }
}

impl FromStr for PeerAddress {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<Ipv4Addr>().map(Self::from)
    }
}

impl std::fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", Ipv4Addr::from(*self))
    }
}

impl std::fmt::Debug for PeerAddress {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "PeerAddress({})", Ipv4Addr::from(*self))
    }
}

/// Path prefix identifying a group. The empty path is the whole network.
#[derive(Clone, PartialEq, Eq, Hash, Debug, Default, Serialize, Deserialize)]
pub struct GroupPosition {
    path: Vec<u8>,
}

impl GroupPosition {
    pub fn root() -> Self {
        Self { path: Vec::new() }
    }

    pub fn from_path(path: &[u8]) -> Self {
        Self {
            path: path[..path.len().min(LEVELS)].to_vec(),
        }
    }

    /// Number of path components, which is also the level of the groups
    /// nested directly inside this one.
    pub fn depth(&self) -> usize {
        self.path.len()
    }

    pub fn path(&self) -> &[u8] {
        &self.path
    }

    pub fn child(&self, position: u8) -> Self {
        let mut path = self.path.clone();
        path.push(position);
        Self { path }
    }

    pub fn contains(&self, addr: &PeerAddress) -> bool {
        addr.0[..self.path.len()] == self.path[..]
    }

    /// The single peer this path names, once it is fully specified.
    pub fn as_peer(&self) -> Option<PeerAddress> {
        let octets: [u8; LEVELS] = self.path.as_slice().try_into().ok()?;
        Some(PeerAddress(octets))
    }
}

/// Occupancy of a group position as seen by the local node.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PeerState {
    Down,
    /// At least one live peer; `members` counts the live peers inside the group
    /// (always 1 at the finest level).
    Up { members: u32 },
}

impl PeerState {
    pub fn is_up(&self) -> bool {
        matches!(self, PeerState::Up { .. })
    }
}

/// View of the mesh maintained by the routing substrate.
pub trait Topology: Send + Sync + 'static {
    /// Address the local node currently holds.
    fn self_address(&self) -> PeerAddress;

    /// State of the group at `position` nested directly inside `parent`.
    fn locate_group_member(&self, parent: &GroupPosition, position: u8) -> PeerState;

    /// Whether the local node lies inside `group`.
    fn am_member_of(&self, group: &GroupPosition) -> bool {
        group.contains(&self.self_address())
    }

    /// A peer providing a way into `external`, a group the local node is not
    /// part of. Peers in `excluded` are never chosen.
    fn border_gateway(
        &self,
        external: &GroupPosition,
        excluded: &[PeerAddress],
    ) -> Option<PeerAddress>;

    /// Live peers sharing the local node's finest group, excluding itself.
    fn local_group(&self) -> Vec<PeerAddress>;

    /// False while the local node is re-joining and its address may change.
    fn address_stable(&self) -> bool {
        true
    }
}

/// Set of live peer addresses, shared between the topologies of an
/// in-process mesh so that joins and departures are seen by every node.
#[derive(Clone, Default)]
pub struct MeshView {
    live: Arc<RwLock<BTreeSet<PeerAddress>>>,
}

impl MeshView {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn join(&self, addr: PeerAddress) {
        if let Ok(mut live) = self.live.write() {
            live.insert(addr);
        }
    }

    pub fn leave(&self, addr: &PeerAddress) {
        if let Ok(mut live) = self.live.write() {
            live.remove(addr);
        }
    }

    pub fn is_live(&self, addr: &PeerAddress) -> bool {
        self.live
            .read()
            .map(|live| live.contains(addr))
            .unwrap_or(false)
    }

    /// Live peers inside `group`, in address order.
    pub fn members_of(&self, group: &GroupPosition) -> Vec<PeerAddress> {
        let Ok(live) = self.live.read() else {
            return Vec::new();
        };
        let (lo, hi) = group_bounds(group);
        live.range(lo..=hi).copied().collect()
    }

    fn count_in(&self, group: &GroupPosition) -> usize {
        let Ok(live) = self.live.read() else {
            return 0;
        };
        let (lo, hi) = group_bounds(group);
        live.range(lo..=hi).count()
    }
}

fn group_bounds(group: &GroupPosition) -> (PeerAddress, PeerAddress) {
    let mut lo = [0u8; LEVELS];
    let mut hi = [u8::MAX; LEVELS];
    for (i, p) in group.path().iter().enumerate() {
        lo[i] = *p;
        hi[i] = *p;
    }
    (PeerAddress(lo), PeerAddress(hi))
}

/// Full-knowledge topology of one node inside a [`MeshView`].
pub struct StaticTopology {
    self_addr: PeerAddress,
    mesh: MeshView,
    stable: AtomicBool,
}

impl StaticTopology {
    /// Creates the view for `self_addr` and marks it live in `mesh`.
    pub fn new(self_addr: PeerAddress, mesh: MeshView) -> Self {
        mesh.join(self_addr);
        Self {
            self_addr,
            mesh,
            stable: AtomicBool::new(true),
        }
    }

    pub fn mesh(&self) -> &MeshView {
        &self.mesh
    }

    pub fn set_address_stable(&self, stable: bool) {
        self.stable.store(stable, Ordering::SeqCst);
    }
}

impl Topology for StaticTopology {
    fn self_address(&self) -> PeerAddress {
        self.self_addr
    }

    fn locate_group_member(&self, parent: &GroupPosition, position: u8) -> PeerState {
        match self.mesh.count_in(&parent.child(position)) {
            0 => PeerState::Down,
            n => PeerState::Up { members: n as u32 },
        }
    }

    fn border_gateway(
        &self,
        external: &GroupPosition,
        excluded: &[PeerAddress],
    ) -> Option<PeerAddress> {
        if self.am_member_of(external) {
            return None;
        }
        // Every peer is directly reachable in-process, so the entry point into
        // the external group is its lowest live member.
        self.mesh
            .members_of(external)
            .into_iter()
            .find(|a| !excluded.contains(a))
    }

    fn local_group(&self) -> Vec<PeerAddress> {
        self.mesh
            .members_of(&self.self_addr.local_group())
            .into_iter()
            .filter(|a| *a != self.self_addr)
            .collect()
    }

    fn address_stable(&self) -> bool {
        self.stable.load(Ordering::SeqCst)
    }
}

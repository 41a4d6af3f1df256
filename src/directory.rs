//! Node and player directory.
//!
//! The [`Directory`] is the single owner of the node ↔ address ↔ player-slot
//! mapping. Other components hold [`NodeHandle`]s, which carry a generation
//! counter: once a node id is freed and reused, handles to the old occupant
//! no longer resolve.

use smallvec::SmallVec;
use std::collections::BTreeMap;

use crate::error::NetsyncError;
use crate::{NodeId, PeerAddress, PlayerSlot, MAXNETNODES, MAXPLAYERS, MAXSPLITSCREENPLAYERS};

/// Lifecycle of a node id.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub enum NodeStatus {
    /// Free for assignment.
    Unused,
    /// Assigned to a peer that has not finished joining.
    PendingJoin,
    /// Fully joined.
    Joined,
}

/// Generational reference to a node.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct NodeHandle {
    /// The node id.
    pub id: NodeId,
    /// The generation of the id at the time the handle was issued.
    pub generation: u32,
}

/// Ownership of one player slot.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct PlayerBinding {
    /// The owning node.
    pub node: NodeHandle,
    /// The player's splitscreen index on that node.
    pub split: u8,
}

/// Slots owned by one node, in splitscreen order.
pub type SlotVec = SmallVec<[PlayerSlot; MAXSPLITSCREENPLAYERS]>;

#[derive(Debug, Clone)]
struct NodeEntry<A> {
    generation: u32,
    status: NodeStatus,
    address: Option<A>,
    slots: SlotVec,
}

impl<A> NodeEntry<A> {
    fn empty() -> Self {
        Self {
            generation: 0,
            status: NodeStatus::Unused,
            address: None,
            slots: SlotVec::new(),
        }
    }
}

/// Arena of nodes plus the player-slot table.
#[derive(Debug, Clone)]
pub struct Directory<A: PeerAddress> {
    nodes: Vec<NodeEntry<A>>,
    by_address: BTreeMap<A, NodeId>,
    players: [Option<PlayerBinding>; MAXPLAYERS],
}

impl<A: PeerAddress> Default for Directory<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A: PeerAddress> Directory<A> {
    /// Creates a directory whose node 0 is the local node.
    #[must_use]
    pub fn new() -> Self {
        let mut nodes: Vec<NodeEntry<A>> = (0..MAXNETNODES).map(|_| NodeEntry::empty()).collect();
        nodes[NodeId::SELF.as_usize()].status = NodeStatus::Joined;
        Self {
            nodes,
            by_address: BTreeMap::new(),
            players: [None; MAXPLAYERS],
        }
    }

    /// Handle for the local node.
    #[must_use]
    pub fn local(&self) -> NodeHandle {
        NodeHandle {
            id: NodeId::SELF,
            generation: self.nodes[NodeId::SELF.as_usize()].generation,
        }
    }

    /// Returns the node already bound to `address`, or assigns the lowest
    /// free node id to it.
    pub fn assign_node(&mut self, address: A) -> Result<NodeHandle, NetsyncError> {
        if let Some(existing) = self.node_for_address(&address) {
            return Ok(existing);
        }
        let free = self
            .nodes
            .iter()
            .enumerate()
            .skip(1)
            .find(|(_, entry)| entry.status == NodeStatus::Unused)
            .map(|(index, _)| index)
            .ok_or(NetsyncError::DirectoryFull)?;
        let entry = &mut self.nodes[free];
        entry.generation = entry.generation.wrapping_add(1);
        entry.status = NodeStatus::PendingJoin;
        entry.address = Some(address.clone());
        entry.slots.clear();
        let id = NodeId::new(free as u8).ok_or(NetsyncError::DirectoryFull)?;
        self.by_address.insert(address, id);
        tracing::debug!(%id, generation = entry.generation, "node assigned");
        Ok(NodeHandle {
            id,
            generation: entry.generation,
        })
    }

    /// Returns `true` if `handle` still refers to the node it was issued for.
    #[must_use]
    pub fn is_current(&self, handle: NodeHandle) -> bool {
        self.nodes.get(handle.id.as_usize()).is_some_and(|entry| {
            entry.generation == handle.generation && entry.status != NodeStatus::Unused
        })
    }

    fn entry_mut(&mut self, handle: NodeHandle) -> Result<&mut NodeEntry<A>, NetsyncError> {
        if !self.is_current(handle) {
            return Err(NetsyncError::InvalidNode { node: handle.id });
        }
        Ok(&mut self.nodes[handle.id.as_usize()])
    }

    /// Binds `slot` to `node` as its `split`-th local player.
    pub fn bind_player_to_node(
        &mut self,
        slot: PlayerSlot,
        node: NodeHandle,
        split: u8,
    ) -> Result<(), NetsyncError> {
        if self.players[slot.as_usize()].is_some() {
            return Err(NetsyncError::InvalidPlayerSlot { slot });
        }
        if split as usize >= MAXSPLITSCREENPLAYERS {
            return Err(NetsyncError::InvalidRequest {
                info: format!("splitscreen index {} out of range", split),
            });
        }
        let entry = self.entry_mut(node)?;
        if entry.slots.len() >= MAXSPLITSCREENPLAYERS {
            return Err(NetsyncError::InvalidRequest {
                info: format!("{} already owns {} players", node.id, entry.slots.len()),
            });
        }
        entry.slots.push(slot);
        self.players[slot.as_usize()] = Some(PlayerBinding { node, split });
        Ok(())
    }

    /// Frees a node and every player slot it owns. Returns the freed slots.
    pub fn free_node(&mut self, node: NodeHandle) -> Result<SlotVec, NetsyncError> {
        if node.id == NodeId::SELF {
            return Err(NetsyncError::InvalidNode { node: node.id });
        }
        let entry = self.entry_mut(node)?;
        let slots = std::mem::take(&mut entry.slots);
        let address = entry.address.take();
        entry.status = NodeStatus::Unused;
        entry.generation = entry.generation.wrapping_add(1);
        if let Some(address) = address {
            self.by_address.remove(&address);
        }
        for slot in &slots {
            self.players[slot.as_usize()] = None;
        }
        tracing::debug!(node = %node.id, freed = slots.len(), "node freed");
        Ok(slots)
    }

    /// Unbinds every player slot of `node` without freeing the node.
    pub fn unbind_players(&mut self, node: NodeHandle) -> Result<SlotVec, NetsyncError> {
        let entry = self.entry_mut(node)?;
        let slots = std::mem::take(&mut entry.slots);
        for slot in &slots {
            self.players[slot.as_usize()] = None;
        }
        Ok(slots)
    }

    /// The node owning `slot`.
    #[must_use]
    pub fn lookup_owner(&self, slot: PlayerSlot) -> Option<NodeHandle> {
        self.players[slot.as_usize()].map(|binding| binding.node)
    }

    /// The full binding of `slot`.
    #[must_use]
    pub fn binding(&self, slot: PlayerSlot) -> Option<PlayerBinding> {
        self.players[slot.as_usize()]
    }

    /// The node bound to `address`.
    #[must_use]
    pub fn node_for_address(&self, address: &A) -> Option<NodeHandle> {
        self.by_address.get(address).map(|id| NodeHandle {
            id: *id,
            generation: self.nodes[id.as_usize()].generation,
        })
    }

    /// The current handle of a raw node id, if it is in use.
    #[must_use]
    pub fn handle(&self, id: NodeId) -> Option<NodeHandle> {
        let entry = self.nodes.get(id.as_usize())?;
        (entry.status != NodeStatus::Unused).then_some(NodeHandle {
            id,
            generation: entry.generation,
        })
    }

    /// The address of a node.
    #[must_use]
    pub fn address(&self, id: NodeId) -> Option<&A> {
        self.nodes.get(id.as_usize())?.address.as_ref()
    }

    /// The status of a node.
    #[must_use]
    pub fn status(&self, id: NodeId) -> NodeStatus {
        self.nodes
            .get(id.as_usize())
            .map_or(NodeStatus::Unused, |entry| entry.status)
    }

    /// Changes the status of an assigned node.
    pub fn set_status(&mut self, node: NodeHandle, status: NodeStatus) -> Result<(), NetsyncError> {
        if status == NodeStatus::Unused {
            return Err(NetsyncError::InvalidRequest {
                info: "use free_node to release a node".to_owned(),
            });
        }
        self.entry_mut(node)?.status = status;
        Ok(())
    }

    /// Slots owned by a node, in splitscreen order.
    #[must_use]
    pub fn slots_of(&self, id: NodeId) -> SlotVec {
        self.nodes
            .get(id.as_usize())
            .map(|entry| entry.slots.clone())
            .unwrap_or_default()
    }

    /// Lowest unbound player slot.
    #[must_use]
    pub fn free_slot(&self) -> Option<PlayerSlot> {
        PlayerSlot::all().find(|slot| self.players[slot.as_usize()].is_none())
    }

    /// Number of bound player slots.
    #[must_use]
    pub fn player_count(&self) -> usize {
        self.players.iter().filter(|binding| binding.is_some()).count()
    }

    /// Bitmask of bound player slots.
    #[must_use]
    pub fn player_mask(&self) -> u16 {
        PlayerSlot::all()
            .filter(|slot| self.players[slot.as_usize()].is_some())
            .fold(0, |mask, slot| mask | slot.mask_bit())
    }

    /// Remote nodes in use, lowest id first.
    pub fn remote_nodes(&self) -> impl Iterator<Item = (NodeId, NodeStatus)> + '_ {
        self.nodes
            .iter()
            .enumerate()
            .skip(1)
            .filter(|(_, entry)| entry.status != NodeStatus::Unused)
            .filter_map(|(index, entry)| NodeId::new(index as u8).map(|id| (id, entry.status)))
    }
}

#[cfg(test)]
#[allow(
    clippy::panic,
    clippy::unwrap_used,
    clippy::expect_used,
    clippy::indexing_slicing
)]
mod tests {
    use super::*;
    use std::net::SocketAddr;

    fn addr(port: u16) -> SocketAddr {
        SocketAddr::from(([127, 0, 0, 1], port))
    }

    fn slot(n: u8) -> PlayerSlot {
        PlayerSlot::new(n).unwrap()
    }

    #[test]
    fn assigns_lowest_free_node_and_reuses_address_binding() {
        let mut dir = Directory::new();
        let a = dir.assign_node(addr(1)).unwrap();
        let b = dir.assign_node(addr(2)).unwrap();
        assert_eq!(a.id.as_u8(), 1);
        assert_eq!(b.id.as_u8(), 2);
        assert_eq!(dir.assign_node(addr(1)).unwrap(), a);
        assert_eq!(dir.status(a.id), NodeStatus::PendingJoin);
    }

    #[test]
    fn free_node_cascades_to_player_slots() {
        let mut dir = Directory::new();
        let node = dir.assign_node(addr(1)).unwrap();
        dir.bind_player_to_node(slot(0), node, 0).unwrap();
        dir.bind_player_to_node(slot(3), node, 1).unwrap();
        assert_eq!(dir.lookup_owner(slot(3)), Some(node));
        assert_eq!(dir.player_mask(), 0b1001);

        let freed = dir.free_node(node).unwrap();
        assert_eq!(freed.as_slice(), &[slot(0), slot(3)]);
        assert_eq!(dir.lookup_owner(slot(0)), None);
        assert_eq!(dir.player_count(), 0);
        assert!(dir.node_for_address(&addr(1)).is_none());
    }

    #[test]
    fn stale_handles_are_rejected_after_reuse() {
        let mut dir = Directory::new();
        let old = dir.assign_node(addr(1)).unwrap();
        dir.free_node(old).unwrap();
        let new = dir.assign_node(addr(9)).unwrap();
        assert_eq!(old.id, new.id);
        assert_ne!(old.generation, new.generation);
        assert!(!dir.is_current(old));
        assert!(matches!(
            dir.bind_player_to_node(slot(0), old, 0),
            Err(NetsyncError::InvalidNode { .. })
        ));
        assert!(dir.free_node(old).is_err());
        assert!(dir.is_current(new));
    }

    #[test]
    fn slot_cannot_be_bound_twice_and_split_is_bounded() {
        let mut dir = Directory::new();
        let node = dir.assign_node(addr(1)).unwrap();
        dir.bind_player_to_node(slot(2), node, 0).unwrap();
        assert!(dir.bind_player_to_node(slot(2), node, 1).is_err());
        assert!(dir.bind_player_to_node(slot(4), node, 4).is_err());
        assert_eq!(dir.free_slot(), Some(slot(0)));
    }

    #[test]
    fn directory_full_when_every_node_is_taken() {
        let mut dir = Directory::new();
        for port in 1..MAXNETNODES as u16 {
            dir.assign_node(addr(port)).unwrap();
        }
        assert_eq!(
            dir.assign_node(addr(60000)),
            Err(NetsyncError::DirectoryFull)
        );
    }

    #[test]
    fn local_node_cannot_be_freed() {
        let mut dir: Directory<SocketAddr> = Directory::new();
        let local = dir.local();
        dir.bind_player_to_node(slot(0), local, 0).unwrap();
        assert!(dir.free_node(local).is_err());
        assert_eq!(dir.slots_of(NodeId::SELF).as_slice(), &[slot(0)]);
        assert_eq!(dir.remote_nodes().count(), 0);
    }
}

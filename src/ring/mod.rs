//! Consistent Hashing
//!
//! Maps nodes and keys into one circular hash space of [`RING_SLOTS`]
//! positions. The owner of a key is the node at the smallest ring position
//! strictly greater than the key's position, wrapping to the first node.
//!
//! Node positions are remembered across departures: a node that dies and
//! later rejoins lands on the exact position it committed to originally, so
//! ownership of every key range is restored rather than reshuffled.

use std::collections::{BTreeMap, HashMap};

use crate::membership::types::NodeId;

/// Number of slots in the hash space. Small on purpose: clusters are tens
/// of nodes, and a compact space keeps positions printable in logs.
pub const RING_SLOTS: u32 = 256;

pub fn position_of_key(key: &[u8]) -> u32 {
    crc32fast::hash(key) % RING_SLOTS
}

pub fn position_of_node(node: &NodeId) -> u32 {
    crc32fast::hash(node.to_string().as_bytes()) % RING_SLOTS
}

/// The ring itself. Cheap to clone; holders snapshot it rather than locking
/// it across lookups.
#[derive(Debug, Clone)]
pub struct HashRing {
    positions: BTreeMap<u32, NodeId>,
    committed: HashMap<NodeId, u32>,
    local: NodeId,
}

impl HashRing {
    pub fn new(local: NodeId) -> Self {
        Self {
            positions: BTreeMap::new(),
            committed: HashMap::new(),
            local,
        }
    }

    /// Adds a node, probing linearly past its canonical position when the
    /// slot is taken. A rejoining node reclaims the position it committed
    /// to the first time.
    ///
    /// Returns true when the local node is the new node's successor, i.e.
    /// the local node holds keys the newcomer now owns and must hand them
    /// over.
    pub fn add_node(&mut self, node: NodeId) -> bool {
        if self.positions.values().any(|n| *n == node) {
            return false;
        }

        let mut position = match self.committed.get(&node) {
            Some(saved) => *saved,
            None => position_of_node(&node),
        };
        while self.positions.contains_key(&position) {
            position = (position + 1) % RING_SLOTS;
        }
        self.positions.insert(position, node.clone());
        self.committed.insert(node.clone(), position);

        node != self.local && self.successor_of(&node) == Some(self.local.clone())
    }

    pub fn remove_node(&mut self, node: &NodeId) {
        self.positions.retain(|_, n| n != node);
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.positions.values().any(|n| n == node)
    }

    /// The node owning a key: first position strictly greater than the
    /// key's, wrapping around. None only on an empty ring.
    pub fn node_for_key(&self, key: &[u8]) -> Option<NodeId> {
        self.node_after(position_of_key(key))
    }

    fn node_after(&self, position: u32) -> Option<NodeId> {
        self.positions
            .range(position + 1..)
            .next()
            .or_else(|| self.positions.iter().next())
            .map(|(_, node)| node.clone())
    }

    /// The next node clockwise from the given one.
    pub fn successor_of(&self, node: &NodeId) -> Option<NodeId> {
        let position = self.position_in_ring(node)?;
        if self.positions.len() < 2 {
            return None;
        }
        self.node_after(position)
    }

    pub fn predecessor_of(&self, node: &NodeId) -> Option<NodeId> {
        let position = self.position_in_ring(node)?;
        if self.positions.len() < 2 {
            return None;
        }
        self.positions
            .range(..position)
            .next_back()
            .or_else(|| self.positions.iter().next_back())
            .map(|(_, n)| n.clone())
    }

    /// Up to `count` distinct nodes clockwise from the given one, in ring
    /// order. These are the candidate backups for the node's key range.
    pub fn successors(&self, node: &NodeId, count: usize) -> Vec<NodeId> {
        let mut out = Vec::with_capacity(count);
        let mut cursor = node.clone();
        for _ in 0..count {
            match self.successor_of(&cursor) {
                Some(next) if next != *node => {
                    cursor = next.clone();
                    out.push(next);
                }
                _ => break,
            }
        }
        out
    }

    fn position_in_ring(&self, node: &NodeId) -> Option<u32> {
        self.positions
            .iter()
            .find(|(_, n)| *n == node)
            .map(|(position, _)| *position)
    }

    pub fn len(&self) -> usize {
        self.positions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.positions.is_empty()
    }
}

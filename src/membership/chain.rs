use crate::membership::types::NodeId;
use crate::ring::HashRing;

/// The local node's replication chain: the ring successors that back up the
/// key range this node heads.
///
/// Two views are kept. `nominal` is what the ring dictates with everyone
/// alive; `live` is the chain actually in use, shrunk when a backup dies
/// and extended with the next ring successor so the replica count holds.
/// Both lists hold backups only, never the head itself.
#[derive(Debug)]
pub struct ReplicaChain {
    head: NodeId,
    factor: usize,
    nominal: Vec<NodeId>,
    live: Vec<NodeId>,
}

impl ReplicaChain {
    /// `factor` is the total replica count including the head, so a factor
    /// of 3 means two backups.
    pub fn new(head: NodeId, factor: usize) -> Self {
        Self {
            head,
            factor: factor.max(1),
            nominal: Vec::new(),
            live: Vec::new(),
        }
    }

    fn backup_count(&self) -> usize {
        self.factor - 1
    }

    /// Recomputes both views from the ring. Called when membership settles
    /// into a new shape rather than on every probe.
    pub fn rebuild(&mut self, ring: &HashRing) {
        self.nominal = ring.successors(&self.head, self.backup_count());
        self.live = self.nominal.clone();
    }

    /// Drops a dead backup from the live chain and pulls in the next ring
    /// successor past the current tail to keep the replica count.
    ///
    /// Returns the catch-up target when the dead node was the first live
    /// backup: the node promoted into that slot has never seen this head's
    /// key range and must be brought up to date.
    pub fn mark_dead(&mut self, dead: &NodeId, ring: &HashRing) -> Option<NodeId> {
        let Some(index) = self.live.iter().position(|n| n == dead) else {
            return None;
        };
        self.live.remove(index);

        // walk clockwise from the current tail for a replacement
        let mut cursor = self.live.last().cloned().unwrap_or_else(|| self.head.clone());
        let mut appended = None;
        for _ in 0..ring.len() {
            match ring.successor_of(&cursor) {
                Some(next) => {
                    if next == self.head {
                        break;
                    }
                    if next != *dead && !self.live.contains(&next) {
                        self.live.push(next.clone());
                        appended = Some(next);
                        break;
                    }
                    cursor = next;
                }
                None => break,
            }
        }

        if index == 0 {
            appended.or_else(|| self.live.first().cloned())
        } else {
            None
        }
    }

    /// Reinstates a recovered backup at its nominal slot, displacing the
    /// stand-in that was covering for it. Returns false when the node holds
    /// no slot in the nominal chain, in which case the caller must rebuild
    /// from the ring instead.
    pub fn restore(&mut self, node: &NodeId) -> bool {
        let Some(nominal_index) = self.nominal.iter().position(|n| n == node) else {
            return false;
        };
        if self.live.contains(node) {
            return true;
        }
        let at = nominal_index.min(self.live.len());
        self.live.insert(at, node.clone());
        self.live.truncate(self.backup_count());
        true
    }

    pub fn live(&self) -> &[NodeId] {
        &self.live
    }

    pub fn tail(&self) -> Option<&NodeId> {
        self.live.last()
    }

    pub fn contains(&self, node: &NodeId) -> bool {
        self.live.contains(node)
    }
}

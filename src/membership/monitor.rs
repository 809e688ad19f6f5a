use std::sync::{Arc, RwLock, Weak};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use dashmap::DashMap;
use rand::Rng;
use tracing::{debug, info, warn};

use crate::codec::{protocol, MemberEntry, Request, Response};
use crate::membership::chain::ReplicaChain;
use crate::membership::types::NodeId;
use crate::ring::HashRing;
use crate::store::LocalStore;
use crate::transport::UdpTransport;

const GOSSIP_INTERVAL: Duration = Duration::from_millis(500);

/// Extra gossip rounds granted beyond the propagation bound before a silent
/// node is declared dead.
const SUSPICION_MARGIN: f64 = 4.0;

/// The gossip failure detector. Owns the last-alive table and drives every
/// membership change into the shared ring and the local replica chain.
pub struct MembershipMonitor {
    local: NodeId,
    members: DashMap<NodeId, u64>,
    ring: Arc<RwLock<HashRing>>,
    chain: RwLock<ReplicaChain>,
    store: Arc<LocalStore>,
    transport: Arc<UdpTransport>,
    interval: Duration,
    /// Self-handle so sweeps can spawn key transfers that outlive the tick.
    handle: Weak<Self>,
}

impl MembershipMonitor {
    pub fn new(
        local: NodeId,
        seeds: Vec<NodeId>,
        replication_factor: usize,
        store: Arc<LocalStore>,
        transport: Arc<UdpTransport>,
    ) -> Arc<Self> {
        let members = DashMap::new();
        let now = now_ms();
        members.insert(local.clone(), now);

        let mut ring = HashRing::new(local.clone());
        ring.add_node(local.clone());
        for seed in seeds {
            members.insert(seed.clone(), now);
            ring.add_node(seed);
        }

        let mut chain = ReplicaChain::new(local.clone(), replication_factor);
        chain.rebuild(&ring);

        Arc::new_cyclic(|handle| Self {
            local,
            members,
            ring: Arc::new(RwLock::new(ring)),
            chain: RwLock::new(chain),
            store,
            transport,
            interval: GOSSIP_INTERVAL,
            handle: handle.clone(),
        })
    }

    pub fn start(self: Arc<Self>) {
        info!("Starting membership monitor (interval {:?})", self.interval);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            loop {
                ticker.tick().await;
                self.tick().await;
            }
        });
    }

    async fn tick(&self) {
        self.members.insert(self.local.clone(), now_ms());

        if let Some(peer) = self.random_peer() {
            match self.probe(&peer).await {
                Ok(reported) => self.merge(reported),
                Err(e) => debug!("Gossip probe to {} failed: {}", peer, e),
            }
        }

        self.sweep();
    }

    fn random_peer(&self) -> Option<NodeId> {
        let peers: Vec<NodeId> = self
            .members
            .iter()
            .map(|entry| entry.key().clone())
            .filter(|id| *id != self.local)
            .collect();
        if peers.is_empty() {
            return None;
        }
        let idx = rand::thread_rng().gen_range(0..peers.len());
        Some(peers[idx].clone())
    }

    async fn probe(&self, peer: &NodeId) -> Result<Vec<MemberEntry>> {
        let payload = Request::control(protocol::GET_MEMBERSHIP_LIST).encode()?;
        let reply = self.transport.request(peer.addr(), payload).await?;
        let response = Response::decode(&reply.payload)?;
        Ok(response.members)
    }

    /// Merges a peer's view into ours: freshest timestamp per node wins,
    /// unknown nodes are adopted and admitted on the next sweep.
    fn merge(&self, reported: Vec<MemberEntry>) {
        for entry in reported {
            let Ok(id) = entry.addr.parse::<NodeId>() else {
                warn!("Ignoring unparseable member address {}", entry.addr);
                continue;
            };
            if id == self.local {
                continue;
            }
            self.members
                .entry(id)
                .and_modify(|ts| *ts = (*ts).max(entry.last_alive_ms))
                .or_insert(entry.last_alive_ms);
        }
    }

    /// How long a node may stay silent before being declared dead. Gossip
    /// reaches the whole cluster in about log2(n) rounds; the margin covers
    /// probe loss on an unreliable network.
    fn suspicion_threshold(interval: Duration, cluster_size: usize) -> Duration {
        let rounds = (cluster_size.max(2) as f64).log2() + SUSPICION_MARGIN;
        interval.mul_f64(rounds)
    }

    /// Applies the current timestamp table to the ring and chain: stale
    /// nodes leave, recovered nodes come back at their committed position.
    fn sweep(&self) {
        let now = now_ms();
        let threshold =
            Self::suspicion_threshold(self.interval, self.members.len()).as_millis() as u64;

        for entry in self.members.iter() {
            let (node, last_alive) = (entry.key().clone(), *entry.value());
            if node == self.local {
                continue;
            }
            let stale = now.saturating_sub(last_alive) > threshold;

            if stale {
                self.declare_dead(&node);
            } else {
                self.admit(&node);
            }
        }
    }

    fn declare_dead(&self, node: &NodeId) {
        let catchup = {
            let mut ring = match self.ring.write() {
                Ok(ring) => ring,
                Err(_) => return,
            };
            if !ring.contains(node) {
                return;
            }
            info!("Node {} declared dead, removing from ring", node);
            ring.remove_node(node);

            match self.chain.write() {
                Ok(mut chain) => chain.mark_dead(node, &ring),
                Err(_) => None,
            }
        };

        // a node promoted into the chain has never seen our key range
        if let Some(target) = catchup {
            info!("Chain repaired, catching up new replica {}", target);
            let Some(monitor) = self.handle.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                monitor
                    .transfer_keys(&target, protocol::REPLICA_ACK_PUT, |ring, key| {
                        ring.node_for_key(key).as_ref() == Some(&monitor.local)
                    })
                    .await;
            });
        }
    }

    fn admit(&self, node: &NodeId) {
        let handover = {
            let mut ring = match self.ring.write() {
                Ok(ring) => ring,
                Err(_) => return,
            };
            if ring.contains(node) {
                return;
            }
            info!("Node {} is alive, admitting to ring", node);
            let handover = ring.add_node(node.clone());

            // a rejoiner reclaims its old chain slot; only genuinely new
            // membership reshapes the chain
            if let Ok(mut chain) = self.chain.write() {
                if !chain.restore(node) {
                    chain.rebuild(&ring);
                }
            }
            handover
        };

        // the newcomer sits directly before us: keys it owns live here
        if handover {
            info!("Handing owned key range over to {}", node);
            let target = node.clone();
            let Some(monitor) = self.handle.upgrade() else {
                return;
            };
            tokio::spawn(async move {
                monitor
                    .transfer_keys(&target, protocol::PUT, |ring, key| {
                        ring.node_for_key(key).as_ref() == Some(&target)
                    })
                    .await;
            });
        }
    }

    /// Ships every locally held entry selected by the predicate to the
    /// target, one retried request per key.
    async fn transfer_keys<F>(&self, target: &NodeId, command: u8, select: F)
    where
        F: Fn(&HashRing, &[u8]) -> bool,
    {
        let ring = match self.ring.read() {
            Ok(ring) => ring.clone(),
            Err(_) => return,
        };
        let outgoing = self.store.entries_where(|key| select(&ring, key));
        if outgoing.is_empty() {
            return;
        }
        info!("Transferring {} keys to {}", outgoing.len(), target);

        for (key, stored) in outgoing {
            let request = Request::write(command, key, stored.value, stored.version);
            let payload = match request.encode() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Failed to encode transfer request: {}", e);
                    continue;
                }
            };
            if let Err(e) = self.transport.request(target.addr(), payload).await {
                warn!("Key transfer to {} failed: {}", target, e);
                return;
            }
        }
    }

    /// The membership list as reported to gossip peers, with our own entry
    /// refreshed to now.
    pub fn snapshot(&self) -> Vec<MemberEntry> {
        self.members.insert(self.local.clone(), now_ms());
        self.members
            .iter()
            .map(|entry| MemberEntry {
                addr: entry.key().to_string(),
                last_alive_ms: *entry.value(),
            })
            .collect()
    }

    pub fn membership_count(&self) -> u32 {
        self.ring
            .read()
            .map(|ring| ring.len() as u32)
            .unwrap_or(0)
    }

    pub fn live_replicas(&self) -> Vec<NodeId> {
        self.chain
            .read()
            .map(|chain| chain.live().to_vec())
            .unwrap_or_default()
    }

    pub fn chain_tail(&self) -> Option<NodeId> {
        self.chain
            .read()
            .ok()
            .and_then(|chain| chain.tail().cloned())
    }

    pub fn ring(&self) -> Arc<RwLock<HashRing>> {
        self.ring.clone()
    }

    #[cfg(test)]
    pub fn members_len(&self) -> usize {
        self.members.len()
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

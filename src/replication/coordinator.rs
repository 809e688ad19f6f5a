use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use anyhow::Result;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::codec::{protocol, Envelope, Request, Response};
use crate::membership::{MembershipMonitor, NodeId};
use crate::replication::locks::{Deferred, PendingWrites};
use crate::store::{LocalStore, RequestCache};
use crate::transport::UdpTransport;

/// Drives every command a node can receive: client operations, replica
/// fanout, chain acks and commit waves. One instance per node, shared by
/// all inbound datagram tasks.
pub struct Coordinator {
    local: NodeId,
    store: Arc<LocalStore>,
    cache: Arc<RequestCache>,
    monitor: Arc<MembershipMonitor>,
    transport: Arc<UdpTransport>,
    pending: PendingWrites,
    /// Ack tally per in-flight proposal, keyed by the locked key.
    acks: DashMap<Vec<u8>, usize>,
    /// Self-handle so deferred messages can re-enter dispatch from tasks.
    handle: Weak<Self>,
}

impl Coordinator {
    pub fn new(
        local: NodeId,
        store: Arc<LocalStore>,
        cache: Arc<RequestCache>,
        monitor: Arc<MembershipMonitor>,
        transport: Arc<UdpTransport>,
    ) -> Arc<Self> {
        Arc::new_cyclic(|handle| Self {
            local,
            store,
            cache,
            monitor,
            transport,
            pending: PendingWrites::new(),
            acks: DashMap::new(),
            handle: handle.clone(),
        })
    }

    /// Runs one command to completion and sends the response, if this node
    /// is the one that owes it. Multi-hop commands return nothing here; the
    /// node that terminates the chain answers the client directly.
    pub async fn handle_and_respond(&self, envelope: Envelope, src: SocketAddr) {
        let message_id = envelope.message_id.clone();
        let reply_to = envelope.client.unwrap_or(src);

        match self.execute(envelope, src).await {
            Ok(Some(response)) => {
                let payload = match response.encode() {
                    Ok(payload) => payload,
                    Err(e) => {
                        warn!("Failed to encode response: {}", e);
                        return;
                    }
                };
                // NO_MEM is transient; caching it would pin the rejection
                if response.status != protocol::NO_MEM {
                    self.cache.insert(message_id.clone(), payload.clone());
                }
                if let Err(e) = self.transport.respond(message_id, payload, reply_to).await {
                    warn!("Failed to send response to {}: {}", reply_to, e);
                }
            }
            Ok(None) => {}
            Err(e) => warn!("Command failed: {}", e),
        }
    }

    async fn execute(
        &self,
        envelope: Envelope,
        src: SocketAddr,
    ) -> Result<Option<Response>> {
        let request = Request::decode(&envelope.payload)?;

        match request.command {
            protocol::PUT => self.client_write(envelope, src, request).await,
            protocol::GET => self.client_get(envelope, src, request).await,
            protocol::REMOVE => self.client_write(envelope, src, request).await,
            protocol::REPLICA_PUT | protocol::REPLICA_REMOVE => {
                self.replica_propose(envelope, src, request).await
            }
            protocol::ACK_PUT | protocol::ACK_REMOVE => {
                self.head_ack(envelope, request).await
            }
            protocol::ACK_GET => {
                self.release_and_redispatch(&request.key);
                Ok(None)
            }
            protocol::REPLICA_ACK_PUT | protocol::REPLICA_ACK_REMOVE => {
                self.replica_commit(envelope, request)
            }
            protocol::TAIL_ACK_PUT | protocol::TAIL_ACK_REMOVE => {
                Ok(Some(self.tail_commit(request)))
            }
            protocol::TAIL_GET => self.tail_get(envelope, src, request).await,
            protocol::IS_ALIVE => Ok(Some(Response::status(protocol::SUCCESS))),
            protocol::GET_PID => Ok(Some(Response::pid(std::process::id()))),
            protocol::GET_MEMBERSHIP_COUNT => Ok(Some(Response::membership_count(
                self.monitor.membership_count(),
            ))),
            protocol::GET_MEMBERSHIP_LIST => {
                Ok(Some(Response::members(self.monitor.snapshot())))
            }
            protocol::WIPEOUT => {
                self.store.clear();
                self.cache.clear();
                Ok(Some(Response::status(protocol::SUCCESS)))
            }
            protocol::SHUTDOWN => {
                info!("Shutdown requested, exiting");
                std::process::exit(0);
            }
            other => {
                debug!("Unknown command 0x{:02x}", other);
                Ok(Some(Response::status(protocol::UNKNOWN_CMD)))
            }
        }
    }

    /// A client PUT or REMOVE. Forwarded to the owner if that is not us;
    /// otherwise we are the chain head and the proposal starts here.
    async fn client_write(
        &self,
        envelope: Envelope,
        src: SocketAddr,
        request: Request,
    ) -> Result<Option<Response>> {
        if let Some(forwarded) = self.forward_to_owner(envelope.clone(), src, &request).await? {
            return Ok(forwarded);
        }

        // admission runs at the head so a doomed write never enters the chain
        let status = match request.command {
            protocol::PUT => self.store.validate_put(&request.key, &request.value),
            _ => {
                if request.key.is_empty() || request.key.len() > crate::store::MAX_KEY_SIZE {
                    protocol::BAD_KEY
                } else if !self.store.contains(&request.key) {
                    protocol::NO_KEY
                } else {
                    protocol::SUCCESS
                }
            }
        };
        if status != protocol::SUCCESS {
            return Ok(Some(Response::status(status)));
        }

        let deferred = Deferred {
            envelope: envelope.clone(),
            src,
        };
        if !self.pending.try_acquire_or_defer(&request.key, deferred) {
            return Ok(None);
        }

        let backups = self.monitor.live_replicas();
        if backups.is_empty() {
            let response = self.apply_write(&request);
            self.release_and_redispatch(&request.key);
            return Ok(Some(response));
        }
        self.acks.insert(request.key.clone(), 0);

        let propose_cmd = match request.command {
            protocol::PUT => protocol::REPLICA_PUT,
            _ => protocol::REPLICA_REMOVE,
        };
        let proposal = Request::write(
            propose_cmd,
            request.key.clone(),
            request.value.clone(),
            request.version,
        );
        let fanout = Envelope::new(envelope.message_id.clone(), proposal.encode()?).with_routing(
            Some(envelope.client.unwrap_or(src)),
            Some(self.local.addr().port()),
        );
        for backup in &backups {
            if let Err(e) = self.transport.send(backup.addr(), &fanout).await {
                warn!("Proposal fanout to {} failed: {}", backup, e);
            }
        }

        Ok(None)
    }

    /// A proposal arriving at a backup: lock the key and acknowledge to the
    /// head. Nothing is applied until the commit wave.
    async fn replica_propose(
        &self,
        envelope: Envelope,
        src: SocketAddr,
        request: Request,
    ) -> Result<Option<Response>> {
        let deferred = Deferred {
            envelope: envelope.clone(),
            src,
        };
        if !self.pending.try_acquire_or_defer(&request.key, deferred) {
            return Ok(None);
        }

        let ack_cmd = match request.command {
            protocol::REPLICA_PUT => protocol::ACK_PUT,
            _ => protocol::ACK_REMOVE,
        };
        let head = head_addr(&envelope.head_port, src)?;
        // the ack carries the operation so the head keeps no proposal state
        let ack = Request::write(ack_cmd, request.key, request.value, request.version);
        let reply = Envelope::new(envelope.message_id, ack.encode()?)
            .with_routing(envelope.client, None);
        self.transport.send(head, &reply).await?;
        Ok(None)
    }

    /// An ack arriving back at the head. When every live backup has
    /// acknowledged, the head applies the write and releases the commit
    /// wave down the chain.
    async fn head_ack(
        &self,
        envelope: Envelope,
        request: Request,
    ) -> Result<Option<Response>> {
        // an ack is only valid while the head still holds the key lock; a
        // proposal whose lock was abandoned must not commit late
        if !self.pending.is_locked(&request.key) {
            self.acks.remove(&request.key);
            return Ok(None);
        }

        let count = {
            let mut tally = match self.acks.get_mut(&request.key) {
                Some(tally) => tally,
                // stale ack for a proposal already committed or abandoned
                None => return Ok(None),
            };
            *tally += 1;
            *tally
        };

        let backups = self.monitor.live_replicas();
        if count < backups.len() {
            return Ok(None);
        }
        self.acks.remove(&request.key);

        let status = self.store_apply(&request);
        let response = Response::status(status);
        if status != protocol::NO_MEM {
            self.cache
                .insert(envelope.message_id.clone(), response.encode()?);
        }
        self.release_and_redispatch(&request.key);

        if backups.is_empty() {
            // every backup died between proposal and commit
            return Ok(Some(response));
        }

        let (commit_cmd, tail_cmd) = match request.command {
            protocol::ACK_PUT => (protocol::REPLICA_ACK_PUT, protocol::TAIL_ACK_PUT),
            _ => (protocol::REPLICA_ACK_REMOVE, protocol::TAIL_ACK_REMOVE),
        };
        let (tail, middles) = match backups.split_last() {
            Some((tail, middles)) => (tail, middles),
            None => return Ok(Some(response)),
        };

        for backup in middles {
            let commit = Request::write(
                commit_cmd,
                request.key.clone(),
                request.value.clone(),
                request.version,
            );
            let wave = Envelope::new(envelope.message_id.clone(), commit.encode()?)
                .with_routing(envelope.client, None);
            if let Err(e) = self.transport.send(backup.addr(), &wave).await {
                warn!("Commit wave to {} failed: {}", backup, e);
            }
        }

        // the tail answers the client, proving the whole chain holds the write
        let commit = Request::write(tail_cmd, request.key, request.value, request.version);
        let wave = Envelope::new(envelope.message_id, commit.encode()?)
            .with_routing(envelope.client, None);
        if let Err(e) = self.transport.send(tail.addr(), &wave).await {
            warn!("Tail commit to {} failed: {}", tail, e);
        }

        Ok(None)
    }

    /// A commit arriving at a mid-chain backup: apply, release the lock,
    /// and stay silent. Catch-up transfers reuse this command as a direct
    /// request, recognizable by the missing client address; those get a
    /// reply so the sender's retry loop settles.
    fn replica_commit(
        &self,
        envelope: Envelope,
        request: Request,
    ) -> Result<Option<Response>> {
        let status = self.store_apply(&request);
        self.release_and_redispatch(&request.key);

        if envelope.client.is_none() {
            return Ok(Some(Response::status(status)));
        }
        Ok(None)
    }

    /// The commit at the chain tail. The returned response flows to the
    /// original client via the routing address.
    fn tail_commit(&self, request: Request) -> Response {
        let status = match request.command {
            protocol::TAIL_ACK_PUT => {
                self.store
                    .put(request.key.clone(), request.value, request.version)
            }
            _ => self.store.remove(&request.key),
        };
        self.release_and_redispatch(&request.key);
        Response::status(status)
    }

    /// A client GET. The owner serializes it behind any in-flight write,
    /// then reads at the chain tail, where a committed write is guaranteed
    /// visible.
    async fn client_get(
        &self,
        envelope: Envelope,
        src: SocketAddr,
        request: Request,
    ) -> Result<Option<Response>> {
        if let Some(forwarded) = self.forward_to_owner(envelope.clone(), src, &request).await? {
            return Ok(forwarded);
        }

        if request.key.is_empty() || request.key.len() > crate::store::MAX_KEY_SIZE {
            return Ok(Some(Response::status(protocol::BAD_KEY)));
        }

        let backups = self.monitor.live_replicas();
        if backups.is_empty() {
            if self.pending.defer_if_locked(&request.key, Deferred { envelope, src }) {
                return Ok(None);
            }
            return Ok(Some(self.read_local(&request.key)));
        }

        let deferred = Deferred {
            envelope: envelope.clone(),
            src,
        };
        if !self.pending.try_acquire_or_defer(&request.key, deferred) {
            return Ok(None);
        }

        let tail = match self.monitor.chain_tail() {
            Some(tail) => tail,
            None => {
                self.release_and_redispatch(&request.key);
                return Ok(Some(self.read_local(&request.key)));
            }
        };
        let read = Request::keyed(protocol::TAIL_GET, request.key);
        let fanout = Envelope::new(envelope.message_id, read.encode()?).with_routing(
            Some(envelope.client.unwrap_or(src)),
            Some(self.local.addr().port()),
        );
        self.transport.send(tail.addr(), &fanout).await?;
        Ok(None)
    }

    /// A read arriving at the chain tail. Defers behind a local write in
    /// flight, otherwise answers the client and releases the head's lock.
    async fn tail_get(
        &self,
        envelope: Envelope,
        src: SocketAddr,
        request: Request,
    ) -> Result<Option<Response>> {
        let deferred = Deferred {
            envelope: envelope.clone(),
            src,
        };
        if self.pending.defer_if_locked(&request.key, deferred) {
            return Ok(None);
        }

        let response = self.read_local(&request.key);

        let release = Request::keyed(protocol::ACK_GET, request.key);
        let reply = Envelope::new(envelope.message_id.clone(), release.encode()?);
        let head = head_addr(&envelope.head_port, src)?;
        self.transport.send(head, &reply).await?;

        Ok(Some(response))
    }

    /// Routes a client command to the key's owner when that is another
    /// node. Returns `Some(None)` when the envelope was handed off, and
    /// `Some(response)` when there is no owner to hand it to.
    async fn forward_to_owner(
        &self,
        mut envelope: Envelope,
        src: SocketAddr,
        request: &Request,
    ) -> Result<Option<Option<Response>>> {
        let owner = {
            let ring = self
                .monitor
                .ring();
            let ring = ring
                .read()
                .map_err(|_| anyhow::anyhow!("ring lock poisoned"))?;
            ring.node_for_key(&request.key)
        };

        match owner {
            None => {
                warn!("No nodes in ring, dropping request");
                Ok(Some(None))
            }
            Some(owner) if owner == self.local => Ok(None),
            Some(owner) => {
                envelope.client = Some(envelope.client.unwrap_or(src));
                self.transport.send(owner.addr(), &envelope).await?;
                Ok(Some(None))
            }
        }
    }

    fn read_local(&self, key: &[u8]) -> Response {
        match self.store.get(key) {
            Some(stored) => Response::value(protocol::SUCCESS, stored.value, stored.version),
            None => Response::status(protocol::NO_KEY),
        }
    }

    /// Applies a committed write locally, picking put or remove from the
    /// command family.
    fn store_apply(&self, request: &Request) -> u8 {
        match request.command {
            protocol::ACK_PUT | protocol::REPLICA_ACK_PUT => {
                self.store
                    .put(request.key.clone(), request.value.clone(), request.version)
            }
            _ => self.store.remove(&request.key),
        }
    }

    fn apply_write(&self, request: &Request) -> Response {
        let status = match request.command {
            protocol::PUT => {
                self.store
                    .put(request.key.clone(), request.value.clone(), request.version)
            }
            _ => self.store.remove(&request.key),
        };
        Response::status(status)
    }

    fn release_and_redispatch(&self, key: &[u8]) {
        let replay = self.pending.release(key);
        self.redispatch(replay);
    }

    fn redispatch(&self, messages: Vec<Deferred>) {
        let Some(coordinator) = self.handle.upgrade() else {
            return;
        };
        for message in messages {
            let coordinator = coordinator.clone();
            tokio::spawn(async move {
                // a retransmission parked behind the lock may have been
                // answered already; replay the cached response instead of
                // re-executing it
                if let Some(cached) = coordinator.cache.lookup(&message.envelope.message_id) {
                    let reply_to = message.envelope.client.unwrap_or(message.src);
                    if let Err(e) = coordinator
                        .transport
                        .respond(message.envelope.message_id, cached, reply_to)
                        .await
                    {
                        warn!("Deferred replay to {} failed: {}", reply_to, e);
                    }
                    return;
                }
                coordinator
                    .handle_and_respond(message.envelope, message.src)
                    .await;
            });
        }
    }

    /// Force-releases locks whose protocol run died mid-flight, discards
    /// their ack tallies, and replays whatever queued behind them.
    pub fn abandon_expired_locks(&self) {
        let abandoned = self.pending.abandon_expired();
        if abandoned.is_empty() {
            return;
        }
        warn!("Abandoned {} stuck key locks", abandoned.len());
        for (key, replay) in abandoned {
            self.acks.remove(&key);
            self.redispatch(replay);
        }
    }
}

/// Resolves the head's serving address for a chain ack: the packet source
/// gives the IP, the envelope carries the server port because fanout
/// arrives from an ephemeral socket.
fn head_addr(head_port: &Option<u16>, src: SocketAddr) -> Result<SocketAddr> {
    match head_port {
        Some(port) => Ok(SocketAddr::new(src.ip(), *port)),
        None => anyhow::bail!("chain message without a head port"),
    }
}

//! Datagram Server
//!
//! The inbound loop. Every datagram is decoded, answered from the request
//! cache when its message identifier was seen before, and otherwise handed
//! to the coordinator on its own task so a slow chain never blocks the
//! socket.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

use crate::codec::{Envelope, MAX_DATAGRAM_SIZE};
use crate::replication::Coordinator;
use crate::store::RequestCache;
use crate::transport::UdpTransport;

const SWEEP_INTERVAL: Duration = Duration::from_secs(1);

pub struct Server {
    socket: UdpSocket,
    coordinator: Arc<Coordinator>,
    cache: Arc<RequestCache>,
    transport: Arc<UdpTransport>,
}

impl Server {
    /// Takes a pre-bound socket so the caller decides the serving address.
    pub fn new(
        socket: UdpSocket,
        coordinator: Arc<Coordinator>,
        cache: Arc<RequestCache>,
        transport: Arc<UdpTransport>,
    ) -> Arc<Self> {
        Arc::new(Self {
            socket,
            coordinator,
            cache,
            transport,
        })
    }

    pub async fn run(self: Arc<Self>) -> Result<()> {
        info!("Serving on {}", self.socket.local_addr()?);
        self.clone().start_sweeper();

        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!("Receive failed: {}", e);
                    continue;
                }
            };

            let envelope = match Envelope::decode(&buf[..len]) {
                Ok(envelope) => envelope,
                Err(e) => {
                    // sender retries; a damaged packet is simply dropped
                    debug!("Dropping packet from {}: {}", src, e);
                    continue;
                }
            };

            if let Some(cached) = self.cache.lookup(&envelope.message_id) {
                self.replay(envelope, src, cached).await;
                continue;
            }

            let coordinator = self.coordinator.clone();
            tokio::spawn(async move {
                coordinator.handle_and_respond(envelope, src).await;
            });
        }
    }

    /// A retransmitted request: send the original response bytes again
    /// without re-executing anything.
    async fn replay(&self, envelope: Envelope, src: SocketAddr, cached: Vec<u8>) {
        let reply_to = envelope.client.unwrap_or(src);
        debug!("Replaying cached response to {}", reply_to);
        if let Err(e) = self
            .transport
            .respond(envelope.message_id, cached, reply_to)
            .await
        {
            warn!("Replay to {} failed: {}", reply_to, e);
        }
    }

    fn start_sweeper(self: Arc<Self>) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                self.cache.purge_expired();
                self.coordinator.abandon_expired_locks();
            }
        });
    }
}

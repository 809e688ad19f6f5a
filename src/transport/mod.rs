//! UDP Transport
//!
//! Request/response over raw datagrams. Each outbound request gets a fresh
//! ephemeral socket and a unique message identifier; the reply must echo
//! the identifier and carry a valid checksum, otherwise it is treated as
//! not-yet-arrived and the wait continues. Timeouts double per retry.
//!
//! A second, shared socket serves fire-and-forget sends: replica fanout,
//! chain acks and request forwarding, where the protocol's own retry layer
//! (the client's) covers losses.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use tokio::net::UdpSocket;
use tracing::debug;

use crate::codec::{generate_message_id, Envelope, MAX_DATAGRAM_SIZE};

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(100);
const MAX_RETRIES: u32 = 3;

pub struct UdpTransport {
    local: SocketAddr,
    oneway: UdpSocket,
}

impl UdpTransport {
    /// `local` is the node's serving address; it seeds message-identifier
    /// generation and is never bound here.
    pub async fn new(local: SocketAddr) -> Result<Arc<Self>> {
        let oneway = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding one-way transport socket")?;
        Ok(Arc::new(Self { local, oneway }))
    }

    /// Sends a payload and waits for the matching reply, retrying with a
    /// doubling timeout. Replies with a foreign message identifier or a bad
    /// checksum are ignored within the attempt's window.
    pub async fn request(&self, target: SocketAddr, payload: Vec<u8>) -> Result<Envelope> {
        let socket = UdpSocket::bind("0.0.0.0:0")
            .await
            .context("binding request socket")?;
        let message_id = generate_message_id(self.local);
        let datagram = Envelope::new(message_id.clone(), payload).encode()?;

        let mut wait = DEFAULT_TIMEOUT;
        for attempt in 0..=MAX_RETRIES {
            socket.send_to(&datagram, target).await?;

            match tokio::time::timeout(wait, Self::recv_matching(&socket, &message_id)).await {
                Ok(reply) => return reply,
                Err(_) => {
                    debug!(
                        "Request to {} timed out (attempt {}/{})",
                        target,
                        attempt + 1,
                        MAX_RETRIES + 1
                    );
                    wait *= 2;
                }
            }
        }

        bail!("node {} unreachable after {} attempts", target, MAX_RETRIES + 1)
    }

    /// Reads datagrams until one decodes cleanly and echoes our identifier.
    async fn recv_matching(socket: &UdpSocket, message_id: &[u8]) -> Result<Envelope> {
        let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];
        loop {
            let (len, _) = socket.recv_from(&mut buf).await?;
            match Envelope::decode(&buf[..len]) {
                Ok(envelope) if envelope.message_id == message_id => return Ok(envelope),
                Ok(_) => debug!("Discarding reply with foreign message id"),
                Err(e) => debug!("Discarding undecodable reply: {}", e),
            }
        }
    }

    /// Fire-and-forget send of a pre-built envelope.
    pub async fn send(&self, target: SocketAddr, envelope: &Envelope) -> Result<()> {
        let datagram = envelope.encode()?;
        self.oneway.send_to(&datagram, target).await?;
        Ok(())
    }

    /// Sends a response envelope carrying the original request's identifier
    /// so the waiting side can match it.
    pub async fn respond(
        &self,
        message_id: Vec<u8>,
        payload: Vec<u8>,
        target: SocketAddr,
    ) -> Result<()> {
        let envelope = Envelope::new(message_id, payload);
        self.send(target, &envelope).await
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local
    }
}

use std::net::{IpAddr, SocketAddr};
use std::sync::OnceLock;
use std::time::Instant;

use anyhow::Result;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard cap on datagram size; larger envelopes are a caller bug.
pub const MAX_DATAGRAM_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("malformed envelope: {0}")]
    Malformed(#[from] bincode::Error),
    #[error("checksum mismatch, packet corrupt")]
    Corrupt,
}

/// The envelope every datagram carries.
///
/// `client` holds the original client address so a response can be sent
/// directly from whichever node terminates a multi-hop operation.
/// `head_port` is the return port for chain-ack routing: fanout messages are
/// sent from an ephemeral socket, so the receiving replica cannot infer the
/// head's server port from the packet source.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub message_id: Vec<u8>,
    pub payload: Vec<u8>,
    pub checksum: u32,
    pub client: Option<SocketAddr>,
    pub head_port: Option<u16>,
}

impl Envelope {
    pub fn new(message_id: Vec<u8>, payload: Vec<u8>) -> Self {
        let checksum = checksum(&message_id, &payload);
        Self {
            message_id,
            payload,
            checksum,
            client: None,
            head_port: None,
        }
    }

    pub fn with_routing(mut self, client: Option<SocketAddr>, head_port: Option<u16>) -> Self {
        self.client = client;
        self.head_port = head_port;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Parses and verifies an inbound datagram. Corruption is reported as a
    /// value, not a panic or a generic error: the caller drops the packet
    /// and lets the sender's retry machinery recover.
    pub fn decode(buf: &[u8]) -> Result<Envelope, DecodeError> {
        let envelope: Envelope = bincode::deserialize(buf)?;
        if envelope.checksum != checksum(&envelope.message_id, &envelope.payload) {
            return Err(DecodeError::Corrupt);
        }
        Ok(envelope)
    }
}

/// CRC32 over `messageID ++ payload`.
pub fn checksum(message_id: &[u8], payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(message_id);
    hasher.update(payload);
    hasher.finalize()
}

/// Generates a unique request identifier: sender address + port + two random
/// bytes + a monotonic clock sample. Uniqueness only has to hold per sender
/// within the request-cache TTL.
pub fn generate_message_id(local: SocketAddr) -> Vec<u8> {
    let mut id = Vec::with_capacity(26);
    match local.ip() {
        IpAddr::V4(ip) => id.extend_from_slice(&ip.octets()),
        IpAddr::V6(ip) => id.extend_from_slice(&ip.octets()),
    }
    id.extend_from_slice(&local.port().to_le_bytes());
    id.extend_from_slice(&rand::thread_rng().gen::<[u8; 2]>());
    id.extend_from_slice(&monotonic_nanos().to_be_bytes());
    id
}

fn monotonic_nanos() -> u64 {
    static START: OnceLock<Instant> = OnceLock::new();
    START.get_or_init(Instant::now).elapsed().as_nanos() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_roundtrip() {
        let id = generate_message_id("127.0.0.1:4000".parse().unwrap());
        let envelope = Envelope::new(id.clone(), b"payload".to_vec())
            .with_routing(Some("10.0.0.1:9999".parse().unwrap()), Some(4000));

        let bytes = envelope.encode().unwrap();
        let decoded = Envelope::decode(&bytes).unwrap();

        assert_eq!(decoded.message_id, id);
        assert_eq!(decoded.payload, b"payload");
        assert_eq!(decoded.client, envelope.client);
        assert_eq!(decoded.head_port, Some(4000));
    }

    #[test]
    fn corrupt_checksum_is_a_decode_outcome() {
        let envelope = Envelope::new(vec![1, 2, 3], b"data".to_vec());
        let mut bytes = envelope.encode().unwrap();
        // flip a payload bit
        let n = bytes.len();
        bytes[n / 2] ^= 0xFF;

        match Envelope::decode(&bytes) {
            Err(DecodeError::Corrupt) | Err(DecodeError::Malformed(_)) => {}
            other => panic!("expected corrupt/malformed, got {:?}", other),
        }
    }

    #[test]
    fn truncated_packet_is_malformed() {
        let envelope = Envelope::new(vec![1, 2, 3], b"data".to_vec());
        let bytes = envelope.encode().unwrap();

        assert!(Envelope::decode(&bytes[..4]).is_err());
    }

    #[test]
    fn message_ids_are_unique() {
        let addr: SocketAddr = "127.0.0.1:4000".parse().unwrap();
        let a = generate_message_id(addr);
        let b = generate_message_id(addr);
        assert_ne!(a, b);
    }
}

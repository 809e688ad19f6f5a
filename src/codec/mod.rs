//! Wire Codec
//!
//! Frames and parses the binary envelope carried by every datagram, client
//! and inter-node alike. Envelopes are bincode-serialized and protected by a
//! CRC32 checksum over `messageID ++ payload`; a mismatch is a normal decode
//! outcome (`DecodeError::Corrupt`), handled by dropping the packet and
//! relying on sender-side retry.
//!
//! The payload is a command-specific [`Request`] or [`Response`], also
//! bincode-serialized. Command and response codes are fixed single-byte
//! values shared by every node and client.

pub mod envelope;
pub mod protocol;

pub use envelope::{generate_message_id, Envelope, DecodeError, MAX_DATAGRAM_SIZE};
pub use protocol::{MemberEntry, Request, Response};

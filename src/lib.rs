//! Replicated In-Memory Key-Value Store
//!
//! This library crate defines the core modules of a peer-to-peer key-value
//! store for small clusters communicating over unreliable UDP datagrams.
//! It serves as the foundation for the node executable (`main.rs`).
//!
//! ## Architecture Modules
//! The system is composed of loosely coupled subsystems:
//!
//! - **`codec`**: The wire layer. Frames and parses the checksummed binary
//!   envelope every datagram carries, and defines the command/response
//!   payload types.
//! - **`store`**: Local node state. A bounded key-value map with
//!   memory-pressure admission control, plus the request cache that makes
//!   retransmitted requests idempotent.
//! - **`ring`**: Consistent hashing. Maps keys and nodes into one hash space
//!   and answers ownership and neighbor queries.
//! - **`membership`**: The cluster coordination layer. A pull-gossip failure
//!   detector that maintains ring membership and the local replica chain.
//! - **`replication`**: The coordination engine. Routes client commands,
//!   drives the chain-replication propose/ack/commit protocol, and
//!   serializes concurrent operations per key.
//! - **`transport`**: UDP send/receive with request identification, retry,
//!   and exponential backoff.
//! - **`server`**: The inbound datagram loop tying the layers together.

pub mod codec;
pub mod membership;
pub mod replication;
pub mod ring;
pub mod server;
pub mod store;
pub mod transport;

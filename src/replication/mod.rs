//! Chain Replication
//!
//! The coordination engine. The owner of a key acts as chain head: a write
//! is proposed to every live backup, each backup locks the key and
//! acknowledges without mutating, and only when every live backup has
//! acknowledged does the head apply the write and release a commit wave
//! down the chain. The tail applies last and sends the client-visible
//! response, so a response proves the full chain holds the write.
//!
//! Concurrent operations on one key are serialized by per-key pending-write
//! locks (`locks`); messages arriving for a locked key are deferred and
//! re-dispatched on release.

pub mod coordinator;
pub mod locks;

pub use coordinator::Coordinator;
pub use locks::{Deferred, PendingWrites};

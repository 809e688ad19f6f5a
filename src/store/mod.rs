//! Local Node State
//!
//! Holds everything a single node keeps in memory: the bounded key-value
//! map with admission control (`memory`) and the at-most-once request cache
//! that lets retransmitted requests replay their original response instead
//! of re-executing (`request_cache`).

pub mod memory;
pub mod request_cache;

pub use memory::{LocalStore, VersionedValue, MAX_KEY_SIZE, MAX_VALUE_SIZE};
pub use request_cache::RequestCache;

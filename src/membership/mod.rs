//! Cluster Membership
//!
//! A pull-based gossip failure detector. Every node keeps a last-alive
//! timestamp per peer, refreshes its own entry each tick, probes one random
//! peer for its membership list, and merges by taking the freshest
//! timestamp per node. A node whose timestamp goes stale past a
//! cluster-size-scaled threshold is declared dead; it is removed from the
//! hash ring and the local replica chain is repaired. A dead node whose
//! timestamp turns fresh again is re-admitted at its original ring position
//! and handed back the keys it owns.

pub mod chain;
pub mod monitor;
pub mod types;

pub use chain::ReplicaChain;
pub use monitor::MembershipMonitor;
pub use types::NodeId;

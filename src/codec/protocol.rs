//! Command and Response Payloads
//!
//! Defines the fixed command/response codes and the payload structs carried
//! inside the wire envelope for every operation, client-facing and
//! inter-node alike.

use anyhow::Result;
use serde::{Deserialize, Serialize};

// --- Command codes ---

pub const PUT: u8 = 0x01;
pub const GET: u8 = 0x02;
pub const REMOVE: u8 = 0x03;
pub const SHUTDOWN: u8 = 0x04;
pub const WIPEOUT: u8 = 0x05;
pub const IS_ALIVE: u8 = 0x06;
pub const GET_PID: u8 = 0x07;
pub const GET_MEMBERSHIP_COUNT: u8 = 0x08;
pub const GET_MEMBERSHIP_LIST: u8 = 0x22;
pub const REPLICA_PUT: u8 = 0x23;
pub const REPLICA_REMOVE: u8 = 0x24;
pub const TAIL_GET: u8 = 0x25;
pub const ACK_PUT: u8 = 0x27;
pub const ACK_REMOVE: u8 = 0x28;
pub const ACK_GET: u8 = 0x29;
pub const REPLICA_ACK_PUT: u8 = 0x30;
pub const REPLICA_ACK_REMOVE: u8 = 0x31;
pub const TAIL_ACK_PUT: u8 = 0x33;
pub const TAIL_ACK_REMOVE: u8 = 0x34;

// --- Response codes ---

pub const SUCCESS: u8 = 0x00;
pub const NO_KEY: u8 = 0x01;
pub const NO_MEM: u8 = 0x02;
pub const TEMP_OVERLOAD: u8 = 0x03;
pub const STORE_FAILURE: u8 = 0x04;
pub const UNKNOWN_CMD: u8 = 0x05;
pub const BAD_KEY: u8 = 0x06;
pub const BAD_VALUE: u8 = 0x07;

/// A request payload. Fields that a command does not use stay empty; the
/// command code decides which ones are read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    pub command: u8,
    pub key: Vec<u8>,
    pub value: Vec<u8>,
    pub version: i32,
}

impl Request {
    /// A command with no key or value (IS_ALIVE, WIPEOUT, gossip probes...).
    pub fn control(command: u8) -> Self {
        Self {
            command,
            key: Vec::new(),
            value: Vec::new(),
            version: 0,
        }
    }

    /// A command addressing a key without a value (GET, REMOVE, acks).
    pub fn keyed(command: u8, key: Vec<u8>) -> Self {
        Self {
            command,
            key,
            value: Vec::new(),
            version: 0,
        }
    }

    /// A write-shaped command (PUT and the replicate/ack/commit variants).
    pub fn write(command: u8, key: Vec<u8>, value: Vec<u8>, version: i32) -> Self {
        Self {
            command,
            key,
            value,
            version,
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

/// One membership record as reported over the wire.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemberEntry {
    /// Canonical "ip:port" form of the node identity.
    pub addr: String,
    /// Last-alive logical timestamp, milliseconds since the Unix epoch.
    pub last_alive_ms: u64,
}

/// A response payload. Every response carries a status code; the remaining
/// fields are filled per command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    pub status: u8,
    pub value: Option<Vec<u8>>,
    pub version: i32,
    pub pid: Option<u32>,
    pub membership_count: Option<u32>,
    pub members: Vec<MemberEntry>,
}

impl Response {
    pub fn status(status: u8) -> Self {
        Self {
            status,
            value: None,
            version: 0,
            pid: None,
            membership_count: None,
            members: Vec::new(),
        }
    }

    pub fn value(status: u8, value: Vec<u8>, version: i32) -> Self {
        Self {
            value: Some(value),
            version,
            ..Self::status(status)
        }
    }

    pub fn pid(pid: u32) -> Self {
        Self {
            pid: Some(pid),
            ..Self::status(SUCCESS)
        }
    }

    pub fn membership_count(count: u32) -> Self {
        Self {
            membership_count: Some(count),
            ..Self::status(SUCCESS)
        }
    }

    pub fn members(members: Vec<MemberEntry>) -> Self {
        Self {
            members,
            ..Self::status(SUCCESS)
        }
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(buf: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(buf)?)
    }
}

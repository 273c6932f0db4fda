//! Naming Manager Types
//!
//! Value types for the registry, directory, ACLs, access requests and
//! trash. The persisted JSON shapes live in `state.rs`; these are the
//! in-memory forms the handlers work with.

use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Reserved pseudo-user consulted as the public fallback grant.
pub const ANONYMOUS: &str = "anonymous";

/// A registered storage server as the naming manager sees it.
#[derive(Debug, Clone)]
pub struct StorageServer {
    pub ss_id: u32,
    /// Peer IP observed on the registration socket.
    pub addr: String,
    pub ctrl_port: u16,
    pub data_port: u16,
    pub last_heartbeat: Instant,
    pub is_up: bool,
}

impl StorageServer {
    /// `host:port` of the data endpoint, if the server ever registered one.
    pub fn data_addr(&self) -> Option<String> {
        if self.data_port == 0 {
            None
        } else {
            Some(format!("{}:{}", self.addr, self.data_port))
        }
    }
}

/// Permission level of a grant. `W` alone does not imply `R` bitwise;
/// read-like operations check the read side, everything else the write
/// side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Perm {
    R,
    W,
    RW,
}

impl Perm {
    pub fn allows_read(self) -> bool {
        matches!(self, Perm::R | Perm::RW)
    }

    pub fn allows_write(self) -> bool {
        matches!(self, Perm::W | Perm::RW)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Perm::R => "R",
            Perm::W => "W",
            Perm::RW => "RW",
        }
    }

    /// Lenient wire parse: `RW` and `W`-leading strings keep their write
    /// side, anything else reads.
    pub fn parse(s: &str) -> Perm {
        match s {
            "RW" => Perm::RW,
            "W" => Perm::W,
            _ => Perm::R,
        }
    }
}

/// Per-file access control: one optional owner (implicit RW) plus
/// user grants. The [`ANONYMOUS`] grant is the public fallback.
#[derive(Debug, Clone, Default)]
pub struct AclEntry {
    pub owner: Option<String>,
    pub grants: std::collections::BTreeMap<String, Perm>,
}

/// One file's placement and access metadata.
#[derive(Debug, Clone)]
pub struct DirectoryEntry {
    pub primary: u32,
    /// Ordered replica set; never contains `primary`.
    pub replicas: Vec<u32>,
    pub last_modified_user: Option<String>,
    pub last_modified_time: i64,
    pub last_accessed_user: Option<String>,
    pub last_accessed_time: i64,
}

impl DirectoryEntry {
    pub fn new(primary: u32) -> Self {
        Self {
            primary,
            replicas: Vec::new(),
            last_modified_user: None,
            last_modified_time: 0,
            last_accessed_user: None,
            last_accessed_time: 0,
        }
    }
}

/// A pending access request. One per (file, user).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessRequest {
    pub user: String,
    pub mode: Perm,
}

/// A soft-deleted file awaiting restore or purge.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrashEntry {
    /// Original path, used as the restore key.
    pub file: String,
    /// Where the bytes live now: `.trash/<epoch>_<flattened>`.
    pub trashed: String,
    pub owner: String,
    pub ssid: u32,
    pub when: i64,
}

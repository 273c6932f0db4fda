//! Ticket Codec
//!
//! A ticket binds one naming-manager authorization decision to one
//! operation on one file at one storage server, for a bounded time.
//! Encoded as ASCII `file|op|ssid|exp|sig` where `sig` is a salted
//! rolling checksum over the other fields.
//!
//! The checksum is intentionally non-cryptographic: tickets defend
//! against accidental mis-routing and replay across files or operations,
//! not against a hostile actor.

use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

const SALT: &str = "DOCSPLUS-SALT-2025";

/// Default ticket lifetime handed out by the naming manager.
pub const TICKET_TTL_SECS: i64 = 600;

/// The operations a ticket can authorize.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TicketOp {
    Read,
    Write,
    Undo,
    Revert,
    Checkpoint,
    ViewCheckpoint,
    ListCheckpoints,
}

impl TicketOp {
    pub fn as_str(self) -> &'static str {
        match self {
            TicketOp::Read => "READ",
            TicketOp::Write => "WRITE",
            TicketOp::Undo => "UNDO",
            TicketOp::Revert => "REVERT",
            TicketOp::Checkpoint => "CHECKPOINT",
            TicketOp::ViewCheckpoint => "VIEWCHECKPOINT",
            TicketOp::ListCheckpoints => "LISTCHECKPOINTS",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "READ" => Some(TicketOp::Read),
            "WRITE" => Some(TicketOp::Write),
            "UNDO" => Some(TicketOp::Undo),
            "REVERT" => Some(TicketOp::Revert),
            "CHECKPOINT" => Some(TicketOp::Checkpoint),
            "VIEWCHECKPOINT" => Some(TicketOp::ViewCheckpoint),
            "LISTCHECKPOINTS" => Some(TicketOp::ListCheckpoints),
            _ => None,
        }
    }

    /// Operations that only observe state need R; everything else needs W.
    pub fn is_read_like(self) -> bool {
        matches!(
            self,
            TicketOp::Read | TicketOp::ViewCheckpoint | TicketOp::ListCheckpoints
        )
    }
}

impl fmt::Display for TicketOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Ticket {
    pub file: String,
    pub op: String,
    pub ss_id: u32,
    pub exp: i64,
    pub sig: u64,
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// djb2 rolling checksum over (file, op, salt, ssid, exp).
fn checksum(file: &str, op: &str, ss_id: u32, exp: i64) -> u64 {
    let mut sum: u64 = 5381;
    for b in file.bytes() {
        sum = sum.wrapping_shl(5).wrapping_add(sum).wrapping_add(b as u64);
    }
    for b in op.bytes() {
        sum = sum.wrapping_shl(5).wrapping_add(sum).wrapping_add(b as u64);
    }
    for b in SALT.bytes() {
        sum = sum.wrapping_shl(5).wrapping_add(sum).wrapping_add(b as u64);
    }
    sum = sum
        .wrapping_shl(5)
        .wrapping_add(sum)
        .wrapping_add(ss_id as u64);
    sum.wrapping_shl(5)
        .wrapping_add(sum)
        .wrapping_add(exp as u64)
}

impl Ticket {
    /// Issue a ticket for `op` on `file` at server `ss_id`, valid for
    /// `ttl_secs` from now.
    pub fn build(file: &str, op: TicketOp, ss_id: u32, ttl_secs: i64) -> Self {
        let op = op.as_str();
        let exp = now_epoch() + ttl_secs;
        let sig = checksum(file, op, ss_id, exp);
        Self {
            file: file.to_string(),
            op: op.to_string(),
            ss_id,
            exp,
            sig,
        }
    }

    pub fn encode(&self) -> String {
        format!(
            "{}|{}|{}|{}|{}",
            self.file, self.op, self.ss_id, self.exp, self.sig
        )
    }

    pub fn decode(raw: &str) -> Option<Self> {
        let mut parts = raw.split('|');
        let file = parts.next()?.to_string();
        let op = parts.next()?.to_string();
        let ss_id = parts.next()?.parse().ok()?;
        let exp = parts.next()?.parse().ok()?;
        let sig = parts.next()?.parse().ok()?;
        if parts.next().is_some() {
            return None;
        }
        Some(Self {
            file,
            op,
            ss_id,
            exp,
            sig,
        })
    }

    /// Validate a raw ticket against what the operation actually targets.
    /// Rejects on any field mismatch, a recomputed signature mismatch, or
    /// expiry.
    pub fn validate(raw: &str, file: &str, op: &str, expected_ss_id: u32) -> bool {
        let Some(t) = Self::decode(raw) else {
            return false;
        };
        if t.file != file || t.op != op || t.ss_id != expected_ss_id {
            return false;
        }
        if now_epoch() > t.exp {
            return false;
        }
        checksum(&t.file, &t.op, t.ss_id, t.exp) == t.sig
    }
}

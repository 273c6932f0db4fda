//! Wire Messages
//!
//! Defines the request payloads accepted by the naming manager and the
//! storage servers, plus the response shapes the two sides parse out of
//! each other's replies.
//!
//! Every payload is a flat JSON object. Requests carry a `type` tag;
//! responses carry a `status` field that is either `OK`, the stream
//! sentinel `STOP`, or one of the `ERR_*` kinds.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Terminal status of a reply frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    #[serde(rename = "OK")]
    Ok,
    #[serde(rename = "STOP")]
    Stop,
    #[serde(rename = "ERR_NOAUTH")]
    ErrNoauth,
    #[serde(rename = "ERR_NOTFOUND")]
    ErrNotfound,
    #[serde(rename = "ERR_LOCKED")]
    ErrLocked,
    #[serde(rename = "ERR_BADREQ")]
    ErrBadreq,
    #[serde(rename = "ERR_CONFLICT")]
    ErrConflict,
    #[serde(rename = "ERR_UNAVAILABLE")]
    ErrUnavailable,
    #[serde(rename = "ERR_INTERNAL")]
    ErrInternal,
}

impl Status {
    pub fn is_ok(self) -> bool {
        self == Status::Ok
    }
}

/// Requests understood by the naming manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum NmRequest {
    #[serde(rename = "SS_REGISTER")]
    SsRegister {
        #[serde(rename = "ssId")]
        ss_id: u32,
        #[serde(rename = "ssCtrlPort")]
        ss_ctrl_port: u16,
        #[serde(rename = "ssDataPort")]
        ss_data_port: u16,
    },
    #[serde(rename = "SS_HEARTBEAT")]
    SsHeartbeat {
        #[serde(rename = "ssId")]
        ss_id: u32,
    },
    /// A primary committed new bytes for `file`; fan the content out.
    #[serde(rename = "SS_COMMIT")]
    SsCommit {
        file: String,
        #[serde(rename = "ssId")]
        ss_id: u32,
    },
    /// A primary stored a named checkpoint; fan the checkpoint out.
    #[serde(rename = "SS_CHECKPOINT")]
    SsCheckpoint {
        file: String,
        name: String,
        #[serde(rename = "ssId")]
        ss_id: u32,
    },
    #[serde(rename = "LOOKUP")]
    Lookup {
        op: String,
        file: String,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "CREATE")]
    Create {
        file: String,
        #[serde(default)]
        user: Option<String>,
        #[serde(rename = "publicRead", default)]
        public_read: i64,
        #[serde(rename = "publicWrite", default)]
        public_write: i64,
    },
    #[serde(rename = "DELETE")]
    Delete {
        file: String,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "MIGRATE")]
    Migrate {
        file: String,
        #[serde(rename = "targetSsId")]
        target_ss_id: u32,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "RENAME")]
    Rename {
        file: String,
        #[serde(rename = "newFile")]
        new_file: String,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "CREATEFOLDER")]
    CreateFolder { path: String },
    #[serde(rename = "VIEWFOLDER")]
    ViewFolder {
        #[serde(default)]
        path: Option<String>,
    },
    #[serde(rename = "MOVE")]
    Move {
        src: String,
        dst: String,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "ADDACCESS")]
    AddAccess {
        file: String,
        user: String,
        mode: String,
    },
    #[serde(rename = "REMACCESS")]
    RemAccess { file: String, user: String },
    #[serde(rename = "VIEWREQUESTS")]
    ViewRequests { file: String, user: String },
    #[serde(rename = "REQUEST_ACCESS")]
    RequestAccess {
        file: String,
        user: String,
        #[serde(default)]
        mode: Option<String>,
    },
    #[serde(rename = "APPROVE_ACCESS")]
    ApproveAccess {
        file: String,
        /// Caller; must be the file owner.
        user: String,
        /// The requester being approved.
        target: String,
        #[serde(default)]
        mode: Option<String>,
    },
    #[serde(rename = "DENY_ACCESS")]
    DenyAccess {
        file: String,
        user: String,
        target: String,
    },
    #[serde(rename = "CLIENT_HELLO")]
    ClientHello {
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "LOGOUT")]
    Logout { user: String },
    #[serde(rename = "USER_SET_ACTIVE")]
    UserSetActive {
        user: String,
        #[serde(default)]
        active: i64,
    },
    #[serde(rename = "LIST_USERS")]
    ListUsers,
    #[serde(rename = "LIST_SS")]
    ListSs,
    #[serde(rename = "STATS")]
    Stats,
    #[serde(rename = "LISTTRASH")]
    ListTrash,
    #[serde(rename = "RESTORE")]
    Restore {
        file: String,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "EMPTYTRASH")]
    EmptyTrash {
        #[serde(default)]
        file: Option<String>,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "VIEW")]
    View {
        #[serde(default)]
        flags: Option<String>,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "INFO")]
    Info {
        file: String,
        #[serde(default)]
        user: Option<String>,
    },
    #[serde(rename = "EXEC")]
    Exec {
        file: String,
        #[serde(default)]
        user: Option<String>,
    },
}

/// Requests understood by a storage server's data port.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SsRequest {
    #[serde(rename = "READ")]
    Read { file: String, ticket: String },
    #[serde(rename = "STREAM")]
    Stream { file: String, ticket: String },
    #[serde(rename = "CREATE")]
    Create { file: String },
    #[serde(rename = "DELETE")]
    Delete { file: String },
    #[serde(rename = "CREATEFOLDER")]
    CreateFolder { path: String },
    #[serde(rename = "BEGIN_WRITE")]
    BeginWrite {
        file: String,
        #[serde(rename = "sentenceIndex", default)]
        sentence_index: i64,
        ticket: String,
    },
    #[serde(rename = "APPLY")]
    Apply {
        #[serde(rename = "wordIndex")]
        word_index: i64,
        content: String,
    },
    #[serde(rename = "END_WRITE")]
    EndWrite,
    #[serde(rename = "UNDO")]
    Undo { file: String, ticket: String },
    #[serde(rename = "REVERT")]
    Revert {
        file: String,
        name: String,
        ticket: String,
    },
    #[serde(rename = "CHECKPOINT")]
    Checkpoint {
        file: String,
        name: String,
        ticket: String,
    },
    #[serde(rename = "VIEWCHECKPOINT")]
    ViewCheckpoint {
        file: String,
        name: String,
        ticket: String,
    },
    #[serde(rename = "LISTCHECKPOINTS")]
    ListCheckpoints { file: String, ticket: String },
    #[serde(rename = "RENAME")]
    Rename {
        file: String,
        #[serde(rename = "newFile")]
        new_file: String,
    },
    /// Replication sink: atomically replace file contents. Implicit trust
    /// on the SS wire, no ticket.
    #[serde(rename = "PUT")]
    Put { file: String, body: String },
    #[serde(rename = "PUT_UNDO")]
    PutUndo { file: String, body: String },
    #[serde(rename = "PUT_CHECKPOINT")]
    PutCheckpoint {
        file: String,
        name: String,
        body: String,
    },
    #[serde(rename = "INFO")]
    Info { file: String, ticket: String },
}

/// Generic reply builder for flat `{status, ...}` objects.
///
/// Structured replies that the other side parses programmatically have
/// dedicated DTOs below; handlers assemble everything else through this.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reply {
    pub status: Status,
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub msg: Option<String>,
    #[serde(flatten)]
    pub fields: serde_json::Map<String, Value>,
}

impl Reply {
    pub fn ok() -> Self {
        Self::status(Status::Ok)
    }

    pub fn status(status: Status) -> Self {
        Self {
            status,
            msg: None,
            fields: serde_json::Map::new(),
        }
    }

    pub fn err(status: Status, msg: &str) -> Self {
        Self {
            status,
            msg: Some(msg.to_string()),
            fields: serde_json::Map::new(),
        }
    }

    pub fn with(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }
}

/// Minimal reply shape: just the status and an optional diagnostic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BasicReply {
    pub status: Status,
    #[serde(default)]
    pub msg: Option<String>,
}

/// Reply to `READ` and `VIEWCHECKPOINT`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadReply {
    pub status: Status,
    #[serde(default)]
    pub body: Option<String>,
}

/// Reply to a successful `LOOKUP`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LookupReply {
    pub status: Status,
    #[serde(rename = "ssAddr", default)]
    pub ss_addr: Option<String>,
    #[serde(rename = "ssDataPort", default)]
    pub ss_data_port: Option<u16>,
    #[serde(default)]
    pub ticket: Option<String>,
}

/// Reply to the storage-server `INFO` operation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SsInfoReply {
    pub status: Status,
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub mtime: i64,
    #[serde(default)]
    pub atime: i64,
    #[serde(default)]
    pub words: u64,
    #[serde(default)]
    pub chars: u64,
}

/// Reply to `LISTCHECKPOINTS`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointListReply {
    pub status: Status,
    #[serde(default)]
    pub checkpoints: Vec<String>,
}

/// One frame of a `STREAM` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamFrame {
    pub status: Status,
    #[serde(default)]
    pub word: Option<String>,
}

/// Decode the escape sequences the client shell may embed in free-text
/// content (`\n`, `\t`, `\r`, `\\`, `\"`).
pub fn unescape_content(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut chars = s.chars();
    while let Some(c) = chars.next() {
        if c != '\\' {
            out.push(c);
            continue;
        }
        match chars.next() {
            Some('n') => out.push('\n'),
            Some('r') => out.push('\r'),
            Some('t') => out.push('\t'),
            Some('\\') => out.push('\\'),
            Some('"') => out.push('"'),
            Some(other) => out.push(other),
            None => break,
        }
    }
    out
}

//! Distributed Collaborative Document Store Library
//!
//! This library crate defines the core modules shared by the two binaries:
//! the naming manager (`nm`) and the storage server (`ss`).
//!
//! ## Architecture Modules
//! The system is composed of three loosely coupled subsystems:
//!
//! - **`proto`**: The wire layer. Length-prefixed JSON framing over TCP,
//!   the typed request/response messages, and the ticket codec that binds
//!   naming-manager authorization decisions to storage-server operations.
//! - **`nm`**: The naming manager. Tracks storage servers (heartbeats,
//!   failover promotion), owns the file directory, ACLs, access requests,
//!   folders, trash and user sessions, persists all of it to a single JSON
//!   document, and fans out asynchronous replication tasks.
//! - **`ss`**: The storage server. Holds file bytes, named checkpoints and
//!   single-step undo snapshots, tokenizes documents into sentences, and
//!   runs the per-connection write-session state machine with
//!   sentence-level locking and merge-on-commit.

pub mod nm;
pub mod proto;
pub mod ss;

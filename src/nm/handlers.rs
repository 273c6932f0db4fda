//! Naming Manager Request Handlers
//!
//! One connection is served by one `handle_connection` task; it carries
//! any number of request/response pairs. Handlers translate local
//! failures into the wire error taxonomy: a failed connect is
//! `ERR_UNAVAILABLE`, a missing file `ERR_NOTFOUND`, an ACL violation
//! `ERR_NOAUTH`, a duplicate `ERR_CONFLICT`, an unexpected I/O failure
//! `ERR_INTERNAL`.

use anyhow::Result;
use serde_json::json;
use std::process::Stdio;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use sysinfo::System;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

use crate::proto::framing::{recv_raw, send_frame};
use crate::proto::message::{unescape_content, NmRequest, Reply, Status};
use crate::proto::ticket::{Ticket, TicketOp, TICKET_TTL_SECS};

use super::replicator::{CmdOp, ReplTask, Replicator};
use super::registry::SsRegistry;
use super::ssclient;
use super::state::NmState;
use super::types::{Perm, TrashEntry, ANONYMOUS};

pub struct NmContext {
    pub state: Arc<Mutex<NmState>>,
    pub registry: Arc<SsRegistry>,
    pub replicator: Arc<Replicator>,
    /// How many replicas a new file is assigned (baseline 1).
    pub replica_target: usize,
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

fn caller(user: Option<String>) -> String {
    match user {
        Some(u) if !u.is_empty() => u,
        _ => ANONYMOUS.to_string(),
    }
}

/// `.trash/<epoch>_<flattened>` name for a soft-deleted file.
fn trashed_path(file: &str, when: i64) -> String {
    let flat: String = file
        .chars()
        .map(|c| if c == '/' { '_' } else { c })
        .collect();
    format!(".trash/{}_{}", when, flat)
}

/// Serve one control-port connection until EOF. `peer_ip` is the socket's
/// remote address, recorded as the storage server's host on registration.
pub async fn handle_connection<S>(ctx: Arc<NmContext>, mut stream: S, peer_ip: String)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let raw = match recv_raw(&mut stream).await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("connection read failed: {}", e);
                break;
            }
        };
        let request: NmRequest = match serde_json::from_slice(&raw) {
            Ok(req) => req,
            Err(e) => {
                tracing::debug!("unparsable request: {}", e);
                if send_frame(&mut stream, &Reply::status(Status::ErrBadreq))
                    .await
                    .is_err()
                {
                    break;
                }
                continue;
            }
        };

        match handle_request(&ctx, &mut stream, &peer_ip, request).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => {
                tracing::debug!("connection write failed: {}", e);
                break;
            }
        }
    }
}

/// Dispatch one request. `Ok(false)` closes the connection.
async fn handle_request<S>(
    ctx: &NmContext,
    stream: &mut S,
    peer_ip: &str,
    request: NmRequest,
) -> Result<bool>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match request {
        // --- Storage-server facing ---
        NmRequest::SsRegister {
            ss_id,
            ss_ctrl_port,
            ss_data_port,
        } => {
            ctx.registry
                .register(ss_id, peer_ip, ss_ctrl_port, ss_data_port);
            tracing::info!(
                "registered ss{} ctrl={} data={} addr={}",
                ss_id,
                ss_ctrl_port,
                ss_data_port,
                peer_ip
            );
            resync_server(ctx, ss_id).await;
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::SsHeartbeat { ss_id } => {
            if ctx.registry.heartbeat(ss_id, peer_ip) {
                tracing::info!("ss{} transitioned UP", ss_id);
                resync_server(ctx, ss_id).await;
            }
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::SsCommit { file, ss_id } => {
            if file.is_empty() || ss_id == 0 {
                send_frame(stream, &Reply::status(Status::ErrBadreq)).await?;
                return Ok(true);
            }
            let mut st = ctx.state.lock().await;
            if st.directory.primary(&file) == Some(ss_id) {
                let replicas = st.directory.replicas(&file);
                ctx.replicator.fan_out_put(&file, ss_id, &replicas);
            }
            drop(st);
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::SsCheckpoint { file, name, ss_id } => {
            if file.is_empty() || name.is_empty() || ss_id == 0 {
                send_frame(stream, &Reply::status(Status::ErrBadreq)).await?;
                return Ok(true);
            }
            let mut st = ctx.state.lock().await;
            if st.directory.primary(&file) == Some(ss_id) {
                for target in st.directory.replicas(&file) {
                    ctx.replicator.enqueue(ReplTask::PutCheckpoint {
                        file: file.clone(),
                        name: name.clone(),
                        primary: ss_id,
                        target,
                    });
                }
            }
            drop(st);
            send_frame(stream, &Reply::ok()).await?;
        }

        // --- Lookup & tickets ---
        NmRequest::Lookup { op, file, user } => {
            let reply = lookup(ctx, &op, &file, &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        // --- File lifecycle ---
        NmRequest::Create {
            file,
            user,
            public_read,
            public_write,
        } => {
            let reply = create_file(ctx, &file, &caller(user), public_read != 0, public_write != 0)
                .await;
            send_frame(stream, &reply).await?;
        }

        NmRequest::Delete { file, user } => {
            let reply = delete_file(ctx, &file, &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        NmRequest::Restore { file, user } => {
            let reply = restore_file(ctx, &file, &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        NmRequest::EmptyTrash { file, user } => {
            let reply = empty_trash(ctx, file.as_deref(), &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        NmRequest::Rename {
            file,
            new_file,
            user,
        } => {
            let reply = rename_file(ctx, &file, &new_file, &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        NmRequest::Move { src, dst, user } => {
            let reply = move_path(ctx, &src, &dst, &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        NmRequest::Migrate {
            file,
            target_ss_id,
            user,
        } => {
            let reply = migrate_file(ctx, &file, target_ss_id, &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        // --- Folders ---
        NmRequest::CreateFolder { path } => {
            if path.is_empty() {
                send_frame(stream, &Reply::status(Status::ErrBadreq)).await?;
                return Ok(true);
            }
            let mut st = ctx.state.lock().await;
            st.add_folder(&path);
            save_or_log(&st).await;
            drop(st);
            // Best-effort physical folder on one available server, for
            // listing convenience.
            if let Some(ss_id) = ctx.registry.lowest_up() {
                if let Some(addr) = ctx.registry.data_addr(ss_id) {
                    if let Err(e) = ssclient::create_folder(&addr, &path).await {
                        tracing::warn!("physical CREATEFOLDER {} on ss{} failed: {}", path, ss_id, e);
                    }
                }
            }
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::ViewFolder { path } => {
            let reply = view_folder(ctx, path.as_deref().unwrap_or("")).await;
            send_frame(stream, &reply).await?;
        }

        // --- ACL & access requests ---
        NmRequest::AddAccess { file, user, mode } => {
            let perm = match mode.as_str() {
                "RW" => Perm::RW,
                "W" => Perm::W,
                _ => Perm::R,
            };
            let mut st = ctx.state.lock().await;
            st.acl_grant(&file, &user, perm);
            st.remove_request(&file, &user);
            save_or_log(&st).await;
            drop(st);
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::RemAccess { file, user } => {
            let mut st = ctx.state.lock().await;
            st.acl_revoke(&file, &user);
            save_or_log(&st).await;
            drop(st);
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::ViewRequests { file, user } => {
            let st = ctx.state.lock().await;
            if st.acl_owner(&file) != Some(user.as_str()) {
                drop(st);
                send_frame(stream, &Reply::status(Status::ErrNoauth)).await?;
                return Ok(true);
            }
            let requests: Vec<_> = st
                .list_requests(&file)
                .into_iter()
                .map(|r| json!({"user": r.user, "mode": r.mode.as_str()}))
                .collect();
            drop(st);
            send_frame(stream, &Reply::ok().with("requests", json!(requests))).await?;
        }

        NmRequest::RequestAccess { file, user, mode } => {
            let mode = match mode.as_deref() {
                Some(m) if m.starts_with('W') => Perm::W,
                _ => Perm::R,
            };
            let mut st = ctx.state.lock().await;
            let reply = if !st.directory.contains(&file) {
                Reply::status(Status::ErrNotfound)
            } else if st.add_request(&file, &user, mode) {
                save_or_log(&st).await;
                Reply::ok()
            } else {
                Reply::status(Status::ErrConflict)
            };
            drop(st);
            send_frame(stream, &reply).await?;
        }

        NmRequest::ApproveAccess {
            file,
            user,
            target,
            mode,
        } => {
            let mut st = ctx.state.lock().await;
            if st.acl_owner(&file) != Some(user.as_str()) {
                drop(st);
                send_frame(stream, &Reply::status(Status::ErrNoauth)).await?;
                return Ok(true);
            }
            // An approved writer gets the read side too.
            let perm = match mode.as_deref() {
                Some("W") | Some("RW") => Perm::RW,
                _ => Perm::R,
            };
            st.acl_grant(&file, &target, perm);
            st.remove_request(&file, &target);
            save_or_log(&st).await;
            drop(st);
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::DenyAccess { file, user, target } => {
            let mut st = ctx.state.lock().await;
            if st.acl_owner(&file) != Some(user.as_str()) {
                drop(st);
                send_frame(stream, &Reply::status(Status::ErrNoauth)).await?;
                return Ok(true);
            }
            st.remove_request(&file, &target);
            save_or_log(&st).await;
            drop(st);
            send_frame(stream, &Reply::ok()).await?;
        }

        // --- User sessions ---
        NmRequest::ClientHello { user } => {
            if let Some(user) = user.filter(|u| !u.is_empty()) {
                let mut st = ctx.state.lock().await;
                if st.user_is_active(&user) {
                    drop(st);
                    send_frame(
                        stream,
                        &Reply::err(Status::ErrConflict, "user-already-active"),
                    )
                    .await?;
                    // One active session per name; drop the second client.
                    return Ok(false);
                }
                tracing::info!("client hello from {}", user);
                st.set_user_active(&user, true);
                save_or_log(&st).await;
            }
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::Logout { user } => {
            if user.is_empty() {
                send_frame(stream, &Reply::status(Status::ErrBadreq)).await?;
                return Ok(true);
            }
            let mut st = ctx.state.lock().await;
            st.set_user_active(&user, false);
            save_or_log(&st).await;
            drop(st);
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::UserSetActive { user, active } => {
            if user.is_empty() {
                send_frame(stream, &Reply::status(Status::ErrBadreq)).await?;
                return Ok(true);
            }
            let mut st = ctx.state.lock().await;
            st.set_user_active(&user, active != 0);
            save_or_log(&st).await;
            drop(st);
            send_frame(stream, &Reply::ok()).await?;
        }

        NmRequest::ListUsers => {
            let st = ctx.state.lock().await;
            let mut active: Vec<String> = st.active.iter().cloned().collect();
            active.sort();
            let inactive = st.inactive_users();
            drop(st);
            let reply = Reply::ok()
                .with("active", json!(active))
                .with("inactive", json!(inactive));
            send_frame(stream, &reply).await?;
        }

        // --- Introspection ---
        NmRequest::ListSs => {
            let servers: Vec<_> = ctx
                .registry
                .snapshot()
                .into_iter()
                .map(|s| {
                    json!({
                        "id": s.ss_id,
                        "ctrl": s.ctrl_port,
                        "data": s.data_port,
                        "up": s.is_up,
                    })
                })
                .collect();
            send_frame(stream, &Reply::ok().with("servers", json!(servers))).await?;
        }

        NmRequest::Stats => {
            let files = ctx.state.lock().await.directory.len();
            let mut sys = System::new_all();
            sys.refresh_cpu();
            sys.refresh_memory();
            let reply = Reply::ok()
                .with("files", json!(files))
                .with("replicationQueue", json!(ctx.replicator.queue_depth()))
                .with("serversUp", json!(ctx.registry.up_count()))
                .with("cpuUsage", json!(sys.global_cpu_info().cpu_usage()))
                .with("memUsedMb", json!(sys.used_memory() / (1024 * 1024)))
                .with("memTotalMb", json!(sys.total_memory() / (1024 * 1024)));
            send_frame(stream, &reply).await?;
        }

        NmRequest::ListTrash => {
            let st = ctx.state.lock().await;
            let trash = json!(st.trash);
            drop(st);
            send_frame(stream, &Reply::ok().with("trash", trash)).await?;
        }

        NmRequest::View { flags, user } => {
            let reply = view(ctx, flags.as_deref().unwrap_or(""), &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        NmRequest::Info { file, user } => {
            let reply = info(ctx, &file, &caller(user)).await;
            send_frame(stream, &reply).await?;
        }

        NmRequest::Exec { file, user } => {
            exec(ctx, stream, &file, &caller(user)).await?;
        }
    }
    Ok(true)
}

async fn save_or_log(st: &NmState) {
    if let Err(e) = st.save().await {
        tracing::error!("state save failed: {}", e);
    }
}

/// Enqueue the resync sweep for a server that just came up: current
/// content, undo snapshot and every checkpoint of each file whose replica
/// set contains it.
async fn resync_server(ctx: &NmContext, ss_id: u32) {
    let pairs: Vec<(String, u32)> = {
        let st = ctx.state.lock().await;
        st.directory
            .iter()
            .filter(|(_, e)| e.replicas.contains(&ss_id))
            .map(|(file, e)| (file.clone(), e.primary))
            .collect()
    };
    if pairs.is_empty() {
        return;
    }
    tracing::info!("resyncing {} file(s) to ss{}", pairs.len(), ss_id);
    for (file, primary) in pairs {
        ctx.replicator.enqueue(ReplTask::Put {
            file: file.clone(),
            primary,
            target: ss_id,
        });
        ctx.replicator.enqueue(ReplTask::PutUndo {
            file: file.clone(),
            primary,
            target: ss_id,
        });
        if let Some(addr) = ctx.registry.data_addr(primary) {
            match ssclient::list_checkpoints(&addr, primary, &file).await {
                Ok(names) => {
                    for name in names {
                        ctx.replicator.enqueue(ReplTask::PutCheckpoint {
                            file: file.clone(),
                            name,
                            primary,
                            target: ss_id,
                        });
                    }
                }
                Err(e) => {
                    tracing::warn!("checkpoint listing of {} on ss{} failed: {}", file, primary, e)
                }
            }
        }
    }
}

/// `LOOKUP`: authorize, auto-provision on first WRITE, hand out a ticket
/// bound to the file's primary.
async fn lookup(ctx: &NmContext, op: &str, file: &str, user: &str) -> Reply {
    let Some(op) = TicketOp::parse(op) else {
        return Reply::status(Status::ErrBadreq);
    };
    if file.is_empty() {
        return Reply::status(Status::ErrBadreq);
    }

    let mut st = ctx.state.lock().await;

    if !st.directory.contains(file) {
        if op != TicketOp::Write {
            return Reply::status(Status::ErrNotfound);
        }
        // Auto-provision the mapping on first WRITE.
        let load = st.directory.load_counts();
        let Some(chosen) = ctx.registry.pick_least_loaded(&load) else {
            return Reply::status(Status::ErrUnavailable);
        };
        let Some(addr) = chosen.data_addr() else {
            return Reply::status(Status::ErrUnavailable);
        };
        match ssclient::create(&addr, file).await {
            Ok(status) if status.is_ok() => {
                provision(ctx, &mut st, file, user, chosen.ss_id);
                let now = now_epoch();
                set_modified(&mut st, file, user, now);
                set_accessed(&mut st, file, user, now);
                save_or_log(&st).await;
            }
            Ok(status) => {
                tracing::warn!("auto-provision CREATE of {} rejected: {:?}", file, status);
            }
            Err(e) => {
                tracing::warn!("auto-provision CREATE of {} failed: {}", file, e);
            }
        }
        if !st.directory.contains(file) {
            return Reply::status(Status::ErrInternal);
        }
    } else {
        if !st.acl_check(file, user, !op.is_read_like()) {
            return Reply::status(Status::ErrNoauth);
        }
        let now = now_epoch();
        match op {
            TicketOp::Read => set_accessed(&mut st, file, user, now),
            TicketOp::Write => set_modified(&mut st, file, user, now),
            _ => {}
        }
        save_or_log(&st).await;
    }

    let Some(primary) = st.directory.primary(file) else {
        return Reply::status(Status::ErrInternal);
    };
    drop(st);

    let Some((addr, port)) = ctx.registry.endpoint(primary) else {
        return Reply::status(Status::ErrUnavailable);
    };
    let ticket = Ticket::build(file, op, primary, TICKET_TTL_SECS).encode();
    Reply::ok()
        .with("ssAddr", json!(addr))
        .with("ssDataPort", json!(port))
        .with("ticket", json!(ticket))
}

/// Record the fresh mapping, ownership and replica assignment for a file
/// just created on `primary`, and fan the CREATE out to the replicas.
fn provision(ctx: &NmContext, st: &mut NmState, file: &str, owner: &str, primary: u32) {
    st.directory.set_primary(file, primary);
    st.acl_set_owner(file, owner);
    st.acl_grant(file, owner, Perm::RW);
    let replicas = ctx.registry.pick_replicas(primary, ctx.replica_target);
    if !replicas.is_empty() {
        st.directory.set_replicas(file, replicas.clone());
        ctx.replicator
            .fan_out_cmd(CmdOp::Create, file, None, &replicas);
    }
}

fn set_modified(st: &mut NmState, file: &str, user: &str, when: i64) {
    if let Some(entry) = st.directory.get_mut(file) {
        entry.last_modified_user = Some(user.to_string());
        entry.last_modified_time = when;
    }
}

fn set_accessed(st: &mut NmState, file: &str, user: &str, when: i64) {
    if let Some(entry) = st.directory.get_mut(file) {
        entry.last_accessed_user = Some(user.to_string());
        entry.last_accessed_time = when;
    }
}

async fn create_file(
    ctx: &NmContext,
    file: &str,
    user: &str,
    public_read: bool,
    public_write: bool,
) -> Reply {
    if file.is_empty() {
        return Reply::status(Status::ErrBadreq);
    }
    let mut st = ctx.state.lock().await;
    if st.directory.contains(file) {
        return Reply::status(Status::ErrConflict);
    }
    let load = st.directory.load_counts();
    let Some(chosen) = ctx.registry.pick_least_loaded(&load) else {
        return Reply::status(Status::ErrUnavailable);
    };
    let Some(addr) = chosen.data_addr() else {
        return Reply::status(Status::ErrUnavailable);
    };
    match ssclient::create(&addr, file).await {
        Ok(status) if status.is_ok() => {}
        Ok(_) => return Reply::status(Status::ErrInternal),
        Err(_) => return Reply::status(Status::ErrUnavailable),
    }

    provision(ctx, &mut st, file, user, chosen.ss_id);
    if public_read || public_write {
        let perm = if public_write { Perm::RW } else { Perm::R };
        st.acl_grant(file, ANONYMOUS, perm);
    }
    let now = now_epoch();
    set_modified(&mut st, file, user, now);
    set_accessed(&mut st, file, user, now);
    save_or_log(&st).await;
    Reply::ok()
}

/// Soft delete: rename onto the trash prefix on the primary, drop the
/// mapping, remember the entry for restore.
async fn delete_file(ctx: &NmContext, file: &str, user: &str) -> Reply {
    if file.is_empty() {
        return Reply::status(Status::ErrBadreq);
    }
    let mut st = ctx.state.lock().await;
    let Some(primary) = st.directory.primary(file) else {
        return Reply::status(Status::ErrNotfound);
    };
    let owner = match st.acl_owner(file) {
        Some(owner) if owner == user => owner.to_string(),
        _ => return Reply::status(Status::ErrNoauth),
    };
    let Some(addr) = ctx.registry.data_addr(primary) else {
        return Reply::status(Status::ErrUnavailable);
    };

    let when = now_epoch();
    let trashed = trashed_path(file, when);
    match ssclient::rename(&addr, file, &trashed).await {
        Ok(status) if status.is_ok() => {}
        Ok(status) => return Reply::status(status),
        Err(_) => return Reply::status(Status::ErrUnavailable),
    }

    let replicas = st.directory.replicas(file);
    ctx.replicator
        .fan_out_cmd(CmdOp::Rename, file, Some(&trashed), &replicas);
    st.directory.remove(file);
    st.acl_delete(file);
    st.clear_requests_for(file);
    st.trash_add(TrashEntry {
        file: file.to_string(),
        trashed,
        owner,
        ssid: primary,
        when,
    });
    save_or_log(&st).await;
    Reply::ok()
}

async fn restore_file(ctx: &NmContext, file: &str, user: &str) -> Reply {
    if file.is_empty() {
        return Reply::status(Status::ErrBadreq);
    }
    let mut st = ctx.state.lock().await;
    if st.directory.contains(file) {
        return Reply::status(Status::ErrConflict);
    }
    let Some(entry) = st.trash_find(file).cloned() else {
        return Reply::status(Status::ErrNotfound);
    };
    if !entry.owner.is_empty() && entry.owner != user {
        return Reply::status(Status::ErrNoauth);
    }
    let Some(addr) = ctx.registry.data_addr(entry.ssid) else {
        return Reply::status(Status::ErrUnavailable);
    };
    match ssclient::rename(&addr, &entry.trashed, file).await {
        Ok(status) if status.is_ok() => {}
        Ok(status) => return Reply::status(status),
        Err(_) => return Reply::status(Status::ErrUnavailable),
    }

    st.trash_remove(file);
    st.directory.set_primary(file, entry.ssid);
    if !entry.owner.is_empty() {
        st.acl_set_owner(file, &entry.owner);
        st.acl_grant(file, &entry.owner, Perm::RW);
    }
    let replicas = st.directory.replicas(file);
    ctx.replicator
        .fan_out_cmd(CmdOp::Rename, &entry.trashed, Some(file), &replicas);
    save_or_log(&st).await;
    Reply::ok()
}

/// Purge one trash entry (by original name) or every entry owned by the
/// caller. Physical deletes are best-effort; replicas are swept via the
/// command fan-out, since the mapping (and with it the replica set) was
/// dropped at DELETE time.
async fn empty_trash(ctx: &NmContext, file: Option<&str>, user: &str) -> Reply {
    let mut st = ctx.state.lock().await;
    let targets: Vec<TrashEntry> = st
        .trash
        .iter()
        .filter(|t| match file {
            Some(f) => t.file == f,
            None => t.owner.is_empty() || t.owner == user,
        })
        .cloned()
        .collect();

    let all_up: Vec<u32> = ctx
        .registry
        .snapshot()
        .into_iter()
        .filter(|s| s.is_up && s.data_port != 0)
        .map(|s| s.ss_id)
        .collect();

    for entry in targets {
        if let Some(addr) = ctx.registry.data_addr(entry.ssid) {
            if let Err(e) = ssclient::delete(&addr, &entry.trashed).await {
                tracing::warn!("purge of {} on ss{} failed: {}", entry.trashed, entry.ssid, e);
            }
        }
        let others: Vec<u32> = all_up.iter().copied().filter(|&s| s != entry.ssid).collect();
        ctx.replicator
            .fan_out_cmd(CmdOp::Delete, &entry.trashed, None, &others);
        st.trash_remove(&entry.file);
    }
    save_or_log(&st).await;
    Reply::ok()
}

async fn rename_file(ctx: &NmContext, file: &str, new_file: &str, user: &str) -> Reply {
    if file.is_empty() || new_file.is_empty() {
        return Reply::status(Status::ErrBadreq);
    }
    let mut st = ctx.state.lock().await;
    let Some(primary) = st.directory.primary(file) else {
        return Reply::status(Status::ErrNotfound);
    };
    if !st.acl_check(file, user, true) {
        return Reply::status(Status::ErrNoauth);
    }
    if st.directory.contains(new_file) {
        return Reply::status(Status::ErrConflict);
    }
    let Some(addr) = ctx.registry.data_addr(primary) else {
        return Reply::status(Status::ErrUnavailable);
    };
    match ssclient::rename(&addr, file, new_file).await {
        Ok(status) if status.is_ok() => {}
        Ok(Status::ErrConflict) => return Reply::status(Status::ErrConflict),
        Ok(Status::ErrNotfound) => return Reply::status(Status::ErrNotfound),
        Ok(_) => return Reply::status(Status::ErrInternal),
        Err(_) => return Reply::status(Status::ErrUnavailable),
    }

    let replicas = st.directory.replicas(file);
    st.directory.rename(file, new_file);
    st.acl_rename(file, new_file);
    ctx.replicator
        .fan_out_cmd(CmdOp::Rename, file, Some(new_file), &replicas);
    save_or_log(&st).await;
    Reply::ok()
}

/// `MOVE` handles both a single file and a whole folder prefix; a
/// destination naming a known folder means "into that folder". The
/// caller needs W on the source (every file under it, for a folder), and
/// the destination must be free.
async fn move_path(ctx: &NmContext, src: &str, dst: &str, user: &str) -> Reply {
    if src.is_empty() || dst.is_empty() {
        return Reply::status(Status::ErrBadreq);
    }
    let mut st = ctx.state.lock().await;

    let dst = dst.trim_end_matches('/');
    let final_dst = if st.folder_exists(dst) {
        let base = src.rsplit('/').next().unwrap_or(src);
        if dst.is_empty() {
            base.to_string()
        } else {
            format!("{}/{}", dst, base)
        }
    } else {
        dst.to_string()
    };
    if src == final_dst {
        return Reply::ok();
    }

    if let Some(primary) = st.directory.primary(src) {
        // Single file: same shape as RENAME.
        if !st.acl_check(src, user, true) {
            return Reply::status(Status::ErrNoauth);
        }
        if st.directory.contains(&final_dst) {
            return Reply::status(Status::ErrConflict);
        }
        let Some(addr) = ctx.registry.data_addr(primary) else {
            return Reply::status(Status::ErrUnavailable);
        };
        match ssclient::rename(&addr, src, &final_dst).await {
            Ok(status) if status.is_ok() => {}
            Ok(Status::ErrConflict) => return Reply::status(Status::ErrConflict),
            Ok(Status::ErrNotfound) => return Reply::status(Status::ErrNotfound),
            Ok(_) => return Reply::status(Status::ErrInternal),
            Err(_) => return Reply::status(Status::ErrUnavailable),
        }
        let replicas = st.directory.replicas(src);
        st.directory.rename(src, &final_dst);
        st.acl_rename(src, &final_dst);
        ctx.replicator
            .fan_out_cmd(CmdOp::Rename, src, Some(&final_dst), &replicas);
        save_or_log(&st).await;
        return Reply::ok();
    }

    // Folder move: rewrite every mapping under the prefix, then drive the
    // physical renames one file at a time.
    let affected: Vec<String> = st
        .directory
        .files()
        .into_iter()
        .filter(|f| {
            f == src || (f.starts_with(src) && f.as_bytes().get(src.len()) == Some(&b'/'))
        })
        .collect();
    if affected.is_empty() {
        return Reply::status(Status::ErrNotfound);
    }
    if affected.iter().any(|f| !st.acl_check(f, user, true)) {
        return Reply::status(Status::ErrNoauth);
    }
    let moved = st.move_folder_prefix(src, &final_dst);
    let mut failures = 0usize;
    for (old_name, new_name, primary) in &moved {
        let Some(addr) = ctx.registry.data_addr(*primary) else {
            failures += 1;
            continue;
        };
        match ssclient::rename(&addr, old_name, new_name).await {
            Ok(status) if status.is_ok() => {
                let replicas = st.directory.replicas(new_name);
                ctx.replicator
                    .fan_out_cmd(CmdOp::Rename, old_name, Some(new_name), &replicas);
            }
            _ => failures += 1,
        }
    }
    save_or_log(&st).await;
    if failures > 0 {
        // Partial state is tolerated but reported.
        tracing::error!("folder move {} -> {}: {} file(s) failed", src, final_dst, failures);
        Reply::status(Status::ErrInternal)
    } else {
        Reply::ok()
    }
}

/// Explicit move of one file's bytes to a chosen server:
/// READ(src) → PUT(dst) → best-effort DELETE(src) → remap.
async fn migrate_file(ctx: &NmContext, file: &str, target: u32, user: &str) -> Reply {
    if file.is_empty() {
        return Reply::status(Status::ErrBadreq);
    }
    let mut st = ctx.state.lock().await;
    let Some(src_ssid) = st.directory.primary(file) else {
        return Reply::status(Status::ErrNotfound);
    };
    if src_ssid == target {
        return Reply::ok();
    }
    if !st.acl_check(file, user, true) {
        return Reply::status(Status::ErrNoauth);
    }
    let (Some(src_addr), Some(dst_addr)) = (
        ctx.registry.data_addr(src_ssid),
        ctx.registry.data_addr(target),
    ) else {
        return Reply::status(Status::ErrUnavailable);
    };

    let body = match ssclient::read_body(&src_addr, src_ssid, file).await {
        Ok(body) => body,
        Err(e) => {
            tracing::warn!("MIGRATE read of {} from ss{} failed: {}", file, src_ssid, e);
            return Reply::status(Status::ErrUnavailable);
        }
    };
    if let Err(e) = ssclient::put_body(&dst_addr, file, &body).await {
        tracing::warn!("MIGRATE put of {} to ss{} failed: {}", file, target, e);
        return Reply::status(Status::ErrInternal);
    }
    if let Err(e) = ssclient::delete(&src_addr, file).await {
        tracing::warn!("MIGRATE source delete of {} failed: {}", file, e);
    }
    st.directory.set_primary(file, target);
    save_or_log(&st).await;
    Reply::ok()
}

/// Immediate children of a folder: deduplicated next segments of stored
/// folder paths, plus directory entries whose remainder has no slash.
async fn view_folder(ctx: &NmContext, path: &str) -> Reply {
    let (prefix, label) = match path {
        "" | "/" | "~" => (String::new(), "~".to_string()),
        other => (other.trim_end_matches('/').to_string(), other.to_string()),
    };

    let st = ctx.state.lock().await;
    let child_of = |name: &str| -> Option<String> {
        let rest = if prefix.is_empty() {
            name
        } else {
            let tail = name.strip_prefix(prefix.as_str())?;
            tail.strip_prefix('/')?
        };
        if rest.is_empty() {
            None
        } else {
            Some(rest.to_string())
        }
    };

    let mut folders: Vec<String> = Vec::new();
    for folder in &st.folders {
        if let Some(rest) = child_of(folder) {
            let segment = rest.split('/').next().unwrap_or(&rest).to_string();
            if !folders.contains(&segment) {
                folders.push(segment);
            }
        }
    }
    let mut files: Vec<String> = Vec::new();
    for name in st.directory.files() {
        if let Some(rest) = child_of(&name) {
            if !rest.contains('/') {
                files.push(rest);
            }
        }
    }
    drop(st);

    Reply::ok()
        .with("path", json!(label))
        .with("folders", json!(folders))
        .with("files", json!(files))
}

/// `VIEW [-a] [-l]`: list files the caller can reach, optionally with
/// per-file details fetched from the primaries.
async fn view(ctx: &NmContext, flags: &str, user: &str) -> Reply {
    let all = flags.contains('a');
    let detailed = flags.contains('l');

    let st = ctx.state.lock().await;
    let mut visible: Vec<(String, u32, bool, bool)> = Vec::new();
    for name in st.directory.files() {
        let can_r = st.acl_check(&name, user, false);
        let can_w = st.acl_check(&name, user, true);
        if !all && !(can_r || can_w) {
            continue;
        }
        let primary = st.directory.get(&name).map(|e| e.primary).unwrap_or(0);
        visible.push((name, primary, can_r, can_w));
    }

    if !detailed {
        let names: Vec<String> = visible.into_iter().map(|(name, ..)| name).collect();
        return Reply::ok().with("files", json!(names));
    }

    let mut details = Vec::new();
    for (name, primary, can_r, can_w) in visible {
        let mut size = 0u64;
        let mut words = 0u64;
        let mut chars = 0u64;
        let mut mtime = 0i64;
        let mut atime = 0i64;
        if can_r || can_w {
            if let Some(addr) = ctx.registry.data_addr(primary) {
                let op = if can_r { TicketOp::Read } else { TicketOp::Write };
                if let Ok(reply) = ssclient::info(&addr, primary, &name, op).await {
                    if reply.status.is_ok() {
                        size = reply.size;
                        words = reply.words;
                        chars = reply.chars;
                        mtime = reply.mtime;
                        atime = reply.atime;
                    }
                }
            }
        }
        let owner = st.acl_owner(&name).unwrap_or("").to_string();
        details.push(json!({
            "name": name,
            "words": words,
            "chars": chars,
            "size": size,
            "mtime": mtime,
            "atime": atime,
            "owner": owner,
        }));
    }
    Reply::ok().with("details", json!(details))
}

/// `INFO`: storage-server metadata combined with ownership, the access
/// summary and the naming manager's own last-modified/accessed tracking.
async fn info(ctx: &NmContext, file: &str, user: &str) -> Reply {
    if file.is_empty() {
        return Reply::status(Status::ErrBadreq);
    }
    let mut st = ctx.state.lock().await;
    let Some(primary) = st.directory.primary(file) else {
        return Reply::status(Status::ErrNotfound);
    };
    if !st.acl_check(file, user, false) {
        return Reply::status(Status::ErrNoauth);
    }
    let Some(addr) = ctx.registry.data_addr(primary) else {
        return Reply::status(Status::ErrUnavailable);
    };

    let reply = match ssclient::info(&addr, primary, file, TicketOp::Read).await {
        Ok(reply) => reply,
        Err(_) => return Reply::status(Status::ErrUnavailable),
    };
    if !reply.status.is_ok() {
        return Reply::status(reply.status);
    }

    let owner = st.acl_owner(file).unwrap_or("").to_string();
    let access = st.acl_format_access(file);
    let entry = st.directory.get(file);
    let (mod_user, mod_time, acc_user, acc_time) = entry
        .map(|e| {
            (
                e.last_modified_user.clone().unwrap_or_default(),
                e.last_modified_time,
                e.last_accessed_user.clone().unwrap_or_default(),
                e.last_accessed_time,
            )
        })
        .unwrap_or_default();

    Reply::ok()
        .with("file", json!(file))
        .with("owner", json!(owner))
        .with("size", json!(reply.size))
        .with("words", json!(reply.words))
        .with("chars", json!(reply.chars))
        .with("mtime", json!(reply.mtime))
        .with("atime", json!(reply.atime))
        .with("access", json!(access))
        .with("last_modified_user", json!(mod_user))
        .with("last_modified_time", json!(mod_time))
        .with("last_accessed_user", json!(acc_user))
        .with("last_accessed_time", json!(acc_time))
}

/// `EXEC`: fetch the document, pipe it into the host interpreter and
/// stream combined stdout/stderr back in chunks. The stream terminates
/// with `{STOP, exit}`.
async fn exec<S>(ctx: &NmContext, stream: &mut S, file: &str, user: &str) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    if file.is_empty() {
        return send_frame(stream, &Reply::status(Status::ErrBadreq)).await;
    }
    let (primary, addr) = {
        let mut st = ctx.state.lock().await;
        let Some(primary) = st.directory.primary(file) else {
            return send_frame(stream, &Reply::status(Status::ErrNotfound)).await;
        };
        if !st.acl_check(file, user, false) {
            return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
        }
        let Some(addr) = ctx.registry.data_addr(primary) else {
            return send_frame(stream, &Reply::status(Status::ErrUnavailable)).await;
        };
        (primary, addr)
    };

    let body = match ssclient::read_body(&addr, primary, file).await {
        Ok(body) => unescape_content(&body),
        Err(e) => {
            tracing::warn!("EXEC read of {} failed: {}", file, e);
            return send_frame(stream, &Reply::status(Status::ErrUnavailable)).await;
        }
    };

    let mut command = tokio::process::Command::new("/bin/sh");
    command
        .arg("-s")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    // Run inside a storage server's files tree when one is reachable on
    // this host, so scripts see their neighbors.
    if let Some(ss_id) = ctx.registry.lowest_up() {
        let dir = format!("ss_data/ss{}/files", ss_id);
        if std::path::Path::new(&dir).is_dir() {
            command.current_dir(dir);
        }
    }

    let mut child = match command.spawn() {
        Ok(child) => child,
        Err(e) => {
            tracing::error!("EXEC spawn failed: {}", e);
            return send_frame(stream, &Reply::status(Status::ErrInternal)).await;
        }
    };

    send_frame(stream, &Reply::ok().with("stream", json!("EXEC"))).await?;

    if let Some(mut stdin) = child.stdin.take() {
        let _ = stdin.write_all(body.as_bytes()).await;
        drop(stdin);
    }

    // Interleave stdout and stderr as they arrive so the client sees the
    // combined output in rough order.
    enum Piped {
        Out(std::io::Result<usize>),
        Err(std::io::Result<usize>),
    }
    let (Some(mut stdout), Some(mut stderr)) = (child.stdout.take(), child.stderr.take()) else {
        return send_frame(stream, &Reply::status(Status::ErrInternal)).await;
    };
    let mut out_open = true;
    let mut err_open = true;
    let mut out_buf = [0u8; 512];
    let mut err_buf = [0u8; 512];
    while out_open || err_open {
        let event = tokio::select! {
            read = stdout.read(&mut out_buf), if out_open => Piped::Out(read),
            read = stderr.read(&mut err_buf), if err_open => Piped::Err(read),
            else => break,
        };
        let chunk = match event {
            Piped::Out(Ok(n)) if n > 0 => String::from_utf8_lossy(&out_buf[..n]).into_owned(),
            Piped::Out(_) => {
                out_open = false;
                continue;
            }
            Piped::Err(Ok(n)) if n > 0 => String::from_utf8_lossy(&err_buf[..n]).into_owned(),
            Piped::Err(_) => {
                err_open = false;
                continue;
            }
        };
        if send_frame(stream, &Reply::ok().with("chunk", json!(chunk)))
            .await
            .is_err()
        {
            let _ = child.kill().await;
            return Ok(());
        }
    }

    let exit = child
        .wait()
        .await
        .ok()
        .and_then(|s| s.code())
        .unwrap_or(-1);
    send_frame(stream, &Reply::status(Status::Stop).with("exit", json!(exit))).await
}

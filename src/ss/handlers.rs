//! Storage Server Request Handlers
//!
//! One connection is served by one `handle_connection` task. The
//! connection carries multiple request/response pairs in sequence and
//! owns the write-session state machine; teardown is the single release
//! point for a session's lock.

use anyhow::Result;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

use crate::proto::framing::{recv_raw, request_once, send_frame};
use crate::proto::message::{unescape_content, BasicReply, NmRequest, Reply, SsRequest, Status};
use crate::proto::ticket::Ticket;

use super::session::{SentenceLocks, WriteSession};
use super::store::{RenameOutcome, SsStore};

/// Pause between words of a `STREAM` response.
const STREAM_WORD_GAP: Duration = Duration::from_millis(100);

/// Everything a connection handler needs, shared across connections.
pub struct SsContext {
    pub ss_id: u32,
    pub store: SsStore,
    pub locks: SentenceLocks,
    pub nm_addr: String,
}

impl SsContext {
    /// Tell the naming manager that `file` has new committed bytes so it
    /// can fan the content out to replicas. Best-effort.
    pub async fn notify_commit(&self, file: &str) {
        let note = NmRequest::SsCommit {
            file: file.to_string(),
            ss_id: self.ss_id,
        };
        if let Err(e) = request_once::<_, BasicReply>(&self.nm_addr, &note).await {
            tracing::warn!("commit notification for {} failed: {}", file, e);
        }
    }

    async fn notify_checkpoint(&self, file: &str, name: &str) {
        let note = NmRequest::SsCheckpoint {
            file: file.to_string(),
            name: name.to_string(),
            ss_id: self.ss_id,
        };
        if let Err(e) = request_once::<_, BasicReply>(&self.nm_addr, &note).await {
            tracing::warn!("checkpoint notification for {} failed: {}", file, e);
        }
    }
}

/// Serve one data-port connection until EOF.
pub async fn handle_connection<S>(ctx: Arc<SsContext>, mut stream: S)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut session: Option<WriteSession> = None;

    loop {
        let raw = match recv_raw(&mut stream).await {
            Ok(Some(raw)) => raw,
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("connection read failed: {}", e);
                break;
            }
        };
        let request: SsRequest = match serde_json::from_slice(&raw) {
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

        if handle_request(&ctx, &mut stream, &mut session, request)
            .await
            .is_err()
        {
            break;
        }
    }

    // Connection teardown is the single release point for the lock.
    if let Some(ws) = session.take() {
        ctx.locks.release(&ws.file, ws.sentence_index);
        tracing::debug!(
            "released lock ({}, {}) on connection close",
            ws.file,
            ws.sentence_index
        );
    }
}

async fn handle_request<S>(
    ctx: &SsContext,
    stream: &mut S,
    session: &mut Option<WriteSession>,
    request: SsRequest,
) -> Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match request {
        SsRequest::Read { file, ticket } => {
            if !Ticket::validate(&ticket, &file, "READ", ctx.ss_id) {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            match ctx.store.read_file(&file).await {
                Ok(Some(bytes)) => {
                    let reply = Reply::ok()
                        .with("body", json!(String::from_utf8_lossy(&bytes).into_owned()));
                    send_frame(stream, &reply).await
                }
                Ok(None) => send_frame(stream, &Reply::status(Status::ErrNotfound)).await,
                Err(e) => {
                    tracing::error!("READ {} failed: {}", file, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::Stream { file, ticket } => {
            if !Ticket::validate(&ticket, &file, "READ", ctx.ss_id) {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            let bytes = match ctx.store.read_file(&file).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    return send_frame(stream, &Reply::status(Status::ErrNotfound)).await
                }
                Err(e) => {
                    tracing::error!("STREAM {} failed: {}", file, e);
                    return send_frame(stream, &Reply::status(Status::ErrInternal)).await;
                }
            };
            let text = String::from_utf8_lossy(&bytes).into_owned();
            for word in text.split_whitespace() {
                let frame = Reply::ok().with("word", json!(word));
                if send_frame(stream, &frame).await.is_err() {
                    // Peer went away mid-stream; nothing left to do.
                    return Ok(());
                }
                tokio::time::sleep(STREAM_WORD_GAP).await;
            }
            send_frame(stream, &Reply::status(Status::Stop)).await
        }

        SsRequest::Create { file } => match ctx.store.create_file(&file).await {
            Ok(true) => send_frame(stream, &Reply::ok()).await,
            Ok(false) => send_frame(stream, &Reply::status(Status::ErrConflict)).await,
            Err(e) => {
                tracing::error!("CREATE {} failed: {}", file, e);
                send_frame(stream, &Reply::status(Status::ErrInternal)).await
            }
        },

        SsRequest::Delete { file } => match ctx.store.delete_file(&file).await {
            Ok(true) => send_frame(stream, &Reply::ok()).await,
            Ok(false) => send_frame(stream, &Reply::status(Status::ErrNotfound)).await,
            Err(e) => {
                tracing::error!("DELETE {} failed: {}", file, e);
                send_frame(stream, &Reply::status(Status::ErrInternal)).await
            }
        },

        SsRequest::CreateFolder { path } => {
            if path.is_empty() {
                return send_frame(stream, &Reply::status(Status::ErrBadreq)).await;
            }
            match ctx.store.create_folder(&path).await {
                Ok(()) => send_frame(stream, &Reply::ok()).await,
                Err(e) => {
                    tracing::error!("CREATEFOLDER {} failed: {}", path, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::BeginWrite {
            file,
            sentence_index,
            ticket,
        } => {
            if !Ticket::validate(&ticket, &file, "WRITE", ctx.ss_id) {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            if session.is_some() {
                return send_frame(stream, &Reply::err(Status::ErrBadreq, "session-active")).await;
            }
            if sentence_index < 0 {
                return send_frame(
                    stream,
                    &Reply::err(Status::ErrBadreq, "invalid-index-or-content"),
                )
                .await;
            }
            let sidx = sentence_index as usize;
            if !ctx.locks.acquire(&file, sidx) {
                return send_frame(stream, &Reply::status(Status::ErrLocked)).await;
            }

            // Reply OK before touching the disk so interactive clients get
            // their prompt immediately. Setup failures silently abort the
            // session; the next APPLY finds no session and errors there.
            if let Err(e) = send_frame(stream, &Reply::ok()).await {
                // No session was installed, so teardown will not release
                // this lock for us.
                ctx.locks.release(&file, sidx);
                return Err(e);
            }

            match WriteSession::prepare(&ctx.store, &file, sidx).await {
                Ok(Some(ws)) => {
                    tracing::debug!("write session ready ({}, {})", file, sidx);
                    *session = Some(ws);
                }
                Ok(None) => {
                    tracing::debug!("write session aborted: sentence {} out of range", sidx);
                    ctx.locks.release(&file, sidx);
                }
                Err(e) => {
                    tracing::warn!("write session setup for {} failed: {}", file, e);
                    ctx.locks.release(&file, sidx);
                }
            }
            Ok(())
        }

        SsRequest::Apply {
            word_index,
            content,
        } => {
            let Some(ws) = session.as_mut() else {
                return send_frame(stream, &Reply::status(Status::ErrBadreq)).await;
            };
            if word_index < 0 {
                return send_frame(
                    stream,
                    &Reply::err(Status::ErrBadreq, "invalid-index-or-content"),
                )
                .await;
            }
            let content = unescape_content(&content);
            match ws
                .doc
                .insert_words(ws.sentence_index, word_index as usize, &content)
            {
                Ok(()) => send_frame(stream, &Reply::ok()).await,
                Err(_) => {
                    send_frame(
                        stream,
                        &Reply::err(Status::ErrBadreq, "invalid-index-or-content"),
                    )
                    .await
                }
            }
        }

        SsRequest::EndWrite => {
            let Some(ws) = session.take() else {
                return send_frame(stream, &Reply::status(Status::ErrBadreq)).await;
            };
            let committed = ws.commit(&ctx.store).await;
            ctx.locks.release(&ws.file, ws.sentence_index);
            match committed {
                Ok(()) => {
                    send_frame(stream, &Reply::ok()).await?;
                    ctx.notify_commit(&ws.file).await;
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("commit of {} failed: {}", ws.file, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::Undo { file, ticket } => {
            if !Ticket::validate(&ticket, &file, "UNDO", ctx.ss_id) {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            match ctx.store.restore_undo(&file).await {
                Ok(true) => {
                    send_frame(stream, &Reply::ok()).await?;
                    ctx.notify_commit(&file).await;
                    Ok(())
                }
                Ok(false) => send_frame(stream, &Reply::status(Status::ErrNotfound)).await,
                Err(e) => {
                    tracing::error!("UNDO {} failed: {}", file, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::Revert { file, name, ticket } => {
            if name.is_empty() {
                return send_frame(stream, &Reply::status(Status::ErrBadreq)).await;
            }
            if !Ticket::validate(&ticket, &file, "REVERT", ctx.ss_id) {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            let snapshot = match ctx.store.read_checkpoint(&file, &name).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    return send_frame(stream, &Reply::status(Status::ErrNotfound)).await
                }
                Err(e) => {
                    tracing::error!("REVERT {}@{} failed: {}", file, name, e);
                    return send_frame(stream, &Reply::status(Status::ErrInternal)).await;
                }
            };
            match ctx.store.put_file(&file, &snapshot).await {
                Ok(()) => {
                    send_frame(stream, &Reply::ok()).await?;
                    ctx.notify_commit(&file).await;
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("REVERT {}@{} write failed: {}", file, name, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::Checkpoint { file, name, ticket } => {
            if name.is_empty() {
                return send_frame(stream, &Reply::status(Status::ErrBadreq)).await;
            }
            if !Ticket::validate(&ticket, &file, "CHECKPOINT", ctx.ss_id) {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            let current = match ctx.store.read_file(&file).await {
                Ok(Some(bytes)) => bytes,
                Ok(None) => {
                    return send_frame(stream, &Reply::status(Status::ErrNotfound)).await
                }
                Err(e) => {
                    tracing::error!("CHECKPOINT {} read failed: {}", file, e);
                    return send_frame(stream, &Reply::status(Status::ErrInternal)).await;
                }
            };
            match ctx.store.write_checkpoint(&file, &name, &current).await {
                Ok(()) => {
                    send_frame(stream, &Reply::ok()).await?;
                    ctx.notify_checkpoint(&file, &name).await;
                    Ok(())
                }
                Err(e) => {
                    tracing::error!("CHECKPOINT {}@{} failed: {}", file, name, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::ViewCheckpoint { file, name, ticket } => {
            if !Ticket::validate(&ticket, &file, "VIEWCHECKPOINT", ctx.ss_id) {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            match ctx.store.read_checkpoint(&file, &name).await {
                Ok(Some(bytes)) => {
                    let reply = Reply::ok()
                        .with("body", json!(String::from_utf8_lossy(&bytes).into_owned()));
                    send_frame(stream, &reply).await
                }
                Ok(None) => send_frame(stream, &Reply::status(Status::ErrNotfound)).await,
                Err(e) => {
                    tracing::error!("VIEWCHECKPOINT {}@{} failed: {}", file, name, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::ListCheckpoints { file, ticket } => {
            // A viewer's ticket is good enough to enumerate.
            let authorized = Ticket::validate(&ticket, &file, "LISTCHECKPOINTS", ctx.ss_id)
                || Ticket::validate(&ticket, &file, "VIEWCHECKPOINT", ctx.ss_id);
            if !authorized {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            match ctx.store.list_checkpoints(&file).await {
                Ok(names) => {
                    send_frame(stream, &Reply::ok().with("checkpoints", json!(names))).await
                }
                Err(e) => {
                    tracing::error!("LISTCHECKPOINTS {} failed: {}", file, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::Rename { file, new_file } => {
            match ctx.store.rename_file(&file, &new_file).await {
                Ok(RenameOutcome::Renamed) => send_frame(stream, &Reply::ok()).await,
                Ok(RenameOutcome::NotFound) => {
                    send_frame(stream, &Reply::status(Status::ErrNotfound)).await
                }
                Ok(RenameOutcome::Conflict) => {
                    send_frame(stream, &Reply::status(Status::ErrConflict)).await
                }
                Err(e) => {
                    tracing::error!("RENAME {} -> {} failed: {}", file, new_file, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::Put { file, body } => match ctx.store.put_file(&file, body.as_bytes()).await {
            Ok(()) => send_frame(stream, &Reply::ok()).await,
            Err(e) => {
                tracing::error!("PUT {} failed: {}", file, e);
                send_frame(stream, &Reply::status(Status::ErrInternal)).await
            }
        },

        SsRequest::PutUndo { file, body } => {
            match ctx.store.write_undo(&file, body.as_bytes()).await {
                Ok(()) => send_frame(stream, &Reply::ok()).await,
                Err(e) => {
                    tracing::error!("PUT_UNDO {} failed: {}", file, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::PutCheckpoint { file, name, body } => {
            if name.is_empty() {
                return send_frame(stream, &Reply::status(Status::ErrBadreq)).await;
            }
            match ctx.store.write_checkpoint(&file, &name, body.as_bytes()).await {
                Ok(()) => send_frame(stream, &Reply::ok()).await,
                Err(e) => {
                    tracing::error!("PUT_CHECKPOINT {}@{} failed: {}", file, name, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }

        SsRequest::Info { file, ticket } => {
            // Readers and writers may both inspect metadata.
            let authorized = Ticket::validate(&ticket, &file, "READ", ctx.ss_id)
                || Ticket::validate(&ticket, &file, "WRITE", ctx.ss_id);
            if !authorized {
                return send_frame(stream, &Reply::status(Status::ErrNoauth)).await;
            }
            match ctx.store.info(&file).await {
                Ok(Some(info)) => {
                    let reply = Reply::ok()
                        .with("size", json!(info.size))
                        .with("mtime", json!(info.mtime))
                        .with("atime", json!(info.atime))
                        .with("words", json!(info.words))
                        .with("chars", json!(info.chars));
                    send_frame(stream, &reply).await
                }
                Ok(None) => send_frame(stream, &Reply::status(Status::ErrNotfound)).await,
                Err(e) => {
                    tracing::error!("INFO {} failed: {}", file, e);
                    send_frame(stream, &Reply::status(Status::ErrInternal)).await
                }
            }
        }
    }
}

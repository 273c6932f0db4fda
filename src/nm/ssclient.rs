//! NM → SS Client
//!
//! The naming manager drives storage servers over the same framed-TCP
//! wire the clients use. Transport failures retry with doubling backoff
//! plus jitter; application-level error statuses are returned to the
//! caller to map.

use anyhow::{anyhow, Result};
use serde::de::DeserializeOwned;
use std::time::Duration;

use crate::proto::framing::{recv_frame, send_frame};
use crate::proto::message::{
    BasicReply, CheckpointListReply, ReadReply, SsInfoReply, SsRequest, Status,
};
use crate::proto::ticket::{Ticket, TicketOp, TICKET_TTL_SECS};

const ATTEMPTS: usize = 3;
const BACKOFF_START_MS: u64 = 150;
const BACKOFF_CAP_MS: u64 = 1200;
const CALL_TIMEOUT: Duration = Duration::from_secs(5);

/// One request/response exchange with a storage server, retried on
/// transport failure.
pub async fn call<R>(addr: &str, request: &SsRequest) -> Result<R>
where
    R: DeserializeOwned,
{
    let mut delay_ms = BACKOFF_START_MS;
    let mut last_err = anyhow!("no attempts made");

    for attempt in 0..ATTEMPTS {
        match try_call(addr, request).await {
            Ok(reply) => return Ok(reply),
            Err(e) => {
                last_err = e;
                if attempt + 1 < ATTEMPTS {
                    let jitter = rand::random::<u64>() % 50;
                    tokio::time::sleep(Duration::from_millis(delay_ms + jitter)).await;
                    delay_ms = (delay_ms * 2).min(BACKOFF_CAP_MS);
                }
            }
        }
    }
    Err(last_err)
}

async fn try_call<R>(addr: &str, request: &SsRequest) -> Result<R>
where
    R: DeserializeOwned,
{
    let fut = async {
        let mut stream = tokio::net::TcpStream::connect(addr).await?;
        send_frame(&mut stream, request).await?;
        match recv_frame(&mut stream).await? {
            Some(reply) => Ok(reply),
            None => Err(anyhow!("storage server closed connection before replying")),
        }
    };
    tokio::time::timeout(CALL_TIMEOUT, fut)
        .await
        .map_err(|_| anyhow!("call to {} timed out", addr))?
}

fn expect_ok(status: Status, what: &str) -> Result<()> {
    if status.is_ok() {
        Ok(())
    } else {
        Err(anyhow!("{} rejected: {:?}", what, status))
    }
}

/// Fetch the full body of `file` from server `ss_id` at `addr`.
pub async fn read_body(addr: &str, ss_id: u32, file: &str) -> Result<String> {
    let ticket = Ticket::build(file, TicketOp::Read, ss_id, TICKET_TTL_SECS).encode();
    let reply: ReadReply = call(
        addr,
        &SsRequest::Read {
            file: file.to_string(),
            ticket,
        },
    )
    .await?;
    expect_ok(reply.status, "READ")?;
    reply.body.ok_or_else(|| anyhow!("READ reply without body"))
}

/// Fetch the undo snapshot of `file`, routed through READ on the
/// `../undo/<file>.undo` pseudo-path (the ticket is built on the same
/// string, so it validates at the server).
pub async fn read_undo_body(addr: &str, ss_id: u32, file: &str) -> Result<String> {
    let pseudo = format!("../undo/{}.undo", file);
    let ticket = Ticket::build(&pseudo, TicketOp::Read, ss_id, TICKET_TTL_SECS).encode();
    let reply: ReadReply = call(
        addr,
        &SsRequest::Read {
            file: pseudo,
            ticket,
        },
    )
    .await?;
    expect_ok(reply.status, "READ undo")?;
    reply
        .body
        .ok_or_else(|| anyhow!("READ undo reply without body"))
}

pub async fn view_checkpoint(addr: &str, ss_id: u32, file: &str, name: &str) -> Result<String> {
    let ticket = Ticket::build(file, TicketOp::ViewCheckpoint, ss_id, TICKET_TTL_SECS).encode();
    let reply: ReadReply = call(
        addr,
        &SsRequest::ViewCheckpoint {
            file: file.to_string(),
            name: name.to_string(),
            ticket,
        },
    )
    .await?;
    expect_ok(reply.status, "VIEWCHECKPOINT")?;
    reply
        .body
        .ok_or_else(|| anyhow!("VIEWCHECKPOINT reply without body"))
}

pub async fn list_checkpoints(addr: &str, ss_id: u32, file: &str) -> Result<Vec<String>> {
    let ticket = Ticket::build(file, TicketOp::ListCheckpoints, ss_id, TICKET_TTL_SECS).encode();
    let reply: CheckpointListReply = call(
        addr,
        &SsRequest::ListCheckpoints {
            file: file.to_string(),
            ticket,
        },
    )
    .await?;
    expect_ok(reply.status, "LISTCHECKPOINTS")?;
    Ok(reply.checkpoints)
}

pub async fn put_body(addr: &str, file: &str, body: &str) -> Result<()> {
    let reply: BasicReply = call(
        addr,
        &SsRequest::Put {
            file: file.to_string(),
            body: body.to_string(),
        },
    )
    .await?;
    expect_ok(reply.status, "PUT")
}

pub async fn put_undo(addr: &str, file: &str, body: &str) -> Result<()> {
    let reply: BasicReply = call(
        addr,
        &SsRequest::PutUndo {
            file: file.to_string(),
            body: body.to_string(),
        },
    )
    .await?;
    expect_ok(reply.status, "PUT_UNDO")
}

pub async fn put_checkpoint(addr: &str, file: &str, name: &str, body: &str) -> Result<()> {
    let reply: BasicReply = call(
        addr,
        &SsRequest::PutCheckpoint {
            file: file.to_string(),
            name: name.to_string(),
            body: body.to_string(),
        },
    )
    .await?;
    expect_ok(reply.status, "PUT_CHECKPOINT")
}

/// Physical create; the `Status` is returned for the caller to map
/// (a conflict is meaningful to some paths).
pub async fn create(addr: &str, file: &str) -> Result<Status> {
    let reply: BasicReply = call(
        addr,
        &SsRequest::Create {
            file: file.to_string(),
        },
    )
    .await?;
    Ok(reply.status)
}

pub async fn delete(addr: &str, file: &str) -> Result<Status> {
    let reply: BasicReply = call(
        addr,
        &SsRequest::Delete {
            file: file.to_string(),
        },
    )
    .await?;
    Ok(reply.status)
}

pub async fn rename(addr: &str, file: &str, new_file: &str) -> Result<Status> {
    let reply: BasicReply = call(
        addr,
        &SsRequest::Rename {
            file: file.to_string(),
            new_file: new_file.to_string(),
        },
    )
    .await?;
    Ok(reply.status)
}

pub async fn create_folder(addr: &str, path: &str) -> Result<Status> {
    let reply: BasicReply = call(
        addr,
        &SsRequest::CreateFolder {
            path: path.to_string(),
        },
    )
    .await?;
    Ok(reply.status)
}

/// File metadata, authorized by a READ ticket or, when the caller only
/// holds W, a WRITE ticket. The reply is returned as-is so callers can
/// forward a non-OK status.
pub async fn info(addr: &str, ss_id: u32, file: &str, op: TicketOp) -> Result<SsInfoReply> {
    let ticket = Ticket::build(file, op, ss_id, TICKET_TTL_SECS).encode();
    call(
        addr,
        &SsRequest::Info {
            file: file.to_string(),
            ticket,
        },
    )
    .await
}

//! Frame Transport
//!
//! Every message on every connection is a 4-byte big-endian length followed
//! by that many bytes of UTF-8 JSON. Connections are long-lived and carry
//! multiple request/response pairs in sequence.

use anyhow::{bail, Result};
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame. A corrupt length header must not be able
/// to drive an unbounded allocation.
pub const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

/// Serialize `payload` as JSON and write it as one frame.
pub async fn send_frame<S, T>(stream: &mut S, payload: &T) -> Result<()>
where
    S: AsyncWrite + Unpin,
    T: Serialize + ?Sized,
{
    let body = serde_json::to_vec(payload)?;
    send_raw(stream, &body).await
}

/// Write pre-serialized bytes as one frame.
pub async fn send_raw<S>(stream: &mut S, body: &[u8]) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    let len = body.len() as u32;
    stream.write_all(&len.to_be_bytes()).await?;
    stream.write_all(body).await?;
    stream.flush().await?;
    Ok(())
}

/// Read one frame. Returns `Ok(None)` when the peer closed the connection
/// cleanly before a length header; any mid-frame EOF or I/O failure is an
/// error that terminates the connection.
pub async fn recv_raw<S>(stream: &mut S) -> Result<Option<Vec<u8>>>
where
    S: AsyncRead + Unpin,
{
    let mut header = [0u8; 4];
    match stream.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(header);
    if len > MAX_FRAME_BYTES {
        bail!("frame length {} exceeds limit", len);
    }
    let mut body = vec![0u8; len as usize];
    stream.read_exact(&mut body).await?;
    Ok(Some(body))
}

/// Read one frame and deserialize it.
pub async fn recv_frame<S, T>(stream: &mut S) -> Result<Option<T>>
where
    S: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    match recv_raw(stream).await? {
        Some(body) => Ok(Some(serde_json::from_slice(&body)?)),
        None => Ok(None),
    }
}

/// One request/response round-trip on a fresh connection to `addr`.
pub async fn request_once<T, R>(addr: &str, payload: &T) -> Result<R>
where
    T: Serialize,
    R: DeserializeOwned,
{
    let mut stream = tokio::net::TcpStream::connect(addr).await?;
    send_frame(&mut stream, payload).await?;
    match recv_frame(&mut stream).await? {
        Some(reply) => Ok(reply),
        None => bail!("peer closed connection before replying"),
    }
}

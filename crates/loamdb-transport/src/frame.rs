//! Length-prefixed framing.
//!
//! Control messages travel as length-prefixed JSON; payloads travel as
//! length-prefixed opaque binary blocks. The prefix is a 4-byte big-endian
//! length. Both sides enforce a maximum frame size so a corrupt prefix
//! cannot trigger an unbounded allocation.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Result, TransportError};

/// Maximum size of a JSON control frame.
pub const MAX_CONTROL_FRAME: usize = 16 * 1024 * 1024;

/// Maximum size of a binary payload block.
pub const MAX_PAYLOAD_BLOCK: usize = 256 * 1024 * 1024;

/// Object-safe byte stream used by connection handlers; concrete sockets
/// and in-process test pipes both erase to this.
pub type DynStream = Box<dyn Stream>;

/// Anything readable and writable asynchronously.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

async fn read_prefixed<R: AsyncRead + Unpin>(reader: &mut R, max: usize) -> Result<Vec<u8>> {
    let mut len_bytes = [0u8; 4];
    reader
        .read_exact(&mut len_bytes)
        .await
        .map_err(map_eof)?;
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max {
        return Err(TransportError::FrameTooLarge { size: len, max });
    }
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await.map_err(map_eof)?;
    Ok(buf)
}

async fn write_prefixed<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8], max: usize) -> Result<()> {
    if body.len() > max {
        return Err(TransportError::FrameTooLarge {
            size: body.len(),
            max,
        });
    }
    writer.write_all(&(body.len() as u32).to_be_bytes()).await?;
    writer.write_all(body).await?;
    writer.flush().await?;
    Ok(())
}

fn map_eof(e: std::io::Error) -> TransportError {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        TransportError::ConnectionClosed
    } else {
        TransportError::Io(e)
    }
}

/// Write one JSON control frame.
pub async fn write_json_frame<W, T>(writer: &mut W, message: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)
        .map_err(|e| TransportError::Serialization(e.to_string()))?;
    write_prefixed(writer, &body, MAX_CONTROL_FRAME).await
}

/// Read one JSON control frame.
pub async fn read_json_frame<R, T>(reader: &mut R) -> Result<T>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let body = read_prefixed(reader, MAX_CONTROL_FRAME).await?;
    serde_json::from_slice(&body).map_err(|e| TransportError::Serialization(e.to_string()))
}

/// Write one opaque binary payload block.
pub async fn write_binary_block<W: AsyncWrite + Unpin>(writer: &mut W, body: &[u8]) -> Result<()> {
    write_prefixed(writer, body, MAX_PAYLOAD_BLOCK).await
}

/// Read one opaque binary payload block.
pub async fn read_binary_block<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
    read_prefixed(reader, MAX_PAYLOAD_BLOCK).await
}

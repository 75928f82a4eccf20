//! Batch encoding and reply classification.
//!
//! A batch travels as one JSON `BatchMessage` frame with the entry headers,
//! followed by one binary block carrying the payloads in the same order.
//! Heartbeats are empty batches with no payload block.

use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite};

use loamdb_store::Payload;
use loamdb_transport::{
    read_binary_block, read_json_frame, write_binary_block, write_json_frame, BatchMessage,
    ReplicationMessageReply, ReplyType, TransportError,
};

use crate::error::{ReplError, Result};

/// Encode a payload block.
pub fn encode_payloads(payloads: &[Payload]) -> Result<Vec<u8>> {
    serde_json::to_vec(payloads)
        .map_err(|e| ReplError::Transport(TransportError::Serialization(e.to_string())))
}

/// Decode a payload block.
pub fn decode_payloads(bytes: &[u8]) -> Result<Vec<Payload>> {
    serde_json::from_slice(bytes)
        .map_err(|e| ReplError::Protocol {
            msg: format!("undecodable payload block: {e}"),
        })
}

/// Send one batch: the header frame, then the payload block. A heartbeat
/// (empty batch) sends no payload block.
pub async fn send_batch<S>(
    stream: &mut S,
    message: &BatchMessage,
    payloads: &[Payload],
) -> Result<()>
where
    S: AsyncWrite + Unpin,
{
    write_json_frame(stream, message).await?;
    if !message.is_heartbeat() {
        let block = encode_payloads(payloads)?;
        write_binary_block(stream, &block).await?;
    }
    Ok(())
}

/// Read one batch and its payloads.
pub async fn read_batch<S>(stream: &mut S) -> Result<(BatchMessage, Vec<Payload>)>
where
    S: AsyncRead + Unpin,
{
    let message: BatchMessage = read_json_frame(stream).await?;
    if message.is_heartbeat() {
        return Ok((message, Vec::new()));
    }
    let block = read_binary_block(stream).await?;
    let payloads = decode_payloads(&block)?;
    if payloads.len() != message.items.len() {
        return Err(ReplError::Protocol {
            msg: format!(
                "payload count {} does not match item count {}",
                payloads.len(),
                message.items.len()
            ),
        });
    }
    Ok((message, payloads))
}

/// Read a reply within a deadline.
pub async fn read_reply<S>(stream: &mut S, timeout: Duration) -> Result<ReplicationMessageReply>
where
    S: AsyncRead + Unpin,
{
    match tokio::time::timeout(timeout, read_json_frame(stream)).await {
        Ok(result) => result.map_err(ReplError::Transport),
        Err(_) => Err(ReplError::Transport(TransportError::Timeout {
            timeout_ms: timeout.as_millis() as u64,
        })),
    }
}

/// Map an `Error` reply to the error class it describes.
pub fn classify_error_reply(reply: &ReplicationMessageReply, database: &str) -> ReplError {
    debug_assert_eq!(reply.reply_type, ReplyType::Error);
    let msg = reply.message.clone().unwrap_or_default();
    let lower = msg.to_lowercase();
    if lower.contains("not the owner") || lower.contains("task is not mine") {
        ReplError::NotOwner { task: msg }
    } else if lower.contains("does not exist") || lower.contains("being deleted") {
        ReplError::DatabaseGone {
            database: database.to_string(),
            msg,
        }
    } else {
        ReplError::Protocol { msg }
    }
}

//! Replication wire messages.
//!
//! One TCP connection per destination. The JSON field names here are the
//! protocol; both sides serialize these structs literally.

use serde::{Deserialize, Serialize};

use loamdb_store::ChangeLogEntry;

/// The kind of long-lived stream a connection carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TcpOperation {
    /// Node-to-node replication.
    Replication,
    /// Worker-facing subscription delivery.
    Subscription,
}

/// First frame on every connection: what the stream is for.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TcpConnectionHeader {
    /// The stream kind.
    pub operation: TcpOperation,
    /// Protocol version the initiator speaks.
    pub protocol_version: u32,
    /// Target database name.
    pub database: String,
}

/// Sent by the replication source right after the header: identifies the
/// source and asks where to resume.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationLatestEtagRequest {
    /// Node tag of the source.
    pub source_node_tag: String,
    /// Machine name of the source, for operators.
    pub source_machine_name: String,
    /// Unique database id of the source.
    pub source_database_id: String,
    /// Database name of the source.
    pub source_database_name: String,
    /// URL of the source.
    pub source_url: String,
    /// Highest etag the source believes the destination has.
    pub last_sent_etag: u64,
    /// When set, the initiator is a pull-replication sink asking to be
    /// served from the named hub as if this node were replicating outbound.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serve_as_hub: Option<String>,
}

/// Whether a reply reports success or failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplyType {
    /// The request or batch was accepted.
    Ok,
    /// The request or batch was rejected; `message` explains why.
    Error,
}

/// What a reply acknowledges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageType {
    /// A liveness reply with no batch attached.
    Heartbeat,
    /// Acknowledgement of a replicated batch.
    Batch,
}

/// Reply sent by the replication destination: the handshake answer and
/// every per-batch acknowledgement use the same shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplicationMessageReply {
    /// Success or failure.
    #[serde(rename = "type")]
    pub reply_type: ReplyType,
    /// What this reply acknowledges.
    pub message_type: MessageType,
    /// Highest etag from this source the destination has accepted.
    pub last_etag_accepted: u64,
    /// Node tag of the destination.
    pub node_tag: String,
    /// The destination's full database change vector.
    pub database_change_vector: String,
    /// Error description when `type` is `Error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

/// A batch of change-log entries. The entry payloads follow the frame as
/// one binary block. A batch with no items doubles as the source-side
/// heartbeat (no payload block follows in that case).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchMessage {
    /// Entry headers in ascending etag order.
    pub items: Vec<ChangeLogEntry>,
    /// Etag of the last entry in the batch, or the source's current last
    /// etag for a heartbeat.
    pub last_etag_in_batch: u64,
}

impl BatchMessage {
    /// True when this message is a source-side heartbeat.
    pub fn is_heartbeat(&self) -> bool {
        self.items.is_empty()
    }
}

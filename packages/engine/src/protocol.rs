//! Wire protocol for the `/ws` signaling session.
//!
//! Mirrors the hub's `protocol` module field-for-field — the two are
//! deliberately not shared via a common crate, the same way
//! `umbra-core::network::relay_client` keeps its own copy of the relay's
//! message enums with a comment that they "must match" the server.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    DeviceRegister {
        #[serde(rename = "deviceId")]
        device_id: String,
        name: String,
        #[serde(rename = "deviceType")]
        device_type: String,
    },

    DeviceUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        status: Option<String>,
    },

    TransferOffer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
        #[serde(rename = "fileType")]
        file_type: String,
        #[serde(rename = "receiverId")]
        receiver_id: String,
    },

    TransferAnswer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        accepted: bool,
    },

    WebrtcOffer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        sdp: serde_json::Value,
    },

    WebrtcAnswer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        sdp: serde_json::Value,
    },

    WebrtcIceCandidate {
        #[serde(rename = "transferId")]
        transfer_id: String,
        candidate: serde_json::Value,
    },

    TransferProgress {
        #[serde(rename = "transferId")]
        transfer_id: String,
        progress: u8,
    },

    TransferComplete {
        #[serde(rename = "transferId")]
        transfer_id: String,
    },

    TransferError {
        #[serde(rename = "transferId")]
        transfer_id: String,
        message: String,
    },

    Ping {
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    DeviceList {
        devices: Vec<DeviceRecord>,
    },

    TransferOffer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
        #[serde(rename = "fileType")]
        file_type: String,
        #[serde(rename = "senderId")]
        sender_id: String,
    },

    TransferAnswer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        accepted: bool,
    },

    WebrtcOffer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        sdp: serde_json::Value,
    },

    WebrtcAnswer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        sdp: serde_json::Value,
    },

    WebrtcIceCandidate {
        #[serde(rename = "transferId")]
        transfer_id: String,
        candidate: serde_json::Value,
    },

    TransferProgress {
        #[serde(rename = "transferId")]
        transfer_id: String,
        progress: u8,
        status: String,
    },

    TransferComplete {
        #[serde(rename = "transferId")]
        transfer_id: String,
    },

    TransferError {
        #[serde(rename = "transferId")]
        transfer_id: String,
        message: String,
    },

    Pong {
        timestamp: i64,
        #[serde(rename = "originalTimestamp")]
        original_timestamp: i64,
    },

    Error {
        message: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceRecord {
    #[serde(rename = "deviceId")]
    pub id: String,
    pub name: String,
    #[serde(rename = "deviceType")]
    pub device_type: String,
    pub status: String,
    #[serde(rename = "lastSeen")]
    pub last_seen: chrono::DateTime<chrono::Utc>,
}

/// Data-channel wire envelope (§6): sent over the `fileTransfer` data
/// channel, not over `/ws`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ChunkMessage {
    Metadata {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
        #[serde(rename = "fileType")]
        file_type: String,
        #[serde(rename = "totalChunks")]
        total_chunks: u32,
    },
    Chunk {
        index: u32,
        data: Vec<u8>,
    },
}

//! Signaling protocol message definitions.
//!
//! The hub speaks a simple JSON-over-WebSocket protocol at `/ws`. Every
//! message is a single JSON object discriminated by its `type` field. Field
//! names are camelCase to match the wire contract a browser-capable client
//! expects; variant discriminants are kebab-case for the same reason.

use serde::{Deserialize, Serialize};

use crate::registry::Device;
use crate::transfers::{Transfer, TransferStatus};

/// Messages sent from a client to the hub.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Upsert this connection's device record and bind the session to it.
    /// Must be the first non-ping message sent after connecting.
    DeviceRegister {
        #[serde(rename = "deviceId")]
        device_id: String,
        name: String,
        #[serde(rename = "deviceType")]
        device_type: String,
    },

    /// Patch the bound device's name and/or status.
    DeviceUpdate {
        name: Option<String>,
        status: Option<String>,
    },

    /// Create a transfer and forward the offer to the receiver.
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

    /// Accept or reject a pending transfer offer.
    TransferAnswer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        accepted: bool,
    },

    /// SDP offer for the direct peer session, forwarded to the receiver.
    WebrtcOffer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        sdp: serde_json::Value,
    },

    /// SDP answer, forwarded to the sender.
    WebrtcAnswer {
        #[serde(rename = "transferId")]
        transfer_id: String,
        sdp: serde_json::Value,
    },

    /// An ICE candidate, forwarded to the other endpoint of the transfer.
    WebrtcIceCandidate {
        #[serde(rename = "transferId")]
        transfer_id: String,
        candidate: serde_json::Value,
    },

    /// Progress update; the hub derives status from the progress value.
    TransferProgress {
        #[serde(rename = "transferId")]
        transfer_id: String,
        progress: u8,
    },

    /// Sender-reported completion.
    TransferComplete {
        #[serde(rename = "transferId")]
        transfer_id: String,
    },

    /// Either endpoint reporting a fatal transfer failure.
    TransferError {
        #[serde(rename = "transferId")]
        transfer_id: String,
        message: String,
    },

    /// Liveness probe; answered with `pong` echoing the timestamp.
    Ping { timestamp: i64 },
}

/// Messages sent from the hub to a client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// The current reachable device list, with the recipient's own record
    /// omitted.
    DeviceList { devices: Vec<Device> },

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
        status: TransferStatus,
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

    Error { message: String },
}

impl ServerMessage {
    /// Builds a `transfer-progress` echo from a stored record.
    pub fn progress(transfer: &Transfer) -> Self {
        ServerMessage::TransferProgress {
            transfer_id: transfer.id.clone(),
            progress: transfer.progress,
            status: transfer.status,
        }
    }
}

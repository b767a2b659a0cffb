//! Client-side transfer engine for the LAN peer-to-peer file transfer hub.
//!
//! Three pieces compose into an embedding application: [`session::SessionClient`]
//! keeps the signaling connection alive, [`transfer::TransferEngine`] drives
//! each transfer's state machine, and [`save_handler::SaveHandler`] is where
//! the embedder decides what a completed receive becomes.

pub mod error;
pub mod peer;
pub mod protocol;
pub mod relay_client;
pub mod save_handler;
pub mod session;
pub mod transfer;

pub use error::EngineError;
pub use peer::{PeerEvent, PeerSession};
pub use protocol::{ChunkMessage, ClientMessage, DeviceRecord, ServerMessage};
pub use relay_client::RelayClient;
pub use save_handler::{DiscardSaveHandler, SaveHandler};
pub use session::{DeviceIdentity, SessionClient};
pub use transfer::{IncomingOffer, OutgoingFile, TransferEngine, TransferEvent, TransferState};

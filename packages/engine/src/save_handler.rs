//! External save handler.
//!
//! File-system writing is explicitly out of scope for this crate (§1); a
//! completed receive hands the reassembled bytes to whatever the embedding
//! application wants to do with them — write to disk, hand to a picker
//! dialog, and so on. Invoked exactly once per completed transfer.

use async_trait::async_trait;

use crate::error::EngineError;

#[async_trait]
pub trait SaveHandler: Send + Sync {
    async fn save(
        &self,
        transfer_id: &str,
        file_name: &str,
        file_type: &str,
        relative_path: Option<&str>,
        bytes: Vec<u8>,
    ) -> Result<(), EngineError>;
}

/// A save handler that discards the bytes. Useful for tests and headless
/// relay-only embeddings.
pub struct DiscardSaveHandler;

#[async_trait]
impl SaveHandler for DiscardSaveHandler {
    async fn save(
        &self,
        _transfer_id: &str,
        _file_name: &str,
        _file_type: &str,
        _relative_path: Option<&str>,
        _bytes: Vec<u8>,
    ) -> Result<(), EngineError> {
        Ok(())
    }
}

//! Relay buffer.
//!
//! Fallback payload storage for transfers that never got a direct peer
//! session up. Payloads, the "accepted for download" flag, and the
//! dedup windows for uploads/completions are all held here — these are the
//! spec's `processedUploads` / `notifiedTransfers` / `acceptedTransfers`
//! global sets, given explicit retention windows instead of living forever.

use std::time::{Duration, Instant};

use bytes::Bytes;
use dashmap::DashMap;

/// 2 GiB default cap on a single relayed payload.
pub const DEFAULT_MAX_PAYLOAD_BYTES: u64 = 2 * 1024 * 1024 * 1024;

/// Retention after a successful download.
pub const DOWNLOADED_RETENTION: Duration = Duration::from_secs(60);
/// Retention for an uploaded-but-never-downloaded entry.
pub const UNUSED_RETENTION: Duration = Duration::from_secs(30);
/// De-dup window for the `transfer-complete` notice sent on upload.
pub const NOTIFY_DEDUP_WINDOW: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub struct RelayEntry {
    pub payload: Bytes,
    pub file_name: String,
    pub media_type: String,
    pub relative_path: String,
    pub uploaded_at: Instant,
    /// Must be true (set by a `transfer-answer(accepted=true)`) to permit
    /// download.
    pub accepted: bool,
}

#[derive(Debug, Default)]
pub struct RelayBuffer {
    entries: DashMap<String, RelayEntry>,
    /// Transfer ids that have already had a `transfer-complete` notice
    /// forwarded, with the instant it was sent — cleared after the dedup
    /// window.
    notified: DashMap<String, Instant>,
}

impl RelayBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Marks a transfer as authorized for download (called when the
    /// receiver sends `transfer-answer(accepted=true)`, before any payload
    /// necessarily exists yet).
    pub fn authorize(&self, transfer_id: &str) {
        if let Some(mut entry) = self.entries.get_mut(transfer_id) {
            entry.accepted = true;
        } else {
            // No payload yet: create a placeholder so a later upload
            // inherits the authorization instead of needing a separate flag map.
            self.entries.insert(
                transfer_id.to_string(),
                RelayEntry {
                    payload: Bytes::new(),
                    file_name: String::new(),
                    media_type: String::new(),
                    relative_path: String::new(),
                    uploaded_at: Instant::now(),
                    accepted: true,
                },
            );
        }
    }

    pub fn is_authorized(&self, transfer_id: &str) -> bool {
        self.entries.get(transfer_id).map_or(false, |e| e.accepted)
    }

    /// True once a non-empty payload has landed for this id (idempotency
    /// check for retried uploads).
    pub fn has_payload(&self, transfer_id: &str) -> bool {
        self.entries
            .get(transfer_id)
            .map_or(false, |e| !e.payload.is_empty())
    }

    pub fn store(
        &self,
        transfer_id: &str,
        payload: Bytes,
        file_name: String,
        media_type: String,
        relative_path: Option<String>,
    ) {
        let relative_path = relative_path.unwrap_or_else(|| file_name.clone());
        let accepted = self.is_authorized(transfer_id);
        self.entries.insert(
            transfer_id.to_string(),
            RelayEntry {
                payload,
                file_name,
                media_type,
                relative_path,
                uploaded_at: Instant::now(),
                accepted,
            },
        );
    }

    pub fn get(&self, transfer_id: &str) -> Option<RelayEntry> {
        self.entries.get(transfer_id).map(|e| e.clone())
    }

    pub fn discard(&self, transfer_id: &str) {
        self.entries.remove(transfer_id);
        self.notified.remove(transfer_id);
    }

    /// Records that a `transfer-complete` notice was just sent; returns
    /// `true` if this is the first such notice within the dedup window
    /// (i.e. the caller should actually send it).
    pub fn should_notify_complete(&self, transfer_id: &str) -> bool {
        let now = Instant::now();
        if let Some(prev) = self.notified.get(transfer_id) {
            if now.duration_since(*prev) < NOTIFY_DEDUP_WINDOW {
                return false;
            }
        }
        self.notified.insert(transfer_id.to_string(), now);
        true
    }

    /// Sweeps entries past their retention window. Called by the
    /// background cleanup task and usable directly from tests.
    pub fn sweep_expired(&self) {
        let now = Instant::now();
        self.entries.retain(|_, entry| {
            let retention = if entry.accepted && !entry.payload.is_empty() {
                DOWNLOADED_RETENTION
            } else {
                UNUSED_RETENTION
            };
            now.duration_since(entry.uploaded_at) < retention
        });
        self.notified
            .retain(|_, at| now.duration_since(*at) < NOTIFY_DEDUP_WINDOW);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn download_requires_prior_acceptance() {
        let buf = RelayBuffer::new();
        buf.store("t1", Bytes::from_static(b"hello"), "a.txt".into(), "text/plain".into(), None);
        assert!(!buf.is_authorized("t1"));
        buf.authorize("t1");
        assert!(buf.is_authorized("t1"));
        assert_eq!(buf.get("t1").unwrap().payload, Bytes::from_static(b"hello"));
    }

    #[test]
    fn authorize_before_upload_carries_forward() {
        let buf = RelayBuffer::new();
        buf.authorize("t1");
        buf.store("t1", Bytes::from_static(b"hi"), "a.txt".into(), "text/plain".into(), None);
        assert!(buf.is_authorized("t1"));
    }

    #[test]
    fn relative_path_defaults_to_file_name() {
        let buf = RelayBuffer::new();
        buf.store("t1", Bytes::from_static(b"hi"), "a.txt".into(), "text/plain".into(), None);
        assert_eq!(buf.get("t1").unwrap().relative_path, "a.txt");
    }

    #[test]
    fn notify_complete_is_deduplicated() {
        let buf = RelayBuffer::new();
        assert!(buf.should_notify_complete("t1"));
        assert!(!buf.should_notify_complete("t1"));
    }

    #[test]
    fn has_payload_false_until_stored() {
        let buf = RelayBuffer::new();
        buf.authorize("t1");
        assert!(!buf.has_payload("t1"));
        buf.store("t1", Bytes::from_static(b"x"), "a".into(), "text/plain".into(), None);
        assert!(buf.has_payload("t1"));
    }
}

//! Transfer store.
//!
//! Holds one record per transfer id and enforces the status-transition
//! table from the spec as an explicit match over `(current, requested)`
//! rather than a free-form string update, so illegal transitions are a
//! typed error callers can choose to log or treat as a bug.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransferStatus {
    Pending,
    Accepted,
    Transferring,
    Completed,
    Rejected,
    Failed,
}

impl TransferStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TransferStatus::Completed | TransferStatus::Failed | TransferStatus::Rejected
        )
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Transfer {
    #[serde(rename = "transferId")]
    pub id: String,
    #[serde(rename = "fileName")]
    pub file_name: String,
    #[serde(rename = "fileSize")]
    pub file_size: u64,
    #[serde(rename = "fileType")]
    pub file_type: String,
    #[serde(rename = "senderId")]
    pub sender_id: String,
    #[serde(rename = "receiverId")]
    pub receiver_id: String,
    pub status: TransferStatus,
    pub progress: u8,
    #[serde(rename = "createdAt")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "completedAt")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Fields required to create a new transfer record.
#[derive(Debug, Clone)]
pub struct NewTransfer {
    pub id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub sender_id: String,
    pub receiver_id: String,
}

/// A status/progress update applied through `update`.
#[derive(Debug, Clone, Copy)]
pub struct StatusUpdate {
    pub status: TransferStatus,
    pub progress: Option<u8>,
}

#[derive(thiserror::Error, Debug)]
pub enum TransferStoreError {
    #[error("transfer {0} already exists")]
    AlreadyExists(String),
    #[error("transfer {0} not found")]
    NotFound(String),
    #[error("transfer {0} is already in a terminal state")]
    AlreadyTerminal(String),
    #[error("illegal transition for transfer {transfer}: {from:?} -> {to:?}")]
    IllegalTransition {
        transfer: String,
        from: TransferStatus,
        to: TransferStatus,
    },
    #[error("transfer {0}: sender and receiver must differ")]
    SenderIsReceiver(String),
}

#[derive(Debug, Default)]
pub struct TransferStore {
    transfers: DashMap<String, Transfer>,
}

fn transition_allowed(from: TransferStatus, to: TransferStatus) -> bool {
    use TransferStatus::*;
    if from == to {
        return true;
    }
    matches!(
        (from, to),
        (Pending, Accepted)
            | (Pending, Rejected)
            | (Accepted, Transferring)
            | (Accepted, Failed)
            | (Transferring, Completed)
            | (Transferring, Failed)
            // progress updates can jump straight from accepted to completed
            // when the whole file lands in one chunk
            | (Accepted, Completed)
    )
}

impl TransferStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, record: NewTransfer) -> Result<Transfer, TransferStoreError> {
        if record.sender_id == record.receiver_id {
            return Err(TransferStoreError::SenderIsReceiver(record.id));
        }
        if self.transfers.contains_key(&record.id) {
            return Err(TransferStoreError::AlreadyExists(record.id));
        }
        let transfer = Transfer {
            id: record.id.clone(),
            file_name: record.file_name,
            file_size: record.file_size,
            file_type: record.file_type,
            sender_id: record.sender_id,
            receiver_id: record.receiver_id,
            status: TransferStatus::Pending,
            progress: 0,
            created_at: Utc::now(),
            completed_at: None,
        };
        self.transfers.insert(record.id.clone(), transfer.clone());
        tracing::info!(transfer_id = record.id.as_str(), "transfer created");
        Ok(transfer)
    }

    /// Applies a status/progress update, enforcing §3's transition table.
    /// A transition into a terminal state stamps `completed_at` and is
    /// final: any further call for this id returns `AlreadyTerminal`.
    pub fn update(
        &self,
        transfer_id: &str,
        update: StatusUpdate,
    ) -> Result<Transfer, TransferStoreError> {
        let mut entry = self
            .transfers
            .get_mut(transfer_id)
            .ok_or_else(|| TransferStoreError::NotFound(transfer_id.to_string()))?;

        if entry.status.is_terminal() {
            return Err(TransferStoreError::AlreadyTerminal(transfer_id.to_string()));
        }

        if !transition_allowed(entry.status, update.status) {
            return Err(TransferStoreError::IllegalTransition {
                transfer: transfer_id.to_string(),
                from: entry.status,
                to: update.status,
            });
        }

        if let Some(progress) = update.progress {
            // progress is monotonically non-decreasing within a non-terminal span
            entry.progress = entry.progress.max(progress).min(100);
        }
        entry.status = update.status;
        if update.status == TransferStatus::Completed {
            entry.progress = 100;
        }
        if entry.status.is_terminal() {
            entry.completed_at = Some(Utc::now());
        }

        tracing::info!(
            transfer_id,
            status = ?entry.status,
            progress = entry.progress,
            "transfer updated"
        );
        Ok(entry.clone())
    }

    pub fn get(&self, transfer_id: &str) -> Option<Transfer> {
        self.transfers.get(transfer_id).map(|t| t.clone())
    }

    /// Transfers where `device_id` is sender or receiver and status is
    /// non-terminal.
    pub fn active_for(&self, device_id: &str) -> Vec<Transfer> {
        self.transfers
            .iter()
            .filter(|t| (t.sender_id == device_id || t.receiver_id == device_id))
            .filter(|t| !t.status.is_terminal())
            .map(|t| t.clone())
            .collect()
    }

    /// Terminal-status transfers involving `device_id`, newest first,
    /// truncated to `limit`.
    pub fn history_for(&self, device_id: &str, limit: usize) -> Vec<Transfer> {
        let mut records: Vec<Transfer> = self
            .transfers
            .iter()
            .filter(|t| (t.sender_id == device_id || t.receiver_id == device_id))
            .filter(|t| t.status.is_terminal())
            .map(|t| t.clone())
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        records
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(id: &str) -> NewTransfer {
        NewTransfer {
            id: id.to_string(),
            file_name: "a.bin".into(),
            file_size: 1024,
            file_type: "application/octet-stream".into(),
            sender_id: "a".into(),
            receiver_id: "b".into(),
        }
    }

    #[test]
    fn create_rejects_duplicate_id() {
        let store = TransferStore::new();
        store.create(sample("t1")).unwrap();
        let err = store.create(sample("t1")).unwrap_err();
        assert!(matches!(err, TransferStoreError::AlreadyExists(_)));
    }

    #[test]
    fn create_rejects_sender_as_own_receiver() {
        let store = TransferStore::new();
        let mut record = sample("t1");
        record.receiver_id = record.sender_id.clone();
        let err = store.create(record).unwrap_err();
        assert!(matches!(err, TransferStoreError::SenderIsReceiver(_)));
        assert!(store.get("t1").is_none());
    }

    #[test]
    fn terminal_state_is_final() {
        let store = TransferStore::new();
        store.create(sample("t1")).unwrap();
        store
            .update(
                "t1",
                StatusUpdate { status: TransferStatus::Accepted, progress: None },
            )
            .unwrap();
        store
            .update(
                "t1",
                StatusUpdate { status: TransferStatus::Completed, progress: Some(100) },
            )
            .unwrap();

        let err = store
            .update(
                "t1",
                StatusUpdate { status: TransferStatus::Failed, progress: None },
            )
            .unwrap_err();
        assert!(matches!(err, TransferStoreError::AlreadyTerminal(_)));
    }

    #[test]
    fn progress_is_monotonic() {
        let store = TransferStore::new();
        store.create(sample("t1")).unwrap();
        store
            .update(
                "t1",
                StatusUpdate { status: TransferStatus::Accepted, progress: None },
            )
            .unwrap();
        store
            .update(
                "t1",
                StatusUpdate { status: TransferStatus::Transferring, progress: Some(50) },
            )
            .unwrap();
        let t = store
            .update(
                "t1",
                StatusUpdate { status: TransferStatus::Transferring, progress: Some(10) },
            )
            .unwrap();
        assert_eq!(t.progress, 50);
    }

    #[test]
    fn completed_implies_progress_100() {
        let store = TransferStore::new();
        store.create(sample("t1")).unwrap();
        store
            .update(
                "t1",
                StatusUpdate { status: TransferStatus::Accepted, progress: None },
            )
            .unwrap();
        let t = store
            .update(
                "t1",
                StatusUpdate { status: TransferStatus::Completed, progress: None },
            )
            .unwrap();
        assert_eq!(t.progress, 100);
        assert!(t.completed_at.is_some());
    }

    #[test]
    fn history_sorted_newest_first_and_truncated() {
        let store = TransferStore::new();
        for i in 0..5 {
            let id = format!("t{i}");
            store.create(sample(&id)).unwrap();
            store
                .update(&id, StatusUpdate { status: TransferStatus::Rejected, progress: None })
                .unwrap();
        }
        let history = store.history_for("a", 3);
        assert_eq!(history.len(), 3);
        for pair in history.windows(2) {
            assert!(pair[0].created_at >= pair[1].created_at);
        }
    }

    #[test]
    fn active_for_excludes_terminal() {
        let store = TransferStore::new();
        store.create(sample("t1")).unwrap();
        store.create(sample("t2")).unwrap();
        store
            .update("t2", StatusUpdate { status: TransferStatus::Rejected, progress: None })
            .unwrap();
        let active = store.active_for("a");
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].id, "t1");
    }
}

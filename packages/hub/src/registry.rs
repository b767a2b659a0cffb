//! Presence registry.
//!
//! Tracks which devices have registered with the hub and whether they are
//! currently reachable. All storage is in-memory and keyed by the opaque,
//! client-assigned device id.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

/// Default liveness window: a device whose last-seen is older than this is
/// treated as unreachable by `list_reachable`, regardless of its stored
/// status. Overridable via `HubConfig::liveness_secs`.
pub const LIVENESS_WINDOW_SECS: i64 = 300;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceStatus {
    Available,
    Busy,
    Offline,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Device {
    #[serde(rename = "deviceId")]
    pub id: String,
    pub name: String,
    #[serde(rename = "deviceType")]
    pub device_type: String,
    pub status: DeviceStatus,
    #[serde(rename = "lastSeen")]
    pub last_seen: DateTime<Utc>,
}

impl Device {
    fn is_reachable(&self, now: DateTime<Utc>, liveness_secs: i64) -> bool {
        self.status != DeviceStatus::Offline
            && (now - self.last_seen).num_seconds() < liveness_secs
    }
}

/// Patch applied by `update`. `None` fields are left unchanged.
#[derive(Debug, Default, Clone)]
pub struct DevicePatch {
    pub name: Option<String>,
    pub status: Option<DeviceStatus>,
}

/// In-memory map of device id -> device record, safe for concurrent access
/// from every session task.
#[derive(Debug, Default)]
pub struct PresenceRegistry {
    devices: DashMap<String, Device>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts a device, resetting status to `available` and stamping
    /// `last_seen`. Name and form-factor tag are always (re)written per §3.
    pub fn register(&self, device_id: &str, name: String, device_type: String) -> Device {
        let now = Utc::now();
        let device = Device {
            id: device_id.to_string(),
            name,
            device_type,
            status: DeviceStatus::Available,
            last_seen: now,
        };
        self.devices.insert(device_id.to_string(), device.clone());
        tracing::info!(device_id, "device registered");
        device
    }

    /// Applies a name/status patch and stamps `last_seen`. No-op if the
    /// device id is unknown.
    pub fn update(&self, device_id: &str, patch: DevicePatch) -> Option<Device> {
        let mut entry = self.devices.get_mut(device_id)?;
        if let Some(name) = patch.name {
            entry.name = name;
        }
        if let Some(status) = patch.status {
            entry.status = status;
        }
        entry.last_seen = Utc::now();
        Some(entry.clone())
    }

    /// Marks a device offline without removing its record, per session
    /// close and liveness-expiry rules.
    pub fn mark_offline(&self, device_id: &str) {
        if let Some(mut entry) = self.devices.get_mut(device_id) {
            entry.status = DeviceStatus::Offline;
            tracing::info!(device_id, "device marked offline");
        }
    }

    pub fn get(&self, device_id: &str) -> Option<Device> {
        self.devices.get(device_id).map(|d| d.clone())
    }

    /// All reachable devices, excluding `exclude_id` if given.
    pub fn list_reachable(&self, exclude_id: Option<&str>, liveness_secs: i64) -> Vec<Device> {
        let now = Utc::now();
        self.devices
            .iter()
            .filter(|entry| entry.is_reachable(now, liveness_secs))
            .filter(|entry| exclude_id.map_or(true, |id| entry.id != id))
            .map(|entry| entry.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_sets_available_and_stamps_last_seen() {
        let reg = PresenceRegistry::new();
        let d = reg.register("dev-1", "Laptop".into(), "laptop".into());
        assert_eq!(d.status, DeviceStatus::Available);
        assert!((Utc::now() - d.last_seen).num_seconds() < 2);
    }

    #[test]
    fn list_reachable_excludes_offline_and_caller() {
        let reg = PresenceRegistry::new();
        reg.register("a", "A".into(), "laptop".into());
        reg.register("b", "B".into(), "mobile".into());
        reg.mark_offline("b");

        let reachable = reg.list_reachable(Some("a"), LIVENESS_WINDOW_SECS);
        assert!(reachable.iter().all(|d| d.id != "a"));
        assert!(reachable.iter().all(|d| d.id != "b"));
    }

    #[test]
    fn list_reachable_treats_stale_last_seen_as_offline() {
        let reg = PresenceRegistry::new();
        reg.register("stale", "Old".into(), "tablet".into());
        if let Some(mut entry) = reg.devices.get_mut("stale") {
            entry.last_seen = Utc::now() - chrono::Duration::seconds(LIVENESS_WINDOW_SECS + 1);
        }
        assert!(reg.list_reachable(None, LIVENESS_WINDOW_SECS).is_empty());
    }

    #[test]
    fn update_is_noop_for_unknown_device() {
        let reg = PresenceRegistry::new();
        let patch = DevicePatch { name: Some("X".into()), status: None };
        assert!(reg.update("ghost", patch).is_none());
    }

    #[test]
    fn case_sensitive_ids_are_distinct() {
        let reg = PresenceRegistry::new();
        reg.register("Device1", "A".into(), "laptop".into());
        reg.register("device1", "B".into(), "laptop".into());
        assert!(reg.get("Device1").is_some());
        assert!(reg.get("device1").is_some());
        assert_eq!(reg.list_reachable(None, LIVENESS_WINDOW_SECS).len(), 2);
    }
}

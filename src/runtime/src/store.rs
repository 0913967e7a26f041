//! Persistent VM records.
//!
//! Records are stored as JSON in `<state_dir>/vms.json` with atomic writes
//! (write to tmp file, then rename) to prevent corruption. At startup the
//! manager reloads them to seed the IP allocator and port-forward manager
//! and to re-expose stopped VMs.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use sandcastle_core::config::NfsSource;
use sandcastle_core::error::{FleetError, Result};

use crate::net::PortForward;
use crate::vm::VmState;

/// The durable slice of one VM record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRecordData {
    pub name: String,
    pub state: VmState,
    pub guest_ip: Option<Ipv4Addr>,
    pub tap_device: Option<String>,
    #[serde(default)]
    pub port_forwards: Vec<PortForward>,
    pub stateful_disk_path: PathBuf,
    pub root_source: NfsSource,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry_point: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub callback_url: Option<String>,
    pub created_at: String,
}

/// Serializable wrapper for the records file.
#[derive(Debug, Serialize, Deserialize, Default)]
struct RecordsFile {
    vms: HashMap<String, VmRecordData>,
}

/// Persistent store for VM records.
#[derive(Debug)]
pub struct VmStore {
    path: PathBuf,
}

impl VmStore {
    /// Create a store backed by `<state_dir>/vms.json`.
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join("vms.json"),
        }
    }

    /// Load all records from disk.
    pub fn load(&self) -> Result<HashMap<String, VmRecordData>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }

        let data = std::fs::read_to_string(&self.path).map_err(|e| {
            FleetError::Internal(format!(
                "failed to read VM records {}: {}",
                self.path.display(),
                e
            ))
        })?;

        let file: RecordsFile = serde_json::from_str(&data).map_err(|e| {
            FleetError::Internal(format!("failed to parse VM records: {}", e))
        })?;

        Ok(file.vms)
    }

    /// Save all records to disk (atomic write).
    pub fn save(&self, vms: &HashMap<String, VmRecordData>) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let file = RecordsFile { vms: vms.clone() };
        let json = serde_json::to_string_pretty(&file)?;

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &json)?;
        std::fs::rename(&tmp_path, &self.path)?;

        Ok(())
    }

    /// The store file path.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(name: &str) -> VmRecordData {
        VmRecordData {
            name: name.to_string(),
            state: VmState::Running,
            guest_ip: Some(Ipv4Addr::new(10, 20, 1, 2)),
            tap_device: Some(format!("tap-{}", name)),
            port_forwards: vec![PortForward {
                host_port: 8080,
                guest_port: 8080,
                description: "web".to_string(),
            }],
            stateful_disk_path: PathBuf::from(format!("/var/lib/sandcastle/{}/stateful.img", name)),
            root_source: NfsSource {
                server: "127.0.0.1".to_string(),
                port: 11111,
                path: "/".to_string(),
            },
            entry_point: None,
            callback_url: None,
            created_at: "2026-01-01T00:00:00Z".to_string(),
        }
    }

    #[test]
    fn test_load_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::new(dir.path());
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::new(dir.path());

        let mut vms = HashMap::new();
        vms.insert("alpha".to_string(), record("alpha"));
        store.save(&vms).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        let alpha = &loaded["alpha"];
        assert_eq!(alpha.guest_ip, Some(Ipv4Addr::new(10, 20, 1, 2)));
        assert_eq!(alpha.state, VmState::Running);
        assert_eq!(alpha.port_forwards[0].host_port, 8080);
    }

    #[test]
    fn test_save_is_atomic() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::new(dir.path());

        let mut vms = HashMap::new();
        vms.insert("alpha".to_string(), record("alpha"));
        store.save(&vms).unwrap();

        let tmp = store.path().with_extension("json.tmp");
        assert!(!tmp.exists());
        let data = std::fs::read_to_string(store.path()).unwrap();
        let _: serde_json::Value = serde_json::from_str(&data).unwrap();
    }

    #[test]
    fn test_remove_persists() {
        let dir = tempfile::tempdir().unwrap();
        let store = VmStore::new(dir.path());

        let mut vms = HashMap::new();
        vms.insert("alpha".to_string(), record("alpha"));
        vms.insert("beta".to_string(), record("beta"));
        store.save(&vms).unwrap();

        vms.remove("alpha");
        store.save(&vms).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.len(), 1);
        assert!(loaded.contains_key("beta"));
    }
}

// Copyright (c) 2025 SOLARE S.R.O.
//
// This file is part of FluxION.
//
// Licensed under the Creative Commons Attribution-NonCommercial-NoDerivatives 4.0 International
// (CC BY-NC-ND 4.0). You may use and share this file for non-commercial purposes only and you may not
// create derivatives. See <https://creativecommons.org/licenses/by-nc-nd/4.0/>.
//
// This software is provided "AS IS", without warranty of any kind.
//
// For commercial licensing, please contact: info@solare.cz

//! Persisted fleet configuration
//!
//! A namespaced key/value store kept as one JSON document. Every mutation is
//! written through with a temp-file-and-rename so a crash never leaves a
//! half-written file behind.

use crate::error::{FleetError, Result};
use crate::fabric::DeviceId;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub const STORE_FILE: &str = "monitoring.json";

pub mod keys {
    pub const MONITORED_NAMES: &str = "monitoredDeviceNames";
    pub const MONITORED_DEVICE_PREFIX: &str = "monitoredDevice-";
    pub const TYPE_VERSION: &str = "deviceTypeVersion";
    pub const GENERAL: &str = "general";

    pub const ENABLED: &str = "enabled";
    pub const ID: &str = "ID";
    pub const TYPE: &str = "type";
    pub const UPDATE_SERVER_ID: &str = "updateServerDeviceID";
    pub const UPDATE_ABORTED: &str = "updateAborted";
    pub const UPDATE_ABORTED_UNTIL: &str = "updateAbortedUntil";
}

type Namespaces = BTreeMap<String, BTreeMap<String, String>>;

/// One monitored worker as recorded in the store
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerRecord {
    pub name: String,
    pub id: DeviceId,
    pub device_type: String,
}

#[derive(Debug)]
pub struct PropertyStore {
    path: PathBuf,
    data: Mutex<Namespaces>,
}

impl PropertyStore {
    /// Open `<root>/monitoring.json`, starting empty when absent
    pub fn open_in(root: &Path) -> Result<Self> {
        Self::open(root.join(STORE_FILE))
    }

    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let data = if path.exists() {
            let content = fs::read_to_string(&path)?;
            serde_json::from_str(&content).map_err(|e| {
                FleetError::Config(format!("Failed to parse {}: {e}", path.display()))
            })?
        } else {
            Namespaces::new()
        };
        Ok(Self {
            path,
            data: Mutex::new(data),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn get(&self, namespace: &str, key: &str) -> Option<String> {
        self.data.lock().get(namespace)?.get(key).cloned()
    }

    pub fn entries(&self, namespace: &str) -> BTreeMap<String, String> {
        self.data.lock().get(namespace).cloned().unwrap_or_default()
    }

    pub fn set(&self, namespace: &str, key: &str, value: &str) -> Result<()> {
        let mut data = self.data.lock();
        self.reload(&mut data);
        data.entry(namespace.to_owned())
            .or_default()
            .insert(key.to_owned(), value.to_owned());
        self.persist(&data)
    }

    pub fn remove(&self, namespace: &str, key: &str) -> Result<()> {
        let mut data = self.data.lock();
        self.reload(&mut data);
        let removed = data
            .get_mut(namespace)
            .and_then(|entries| entries.remove(key))
            .is_some();
        if removed {
            self.persist(&data)?;
        }
        Ok(())
    }

    /// Pick up keys written by other processes sharing the file
    fn reload(&self, data: &mut Namespaces) {
        let Ok(content) = fs::read_to_string(&self.path) else {
            return;
        };
        match serde_json::from_str(&content) {
            Ok(fresh) => *data = fresh,
            Err(e) => warn!("Keeping cached store, {} is unreadable: {}", self.path.display(), e),
        }
    }

    fn persist(&self, data: &Namespaces) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let temp_path = self.path.with_extension("tmp");
        let content = serde_json::to_string_pretty(data)?;

        // Atomic write
        fs::write(&temp_path, content)?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    // Fleet accessors

    /// Enabled workers; malformed records are skipped with a warning
    pub fn workers(&self) -> Vec<WorkerRecord> {
        let names = self.entries(keys::MONITORED_NAMES);
        let mut workers = Vec::new();

        for (name, flag) in names {
            if flag != keys::ENABLED {
                debug!("Monitored device {} is not enabled, skipping", name);
                continue;
            }
            let namespace = format!("{}{name}", keys::MONITORED_DEVICE_PREFIX);
            let (Some(id), Some(device_type)) = (
                self.get(&namespace, keys::ID),
                self.get(&namespace, keys::TYPE),
            ) else {
                warn!("Monitored device {} is missing its ID or type, skipping", name);
                continue;
            };
            workers.push(WorkerRecord {
                name,
                id: DeviceId::new(id),
                device_type,
            });
        }
        workers
    }

    pub fn add_worker(&self, record: &WorkerRecord) -> Result<()> {
        let namespace = format!("{}{}", keys::MONITORED_DEVICE_PREFIX, record.name);
        self.set(&namespace, keys::ID, record.id.as_str())?;
        self.set(&namespace, keys::TYPE, &record.device_type)?;
        self.set(keys::MONITORED_NAMES, &record.name, keys::ENABLED)
    }

    pub fn type_version(&self, device_type: &str) -> Option<String> {
        self.get(keys::TYPE_VERSION, device_type)
    }

    pub fn type_versions(&self) -> BTreeMap<String, String> {
        self.entries(keys::TYPE_VERSION)
    }

    pub fn set_type_version(&self, device_type: &str, version: &str) -> Result<()> {
        self.set(keys::TYPE_VERSION, device_type, version)
    }

    pub fn update_server(&self) -> Option<DeviceId> {
        self.get(keys::GENERAL, keys::UPDATE_SERVER_ID)
            .map(DeviceId::new)
    }

    pub fn set_update_server(&self, id: &DeviceId) -> Result<()> {
        self.set(keys::GENERAL, keys::UPDATE_SERVER_ID, id.as_str())
    }

    /// Consecutive aborted updates
    pub fn abort_count(&self) -> u32 {
        self.get(keys::GENERAL, keys::UPDATE_ABORTED)
            .and_then(|raw| raw.trim().parse().ok())
            .unwrap_or(0)
    }

    pub fn aborted_until(&self) -> Option<DateTime<Utc>> {
        let raw = self.get(keys::GENERAL, keys::UPDATE_ABORTED_UNTIL)?;
        DateTime::parse_from_rfc3339(&raw)
            .map(|at| at.with_timezone(&Utc))
            .map_err(|e| warn!("Ignoring malformed {}: {}", keys::UPDATE_ABORTED_UNTIL, e))
            .ok()
    }

    pub fn record_abort(&self, count: u32, until: DateTime<Utc>) -> Result<()> {
        self.set(keys::GENERAL, keys::UPDATE_ABORTED, &count.to_string())?;
        self.set(keys::GENERAL, keys::UPDATE_ABORTED_UNTIL, &until.to_rfc3339())
    }

    pub fn clear_abort(&self) -> Result<()> {
        self.remove(keys::GENERAL, keys::UPDATE_ABORTED)?;
        self.remove(keys::GENERAL, keys::UPDATE_ABORTED_UNTIL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use tempfile::TempDir;

    #[test]
    fn test_values_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let store = PropertyStore::open_in(dir.path()).unwrap();
        store.set_type_version("A", "1.0.0").unwrap();
        store.set_update_server(&DeviceId::from("repo")).unwrap();

        let reopened = PropertyStore::open_in(dir.path()).unwrap();
        assert_eq!(reopened.type_version("A").as_deref(), Some("1.0.0"));
        assert_eq!(reopened.update_server(), Some(DeviceId::from("repo")));
        assert!(!dir.path().join("monitoring.tmp").exists());
    }

    #[test]
    fn test_workers_skip_incomplete_records() {
        let dir = TempDir::new().unwrap();
        let store = PropertyStore::open_in(dir.path()).unwrap();
        store
            .add_worker(&WorkerRecord {
                name: "w1".to_owned(),
                id: DeviceId::from("worker-1"),
                device_type: "A".to_owned(),
            })
            .unwrap();
        store.set(keys::MONITORED_NAMES, "broken", keys::ENABLED).unwrap();
        store.set(keys::MONITORED_NAMES, "off", "disabled").unwrap();
        store.set("monitoredDevice-off", keys::ID, "worker-off").unwrap();
        store.set("monitoredDevice-off", keys::TYPE, "A").unwrap();

        let workers = store.workers();
        assert_eq!(workers.len(), 1);
        assert_eq!(workers[0].id.as_str(), "worker-1");
        assert_eq!(workers[0].device_type, "A");
    }

    #[test]
    fn test_abort_counter_roundtrip_and_clear() {
        let dir = TempDir::new().unwrap();
        let store = PropertyStore::open_in(dir.path()).unwrap();
        assert_eq!(store.abort_count(), 0);
        assert!(store.aborted_until().is_none());

        let until = Utc::now() + Duration::seconds(60);
        store.record_abort(2, until).unwrap();
        assert_eq!(store.abort_count(), 2);
        assert_eq!(store.aborted_until().unwrap().timestamp(), until.timestamp());

        store.clear_abort().unwrap();
        assert_eq!(store.abort_count(), 0);
        assert!(store.get(keys::GENERAL, keys::UPDATE_ABORTED).is_none());
    }

    #[test]
    fn test_writes_keep_keys_of_other_handles() {
        let dir = TempDir::new().unwrap();
        let supervisor = PropertyStore::open_in(dir.path()).unwrap();
        let worker = PropertyStore::open_in(dir.path()).unwrap();

        supervisor.set_type_version("A", "1.1.0").unwrap();
        worker.record_abort(1, Utc::now()).unwrap();

        let reopened = PropertyStore::open_in(dir.path()).unwrap();
        assert_eq!(reopened.type_version("A").as_deref(), Some("1.1.0"));
        assert_eq!(reopened.abort_count(), 1);
    }

    #[test]
    fn test_malformed_file_is_config_error() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(STORE_FILE), "not json").unwrap();
        assert!(matches!(
            PropertyStore::open_in(dir.path()),
            Err(FleetError::Config(_))
        ));
    }
}

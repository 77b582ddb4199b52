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

//! Node settings

use crate::error::{FleetError, Result};
use crate::fabric::DeviceId;
use crate::wait::Wait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

pub const SETTINGS_FILE: &str = "fleet_settings.json";

fn default_supervisor_port() -> u16 {
    13370
}

fn default_worker_port() -> u16 {
    13371
}

fn default_supervisor_type() -> String {
    "fluxion-fleet".to_owned()
}

fn default_10() -> u64 {
    10
}

fn default_5() -> u64 {
    5
}

fn default_15() -> u64 {
    15
}

fn default_30() -> u64 {
    30
}

fn default_3600() -> u64 {
    3600
}

fn default_3() -> u32 {
    3
}

fn default_3_secs() -> u64 {
    3
}

fn default_probe_interval_ms() -> u64 {
    1000
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FleetSettings {
    /// Handshake port the supervisor listens on
    #[serde(default = "default_supervisor_port")]
    pub supervisor_port: u16,

    /// Handshake port workers listen on
    #[serde(default = "default_worker_port")]
    pub worker_port: u16,

    /// Device type of the supervisor itself
    #[serde(default = "default_supervisor_type")]
    pub supervisor_type: String,

    /// Bound on each update handshake step (seconds)
    #[serde(default = "default_10")]
    pub device_wait_secs: u64,

    /// Bound on each step of a supervisor restart check (seconds)
    #[serde(default = "default_5")]
    pub startup_check_wait_secs: u64,

    /// Bound on the artifact server reply (seconds)
    #[serde(default = "default_15")]
    pub artifact_wait_secs: u64,

    /// Grace window after a (re)start before a worker may be restarted again
    #[serde(default = "default_10")]
    pub recently_started_secs: u64,

    /// Backoff after the first aborted update, doubled per consecutive abort
    #[serde(default = "default_30")]
    pub update_aborted_delay_secs: u64,

    #[serde(default = "default_3600")]
    pub max_update_aborted_delay_secs: u64,

    /// Consecutive aborts after which updates are refused
    #[serde(default = "default_3")]
    pub max_update_retries: u32,

    /// How long a gently killed worker may take to exit
    #[serde(default = "default_3_secs")]
    pub gentle_kill_grace_secs: u64,

    #[serde(default)]
    pub fabric: FabricSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FabricSettings {
    /// Device id -> loopback address of its fabric endpoint
    #[serde(default)]
    pub peers: BTreeMap<String, SocketAddr>,

    #[serde(default = "default_probe_interval_ms")]
    pub probe_interval_ms: u64,
}

impl Default for FabricSettings {
    fn default() -> Self {
        Self {
            peers: BTreeMap::new(),
            probe_interval_ms: default_probe_interval_ms(),
        }
    }
}

impl FabricSettings {
    pub fn peer_map(&self) -> HashMap<DeviceId, SocketAddr> {
        self.peers
            .iter()
            .map(|(id, addr)| (DeviceId::new(id.clone()), *addr))
            .collect()
    }

    pub fn probe_interval(&self) -> Duration {
        Duration::from_millis(self.probe_interval_ms)
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            supervisor_port: default_supervisor_port(),
            worker_port: default_worker_port(),
            supervisor_type: default_supervisor_type(),
            device_wait_secs: 10,
            startup_check_wait_secs: 5,
            artifact_wait_secs: 15,
            recently_started_secs: 10,
            update_aborted_delay_secs: 30,
            max_update_aborted_delay_secs: 3600,
            max_update_retries: 3,
            gentle_kill_grace_secs: 3,
            fabric: FabricSettings::default(),
        }
    }
}

impl FleetSettings {
    pub fn device_wait(&self) -> Wait {
        Wait::secs(self.device_wait_secs)
    }

    pub fn startup_check_wait(&self) -> Wait {
        Wait::secs(self.startup_check_wait_secs)
    }

    pub fn artifact_wait(&self) -> Wait {
        Wait::secs(self.artifact_wait_secs)
    }

    pub fn recently_started(&self) -> Duration {
        Duration::from_secs(self.recently_started_secs)
    }

    pub fn gentle_kill_grace(&self) -> Duration {
        Duration::from_secs(self.gentle_kill_grace_secs)
    }

    /// Backoff after `aborts` consecutive aborted updates
    pub fn abort_backoff(&self, aborts: u32) -> Duration {
        let exponent = aborts.saturating_sub(1).min(20);
        let secs = self
            .update_aborted_delay_secs
            .saturating_mul(1u64 << exponent)
            .min(self.max_update_aborted_delay_secs);
        Duration::from_secs(secs)
    }
}

/// Load `<root>/fleet_settings.json`, creating it with defaults when absent
pub fn load_settings(root: &Path) -> Result<FleetSettings> {
    let path = root.join(SETTINGS_FILE);
    if path.exists() {
        let content = std::fs::read_to_string(&path)?;
        serde_json::from_str(&content)
            .map_err(|e| FleetError::Config(format!("Failed to parse settings: {e}")))
    } else {
        // Create with defaults
        let settings = FleetSettings::default();
        save_settings(root, &settings)?;
        Ok(settings)
    }
}

pub fn save_settings(root: &Path, settings: &FleetSettings) -> Result<()> {
    std::fs::create_dir_all(root)?;
    let path = root.join(SETTINGS_FILE);
    let temp_path = path.with_extension("tmp");
    let content = serde_json::to_string_pretty(settings)?;

    // Atomic write
    std::fs::write(&temp_path, content)?;
    std::fs::rename(&temp_path, &path)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_settings() {
        let settings = FleetSettings::default();
        assert_eq!(settings.supervisor_port, 13370);
        assert_eq!(settings.worker_port, 13371);
        assert_eq!(settings.device_wait(), Wait::secs(10));
        assert_eq!(settings.artifact_wait(), Wait::secs(15));
        assert_eq!(settings.max_update_retries, 3);
        assert!(settings.fabric.peers.is_empty());
    }

    #[test]
    fn test_partial_settings_use_defaults() {
        let settings: FleetSettings =
            serde_json::from_str(r#"{"worker_port": 20001, "fabric": {"peers": {"repo": "127.0.0.1:9000"}}}"#)
                .unwrap();
        assert_eq!(settings.worker_port, 20001);
        assert_eq!(settings.supervisor_port, 13370);
        assert_eq!(settings.fabric.probe_interval_ms, 1000);
        assert_eq!(
            settings.fabric.peer_map().get(&DeviceId::from("repo")),
            Some(&"127.0.0.1:9000".parse().unwrap())
        );
    }

    #[test]
    fn test_load_creates_defaults() {
        let dir = TempDir::new().unwrap();
        let settings = load_settings(dir.path()).unwrap();
        assert_eq!(settings, FleetSettings::default());
        assert!(dir.path().join(SETTINGS_FILE).exists());
        assert!(!dir.path().join("fleet_settings.tmp").exists());
    }

    #[test]
    fn test_abort_backoff_doubles_and_caps() {
        let settings = FleetSettings::default();
        assert_eq!(settings.abort_backoff(1), Duration::from_secs(30));
        assert_eq!(settings.abort_backoff(2), Duration::from_secs(60));
        assert_eq!(settings.abort_backoff(3), Duration::from_secs(120));
        assert_eq!(settings.abort_backoff(40), Duration::from_secs(3600));
    }
}

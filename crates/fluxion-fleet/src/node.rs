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

//! Wiring of one fleet process
//!
//! A process is the supervisor unless the store lists its device id among the
//! monitored workers.

use crate::config::FleetSettings;
use crate::error::Result;
use crate::fabric::{DeviceId, Fabric};
use crate::handshake::HandshakeChannel;
use crate::inbox::CommandInbox;
use crate::orchestrator::{FleetContext, Role, UpdateOrchestrator};
use crate::process::Launcher;
use crate::state::{StateCell, UpdateState};
use crate::store::PropertyStore;
use crate::supervisor::ProcessSupervisor;
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

/// Ends the hosting process
pub trait Host: Send + Sync {
    fn shutdown(&self);
}

/// Exits the OS process
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessHost;

impl Host for ProcessHost {
    fn shutdown(&self) {
        info!("Exiting");
        std::process::exit(0);
    }
}

#[derive(Debug, Clone)]
pub struct NodeOptions {
    pub root: PathBuf,
    pub device_id: DeviceId,
    pub continue_stage_three: bool,
}

#[derive(Debug)]
pub struct FleetNode {
    orchestrator: UpdateOrchestrator,
}

impl FleetNode {
    pub fn boot(
        options: NodeOptions,
        settings: FleetSettings,
        fabric: Arc<dyn Fabric>,
        launcher: Arc<dyn Launcher>,
        host: Arc<dyn Host>,
    ) -> Result<Self> {
        let store = Arc::new(PropertyStore::open_in(&options.root)?);
        let workers = store.workers();
        let role = if workers.iter().any(|w| w.id == options.device_id) {
            Role::Worker
        } else {
            Role::Supervisor
        };
        info!("Booting {} as {:?} in {}", options.device_id, role, options.root.display());

        let handshake = Arc::new(match role {
            Role::Supervisor => HandshakeChannel::open(settings.supervisor_port, settings.worker_port),
            Role::Worker => HandshakeChannel::open(settings.worker_port, settings.supervisor_port),
        });

        let supervisor = match role {
            Role::Worker => None,
            Role::Supervisor => {
                let supervisor = ProcessSupervisor::new(
                    options.root.clone(),
                    settings.clone(),
                    Arc::clone(&fabric),
                    Arc::clone(&launcher),
                    Arc::clone(&handshake),
                );
                let versions = store.type_versions();
                for (device_type, version) in &versions {
                    supervisor.set_version(device_type, version);
                }
                for record in &workers {
                    if !versions.contains_key(&record.device_type) {
                        warn!("No version recorded for {} ({})", record.id, record.device_type);
                    }
                    supervisor.add_worker(record);
                }
                Some(supervisor)
            }
        };

        let orchestrator = UpdateOrchestrator::new(FleetContext {
            role,
            local_id: options.device_id,
            root: options.root,
            settings,
            store,
            fabric: Arc::clone(&fabric),
            launcher,
            handshake,
            inbox: CommandInbox::default(),
            state: StateCell::new(UpdateState::Startup),
            host,
            supervisor,
            last_update_server: Mutex::new(None),
        });

        fabric.serve(Arc::new(orchestrator.clone()))?;
        orchestrator.boot(options.continue_stage_three)?;
        Ok(Self { orchestrator })
    }

    pub fn orchestrator(&self) -> &UpdateOrchestrator {
        &self.orchestrator
    }

    pub fn role(&self) -> Role {
        self.orchestrator.role()
    }

    pub fn state(&self) -> UpdateState {
        self.orchestrator.state()
    }

    pub fn supervisor(&self) -> Option<&ProcessSupervisor> {
        self.orchestrator.supervisor()
    }

    pub fn store(&self) -> &PropertyStore {
        self.orchestrator.store()
    }

    /// Leave the fabric and stop every background loop of this node
    pub fn stop(&self) {
        self.orchestrator.stop_device();
    }
}

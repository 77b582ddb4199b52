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

//! In-process fabric for embedding several devices in one process

use super::{DeviceId, Fabric, InboundHandler, Link, LivenessListener};
use crate::command::Command;
use crate::error::{FleetError, Result};
use crate::wait::Wait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const CONNECT_POLL: Duration = Duration::from_millis(20);

#[derive(Default)]
struct Registry {
    handlers: HashMap<DeviceId, Arc<dyn InboundHandler>>,
    watchers: Vec<(DeviceId, Arc<dyn LivenessListener>)>,
}

/// Shared hub all [`MemoryEndpoint`]s attach to
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    registry: Arc<Mutex<Registry>>,
}

impl std::fmt::Debug for MemoryNetwork {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("MemoryNetwork")
            .field("reachable", &registry.handlers.keys().collect::<Vec<_>>())
            .field("watchers", &registry.watchers.len())
            .finish()
    }
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn endpoint(&self, id: impl Into<DeviceId>) -> MemoryEndpoint {
        MemoryEndpoint {
            network: self.clone(),
            id: id.into(),
        }
    }

    pub fn is_reachable(&self, device: &DeviceId) -> bool {
        self.registry.lock().handlers.contains_key(device)
    }

    fn attach(&self, device: &DeviceId, handler: Arc<dyn InboundHandler>) {
        let listeners = {
            let mut registry = self.registry.lock();
            registry.handlers.insert(device.clone(), handler);
            watchers_of(&registry, device)
        };
        debug!("{} joined the fabric", device);
        for listener in listeners {
            listener.available(device);
        }
    }

    /// Make a device unreachable, as if its process died
    pub fn detach(&self, device: &DeviceId) {
        let listeners = {
            let mut registry = self.registry.lock();
            if registry.handlers.remove(device).is_none() {
                return;
            }
            watchers_of(&registry, device)
        };
        debug!("{} left the fabric", device);
        for listener in listeners {
            listener.unavailable(device);
        }
    }

    fn deliver(&self, from: &DeviceId, to: &DeviceId, command: Command) -> Result<()> {
        let handler = self
            .registry
            .lock()
            .handlers
            .get(to)
            .cloned()
            .ok_or_else(|| FleetError::Fabric(format!("{to} is not reachable")))?;

        let from = from.clone();
        thread::Builder::new()
            .name(format!("deliver-{to}"))
            .spawn(move || handler.invoked(&from, command))
            .map(|_| ())
            .map_err(|e| FleetError::Fabric(format!("cannot deliver to {to}: {e}")))
    }
}

fn watchers_of(registry: &Registry, device: &DeviceId) -> Vec<Arc<dyn LivenessListener>> {
    registry
        .watchers
        .iter()
        .filter(|(watched, _)| watched == device)
        .map(|(_, listener)| Arc::clone(listener))
        .collect()
}

/// One device's view of a [`MemoryNetwork`]
#[derive(Debug, Clone)]
pub struct MemoryEndpoint {
    network: MemoryNetwork,
    id: DeviceId,
}

struct MemoryLink {
    network: MemoryNetwork,
    from: DeviceId,
    to: DeviceId,
}

impl Link for MemoryLink {
    fn peer(&self) -> &DeviceId {
        &self.to
    }

    fn send(&self, command: Command) -> Result<()> {
        debug!("{} -> {}: '{}'", self.from, self.to, command.kind);
        self.network.deliver(&self.from, &self.to, command)
    }
}

impl Fabric for MemoryEndpoint {
    fn local_id(&self) -> &DeviceId {
        &self.id
    }

    fn is_reachable(&self, device: &DeviceId) -> bool {
        self.network.is_reachable(device)
    }

    fn connect(&self, device: &DeviceId, wait: Wait) -> Option<Arc<dyn Link>> {
        let deadline = wait.deadline();
        while !self.network.is_reachable(device) {
            if deadline.passed() {
                warn!("{} could not reach {} within {}", self.id, device, wait);
                return None;
            }
            thread::sleep(deadline.slice(CONNECT_POLL));
        }
        Some(Arc::new(MemoryLink {
            network: self.network.clone(),
            from: self.id.clone(),
            to: device.clone(),
        }))
    }

    fn watch(&self, device: &DeviceId, listener: Arc<dyn LivenessListener>) {
        self.network
            .registry
            .lock()
            .watchers
            .push((device.clone(), listener));
    }

    fn serve(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        self.network.attach(&self.id, handler);
        Ok(())
    }

    fn leave(&self) {
        self.network.detach(&self.id);
    }
}

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

//! Messaging fabric seen from one device
//!
//! The fleet only needs a handful of things from the fabric: ask whether a
//! peer is reachable, open a link to it, be told when its liveness changes and
//! receive inbound commands.

mod memory;
mod tcp;

pub use memory::{MemoryEndpoint, MemoryNetwork};
pub use tcp::{Envelope, TcpFabric};

use crate::command::Command;
use crate::error::Result;
use crate::wait::Wait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DeviceId(String);

impl DeviceId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DeviceId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

/// Writable connection to one peer
pub trait Link: Send + Sync {
    fn peer(&self) -> &DeviceId;

    fn send(&self, command: Command) -> Result<()>;
}

pub trait LivenessListener: Send + Sync {
    fn available(&self, device: &DeviceId);

    fn unavailable(&self, device: &DeviceId);
}

/// Receives every command addressed to the local device
pub trait InboundHandler: Send + Sync {
    fn invoked(&self, from: &DeviceId, command: Command);
}

pub trait Fabric: Send + Sync {
    fn local_id(&self) -> &DeviceId;

    fn is_reachable(&self, device: &DeviceId) -> bool;

    /// Wait until `device` is reachable and return a link to it
    fn connect(&self, device: &DeviceId, wait: Wait) -> Option<Arc<dyn Link>>;

    fn watch(&self, device: &DeviceId, listener: Arc<dyn LivenessListener>);

    /// Join the fabric and start delivering inbound commands to `handler`
    fn serve(&self, handler: Arc<dyn InboundHandler>) -> Result<()>;

    /// Leave the fabric; peers observe this device as unreachable
    fn leave(&self);
}

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

//! FluxION Fleet - Supervision and staged self-update of a device fleet
//!
//! One supervisor process keeps a set of worker processes alive and rolls out
//! new versions of them, and finally of itself, in three handshaked stages.

pub mod command;
pub mod config;
pub mod error;
pub mod fabric;
pub mod handshake;
pub mod inbox;
pub mod launch;
pub mod node;
pub mod orchestrator;
pub mod process;
pub mod state;
pub mod store;
pub mod supervisor;
pub mod telemetry;
pub mod version;
pub mod wait;

pub use config::{FleetSettings, load_settings};
pub use error::{FleetError, Result};
pub use fabric::DeviceId;
pub use node::{FleetNode, Host, NodeOptions, ProcessHost};
pub use orchestrator::{PendingUpdate, Role, UpdateOrchestrator};
pub use state::UpdateState;
pub use version::{UpdateClassification, UpdateKind, VersionTriple, classify};
pub use wait::Wait;

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

//! Inbound command routing by update state

use super::{Role, UpdateOrchestrator, stage_one, stage_two};
use crate::command::{Command, CommandKind, join_list, param};
use crate::error::{FleetError, Result};
use crate::fabric::DeviceId;
use crate::state::UpdateState;
use crate::wait::Wait;
use tracing::{debug, info, warn};

const REPLY_WAIT: Wait = Wait::secs(2);

impl UpdateOrchestrator {
    pub fn dispatch(&self, from: &DeviceId, command: Command) {
        let state = self.ctx.state.get();
        debug!("'{}' from {} in state {:?}", command.kind, from, state);

        match command.kind {
            CommandKind::Kill => {
                warn!("Kill requested by {}", from);
                self.ctx.shutdown();
                return;
            }
            CommandKind::AbortUpdate => {
                self.ctx.inbox.post(command);
                return;
            }
            _ => {}
        }

        match state {
            UpdateState::None => match self.ctx.role {
                Role::Supervisor => self.dispatch_idle_supervisor(from, command),
                Role::Worker => self.dispatch_idle_worker(command),
            },
            UpdateState::WaitingForArtifact => self.route_to_inbox(command, CommandKind::UpdateData),
            UpdateState::Startup | UpdateState::StageThree => {
                self.route_to_inbox(command, CommandKind::IHearYou);
            }
            UpdateState::KillingCurrent
            | UpdateState::FallbackCheckFabric
            | UpdateState::StageTwo
            | UpdateState::DoNotDisturb => {
                debug!("Ignoring '{}' while in {:?}", command.kind, state);
            }
        }
    }

    fn route_to_inbox(&self, command: Command, accepted: CommandKind) {
        if command.kind == accepted {
            self.ctx.inbox.post(command);
        } else {
            debug!("Ignoring '{}' during update", command.kind);
        }
    }

    fn dispatch_idle_worker(&self, command: Command) {
        if command.kind != CommandKind::InitiateStageTwo {
            debug!("Worker ignoring '{}'", command.kind);
            return;
        }
        if !self.ctx.state.compare_and_set(UpdateState::None, UpdateState::StageTwo) {
            warn!("Another stage started first, ignoring stage two request");
            return;
        }

        info!("Coordinating stage two on request");
        self.ctx.handshake.listener.reopen();
        let orchestrator = self.clone();
        if let Err(e) = super::spawn_stage("update stage two", move || {
            stage_two::run(&orchestrator.ctx);
        }) {
            warn!("Failed to start stage two: {}", e);
            self.ctx.handshake.listener.close();
            self.ctx.state.set(UpdateState::None);
        }
    }

    fn dispatch_idle_supervisor(&self, from: &DeviceId, command: Command) {
        if command.kind.is_management() {
            if let Err(e) = self.manage(from, &command) {
                warn!("Management command '{}' failed: {}", command.kind, e);
            }
            return;
        }

        if command.kind != CommandKind::UpdateDeviceType {
            debug!("Ignoring '{}' while idle", command.kind);
            return;
        }

        let device_types = command.list(param::DEVICE_TYPE);
        let versions = command.list(param::VERSION);
        if device_types.len() != versions.len() || device_types.is_empty() {
            warn!(
                "Malformed update request: {} device types, {} versions",
                device_types.len(),
                versions.len()
            );
            return;
        }

        if !self
            .ctx
            .state
            .compare_and_set(UpdateState::None, UpdateState::WaitingForArtifact)
        {
            warn!("Update already running, ignoring request from {}", from);
            return;
        }

        let orchestrator = self.clone();
        let requester = from.clone();
        if let Err(e) = super::spawn_stage("update stage one", move || {
            stage_one::run(&orchestrator.ctx, &requester, &device_types, &versions);
        }) {
            warn!("Failed to start stage one: {}", e);
            self.ctx.state.set(UpdateState::None);
        }
    }

    fn manage(&self, from: &DeviceId, command: &Command) -> Result<()> {
        let supervisor = self.ctx.monitor()?;
        let index = || -> Result<usize> {
            command
                .text(param::MONITORED_DEVICE_INDEX)
                .and_then(|raw| raw.trim().parse().ok())
                .ok_or_else(|| FleetError::Config("missing or malformed device index".to_owned()))
        };

        match command.kind {
            CommandKind::DisableMonitor => supervisor.disable(),
            CommandKind::EnableMonitor => supervisor.enable(),
            CommandKind::ListMonitored => {
                let reply = Command::new(CommandKind::MonitoredList)
                    .with_text(param::MONITORED_DEVICES, &join_list(&supervisor.list()));
                let link = self
                    .ctx
                    .fabric
                    .connect(from, REPLY_WAIT)
                    .ok_or_else(|| FleetError::Fabric(format!("{from} is not reachable")))?;
                link.send(reply)?;
            }
            CommandKind::KillByIndex => supervisor.kill_by_index(index()?)?,
            CommandKind::StartByIndex => supervisor.start_by_index(index()?)?,
            CommandKind::RestartByIndex => supervisor.restart_by_index(index()?)?,
            CommandKind::ResetAbortCounter => {
                self.ctx.store.clear_abort()?;
                info!("Update abort counter reset");
            }
            CommandKind::StopAllMonitored => supervisor.stop_all(),
            CommandKind::UpdateDeviceType
            | CommandKind::UpdateData
            | CommandKind::IHearYou
            | CommandKind::AbortUpdate
            | CommandKind::Kill
            | CommandKind::InitiateStageTwo
            | CommandKind::RequestArtifact
            | CommandKind::DoYouHearMe
            | CommandKind::LatestVersion
            | CommandKind::MonitoredList => {}
        }
        Ok(())
    }
}

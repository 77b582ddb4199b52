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

//! Boot sequences of the two roles

use super::{FleetContext, UpdateOrchestrator, stage_three, stage_two};
use crate::command::{Command, CommandKind, join_list, param};
use crate::error::{FleetError, Result};
use crate::fabric::{DeviceId, LivenessListener};
use crate::handshake::token;
use crate::state::UpdateState;
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread;
use tracing::{debug, error, info, warn};

/// Answer the supervisor's startup checks until released
pub(crate) fn run_worker(orchestrator: &UpdateOrchestrator) {
    let ctx = &orchestrator.ctx;
    ctx.state.set(UpdateState::Startup);
    let wait = ctx.settings.device_wait();
    info!("Worker {} waiting for its startup check", ctx.local_id);

    while let Some(line) = ctx.handshake.listener.get_message() {
        match line.as_str() {
            token::SOCKET_CHECK => {
                if let Err(e) = ctx.send_token(token::SOCKET_CONFIRM, wait) {
                    warn!("Socket check answer failed: {}", e);
                }
            }
            token::SERVER_CHECK => match confirm_update_server(ctx) {
                Ok(server) => info!("Update server {} reachable", server),
                Err(e) => warn!("Update server check failed: {}", e),
            },
            token::FINISH_STARTUP_CHECK => {
                if !ctx.state.compare_and_set(UpdateState::Startup, UpdateState::None) {
                    warn!("Startup check finished in state {:?}", ctx.state.get());
                }
                ctx.handshake.listener.close();
                if let Err(e) = ctx.send_token(token::FINISH_STARTUP_CHECK_ACK, wait) {
                    warn!("Startup check acknowledgement failed: {}", e);
                }
                info!("Worker {} is up", ctx.local_id);
                return;
            }
            token::STAGE_TWO => {
                info!("Worker {} coordinates stage two", ctx.local_id);
                stage_two::run(ctx);
                return;
            }
            other => debug!("Ignoring handshake line '{}' during startup", other),
        }
    }
    debug!("Handshake listener stopped during startup");
}

fn confirm_update_server(ctx: &FleetContext) -> Result<DeviceId> {
    let wait = ctx.settings.device_wait();
    let server = DeviceId::new(ctx.next_line("update server id", wait)?);
    ctx.ping_update_server(&server, wait)?;
    *ctx.last_update_server.lock() = Some(server.clone());
    ctx.send_token(token::SERVER_CONFIRM, wait)?;
    Ok(server)
}

/// Finish a pending handoff, then start supervising and asking for updates
pub(crate) fn run_supervisor(orchestrator: &UpdateOrchestrator, continue_stage_three: bool) {
    let ctx = &orchestrator.ctx;
    if continue_stage_three && !stage_three::run(ctx) {
        return;
    }
    ctx.state.set(UpdateState::None);

    let started = ctx.monitor().and_then(|supervisor| supervisor.start());
    if let Err(e) = started {
        error!("Failed to start process supervision: {}", e);
    }

    let queries = Arc::new_cyclic(|me| VersionQueries {
        me: me.clone(),
        ctx: Arc::downgrade(ctx),
        delayed: AtomicBool::new(false),
    });

    match ctx.update_server() {
        Some(server) => {
            ctx.fabric.watch(&server, Arc::clone(&queries) as Arc<dyn LivenessListener>);
            if ctx.fabric.is_reachable(&server) {
                queries.request(&server);
            } else {
                info!("Update server {} not reachable yet", server);
            }
        }
        None => info!("No update server known, waiting to be contacted"),
    }
}

/// Sends `latest version?` whenever the update server shows up
struct VersionQueries {
    me: Weak<VersionQueries>,
    ctx: Weak<FleetContext>,
    delayed: AtomicBool,
}

impl VersionQueries {
    fn request(self: &Arc<Self>, server: &DeviceId) {
        let Some(ctx) = self.ctx.upgrade() else {
            return;
        };
        if ctx.state.get() != UpdateState::None {
            debug!("Update in progress, not asking for versions");
            return;
        }

        let until = ctx.store.aborted_until().filter(|until| *until > Utc::now());
        let Some(until) = until else {
            if let Err(e) = send_latest_version_query(&ctx, server) {
                warn!("Latest version query failed: {}", e);
            }
            return;
        };

        if self.delayed.swap(true, Ordering::SeqCst) {
            debug!("Latest version query already scheduled");
            return;
        }
        let delay = (until - Utc::now()).to_std().unwrap_or_default();
        info!("Updates paused, asking for versions at {}", until);

        let queries = Arc::clone(self);
        let server = server.clone();
        let spawned = thread::Builder::new()
            .name("delayed-version-query".to_owned())
            .spawn(move || {
                thread::sleep(delay);
                queries.delayed.store(false, Ordering::SeqCst);
                queries.request(&server);
            });
        if let Err(e) = spawned {
            self.delayed.store(false, Ordering::SeqCst);
            warn!("Failed to schedule the latest version query: {}", e);
        }
    }
}

impl LivenessListener for VersionQueries {
    fn available(&self, device: &DeviceId) {
        debug!("Update server {} available", device);
        if let Some(queries) = self.me.upgrade() {
            queries.request(device);
        }
    }

    fn unavailable(&self, device: &DeviceId) {
        debug!("Update server {} unavailable", device);
    }
}

fn send_latest_version_query(ctx: &FleetContext, server: &DeviceId) -> Result<()> {
    let supervisor = ctx.monitor()?;
    let mut device_types = vec![ctx.settings.supervisor_type.clone()];
    device_types.extend(supervisor.worker_types());

    let link = ctx
        .fabric
        .connect(server, ctx.settings.device_wait())
        .ok_or_else(|| FleetError::Fabric(format!("update server {server} is not reachable")))?;
    let query = Command::new(CommandKind::LatestVersion)
        .with_text(param::DEVICE_TYPE, &join_list(&device_types));
    link.send(query)?;
    info!("Asked {} for the latest versions of {}", server, device_types.join(", "));
    Ok(())
}

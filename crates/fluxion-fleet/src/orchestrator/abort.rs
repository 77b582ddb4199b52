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

//! Abort paths of the update stages

use super::FleetContext;
use super::stage_one::StageOneProgress;
use crate::handshake::token;
use crate::launch::{LaunchCommand, StartupScript};
use crate::process::{Running, force_kill};
use crate::state::UpdateState;
use crate::telemetry::{FleetEvent, report_event};
use crate::wait::Wait;
use chrono::Utc;
use tracing::{error, info, warn};

const ABORT_NOTICE_WAIT: Wait = Wait::millis(300);

/// Bump the consecutive abort counter and push the backoff window out
pub(crate) fn record_abort(ctx: &FleetContext, stage: &'static str, reason: &str) -> u32 {
    let count = ctx.store.abort_count().saturating_add(1);
    let backoff = ctx.settings.abort_backoff(count);
    let now = Utc::now();
    let until = chrono::Duration::from_std(backoff)
        .ok()
        .and_then(|backoff| now.checked_add_signed(backoff))
        .unwrap_or_else(|| now + chrono::Duration::days(365));

    if let Err(e) = ctx.store.record_abort(count, until) {
        error!("Failed to persist the abort counter: {}", e);
    }
    report_event(&FleetEvent::UpdateAborted {
        stage,
        reason: reason.to_owned(),
        consecutive_aborts: count,
    });
    info!("Updates paused until {} after {} consecutive abort(s)", until, count);
    count
}

/// Tell whoever is mid-handshake with us that we are giving up
fn notify_peer(ctx: &FleetContext) {
    if !ctx.handshake.sender.send(token::ABORT, ABORT_NOTICE_WAIT) {
        info!("No handshake peer to notify about the abort");
    }
}

pub(crate) fn abort_stage_one(ctx: &FleetContext, progress: &mut StageOneProgress, reason: &str) {
    error!("Stage one aborted: {}", reason);
    notify_peer(ctx);

    let Some(supervisor) = ctx.supervisor.as_ref() else {
        ctx.state.set(UpdateState::None);
        return;
    };

    if progress.major {
        for worker in progress.touched.drain(..) {
            supervisor.kill_worker(&worker, false);
        }
        for (device_type, previous) in progress.committed.drain(..).rev() {
            warn!("Reverting {} to {}", device_type, previous);
            if let Err(e) = ctx.store.set_type_version(&device_type, &previous) {
                error!("Failed to revert {} in the store: {}", device_type, e);
            }
            supervisor.set_version(&device_type, &previous);
        }
        // every worker is checked on enable, the killed ones come back on their old version
    } else if let Some(held) = progress.held.take() {
        if let Err(e) = super::stage_one::release_worker(ctx) {
            warn!("Releasing {} failed, killing it: {}", held.id, e);
            supervisor.kill_worker(&held, false);
        }
    }
    progress.held = None;

    ctx.handshake.listener.reopen();
    ctx.handshake.listener.clear();
    ctx.inbox.drain();
    record_abort(ctx, "stage one", reason);
    supervisor.enable();
    ctx.state.set(UpdateState::None);
}

/// State of stage two relevant to its abort path
#[derive(Default)]
pub(crate) struct StageTwoProgress {
    pub old_command: Option<LaunchCommand>,
    pub old_killed: bool,
    pub new_supervisor: Option<Box<dyn Running>>,
}

pub(crate) fn abort_stage_two(ctx: &FleetContext, progress: &mut StageTwoProgress, reason: &str) {
    error!("Stage two aborted: {}", reason);
    notify_peer(ctx);

    if let Some(mut process) = progress.new_supervisor.take() {
        warn!("Killing half-started supervisor {}", process.id());
        force_kill(&mut *process);
    }

    if !progress.old_killed {
        // the old supervisor is still in charge
        ctx.handshake.listener.close();
        ctx.inbox.drain();
        ctx.state.set(UpdateState::None);
        return;
    }

    record_abort(ctx, "stage two", reason);

    // the restarted supervisor must find this worker gone and the ports free
    ctx.stop_device();
    relaunch_previous(ctx, progress.old_command.take());
    ctx.host.shutdown();
}

fn relaunch_previous(ctx: &FleetContext, command: Option<LaunchCommand>) {
    match command {
        Some(command) => match ctx.launcher.launch(&command) {
            Ok(_) => info!("Restarted previous supervisor: {}", command),
            Err(e) => error!("Failed to restart previous supervisor {}: {}", command, e),
        },
        None => error!("No previous supervisor command to fall back to"),
    }
}

/// State of stage three relevant to its abort path
#[derive(Debug, Default)]
pub(crate) struct StageThreeProgress {
    pub old_command: Option<LaunchCommand>,
    pub backed_up: bool,
    /// Cleared once the stage two coordinator has let go of us
    pub coordinator_attached: bool,
}

pub(crate) fn abort_stage_three(ctx: &FleetContext, progress: &mut StageThreeProgress, reason: &str) {
    error!("Stage three aborted: {}", reason);

    if progress.backed_up {
        let script = StartupScript::in_root(&ctx.root);
        if let Err(e) = script.restore_backup() {
            error!("Failed to restore the startup script: {}", e);
        }
    }

    // the previous supervisor needs our device id and handshake port
    ctx.stop_device();

    if progress.coordinator_attached {
        // the coordinator records the abort and restarts the previous supervisor
        notify_peer(ctx);
    } else {
        record_abort(ctx, "stage three", reason);
        relaunch_previous(ctx, progress.old_command.take());
    }
    ctx.host.shutdown();
}

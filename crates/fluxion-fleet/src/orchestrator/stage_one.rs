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

//! Stage one: fetch artifacts and swap the workers
//!
//! Runs on the supervisor. Per-device problems while preparing only skip that
//! device. Once execution starts, failures abort the whole stage when the
//! batch is a major update, otherwise they skip the affected device type.

use super::abort::abort_stage_one;
use super::{FleetContext, PendingUpdate, guarded};
use crate::command::{Command, CommandKind, param};
use crate::error::{FleetError, Result};
use crate::fabric::DeviceId;
use crate::handshake::token;
use crate::inbox::InboxReply;
use crate::launch::{LaunchCommand, save_executable};
use crate::state::UpdateState;
use crate::supervisor::WorkerHandle;
use crate::telemetry::{FleetEvent, report_event};
use crate::version::classify;
use chrono::Utc;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Version assumed for the supervisor before one was ever recorded
const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

#[derive(Debug, Default)]
pub(crate) struct StageOnePlan {
    pub workers: Vec<PendingUpdate>,
    /// Set only when the batch also replaces the supervisor
    pub supervisor: Option<PendingUpdate>,
    pub major: bool,
}

impl StageOnePlan {
    fn is_empty(&self) -> bool {
        self.workers.is_empty() && self.supervisor.is_none()
    }
}

/// What stage one has changed so far, for the abort path
#[derive(Debug, Default)]
pub(crate) struct StageOneProgress {
    pub major: bool,
    /// Workers now running a version spawned by this stage
    pub touched: Vec<Arc<WorkerHandle>>,
    /// (device type, previous version) of every committed type
    pub committed: Vec<(String, String)>,
    /// Last worker touched; its handshake listener is still open
    pub held: Option<Arc<WorkerHandle>>,
}

pub(crate) fn run(ctx: &FleetContext, requester: &DeviceId, device_types: &[String], versions: &[String]) {
    info!("Update requested by {}: {:?} -> {:?}", requester, device_types, versions);
    report_event(&FleetEvent::UpdateStarted {
        device_types: device_types.to_vec(),
        versions: versions.to_vec(),
    });

    let mut progress = StageOneProgress::default();
    let result = guarded("stage one", || {
        let server = update_server(ctx, requester)?;

        if let Some(reason) = refusal(ctx) {
            info!("Refusing update: {}", reason);
            ctx.state.set(UpdateState::None);
            return Ok(());
        }

        let plan = prepare(ctx, &server, device_types, versions)?;
        if plan.is_empty() {
            info!("Nothing to update in this batch");
            ctx.state.set(UpdateState::None);
            return Ok(());
        }

        execute(ctx, &server, plan, &mut progress)
    });

    if let Err(e) = result {
        abort_stage_one(ctx, &mut progress, &e.to_string());
    }
}

/// The configured update server, or the requester when none is stored yet
fn update_server(ctx: &FleetContext, requester: &DeviceId) -> Result<DeviceId> {
    if let Some(server) = ctx.store.update_server() {
        return Ok(server);
    }
    ctx.store.set_update_server(requester)?;
    Ok(requester.clone())
}

fn refusal(ctx: &FleetContext) -> Option<String> {
    let aborts = ctx.store.abort_count();
    if aborts >= ctx.settings.max_update_retries {
        return Some(format!(
            "{aborts} consecutive aborted updates, reset the counter to retry"
        ));
    }
    match ctx.store.aborted_until() {
        Some(until) if until > Utc::now() => Some(format!("backing off until {until}")),
        _ => None,
    }
}

pub(crate) fn prepare(
    ctx: &FleetContext,
    server: &DeviceId,
    device_types: &[String],
    versions: &[String],
) -> Result<StageOnePlan> {
    let supervisor = ctx.monitor()?;
    let known = supervisor.worker_types();
    let own_type = &ctx.settings.supervisor_type;
    let mut plan = StageOnePlan::default();

    for (device_type, version) in device_types.iter().zip(versions) {
        let is_supervisor = device_type == own_type;
        if !is_supervisor && !known.contains(device_type) {
            warn!("Device type {} is not monitored, skipping", device_type);
            continue;
        }

        let current = if is_supervisor {
            ctx.store
                .type_version(device_type)
                .unwrap_or_else(|| BUILD_VERSION.to_owned())
        } else if let Some(current) = supervisor.version_of(device_type) {
            current
        } else {
            warn!("No version recorded for {}, skipping", device_type);
            continue;
        };

        let classification = classify(&current, version);
        if classification.is_identical()
            || classification.is_downgrade()
            || classification.is_incompatible()
        {
            info!(
                "Skipping {} {} -> {}: {}",
                device_type, current, version, classification
            );
            continue;
        }

        let Some(executable) = fetch_artifact(ctx, server, device_type, version)? else {
            continue;
        };

        let update = PendingUpdate {
            device_type: device_type.clone(),
            version: version.clone(),
            executable,
            classification,
        };
        info!("Prepared {} {} -> {} ({})", device_type, current, version, classification);
        if is_supervisor {
            plan.supervisor = Some(update);
        } else {
            plan.workers.push(update);
        }
    }

    apply_major_gate(ctx, &mut plan, &known)?;
    Ok(plan)
}

/// Request an artifact and store it; `None` skips the device type
fn fetch_artifact(
    ctx: &FleetContext,
    server: &DeviceId,
    device_type: &str,
    version: &str,
) -> Result<Option<std::path::PathBuf>> {
    let wait = ctx.settings.artifact_wait();
    let Some(link) = ctx.fabric.connect(server, wait) else {
        warn!("Update server {} is not reachable, skipping {}", server, device_type);
        return Ok(None);
    };

    let request = Command::new(CommandKind::RequestArtifact)
        .with_text(param::DEVICE_TYPE, device_type)
        .with_text(param::VERSION, version);
    if let Err(e) = link.send(request) {
        warn!("Artifact request for {} failed: {}", device_type, e);
        return Ok(None);
    }

    let reply = match ctx.inbox.wait_for(CommandKind::UpdateData, wait) {
        InboxReply::Matched(reply) => reply,
        InboxReply::Aborted => return Err(FleetError::Aborted("artifact".to_owned())),
        InboxReply::TimedOut => {
            warn!("No artifact for {} {} within {}", device_type, version, wait);
            return Ok(None);
        }
    };

    let echoed_type = reply.text(param::DEVICE_TYPE);
    let echoed_version = reply.text(param::VERSION);
    if echoed_type.as_deref() != Some(device_type) || echoed_version.as_deref() != Some(version) {
        warn!(
            "Artifact reply for {:?} {:?} does not match {} {}, skipping",
            echoed_type, echoed_version, device_type, version
        );
        return Ok(None);
    }

    let Some(content) = reply.bytes(param::CONTENT) else {
        warn!("Artifact reply for {} carries no content", device_type);
        return Ok(None);
    };
    let checksum = reply.text(param::CHECKSUM);

    match save_executable(&ctx.root, device_type, version, content, checksum.as_deref()) {
        Ok(path) => Ok(Some(path)),
        Err(e) => {
            warn!("Cannot store artifact {} {}: {}", device_type, version, e);
            Ok(None)
        }
    }
}

/// Let a major update through only when every worker type can move together
///
/// The supervisor's own major update rides along when it targets the same
/// major version as the workers.
fn apply_major_gate(ctx: &FleetContext, plan: &mut StageOnePlan, known: &BTreeSet<String>) -> Result<()> {
    let candidates: Vec<PendingUpdate> = plan
        .workers
        .iter()
        .chain(plan.supervisor.iter())
        .filter(|u| u.is_major())
        .cloned()
        .collect();
    if candidates.is_empty() {
        return Ok(());
    }

    let supervisor = ctx.monitor()?;
    for update in candidates {
        supervisor.record_pending_major(update);
    }

    let own_type = &ctx.settings.supervisor_type;
    let own_pending = supervisor.pending_major(own_type);
    let target = if known.is_empty() {
        own_pending.as_ref().and_then(PendingUpdate::target_major)
    } else {
        supervisor.major_target(known)
    };

    let Some(target) = target else {
        info!("Not every device type is ready for the major update, deferring it");
        plan.workers.retain(|u| !u.is_major());
        plan.supervisor = plan.supervisor.take().filter(|u| !u.is_major());
        return Ok(());
    };

    // a minor update of a type would leave it behind on the old major
    for device_type in known {
        if let Some(update) = supervisor.pending_major(device_type) {
            debug!("Rolling out pending major update of {}", device_type);
            plan.workers.retain(|u| u.device_type != *device_type);
            plan.workers.push(update);
        }
    }

    match own_pending.filter(|u| u.target_major() == Some(target)) {
        Some(update) => plan.supervisor = Some(update),
        None => plan.supervisor = plan.supervisor.take().filter(|u| !u.is_major()),
    }

    plan.major = true;
    info!("Every device type is ready, rolling out major version {}", target);
    Ok(())
}

fn execute(
    ctx: &FleetContext,
    server: &DeviceId,
    plan: StageOnePlan,
    progress: &mut StageOneProgress,
) -> Result<()> {
    let supervisor = ctx.monitor()?;
    progress.major = plan.major;
    ctx.state.set(UpdateState::FallbackCheckFabric);
    supervisor.disable();

    let total: usize = plan
        .workers
        .iter()
        .map(|u| supervisor.workers_of_type(&u.device_type).len())
        .sum();
    let mut swapped = 0;

    for update in &plan.workers {
        let previous = supervisor.version_of(&update.device_type).unwrap_or_default();
        let mut swapped_of_type = Vec::new();
        let mut failure = None;

        for worker in supervisor.workers_of_type(&update.device_type) {
            swapped += 1;
            let last = swapped == total;
            match swap_worker(ctx, server, &worker, &update.version, last) {
                Ok(()) => {
                    progress.touched.push(Arc::clone(&worker));
                    swapped_of_type.push(Arc::clone(&worker));
                    if last {
                        progress.held = Some(worker);
                    }
                }
                Err(e) => {
                    supervisor.kill_worker(&worker, false);
                    if plan.major {
                        return Err(e);
                    }
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            warn!(
                "Skipping {} {}: {}; its workers return to {}",
                update.device_type, update.version, e, previous
            );
            for worker in swapped_of_type {
                supervisor.kill_worker(&worker, false);
                progress.touched.retain(|w| !Arc::ptr_eq(w, &worker));
                if progress.held.as_ref().is_some_and(|h| Arc::ptr_eq(h, &worker)) {
                    progress.held = None;
                }
            }
            continue;
        }

        ctx.store.set_type_version(&update.device_type, &update.version)?;
        supervisor.set_version(&update.device_type, &update.version);
        supervisor.clear_pending_major(&update.device_type);
        progress
            .committed
            .push((update.device_type.clone(), previous.clone()));
        info!("{} updated {} -> {}", update.device_type, previous, update.version);
        report_event(&FleetEvent::DeviceTypeUpdated {
            device_type: update.device_type.clone(),
            from_version: previous,
            to_version: update.version.clone(),
        });
    }

    match plan.supervisor {
        None => finish_without_supervisor(ctx, progress),
        Some(update) => hand_off(ctx, update, progress),
    }
}

/// Gentle-kill, spawn the new version and run the startup handshake
fn swap_worker(
    ctx: &FleetContext,
    server: &DeviceId,
    worker: &WorkerHandle,
    version: &str,
    last: bool,
) -> Result<()> {
    let supervisor = ctx.monitor()?;
    let wait = ctx.settings.device_wait();
    info!("Swapping {} to {}", worker.id, version);

    supervisor.kill_worker(worker, true);
    ctx.handshake.listener.clear();
    supervisor.spawn(worker, version)?;

    ctx.send_token(token::SOCKET_CHECK, wait)?;
    ctx.expect_token(token::SOCKET_CONFIRM, wait)?;
    ctx.send_token(token::SERVER_CHECK, wait)?;
    ctx.send_token(server.as_str(), wait)?;
    ctx.expect_token(token::SERVER_CONFIRM, wait)?;

    if !last {
        release_worker(ctx)?;
    }
    Ok(())
}

/// Let the worker holding the handshake port finish its startup check
pub(crate) fn release_worker(ctx: &FleetContext) -> Result<()> {
    let wait = ctx.settings.device_wait();
    ctx.send_token(token::FINISH_STARTUP_CHECK, wait)?;
    ctx.expect_token(token::FINISH_STARTUP_CHECK_ACK, wait)
}

fn finish_without_supervisor(ctx: &FleetContext, progress: &mut StageOneProgress) -> Result<()> {
    let supervisor = ctx.monitor()?;

    if let Some(held) = progress.held.take() {
        if let Err(e) = release_worker(ctx) {
            warn!("Releasing {} failed: {}", held.id, e);
        }
    }

    if !progress.committed.is_empty() && ctx.store.abort_count() > 0 {
        ctx.store.clear_abort()?;
    }

    supervisor.enable();
    ctx.state.set(UpdateState::None);
    info!("Stage one finished, {} device type(s) updated", progress.committed.len());
    Ok(())
}

/// Give stage two to a worker and wait to be killed by it
fn hand_off(ctx: &FleetContext, update: PendingUpdate, progress: &mut StageOneProgress) -> Result<()> {
    let supervisor = ctx.monitor()?;
    let wait = ctx.settings.device_wait();
    let command = LaunchCommand::new(&update.executable, ctx.local_id.clone(), ctx.root.clone())
        .continuing_stage_three(true)
        .to_line()?;

    let coordinator = if let Some(held) = progress.held.take() {
        ctx.send_token(token::STAGE_TWO, wait)?;
        held
    } else {
        supervisor
            .initiate_stage_two()
            .ok_or_else(|| FleetError::Fabric("no worker accepted stage two".to_owned()))?
    };
    info!("{} coordinates stage two", coordinator.id);

    ctx.state.set(UpdateState::KillingCurrent);
    ctx.send_token(&update.version, wait)?;
    ctx.send_token(&command, wait)?;
    report_event(&FleetEvent::StageTwoHandedOff {
        coordinator: coordinator.id.to_string(),
        to_version: update.version.clone(),
    });

    ctx.expect_token(token::KILL, wait)?;

    // the successor takes over our device id and handshake port once acknowledged
    ctx.state.set(UpdateState::DoNotDisturb);
    ctx.stop_device();
    if !ctx.handshake.sender.send(token::KILL_ACK, wait) {
        error!("Could not acknowledge the kill, exiting anyway");
    }
    info!("Handing over to supervisor {}", update.version);
    ctx.host.shutdown();
    Ok(())
}

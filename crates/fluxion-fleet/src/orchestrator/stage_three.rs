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

//! Stage three: the new supervisor finishes the handoff
//!
//! The first beats wait forever: the stage two coordinator started this
//! process and is guaranteed to be on the other end.

use super::abort::{StageThreeProgress, abort_stage_three};
use super::{FleetContext, guarded};
use crate::error::{FleetError, Result};
use crate::fabric::DeviceId;
use crate::handshake::token;
use crate::launch::{LaunchCommand, StartupScript, executable_path};
use crate::state::UpdateState;
use crate::telemetry::{FleetEvent, report_event};
use crate::version::VersionTriple;
use crate::wait::Wait;
use tracing::{error, info};

/// `true` when this process may go on to run as the supervisor
pub(crate) fn run(ctx: &FleetContext) -> bool {
    ctx.state.set(UpdateState::StageThree);

    let version = match guarded("stage three preparation", || prepare(ctx)) {
        Ok(version) => version,
        Err(e) => {
            error!("Stage three preparation failed, exiting: {}", e);
            ctx.shutdown();
            return false;
        }
    };

    let mut progress = StageThreeProgress {
        coordinator_attached: true,
        ..StageThreeProgress::default()
    };
    match guarded("stage three", || finalize(ctx, &version, &mut progress)) {
        Ok(()) => true,
        Err(e) => {
            abort_stage_three(ctx, &mut progress, &e.to_string());
            false
        }
    }
}

/// Answer the coordinator's checks and receive the new version
fn prepare(ctx: &FleetContext) -> Result<String> {
    let listener = &ctx.handshake.listener;

    ctx.expect_token(token::SOCKET_CHECK, Wait::Forever)?;
    ctx.send_token(token::SOCKET_CONFIRM, Wait::Forever)?;

    ctx.expect_token(token::SERVER_CHECK, Wait::Forever)?;
    let server = listener
        .get_message()
        .map(DeviceId::new)
        .ok_or_else(|| FleetError::Unexpected("handshake listener stopped".to_owned()))?;
    ctx.ping_update_server(&server, ctx.settings.device_wait())?;
    *ctx.last_update_server.lock() = Some(server);
    ctx.send_token(token::SERVER_CONFIRM, Wait::Forever)?;

    let version = ctx.next_line("supervisor version", Wait::Forever)?;
    VersionTriple::parse(&version)?;
    Ok(version)
}

fn finalize(ctx: &FleetContext, version: &str, progress: &mut StageThreeProgress) -> Result<()> {
    let wait = ctx.settings.device_wait();
    let script = StartupScript::in_root(&ctx.root);
    if !script.exists() {
        return Err(FleetError::Config(format!(
            "startup script {} not found",
            script.path().display()
        )));
    }

    progress.old_command = Some(script.read_command()?);
    let executable = executable_path(&ctx.root, &ctx.settings.supervisor_type, version);
    let new_command = LaunchCommand::new(executable, ctx.local_id.clone(), ctx.root.clone());

    script.backup()?;
    progress.backed_up = true;

    ctx.send_token(token::FINISH_STAGE_TWO, wait)?;
    ctx.expect_token(token::FINISH_STAGE_TWO_ACK, wait)?;
    progress.coordinator_attached = false;

    script.write_command(&new_command)?;
    script.remove_backup();
    progress.backed_up = false;

    ctx.store.clear_abort()?;
    ctx.store
        .set_type_version(&ctx.settings.supervisor_type, version)?;
    info!("Supervisor {} installed: {}", version, new_command);
    report_event(&FleetEvent::SupervisorReplaced {
        to_version: version.to_owned(),
    });
    Ok(())
}

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

//! Stage two: a worker replaces the supervisor process

use super::abort::{StageTwoProgress, abort_stage_two};
use super::{FleetContext, guarded};
use crate::error::{FleetError, Result};
use crate::handshake::token;
use crate::launch::{LaunchCommand, StartupScript};
use crate::state::UpdateState;
use tracing::info;

pub(crate) fn run(ctx: &FleetContext) {
    ctx.state.set(UpdateState::StageTwo);
    let mut progress = StageTwoProgress::default();

    if let Err(e) = guarded("stage two", || replace_supervisor(ctx, &mut progress)) {
        abort_stage_two(ctx, &mut progress, &e.to_string());
    }
}

fn replace_supervisor(ctx: &FleetContext, progress: &mut StageTwoProgress) -> Result<()> {
    let wait = ctx.settings.device_wait();

    let script = StartupScript::in_root(&ctx.root);
    progress.old_command = Some(script.read_command()?);

    let version = ctx.next_line("supervisor version", wait)?;
    let new_command = LaunchCommand::parse(&ctx.next_line("supervisor launch command", wait)?)?;
    info!("Replacing supervisor with {} ({})", version, new_command);

    let server = ctx
        .update_server()
        .ok_or_else(|| FleetError::Config("no update server known".to_owned()))?;

    ctx.send_token(token::KILL, wait)?;
    ctx.expect_token(token::KILL_ACK, wait)?;
    progress.old_killed = true;
    info!("Previous supervisor acknowledged its kill");

    let process = ctx
        .launcher
        .launch(&new_command)
        .map_err(|e| FleetError::Process(format!("cannot start new supervisor: {e}")))?;
    progress.new_supervisor = Some(process);

    ctx.send_token(token::SOCKET_CHECK, wait)?;
    ctx.expect_token(token::SOCKET_CONFIRM, wait)?;
    ctx.send_token(token::SERVER_CHECK, wait)?;
    ctx.send_token(server.as_str(), wait)?;
    ctx.expect_token(token::SERVER_CONFIRM, wait)?;
    ctx.send_token(&version, wait)?;
    ctx.expect_token(token::FINISH_STAGE_TWO, wait)?;

    ctx.state.set(UpdateState::DoNotDisturb);
    ctx.handshake.listener.close();
    ctx.send_token(token::FINISH_STAGE_TWO_ACK, wait)?;

    // the new supervisor outlives this handle
    progress.new_supervisor = None;
    ctx.state.set(UpdateState::None);
    info!("Stage two finished, supervisor {} is running", version);
    Ok(())
}

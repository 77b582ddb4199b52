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

//! FluxION Fleet - Entry point of supervisor and worker processes
//!
//! Both roles run this binary; the persisted fleet configuration decides which
//! one a process plays.

use clap::Parser;
use fluxion_fleet::fabric::TcpFabric;
use fluxion_fleet::launch::STAGE_THREE_FLAG;
use fluxion_fleet::process::OsLauncher;
use fluxion_fleet::{DeviceId, FleetNode, NodeOptions, ProcessHost, load_settings};
use nix::sys::signal::{self, SaFlags, SigAction, SigHandler, SigSet, Signal};
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::info;

static SHUTDOWN: AtomicBool = AtomicBool::new(false);

#[derive(Debug, Parser)]
#[command(name = "fluxion-fleet", about = "Fleet supervisor and self-updater")]
struct Args {
    /// Device id of this process on the fabric
    #[arg(short = 'x', value_name = "DEVICE_ID")]
    device_id: String,

    /// Filesystem root holding settings, store, executables and the startup script
    #[arg(short = 'f', value_name = "ROOT")]
    root: PathBuf,

    /// Finish a supervisor handoff before running
    #[arg(long = "continue-update-stage-three")]
    continue_stage_three: bool,
}

/// The launch convention spells the stage three flag with a single dash
fn normalized_args() -> Vec<String> {
    std::env::args()
        .map(|arg| {
            if arg == STAGE_THREE_FLAG {
                format!("-{arg}")
            } else {
                arg
            }
        })
        .collect()
}

fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("fluxion_fleet=debug".parse().unwrap()),
        )
        .init();

    let args = Args::parse_from(normalized_args());
    info!("Starting FluxION Fleet {}", env!("CARGO_PKG_VERSION"));

    let settings = load_settings(&args.root)?;
    let device_id = DeviceId::new(args.device_id);
    let fabric = Arc::new(TcpFabric::new(
        device_id.clone(),
        settings.fabric.peer_map(),
        settings.fabric.probe_interval(),
    ));

    install_signal_handlers();

    let node = FleetNode::boot(
        NodeOptions {
            root: args.root,
            device_id,
            continue_stage_three: args.continue_stage_three,
        },
        settings,
        fabric,
        Arc::new(OsLauncher),
        Arc::new(ProcessHost),
    )?;
    info!("Running as {:?}", node.role());

    while !SHUTDOWN.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(500));
    }

    info!("Shutdown signal received");
    node.stop();
    info!("Shutting down");
    Ok(())
}

fn install_signal_handlers() {
    let action = SigAction::new(
        SigHandler::Handler(sigterm_handler),
        SaFlags::SA_RESTART,
        SigSet::empty(),
    );
    // SAFETY: the handler only stores into an atomic
    unsafe {
        let _ = signal::sigaction(Signal::SIGTERM, &action);
        let _ = signal::sigaction(Signal::SIGINT, &action);
    }
}

extern "C" fn sigterm_handler(_signal: nix::libc::c_int) {
    SHUTDOWN.store(true, Ordering::SeqCst);
}

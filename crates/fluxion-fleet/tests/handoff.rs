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

mod common;

use common::{Fleet, SUPERVISOR, eventually};
use fluxion_fleet::launch::{LaunchCommand, StartupScript, executable_path};
use fluxion_fleet::{DeviceId, UpdateState};
use std::time::Duration;

const SUPERVISOR_TYPE: &str = "fluxion-fleet";

fn boot_fleet() -> Fleet {
    let fleet = Fleet::boot(
        &[("worker-a", "w1", "A")],
        &[("A", "1.0.0"), (SUPERVISOR_TYPE, "1.0.0")],
    );
    let root = fleet.root.path();
    StartupScript::in_root(root)
        .write_command(&LaunchCommand::new(
            executable_path(root, SUPERVISOR_TYPE, "1.0.0"),
            DeviceId::new(SUPERVISOR),
            root,
        ))
        .unwrap();
    assert!(fleet.settled(&["w1"]), "worker never came up");
    fleet
}

#[test]
fn test_supervisor_update_hands_off_to_new_process() {
    let fleet = boot_fleet();
    fleet.server.publish(SUPERVISOR_TYPE, "1.1.0", b"new supervisor");

    fleet
        .server
        .request_update(SUPERVISOR, &[(SUPERVISOR_TYPE, "1.1.0")]);

    assert!(eventually(Duration::from_secs(30), || {
        fleet.launcher.node(SUPERVISOR).is_some_and(|node| {
            node.state() == UpdateState::None
                && node.store().type_version(SUPERVISOR_TYPE).as_deref() == Some("1.1.0")
        })
    }));
    assert_eq!(fleet.supervisor.state(), UpdateState::DoNotDisturb);

    let launched = fleet.launcher.launched();
    assert!(launched.contains(&"fluxion-fleet-1.1.0".to_owned()));

    let script = StartupScript::in_root(fleet.root.path());
    let installed = script.read_command().unwrap();
    assert_eq!(
        installed.executable,
        executable_path(fleet.root.path(), SUPERVISOR_TYPE, "1.1.0")
    );
    assert_eq!(installed.device_id, DeviceId::new(SUPERVISOR));
    assert!(!installed.continue_stage_three);
    assert!(!script.backup_path().exists());

    // the coordinating worker keeps running
    assert!(eventually(Duration::from_secs(5), || fleet.worker_idle("w1")));
}

#[test]
fn test_broken_supervisor_falls_back_to_previous() {
    let fleet = boot_fleet();
    fleet.server.publish(SUPERVISOR_TYPE, "1.1.0", b"broken supervisor");
    fleet.launcher.break_executable("fluxion-fleet-1.1.0");

    fleet
        .server
        .request_update(SUPERVISOR, &[(SUPERVISOR_TYPE, "1.1.0")]);

    // the coordinator restarts the previous supervisor, which revives the coordinator
    assert!(eventually(Duration::from_secs(30), || {
        let launched = fleet.launcher.launched();
        let previous = launched
            .iter()
            .filter(|name| name.as_str() == "fluxion-fleet-1.0.0")
            .count();
        let workers = launched.iter().filter(|name| name.as_str() == "A-1.0.0").count();
        previous == 1 && workers >= 2
    }));

    let restarted = fleet.launcher.node(SUPERVISOR).unwrap();
    assert!(eventually(Duration::from_secs(10), || {
        restarted.state() == UpdateState::None && fleet.worker_idle("w1")
    }));
    assert_eq!(
        restarted.store().type_version(SUPERVISOR_TYPE).as_deref(),
        Some("1.0.0")
    );
    assert_eq!(restarted.store().abort_count(), 1);
    assert!(restarted.store().aborted_until().is_some());

    let script = StartupScript::in_root(fleet.root.path()).read_command().unwrap();
    assert_eq!(
        script.executable,
        executable_path(fleet.root.path(), SUPERVISOR_TYPE, "1.0.0")
    );
}

#[test]
fn test_failed_script_backup_falls_back_once() {
    let fleet = boot_fleet();
    fleet.server.publish(SUPERVISOR_TYPE, "1.1.0", b"new supervisor");
    // a directory in the way makes the backup copy fail
    let script = StartupScript::in_root(fleet.root.path());
    std::fs::create_dir(script.backup_path()).unwrap();

    fleet
        .server
        .request_update(SUPERVISOR, &[(SUPERVISOR_TYPE, "1.1.0")]);

    let previous_launches = || {
        fleet
            .launcher
            .launched()
            .iter()
            .filter(|name| name.as_str() == "fluxion-fleet-1.0.0")
            .count()
    };
    assert!(eventually(Duration::from_secs(30), || {
        previous_launches() == 1
            && fleet.launcher.launched().contains(&"fluxion-fleet-1.1.0".to_owned())
    }));

    let restarted = fleet.launcher.node(SUPERVISOR).unwrap();
    assert!(eventually(Duration::from_secs(15), || {
        restarted.state() == UpdateState::None && fleet.worker_idle("w1")
    }));

    // only the coordinator brought the previous supervisor back
    std::thread::sleep(Duration::from_secs(2));
    assert_eq!(previous_launches(), 1);
    assert_eq!(restarted.store().abort_count(), 1);
    assert_eq!(
        restarted.store().type_version(SUPERVISOR_TYPE).as_deref(),
        Some("1.0.0")
    );
    assert_eq!(
        script.read_command().unwrap().executable,
        executable_path(fleet.root.path(), SUPERVISOR_TYPE, "1.0.0")
    );
}

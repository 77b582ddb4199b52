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

//! Spawning and terminating device processes

use crate::launch::LaunchCommand;
use std::io;
use std::process::{Child, Command};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

const EXIT_POLL: Duration = Duration::from_millis(100);

/// Handle to a spawned device process
pub trait Running: Send {
    fn id(&self) -> u32;

    /// `true` once the process has exited
    fn try_wait(&mut self) -> io::Result<bool>;

    /// Ask the process to exit (SIGTERM on unix)
    fn terminate(&mut self) -> io::Result<()>;

    fn kill(&mut self) -> io::Result<()>;

    fn wait(&mut self) -> io::Result<()>;
}

pub trait Launcher: Send + Sync {
    fn launch(&self, command: &LaunchCommand) -> io::Result<Box<dyn Running>>;
}

/// Starts real OS processes
#[derive(Debug, Default, Clone, Copy)]
pub struct OsLauncher;

impl Launcher for OsLauncher {
    fn launch(&self, command: &LaunchCommand) -> io::Result<Box<dyn Running>> {
        info!("Starting process: {}", command);
        let child = Command::new(&command.executable)
            .args(command.args())
            .spawn()?;
        info!("Process started with PID: {}", child.id());
        Ok(Box::new(OsProcess { child }))
    }
}

#[derive(Debug)]
struct OsProcess {
    child: Child,
}

impl Running for OsProcess {
    fn id(&self) -> u32 {
        self.child.id()
    }

    fn try_wait(&mut self) -> io::Result<bool> {
        Ok(self.child.try_wait()?.is_some())
    }

    fn terminate(&mut self) -> io::Result<()> {
        #[cfg(unix)]
        {
            use nix::sys::signal::{self, Signal};
            use nix::unistd::Pid;

            let pid = i32::try_from(self.child.id())
                .map_err(|_| io::Error::new(io::ErrorKind::InvalidInput, "pid out of range"))?;
            signal::kill(Pid::from_raw(pid), Signal::SIGTERM).map_err(io::Error::from)
        }

        #[cfg(not(unix))]
        {
            self.child.kill()
        }
    }

    fn kill(&mut self) -> io::Result<()> {
        self.child.kill()
    }

    fn wait(&mut self) -> io::Result<()> {
        self.child.wait().map(|_| ())
    }
}

/// Kill and reap; errors are logged, never returned
pub fn force_kill(process: &mut dyn Running) {
    let pid = process.id();
    if let Err(e) = process.kill() {
        debug!("Kill of PID {} failed: {}", pid, e);
    }
    if let Err(e) = process.wait() {
        warn!("Failed to reap PID {}: {}", pid, e);
    }
    debug!("Process {} killed", pid);
}

/// Wait up to `grace` for the process to exit on its own, then force it
pub fn reap_within(process: &mut dyn Running, grace: Duration) {
    let started = Instant::now();
    loop {
        match process.try_wait() {
            Ok(true) => {
                debug!("Process {} exited", process.id());
                return;
            }
            Ok(false) if started.elapsed() < grace => thread::sleep(EXIT_POLL),
            Ok(false) => {
                warn!("Process {} did not exit within {:?}, killing", process.id(), grace);
                break;
            }
            Err(e) => {
                warn!("Error checking status of {}: {}", process.id(), e);
                break;
            }
        }
    }
    force_kill(process);
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::fabric::DeviceId;
    use std::fs;
    use tempfile::TempDir;

    fn script(dir: &TempDir, body: &str) -> std::path::PathBuf {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.path().join("device.sh");
        fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    #[test]
    fn test_launch_passes_convention_arguments() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("args");
        let exe = script(&dir, &format!("echo \"$@\" > {}", out.display()));

        let cmd = LaunchCommand::new(&exe, DeviceId::from("w1"), dir.path());
        let mut process = OsLauncher.launch(&cmd).unwrap();
        process.wait().unwrap();

        let args = fs::read_to_string(out).unwrap();
        assert_eq!(args.trim(), format!("-x w1 -f {}", dir.path().display()));
    }

    #[test]
    fn test_terminate_stops_process() {
        let dir = TempDir::new().unwrap();
        let exe = script(&dir, "sleep 30");

        let cmd = LaunchCommand::new(&exe, DeviceId::from("w1"), dir.path());
        let mut process = OsLauncher.launch(&cmd).unwrap();
        assert!(!process.try_wait().unwrap());

        process.terminate().unwrap();
        reap_within(process.as_mut(), Duration::from_secs(5));
        assert!(process.try_wait().unwrap());
    }
}

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

//! Process launch convention, executable layout and the host startup script
//!
//! A device is always started as
//! `<executable> -x <deviceID> -f <filesystemRoot> [-continue-update-stage-three]`.
//! The same string travels over the handshake channel and ends up in the
//! startup script, so it is parsed back with plain whitespace splitting.
//! Paths and device ids containing whitespace are refused when the line is built.

use crate::error::{FleetError, Result};
use crate::fabric::DeviceId;
use sha2::{Digest, Sha256};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

pub const DEVICE_ID_FLAG: &str = "-x";
pub const ROOT_FLAG: &str = "-f";
pub const STAGE_THREE_FLAG: &str = "-continue-update-stage-three";

const DEVICES_DIR: &str = "devices";
const STARTUP_SCRIPT: &str = "startupscript";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchCommand {
    pub executable: PathBuf,
    pub device_id: DeviceId,
    pub root: PathBuf,
    pub continue_stage_three: bool,
}

impl LaunchCommand {
    pub fn new(executable: impl Into<PathBuf>, device_id: DeviceId, root: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            device_id,
            root: root.into(),
            continue_stage_three: false,
        }
    }

    #[must_use]
    pub fn continuing_stage_three(mut self, flag: bool) -> Self {
        self.continue_stage_three = flag;
        self
    }

    /// Arguments after the executable
    pub fn args(&self) -> Vec<String> {
        let mut args = vec![
            DEVICE_ID_FLAG.to_owned(),
            self.device_id.to_string(),
            ROOT_FLAG.to_owned(),
            self.root.display().to_string(),
        ];
        if self.continue_stage_three {
            args.push(STAGE_THREE_FLAG.to_owned());
        }
        args
    }

    /// The command as one line, refusing words that would not split back
    pub fn to_line(&self) -> Result<String> {
        let words = [
            self.executable.display().to_string(),
            self.device_id.to_string(),
            self.root.display().to_string(),
        ];
        if let Some(word) = words.iter().find(|w| w.is_empty() || w.contains(char::is_whitespace)) {
            return Err(FleetError::Config(format!(
                "launch command word '{word}' is empty or contains whitespace"
            )));
        }
        Ok(self.to_string())
    }

    pub fn parse(line: &str) -> Result<Self> {
        let mut words = line.split_whitespace();
        let executable = words
            .next()
            .ok_or_else(|| FleetError::Config("empty launch command".to_owned()))?;

        let mut device_id = None;
        let mut root = None;
        let mut continue_stage_three = false;

        while let Some(word) = words.next() {
            match word {
                DEVICE_ID_FLAG => device_id = words.next().map(DeviceId::from),
                ROOT_FLAG => root = words.next().map(PathBuf::from),
                STAGE_THREE_FLAG => continue_stage_three = true,
                other => debug!("Ignoring unknown launch argument '{}'", other),
            }
        }

        let device_id = device_id.ok_or_else(|| {
            FleetError::Config(format!("launch command without {DEVICE_ID_FLAG}: {line}"))
        })?;
        let root = root.ok_or_else(|| {
            FleetError::Config(format!("launch command without {ROOT_FLAG}: {line}"))
        })?;

        Ok(Self {
            executable: PathBuf::from(executable),
            device_id,
            root,
            continue_stage_three,
        })
    }
}

impl fmt::Display for LaunchCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.executable.display())?;
        for arg in self.args() {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

/// `<root>/devices/<type>/<type>-<version>`
pub fn executable_path(root: &Path, device_type: &str, version: &str) -> PathBuf {
    root.join(DEVICES_DIR)
        .join(device_type)
        .join(format!("{device_type}-{version}"))
}

pub fn sha256_hex(content: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(content);
    format!("{:x}", hasher.finalize())
}

/// Verify (when a checksum is given) and store an executable
pub fn save_executable(
    root: &Path,
    device_type: &str,
    version: &str,
    content: &[u8],
    checksum: Option<&str>,
) -> Result<PathBuf> {
    if let Some(expected) = checksum {
        let actual = sha256_hex(content);
        if !actual.eq_ignore_ascii_case(expected.trim()) {
            return Err(FleetError::ChecksumMismatch {
                expected: expected.trim().to_owned(),
                actual,
            });
        }
    }

    let path = executable_path(root, device_type, version);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }

    let mut temp_name = path.as_os_str().to_owned();
    temp_name.push(".part");
    let temp_path = PathBuf::from(temp_name);
    fs::write(&temp_path, content)?;

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let mut perms = fs::metadata(&temp_path)?.permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&temp_path, perms)?;
    }

    fs::rename(&temp_path, &path)?;
    info!("Saved {} {} to {}", device_type, version, path.display());
    Ok(path)
}

/// Single-line host script holding the supervisor's launch command
#[derive(Debug, Clone)]
pub struct StartupScript {
    path: PathBuf,
}

impl StartupScript {
    pub fn in_root(root: &Path) -> Self {
        Self::at(root.join(STARTUP_SCRIPT))
    }

    pub fn at(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn backup_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_owned();
        name.push(".bak");
        PathBuf::from(name)
    }

    pub fn exists(&self) -> bool {
        self.path.is_file()
    }

    pub fn read_command(&self) -> Result<LaunchCommand> {
        let content = fs::read_to_string(&self.path)?;
        let line = content
            .lines()
            .map(str::trim)
            .find(|l| !l.is_empty())
            .ok_or_else(|| {
                FleetError::Config(format!("startup script {} is empty", self.path.display()))
            })?;
        LaunchCommand::parse(line)
    }

    pub fn write_command(&self, command: &LaunchCommand) -> Result<()> {
        let temp_path = self.path.with_extension("tmp");
        let line = command.to_line()?;
        fs::write(&temp_path, format!("{line}\n"))?;
        fs::rename(&temp_path, &self.path)?;
        Ok(())
    }

    pub fn backup(&self) -> Result<PathBuf> {
        let backup = self.backup_path();
        fs::copy(&self.path, &backup)?;
        debug!("Backed up {} to {}", self.path.display(), backup.display());
        Ok(backup)
    }

    pub fn restore_backup(&self) -> Result<()> {
        fs::copy(self.backup_path(), &self.path)?;
        warn!("Restored startup script from backup");
        Ok(())
    }

    pub fn remove_backup(&self) {
        if let Err(e) = fs::remove_file(self.backup_path()) {
            warn!("Failed to remove startup script backup: {e}");
        }
    }
}

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

//! Commands exchanged over the messaging fabric
//!
//! Every command travels under a literal wire name. The names are shared with
//! deployed artifact servers and must not change.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;

/// Separator used to pack lists into a single parameter
pub const LIST_SEPARATOR: &str = ",,,";

pub mod param {
    pub const DEVICE_TYPE: &str = "device type";
    pub const VERSION: &str = "version";
    pub const CONTENT: &str = "content";
    pub const CHECKSUM: &str = "checksum";
    pub const MONITORED_DEVICES: &str = "monitored devices";
    pub const MONITORED_DEVICE_INDEX: &str = "monitored device index";
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    // inbound update flow
    UpdateDeviceType,
    UpdateData,
    IHearYou,
    AbortUpdate,
    Kill,
    InitiateStageTwo,

    // inbound management
    DisableMonitor,
    EnableMonitor,
    ListMonitored,
    KillByIndex,
    StartByIndex,
    RestartByIndex,
    ResetAbortCounter,
    StopAllMonitored,

    // outbound
    RequestArtifact,
    DoYouHearMe,
    LatestVersion,
    MonitoredList,
}

const NAMES: &[(CommandKind, &str)] = &[
    (CommandKind::UpdateDeviceType, "update single device type"),
    (CommandKind::UpdateData, "updateData"),
    (CommandKind::IHearYou, "I hear you!"),
    (CommandKind::AbortUpdate, "abort update!"),
    (CommandKind::Kill, "kill"),
    (CommandKind::InitiateStageTwo, "initiate updating stage two"),
    (CommandKind::DisableMonitor, "disable monitor"),
    (CommandKind::EnableMonitor, "enable monitor"),
    (CommandKind::ListMonitored, "list all monitored devices"),
    (CommandKind::KillByIndex, "kill device by index"),
    (CommandKind::StartByIndex, "start device by index"),
    (CommandKind::RestartByIndex, "restart device by index"),
    (CommandKind::ResetAbortCounter, "reset update aborted counter"),
    (CommandKind::StopAllMonitored, "stop all monitored devices"),
    (CommandKind::RequestArtifact, "gief the jar!"),
    (CommandKind::DoYouHearMe, "do you hear me?"),
    (CommandKind::LatestVersion, "latest version?"),
    (CommandKind::MonitoredList, "list of all monitored devices"),
];

impl CommandKind {
    pub fn name(self) -> &'static str {
        NAMES
            .iter()
            .find(|(kind, _)| *kind == self)
            .map_or("", |(_, name)| name)
    }

    pub fn from_name(name: &str) -> Option<Self> {
        NAMES
            .iter()
            .find(|(_, n)| *n == name)
            .map(|(kind, _)| *kind)
    }

    /// Operator commands accepted only while no update is running
    pub fn is_management(self) -> bool {
        matches!(
            self,
            Self::DisableMonitor
                | Self::EnableMonitor
                | Self::ListMonitored
                | Self::KillByIndex
                | Self::StartByIndex
                | Self::RestartByIndex
                | Self::ResetAbortCounter
                | Self::StopAllMonitored
        )
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl Serialize for CommandKind {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.name())
    }
}

impl<'de> Deserialize<'de> for CommandKind {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let name = String::deserialize(deserializer)?;
        Self::from_name(&name)
            .ok_or_else(|| serde::de::Error::custom(format!("unknown command: {name}")))
    }
}

/// A command with its named parameters
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    #[serde(default)]
    pub params: BTreeMap<String, Vec<u8>>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            params: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_text(mut self, key: &str, value: &str) -> Self {
        self.params.insert(key.to_owned(), value.as_bytes().to_vec());
        self
    }

    #[must_use]
    pub fn with_bytes(mut self, key: &str, value: Vec<u8>) -> Self {
        self.params.insert(key.to_owned(), value);
        self
    }

    pub fn text(&self, key: &str) -> Option<String> {
        self.params
            .get(key)
            .map(|raw| String::from_utf8_lossy(raw).into_owned())
    }

    pub fn bytes(&self, key: &str) -> Option<&[u8]> {
        self.params.get(key).map(Vec::as_slice)
    }

    /// A list parameter packed with [`LIST_SEPARATOR`]
    pub fn list(&self, key: &str) -> Vec<String> {
        self.text(key).map(|s| split_list(&s)).unwrap_or_default()
    }
}

// Parameter values can hold whole executables, keep them out of the logs.
impl fmt::Debug for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let sizes: BTreeMap<&str, usize> = self
            .params
            .iter()
            .map(|(k, v)| (k.as_str(), v.len()))
            .collect();
        f.debug_struct("Command")
            .field("kind", &self.kind)
            .field("param_sizes", &sizes)
            .finish()
    }
}

pub fn join_list<S: AsRef<str>>(items: &[S]) -> String {
    items
        .iter()
        .map(AsRef::as_ref)
        .collect::<Vec<_>>()
        .join(LIST_SEPARATOR)
}

pub fn split_list(packed: &str) -> Vec<String> {
    if packed.is_empty() {
        return Vec::new();
    }
    packed.split(LIST_SEPARATOR).map(str::to_owned).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_name_table_is_unique() {
        for (i, (kind_a, name_a)) in NAMES.iter().enumerate() {
            for (kind_b, name_b) in &NAMES[i + 1..] {
                assert_ne!(kind_a, kind_b);
                assert_ne!(name_a, name_b);
            }
        }
    }

    #[test]
    fn test_lookup_by_wire_name() {
        assert_eq!(
            CommandKind::from_name("update single device type"),
            Some(CommandKind::UpdateDeviceType)
        );
        assert_eq!(CommandKind::from_name("gief the jar!"), Some(CommandKind::RequestArtifact));
        assert_eq!(CommandKind::from_name("Kill"), None);
        assert_eq!(CommandKind::AbortUpdate.name(), "abort update!");
    }

    #[test]
    fn test_management_commands() {
        assert!(CommandKind::RestartByIndex.is_management());
        assert!(CommandKind::StopAllMonitored.is_management());
        assert!(!CommandKind::Kill.is_management());
        assert!(!CommandKind::UpdateDeviceType.is_management());
    }

    #[test]
    fn test_list_packing() {
        let packed = join_list(&["A", "B", "fluxion-fleet"]);
        assert_eq!(packed, "A,,,B,,,fluxion-fleet");
        assert_eq!(split_list(&packed), vec!["A", "B", "fluxion-fleet"]);
        assert!(split_list("").is_empty());
    }

    #[test]
    fn test_command_json_uses_wire_name() {
        let cmd = Command::new(CommandKind::LatestVersion).with_text(param::DEVICE_TYPE, "A,,,B");
        let json = serde_json::to_string(&cmd).unwrap();
        assert!(json.contains("\"latest version?\""));

        let back: Command = serde_json::from_str(&json).unwrap();
        assert_eq!(back.list(param::DEVICE_TYPE), vec!["A", "B"]);
    }

    #[test]
    fn test_debug_hides_content() {
        let cmd = Command::new(CommandKind::UpdateData).with_bytes(param::CONTENT, vec![7; 4096]);
        let debug = format!("{cmd:?}");
        assert!(debug.contains("4096"));
        assert!(!debug.contains("7, 7"));
    }
}

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

//! Staged self-update of the fleet
//!
//! Stage one runs on the supervisor and swaps workers. Stage two runs on one
//! worker and replaces the supervisor process. Stage three runs on the new
//! supervisor and persists its launch command. Each stage runs on its own
//! thread and owns its abort path.

mod abort;
mod dispatch;
mod stage_one;
mod stage_three;
mod stage_two;
mod startup;

use crate::command::{Command, CommandKind};
use crate::config::FleetSettings;
use crate::error::{FleetError, Result};
use crate::fabric::{DeviceId, Fabric, InboundHandler};
use crate::handshake::{HandshakeChannel, token};
use crate::inbox::{CommandInbox, InboxReply};
use crate::node::Host;
use crate::process::Launcher;
use crate::state::{StateCell, UpdateState};
use crate::store::PropertyStore;
use crate::supervisor::ProcessSupervisor;
use crate::version::{UpdateClassification, major_of};
use crate::wait::Wait;
use parking_lot::Mutex;
use std::any::Any;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use tracing::{debug, error, info};

/// A fetched artifact waiting to be rolled out
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingUpdate {
    pub device_type: String,
    pub version: String,
    pub executable: PathBuf,
    pub classification: UpdateClassification,
}

impl PendingUpdate {
    pub fn target_major(&self) -> Option<u32> {
        major_of(&self.version)
    }

    pub fn is_major(&self) -> bool {
        self.classification.is_protocol_breaking()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Supervisor,
    Worker,
}

/// Everything the dispatcher and the stage threads share
pub(crate) struct FleetContext {
    pub role: Role,
    pub local_id: DeviceId,
    pub root: PathBuf,
    pub settings: FleetSettings,
    pub store: Arc<PropertyStore>,
    pub fabric: Arc<dyn Fabric>,
    pub launcher: Arc<dyn Launcher>,
    pub handshake: Arc<HandshakeChannel>,
    pub inbox: CommandInbox,
    pub state: StateCell,
    pub host: Arc<dyn Host>,
    pub supervisor: Option<ProcessSupervisor>,
    /// Update server named in the last reachability check
    pub last_update_server: Mutex<Option<DeviceId>>,
}

impl FleetContext {
    pub fn monitor(&self) -> Result<&ProcessSupervisor> {
        self.supervisor
            .as_ref()
            .ok_or_else(|| FleetError::Unexpected("no process supervisor on a worker".to_owned()))
    }

    pub fn update_server(&self) -> Option<DeviceId> {
        self.last_update_server
            .lock()
            .clone()
            .or_else(|| self.store.update_server())
    }

    pub fn send_token(&self, line: &str, wait: Wait) -> Result<()> {
        if self.handshake.sender.send(line, wait) {
            Ok(())
        } else {
            Err(FleetError::timeout(
                format!("delivery of '{line}'"),
                wait.as_duration(),
            ))
        }
    }

    pub fn expect_token(&self, expected: &str, wait: Wait) -> Result<()> {
        use crate::handshake::Reply;
        match self.handshake.listener.await_reply(expected, wait) {
            Reply::Received => Ok(()),
            Reply::Aborted => Err(FleetError::Aborted(format!("'{expected}'"))),
            Reply::TimedOut => Err(FleetError::timeout(format!("'{expected}'"), wait.as_duration())),
        }
    }

    /// Next free-form line such as a version or a launch command
    pub fn next_line(&self, what: &str, wait: Wait) -> Result<String> {
        match self.handshake.listener.get_message_within(wait) {
            Some(line) if line == token::ABORT => Err(FleetError::Aborted(what.to_owned())),
            Some(line) => Ok(line),
            None => Err(FleetError::timeout(what, wait.as_duration())),
        }
    }

    /// Ask the update server for a sign of life over the fabric
    pub fn ping_update_server(&self, server: &DeviceId, wait: Wait) -> Result<()> {
        let link = self
            .fabric
            .connect(server, wait)
            .ok_or_else(|| FleetError::Fabric(format!("update server {server} is not reachable")))?;
        link.send(Command::new(CommandKind::DoYouHearMe))?;

        match self.inbox.wait_for(CommandKind::IHearYou, wait) {
            InboxReply::Matched(_) => Ok(()),
            InboxReply::Aborted => Err(FleetError::Aborted("'I hear you!'".to_owned())),
            InboxReply::TimedOut => Err(FleetError::timeout("'I hear you!'", wait.as_duration())),
        }
    }

    /// Leave the fabric and silence every background loop
    pub fn stop_device(&self) {
        info!("Stopping device {}", self.local_id);
        self.fabric.leave();
        if let Some(supervisor) = &self.supervisor {
            supervisor.halt();
        }
        self.handshake.listener.stop();
    }

    pub fn shutdown(&self) {
        self.stop_device();
        self.host.shutdown();
    }
}

/// Update state machine of one process
#[derive(Clone)]
pub struct UpdateOrchestrator {
    pub(crate) ctx: Arc<FleetContext>,
}

impl fmt::Debug for UpdateOrchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UpdateOrchestrator")
            .field("role", &self.ctx.role)
            .field("device", &self.ctx.local_id)
            .field("state", &self.ctx.state.get())
            .finish_non_exhaustive()
    }
}

impl UpdateOrchestrator {
    pub(crate) fn new(ctx: FleetContext) -> Self {
        Self { ctx: Arc::new(ctx) }
    }

    pub fn state(&self) -> UpdateState {
        self.ctx.state.get()
    }

    pub fn role(&self) -> Role {
        self.ctx.role
    }

    pub fn supervisor(&self) -> Option<&ProcessSupervisor> {
        self.ctx.supervisor.as_ref()
    }

    pub fn store(&self) -> &PropertyStore {
        &self.ctx.store
    }

    pub(crate) fn stop_device(&self) {
        self.ctx.stop_device();
    }

    /// Run the boot sequence of this process's role on its own thread
    pub(crate) fn boot(&self, continue_stage_three: bool) -> Result<()> {
        let orchestrator = self.clone();
        let name = match self.ctx.role {
            Role::Supervisor => "supervisor-startup",
            Role::Worker => "worker-startup",
        };
        thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || match orchestrator.ctx.role {
                Role::Supervisor => startup::run_supervisor(&orchestrator, continue_stage_three),
                Role::Worker => startup::run_worker(&orchestrator),
            })?;
        Ok(())
    }
}

impl InboundHandler for UpdateOrchestrator {
    fn invoked(&self, from: &DeviceId, command: Command) {
        self.dispatch(from, command);
    }
}

/// Run a stage body, turning a panic into an error
pub(crate) fn guarded<T>(stage: &str, body: impl FnOnce() -> Result<T>) -> Result<T> {
    match catch_unwind(AssertUnwindSafe(body)) {
        Ok(result) => result,
        Err(panic) => {
            let message = panic_message(panic.as_ref());
            error!("{} panicked: {}", stage, message);
            Err(FleetError::Unexpected(message))
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(s) = panic.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}

/// Spawn a stage thread
pub(crate) fn spawn_stage(name: &str, body: impl FnOnce() + Send + 'static) -> Result<()> {
    debug!("Starting {}", name);
    thread::Builder::new()
        .name(name.replace(' ', "-"))
        .spawn(body)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::version::classify;

    #[test]
    fn test_guarded_turns_panic_into_error() {
        let result: Result<()> = guarded("stage test", || panic!("boom"));
        match result {
            Err(FleetError::Unexpected(message)) => assert_eq!(message, "boom"),
            other => panic!("unexpected {other:?}"),
        }

        let ok = guarded("stage test", || Ok(7));
        assert_eq!(ok.unwrap(), 7);
    }

    #[test]
    fn test_pending_update_major() {
        let update = PendingUpdate {
            device_type: "A".to_owned(),
            version: "2.0.0".to_owned(),
            executable: PathBuf::from("/r/devices/A/A-2.0.0"),
            classification: classify("1.4.2", "2.0.0"),
        };
        assert!(update.is_major());
        assert_eq!(update.target_major(), Some(2));
    }
}

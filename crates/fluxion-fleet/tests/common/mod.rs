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

//! In-process fleet: every "process" is a node on one memory fabric

#![allow(dead_code)]

use fluxion_fleet::command::{Command, CommandKind, join_list, param};
use fluxion_fleet::fabric::{DeviceId, Fabric, InboundHandler, MemoryEndpoint, MemoryNetwork};
use fluxion_fleet::launch::{LaunchCommand, sha256_hex};
use fluxion_fleet::process::{Launcher, Running};
use fluxion_fleet::store::{PropertyStore, WorkerRecord};
use fluxion_fleet::{FleetNode, FleetSettings, Host, NodeOptions, UpdateState, Wait};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::io;
use std::net::{Ipv4Addr, TcpListener};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

pub const SUPERVISOR: &str = "supervisor";
pub const SERVER: &str = "update-server";

pub fn free_port() -> u16 {
    let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
    probe.local_addr().unwrap().port()
}

pub fn test_settings() -> FleetSettings {
    FleetSettings {
        supervisor_port: free_port(),
        worker_port: free_port(),
        device_wait_secs: 3,
        startup_check_wait_secs: 3,
        artifact_wait_secs: 1,
        recently_started_secs: 1,
        gentle_kill_grace_secs: 1,
        ..FleetSettings::default()
    }
}

pub fn eventually(timeout: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let started = Instant::now();
    while started.elapsed() < timeout {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(50));
    }
    condition()
}

#[derive(Default)]
struct TestHost {
    exited: Arc<AtomicBool>,
}

impl Host for TestHost {
    fn shutdown(&self) {
        self.exited.store(true, Ordering::SeqCst);
    }
}

/// A node standing in for an OS process; `node` is `None` for a dead binary
struct InProcess {
    pid: u32,
    node: Option<Arc<FleetNode>>,
    exited: Arc<AtomicBool>,
}

impl InProcess {
    fn stop(&mut self) {
        if let Some(node) = &self.node {
            node.stop();
        }
        self.exited.store(true, Ordering::SeqCst);
    }
}

impl Running for InProcess {
    fn id(&self) -> u32 {
        self.pid
    }

    fn try_wait(&mut self) -> io::Result<bool> {
        Ok(self.exited.load(Ordering::SeqCst))
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.stop();
        Ok(())
    }

    fn kill(&mut self) -> io::Result<()> {
        self.stop();
        Ok(())
    }

    fn wait(&mut self) -> io::Result<()> {
        self.stop();
        Ok(())
    }
}

struct LauncherInner {
    network: MemoryNetwork,
    settings: FleetSettings,
    broken: Mutex<HashSet<String>>,
    launches: Mutex<Vec<LaunchCommand>>,
    nodes: Mutex<HashMap<DeviceId, Arc<FleetNode>>>,
    next_pid: AtomicU32,
}

/// Boots in-process nodes instead of executables
#[derive(Clone)]
pub struct ScriptedLauncher {
    inner: Arc<LauncherInner>,
}

impl ScriptedLauncher {
    pub fn new(network: MemoryNetwork, settings: FleetSettings) -> Self {
        Self {
            inner: Arc::new(LauncherInner {
                network,
                settings,
                broken: Mutex::new(HashSet::new()),
                launches: Mutex::new(Vec::new()),
                nodes: Mutex::new(HashMap::new()),
                next_pid: AtomicU32::new(1000),
            }),
        }
    }

    /// Launching this executable file name yields a process that never answers
    pub fn break_executable(&self, file_name: &str) {
        self.inner.broken.lock().insert(file_name.to_owned());
    }

    /// File names of every executable launched so far
    pub fn launched(&self) -> Vec<String> {
        self.inner
            .launches
            .lock()
            .iter()
            .map(|c| executable_name(c))
            .collect()
    }

    pub fn node(&self, id: &str) -> Option<Arc<FleetNode>> {
        self.inner.nodes.lock().get(&DeviceId::new(id)).cloned()
    }

    pub fn stop_all(&self) {
        let nodes: Vec<_> = self.inner.nodes.lock().values().cloned().collect();
        for node in nodes {
            node.stop();
        }
    }
}

fn executable_name(command: &LaunchCommand) -> String {
    command
        .executable
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_default()
}

impl Launcher for ScriptedLauncher {
    fn launch(&self, command: &LaunchCommand) -> io::Result<Box<dyn Running>> {
        self.inner.launches.lock().push(command.clone());
        let pid = self.inner.next_pid.fetch_add(1, Ordering::SeqCst);
        let exited = Arc::new(AtomicBool::new(false));

        if self.inner.broken.lock().contains(&executable_name(command)) {
            return Ok(Box::new(InProcess {
                pid,
                node: None,
                exited,
            }));
        }

        let node = FleetNode::boot(
            NodeOptions {
                root: command.root.clone(),
                device_id: command.device_id.clone(),
                continue_stage_three: command.continue_stage_three,
            },
            self.inner.settings.clone(),
            Arc::new(self.inner.network.endpoint(command.device_id.clone())),
            Arc::new(self.clone()),
            Arc::new(TestHost {
                exited: Arc::clone(&exited),
            }),
        )
        .map_err(|e| io::Error::other(e.to_string()))?;

        let node = Arc::new(node);
        self.inner
            .nodes
            .lock()
            .insert(command.device_id.clone(), Arc::clone(&node));
        Ok(Box::new(InProcess {
            pid,
            node: Some(node),
            exited,
        }))
    }
}

/// Artifact repository double answering on the fabric
pub struct UpdateServer {
    endpoint: MemoryEndpoint,
    artifacts: Mutex<HashMap<(String, String), Vec<u8>>>,
    requests: Mutex<Vec<(String, String)>>,
    queries: Mutex<Vec<String>>,
    received: Mutex<Vec<Command>>,
}

impl UpdateServer {
    pub fn start(network: &MemoryNetwork) -> Arc<Self> {
        let server = Arc::new(Self {
            endpoint: network.endpoint(SERVER),
            artifacts: Mutex::new(HashMap::new()),
            requests: Mutex::new(Vec::new()),
            queries: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
        });
        server
            .endpoint
            .serve(Arc::clone(&server) as Arc<dyn InboundHandler>)
            .unwrap();
        server
    }

    pub fn publish(&self, device_type: &str, version: &str, content: &[u8]) {
        self.artifacts
            .lock()
            .insert((device_type.to_owned(), version.to_owned()), content.to_vec());
    }

    pub fn requests(&self) -> Vec<(String, String)> {
        self.requests.lock().clone()
    }

    pub fn queries(&self) -> Vec<String> {
        self.queries.lock().clone()
    }

    pub fn received(&self, kind: CommandKind) -> Vec<Command> {
        self.received
            .lock()
            .iter()
            .filter(|c| c.kind == kind)
            .cloned()
            .collect()
    }

    pub fn send(&self, to: &str, command: Command) {
        let link = self
            .endpoint
            .connect(&DeviceId::new(to), Wait::secs(2))
            .unwrap();
        link.send(command).unwrap();
    }

    pub fn request_update(&self, to: &str, updates: &[(&str, &str)]) {
        let device_types: Vec<&str> = updates.iter().map(|(t, _)| *t).collect();
        let versions: Vec<&str> = updates.iter().map(|(_, v)| *v).collect();
        self.send(
            to,
            Command::new(CommandKind::UpdateDeviceType)
                .with_text(param::DEVICE_TYPE, &join_list(&device_types))
                .with_text(param::VERSION, &join_list(&versions)),
        );
    }

    fn reply(&self, to: &DeviceId, command: Command) {
        if let Some(link) = self.endpoint.connect(to, Wait::secs(1)) {
            let _ = link.send(command);
        }
    }
}

impl InboundHandler for UpdateServer {
    fn invoked(&self, from: &DeviceId, command: Command) {
        match command.kind {
            CommandKind::DoYouHearMe => self.reply(from, Command::new(CommandKind::IHearYou)),
            CommandKind::RequestArtifact => {
                let device_type = command.text(param::DEVICE_TYPE).unwrap_or_default();
                let version = command.text(param::VERSION).unwrap_or_default();
                self.requests
                    .lock()
                    .push((device_type.clone(), version.clone()));

                let content = self
                    .artifacts
                    .lock()
                    .get(&(device_type.clone(), version.clone()))
                    .cloned();
                if let Some(content) = content {
                    let checksum = sha256_hex(&content);
                    self.reply(
                        from,
                        Command::new(CommandKind::UpdateData)
                            .with_text(param::DEVICE_TYPE, &device_type)
                            .with_text(param::VERSION, &version)
                            .with_text(param::CHECKSUM, &checksum)
                            .with_bytes(param::CONTENT, content),
                    );
                }
            }
            CommandKind::LatestVersion => {
                let types = command.text(param::DEVICE_TYPE).unwrap_or_default();
                self.queries.lock().push(types);
            }
            _ => self.received.lock().push(command),
        }
    }
}

/// Supervisor node with its workers, all in one process
pub struct Fleet {
    pub network: MemoryNetwork,
    pub settings: FleetSettings,
    pub launcher: ScriptedLauncher,
    pub server: Arc<UpdateServer>,
    pub supervisor: FleetNode,
    pub root: TempDir,
}

impl Fleet {
    /// `workers` are (name, id, type); `versions` are (type, version)
    pub fn boot(workers: &[(&str, &str, &str)], versions: &[(&str, &str)]) -> Self {
        let root = TempDir::new().unwrap();
        let store = PropertyStore::open_in(root.path()).unwrap();
        for (name, id, device_type) in workers {
            store
                .add_worker(&WorkerRecord {
                    name: (*name).to_owned(),
                    id: DeviceId::new(*id),
                    device_type: (*device_type).to_owned(),
                })
                .unwrap();
        }
        for (device_type, version) in versions {
            store.set_type_version(device_type, version).unwrap();
        }
        store.set_update_server(&DeviceId::new(SERVER)).unwrap();
        drop(store);

        let network = MemoryNetwork::new();
        let settings = test_settings();
        let server = UpdateServer::start(&network);
        let launcher = ScriptedLauncher::new(network.clone(), settings.clone());

        let supervisor = FleetNode::boot(
            NodeOptions {
                root: root.path().to_path_buf(),
                device_id: DeviceId::new(SUPERVISOR),
                continue_stage_three: false,
            },
            settings.clone(),
            Arc::new(network.endpoint(SUPERVISOR)),
            Arc::new(launcher.clone()),
            Arc::new(TestHost::default()),
        )
        .unwrap();

        Self {
            network,
            settings,
            launcher,
            server,
            supervisor,
            root,
        }
    }

    pub fn worker_idle(&self, id: &str) -> bool {
        self.network.is_reachable(&DeviceId::new(id))
            && self
                .launcher
                .node(id)
                .is_some_and(|node| node.state() == UpdateState::None)
    }

    /// Every worker answered its startup check and the supervisor is idle
    pub fn settled(&self, ids: &[&str]) -> bool {
        eventually(Duration::from_secs(20), || {
            self.supervisor.state() == UpdateState::None && ids.iter().all(|id| self.worker_idle(id))
        })
    }

    pub fn version_of(&self, device_type: &str) -> Option<String> {
        self.supervisor.store().type_version(device_type)
    }
}

impl Drop for Fleet {
    fn drop(&mut self) {
        self.supervisor.stop();
        self.launcher.stop_all();
    }
}

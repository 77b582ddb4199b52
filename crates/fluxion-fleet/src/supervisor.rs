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

//! Process supervisor for the monitored workers
//!
//! A single loop thread reacts to liveness events from the fabric and
//! restarts workers that became unreachable. Update stages bracket every
//! worker mutation with [`ProcessSupervisor::disable`] and
//! [`ProcessSupervisor::enable`]; `disable` only returns once no check is in
//! flight.

use crate::command::{Command, CommandKind};
use crate::config::FleetSettings;
use crate::error::{FleetError, Result};
use crate::fabric::{DeviceId, Fabric, Link, LivenessListener};
use crate::handshake::{HandshakeChannel, token};
use crate::launch::{LaunchCommand, executable_path};
use crate::orchestrator::PendingUpdate;
use crate::process::{Launcher, Running, force_kill, reap_within};
use crate::store::WorkerRecord;
use crate::telemetry::{FleetEvent, report_event};
use crate::wait::{Wait, instant_after};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

const IDLE_SLICE: Duration = Duration::from_millis(500);
const GATE_SLICE: Duration = Duration::from_millis(200);
const UNREACHABLE_POLL: Duration = Duration::from_millis(50);
const LINK_WAIT: Wait = Wait::millis(500);

/// One monitored worker
pub struct WorkerHandle {
    pub id: DeviceId,
    pub device_type: String,
    state: Mutex<WorkerState>,
}

#[derive(Default)]
struct WorkerState {
    process: Option<Box<dyn Running>>,
    restarted_until: Option<Instant>,
    link: Option<Arc<dyn Link>>,
    pending_major: Option<u32>,
}

impl fmt::Debug for WorkerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("WorkerHandle")
            .field("id", &self.id)
            .field("device_type", &self.device_type)
            .field("pid", &state.process.as_ref().map(|p| p.id()))
            .field("pending_major", &state.pending_major)
            .finish()
    }
}

impl WorkerHandle {
    fn new(id: DeviceId, device_type: String) -> Self {
        Self {
            id,
            device_type,
            state: Mutex::new(WorkerState::default()),
        }
    }

    pub fn has_process(&self) -> bool {
        self.state.lock().process.is_some()
    }

    pub fn pending_major(&self) -> Option<u32> {
        self.state.lock().pending_major
    }

    fn recently_started(&self, now: Instant) -> Option<Instant> {
        self.state
            .lock()
            .restarted_until
            .filter(|until| now < *until)
    }
}

/// Gate new checks on/off
#[derive(Debug)]
struct EnableGate {
    enabled: Mutex<bool>,
    changed: Condvar,
}

impl EnableGate {
    fn is_enabled(&self) -> bool {
        *self.enabled.lock()
    }

    /// Returns the previous value
    fn set(&self, enabled: bool) -> bool {
        let mut guard = self.enabled.lock();
        let previous = *guard;
        *guard = enabled;
        self.changed.notify_all();
        previous
    }

    /// Block until enabled; `false` if `halted` was raised meanwhile
    fn wait_enabled(&self, halted: &AtomicBool) -> bool {
        let mut enabled = self.enabled.lock();
        while !*enabled {
            if halted.load(Ordering::SeqCst) {
                return false;
            }
            let _ = self.changed.wait_for(&mut enabled, GATE_SLICE);
        }
        !halted.load(Ordering::SeqCst)
    }
}

/// Lets one check at a time touch the handshake listener
#[derive(Debug, Default)]
struct BusyGate {
    busy: Mutex<bool>,
    idle: Condvar,
}

impl BusyGate {
    fn enter(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.idle.wait(&mut busy);
        }
        *busy = true;
    }

    fn leave(&self) {
        *self.busy.lock() = false;
        self.idle.notify_all();
    }

    fn wait_idle(&self) {
        let mut busy = self.busy.lock();
        while *busy {
            self.idle.wait(&mut busy);
        }
    }
}

/// Workers waiting for a check, each at most once
#[derive(Debug, Default)]
pub(crate) struct WorkQueue {
    ready: VecDeque<DeviceId>,
    scheduled: Vec<(Instant, DeviceId)>,
}

impl WorkQueue {
    #[cfg(test)]
    pub(crate) fn contains(&self, id: &DeviceId) -> bool {
        self.ready.contains(id) || self.scheduled.iter().any(|(_, s)| s == id)
    }

    /// Queue for an immediate check; `false` when already ready
    pub(crate) fn enqueue(&mut self, id: DeviceId) -> bool {
        if self.ready.contains(&id) {
            return false;
        }
        self.scheduled.retain(|(_, s)| *s != id);
        self.ready.push_back(id);
        true
    }

    fn push_front(&mut self, id: DeviceId) {
        if !self.ready.contains(&id) {
            self.scheduled.retain(|(_, s)| *s != id);
            self.ready.push_front(id);
        }
    }

    /// Queue for a check at `due`; an earlier entry wins
    pub(crate) fn schedule(&mut self, id: DeviceId, due: Instant) {
        if self.ready.contains(&id) {
            return;
        }
        if let Some(entry) = self.scheduled.iter_mut().find(|(_, s)| *s == id) {
            entry.0 = entry.0.min(due);
        } else {
            self.scheduled.push((due, id));
        }
    }

    pub(crate) fn pop_due(&mut self, now: Instant) -> Option<DeviceId> {
        let mut i = 0;
        while i < self.scheduled.len() {
            if self.scheduled[i].0 <= now {
                let (_, id) = self.scheduled.remove(i);
                self.ready.push_back(id);
            } else {
                i += 1;
            }
        }
        self.ready.pop_front()
    }

    fn next_due(&self) -> Option<Instant> {
        self.scheduled.iter().map(|(due, _)| *due).min()
    }

    pub(crate) fn len(&self) -> usize {
        self.ready.len() + self.scheduled.len()
    }
}

struct Inner {
    root: PathBuf,
    settings: FleetSettings,
    fabric: Arc<dyn Fabric>,
    launcher: Arc<dyn Launcher>,
    handshake: Arc<HandshakeChannel>,
    workers: RwLock<Vec<Arc<WorkerHandle>>>,
    versions: Mutex<BTreeMap<String, String>>,
    pending_major: Mutex<BTreeMap<String, PendingUpdate>>,
    gate: EnableGate,
    busy: BusyGate,
    queue: Mutex<WorkQueue>,
    wake: Condvar,
    halted: AtomicBool,
}

/// Keeps the monitored workers alive
pub struct ProcessSupervisor {
    inner: Arc<Inner>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl fmt::Debug for ProcessSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessSupervisor")
            .field("workers", &self.inner.workers.read().len())
            .field("enabled", &self.inner.gate.is_enabled())
            .field("queued", &self.inner.queue.lock().len())
            .finish()
    }
}

struct LivenessRelay(Weak<Inner>);

impl LivenessListener for LivenessRelay {
    fn available(&self, device: &DeviceId) {
        if let Some(inner) = self.0.upgrade() {
            inner.refresh_link(device);
        }
    }

    fn unavailable(&self, device: &DeviceId) {
        let Some(inner) = self.0.upgrade() else {
            return;
        };
        if let Some(worker) = inner.worker(device) {
            worker.state.lock().link = None;
        }
        if inner.gate.is_enabled() {
            debug!("{} became unreachable, queueing a check", device);
            inner.enqueue(device.clone());
        }
    }
}

impl ProcessSupervisor {
    pub fn new(
        root: PathBuf,
        settings: FleetSettings,
        fabric: Arc<dyn Fabric>,
        launcher: Arc<dyn Launcher>,
        handshake: Arc<HandshakeChannel>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                root,
                settings,
                fabric,
                launcher,
                handshake,
                workers: RwLock::new(Vec::new()),
                versions: Mutex::new(BTreeMap::new()),
                pending_major: Mutex::new(BTreeMap::new()),
                gate: EnableGate {
                    enabled: Mutex::new(true),
                    changed: Condvar::new(),
                },
                busy: BusyGate::default(),
                queue: Mutex::new(WorkQueue::default()),
                wake: Condvar::new(),
                halted: AtomicBool::new(false),
            }),
            thread: Mutex::new(None),
        }
    }

    /// Register a worker and subscribe to its liveness
    pub fn add_worker(&self, record: &WorkerRecord) -> Arc<WorkerHandle> {
        let handle = Arc::new(WorkerHandle::new(
            record.id.clone(),
            record.device_type.clone(),
        ));
        self.inner.workers.write().push(Arc::clone(&handle));
        self.inner
            .fabric
            .watch(&record.id, Arc::new(LivenessRelay(Arc::downgrade(&self.inner))));
        info!(
            "Monitoring {} ({}) of type {}",
            record.name, record.id, record.device_type
        );
        handle
    }

    pub fn workers(&self) -> Vec<Arc<WorkerHandle>> {
        self.inner.workers.read().clone()
    }

    pub fn worker(&self, id: &DeviceId) -> Option<Arc<WorkerHandle>> {
        self.inner.worker(id)
    }

    pub fn workers_of_type(&self, device_type: &str) -> Vec<Arc<WorkerHandle>> {
        self.inner
            .workers
            .read()
            .iter()
            .filter(|w| w.device_type == device_type)
            .cloned()
            .collect()
    }

    pub fn worker_types(&self) -> BTreeSet<String> {
        self.inner
            .workers
            .read()
            .iter()
            .map(|w| w.device_type.clone())
            .collect()
    }

    pub fn version_of(&self, device_type: &str) -> Option<String> {
        self.inner.versions.lock().get(device_type).cloned()
    }

    pub fn set_version(&self, device_type: &str, version: &str) {
        self.inner
            .versions
            .lock()
            .insert(device_type.to_owned(), version.to_owned());
    }

    /// Start the loop thread; every worker gets an initial check
    pub fn start(&self) -> Result<()> {
        for worker in self.workers() {
            self.inner.queue.lock().enqueue(worker.id.clone());
        }

        let inner = Arc::clone(&self.inner);
        let handle = thread::Builder::new()
            .name("process-supervisor".to_owned())
            .spawn(move || inner.run())?;
        *self.thread.lock() = Some(handle);
        info!("Process supervisor started");
        Ok(())
    }

    /// Stop the loop thread for good
    pub fn halt(&self) {
        self.inner.halted.store(true, Ordering::SeqCst);
        self.inner.gate.changed.notify_all();
        self.inner.wake.notify_all();
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }

    /// Turn monitoring off and wait for a running check to finish
    pub fn disable(&self) {
        if self.inner.gate.set(false) {
            info!("Process supervision disabled");
        }
        self.inner.busy.wait_idle();
    }

    /// Turn monitoring back on; every worker is checked once more
    pub fn enable(&self) {
        if !self.inner.gate.set(true) {
            info!("Process supervision enabled");
            for worker in self.workers() {
                self.inner.enqueue(worker.id.clone());
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.gate.is_enabled()
    }

    pub fn is_reachable(&self, worker: &WorkerHandle) -> bool {
        self.inner.fabric.is_reachable(&worker.id)
    }

    pub fn link(&self, worker: &WorkerHandle) -> Option<Arc<dyn Link>> {
        self.inner.link(worker)
    }

    /// Launch `version` of the worker's type and keep the process handle
    pub fn spawn(&self, worker: &WorkerHandle, version: &str) -> Result<()> {
        self.inner.spawn(worker, version)
    }

    pub fn kill_worker(&self, worker: &WorkerHandle, gentle: bool) {
        self.inner.kill_worker(worker, gentle);
    }

    // Major readiness

    /// Remember a downloaded major update until the whole fleet is ready
    pub fn record_pending_major(&self, update: PendingUpdate) {
        let major = update.target_major();
        for worker in self.workers_of_type(&update.device_type) {
            worker.state.lock().pending_major = major;
        }
        self.inner
            .pending_major
            .lock()
            .insert(update.device_type.clone(), update);
    }

    pub fn pending_major(&self, device_type: &str) -> Option<PendingUpdate> {
        self.inner.pending_major.lock().get(device_type).cloned()
    }

    pub fn clear_pending_major(&self, device_type: &str) {
        for worker in self.workers_of_type(device_type) {
            worker.state.lock().pending_major = None;
        }
        self.inner.pending_major.lock().remove(device_type);
    }

    /// Major version every type in `types` has a pending update to, if they agree
    pub fn major_target<'a>(&self, types: impl IntoIterator<Item = &'a String>) -> Option<u32> {
        let pending = self.inner.pending_major.lock();
        let mut target = None;
        for device_type in types {
            let Some(major) = pending.get(device_type).and_then(PendingUpdate::target_major) else {
                debug!("{} has no pending major update", device_type);
                return None;
            };
            if *target.get_or_insert(major) != major {
                debug!("{} is pending major {}, others {:?}", device_type, major, target);
                return None;
            }
        }
        target
    }

    // Management by index

    pub fn list(&self) -> Vec<String> {
        self.workers()
            .iter()
            .enumerate()
            .map(|(index, w)| format!("index={index} ID={} type={} ", w.id, w.device_type))
            .collect()
    }

    fn by_index(&self, index: usize) -> Result<Arc<WorkerHandle>> {
        self.inner
            .workers
            .read()
            .get(index)
            .cloned()
            .ok_or_else(|| FleetError::Config(format!("no monitored device at index {index}")))
    }

    pub fn kill_by_index(&self, index: usize) -> Result<()> {
        let worker = self.by_index(index)?;
        info!("Killing monitored device {} on request", worker.id);
        self.inner.kill_worker(&worker, true);
        Ok(())
    }

    pub fn start_by_index(&self, index: usize) -> Result<()> {
        let worker = self.by_index(index)?;
        self.exclusive(|inner| {
            if inner.fabric.is_reachable(&worker.id) {
                warn!("{} is already running", worker.id);
                return;
            }
            info!("Starting monitored device {} on request", worker.id);
            inner.restart_worker(&worker);
        })
    }

    pub fn restart_by_index(&self, index: usize) -> Result<()> {
        let worker = self.by_index(index)?;
        self.exclusive(|inner| {
            info!("Restarting monitored device {} on request", worker.id);
            inner.kill_worker(&worker, true);
            inner.restart_worker(&worker);
        })
    }

    /// Run a manual restart between two checks of the monitor loop
    fn exclusive(&self, body: impl FnOnce(&Inner)) -> Result<()> {
        self.inner.busy.enter();
        if !self.inner.gate.is_enabled() {
            self.inner.busy.leave();
            return Err(FleetError::Process(
                "monitoring is disabled while an update runs".to_owned(),
            ));
        }
        body(&self.inner);
        self.inner.busy.leave();
        Ok(())
    }

    pub fn stop_all(&self) {
        for worker in self.workers() {
            self.inner.kill_worker(&worker, true);
        }
    }

    /// Ask any worker to coordinate stage two; returns the one that accepted
    pub fn initiate_stage_two(&self) -> Option<Arc<WorkerHandle>> {
        for worker in self.workers() {
            let Some(link) = self.inner.link(&worker) else {
                continue;
            };
            match link.send(Command::new(CommandKind::InitiateStageTwo)) {
                Ok(()) => {
                    info!("{} accepted stage two coordination", worker.id);
                    return Some(worker);
                }
                Err(e) => warn!("{} refused stage two coordination: {}", worker.id, e),
            }
        }
        None
    }

    #[cfg(test)]
    pub(crate) fn queued(&self) -> usize {
        self.inner.queue.lock().len()
    }
}

impl Inner {
    fn worker(&self, id: &DeviceId) -> Option<Arc<WorkerHandle>> {
        self.workers.read().iter().find(|w| w.id == *id).cloned()
    }

    fn enqueue(&self, id: DeviceId) {
        if self.queue.lock().enqueue(id) {
            self.wake.notify_all();
        }
    }

    fn schedule(&self, id: DeviceId, due: Instant) {
        self.queue.lock().schedule(id, due);
        self.wake.notify_all();
    }

    fn refresh_link(&self, id: &DeviceId) {
        let Some(worker) = self.worker(id) else {
            return;
        };
        let link = self.fabric.connect(id, Wait::millis(0));
        worker.state.lock().link = link;
        debug!("{} is reachable again", id);
    }

    fn link(&self, worker: &WorkerHandle) -> Option<Arc<dyn Link>> {
        if let Some(link) = worker.state.lock().link.clone() {
            return Some(link);
        }
        let link = self.fabric.connect(&worker.id, LINK_WAIT)?;
        worker.state.lock().link = Some(Arc::clone(&link));
        Some(link)
    }

    fn run(&self) {
        loop {
            if !self.gate.wait_enabled(&self.halted) {
                break;
            }
            let Some(id) = self.next() else {
                if self.halted.load(Ordering::SeqCst) {
                    break;
                }
                continue;
            };

            self.busy.enter();
            if !self.gate.is_enabled() {
                self.busy.leave();
                self.queue.lock().push_front(id);
                continue;
            }
            if let Some(worker) = self.worker(&id) {
                self.check_worker(&worker);
            }
            self.busy.leave();
        }
        debug!("Process supervisor loop stopped");
    }

    /// Wait for the next due worker, at most one idle slice
    fn next(&self) -> Option<DeviceId> {
        let mut queue = self.queue.lock();
        loop {
            if self.halted.load(Ordering::SeqCst) {
                return None;
            }
            let now = Instant::now();
            if let Some(id) = queue.pop_due(now) {
                return Some(id);
            }
            let sleep = queue
                .next_due()
                .map_or(IDLE_SLICE, |due| due.saturating_duration_since(now).min(IDLE_SLICE));
            if self.wake.wait_for(&mut queue, sleep).timed_out() {
                return None;
            }
        }
    }

    fn check_worker(&self, worker: &WorkerHandle) {
        if self.fabric.is_reachable(&worker.id) {
            debug!("{} is reachable", worker.id);
            return;
        }

        if let Some(until) = worker.recently_started(Instant::now()) {
            debug!("{} was started recently, checking again later", worker.id);
            self.schedule(worker.id.clone(), until);
            return;
        }

        warn!("{} is unreachable, restarting it", worker.id);
        self.restart_worker(worker);
    }

    /// Force-kill, spawn the recorded version and run the startup check
    fn restart_worker(&self, worker: &WorkerHandle) {
        self.kill_worker(worker, false);

        let Some(version) = self.versions.lock().get(&worker.device_type).cloned() else {
            error!(
                "No version recorded for type {}, cannot start {}",
                worker.device_type, worker.id
            );
            return;
        };

        let grace = self.settings.recently_started();
        if let Err(e) = self.spawn(worker, &version) {
            warn!("Failed to start {}: {}", worker.id, e);
            worker.state.lock().restarted_until = Some(instant_after(grace));
            self.schedule(worker.id.clone(), instant_after(grace));
            return;
        }

        if self.startup_check() {
            info!("{} restarted with version {}", worker.id, version);
            report_event(&FleetEvent::WorkerRestarted {
                device_id: worker.id.to_string(),
                version,
            });
        } else {
            warn!("Startup check of {} failed, retrying in {:?}", worker.id, grace);
            self.kill_worker(worker, false);
            self.schedule(worker.id.clone(), instant_after(grace));
        }
    }

    fn spawn(&self, worker: &WorkerHandle, version: &str) -> Result<()> {
        let executable = executable_path(&self.root, &worker.device_type, version);
        let command = LaunchCommand::new(executable, worker.id.clone(), self.root.clone());
        let process = self
            .launcher
            .launch(&command)
            .map_err(|e| FleetError::Process(format!("cannot start {}: {e}", worker.id)))?;

        let mut state = worker.state.lock();
        state.process = Some(process);
        state.link = None;
        state.restarted_until = Some(instant_after(self.settings.recently_started()));
        Ok(())
    }

    fn startup_check(&self) -> bool {
        let wait = self.settings.startup_check_wait();
        let HandshakeChannel { listener, sender } = self.handshake.as_ref();
        listener.clear();

        sender.send(token::SOCKET_CHECK, wait)
            && listener.wait_for(token::SOCKET_CONFIRM, wait).is_some()
            && sender.send(token::FINISH_STARTUP_CHECK, wait)
            && listener
                .wait_for(token::FINISH_STARTUP_CHECK_ACK, wait)
                .is_some()
    }

    fn kill_worker(&self, worker: &WorkerHandle, gentle: bool) {
        let mut process = worker.state.lock().process.take();

        if gentle {
            let delivered = match self.link(worker) {
                Some(link) => link
                    .send(Command::new(CommandKind::Kill))
                    .map_err(|e| warn!("Kill request to {} failed: {}", worker.id, e))
                    .is_ok(),
                None => {
                    warn!("{} is not reachable for a kill request", worker.id);
                    false
                }
            };
            if !delivered {
                if let Some(process) = process.as_mut() {
                    if let Err(e) = process.terminate() {
                        warn!("Failed to send SIGTERM to {}: {}", worker.id, e);
                    }
                }
            }
            self.wait_unreachable(&worker.id, self.settings.gentle_kill_grace());
            if let Some(process) = process.as_mut() {
                reap_within(&mut **process, self.settings.gentle_kill_grace());
            }
        } else if let Some(process) = process.as_mut() {
            force_kill(&mut **process);
        }

        worker.state.lock().link = None;
    }

    fn wait_unreachable(&self, id: &DeviceId, grace: Duration) {
        let started = Instant::now();
        while self.fabric.is_reachable(id) {
            if started.elapsed() >= grace {
                warn!("{} is still reachable after {:?}", id, grace);
                return;
            }
            thread::sleep(UNREACHABLE_POLL);
        }
    }
}

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

//! Loopback fabric: one JSON envelope per line over short TCP connections
//!
//! Peers are static configuration. Liveness is probed by connecting to the
//! peer's address on a fixed interval.

use super::{DeviceId, Fabric, InboundHandler, Link, LivenessListener};
use crate::command::Command;
use crate::error::{FleetError, Result};
use crate::wait::Wait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{self, BufRead, BufReader, Write};
use std::net::{SocketAddr, TcpListener, TcpStream};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;
use tracing::{debug, info, warn};

const CONNECT_TIMEOUT: Duration = Duration::from_millis(500);
const ACCEPT_POLL: Duration = Duration::from_millis(20);
const READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Wire frame of the TCP fabric
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub from: DeviceId,
    pub command: Command,
}

#[derive(Debug)]
pub struct TcpFabric {
    local: DeviceId,
    peers: HashMap<DeviceId, SocketAddr>,
    probe_interval: Duration,
    running: Arc<AtomicBool>,
}

impl TcpFabric {
    pub fn new(
        local: DeviceId,
        peers: HashMap<DeviceId, SocketAddr>,
        probe_interval: Duration,
    ) -> Self {
        Self {
            local,
            peers,
            probe_interval,
            running: Arc::new(AtomicBool::new(true)),
        }
    }

    fn address_of(&self, device: &DeviceId) -> Option<SocketAddr> {
        self.peers.get(device).copied()
    }
}

struct TcpLink {
    from: DeviceId,
    to: DeviceId,
    addr: SocketAddr,
}

impl Link for TcpLink {
    fn peer(&self) -> &DeviceId {
        &self.to
    }

    fn send(&self, command: Command) -> Result<()> {
        debug!("{} -> {}: '{}'", self.from, self.to, command.kind);
        let envelope = Envelope {
            from: self.from.clone(),
            command,
        };
        let mut line = serde_json::to_vec(&envelope)?;
        line.push(b'\n');

        let mut stream = TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT)
            .map_err(|e| FleetError::Fabric(format!("{} is not reachable: {e}", self.to)))?;
        stream.write_all(&line)?;
        stream.flush()?;
        Ok(())
    }
}

fn probe(addr: &SocketAddr) -> bool {
    TcpStream::connect_timeout(addr, CONNECT_TIMEOUT).is_ok()
}

impl Fabric for TcpFabric {
    fn local_id(&self) -> &DeviceId {
        &self.local
    }

    fn is_reachable(&self, device: &DeviceId) -> bool {
        self.address_of(device).is_some_and(|addr| probe(&addr))
    }

    fn connect(&self, device: &DeviceId, wait: Wait) -> Option<Arc<dyn Link>> {
        let Some(addr) = self.address_of(device) else {
            warn!("No fabric address configured for {}", device);
            return None;
        };

        let deadline = wait.deadline();
        while !probe(&addr) {
            if deadline.passed() {
                return None;
            }
            thread::sleep(deadline.slice(self.probe_interval));
        }

        Some(Arc::new(TcpLink {
            from: self.local.clone(),
            to: device.clone(),
            addr,
        }))
    }

    fn watch(&self, device: &DeviceId, listener: Arc<dyn LivenessListener>) {
        let Some(addr) = self.address_of(device) else {
            warn!("Cannot watch {}: no fabric address configured", device);
            return;
        };

        let device = device.clone();
        let interval = self.probe_interval;
        let running = Arc::clone(&self.running);
        let spawned = thread::Builder::new()
            .name(format!("probe-{device}"))
            .spawn(move || {
                let mut last = None;
                while running.load(Ordering::SeqCst) {
                    let up = probe(&addr);
                    if last != Some(up) {
                        if up {
                            listener.available(&device);
                        } else {
                            listener.unavailable(&device);
                        }
                        last = Some(up);
                    }
                    thread::sleep(interval);
                }
            });
        if let Err(e) = spawned {
            warn!("Failed to start liveness probe: {e}");
        }
    }

    fn serve(&self, handler: Arc<dyn InboundHandler>) -> Result<()> {
        let addr = self.address_of(&self.local).ok_or_else(|| {
            FleetError::Config(format!("no fabric address configured for {}", self.local))
        })?;

        let listener = TcpListener::bind(addr)?;
        listener.set_nonblocking(true)?;
        info!("{} serving fabric on {}", self.local, addr);

        let running = Arc::clone(&self.running);
        thread::Builder::new()
            .name("fabric-accept".to_owned())
            .spawn(move || accept_loop(&listener, &running, &handler))?;
        Ok(())
    }

    fn leave(&self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn accept_loop(listener: &TcpListener, running: &AtomicBool, handler: &Arc<dyn InboundHandler>) {
    while running.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, _)) => {
                let handler = Arc::clone(handler);
                let spawned = thread::Builder::new()
                    .name("fabric-conn".to_owned())
                    .spawn(move || {
                        if let Err(e) = read_envelopes(stream, handler.as_ref()) {
                            debug!("Fabric connection ended: {e}");
                        }
                    });
                if let Err(e) = spawned {
                    warn!("Failed to handle fabric connection: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("Fabric accept failed: {e}");
                thread::sleep(ACCEPT_POLL);
            }
        }
    }
}

fn read_envelopes(stream: TcpStream, handler: &dyn InboundHandler) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    for line in BufReader::new(stream).lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Envelope>(&line) {
            Ok(envelope) => handler.invoked(&envelope.from, envelope.command),
            Err(e) => warn!("Dropping malformed fabric frame: {e}"),
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandKind, param};
    use crossbeam_channel::{Sender, unbounded};
    use std::net::Ipv4Addr;

    struct Forward(Sender<Envelope>);

    impl InboundHandler for Forward {
        fn invoked(&self, from: &DeviceId, command: Command) {
            let _ = self.0.send(Envelope {
                from: from.clone(),
                command,
            });
        }
    }

    fn free_addr() -> SocketAddr {
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap()
    }

    #[test]
    fn test_envelope_roundtrip_over_socket() {
        let peers: HashMap<DeviceId, SocketAddr> = [
            (DeviceId::from("supervisor"), free_addr()),
            (DeviceId::from("repo"), free_addr()),
        ]
        .into_iter()
        .collect();

        let repo = TcpFabric::new("repo".into(), peers.clone(), Duration::from_millis(50));
        let (tx, rx) = unbounded();
        repo.serve(Arc::new(Forward(tx))).unwrap();

        let supervisor = TcpFabric::new("supervisor".into(), peers, Duration::from_millis(50));
        let link = supervisor.connect(&"repo".into(), Wait::secs(2)).unwrap();
        link.send(Command::new(CommandKind::RequestArtifact).with_text(param::DEVICE_TYPE, "A"))
            .unwrap();

        let envelope = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(envelope.from.as_str(), "supervisor");
        assert_eq!(envelope.command.kind, CommandKind::RequestArtifact);
        assert_eq!(envelope.command.text(param::DEVICE_TYPE).as_deref(), Some("A"));
        repo.leave();
    }

    #[test]
    fn test_unknown_peer_is_unreachable() {
        let fabric = TcpFabric::new("a".into(), HashMap::new(), Duration::from_millis(50));
        assert!(!fabric.is_reachable(&"b".into()));
        assert!(fabric.connect(&"b".into(), Wait::millis(50)).is_none());
        assert!(fabric.serve(Arc::new(Forward(unbounded().0))).is_err());
    }
}

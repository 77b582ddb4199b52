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

use super::token;
use crate::wait::Wait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, unbounded};
use parking_lot::{Condvar, Mutex};
use std::io::{self, BufRead, BufReader};
use std::net::{Ipv4Addr, TcpListener, TcpStream};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::{debug, info, warn};

const ACCEPT_POLL: Duration = Duration::from_millis(50);
const REOPEN_DELAY: Duration = Duration::from_millis(500);
const READ_TIMEOUT: Duration = Duration::from_secs(2);
const RECV_SLICE: Duration = Duration::from_millis(200);

/// Outcome of waiting for a specific token
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Received,
    /// The peer sent `abort!` first
    Aborted,
    TimedOut,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Open,
    Closing,
    Closed,
    Halted,
}

#[derive(Debug)]
struct Shared {
    port: u16,
    phase: Mutex<Phase>,
    changed: Condvar,
}

impl Shared {
    fn phase(&self) -> Phase {
        *self.phase.lock()
    }

    fn set_phase(&self, phase: Phase) {
        *self.phase.lock() = phase;
        self.changed.notify_all();
    }
}

/// Receiving half of the handshake channel
///
/// A background thread owns the socket and pushes every received line into an
/// unbounded FIFO. The socket can be closed to release the port and reopened
/// later; lines already received stay queued.
#[derive(Debug)]
pub struct HandshakeListener {
    shared: Arc<Shared>,
    lines: Receiver<String>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HandshakeListener {
    pub fn spawn(port: u16) -> Self {
        let shared = Arc::new(Shared {
            port,
            phase: Mutex::new(Phase::Open),
            changed: Condvar::new(),
        });
        let (tx, rx) = unbounded();

        let worker = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(format!("handshake-{port}"))
            .spawn(move || listen_loop(&worker, &tx))
            .map_err(|e| warn!("Failed to start handshake listener thread: {e}"))
            .ok();

        Self {
            shared,
            lines: rx,
            thread: Mutex::new(handle),
        }
    }

    pub fn port(&self) -> u16 {
        self.shared.port
    }

    pub fn is_open(&self) -> bool {
        self.shared.phase() == Phase::Open
    }

    /// Block until the next line arrives; `None` once the listener is stopped
    pub fn get_message(&self) -> Option<String> {
        self.get_message_within(Wait::Forever)
    }

    pub fn get_message_within(&self, wait: Wait) -> Option<String> {
        let deadline = wait.deadline();
        loop {
            match self.lines.recv_timeout(deadline.slice(RECV_SLICE)) {
                Ok(line) => return Some(line),
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.passed() || self.shared.phase() == Phase::Halted {
                        return None;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return None,
            }
        }
    }

    /// Discard lines until `expected` arrives
    ///
    /// Returns `None` when the wait runs out, never an error.
    pub fn wait_for(&self, expected: &str, wait: Wait) -> Option<String> {
        let deadline = wait.deadline();
        loop {
            let remaining = match deadline.remaining() {
                Some(left) => Wait::For(left),
                None => Wait::Forever,
            };
            let line = self.get_message_within(remaining)?;
            if line == expected {
                return Some(line);
            }
            debug!("Discarding handshake line '{}' while waiting for '{}'", line, expected);
        }
    }

    /// Like [`wait_for`](Self::wait_for) but an `abort!` line ends the wait
    pub fn await_reply(&self, expected: &str, wait: Wait) -> Reply {
        let deadline = wait.deadline();
        loop {
            let remaining = match deadline.remaining() {
                Some(left) => Wait::For(left),
                None => Wait::Forever,
            };
            match self.get_message_within(remaining) {
                None => return Reply::TimedOut,
                Some(line) if line == expected => return Reply::Received,
                Some(line) if line == token::ABORT => {
                    warn!("Peer aborted while we waited for '{}'", expected);
                    return Reply::Aborted;
                }
                Some(line) => {
                    debug!("Discarding handshake line '{}' while waiting for '{}'", line, expected);
                }
            }
        }
    }

    /// Drop everything received so far
    pub fn clear(&self) {
        while self.lines.try_recv().is_ok() {}
    }

    /// Release the port; returns once the socket is really gone
    pub fn close(&self) {
        let mut phase = self.shared.phase.lock();
        if *phase == Phase::Open {
            *phase = Phase::Closing;
            self.shared.changed.notify_all();
        }
        while *phase == Phase::Closing {
            self.shared.changed.wait(&mut phase);
        }
        info!("Handshake listener on port {} closed", self.shared.port);
    }

    pub fn reopen(&self) {
        let mut phase = self.shared.phase.lock();
        if matches!(*phase, Phase::Closing | Phase::Closed) {
            *phase = Phase::Open;
            self.shared.changed.notify_all();
            info!("Handshake listener on port {} reopened", self.shared.port);
        }
    }

    /// Stop for good and join the listener thread
    pub fn stop(&self) {
        self.shared.set_phase(Phase::Halted);
        if let Some(handle) = self.thread.lock().take() {
            let _ = handle.join();
        }
    }
}

impl Drop for HandshakeListener {
    fn drop(&mut self) {
        self.stop();
    }
}

fn listen_loop(shared: &Shared, tx: &Sender<String>) {
    loop {
        {
            let mut phase = shared.phase.lock();
            loop {
                match *phase {
                    Phase::Open => break,
                    Phase::Halted => return,
                    Phase::Closing => {
                        *phase = Phase::Closed;
                        shared.changed.notify_all();
                    }
                    Phase::Closed => shared.changed.wait(&mut phase),
                }
            }
        }

        let listener = match bind(shared.port) {
            Ok(listener) => listener,
            Err(e) => {
                warn!("Cannot bind handshake port {}: {}", shared.port, e);
                wait_unless_halted(shared, REOPEN_DELAY);
                continue;
            }
        };
        debug!("Handshake listener bound on port {}", shared.port);

        serve(shared, &listener, tx);
    }
}

fn bind(port: u16) -> io::Result<TcpListener> {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, port))?;
    listener.set_nonblocking(true)?;
    Ok(listener)
}

/// Accept until the phase leaves `Open` or the socket fails
fn serve(shared: &Shared, listener: &TcpListener, tx: &Sender<String>) {
    loop {
        if shared.phase() != Phase::Open {
            return;
        }

        match listener.accept() {
            Ok((stream, _)) => {
                if let Err(e) = read_lines(stream, tx) {
                    warn!("Failed to read handshake connection: {e}");
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => thread::sleep(ACCEPT_POLL),
            Err(e) => {
                warn!("Handshake accept failed on port {}: {}; reopening", shared.port, e);
                wait_unless_halted(shared, REOPEN_DELAY);
                return;
            }
        }
    }
}

fn read_lines(stream: TcpStream, tx: &Sender<String>) -> io::Result<()> {
    stream.set_nonblocking(false)?;
    stream.set_read_timeout(Some(READ_TIMEOUT))?;

    for line in BufReader::new(stream).lines() {
        let line = line?;
        let line = line.trim_end_matches('\r');
        debug!("handshake <- {}", line);
        if tx.send(line.to_owned()).is_err() {
            break;
        }
    }
    Ok(())
}

fn wait_unless_halted(shared: &Shared, delay: Duration) {
    let mut phase = shared.phase.lock();
    if *phase != Phase::Halted {
        let _ = shared.changed.wait_for(&mut phase, delay);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handshake::HandshakeSender;

    fn free_port() -> u16 {
        let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        probe.local_addr().unwrap().port()
    }

    #[test]
    fn test_wait_for_discards_non_matching() {
        let port = free_port();
        let listener = HandshakeListener::spawn(port);
        let sender = HandshakeSender::new(port);

        assert!(sender.send("noise", Wait::secs(5)));
        assert!(sender.send(token::SOCKET_CHECK, Wait::secs(5)));
        assert!(sender.send("after", Wait::secs(5)));

        assert_eq!(
            listener.wait_for(token::SOCKET_CHECK, Wait::secs(5)).as_deref(),
            Some(token::SOCKET_CHECK)
        );
        assert_eq!(listener.get_message_within(Wait::secs(5)).as_deref(), Some("after"));
    }

    #[test]
    fn test_wait_for_times_out_on_wrong_tokens() {
        let port = free_port();
        let listener = HandshakeListener::spawn(port);
        let sender = HandshakeSender::new(port);

        assert!(sender.send(token::KILL_ACK, Wait::secs(5)));
        assert!(sender.send(token::SOCKET_CONFIRM, Wait::secs(5)));

        assert!(listener.wait_for(token::KILL, Wait::millis(500)).is_none());
    }

    #[test]
    fn test_abort_ends_reply_wait() {
        let port = free_port();
        let listener = HandshakeListener::spawn(port);
        let sender = HandshakeSender::new(port);

        assert!(sender.send(token::ABORT, Wait::secs(5)));
        assert_eq!(
            listener.await_reply(token::FINISH_STAGE_TWO, Wait::secs(5)),
            Reply::Aborted
        );
    }

    #[test]
    fn test_close_releases_port_and_reopen_rebinds() {
        let port = free_port();
        let listener = HandshakeListener::spawn(port);
        let sender = HandshakeSender::new(port);
        assert!(sender.send("first", Wait::secs(5)));
        assert_eq!(listener.get_message_within(Wait::secs(5)).as_deref(), Some("first"));

        listener.close();
        assert!(!listener.is_open());
        assert!(!sender.send("while closed", Wait::millis(300)));

        listener.reopen();
        assert!(sender.send("second", Wait::secs(5)));
        assert_eq!(listener.get_message_within(Wait::secs(5)).as_deref(), Some("second"));
    }

    #[test]
    fn test_stopped_listener_returns_none() {
        let listener = HandshakeListener::spawn(free_port());
        listener.stop();
        assert!(listener.get_message().is_none());
    }
}

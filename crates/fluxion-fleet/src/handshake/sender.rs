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

use crate::wait::Wait;
use std::io::{self, Write};
use std::net::{Ipv4Addr, SocketAddr, TcpStream};
use std::thread;
use std::time::Duration;
use tracing::{debug, warn};

const RETRY_DELAY: Duration = Duration::from_millis(100);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Sending half of the handshake channel
#[derive(Debug, Clone)]
pub struct HandshakeSender {
    peer: SocketAddr,
}

impl HandshakeSender {
    pub fn new(peer_port: u16) -> Self {
        Self {
            peer: SocketAddr::from((Ipv4Addr::LOCALHOST, peer_port)),
        }
    }

    /// Deliver one line to the peer
    ///
    /// A refused connection means the peer is not listening yet, so it is
    /// retried until `wait` runs out. Any other error fails immediately.
    pub fn send(&self, message: &str, wait: Wait) -> bool {
        let deadline = wait.deadline();

        loop {
            match self.try_send(message) {
                Ok(()) => {
                    debug!("handshake -> {}: {}", self.peer.port(), message);
                    return true;
                }
                Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                    if deadline.passed() {
                        warn!(
                            "Handshake peer on port {} never accepted '{}' within {}",
                            self.peer.port(),
                            message,
                            wait
                        );
                        return false;
                    }
                    thread::sleep(deadline.slice(RETRY_DELAY));
                }
                Err(e) => {
                    warn!(
                        "Failed to send '{}' to handshake port {}: {}",
                        message,
                        self.peer.port(),
                        e
                    );
                    return false;
                }
            }
        }
    }

    fn try_send(&self, message: &str) -> io::Result<()> {
        let mut stream = TcpStream::connect_timeout(&self.peer, CONNECT_TIMEOUT)?;
        stream.write_all(message.as_bytes())?;
        stream.write_all(b"\n")?;
        stream.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{BufRead, BufReader};
    use std::net::TcpListener;
    use std::time::Instant;

    #[test]
    fn test_send_writes_one_line() {
        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
        let port = listener.local_addr().unwrap().port();

        let reader = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut line = String::new();
            BufReader::new(stream).read_line(&mut line).unwrap();
            line
        });

        assert!(HandshakeSender::new(port).send("socket working?", Wait::secs(2)));
        assert_eq!(reader.join().unwrap(), "socket working?\n");
    }

    #[test]
    fn test_send_gives_up_after_deadline() {
        let port = {
            let probe = TcpListener::bind((Ipv4Addr::LOCALHOST, 0)).unwrap();
            probe.local_addr().unwrap().port()
        };

        let started = Instant::now();
        assert!(!HandshakeSender::new(port).send("kill", Wait::millis(300)));
        assert!(started.elapsed() >= Duration::from_millis(300));
    }
}

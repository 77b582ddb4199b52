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

//! Loopback line protocol used to coordinate process handoffs
//!
//! Every message is one UTF-8 line sent over its own short-lived TCP
//! connection to a fixed local port. The supervisor listens on one port and
//! sends to the other; workers use the same two ports the other way round.

mod listener;
mod sender;

pub use listener::{HandshakeListener, Reply};
pub use sender::HandshakeSender;

/// Literal tokens of the handshake protocol
pub mod token {
    pub const KILL: &str = "kill";
    pub const KILL_ACK: &str = "kill ack";
    pub const ABORT: &str = "abort!";
    pub const SOCKET_CHECK: &str = "socket working?";
    pub const SOCKET_CONFIRM: &str = "socket working!";
    pub const SERVER_CHECK: &str = "update server hear you?";
    pub const SERVER_CONFIRM: &str = "update server hear me!";
    pub const FINISH_STARTUP_CHECK: &str = "finish device startup check";
    pub const FINISH_STARTUP_CHECK_ACK: &str = "finish device startup check ACK";
    pub const STAGE_TWO: &str = "update stage two";
    pub const FINISH_STAGE_TWO: &str = "finish stage two";
    pub const FINISH_STAGE_TWO_ACK: &str = "finish stage two ACK";
}

/// Listener and sender halves owned by one process
#[derive(Debug)]
pub struct HandshakeChannel {
    pub listener: HandshakeListener,
    pub sender: HandshakeSender,
}

impl HandshakeChannel {
    /// Listen on `listen_port`, talk to the peer on `peer_port`
    pub fn open(listen_port: u16, peer_port: u16) -> Self {
        Self {
            listener: HandshakeListener::spawn(listen_port),
            sender: HandshakeSender::new(peer_port),
        }
    }
}

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

//! Hand-off buffer between fabric delivery and the waits inside update stages

use crate::command::{Command, CommandKind};
use crate::wait::Wait;
use crossbeam_channel::{Receiver, RecvTimeoutError, Sender, TrySendError, bounded};
use std::time::Duration;
use tracing::{debug, warn};

const DEFAULT_CAPACITY: usize = 64;
const RECV_SLICE: Duration = Duration::from_millis(200);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboxReply {
    Matched(Command),
    Aborted,
    TimedOut,
}

/// Bounded FIFO of commands routed to the running stage
#[derive(Debug)]
pub struct CommandInbox {
    tx: Sender<Command>,
    rx: Receiver<Command>,
}

impl Default for CommandInbox {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }
}

impl CommandInbox {
    pub fn with_capacity(capacity: usize) -> Self {
        let (tx, rx) = bounded(capacity);
        Self { tx, rx }
    }

    /// Queue a command; drops it with a warning when the buffer is full
    pub fn post(&self, command: Command) {
        let kind = command.kind;
        match self.tx.try_send(command) {
            Ok(()) => debug!("Inbox accepted '{}'", kind),
            Err(TrySendError::Full(_)) => warn!("Inbox full, dropping '{}'", kind),
            Err(TrySendError::Disconnected(_)) => warn!("Inbox closed, dropping '{}'", kind),
        }
    }

    /// Take the first `expected` command, discarding others
    ///
    /// An `abort update!` command always wins over the awaited one.
    pub fn wait_for(&self, expected: CommandKind, wait: Wait) -> InboxReply {
        let deadline = wait.deadline();
        loop {
            match self.rx.recv_timeout(deadline.slice(RECV_SLICE)) {
                Ok(command) if command.kind == CommandKind::AbortUpdate => {
                    return InboxReply::Aborted;
                }
                Ok(command) if command.kind == expected => return InboxReply::Matched(command),
                Ok(command) => {
                    debug!("Inbox discarding '{}' while waiting for '{}'", command.kind, expected);
                }
                Err(RecvTimeoutError::Timeout) => {
                    if deadline.passed() {
                        return InboxReply::TimedOut;
                    }
                }
                Err(RecvTimeoutError::Disconnected) => return InboxReply::TimedOut,
            }
        }
    }

    /// Forget stale replies left over from an earlier stage
    pub fn drain(&self) -> usize {
        let mut dropped = 0;
        while self.rx.try_recv().is_ok() {
            dropped += 1;
        }
        dropped
    }

    pub fn len(&self) -> usize {
        self.rx.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rx.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::param;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn test_matched_after_discarding_others() {
        let inbox = CommandInbox::default();
        inbox.post(Command::new(CommandKind::IHearYou));
        inbox.post(Command::new(CommandKind::UpdateData).with_text(param::VERSION, "1.1.0"));

        match inbox.wait_for(CommandKind::UpdateData, Wait::secs(1)) {
            InboxReply::Matched(cmd) => assert_eq!(cmd.text(param::VERSION).as_deref(), Some("1.1.0")),
            other => panic!("unexpected {other:?}"),
        }
        assert!(inbox.is_empty());
    }

    #[test]
    fn test_abort_wins() {
        let inbox = CommandInbox::default();
        inbox.post(Command::new(CommandKind::AbortUpdate));
        inbox.post(Command::new(CommandKind::UpdateData));
        assert_eq!(
            inbox.wait_for(CommandKind::UpdateData, Wait::secs(1)),
            InboxReply::Aborted
        );
    }

    #[test]
    fn test_times_out() {
        let inbox = CommandInbox::default();
        assert_eq!(
            inbox.wait_for(CommandKind::IHearYou, Wait::millis(250)),
            InboxReply::TimedOut
        );
    }

    #[test]
    fn test_full_inbox_drops() {
        let inbox = CommandInbox::with_capacity(2);
        for _ in 0..5 {
            inbox.post(Command::new(CommandKind::IHearYou));
        }
        assert_eq!(inbox.len(), 2);
        assert_eq!(inbox.drain(), 2);
    }

    #[test]
    fn test_delivery_from_other_thread() {
        let inbox = Arc::new(CommandInbox::default());
        let poster = Arc::clone(&inbox);
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(100));
            poster.post(Command::new(CommandKind::IHearYou));
        });

        assert!(matches!(
            inbox.wait_for(CommandKind::IHearYou, Wait::secs(5)),
            InboxReply::Matched(_)
        ));
        handle.join().unwrap();
    }
}

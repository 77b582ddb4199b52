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

use std::fmt;
use std::time::{Duration, Instant};

/// Upper bound of a blocking wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wait {
    /// Only used where the peer is guaranteed to show up
    Forever,
    For(Duration),
}

impl Wait {
    pub const fn secs(secs: u64) -> Self {
        Self::For(Duration::from_secs(secs))
    }

    pub const fn millis(millis: u64) -> Self {
        Self::For(Duration::from_millis(millis))
    }

    pub fn deadline(self) -> Deadline {
        match self {
            Self::Forever => Deadline(None),
            // too far out to represent is as good as unbounded
            Self::For(d) => Deadline(Instant::now().checked_add(d)),
        }
    }

    /// Duration for error reporting; `Forever` reports zero
    pub fn as_duration(self) -> Duration {
        match self {
            Self::Forever => Duration::ZERO,
            Self::For(d) => d,
        }
    }
}

impl fmt::Display for Wait {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Forever => f.write_str("forever"),
            Self::For(d) => write!(f, "{d:?}"),
        }
    }
}

const FAR_FUTURE: Duration = Duration::from_secs(365 * 24 * 60 * 60);

/// `now + d`, clamped to a year ahead where the sum would overflow
pub(crate) fn instant_after(d: Duration) -> Instant {
    let now = Instant::now();
    now.checked_add(d).unwrap_or_else(|| now + FAR_FUTURE)
}

/// A point in time computed from a [`Wait`]
#[derive(Debug, Clone, Copy)]
pub struct Deadline(Option<Instant>);

impl Deadline {
    /// Time left, `None` for an unbounded deadline
    pub fn remaining(&self) -> Option<Duration> {
        self.0.map(|at| at.saturating_duration_since(Instant::now()))
    }

    pub fn passed(&self) -> bool {
        self.0.is_some_and(|at| Instant::now() >= at)
    }

    /// Slice of at most `step` that does not overshoot the deadline
    pub fn slice(&self, step: Duration) -> Duration {
        self.remaining().map_or(step, |left| left.min(step))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_forever_never_passes() {
        let deadline = Wait::Forever.deadline();
        assert!(!deadline.passed());
        assert!(deadline.remaining().is_none());
        assert_eq!(deadline.slice(Duration::from_millis(50)), Duration::from_millis(50));
    }

    #[test]
    fn test_bounded_deadline_passes() {
        let deadline = Wait::millis(0).deadline();
        assert!(deadline.passed());
        assert_eq!(deadline.remaining(), Some(Duration::ZERO));
    }

    #[test]
    fn test_huge_wait_does_not_overflow() {
        let deadline = Wait::For(Duration::MAX).deadline();
        assert!(!deadline.passed());
        assert!(deadline.remaining().is_none());
        assert_eq!(Wait::secs(u64::MAX).deadline().slice(Duration::from_millis(10)), Duration::from_millis(10));
        assert!(instant_after(Duration::MAX) > Instant::now());
    }
}

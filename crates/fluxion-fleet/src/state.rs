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

//! Update state of one process

use std::sync::atomic::{AtomicU8, Ordering};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum UpdateState {
    None = 0,
    Startup = 1,
    WaitingForArtifact = 2,
    KillingCurrent = 3,
    FallbackCheckFabric = 4,
    StageTwo = 5,
    StageThree = 6,
    DoNotDisturb = 7,
}

impl UpdateState {
    const ALL: [Self; 8] = [
        Self::None,
        Self::Startup,
        Self::WaitingForArtifact,
        Self::KillingCurrent,
        Self::FallbackCheckFabric,
        Self::StageTwo,
        Self::StageThree,
        Self::DoNotDisturb,
    ];

    fn from_raw(raw: u8) -> Self {
        Self::ALL
            .into_iter()
            .find(|state| *state as u8 == raw)
            .unwrap_or(Self::None)
    }

    /// An update stage is running
    pub fn is_updating(self) -> bool {
        !matches!(self, Self::None | Self::Startup)
    }
}

/// The single live [`UpdateState`] of a process
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new(initial: UpdateState) -> Self {
        Self(AtomicU8::new(initial as u8))
    }

    pub fn get(&self) -> UpdateState {
        UpdateState::from_raw(self.0.load(Ordering::SeqCst))
    }

    pub fn set(&self, state: UpdateState) {
        let previous = UpdateState::from_raw(self.0.swap(state as u8, Ordering::SeqCst));
        if previous != state {
            debug!("Update state {:?} -> {:?}", previous, state);
        }
    }

    /// Move to `next` only from `expected`
    pub fn compare_and_set(&self, expected: UpdateState, next: UpdateState) -> bool {
        let swapped = self
            .0
            .compare_exchange(expected as u8, next as u8, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok();
        if swapped {
            debug!("Update state {:?} -> {:?}", expected, next);
        }
        swapped
    }
}

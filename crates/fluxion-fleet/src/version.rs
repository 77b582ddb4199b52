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

//! Version parsing and update classification

use crate::error::{FleetError, Result};
use std::fmt;
use std::str::FromStr;

/// A `major.minor.patch` version
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct VersionTriple {
    pub major: u32,
    pub minor: u32,
    pub patch: u32,
}

impl VersionTriple {
    pub const fn new(major: u32, minor: u32, patch: u32) -> Self {
        Self {
            major,
            minor,
            patch,
        }
    }

    /// Parse "X.Y.Z"; anything other than three numeric segments is rejected
    pub fn parse(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split('.').collect();

        if parts.len() != 3 {
            return Err(FleetError::VersionScheme(format!(
                "Invalid version format: {s}, expected X.Y.Z"
            )));
        }

        let segment = |name: &str, raw: &str| {
            raw.parse::<u32>().map_err(|_| {
                FleetError::VersionScheme(format!("Invalid {name} version: {raw}"))
            })
        };

        Ok(Self {
            major: segment("major", parts[0])?,
            minor: segment("minor", parts[1])?,
            patch: segment("patch", parts[2])?,
        })
    }
}

impl FromStr for VersionTriple {
    type Err = FleetError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}

impl fmt::Display for VersionTriple {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.patch)
    }
}

/// Which segment differs first between the current and the offered version
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateKind {
    Major,
    Minor,
    Patch,
    Identical,
    Incompatible,
}

/// Result of comparing a current version against an offered one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UpdateClassification {
    pub kind: UpdateKind,
    /// `true` when the offered version is greater than the current one
    pub upgrade: bool,
}

impl UpdateClassification {
    const INCOMPATIBLE: Self = Self {
        kind: UpdateKind::Incompatible,
        upgrade: false,
    };

    pub fn is_upgrade(&self) -> bool {
        self.upgrade
    }

    /// A differing segment pointing backwards
    pub fn is_downgrade(&self) -> bool {
        !self.upgrade && matches!(self.kind, UpdateKind::Major | UpdateKind::Minor | UpdateKind::Patch)
    }

    pub fn is_identical(&self) -> bool {
        self.kind == UpdateKind::Identical
    }

    pub fn is_incompatible(&self) -> bool {
        self.kind == UpdateKind::Incompatible
    }

    /// Major updates require the whole fleet to move in lockstep
    pub fn is_protocol_breaking(&self) -> bool {
        self.kind == UpdateKind::Major
    }
}

impl fmt::Display for UpdateClassification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.kind, self.upgrade) {
            (UpdateKind::Identical, _) => f.write_str("identical"),
            (UpdateKind::Incompatible, _) => f.write_str("incompatible"),
            (kind, true) => write!(f, "{kind:?} upgrade"),
            (kind, false) => write!(f, "{kind:?} downgrade"),
        }
    }
}

/// Classify moving from `current` to `new`
///
/// Malformed input on either side yields `Incompatible` rather than an error.
pub fn classify(current: &str, new: &str) -> UpdateClassification {
    let (Ok(current), Ok(new)) = (VersionTriple::parse(current), VersionTriple::parse(new)) else {
        return UpdateClassification::INCOMPATIBLE;
    };

    let segments = [
        (UpdateKind::Major, current.major, new.major),
        (UpdateKind::Minor, current.minor, new.minor),
        (UpdateKind::Patch, current.patch, new.patch),
    ];

    for (kind, current, new) in segments {
        if new != current {
            return UpdateClassification {
                kind,
                upgrade: new > current,
            };
        }
    }

    UpdateClassification {
        kind: UpdateKind::Identical,
        upgrade: false,
    }
}

/// Major segment of a well-formed version
pub fn major_of(version: &str) -> Option<u32> {
    VersionTriple::parse(version).ok().map(|v| v.major)
}

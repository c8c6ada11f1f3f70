//! Tie objects: mapped i32 flags presented as ordinary scalars.
//!
//! The debug-hook collaborator hands these to whatever facility its runtime
//! uses to intercept scalar reads and writes. Each is a plain aligned load
//! or store against the mapping; no lock, no ordering beyond the word
//! itself.

use std::sync::Arc;

use crate::layout::OFF_SINGLE;
use crate::mapping::Mapping;

/// Tie to the header's shared single-step flag.
///
/// Written by the Monitor; the application under test must treat it as
/// read-only by policy.
#[derive(Clone)]
pub struct SingleTie {
    map: Arc<Mapping>,
}

impl SingleTie {
    pub(crate) fn new(map: Arc<Mapping>) -> Self {
        Self { map }
    }

    /// Read the flag.
    pub fn get(&self) -> i32 {
        self.map.read_i32(OFF_SINGLE)
    }

    /// Write the flag.
    pub fn set(&self, v: i32) {
        self.map.write_i32(OFF_SINGLE, v);
    }
}

/// Tie to one ring's trace flag. Last writer wins between the Monitor and
/// the owning thread.
#[derive(Clone)]
pub struct TraceTie {
    map: Arc<Mapping>,
    off: usize,
}

impl TraceTie {
    pub(crate) fn new(map: Arc<Mapping>, off: usize) -> Self {
        Self { map, off }
    }

    /// Read the flag.
    pub fn get(&self) -> i32 {
        self.map.read_i32(self.off)
    }

    /// Write the flag.
    pub fn set(&self, v: i32) {
        self.map.write_i32(self.off, v);
    }
}

/// Tie to one ring's signal flag. Last writer wins between the Monitor and
/// the owning thread.
#[derive(Clone)]
pub struct SignalTie {
    map: Arc<Mapping>,
    off: usize,
}

impl SignalTie {
    pub(crate) fn new(map: Arc<Mapping>, off: usize) -> Self {
        Self { map, off }
    }

    /// Read the flag.
    pub fn get(&self) -> i32 {
        self.map.read_i32(self.off)
    }

    /// Write the flag.
    pub fn set(&self, v: i32) {
        self.map.write_i32(self.off, v);
    }
}

/// Build the single-step tie for a mapping.
pub fn single_tie(map: &Arc<Mapping>) -> SingleTie {
    SingleTie::new(Arc::clone(map))
}

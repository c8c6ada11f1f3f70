//! Monitor-side facade: inspect the ring table, drive mailboxes and
//! watches, and reclaim rings whose owners died.
//!
//! One Monitor process is assumed. Reads of slot data are best-effort
//! snapshots; the Monitor refreshes rather than trusting any single read.

use std::path::Path;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::RingResult;
use crate::flags::{SignalTie, SingleTie, TraceTie};
use crate::global_area::GlobalArea;
use crate::layout::{RING_DEPTH, RING_PID, RING_SIGNAL, RING_TID, RING_TRACE};
use crate::mailbox::MonitorMailbox;
use crate::mapping::{Mapping, MappingInfo};
use crate::platform;
use crate::ring::{snapshot_at, Slot};
use crate::watch::MonitorWatches;

/// Monitor handle over one trace mapping.
pub struct Monitor {
    map: Arc<Mapping>,
}

impl Monitor {
    /// Attach to the mapping backing `path`.
    pub fn attach(path: impl AsRef<Path>) -> RingResult<Self> {
        Ok(Self {
            map: Mapping::attach(path)?,
        })
    }

    /// Wrap an already-open mapping (same-process tooling and tests).
    pub fn from_mapping(map: Arc<Mapping>) -> Self {
        Self { map }
    }

    /// The underlying mapping.
    pub fn mapping(&self) -> &Arc<Mapping> {
        &self.map
    }

    /// Summary of the mapping.
    pub fn info(&self) -> MappingInfo {
        self.map.info()
    }

    /// Summary as pretty JSON, for dashboards and dumps.
    pub fn info_json(&self) -> String {
        serde_json::to_string_pretty(&self.map.info())
            .unwrap_or_else(|_| "{}".to_string())
    }

    /// Read the shared single-step flag.
    pub fn single(&self) -> i32 {
        self.map.single()
    }

    /// Write the shared single-step flag.
    pub fn set_single(&self, v: i32) {
        self.map.set_single(v);
    }

    /// Tie object for the shared single-step flag.
    pub fn single_tie(&self) -> SingleTie {
        crate::flags::single_tie(&self.map)
    }

    /// View of ring `index`.
    ///
    /// # Panics
    /// Panics if `index` is outside the pool.
    pub fn ring(&self, index: usize) -> RingView {
        assert!(index < self.map.layout().max_buffers);
        RingView {
            off: self.map.layout().ring_off(index),
            map: Arc::clone(&self.map),
            index,
        }
    }

    /// Views of every allocated ring, lowest index first.
    pub fn live_rings(&self) -> Vec<RingView> {
        (0..self.map.layout().max_buffers)
            .filter(|&i| self.occupied(i))
            .map(|i| self.ring(i))
            .collect()
    }

    /// Global message area of the mapping.
    pub fn global(&self) -> GlobalArea<'_> {
        self.map.global()
    }

    /// Free every allocated ring whose owner process is no longer alive.
    ///
    /// Crashed applications never free their rings; this is the reclaim
    /// policy left to the Monitor. Returns the number reclaimed.
    pub fn reclaim_dead(&self) -> RingResult<usize> {
        let mut reclaimed = 0;
        for i in 0..self.map.layout().max_buffers {
            if !self.occupied(i) {
                continue;
            }
            let pid = self.map.read_i32(self.map.layout().ring_off(i) + RING_PID);
            if pid != 0 && !platform::is_process_alive(pid) {
                self.map.free_ring(i, None)?;
                reclaimed += 1;
            }
        }
        if reclaimed > 0 {
            tracing::info!(reclaimed, "reclaimed rings from dead owners");
        }
        Ok(reclaimed)
    }

    /// Free ring `index` regardless of owner.
    pub fn force_free(&self, index: usize) -> RingResult<()> {
        self.map.free_ring(index, None)
    }

    fn occupied(&self, i: usize) -> bool {
        self.map
            .atomic_u8(self.map.layout().free_map_byte(i))
            .load(Ordering::Acquire)
            == 0
    }
}

/// Read-mostly view of one ring for the Monitor.
pub struct RingView {
    map: Arc<Mapping>,
    index: usize,
    off: usize,
}

impl RingView {
    /// Ring index in the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Whether the ring is currently allocated.
    pub fn in_use(&self) -> bool {
        self.map
            .atomic_u8(self.map.layout().free_map_byte(self.index))
            .load(Ordering::Acquire)
            == 0
    }

    /// Owner process id.
    pub fn pid(&self) -> i32 {
        self.map.read_i32(self.off + RING_PID)
    }

    /// Owner thread id.
    pub fn tid(&self) -> i32 {
        self.map.read_i32(self.off + RING_TID)
    }

    /// Logical stack depth.
    pub fn depth(&self) -> i32 {
        self.map.read_i32(self.off + RING_DEPTH)
    }

    /// Per-thread trace flag.
    pub fn trace(&self) -> i32 {
        self.map.read_i32(self.off + RING_TRACE)
    }

    /// Set the per-thread trace flag.
    pub fn set_trace(&self, v: i32) {
        self.map.write_i32(self.off + RING_TRACE, v);
    }

    /// Per-thread signal flag.
    pub fn signal(&self) -> i32 {
        self.map.read_i32(self.off + RING_SIGNAL)
    }

    /// Set the per-thread signal flag.
    pub fn set_signal(&self, v: i32) {
        self.map.write_i32(self.off + RING_SIGNAL, v);
    }

    /// Best-effort snapshot of the ring's stack window, top first. Torn
    /// values are possible while the owner is recording; refresh instead of
    /// trusting one read.
    pub fn snapshot(&self) -> Vec<Slot> {
        snapshot_at(&self.map, self.off)
    }

    /// Monitor half of this ring's mailbox.
    pub fn mailbox(&self) -> MonitorMailbox {
        MonitorMailbox::new(Arc::clone(&self.map), self.off)
    }

    /// Monitor half of this ring's watch records.
    pub fn watches(&self) -> MonitorWatches {
        MonitorWatches::new(Arc::clone(&self.map), self.off)
    }

    /// Tie object for the trace flag.
    pub fn trace_tie(&self) -> TraceTie {
        TraceTie::new(Arc::clone(&self.map), self.off + RING_TRACE)
    }

    /// Tie object for the signal flag.
    pub fn signal_tie(&self) -> SignalTie {
        SignalTie::new(Arc::clone(&self.map), self.off + RING_SIGNAL)
    }
}

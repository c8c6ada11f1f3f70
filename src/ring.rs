//! Per-thread ring handle: the hot-path façade the debug hook works with.
//!
//! None of these operations take the file lock or block. Slot fields are
//! written only by the owning thread; the Monitor reads them as best-effort
//! snapshots and tolerates torn values.

use std::sync::Arc;

use crate::error::RingResult;
use crate::flags::{SignalTie, TraceTie};
use crate::layout::{
    RING_CURR_SLOT, RING_DEPTH, RING_SIGNAL, RING_TRACE, SLOT_LINE, SLOT_NAME, SLOT_TIMESTAMP,
};
use crate::mailbox::AutMailbox;
use crate::mapping::Mapping;
use crate::watch::AutWatches;

/// One recorded execution slot, read back in logical stack order.
#[derive(Debug, Clone, PartialEq)]
pub struct Slot {
    /// Subroutine name, truncated at recording time.
    pub subroutine: String,
    /// Line number within the subroutine.
    pub linenumber: i32,
    /// Caller-supplied timestamp.
    pub timestamp: f64,
}

struct RingInner {
    map: Arc<Mapping>,
    index: usize,
    off: usize,
    pid: i32,
    tid: i32,
}

/// Exclusive handle to one ring, owned by one application thread.
///
/// A detached handle (pool exhausted) turns every operation into a no-op so
/// the application keeps running without instrumentation.
pub struct RingHandle {
    inner: Option<RingInner>,
}

impl RingHandle {
    pub(crate) fn attached(map: Arc<Mapping>, index: usize, pid: i32, tid: i32) -> Self {
        let off = map.layout().ring_off(index);
        Self {
            inner: Some(RingInner {
                map,
                index,
                off,
                pid,
                tid,
            }),
        }
    }

    /// A handle bound to nothing; every operation is a no-op.
    pub fn detached() -> Self {
        Self { inner: None }
    }

    /// Whether this handle is the no-op variant.
    pub fn is_detached(&self) -> bool {
        self.inner.is_none()
    }

    /// Ring index in the pool, if attached.
    pub fn index(&self) -> Option<usize> {
        self.inner.as_ref().map(|r| r.index)
    }

    /// Owner process id recorded at allocation (0 when detached).
    pub fn pid(&self) -> i32 {
        self.inner.as_ref().map_or(0, |r| r.pid)
    }

    /// Owner thread id recorded at allocation (0 when detached).
    pub fn tid(&self) -> i32 {
        self.inner.as_ref().map_or(0, |r| r.tid)
    }

    /// Current logical stack depth.
    pub fn depth(&self) -> i32 {
        self.inner
            .as_ref()
            .map_or(0, |r| r.map.read_i32(r.off + RING_DEPTH))
    }

    /// Push a call frame: bump the depth, advance the top slot (wrapping
    /// over the oldest frame), and record the subroutine name truncated to
    /// the configured width. Line and timestamp wait for [`Self::record`].
    pub fn enter(&self, subroutine: &str) {
        let Some(r) = &self.inner else { return };
        let l = r.map.layout();

        let depth = r.map.read_i32(r.off + RING_DEPTH).saturating_add(1);
        r.map.write_i32(r.off + RING_DEPTH, depth);

        let mut curr = r.map.read_i32(r.off + RING_CURR_SLOT);
        if depth > 1 {
            curr = (curr + 1).rem_euclid(l.slots as i32);
            r.map.write_i32(r.off + RING_CURR_SLOT, curr);
        }

        let soff = l.slot_off(r.off, curr as usize);
        let name = subroutine.as_bytes();
        let n = name.len().min(l.slot_sz - 1);
        r.map.write_bytes(soff + SLOT_NAME, &name[..n]);
        r.map.write_bytes(soff + SLOT_NAME + n, &[0]);
        r.map.write_i32(soff + SLOT_LINE, 0);
        r.map.write_f64(soff + SLOT_TIMESTAMP, 0.0);
    }

    /// Pop a call frame. A leave with no matching enter is ignored.
    pub fn leave(&self) {
        let Some(r) = &self.inner else { return };
        let l = r.map.layout();

        let depth = r.map.read_i32(r.off + RING_DEPTH);
        if depth <= 0 {
            return;
        }
        r.map.write_i32(r.off + RING_DEPTH, depth - 1);
        if depth - 1 > 0 {
            let curr = r.map.read_i32(r.off + RING_CURR_SLOT);
            r.map
                .write_i32(r.off + RING_CURR_SLOT, (curr - 1).rem_euclid(l.slots as i32));
        }
    }

    /// Overwrite the current slot's line number and timestamp.
    pub fn record(&self, line: i32, timestamp: f64) {
        let Some(r) = &self.inner else { return };
        let l = r.map.layout();
        let curr = r.map.read_i32(r.off + RING_CURR_SLOT).rem_euclid(l.slots as i32);
        let soff = l.slot_off(r.off, curr as usize);
        r.map.write_i32(soff + SLOT_LINE, line);
        r.map.write_f64(soff + SLOT_TIMESTAMP, timestamp);
    }

    /// Read the per-thread trace flag.
    pub fn get_trace(&self) -> i32 {
        self.inner
            .as_ref()
            .map_or(0, |r| r.map.read_i32(r.off + RING_TRACE))
    }

    /// Write the per-thread trace flag.
    pub fn set_trace(&self, v: i32) {
        if let Some(r) = &self.inner {
            r.map.write_i32(r.off + RING_TRACE, v);
        }
    }

    /// Read the per-thread signal flag.
    pub fn get_signal(&self) -> i32 {
        self.inner
            .as_ref()
            .map_or(0, |r| r.map.read_i32(r.off + RING_SIGNAL))
    }

    /// Write the per-thread signal flag.
    pub fn set_signal(&self, v: i32) {
        if let Some(r) = &self.inner {
            r.map.write_i32(r.off + RING_SIGNAL, v);
        }
    }

    /// The `min(depth, slots)` most recent slots, top of stack first.
    pub fn snapshot(&self) -> Vec<Slot> {
        self.inner
            .as_ref()
            .map_or_else(Vec::new, |r| snapshot_at(&r.map, r.off))
    }

    /// Tie object for the trace flag, for the debug-hook collaborator.
    pub fn trace_tie(&self) -> Option<TraceTie> {
        self.inner
            .as_ref()
            .map(|r| TraceTie::new(Arc::clone(&r.map), r.off + RING_TRACE))
    }

    /// Tie object for the signal flag, for the debug-hook collaborator.
    pub fn signal_tie(&self) -> Option<SignalTie> {
        self.inner
            .as_ref()
            .map(|r| SignalTie::new(Arc::clone(&r.map), r.off + RING_SIGNAL))
    }

    /// Application-side half of this ring's mailbox.
    pub fn mailbox(&self) -> AutMailbox {
        AutMailbox::new(
            self.inner
                .as_ref()
                .map(|r| (Arc::clone(&r.map), r.off)),
        )
    }

    /// Application-side half of this ring's watch channel.
    pub fn watches(&self) -> AutWatches {
        AutWatches::new(
            self.inner
                .as_ref()
                .map(|r| (Arc::clone(&r.map), r.off)),
        )
    }

    /// Free the ring back to the pool.
    ///
    /// Fails with [`crate::RingError::NotOwner`] when the ring's recorded
    /// owner no longer matches this handle (a Monitor reclaimed it and
    /// someone else allocated it). Releasing a detached handle succeeds.
    pub fn release(self) -> RingResult<()> {
        match self.inner {
            None => Ok(()),
            Some(r) => r.map.free_ring(r.index, Some((r.pid, r.tid))),
        }
    }
}

/// Snapshot a ring's slots in logical stack order from its record offset.
pub(crate) fn snapshot_at(map: &Mapping, ring_off: usize) -> Vec<Slot> {
    let l = map.layout();
    let depth = map.read_i32(ring_off + RING_DEPTH);
    if depth <= 0 {
        return Vec::new();
    }
    let k = (depth as usize).min(l.slots);
    let curr = map.read_i32(ring_off + RING_CURR_SLOT).rem_euclid(l.slots as i32) as usize;

    let mut out = Vec::with_capacity(k);
    for j in 0..k {
        let s = (curr + l.slots - j) % l.slots;
        let soff = l.slot_off(ring_off, s);
        let name = map.read_bytes(soff + SLOT_NAME, l.slot_sz);
        let end = name.iter().position(|&b| b == 0).unwrap_or(name.len());
        out.push(Slot {
            subroutine: String::from_utf8_lossy(&name[..end]).into_owned(),
            linenumber: map.read_i32(soff + SLOT_LINE),
            timestamp: map.read_f64(soff + SLOT_TIMESTAMP),
        });
    }
    out
}

//! Binary layout of the trace mapping.
//!
//! The mapping is one contiguous region: fixed header, global message
//! buffer, free-map, then the ring array. All multi-byte fields are host
//! byte order with host alignment; the file is not portable across
//! architectures. Offsets below the variable-size sections are fixed
//! constants; everything downstream is computed once into a [`MapLayout`]
//! and read through its accessors.

use crate::config::RingConfig;
use static_assertions::const_assert_eq;

/// Magic bytes at the start of every mapping: `"SHMTRCE\0"`.
pub const MAGIC: [u8; 8] = *b"SHMTRCE\0";

// ─── Fixed header offsets ───────────────────────────────────────────
//
// Header layout (48 bytes):
//   [0..8]   magic:           [u8; 8]
//   [8..12]  single:          i32   global single-step request
//   [12..16] msgarea_sz:      i32
//   [16..20] max_buffers:     i32
//   [20..24] slots:           i32
//   [24..28] slot_sz:         i32
//   [28..32] stop_on_create:  i32
//   [32..36] trace_on_create: i32
//   [36..40] global_sz:       i32
//   [40..44] globmsg_sz:      i32   current logical global length
//   [44..48] _pad:            keeps the tail 8-aligned
//
// Then: global_buffer[global_sz], free_map[max_buffers] (1 = free,
// 0 = in use), padding to 8, rings[max_buffers].

/// Offset of the header magic.
pub const OFF_MAGIC: usize = 0;
/// Offset of the shared single-step flag.
pub const OFF_SINGLE: usize = 8;
/// Offset of the mailbox-area size field.
pub const OFF_MSGAREA_SZ: usize = 12;
/// Offset of the ring-pool size field.
pub const OFF_MAX_BUFFERS: usize = 16;
/// Offset of the slots-per-ring field.
pub const OFF_SLOTS: usize = 20;
/// Offset of the subroutine-name size field.
pub const OFF_SLOT_SZ: usize = 24;
/// Offset of the stop-on-create policy flag.
pub const OFF_STOP_ON_CREATE: usize = 28;
/// Offset of the trace-on-create policy flag.
pub const OFF_TRACE_ON_CREATE: usize = 32;
/// Offset of the global-buffer capacity field.
pub const OFF_GLOBAL_SZ: usize = 36;
/// Offset of the global-buffer logical length field.
pub const OFF_GLOBMSG_SZ: usize = 40;
/// Size of the fixed header; the global buffer starts here.
pub const HEADER_FIXED: usize = 48;

const_assert_eq!(HEADER_FIXED % 8, 0);

// ─── Ring-record relative offsets ───────────────────────────────────
//
// Ring record (stride computed per configuration):
//   [0..4]   pid        [4..8]   tid
//   [8..12]  curr_slot  [12..16] depth
//   [16..20] trace      [20..24] signal
//   [24..28] baseoff    [28..32] cmdready
//   [32..36] command    [36..40] msglen
//   [40..]   watches[4], msgarea[msgarea_sz], pad to 8, slots[slots]

/// Owner process id.
pub const RING_PID: usize = 0;
/// Owner thread id.
pub const RING_TID: usize = 4;
/// Index of the top slot.
pub const RING_CURR_SLOT: usize = 8;
/// Logical stack depth (may exceed the slot count).
pub const RING_DEPTH: usize = 12;
/// Per-thread trace flag.
pub const RING_TRACE: usize = 16;
/// Per-thread signal flag.
pub const RING_SIGNAL: usize = 20;
/// Byte distance from this record back to the mapping base.
pub const RING_BASEOFF: usize = 24;
/// Mailbox state word.
pub const RING_CMDREADY: usize = 28;
/// 4-byte command tag.
pub const RING_COMMAND: usize = 32;
/// Valid bytes in the mailbox message area.
pub const RING_MSGLEN: usize = 36;
/// First watch record.
pub const RING_WATCHES: usize = 40;

/// Watch records per ring.
pub const WATCH_COUNT: usize = 4;

// ─── Watch-record relative offsets (784 bytes) ──────────────────────

/// Watch occupancy state: 0 free, 1 armed, -2 releasing.
pub const WATCH_INUSE: usize = 0;
/// Valid bytes in the expression area.
pub const WATCH_EXPRLEN: usize = 4;
/// Expression bytes.
pub const WATCH_EXPR: usize = 8;
/// Expression capacity.
pub const WATCH_EXPR_MAX: usize = 256;
/// Result publication flag: 0 pending, 1 ready.
pub const WATCH_RESREADY: usize = 264;
/// Result length; negative denotes evaluation failure.
pub const WATCH_RESLEN: usize = 268;
/// Result bytes.
pub const WATCH_RESULT: usize = 272;
/// Result capacity.
pub const WATCH_RESULT_MAX: usize = 512;
/// Size of one watch record.
pub const WATCH_SIZE: usize = 784;

const_assert_eq!(WATCH_RESULT + WATCH_RESULT_MAX, WATCH_SIZE);
const_assert_eq!(WATCH_SIZE % 8, 0);
const_assert_eq!((RING_WATCHES + WATCH_COUNT * WATCH_SIZE) % 8, 0);

// ─── Slot relative offsets ──────────────────────────────────────────

/// Line number within the current subroutine.
pub const SLOT_LINE: usize = 0;
/// Timestamp; 8-aligned within the slot.
pub const SLOT_TIMESTAMP: usize = 8;
/// NUL-terminated subroutine name.
pub const SLOT_NAME: usize = 16;

/// Round `n` up to the platform alignment of the slot timestamp.
pub(crate) const fn align8(n: usize) -> usize {
    (n + 7) & !7
}

/// Computed offsets for one mapping configuration.
///
/// Built once at create/attach; every other module reads and writes the
/// region through these accessors. Sizes are fixed for the lifetime of the
/// mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MapLayout {
    /// Rings in the pool.
    pub max_buffers: usize,
    /// Slots per ring.
    pub slots: usize,
    /// Subroutine-name bytes per slot.
    pub slot_sz: usize,
    /// Mailbox message area bytes per ring.
    pub msgarea_sz: usize,
    /// Global buffer capacity.
    pub global_sz: usize,
    /// Offset of the global buffer.
    pub global_off: usize,
    /// Offset of the free-map.
    pub free_map_off: usize,
    /// Offset of ring 0; 8-aligned.
    pub rings_off: usize,
    /// Byte stride between consecutive rings; multiple of 8.
    pub ring_stride: usize,
    /// Ring-relative offset of the mailbox message area.
    pub msgarea_off: usize,
    /// Ring-relative offset of slot 0; multiple of 8.
    pub slots_off: usize,
    /// Byte stride between consecutive slots; multiple of 8 so every
    /// timestamp stays naturally aligned regardless of `slot_sz`.
    pub slot_stride: usize,
    /// Total mapping size.
    pub total_size: usize,
}

impl MapLayout {
    /// Compute the layout for a configuration.
    ///
    /// Walks the region front to back, aligning each section as it goes,
    /// so a `slot_sz` that would misalign the next timestamp picks up
    /// padding instead.
    pub fn new(cfg: &RingConfig) -> Self {
        Self::from_sizes(
            cfg.buffers,
            cfg.slots,
            cfg.slot_sz,
            cfg.msg_sz,
            cfg.global_sz,
        )
    }

    /// Compute the layout from the five raw size parameters.
    pub fn from_sizes(
        max_buffers: usize,
        slots: usize,
        slot_sz: usize,
        msgarea_sz: usize,
        global_sz: usize,
    ) -> Self {
        let global_off = HEADER_FIXED;
        let free_map_off = global_off + global_sz;
        let rings_off = align8(free_map_off + max_buffers);

        let msgarea_off = RING_WATCHES + WATCH_COUNT * WATCH_SIZE;
        let slots_off = align8(msgarea_off + msgarea_sz);
        let slot_stride = align8(SLOT_NAME + slot_sz);
        let ring_stride = align8(slots_off + slots * slot_stride);

        Self {
            max_buffers,
            slots,
            slot_sz,
            msgarea_sz,
            global_sz,
            global_off,
            free_map_off,
            rings_off,
            ring_stride,
            msgarea_off,
            slots_off,
            slot_stride,
            total_size: rings_off + max_buffers * ring_stride,
        }
    }

    /// Offset of ring record `i`.
    #[inline]
    pub fn ring_off(&self, i: usize) -> usize {
        debug_assert!(i < self.max_buffers);
        self.rings_off + i * self.ring_stride
    }

    /// Offset of free-map byte `i`.
    #[inline]
    pub fn free_map_byte(&self, i: usize) -> usize {
        debug_assert!(i < self.max_buffers);
        self.free_map_off + i
    }

    /// Offset of watch record `w` within the ring at `ring_off`.
    #[inline]
    pub fn watch_off(&self, ring_off: usize, w: usize) -> usize {
        debug_assert!(w < WATCH_COUNT);
        ring_off + RING_WATCHES + w * WATCH_SIZE
    }

    /// Offset of slot `s` within the ring at `ring_off`.
    #[inline]
    pub fn slot_off(&self, ring_off: usize, s: usize) -> usize {
        debug_assert!(s < self.slots);
        ring_off + self.slots_off + s * self.slot_stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg(buffers: usize, slots: usize, slot_sz: usize, msg: usize, global: usize) -> RingConfig {
        RingConfig {
            buffers,
            slots,
            slot_sz,
            msg_sz: msg,
            global_sz: global,
            ..RingConfig::default()
        }
    }

    #[test]
    fn total_size_is_sum_of_sections() {
        let l = MapLayout::new(&cfg(3, 4, 64, 64, 1024));
        assert_eq!(l.global_off, HEADER_FIXED);
        assert_eq!(l.free_map_off, HEADER_FIXED + 1024);
        assert_eq!(l.rings_off, align8(l.free_map_off + 3));
        assert_eq!(l.total_size, l.rings_off + 3 * l.ring_stride);
    }

    #[test]
    fn every_ring_offset_lies_within_mapping() {
        let l = MapLayout::new(&cfg(20, 10, 200, 256, 16384));
        for i in 0..l.max_buffers {
            let r = l.ring_off(i);
            assert!(r + l.ring_stride <= l.total_size);
            for w in 0..WATCH_COUNT {
                assert!(l.watch_off(r, w) + WATCH_SIZE <= r + l.msgarea_off);
            }
            for s in 0..l.slots {
                assert!(l.slot_off(r, s) + l.slot_stride <= r + l.ring_stride);
            }
        }
    }

    #[test]
    fn timestamps_aligned_for_awkward_slot_sz() {
        // 3 forces padding in the slot stride; 17 in the msgarea; both must
        // keep slot timestamps 8-aligned.
        for slot_sz in [3usize, 17, 199, 200] {
            let l = MapLayout::new(&cfg(5, 7, slot_sz, 61, 100));
            assert_eq!(l.rings_off % 8, 0);
            assert_eq!(l.ring_stride % 8, 0);
            for i in 0..5 {
                let r = l.ring_off(i);
                for s in 0..7 {
                    assert_eq!((l.slot_off(r, s) + SLOT_TIMESTAMP) % 8, 0);
                }
            }
        }
    }

    #[test]
    fn slot_stride_covers_name_field() {
        let l = MapLayout::new(&cfg(1, 1, 200, 64, 64));
        assert!(l.slot_stride >= SLOT_NAME + 200);
        assert_eq!(l.slot_stride, align8(SLOT_NAME + 200));
    }

    #[test]
    fn watch_record_matches_documented_size() {
        assert_eq!(
            WATCH_RESREADY,
            WATCH_EXPR + WATCH_EXPR_MAX
        );
        assert_eq!(WATCH_SIZE, 784);
    }
}

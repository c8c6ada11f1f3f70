//! Backing-file mapping, the two-level global lock, and ring allocation.
//!
//! The first process to open the backing file sizes it and writes the
//! header under the file lock; later processes attach and validate. All
//! free-map and header-initialization traffic goes through
//! [`Mapping::with_global_lock`], which takes a process-local mutex and then
//! a blocking exclusive `flock` on the backing file, in that order, so
//! threads of one process cannot race each other while their process holds
//! the file lock.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI32, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use memmap2::MmapMut;
use nix::fcntl::{Flock, FlockArg};
use serde::Serialize;

use crate::config::RingConfig;
use crate::error::{RingError, RingResult};
use crate::global_area::GlobalArea;
use crate::layout::{self, MapLayout, MAGIC};
use crate::platform;
use crate::ring::RingHandle;

/// A process's view of one trace mapping.
///
/// Shared between threads behind an [`Arc`]; every accessor goes through
/// the cached base pointer, never through a reborrow of the inner
/// [`MmapMut`]. Dropping the last clone unmaps; the backing file is kept
/// for post-mortem inspection unless [`Mapping::unlink`] is called.
#[derive(Debug)]
pub struct Mapping {
    path: PathBuf,
    layout: MapLayout,
    base: *mut u8,
    // Keeps the region mapped; accessed only through `base` after init.
    _mmap: MmapMut,
    // Intra-process half of the global lock; taken before the flock.
    thread_lock: Mutex<()>,
}

// SAFETY: the base pointer targets a MAP_SHARED region that outlives the
// struct, and all access goes through atomics or single-owner protocols
// defined by the mapping format; cross-thread use is the design.
unsafe impl Send for Mapping {}
unsafe impl Sync for Mapping {}

/// Serializable summary of a mapping, for Monitor-side tooling.
#[derive(Debug, Clone, Serialize)]
pub struct MappingInfo {
    /// Backing file path.
    pub path: PathBuf,
    /// Rings in the pool.
    pub buffers: usize,
    /// Slots per ring.
    pub slots: usize,
    /// Subroutine-name bytes per slot.
    pub slot_sz: usize,
    /// Mailbox area bytes per ring.
    pub msg_sz: usize,
    /// Global buffer capacity.
    pub global_sz: usize,
    /// Total mapped bytes.
    pub total_size: usize,
    /// Rings currently allocated.
    pub rings_in_use: usize,
    /// Logical length of the global message buffer.
    pub globmsg_len: usize,
}

impl Mapping {
    /// Create the mapping at `path`, or attach if the file is already
    /// non-empty.
    ///
    /// On creation the header is written and the free-map set to all-free
    /// under the file lock. On an existing file, the on-file sizes must
    /// match `cfg` exactly or the call fails with
    /// [`RingError::ConfigMismatch`].
    pub fn create(path: impl AsRef<Path>, cfg: &RingConfig) -> RingResult<Arc<Self>> {
        cfg.validate()?;
        let path = path.as_ref();
        let file = platform::open_backing_file(path)?;

        // Hold the file lock across the size check and initialization so a
        // second creator serializes behind us rather than attaching to a
        // half-written header.
        let lock_file = platform::open_backing_file(path)?;
        let guard = Flock::lock(lock_file, FlockArg::LockExclusive)
            .map_err(|(_, e)| RingError::Os { op: "flock", source: e })?;

        let len = file
            .metadata()
            .map_err(|e| RingError::fs(path, e))?
            .len();

        let mapping = if len == 0 {
            let layout = MapLayout::new(cfg);
            nix::unistd::ftruncate(&file, layout.total_size as libc::off_t)
                .map_err(|e| RingError::Os {
                    op: "ftruncate",
                    source: e,
                })?;
            let mmap = platform::map_file(path, &file)?;
            let mapping = Self::from_parts(path, layout, mmap);
            mapping.init_region(cfg);
            tracing::info!(path = %path.display(), size = layout.total_size, "trace mapping created");
            mapping
        } else {
            let mmap = platform::map_file(path, &file)?;
            let mapping = Self::validated(path, mmap, len)?;
            mapping.check_config(cfg)?;
            tracing::debug!(path = %path.display(), "trace mapping attached via create");
            mapping
        };

        drop(guard);
        Ok(Arc::new(mapping))
    }

    /// Create the mapping at the path named by the configuration.
    pub fn create_from_config(cfg: &RingConfig) -> RingResult<Arc<Self>> {
        Self::create(cfg.file.clone(), cfg)
    }

    /// Attach to an existing mapping and validate its header.
    pub fn attach(path: impl AsRef<Path>) -> RingResult<Arc<Self>> {
        let path = path.as_ref();
        let file = platform::open_existing_file(path)?;

        let lock_file = platform::open_existing_file(path)?;
        let guard = Flock::lock(lock_file, FlockArg::LockExclusive)
            .map_err(|(_, e)| RingError::Os { op: "flock", source: e })?;

        let len = file
            .metadata()
            .map_err(|e| RingError::fs(path, e))?
            .len();
        let mmap = platform::map_file(path, &file)?;
        let mapping = Self::validated(path, mmap, len)?;

        drop(guard);
        tracing::debug!(path = %path.display(), "trace mapping attached");
        Ok(Arc::new(mapping))
    }

    fn from_parts(path: &Path, layout: MapLayout, mut mmap: MmapMut) -> Self {
        let base = mmap.as_mut_ptr();
        Self {
            path: path.to_path_buf(),
            layout,
            base,
            _mmap: mmap,
            thread_lock: Mutex::new(()),
        }
    }

    /// Build a mapping over an existing file, checking magic and that the
    /// header sizes reproduce the file length.
    fn validated(path: &Path, mut mmap: MmapMut, file_len: u64) -> RingResult<Self> {
        if (file_len as usize) < layout::HEADER_FIXED {
            return Err(RingError::ConfigMismatch {
                field: "file length",
                expected: format!("at least {}", layout::HEADER_FIXED),
                actual: file_len.to_string(),
            });
        }
        let base = mmap.as_mut_ptr();
        let magic = unsafe { std::slice::from_raw_parts(base, MAGIC.len()) };
        if magic != MAGIC {
            return Err(RingError::ConfigMismatch {
                field: "magic",
                expected: format!("{MAGIC:?}"),
                actual: format!("{magic:?}"),
            });
        }

        let read = |off: usize| -> usize {
            unsafe { (*(base.add(off) as *const AtomicI32)).load(Ordering::Relaxed) as usize }
        };
        let layout = MapLayout::from_sizes(
            read(layout::OFF_MAX_BUFFERS),
            read(layout::OFF_SLOTS),
            read(layout::OFF_SLOT_SZ),
            read(layout::OFF_MSGAREA_SZ),
            read(layout::OFF_GLOBAL_SZ),
        );
        if layout.total_size as u64 != file_len {
            return Err(RingError::ConfigMismatch {
                field: "file length",
                expected: layout.total_size.to_string(),
                actual: file_len.to_string(),
            });
        }
        Ok(Self::from_parts(path, layout, mmap))
    }

    /// Write the header and mark every ring free. Caller holds the file lock.
    fn init_region(&self, cfg: &RingConfig) {
        self.write_bytes(layout::OFF_MAGIC, &MAGIC);
        self.write_i32(layout::OFF_SINGLE, 0);
        self.write_i32(layout::OFF_MSGAREA_SZ, cfg.msg_sz as i32);
        self.write_i32(layout::OFF_MAX_BUFFERS, cfg.buffers as i32);
        self.write_i32(layout::OFF_SLOTS, cfg.slots as i32);
        self.write_i32(layout::OFF_SLOT_SZ, cfg.slot_sz as i32);
        self.write_i32(layout::OFF_STOP_ON_CREATE, cfg.stop_on_create);
        self.write_i32(layout::OFF_TRACE_ON_CREATE, cfg.trace_on_create);
        self.write_i32(layout::OFF_GLOBAL_SZ, cfg.global_sz as i32);
        self.write_i32(layout::OFF_GLOBMSG_SZ, 0);

        for i in 0..self.layout.max_buffers {
            let off = self.layout.ring_off(i);
            self.write_i32(off + layout::RING_BASEOFF, off as i32);
            // 1 = free.
            self.atomic_u8(self.layout.free_map_byte(i))
                .store(1, Ordering::Release);
        }
    }

    /// Compare the attached header sizes against a requested configuration.
    fn check_config(&self, cfg: &RingConfig) -> RingResult<()> {
        let pairs: [(&'static str, usize, usize); 5] = [
            ("buffers", cfg.buffers, self.layout.max_buffers),
            ("slots", cfg.slots, self.layout.slots),
            ("slot_sz", cfg.slot_sz, self.layout.slot_sz),
            ("msg_sz", cfg.msg_sz, self.layout.msgarea_sz),
            ("global_sz", cfg.global_sz, self.layout.global_sz),
        ];
        for (field, expected, actual) in pairs {
            if expected != actual {
                return Err(RingError::ConfigMismatch {
                    field,
                    expected: expected.to_string(),
                    actual: actual.to_string(),
                });
            }
        }
        Ok(())
    }

    /// Run `f` under the global lock.
    ///
    /// Takes the process-local mutex, then a blocking exclusive `flock` on a
    /// fresh descriptor for the backing file. Both are released when the
    /// guards drop, on every exit path.
    pub fn with_global_lock<R>(&self, f: impl FnOnce() -> R) -> RingResult<R> {
        let _thread = self
            .thread_lock
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let file = platform::open_existing_file(&self.path)?;
        let guard = Flock::lock(file, FlockArg::LockExclusive)
            .map_err(|(_, e)| RingError::Os { op: "flock", source: e })?;
        let out = f();
        drop(guard);
        Ok(out)
    }

    /// Allocate the lowest-indexed free ring for the calling thread.
    ///
    /// Initializes the ring's identity, stack state, policy flags, mailbox
    /// and watch records under the global lock. Fails with
    /// [`RingError::Exhausted`] without mutating the free-map when the pool
    /// is full; callers must not block on that.
    pub fn allocate(self: &Arc<Self>) -> RingResult<RingHandle> {
        let pid = platform::current_pid();
        let tid = platform::current_tid();
        let trace0 = self.read_i32(layout::OFF_TRACE_ON_CREATE);
        let signal0 = self.read_i32(layout::OFF_STOP_ON_CREATE);

        let found = self.with_global_lock(|| {
            for i in 0..self.layout.max_buffers {
                let fm = self.atomic_u8(self.layout.free_map_byte(i));
                if fm.load(Ordering::Acquire) != 1 {
                    continue;
                }
                let off = self.layout.ring_off(i);
                self.write_i32(off + layout::RING_PID, pid);
                self.write_i32(off + layout::RING_TID, tid);
                self.write_i32(off + layout::RING_CURR_SLOT, 0);
                self.write_i32(off + layout::RING_DEPTH, 0);
                self.write_i32(off + layout::RING_TRACE, trace0);
                self.write_i32(off + layout::RING_SIGNAL, signal0);
                self.write_i32(off + layout::RING_BASEOFF, off as i32);
                self.atomic_i32(off + layout::RING_CMDREADY)
                    .store(0, Ordering::Relaxed);
                self.write_bytes(off + layout::RING_COMMAND, &[0; 4]);
                self.write_i32(off + layout::RING_MSGLEN, 0);
                for w in 0..layout::WATCH_COUNT {
                    let woff = self.layout.watch_off(off, w);
                    self.atomic_i32(woff + layout::WATCH_INUSE)
                        .store(0, Ordering::Relaxed);
                    self.write_i32(woff + layout::WATCH_EXPRLEN, 0);
                    self.atomic_i32(woff + layout::WATCH_RESREADY)
                        .store(0, Ordering::Relaxed);
                    self.write_i32(woff + layout::WATCH_RESLEN, 0);
                }
                fm.store(0, Ordering::Release);
                return Some(i);
            }
            None
        })?;

        match found {
            Some(i) => {
                tracing::debug!(index = i, pid, tid, "ring allocated");
                Ok(RingHandle::attached(Arc::clone(self), i, pid, tid))
            }
            None => Err(RingError::Exhausted),
        }
    }

    /// Allocate, or return a detached no-op handle when the pool is
    /// exhausted so the caller keeps running uninstrumented.
    pub fn allocate_or_detached(self: &Arc<Self>) -> RingHandle {
        self.allocate().unwrap_or_else(|_| RingHandle::detached())
    }

    /// Free ring `index`, optionally verifying the recorded owner.
    ///
    /// Freeing an already-free ring is a successful no-op.
    pub(crate) fn free_ring(&self, index: usize, owner: Option<(i32, i32)>) -> RingResult<()> {
        if index >= self.layout.max_buffers {
            return Err(RingError::NotOwner { index });
        }
        let res = self.with_global_lock(|| {
            let fm = self.atomic_u8(self.layout.free_map_byte(index));
            if fm.load(Ordering::Acquire) == 1 {
                return Ok(());
            }
            let off = self.layout.ring_off(index);
            if let Some((pid, tid)) = owner {
                if self.read_i32(off + layout::RING_PID) != pid
                    || self.read_i32(off + layout::RING_TID) != tid
                {
                    return Err(RingError::NotOwner { index });
                }
            }
            self.write_i32(off + layout::RING_PID, 0);
            self.write_i32(off + layout::RING_TID, 0);
            fm.store(1, Ordering::Release);
            Ok(())
        })?;
        if res.is_ok() {
            tracing::debug!(index, "ring freed");
        }
        res
    }

    /// Read the shared single-step flag.
    pub fn single(&self) -> i32 {
        self.read_i32(layout::OFF_SINGLE)
    }

    /// Set the shared single-step flag. Monitor-side only by policy; the
    /// application under test must not write it.
    pub fn set_single(&self, v: i32) {
        self.write_i32(layout::OFF_SINGLE, v);
    }

    /// View of the global message area.
    pub fn global(&self) -> GlobalArea<'_> {
        GlobalArea::new(self)
    }

    /// Backing file path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Computed layout of this mapping.
    pub fn layout(&self) -> &MapLayout {
        &self.layout
    }

    /// Summarize the mapping for tooling.
    pub fn info(&self) -> MappingInfo {
        let rings_in_use = (0..self.layout.max_buffers)
            .filter(|&i| {
                self.atomic_u8(self.layout.free_map_byte(i))
                    .load(Ordering::Acquire)
                    == 0
            })
            .count();
        MappingInfo {
            path: self.path.clone(),
            buffers: self.layout.max_buffers,
            slots: self.layout.slots,
            slot_sz: self.layout.slot_sz,
            msg_sz: self.layout.msgarea_sz,
            global_sz: self.layout.global_sz,
            total_size: self.layout.total_size,
            rings_in_use,
            globmsg_len: self.read_i32(layout::OFF_GLOBMSG_SZ).max(0) as usize,
        }
    }

    /// Remove the backing file. The mapping stays usable by current holders
    /// until dropped; new attaches will no longer find it.
    pub fn unlink(&self) -> RingResult<()> {
        std::fs::remove_file(&self.path).map_err(|e| RingError::fs(&self.path, e))?;
        tracing::info!(path = %self.path.display(), "trace mapping unlinked");
        Ok(())
    }

    // ─── Raw field access ───────────────────────────────────────────
    //
    // Everything below is the single funnel for region traffic. i32 fields
    // are read and written through atomic views so cross-process access
    // stays well-defined; byte ranges and timestamps are owner-written and
    // may be observed torn, which readers tolerate.

    #[inline]
    pub(crate) fn atomic_i32(&self, off: usize) -> &AtomicI32 {
        debug_assert!(off % 4 == 0 && off + 4 <= self.layout.total_size);
        // SAFETY: in-bounds, 4-aligned, and the region lives as long as self.
        unsafe { &*(self.base.add(off) as *const AtomicI32) }
    }

    #[inline]
    pub(crate) fn atomic_u8(&self, off: usize) -> &AtomicU8 {
        debug_assert!(off < self.layout.total_size);
        // SAFETY: in-bounds; the region lives as long as self.
        unsafe { &*(self.base.add(off) as *const AtomicU8) }
    }

    #[inline]
    pub(crate) fn read_i32(&self, off: usize) -> i32 {
        self.atomic_i32(off).load(Ordering::Relaxed)
    }

    #[inline]
    pub(crate) fn write_i32(&self, off: usize, v: i32) {
        self.atomic_i32(off).store(v, Ordering::Relaxed);
    }

    #[inline]
    pub(crate) fn read_f64(&self, off: usize) -> f64 {
        debug_assert!(off % 8 == 0 && off + 8 <= self.layout.total_size);
        // SAFETY: in-bounds and 8-aligned by layout construction.
        unsafe { std::ptr::read_volatile(self.base.add(off) as *const f64) }
    }

    #[inline]
    pub(crate) fn write_f64(&self, off: usize, v: f64) {
        debug_assert!(off % 8 == 0 && off + 8 <= self.layout.total_size);
        // SAFETY: in-bounds and 8-aligned by layout construction.
        unsafe { std::ptr::write_volatile(self.base.add(off) as *mut f64, v) }
    }

    pub(crate) fn read_bytes(&self, off: usize, len: usize) -> Vec<u8> {
        debug_assert!(off + len <= self.layout.total_size);
        let mut out = vec![0u8; len];
        // SAFETY: in-bounds; source may be concurrently written, torn data
        // is tolerated by all callers.
        unsafe {
            std::ptr::copy_nonoverlapping(self.base.add(off), out.as_mut_ptr(), len);
        }
        out
    }

    pub(crate) fn write_bytes(&self, off: usize, src: &[u8]) {
        debug_assert!(off + src.len() <= self.layout.total_size);
        // SAFETY: in-bounds; single-owner fields per the mapping protocol.
        unsafe {
            std::ptr::copy_nonoverlapping(src.as_ptr(), self.base.add(off), src.len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RingError;

    fn test_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!("shm_trace_map_{}_{}", tag, std::process::id()))
    }

    fn small_cfg(path: &Path) -> RingConfig {
        RingConfig {
            buffers: 3,
            slots: 4,
            slot_sz: 64,
            msg_sz: 64,
            global_sz: 1024,
            file: path.to_path_buf(),
            ..RingConfig::default()
        }
    }

    #[test]
    fn create_then_attach_roundtrip() {
        let path = test_path("roundtrip");
        let _ = std::fs::remove_file(&path);
        let cfg = small_cfg(&path);

        let m = Mapping::create(&path, &cfg).unwrap();
        assert_eq!(m.layout().max_buffers, 3);

        let a = Mapping::attach(&path).unwrap();
        assert_eq!(a.layout(), m.layout());
        assert_eq!(a.single(), 0);

        m.unlink().unwrap();
    }

    #[test]
    fn create_on_existing_checks_sizes() {
        let path = test_path("mismatch");
        let _ = std::fs::remove_file(&path);
        let cfg = small_cfg(&path);
        let _m = Mapping::create(&path, &cfg).unwrap();

        let other = RingConfig {
            slots: 9,
            ..small_cfg(&path)
        };
        let err = Mapping::create(&path, &other).unwrap_err();
        assert!(matches!(
            err,
            RingError::ConfigMismatch { field: "slots", .. }
        ));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn attach_rejects_foreign_file() {
        let path = test_path("foreign");
        std::fs::write(&path, b"definitely not a trace mapping header").unwrap();
        let err = Mapping::attach(&path).unwrap_err();
        assert!(matches!(err, RingError::ConfigMismatch { .. }));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn attach_missing_file_is_filesystem_error() {
        let path = test_path("missing");
        let _ = std::fs::remove_file(&path);
        assert!(matches!(
            Mapping::attach(&path),
            Err(RingError::FileSystem { .. })
        ));
    }

    #[test]
    fn allocate_initializes_and_free_is_idempotent() {
        let path = test_path("allocfree");
        let _ = std::fs::remove_file(&path);
        let m = Mapping::create(&path, &small_cfg(&path)).unwrap();

        let h = m.allocate().unwrap();
        assert_eq!(h.index(), Some(0));
        assert_eq!(h.pid(), platform::current_pid());
        assert_eq!(h.depth(), 0);
        assert_eq!(m.info().rings_in_use, 1);

        m.free_ring(0, None).unwrap();
        m.free_ring(0, None).unwrap();
        assert_eq!(m.info().rings_in_use, 0);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn exhausted_does_not_mutate_free_map() {
        let path = test_path("exhaust");
        let _ = std::fs::remove_file(&path);
        let cfg = RingConfig {
            buffers: 1,
            ..small_cfg(&path)
        };
        let m = Mapping::create(&path, &cfg).unwrap();

        let _h = m.allocate().unwrap();
        assert!(matches!(m.allocate(), Err(RingError::Exhausted)));
        assert_eq!(m.info().rings_in_use, 1);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn policy_flags_copied_into_new_rings() {
        let path = test_path("policy");
        let _ = std::fs::remove_file(&path);
        let cfg = RingConfig {
            stop_on_create: 1,
            trace_on_create: 2,
            ..small_cfg(&path)
        };
        let m = Mapping::create(&path, &cfg).unwrap();
        let h = m.allocate().unwrap();
        assert_eq!(h.get_signal(), 1);
        assert_eq!(h.get_trace(), 2);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn lowest_free_index_wins() {
        let path = test_path("lowest");
        let _ = std::fs::remove_file(&path);
        let m = Mapping::create(&path, &small_cfg(&path)).unwrap();

        let h0 = m.allocate().unwrap();
        let _h1 = m.allocate().unwrap();
        h0.release().unwrap();
        let h2 = m.allocate().unwrap();
        assert_eq!(h2.index(), Some(0));

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn info_serializes_to_json() {
        let path = test_path("info");
        let _ = std::fs::remove_file(&path);
        let m = Mapping::create(&path, &small_cfg(&path)).unwrap();
        let json = serde_json::to_string(&m.info()).unwrap();
        assert!(json.contains("\"buffers\":3"));
        let _ = std::fs::remove_file(&path);
    }
}

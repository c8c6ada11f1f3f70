//! Per-ring watch-expression channel.
//!
//! Four fixed records per ring, each a small state machine over
//! (`inuse`, `resready`):
//!
//! | state     | (inuse, resready) | transition owner |
//! |-----------|-------------------|------------------|
//! | Free      | (0, 0)            | —                |
//! | Armed     | (1, 0)            | Monitor          |
//! | Resolved  | (1, 1)            | application      |
//! | Releasing | (-2, _)           | Monitor          |
//!
//! The Monitor arms a slot with an expression; the application thread
//! evaluates it opportunistically (it should when single-stepping or
//! tracing, and may coalesce otherwise) and publishes the result; the
//! Monitor reads, re-arms for another evaluation, or releases the slot.
//! Publication stores use release ordering, paired reads use acquire.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{RingError, RingResult};
use crate::layout::{
    WATCH_COUNT, WATCH_EXPR, WATCH_EXPRLEN, WATCH_EXPR_MAX, WATCH_INUSE, WATCH_RESLEN,
    WATCH_RESREADY, WATCH_RESULT, WATCH_RESULT_MAX,
};
use crate::mapping::Mapping;

/// `inuse` value for an empty record.
pub const WATCH_FREE: i32 = 0;
/// `inuse` value for an armed or resolved record.
pub const WATCH_ARMED: i32 = 1;
/// `inuse` value requesting the application to vacate the record.
pub const WATCH_RELEASING: i32 = -2;

/// Error text published when an evaluator reports failure with no message.
const EVAL_FAILED: &[u8] = b"evaluation failed";

/// Observable state of one watch record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchState {
    /// Record is empty and may be armed.
    Free,
    /// Expression armed, result pending.
    Armed,
    /// Result published, awaiting the Monitor.
    Resolved,
    /// Monitor asked the application to vacate the record.
    Releasing,
}

/// Application-side half of one ring's watch records.
pub struct AutWatches {
    target: Option<(Arc<Mapping>, usize)>,
}

impl AutWatches {
    pub(crate) fn new(target: Option<(Arc<Mapping>, usize)>) -> Self {
        Self { target }
    }

    /// Whether any record needs servicing (armed without a result, or
    /// releasing). Cheap enough for a hook-entry check.
    pub fn pending(&self) -> bool {
        let Some((map, off)) = self.target.as_ref() else {
            return false;
        };
        (0..WATCH_COUNT).any(|w| {
            let woff = map.layout().watch_off(*off, w);
            match map.atomic_i32(woff + WATCH_INUSE).load(Ordering::Acquire) {
                WATCH_RELEASING => true,
                WATCH_ARMED => {
                    map.atomic_i32(woff + WATCH_RESREADY).load(Ordering::Acquire) == 0
                }
                _ => false,
            }
        })
    }

    /// Service every record once: evaluate armed expressions through
    /// `eval`, publish results, and vacate releasing records. Returns the
    /// number of records acted on.
    ///
    /// `eval` returns the result bytes on success (empty is a legal,
    /// defined-but-empty result) or error text on failure; failures are
    /// published with a negative length.
    pub fn service<F>(&self, mut eval: F) -> usize
    where
        F: FnMut(&str) -> Result<Vec<u8>, String>,
    {
        let Some((map, off)) = self.target.as_ref() else {
            return 0;
        };
        let mut acted = 0;
        for w in 0..WATCH_COUNT {
            let woff = map.layout().watch_off(*off, w);
            let inuse = map.atomic_i32(woff + WATCH_INUSE);
            match inuse.load(Ordering::Acquire) {
                WATCH_RELEASING => {
                    map.write_i32(woff + WATCH_EXPRLEN, 0);
                    map.write_i32(woff + WATCH_RESLEN, 0);
                    map.atomic_i32(woff + WATCH_RESREADY)
                        .store(0, Ordering::Relaxed);
                    inuse.store(WATCH_FREE, Ordering::Release);
                    acted += 1;
                }
                WATCH_ARMED => {
                    let resready = map.atomic_i32(woff + WATCH_RESREADY);
                    if resready.load(Ordering::Acquire) != 0 {
                        continue;
                    }
                    let len = map.read_i32(woff + WATCH_EXPRLEN).max(0) as usize;
                    let len = len.min(WATCH_EXPR_MAX);
                    let expr_bytes = map.read_bytes(woff + WATCH_EXPR, len);
                    let expr = String::from_utf8_lossy(&expr_bytes);

                    let (bytes, failed) = match eval(&expr) {
                        Ok(b) => (b, false),
                        Err(text) if text.is_empty() => (EVAL_FAILED.to_vec(), true),
                        Err(text) => (text.into_bytes(), true),
                    };
                    let n = bytes.len().min(WATCH_RESULT_MAX);
                    map.write_bytes(woff + WATCH_RESULT, &bytes[..n]);
                    let reslen = if failed { -(n as i32) } else { n as i32 };
                    map.write_i32(woff + WATCH_RESLEN, reslen);
                    resready.store(1, Ordering::Release);
                    acted += 1;
                }
                _ => {}
            }
        }
        acted
    }
}

/// Monitor-side half of one ring's watch records.
pub struct MonitorWatches {
    map: Arc<Mapping>,
    off: usize,
}

impl MonitorWatches {
    pub(crate) fn new(map: Arc<Mapping>, off: usize) -> Self {
        Self { map, off }
    }

    fn woff(&self, w: usize) -> usize {
        self.map.layout().watch_off(self.off, w)
    }

    /// Observable state of record `w`.
    pub fn state(&self, w: usize) -> WatchState {
        let woff = self.woff(w);
        match self.map.atomic_i32(woff + WATCH_INUSE).load(Ordering::Acquire) {
            WATCH_RELEASING => WatchState::Releasing,
            WATCH_ARMED => {
                if self
                    .map
                    .atomic_i32(woff + WATCH_RESREADY)
                    .load(Ordering::Acquire)
                    != 0
                {
                    WatchState::Resolved
                } else {
                    WatchState::Armed
                }
            }
            _ => WatchState::Free,
        }
    }

    /// Arm a free record with `expr`.
    ///
    /// Returns the record index, or `None` when all four are occupied.
    /// Expressions longer than the record's capacity are rejected rather
    /// than truncated, so the application never evaluates a mangled
    /// expression.
    pub fn arm(&self, expr: &str) -> RingResult<Option<usize>> {
        let bytes = expr.as_bytes();
        if bytes.len() > WATCH_EXPR_MAX {
            return Err(RingError::TooLarge {
                len: bytes.len(),
                capacity: WATCH_EXPR_MAX,
            });
        }
        for w in 0..WATCH_COUNT {
            let woff = self.woff(w);
            let inuse = self.map.atomic_i32(woff + WATCH_INUSE);
            if inuse.load(Ordering::Acquire) != WATCH_FREE {
                continue;
            }
            self.map.write_bytes(woff + WATCH_EXPR, bytes);
            self.map.write_i32(woff + WATCH_EXPRLEN, bytes.len() as i32);
            self.map
                .atomic_i32(woff + WATCH_RESREADY)
                .store(0, Ordering::Relaxed);
            self.map.write_i32(woff + WATCH_RESLEN, 0);
            inuse.store(WATCH_ARMED, Ordering::Release);
            return Ok(Some(w));
        }
        Ok(None)
    }

    /// Read the published result of record `w`, if resolved.
    ///
    /// `Ok(bytes)` carries the value (possibly empty); `Err(text)` carries
    /// evaluation-failure text. The record stays resolved until
    /// [`Self::rearm`] or [`Self::release`].
    pub fn result(&self, w: usize) -> Option<Result<Vec<u8>, String>> {
        if self.state(w) != WatchState::Resolved {
            return None;
        }
        let woff = self.woff(w);
        let reslen = self.map.read_i32(woff + WATCH_RESLEN);
        let len = (reslen.unsigned_abs() as usize).min(WATCH_RESULT_MAX);
        let bytes = self.map.read_bytes(woff + WATCH_RESULT, len);
        Some(if reslen < 0 {
            Err(String::from_utf8_lossy(&bytes).into_owned())
        } else {
            Ok(bytes)
        })
    }

    /// Request re-evaluation of a resolved record.
    pub fn rearm(&self, w: usize) {
        if self.state(w) == WatchState::Resolved {
            self.map
                .atomic_i32(self.woff(w) + WATCH_RESREADY)
                .store(0, Ordering::Release);
        }
    }

    /// Ask the application to vacate record `w`. The record becomes Free
    /// once the application's hook next services its watches.
    pub fn release(&self, w: usize) {
        let woff = self.woff(w);
        let inuse = self.map.atomic_i32(woff + WATCH_INUSE);
        if inuse.load(Ordering::Acquire) != WATCH_FREE {
            inuse.store(WATCH_RELEASING, Ordering::Release);
        }
    }

    /// Armed expression text of record `w`, for display.
    pub fn expression(&self, w: usize) -> Option<String> {
        let woff = self.woff(w);
        if self.map.atomic_i32(woff + WATCH_INUSE).load(Ordering::Acquire) != WATCH_ARMED {
            return None;
        }
        let len = self.map.read_i32(woff + WATCH_EXPRLEN).max(0) as usize;
        let bytes = self.map.read_bytes(woff + WATCH_EXPR, len.min(WATCH_EXPR_MAX));
        Some(String::from_utf8_lossy(&bytes).into_owned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RingConfig;
    use crate::monitor::Monitor;

    fn fixture(tag: &str) -> (Arc<Mapping>, std::path::PathBuf) {
        let path =
            std::env::temp_dir().join(format!("shm_trace_watch_{}_{}", tag, std::process::id()));
        let _ = std::fs::remove_file(&path);
        let cfg = RingConfig {
            buffers: 1,
            slots: 4,
            slot_sz: 32,
            msg_sz: 32,
            global_sz: 64,
            file: path.clone(),
            ..RingConfig::default()
        };
        (Mapping::create(&path, &cfg).unwrap(), path)
    }

    #[test]
    fn lifecycle_arm_resolve_read_release() {
        let (m, path) = fixture("lifecycle");
        let h = m.allocate().unwrap();
        let mon = Monitor::from_mapping(Arc::clone(&m));
        let watches = mon.ring(0).watches();

        let slot = watches.arm("$x").unwrap().unwrap();
        assert_eq!(slot, 0);
        assert_eq!(watches.state(0), WatchState::Armed);
        assert_eq!(watches.expression(0).as_deref(), Some("$x"));

        let serviced = h.watches().service(|expr| {
            assert_eq!(expr, "$x");
            Ok(b"42".to_vec())
        });
        assert_eq!(serviced, 1);
        assert_eq!(watches.state(0), WatchState::Resolved);
        assert_eq!(watches.result(0).unwrap().unwrap(), b"42");

        watches.rearm(0);
        assert_eq!(watches.state(0), WatchState::Armed);
        h.watches().service(|_| Ok(b"43".to_vec()));
        assert_eq!(watches.result(0).unwrap().unwrap(), b"43");

        watches.release(0);
        assert_eq!(watches.state(0), WatchState::Releasing);
        h.watches().service(|_| unreachable!("nothing to evaluate"));
        assert_eq!(watches.state(0), WatchState::Free);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn four_slots_then_exhausted() {
        let (m, path) = fixture("exhaust");
        let _h = m.allocate().unwrap();
        let mon = Monitor::from_mapping(Arc::clone(&m));
        let watches = mon.ring(0).watches();

        for expected in 0..WATCH_COUNT {
            assert_eq!(watches.arm("$v").unwrap(), Some(expected));
        }
        assert_eq!(watches.arm("$overflow").unwrap(), None);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn failure_published_with_negative_length() {
        let (m, path) = fixture("failure");
        let h = m.allocate().unwrap();
        let mon = Monitor::from_mapping(Arc::clone(&m));
        let watches = mon.ring(0).watches();

        watches.arm("$broken").unwrap().unwrap();
        h.watches()
            .service(|_| Err("no such variable".to_string()));
        assert_eq!(
            watches.result(0).unwrap().unwrap_err(),
            "no such variable"
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn empty_result_is_success() {
        let (m, path) = fixture("empty");
        let h = m.allocate().unwrap();
        let mon = Monitor::from_mapping(Arc::clone(&m));
        let watches = mon.ring(0).watches();

        watches.arm("$undef").unwrap().unwrap();
        h.watches().service(|_| Ok(Vec::new()));
        assert_eq!(watches.result(0).unwrap().unwrap(), Vec::<u8>::new());

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn oversized_expression_rejected() {
        let (m, path) = fixture("bigexpr");
        let _h = m.allocate().unwrap();
        let mon = Monitor::from_mapping(Arc::clone(&m));
        let watches = mon.ring(0).watches();

        let big = "y".repeat(WATCH_EXPR_MAX + 1);
        assert!(matches!(
            watches.arm(&big),
            Err(RingError::TooLarge { .. })
        ));
        assert_eq!(watches.state(0), WatchState::Free);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn long_results_truncate() {
        let (m, path) = fixture("bigres");
        let h = m.allocate().unwrap();
        let mon = Monitor::from_mapping(Arc::clone(&m));
        let watches = mon.ring(0).watches();

        watches.arm("$huge").unwrap().unwrap();
        h.watches()
            .service(|_| Ok(vec![b'r'; WATCH_RESULT_MAX + 100]));
        assert_eq!(
            watches.result(0).unwrap().unwrap(),
            vec![b'r'; WATCH_RESULT_MAX]
        );

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn resolved_slot_not_reevaluated_until_rearm() {
        let (m, path) = fixture("once");
        let h = m.allocate().unwrap();
        let mon = Monitor::from_mapping(Arc::clone(&m));
        let watches = mon.ring(0).watches();

        watches.arm("$x").unwrap().unwrap();
        assert!(h.watches().pending());
        h.watches().service(|_| Ok(b"1".to_vec()));
        assert!(!h.watches().pending());
        // A second pass has nothing to do.
        assert_eq!(h.watches().service(|_| Ok(b"2".to_vec())), 0);
        assert_eq!(watches.result(0).unwrap().unwrap(), b"1");

        let _ = std::fs::remove_file(&path);
    }
}

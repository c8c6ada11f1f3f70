//! Cross-thread behavior: allocation races, a mailbox conversation between
//! a monitor thread and an instrumented thread, and concurrent global
//! appends.

use std::path::PathBuf;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use shm_trace::{Mapping, Monitor, RingConfig, RingError};

fn test_path(tag: &str) -> PathBuf {
    std::env::temp_dir().join(format!("shm_trace_conc_{}_{}", tag, std::process::id()))
}

fn wait_until(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::yield_now();
    }
    false
}

#[test]
fn concurrent_allocation_hands_out_each_ring_once() {
    let path = test_path("alloc_race");
    let _ = std::fs::remove_file(&path);
    let cfg = RingConfig {
        buffers: 4,
        slots: 4,
        slot_sz: 32,
        msg_sz: 32,
        global_sz: 128,
        file: path.clone(),
        ..RingConfig::default()
    };
    let m = Mapping::create(&path, &cfg).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let m = Arc::clone(&m);
            thread::spawn(move || m.allocate())
        })
        .collect();

    let mut indices = Vec::new();
    let mut exhausted = 0;
    for h in handles {
        match h.join().unwrap() {
            Ok(ring) => indices.push(ring.index().unwrap()),
            Err(RingError::Exhausted) => exhausted += 1,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }

    indices.sort_unstable();
    assert_eq!(indices, vec![0, 1, 2, 3]);
    assert_eq!(exhausted, 4);

    let _ = std::fs::remove_file(&path);
}

#[test]
fn mailbox_conversation_across_threads() {
    let path = test_path("mailbox");
    let _ = std::fs::remove_file(&path);
    let cfg = RingConfig {
        buffers: 1,
        slots: 4,
        slot_sz: 32,
        msg_sz: 64,
        global_sz: 128,
        file: path.clone(),
        ..RingConfig::default()
    };
    let m = Mapping::create(&path, &cfg).unwrap();
    let ring = m.allocate().unwrap();

    // Instrumented thread: poll the mailbox the way a debug hook does,
    // answering three requests.
    let aut = thread::spawn(move || {
        let mbox = ring.mailbox();
        let mut answered = 0;
        while answered < 3 {
            if let Some(req) = mbox.take_request() {
                let mut reply = req.command.to_vec();
                reply.extend_from_slice(b":done");
                mbox.post_response(&reply);
                answered += 1;
            } else {
                thread::yield_now();
            }
        }
    });

    let mon = Monitor::from_mapping(Arc::clone(&m));
    let mbox = mon.ring(0).mailbox();
    for tag in [*b"STEP", *b"EVAL", *b"QUIT"] {
        assert!(wait_until(|| mbox.post(tag, b"payload").unwrap()));
        let mut response = None;
        assert!(wait_until(|| {
            response = mbox.response();
            response.is_some()
        }));
        let mut expected = tag.to_vec();
        expected.extend_from_slice(b":done");
        assert_eq!(response.unwrap(), expected);
    }

    aut.join().unwrap();
    let _ = std::fs::remove_file(&path);
}

#[test]
fn concurrent_global_appends_never_lose_bytes() {
    let path = test_path("gma");
    let _ = std::fs::remove_file(&path);
    let cfg = RingConfig {
        buffers: 1,
        slots: 2,
        slot_sz: 16,
        msg_sz: 16,
        global_sz: 4096,
        file: path.clone(),
        ..RingConfig::default()
    };
    let m = Mapping::create(&path, &cfg).unwrap();

    let writers: Vec<_> = (0..4u8)
        .map(|id| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                let mut written = 0usize;
                for _ in 0..50 {
                    written += m.global().append(&[b'a' + id; 8]).unwrap();
                }
                written
            })
        })
        .collect();

    let total: usize = writers.into_iter().map(|w| w.join().unwrap()).sum();
    // 4 threads * 50 appends * 8 bytes fits the 4096 buffer exactly.
    assert_eq!(total, 1600);
    assert_eq!(m.global().len().unwrap(), 1600);

    let drained = m.global().drain().unwrap();
    assert_eq!(drained.len(), 1600);
    // Appends are atomic under the global lock, so each 8-byte chunk is
    // contiguous and single-sourced.
    for chunk in drained.chunks(8) {
        assert_eq!(chunk.len(), 8);
        assert!(chunk.iter().all(|&b| b == chunk[0]));
    }

    let _ = std::fs::remove_file(&path);
}

#[test]
fn per_thread_rings_do_not_interfere() {
    let path = test_path("isolation");
    let _ = std::fs::remove_file(&path);
    let cfg = RingConfig {
        buffers: 4,
        slots: 8,
        slot_sz: 32,
        msg_sz: 16,
        global_sz: 64,
        file: path.clone(),
        ..RingConfig::default()
    };
    let m = Mapping::create(&path, &cfg).unwrap();

    let workers: Vec<_> = (0..4)
        .map(|n| {
            let m = Arc::clone(&m);
            thread::spawn(move || {
                let ring = m.allocate().unwrap();
                for depth in 0..=n {
                    ring.enter(&format!("worker_{n}_frame_{depth}"));
                    ring.record(depth as i32, depth as f64);
                }
                (ring.index().unwrap(), n + 1)
            })
        })
        .collect();

    let expected: Vec<_> = workers
        .into_iter()
        .map(|w| w.join().unwrap())
        .collect();

    let mon = Monitor::from_mapping(Arc::clone(&m));
    for (index, depth) in expected {
        let view = mon.ring(index);
        assert_eq!(view.depth() as usize, depth);
        let snap = view.snapshot();
        assert_eq!(snap.len(), depth.min(8));
        // Every frame in this ring belongs to the same worker.
        let tag = format!("worker_{}_", depth - 1);
        assert!(snap.iter().all(|s| s.subroutine.starts_with(&tag)));
    }

    let _ = std::fs::remove_file(&path);
}

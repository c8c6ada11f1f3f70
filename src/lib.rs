//! # Shared-Memory Trace Rings
//!
//! A memory-mapped ring-buffer facility for out-of-band diagnostic
//! instrumentation. Threads of an application under test each own one ring
//! in a shared mapping and record their execution state (subroutine, line,
//! timestamp) from their debug hook with no locking on the hot path; a
//! separate Monitor process attaches to the same mapping to read stacks,
//! steer single-step/trace/signal flags, exchange commands through
//! per-ring mailboxes, request watch-expression evaluation, and drain a
//! shared bulk-message area.
//!
//! ## Structure
//!
//! ```text
//! ┌──────────────┐   mmap    ┌───────────────────────────┐   mmap   ┌─────────┐
//! │ AUT thread 1 ├──────────►│ header │ global │ freemap │◄─────────┤ Monitor │
//! │  RingHandle  │           │ ring 0 │ ring 1 │ ring …  │          │ RingView│
//! └──────────────┘           └───────────────────────────┘          └─────────┘
//! ```
//!
//! Free-map and header traffic goes through a two-level global lock
//! (process-local mutex, then a blocking exclusive `flock` on the backing
//! file). Everything per-ring is lock-free: publication flags use
//! release/acquire atomics, payload fields have a single owner, and the
//! Monitor treats its reads as best-effort snapshots.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use shm_trace::{Mapping, Monitor, RingConfig};
//!
//! # fn main() -> Result<(), shm_trace::RingError> {
//! // Application under test, once per thread:
//! let cfg = RingConfig::from_env();
//! let mapping = Mapping::create_from_config(&cfg)?;
//! let ring = mapping.allocate_or_detached();
//! ring.enter("main");
//! ring.record(1, 0.000_1);
//!
//! // Monitor process:
//! let monitor = Monitor::attach(&cfg.file)?;
//! for view in monitor.live_rings() {
//!     println!("pid {} depth {}", view.pid(), view.depth());
//! }
//! # Ok(())
//! # }
//! ```
//!
//! ## Guarantees
//!
//! - Ring operations (`enter`/`leave`/`record`, flag access, mailbox and
//!   watch servicing) never block and never allocate on the mapped side.
//! - Pool exhaustion is non-fatal: a detached handle turns every operation
//!   into a no-op and the application keeps running.
//! - The backing file survives the application for post-mortem inspection
//!   unless explicitly unlinked.

#![deny(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod flags;
pub mod global_area;
pub mod layout;
pub mod mailbox;
pub mod mapping;
pub mod monitor;
pub mod platform;
pub mod ring;
pub mod watch;

pub use config::RingConfig;
pub use error::{RingError, RingResult};
pub use flags::{SignalTie, SingleTie, TraceTie};
pub use global_area::GlobalArea;
pub use layout::MapLayout;
pub use mailbox::{AutMailbox, MailboxRequest, MonitorMailbox};
pub use mapping::{Mapping, MappingInfo};
pub use monitor::{Monitor, RingView};
pub use ring::{RingHandle, Slot};
pub use watch::{AutWatches, MonitorWatches, WatchState};

/// Initialize tracing output for tools built on this crate.
pub fn init_tracing() {
    use tracing_subscriber::{fmt, EnvFilter};

    let subscriber = fmt::Subscriber::builder()
        .with_env_filter(EnvFilter::from_default_env())
        .with_target(false)
        .with_thread_ids(true)
        .finish();

    let _ = tracing::subscriber::set_global_default(subscriber);
}

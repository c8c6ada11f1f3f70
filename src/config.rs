//! Mapping configuration: recognized options, defaults, environment overrides.
//!
//! Every option has a baked-in default, can be overridden by an environment
//! variable, and can be overridden again by assigning to the public field
//! before the mapping is created. Sizes are fixed for the lifetime of a
//! mapping; they are written into its header at creation and validated on
//! attach.

use std::env;
use std::path::PathBuf;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::error::{RingError, RingResult};

/// Environment variable overriding [`RingConfig::buffers`].
pub const ENV_BUFFERS: &str = "SHM_TRACE_BUFFERS";
/// Environment variable overriding [`RingConfig::slots`].
pub const ENV_SLOTS: &str = "SHM_TRACE_SLOTS";
/// Environment variable overriding [`RingConfig::slot_sz`].
pub const ENV_SLOT_SZ: &str = "SHM_TRACE_SLOT_SZ";
/// Environment variable overriding [`RingConfig::msg_sz`].
pub const ENV_MSG_SZ: &str = "SHM_TRACE_MSG_SZ";
/// Environment variable overriding [`RingConfig::global_sz`].
pub const ENV_GLOBAL_SZ: &str = "SHM_TRACE_GLOBAL_SZ";
/// Environment variable overriding [`RingConfig::stop_on_create`].
pub const ENV_STOP_ON_CREATE: &str = "SHM_TRACE_STOP_ON_CREATE";
/// Environment variable overriding [`RingConfig::trace_on_create`].
pub const ENV_TRACE_ON_CREATE: &str = "SHM_TRACE_TRACE_ON_CREATE";
/// Environment variable overriding [`RingConfig::file`].
pub const ENV_FILE: &str = "SHM_TRACE_FILE";

/// Configuration for a trace mapping.
///
/// The size fields shape the binary layout (see [`crate::layout`]); the two
/// policy flags are copied into each newly allocated ring; `file` names the
/// backing path.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RingConfig {
    /// Number of rings in the pool (`max_buffers`).
    pub buffers: usize,
    /// Execution slots per ring.
    pub slots: usize,
    /// Bytes reserved for the subroutine name in one slot.
    pub slot_sz: usize,
    /// Per-ring mailbox message area size.
    pub msg_sz: usize,
    /// Global message buffer capacity.
    pub global_sz: usize,
    /// Initial per-ring `signal` value for newly allocated rings.
    pub stop_on_create: i32,
    /// Initial per-ring `trace` value for newly allocated rings.
    pub trace_on_create: i32,
    /// Backing file path.
    pub file: PathBuf,
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            buffers: 20,
            slots: 10,
            slot_sz: 200,
            msg_sz: 256,
            global_sz: 16384,
            stop_on_create: 0,
            trace_on_create: 0,
            file: default_file_path(),
        }
    }
}

impl RingConfig {
    /// Build a configuration from defaults with environment overrides applied.
    ///
    /// Unset or unparsable variables fall back to the default for that
    /// option.
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            buffers: env_usize(ENV_BUFFERS, d.buffers),
            slots: env_usize(ENV_SLOTS, d.slots),
            slot_sz: env_usize(ENV_SLOT_SZ, d.slot_sz),
            msg_sz: env_usize(ENV_MSG_SZ, d.msg_sz),
            global_sz: env_usize(ENV_GLOBAL_SZ, d.global_sz),
            stop_on_create: env_i32(ENV_STOP_ON_CREATE, d.stop_on_create),
            trace_on_create: env_i32(ENV_TRACE_ON_CREATE, d.trace_on_create),
            file: env::var(ENV_FILE).map(PathBuf::from).unwrap_or(d.file),
        }
    }

    /// Validate option values before a mapping is created from them.
    ///
    /// Sizes must be non-zero and small enough to be carried in the i32
    /// header fields.
    pub fn validate(&self) -> RingResult<()> {
        let positive: [(&'static str, usize); 5] = [
            ("buffers", self.buffers),
            ("slots", self.slots),
            ("slot_sz", self.slot_sz),
            ("msg_sz", self.msg_sz),
            ("global_sz", self.global_sz),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(RingError::ConfigMismatch {
                    field,
                    expected: "a non-zero size".to_string(),
                    actual: "0".to_string(),
                });
            }
            if value > i32::MAX as usize {
                return Err(RingError::ConfigMismatch {
                    field,
                    expected: format!("at most {}", i32::MAX),
                    actual: value.to_string(),
                });
            }
        }
        Ok(())
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

fn env_i32(name: &str, default: i32) -> i32 {
    env::var(name)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

/// Default backing path: `<tmpdir>/<procname>.<pid>_mon_<day>_<HH:MM:SS>`.
pub fn default_file_path() -> PathBuf {
    let proc_name = env::current_exe()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "aut".to_string());

    let secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0);
    let (_, _, day) = civil_from_days((secs / 86_400) as i64);
    let tod = secs % 86_400;
    let (hh, mm, ss) = (tod / 3600, (tod % 3600) / 60, tod % 60);

    env::temp_dir().join(format!(
        "{}.{}_mon_{}_{:02}:{:02}:{:02}",
        proc_name,
        std::process::id(),
        day,
        hh,
        mm,
        ss
    ))
}

/// Civil (year, month, day) from days since 1970-01-01, proleptic Gregorian.
fn civil_from_days(z: i64) -> (i64, u32, u32) {
    let z = z + 719_468;
    let era = if z >= 0 { z } else { z - 146_096 } / 146_097;
    let doe = z - era * 146_097;
    let yoe = (doe - doe / 1460 + doe / 36_524 - doe / 146_096) / 365;
    let y = yoe + era * 400;
    let doy = doe - (365 * yoe + yoe / 4 - yoe / 100);
    let mp = (5 * doy + 2) / 153;
    let d = (doy - (153 * mp + 2) / 5 + 1) as u32;
    let m = if mp < 10 { mp + 3 } else { mp - 9 } as u32;
    (if m <= 2 { y + 1 } else { y }, m, d)
}

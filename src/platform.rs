//! Platform helpers: process identity, liveness probing, file mapping.

use std::fs::{File, OpenOptions};
use std::path::Path;

use memmap2::{MmapMut, MmapOptions};
use nix::unistd::getpid;

use crate::error::{RingError, RingResult};

/// Current process id.
pub fn current_pid() -> i32 {
    getpid().as_raw()
}

/// Current OS thread id.
#[cfg(target_os = "linux")]
pub fn current_tid() -> i32 {
    nix::unistd::gettid().as_raw()
}

/// Current OS thread id (non-Linux fallback: process id).
#[cfg(not(target_os = "linux"))]
pub fn current_tid() -> i32 {
    current_pid()
}

/// Check whether a process is alive using `kill(pid, 0)`.
///
/// `EPERM` means the process exists but cannot be signalled, which still
/// counts as alive.
pub fn is_process_alive(pid: i32) -> bool {
    if pid <= 0 {
        return false;
    }
    use nix::sys::signal::kill;
    use nix::unistd::Pid;

    match kill(Pid::from_raw(pid), None) {
        Ok(_) => true,
        Err(nix::errno::Errno::EPERM) => true,
        Err(_) => false,
    }
}

/// Open (creating if absent) the backing file, owner read/write only.
pub fn open_backing_file(path: &Path) -> RingResult<File> {
    let mut opts = OpenOptions::new();
    opts.create(true).read(true).write(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        opts.mode(0o600);
    }
    opts.open(path).map_err(|e| RingError::fs(path, e))
}

/// Open an existing backing file without creating it.
pub fn open_existing_file(path: &Path) -> RingResult<File> {
    OpenOptions::new()
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| RingError::fs(path, e))
}

/// Map the whole file read/write.
pub fn map_file(path: &Path, file: &File) -> RingResult<MmapMut> {
    // SAFETY: the mapping stays alive as long as the returned MmapMut;
    // concurrent mutation by other processes is the whole point and is
    // governed by the mapping's publication protocols, not by Rust aliasing.
    unsafe { MmapOptions::new().map_mut(file) }.map_err(|e| RingError::fs(path, e))
}

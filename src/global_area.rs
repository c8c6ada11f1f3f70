//! Global message area: coarse-locked bulk buffer shared by every thread.
//!
//! Messages larger than the buffer move in chunks: the producer appends
//! what fits, the Monitor drains, and the producer appends the remainder.
//! Every operation runs under the global lock.

use crate::error::{RingError, RingResult};
use crate::layout::OFF_GLOBMSG_SZ;
use crate::mapping::Mapping;

/// View of a mapping's global message area. Obtained from
/// [`Mapping::global`].
pub struct GlobalArea<'a> {
    map: &'a Mapping,
}

impl<'a> GlobalArea<'a> {
    pub(crate) fn new(map: &'a Mapping) -> Self {
        Self { map }
    }

    fn len_clamped(&self) -> usize {
        let cap = self.map.layout().global_sz;
        (self.map.read_i32(OFF_GLOBMSG_SZ).max(0) as usize).min(cap)
    }

    /// Read the current contents without consuming them.
    pub fn read(&self) -> RingResult<Vec<u8>> {
        self.map.with_global_lock(|| {
            let len = self.len_clamped();
            self.map.read_bytes(self.map.layout().global_off, len)
        })
    }

    /// Replace the contents.
    ///
    /// Fails with [`RingError::TooLarge`] and leaves the buffer untouched
    /// when `bytes` exceeds the configured capacity.
    pub fn replace(&self, bytes: &[u8]) -> RingResult<()> {
        let capacity = self.map.layout().global_sz;
        if bytes.len() > capacity {
            return Err(RingError::TooLarge {
                len: bytes.len(),
                capacity,
            });
        }
        self.map.with_global_lock(|| {
            self.map.write_bytes(self.map.layout().global_off, bytes);
            self.map.write_i32(OFF_GLOBMSG_SZ, bytes.len() as i32);
        })
    }

    /// Append as many bytes as fit and return how many were consumed.
    ///
    /// Returns 0 when the buffer is full. Callers chunking a large message
    /// re-offer the remainder after the Monitor drains.
    pub fn append(&self, bytes: &[u8]) -> RingResult<usize> {
        self.map.with_global_lock(|| {
            let cap = self.map.layout().global_sz;
            let len = self.len_clamped();
            let n = bytes.len().min(cap - len);
            if n > 0 {
                self.map
                    .write_bytes(self.map.layout().global_off + len, &bytes[..n]);
                self.map.write_i32(OFF_GLOBMSG_SZ, (len + n) as i32);
            }
            n
        })
    }

    /// Read and clear the contents: the Monitor's consume step in a
    /// chunked transfer.
    pub fn drain(&self) -> RingResult<Vec<u8>> {
        self.map.with_global_lock(|| {
            let len = self.len_clamped();
            let out = self.map.read_bytes(self.map.layout().global_off, len);
            self.map.write_i32(OFF_GLOBMSG_SZ, 0);
            out
        })
    }

    /// Current logical length.
    pub fn len(&self) -> RingResult<usize> {
        self.map.with_global_lock(|| self.len_clamped())
    }

    /// Whether the buffer is empty.
    pub fn is_empty(&self) -> RingResult<bool> {
        Ok(self.len()? == 0)
    }
}

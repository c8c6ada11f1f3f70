//! Per-ring command/response mailbox.
//!
//! A three-state machine over the ring's `cmdready` word:
//! 0 = idle, 1 = request posted, -2 = response ready. Whichever side
//! publishes a state stores it with release ordering after writing the
//! payload; the other side reads it with acquire ordering before touching
//! the payload. There are no timeouts; a Monitor may abandon a pending
//! request and must re-check the state before trusting a late response.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::error::{RingError, RingResult};
use crate::layout::{RING_CMDREADY, RING_COMMAND, RING_MSGLEN};
use crate::mapping::Mapping;

/// Mailbox idle; the Monitor may post.
pub const CMD_IDLE: i32 = 0;
/// Request posted; the application thread should service it.
pub const CMD_REQUEST: i32 = 1;
/// Response ready; the Monitor should collect it.
pub const CMD_RESPONSE: i32 = -2;

/// Width of the command tag.
pub const COMMAND_LEN: usize = 4;

/// A request taken from the mailbox by the application thread.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MailboxRequest {
    /// 4-byte command tag.
    pub command: [u8; COMMAND_LEN],
    /// Message bytes that accompanied the command.
    pub message: Vec<u8>,
}

/// Application-side half of one ring's mailbox.
///
/// Detached handles produce an inert half that never sees requests.
pub struct AutMailbox {
    target: Option<(Arc<Mapping>, usize)>,
}

impl AutMailbox {
    pub(crate) fn new(target: Option<(Arc<Mapping>, usize)>) -> Self {
        Self { target }
    }

    /// Take the pending request, if one is posted.
    ///
    /// The mailbox stays in the request state until [`Self::post_response`];
    /// the debug hook reads, acts, then responds.
    pub fn take_request(&self) -> Option<MailboxRequest> {
        let (map, off) = self.target.as_ref()?;
        if map.atomic_i32(off + RING_CMDREADY).load(Ordering::Acquire) != CMD_REQUEST {
            return None;
        }
        let command: [u8; COMMAND_LEN] = map
            .read_bytes(off + RING_COMMAND, COMMAND_LEN)
            .try_into()
            .unwrap_or([0; COMMAND_LEN]);
        let len = map.read_i32(off + RING_MSGLEN).max(0) as usize;
        let len = len.min(map.layout().msgarea_sz);
        let message = map.read_bytes(off + map.layout().msgarea_off, len);
        Some(MailboxRequest { command, message })
    }

    /// Publish a response and move the mailbox to the response state.
    ///
    /// Truncates to the configured message-area size. A post with no
    /// pending request is a silent no-op.
    pub fn post_response(&self, bytes: &[u8]) {
        let Some((map, off)) = self.target.as_ref() else {
            return;
        };
        let state = map.atomic_i32(off + RING_CMDREADY);
        if state.load(Ordering::Acquire) != CMD_REQUEST {
            return;
        }
        let n = bytes.len().min(map.layout().msgarea_sz);
        map.write_bytes(off + map.layout().msgarea_off, &bytes[..n]);
        map.write_i32(off + RING_MSGLEN, n as i32);
        state.store(CMD_RESPONSE, Ordering::Release);
    }
}

/// Monitor-side half of one ring's mailbox.
pub struct MonitorMailbox {
    map: Arc<Mapping>,
    off: usize,
}

impl MonitorMailbox {
    pub(crate) fn new(map: Arc<Mapping>, off: usize) -> Self {
        Self { map, off }
    }

    /// Current state word; one of [`CMD_IDLE`], [`CMD_REQUEST`],
    /// [`CMD_RESPONSE`].
    pub fn state(&self) -> i32 {
        self.map
            .atomic_i32(self.off + RING_CMDREADY)
            .load(Ordering::Acquire)
    }

    /// Post a request if the mailbox is idle.
    ///
    /// Returns `Ok(false)` without touching anything when the mailbox is
    /// busy, and [`RingError::TooLarge`] when the message exceeds the
    /// configured area.
    pub fn post(&self, command: [u8; COMMAND_LEN], message: &[u8]) -> RingResult<bool> {
        let capacity = self.map.layout().msgarea_sz;
        if message.len() > capacity {
            return Err(RingError::TooLarge {
                len: message.len(),
                capacity,
            });
        }
        let state = self.map.atomic_i32(self.off + RING_CMDREADY);
        if state.load(Ordering::Acquire) != CMD_IDLE {
            return Ok(false);
        }
        self.map.write_bytes(self.off + RING_COMMAND, &command);
        self.map
            .write_bytes(self.off + self.map.layout().msgarea_off, message);
        self.map
            .write_i32(self.off + RING_MSGLEN, message.len() as i32);
        state.store(CMD_REQUEST, Ordering::Release);
        Ok(true)
    }

    /// Collect the response if one is ready, returning the mailbox to idle.
    pub fn response(&self) -> Option<Vec<u8>> {
        let state = self.map.atomic_i32(self.off + RING_CMDREADY);
        if state.load(Ordering::Acquire) != CMD_RESPONSE {
            return None;
        }
        let len = self.map.read_i32(self.off + RING_MSGLEN).max(0) as usize;
        let len = len.min(self.map.layout().msgarea_sz);
        let bytes = self
            .map
            .read_bytes(self.off + self.map.layout().msgarea_off, len);
        state.store(CMD_IDLE, Ordering::Release);
        Some(bytes)
    }

    /// Abandon a pending request, returning the mailbox to idle.
    ///
    /// Races with an application thread that already started servicing are
    /// tolerated: its late response store is ignored by the next
    /// [`Self::response`] state check.
    pub fn abandon(&self) {
        self.map
            .atomic_i32(self.off + RING_CMDREADY)
            .store(CMD_IDLE, Ordering::Release);
    }
}

//! Flow-control windows, cf. <https://httpwg.org/specs/rfc9113.html#FlowControl>

use tracing::trace;

/// Largest window size allowed by RFC 9113, section 6.9.1
pub const MAX_WINDOW_SIZE: i64 = (1 << 31) - 1;

/// Window size every peer starts with, before SETTINGS / WINDOW_UPDATE
pub const DEFAULT_WINDOW_SIZE: u32 = 65_535;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("flow control window overflow: {current} + {delta} exceeds 2^31-1")]
pub struct WindowOverflow {
    pub current: i64,
    pub delta: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("peer sent {len} bytes but only {available} were credited")]
pub struct WindowUnderflow {
    pub len: u32,
    pub available: i64,
}

/// Credit the peer gave us: how many DATA bytes we may still send.
///
/// May go negative after the peer shrinks SETTINGS_INITIAL_WINDOW_SIZE.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OutboundWindow {
    size: i64,
}

impl OutboundWindow {
    pub fn new(initial: u32) -> Self {
        Self {
            size: initial as i64,
        }
    }

    pub fn available(&self) -> i64 {
        self.size
    }

    /// Record `n` bytes of DATA as sent. Callers never send more than
    /// [OutboundWindow::available].
    pub fn consume(&mut self, n: u32) {
        debug_assert!(
            n as i64 <= self.size,
            "consumed {n} bytes with only {} available",
            self.size
        );
        self.size -= n as i64;
    }

    /// Apply a WINDOW_UPDATE increment
    pub fn expand(&mut self, increment: u32) -> Result<(), WindowOverflow> {
        self.adjust(increment as i64)
    }

    /// Apply a delta from a SETTINGS_INITIAL_WINDOW_SIZE change
    pub fn adjust(&mut self, delta: i64) -> Result<(), WindowOverflow> {
        let next = self.size + delta;
        if next > MAX_WINDOW_SIZE {
            return Err(WindowOverflow {
                current: self.size,
                delta,
            });
        }
        self.size = next;
        Ok(())
    }
}

/// Credit we gave the peer: how many DATA bytes it may still send us.
///
/// Bytes count against the window when they arrive and are given back
/// (through WINDOW_UPDATE) once the application consumed them. Updates are
/// batched until half the target window is outstanding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InboundWindow {
    target: u32,
    available: i64,
    unacked: u32,
}

impl InboundWindow {
    /// A window the peer already knows is `target` bytes wide.
    pub fn new(target: u32) -> Self {
        Self {
            target,
            available: target as i64,
            unacked: 0,
        }
    }

    pub fn available(&self) -> i64 {
        self.available
    }

    pub fn target(&self) -> u32 {
        self.target
    }

    /// Account for `n` bytes the peer just sent.
    pub fn receive(&mut self, n: u32) -> Result<(), WindowUnderflow> {
        if n as i64 > self.available {
            return Err(WindowUnderflow {
                len: n,
                available: self.available,
            });
        }
        self.available -= n as i64;
        Ok(())
    }

    /// Give `n` bytes back. Returns the WINDOW_UPDATE increment to send, if
    /// enough bytes are outstanding to make one worthwhile.
    pub fn release(&mut self, n: u32) -> Option<u32> {
        if n == 0 {
            return None;
        }

        self.unacked = self.unacked.saturating_add(n);
        if self.unacked < self.target / 2 {
            trace!(unacked = %self.unacked, target = %self.target, "holding back window update");
            return None;
        }

        let increment = self.unacked;
        self.unacked = 0;
        self.available += increment as i64;
        Some(increment)
    }
}

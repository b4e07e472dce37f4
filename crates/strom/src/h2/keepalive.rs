use std::time::{Duration, Instant};

use tracing::{debug, trace};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeepAliveState {
    /// Waiting for the idle delay to elapse
    None,
    /// A PING is in flight
    PingSent,
    /// The PING went unanswered; the connection is done
    Timeout,
}

#[derive(Debug, PartialEq, Eq)]
pub(crate) enum KeepAliveAction {
    Nothing,
    SendPing([u8; 8]),
    TimedOut,
}

/// Decides when to probe an idle connection with PING, and when to give up
/// on it.
pub(crate) struct KeepAlive {
    state: KeepAliveState,
    ping_delay: Option<Duration>,
    ping_timeout: Option<Duration>,
    last_activity: Instant,
    ping_sent_at: Option<Instant>,
    in_flight: [u8; 8],
    pings_sent: u64,
}

impl KeepAlive {
    pub(crate) fn new(
        ping_delay: Option<Duration>,
        ping_timeout: Option<Duration>,
        now: Instant,
    ) -> Self {
        Self {
            state: KeepAliveState::None,
            ping_delay,
            ping_timeout,
            last_activity: now,
            ping_sent_at: None,
            in_flight: [0; 8],
            pings_sent: 0,
        }
    }

    pub(crate) fn state(&self) -> KeepAliveState {
        self.state
    }

    /// Any frame from the peer proves it's alive.
    pub(crate) fn on_frame_received(&mut self, now: Instant) {
        self.last_activity = now;
        if self.state == KeepAliveState::PingSent {
            trace!("peer activity while a keep-alive ping is in flight");
            self.state = KeepAliveState::None;
            self.ping_sent_at = None;
        }
    }

    /// Returns whether the ack matched the ping we sent.
    pub(crate) fn on_ping_ack(&mut self, payload: [u8; 8], now: Instant) -> bool {
        let matched = self.ping_sent_at.is_some() && payload == self.in_flight;
        if matched {
            debug!(rtt = ?self.ping_sent_at.map(|t| now - t), "keep-alive ping acknowledged");
        }
        self.on_frame_received(now);
        matched
    }

    pub(crate) fn poll(&mut self, now: Instant, streams_open: bool) -> KeepAliveAction {
        match self.state {
            KeepAliveState::Timeout => KeepAliveAction::Nothing,
            KeepAliveState::None => {
                if streams_open {
                    self.last_activity = now;
                    return KeepAliveAction::Nothing;
                }

                let Some(delay) = self.ping_delay else {
                    return KeepAliveAction::Nothing;
                };
                if now.saturating_duration_since(self.last_activity) < delay {
                    return KeepAliveAction::Nothing;
                }

                self.pings_sent += 1;
                self.in_flight = self.pings_sent.to_be_bytes();
                self.ping_sent_at = Some(now);
                self.state = KeepAliveState::PingSent;
                KeepAliveAction::SendPing(self.in_flight)
            }
            KeepAliveState::PingSent => {
                let (Some(timeout), Some(sent_at)) = (self.ping_timeout, self.ping_sent_at) else {
                    return KeepAliveAction::Nothing;
                };
                if now.saturating_duration_since(sent_at) < timeout {
                    return KeepAliveAction::Nothing;
                }

                self.state = KeepAliveState::Timeout;
                KeepAliveAction::TimedOut
            }
        }
    }
}

//! Heartbeat ids and reply bookkeeping
//!
//! Heartbeats never time a connection out; a missing reply is only logged.

use tracing::debug;

use qc_protocol::HeartBeat;

/// Source of outgoing heartbeat ids, owned by the coordinator
#[derive(Debug, Default)]
pub struct HeartbeatCounter {
    last: u64,
}

impl HeartbeatCounter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next heartbeat; ids start at 1 and skip 0 on wrap-around
    pub fn next_heartbeat(&mut self) -> HeartBeat {
        self.last = self.last.wrapping_add(1);
        if self.last == 0 {
            self.last = 1;
        }
        HeartBeat::new(self.last)
    }
}

/// The reply to a received heartbeat; replies are never answered
pub fn reply_to(received: &HeartBeat) -> Option<HeartBeat> {
    (!received.reply).then(|| received.to_reply())
}

/// Heartbeat exchange state of one connection
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct Liveness {
    last_sent: Option<u64>,
    last_ack: Option<u64>,
}

impl Liveness {
    /// Record an outgoing heartbeat
    ///
    /// Returns `false` when the previous one was never acknowledged.
    pub fn record_sent(&mut self, id: u64) -> bool {
        let answered = self.last_sent.is_none() || self.last_sent == self.last_ack;
        if !answered {
            debug!(sent = ?self.last_sent, acked = ?self.last_ack, "Previous heartbeat unanswered");
        }
        self.last_sent = Some(id);
        answered
    }

    /// Record a reply; returns whether it acknowledges the latest heartbeat
    pub fn record_reply(&mut self, reply: &HeartBeat) -> bool {
        self.last_ack = Some(reply.ack);
        self.last_sent == Some(reply.ack)
    }

    pub fn last_sent(&self) -> Option<u64> {
        self.last_sent
    }

    pub fn last_ack(&self) -> Option<u64> {
        self.last_ack
    }
}

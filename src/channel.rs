//! Progress counters of one (type, partner) channel.

/// One of the two alternating remote slots of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Generation {
    /// Used by odd sequence numbers (1, 3, 5, ...).
    G0,
    /// Used by even sequence numbers (2, 4, 6, ...).
    G1,
}

impl Generation {
    /// Generation used by the operation following `count` completed ones.
    #[inline]
    pub fn after(count: i32) -> Self {
        if count % 2 == 0 {
            Generation::G0
        } else {
            Generation::G1
        }
    }

    /// Slot index (0 or 1).
    #[inline]
    pub fn index(self) -> usize {
        match self {
            Generation::G0 => 0,
            Generation::G1 => 1,
        }
    }

    /// The other generation.
    #[inline]
    pub fn flip(self) -> Self {
        match self {
            Generation::G0 => Generation::G1,
            Generation::G1 => Generation::G0,
        }
    }
}

/// Send, receive and acknowledgement counts of one channel.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ChannelCounters {
    /// Messages sent to the partner.
    pub send: i32,
    /// Messages received from the partner.
    pub recv: i32,
    /// Sends known to be complete.
    pub ack: i32,
}

impl ChannelCounters {
    /// Generation of the next send.
    #[inline]
    pub fn send_generation(&self) -> Generation {
        Generation::after(self.send)
    }

    /// Generation of the next receive.
    #[inline]
    pub fn recv_generation(&self) -> Generation {
        Generation::after(self.recv)
    }

    /// Sends not yet acknowledged.
    #[inline]
    pub fn outstanding(&self) -> i32 {
        self.send - self.ack
    }

    /// Record a send; returns its sequence number.
    #[inline]
    pub(crate) fn record_send(&mut self) -> i32 {
        self.send += 1;
        self.send
    }

    /// Record a receive carrying sequence number `seq`.
    #[inline]
    #[track_caller]
    pub(crate) fn record_recv(&mut self, seq: i32) {
        assert_eq!(
            seq,
            self.recv + 1,
            "sequence {seq} received while expecting {}",
            self.recv + 1
        );
        self.recv = seq;
    }

    /// Advance the acknowledgement if the partner's have-read count moved.
    #[inline]
    #[track_caller]
    pub(crate) fn observe_ack(&mut self, have_read: i32) -> bool {
        if have_read > self.ack {
            assert_eq!(
                have_read,
                self.ack + 1,
                "partner read {have_read} messages, only {} acknowledged",
                self.ack
            );
            assert!(self.ack < self.send, "acknowledgement past last send");
            self.ack += 1;
            true
        } else {
            false
        }
    }

    /// Advance the acknowledgement by one completed fabric write.
    #[inline]
    pub(crate) fn complete_write(&mut self) -> bool {
        if self.send > self.ack {
            self.ack += 1;
            true
        } else {
            false
        }
    }
}

use std::fmt;

/// The connection states of RFC 793 Figure 6.
///
/// The discriminant order is significant and several places rely on it:
/// everything before [`State::Established`] is still connecting, and
/// everything after it is tearing the connection down. Keep the closing
/// states grouped after `Established`.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum State {
    Closed,
    Listen,
    SynSent,
    SynReceived,
    Established,

    /// The peer closed its half of the connection (CLOSE-WAIT).
    CloseWait,
    /// Both halves are closed; waiting for the peer to acknowledge our FIN
    /// (LAST-ACK).
    LastAck,

    /// We closed first and our FIN is not yet acknowledged (FIN-WAIT-1).
    FinWait1,
    /// Our FIN is acknowledged; waiting for the peer's (FIN-WAIT-2).
    FinWait2,
    /// Simultaneous close; waiting for the acknowledgement of our FIN.
    Closing,

    TimeWait,
}

impl State {
    /// Whether user data may still be queued for sending in this state.
    pub fn is_writable(self) -> bool {
        matches!(self, State::Established | State::CloseWait)
    }

    /// Whether the connection is still being established.
    pub fn is_establishing(self) -> bool {
        matches!(self, State::SynSent | State::SynReceived)
    }

    /// Whether the tail of the send queue must carry our FIN.
    pub fn needs_finish(self) -> bool {
        matches!(self, State::LastAck | State::FinWait1 | State::Closing)
    }

    pub(crate) fn from_u8(value: u8) -> State {
        match value {
            0 => State::Closed,
            1 => State::Listen,
            2 => State::SynSent,
            3 => State::SynReceived,
            4 => State::Established,
            5 => State::CloseWait,
            6 => State::LastAck,
            7 => State::FinWait1,
            8 => State::FinWait2,
            9 => State::Closing,
            _ => State::TimeWait,
        }
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            State::Closed => "closed",
            State::Listen => "listen",
            State::SynSent => "syn-sent",
            State::SynReceived => "syn-received",
            State::Established => "established",
            State::CloseWait => "close-wait",
            State::LastAck => "last-ack",
            State::FinWait1 => "fin-wait1",
            State::FinWait2 => "fin-wait2",
            State::Closing => "closing",
            State::TimeWait => "time-wait",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_splits_at_established() {
        for state in [State::Closed, State::Listen, State::SynSent, State::SynReceived] {
            assert!(state < State::Established);
        }
        for state in [
            State::CloseWait,
            State::LastAck,
            State::FinWait1,
            State::FinWait2,
            State::Closing,
            State::TimeWait,
        ] {
            assert!(state > State::Established);
        }
    }

    #[test]
    fn round_trips_through_u8() {
        for state in [
            State::Closed,
            State::Listen,
            State::SynSent,
            State::SynReceived,
            State::Established,
            State::CloseWait,
            State::LastAck,
            State::FinWait1,
            State::FinWait2,
            State::Closing,
            State::TimeWait,
        ] {
            assert_eq!(State::from_u8(state as u8), state);
        }
    }
}

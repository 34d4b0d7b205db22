//! Connection state machine of a TCP endpoint.
//!
//! CLOSED is both the initial and the terminal state. Each state names the
//! single action taken when the socket becomes writable.

use std::fmt;

use crate::error::{Result, TcpAmError};

/// Connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnState {
    /// No usable socket.
    Closed,
    /// Local non-blocking connect in flight.
    Connecting,
    /// Connection request sent, waiting for the peer's acknowledgment.
    WaitingAck,
    /// Inbound socket, handshake not resolved yet.
    Accepting,
    /// Accepted socket waiting for the peer's connection request.
    WaitingReq,
    /// Data may flow.
    Connected,
}

/// What write readiness means in a given state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxAction {
    /// Socket not usable for data yet.
    Idle,
    /// Drive the connection manager's establishment step.
    ConnProgress,
    /// Drain buffered data and replay pending operations.
    Data,
}

impl ConnState {
    pub const ALL: [ConnState; 6] = [
        ConnState::Closed,
        ConnState::Connecting,
        ConnState::WaitingAck,
        ConnState::Accepting,
        ConnState::WaitingReq,
        ConnState::Connected,
    ];

    pub fn tx_action(self) -> TxAction {
        match self {
            ConnState::Connected => TxAction::Data,
            ConnState::Connecting => TxAction::ConnProgress,
            ConnState::Closed
            | ConnState::WaitingAck
            | ConnState::Accepting
            | ConnState::WaitingReq => TxAction::Idle,
        }
    }

    /// Admission result for a send issued in this state.
    pub fn tx_admission(self) -> Result<()> {
        match self {
            ConnState::Connected => Ok(()),
            ConnState::Closed => Err(TcpAmError::Unreachable),
            _ => Err(TcpAmError::NoResource),
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            ConnState::Closed => "CLOSED",
            ConnState::Connecting => "CONNECTING",
            ConnState::WaitingAck => "WAITING_ACK",
            ConnState::Accepting => "ACCEPTING",
            ConnState::WaitingReq => "WAITING_REQ",
            ConnState::Connected => "CONNECTED",
        }
    }
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_state_has_one_tx_action() {
        for state in ConnState::ALL {
            let expected = match state {
                ConnState::Connected => TxAction::Data,
                ConnState::Connecting => TxAction::ConnProgress,
                _ => TxAction::Idle,
            };
            assert_eq!(state.tx_action(), expected, "{state}");
        }
    }

    #[test]
    fn admission_by_state() {
        assert!(ConnState::Connected.tx_admission().is_ok());
        assert!(matches!(
            ConnState::Closed.tx_admission(),
            Err(TcpAmError::Unreachable)
        ));
        for state in [
            ConnState::Connecting,
            ConnState::WaitingAck,
            ConnState::Accepting,
            ConnState::WaitingReq,
        ] {
            assert!(matches!(state.tx_admission(), Err(TcpAmError::NoResource)));
        }
    }
}

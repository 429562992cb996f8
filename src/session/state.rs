//! Session connection state machine
//!
//! Transitions are computed by a pure function so the session, the worker
//! and the tests all agree on which moves are legal.

use std::fmt;

/// Observable connection state of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConnectionState {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Disconnecting => "disconnecting",
        }
    }

    /// Subscribe, unsubscribe and publish are only accepted while connected
    pub fn accepts_commands(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Inputs to the state machine, from the caller or from the worker
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ConnectRequested,
    DisconnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    ConnectionLost,
    TeardownComplete,
}

/// Determine the state that follows `event`, or `None` when the event is
/// not legal (or is stale) in `current`
///
/// A disconnect request is honoured while a connect attempt is still in
/// flight; the attempt is cancelled and any late success is discarded
/// because `ConnectSucceeded` is not legal in `Disconnecting`.
pub fn determine_next_state(current: ConnectionState, event: StateEvent) -> Option<ConnectionState> {
    use ConnectionState::*;
    use StateEvent::*;

    match (current, event) {
        (Disconnected, ConnectRequested) => Some(Connecting),
        (Connecting, ConnectSucceeded) => Some(Connected),
        (Connecting, ConnectFailed) | (Connecting, ConnectionLost) => Some(Disconnected),
        (Connected, DisconnectRequested) | (Connecting, DisconnectRequested) => Some(Disconnecting),
        (Connected, ConnectionLost) => Some(Disconnected),
        (Disconnecting, TeardownComplete) => Some(Disconnected),
        _ => None,
    }
}

use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

impl ConnectionState {
    pub fn is_connected(self) -> bool {
        self == Self::Connected
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("cannot {action} while connection is {current:?}")]
pub struct InvalidTransition {
    pub current: ConnectionState,
    pub action: &'static str,
}

/// Hub connection lifecycle.
///
/// `Disconnected -> Connecting -> Connected`, `Connected -> Reconnecting`,
/// and `Reconnecting -> Connected | Disconnected`. An explicit disconnect is
/// accepted from any state.
#[derive(Debug, Clone)]
pub struct ConnectionStateMachine {
    state: ConnectionState,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
        }
    }
}

impl ConnectionStateMachine {
    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn begin_connect(&mut self) -> Result<ConnectionState, InvalidTransition> {
        self.transition(
            &[ConnectionState::Disconnected],
            ConnectionState::Connecting,
            "begin connect",
        )
    }

    pub fn on_connected(&mut self) -> Result<ConnectionState, InvalidTransition> {
        self.transition(
            &[ConnectionState::Connecting, ConnectionState::Reconnecting],
            ConnectionState::Connected,
            "complete connect",
        )
    }

    pub fn on_connection_lost(&mut self) -> Result<ConnectionState, InvalidTransition> {
        self.transition(
            &[ConnectionState::Connected],
            ConnectionState::Reconnecting,
            "start reconnecting",
        )
    }

    pub fn on_gave_up(&mut self) -> Result<ConnectionState, InvalidTransition> {
        self.transition(
            &[ConnectionState::Connecting, ConnectionState::Reconnecting],
            ConnectionState::Disconnected,
            "give up",
        )
    }

    pub fn on_disconnect(&mut self) -> ConnectionState {
        self.state = ConnectionState::Disconnected;
        self.state
    }

    fn transition(
        &mut self,
        expected: &[ConnectionState],
        next: ConnectionState,
        action: &'static str,
    ) -> Result<ConnectionState, InvalidTransition> {
        if !expected.contains(&self.state) {
            return Err(InvalidTransition {
                current: self.state,
                action,
            });
        }
        self.state = next;
        Ok(next)
    }
}

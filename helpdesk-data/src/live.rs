//! Push connection status as seen by the dashboard.

use crate::state::{Reducer, StateStore};

/// Exactly one of connected / reconnecting / neither holds at any time.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConnectionState {
    pub connected: bool,
    pub reconnecting: bool,
    pub last_error: Option<String>,
}

impl ConnectionState {
    pub fn label(&self) -> &'static str {
        if self.connected {
            "live"
        } else if self.reconnecting {
            "reconnecting"
        } else {
            "offline"
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionAction {
    Connected,
    /// The transport dropped and is retrying.
    Reconnecting(Option<String>),
    /// The channel is down for good (stopped or retries exhausted).
    Closed(Option<String>),
}

pub struct Connection;

impl Reducer for Connection {
    type State = ConnectionState;
    type Action = ConnectionAction;

    fn reduce(state: &ConnectionState, action: ConnectionAction) -> ConnectionState {
        match action {
            ConnectionAction::Connected => ConnectionState {
                connected: true,
                reconnecting: false,
                last_error: None,
            },
            ConnectionAction::Reconnecting(error) => ConnectionState {
                connected: false,
                reconnecting: true,
                last_error: error.or_else(|| state.last_error.clone()),
            },
            // A clean close keeps whatever error was last reported.
            ConnectionAction::Closed(error) => ConnectionState {
                connected: false,
                reconnecting: false,
                last_error: error.or_else(|| state.last_error.clone()),
            },
        }
    }
}

pub type ConnectionStore = StateStore<Connection>;

//! Derived connection state of a client.
//!
//! The state is never stored. It is computed from whether a connect is in
//! flight, whether a handle is installed and whether that handle reports
//! itself connected:
//!
//! ```text
//! connect or reconnect running ────────► Connecting
//! no handle ───────────────────────────► Idle
//! handle, session lost, re-dialing ────► Connecting
//! handle, CONNACK received ────────────► Connected
//! ```
//!
//! A failed connect removes the handle again, so there is no error state.

use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No handle installed.
    Idle,

    /// A connect is running, or the installed handle lost its session and
    /// the driver is re-establishing it.
    Connecting,

    /// The broker acknowledged the session.
    Connected,
}

impl ConnectionState {
    pub(crate) fn derive(has_handle: bool, handle_connected: bool) -> Self {
        match (has_handle, handle_connected) {
            (false, _) => ConnectionState::Idle,
            (true, false) => ConnectionState::Connecting,
            (true, true) => ConnectionState::Connected,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Idle => "Idle",
            ConnectionState::Connecting => "Connecting",
            ConnectionState::Connected => "Connected",
        }
    }

    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

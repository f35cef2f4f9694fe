//! Manager connection state machine.
//!
//! ```text
//!                 connect()
//!  DISCONNECTED ───────────▶ CONNECTING ──── bind failed ───▶ ERROR
//!       ▲                        │                              │
//!       │                        ▼                              │ connect()
//!       │ disconnect()       CONNECTED ◀──────────┐            ▼
//!       ├────────────────────────┤                │       CONNECTING
//!       │                        │ lost all peers │
//!       │                        ▼                │
//!       └───────────────── RECONNECTING ──────────┘
//! ```
//!
//! Observers subscribe through a `watch` channel and always see the latest state.

use crate::node::error::{NodeError, Result};
use std::fmt;
use tokio::sync::watch;

/// Overall state of the P2P manager
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Not started, or stopped
    Disconnected,
    /// Binding the listener and contacting bootstrap nodes
    Connecting,
    /// Listening; zero or more peers
    Connected,
    /// Lost every peer, retrying the bootstrap set
    Reconnecting,
    /// The listener could not be started
    Error,
}

impl ConnectionState {
    /// Whether `self → next` is a legal transition
    #[must_use]
    pub const fn can_transition_to(self, next: ConnectionState) -> bool {
        use ConnectionState::*;
        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Connected | Error | Disconnected)
                | (Connected, Reconnecting | Disconnected)
                | (Reconnecting, Connected | Disconnected)
                | (Error, Connecting | Disconnected)
        )
    }

    /// Whether the manager is accepting and sending traffic
    #[must_use]
    pub const fn is_online(self) -> bool {
        matches!(self, ConnectionState::Connected | ConnectionState::Reconnecting)
    }

    /// Lowercase name
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Reconnecting => "reconnecting",
            ConnectionState::Error => "error",
        }
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Validated holder of the current [`ConnectionState`]
#[derive(Debug)]
pub struct StateMachine {
    tx: watch::Sender<ConnectionState>,
}

impl Default for StateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl StateMachine {
    /// Start in `Disconnected`
    #[must_use]
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Disconnected);
        Self { tx }
    }

    /// Current state
    #[must_use]
    pub fn current(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    /// Receiver that observes every transition
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Move to `next`, returning the previous state
    ///
    /// # Errors
    ///
    /// Returns `NodeError::InvalidState` if the transition is not allowed.
    pub fn transition(&self, next: ConnectionState) -> Result<ConnectionState> {
        let mut outcome = Err(next);
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(next) {
                outcome = Ok(*state);
                *state = next;
                true
            } else {
                outcome = Err(*state);
                false
            }
        });

        match outcome {
            Ok(prev) => {
                tracing::info!("Connection state {} -> {}", prev, next);
                Ok(prev)
            }
            Err(current) => Err(NodeError::InvalidState(
                format!("cannot move from {current} to {next}").into(),
            )),
        }
    }
}

//! Connection lifecycle state machine
//!
//! `disconnected -> connecting -> connected -> stopping -> disconnected`.
//! Transitions are computed by the pure [`next_state`] function and published
//! through a `watch` channel so pending operations, background tasks and any
//! higher-level reconnect policy can observe them.

use crate::error::ClientError;
use std::fmt;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lifecycle state of a client
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ClientState {
    Disconnected,
    Connecting,
    Connected,
    Stopping,
}

impl fmt::Display for ClientState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ClientState::Disconnected => "disconnected",
            ClientState::Connecting => "connecting",
            ClientState::Connected => "connected",
            ClientState::Stopping => "stopping",
        };
        f.write_str(name)
    }
}

/// Input to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateEvent {
    ConnectRequested,
    ConnectSucceeded,
    ConnectFailed,
    StopRequested,
    StopConfirmed,
    /// A network fault was observed by an operation or background task
    ConnectionLost,
}

/// Compute the state that follows `current` on `event`
///
/// Returns `None` when the event is not legal in `current`.
pub fn next_state(current: ClientState, event: StateEvent) -> Option<ClientState> {
    use ClientState::*;
    use StateEvent::*;

    match (current, event) {
        (Disconnected, ConnectRequested) => Some(Connecting),
        (Connecting, ConnectSucceeded) => Some(Connected),
        (Connecting, ConnectFailed) => Some(Disconnected),
        (Connecting | Connected, StopRequested) => Some(Stopping),
        (Stopping, StopConfirmed) => Some(Disconnected),
        (Connecting | Connected, ConnectionLost) => Some(Disconnected),
        _ => None,
    }
}

/// What a connect request has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectDecision {
    /// The client moved to `Connecting`; the caller owns the attempt
    Start,
    /// Another connect is in flight
    InProgress,
    AlreadyConnected,
    /// A disconnect is in flight
    Rejected(ClientState),
}

/// What a disconnect request has to do
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectDecision {
    /// The client moved to `Stopping`; the caller owns the stop
    Start,
    InProgress,
    AlreadyDisconnected,
}

/// Owner of a client's [`ClientState`]
#[derive(Debug)]
pub struct ConnectionStateMachine {
    state_tx: watch::Sender<ClientState>,
}

impl Default for ConnectionStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionStateMachine {
    pub fn new() -> Self {
        let (state_tx, _) = watch::channel(ClientState::Disconnected);
        Self { state_tx }
    }

    pub fn state(&self) -> ClientState {
        *self.state_tx.borrow()
    }

    /// Receiver notified on every transition
    pub fn subscribe(&self) -> watch::Receiver<ClientState> {
        self.state_tx.subscribe()
    }

    /// Apply `event` atomically
    ///
    /// Returns the new state, or the unchanged current state as the error
    /// when the transition is illegal.
    pub fn apply(&self, event: StateEvent) -> Result<ClientState, ClientState> {
        let mut outcome = Err(ClientState::Disconnected);
        self.state_tx.send_if_modified(|state| match next_state(*state, event) {
            Some(next) => {
                debug!(from = %state, to = %next, ?event, "Client state transition");
                *state = next;
                outcome = Ok(next);
                true
            }
            None => {
                outcome = Err(*state);
                false
            }
        });
        outcome
    }

    pub fn begin_connect(&self) -> ConnectDecision {
        match self.apply(StateEvent::ConnectRequested) {
            Ok(_) => ConnectDecision::Start,
            Err(ClientState::Connecting) => ConnectDecision::InProgress,
            Err(ClientState::Connected) => ConnectDecision::AlreadyConnected,
            Err(state) => ConnectDecision::Rejected(state),
        }
    }

    pub fn begin_disconnect(&self) -> DisconnectDecision {
        match self.apply(StateEvent::StopRequested) {
            Ok(_) => DisconnectDecision::Start,
            Err(ClientState::Stopping) => DisconnectDecision::InProgress,
            Err(_) => DisconnectDecision::AlreadyDisconnected,
        }
    }

    /// Move a `Connecting` client to `Connected`
    pub fn connect_succeeded(&self) -> Result<(), ClientError> {
        self.apply(StateEvent::ConnectSucceeded)
            .map(|_| info!("Client connected"))
            .map_err(|state| ClientError::state("complete connect", state))
    }

    pub fn connect_failed(&self) {
        if let Err(state) = self.apply(StateEvent::ConnectFailed) {
            debug!(%state, "Connect failure observed after state already changed");
        }
    }

    pub fn stop_confirmed(&self) {
        match self.apply(StateEvent::StopConfirmed) {
            Ok(_) => info!("Client disconnected"),
            Err(state) => debug!(%state, "Stop confirmation observed outside stopping state"),
        }
    }

    /// Drop to `Disconnected` after a network fault
    ///
    /// Returns `true` if this call performed the transition. Nothing is
    /// retried here; a reconnect policy watching [`Self::subscribe`] decides
    /// whether to connect again.
    pub fn connection_lost(&self, reason: &str) -> bool {
        match self.apply(StateEvent::ConnectionLost) {
            Ok(_) => {
                warn!("Connection lost: {}", reason);
                true
            }
            Err(_) => false,
        }
    }

    /// Fail unless the client is connected
    pub fn require_connected(&self, operation: &'static str) -> Result<(), ClientError> {
        match self.state() {
            ClientState::Connected => Ok(()),
            state => Err(ClientError::state(operation, state)),
        }
    }
}

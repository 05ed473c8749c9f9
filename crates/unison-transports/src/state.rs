//! Connection state machine shared by every transport client.
//!
//! ```text
//! Idle -> Connecting -> Connected | ConnectionError
//! Connected -> Closing -> Closed
//! Closed | ConnectionError -> Connecting   (next operation)
//! ```

use std::fmt;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Connection state of a transport client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Idle,
    Connecting,
    Connected,
    ConnectionError,
    Closing,
    Closed,
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, Self::Connected)
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::ConnectionError => "connection_error",
            Self::Closing => "closing",
            Self::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// Observable holder of a client's [`ConnectionState`].
///
/// Only the owning client mutates it; anyone may watch it.
#[derive(Debug)]
pub struct StateCell {
    tx: watch::Sender<ConnectionState>,
    transport_id: String,
}

impl StateCell {
    pub fn new(transport_id: impl Into<String>) -> Self {
        let (tx, _rx) = watch::channel(ConnectionState::Idle);
        Self {
            tx,
            transport_id: transport_id.into(),
        }
    }

    pub fn get(&self) -> ConnectionState {
        *self.tx.borrow()
    }

    pub fn set(&self, state: ConnectionState) {
        let previous = self.tx.send_replace(state);
        if previous != state {
            tracing::debug!(
                transport_id = %self.transport_id,
                from = %previous,
                to = %state,
                "Connection state changed"
            );
        }
    }

    pub fn watch(&self) -> watch::Receiver<ConnectionState> {
        self.tx.subscribe()
    }

    /// Wait until the state satisfies `predicate`, up to `timeout`.
    pub async fn wait_for(
        &self,
        timeout: Duration,
        predicate: impl FnMut(&ConnectionState) -> bool,
    ) -> Option<ConnectionState> {
        let mut rx = self.watch();
        let reached = match tokio::time::timeout(timeout, rx.wait_for(predicate)).await {
            Ok(Ok(state)) => Some(*state),
            _ => None,
        };
        reached
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_only_connected_is_connected() {
        for state in [
            ConnectionState::Idle,
            ConnectionState::Connecting,
            ConnectionState::ConnectionError,
            ConnectionState::Closing,
            ConnectionState::Closed,
        ] {
            assert!(!state.is_connected());
        }
        assert!(ConnectionState::Connected.is_connected());
    }

    #[tokio::test]
    async fn test_wait_for_observes_transition() {
        let cell = std::sync::Arc::new(StateCell::new("t1"));
        let setter = cell.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            setter.set(ConnectionState::Connected);
        });
        let state = cell
            .wait_for(Duration::from_secs(1), ConnectionState::is_connected)
            .await;
        assert_eq!(state, Some(ConnectionState::Connected));

        let closed = cell
            .wait_for(Duration::from_millis(20), |s| *s == ConnectionState::Closed)
            .await;
        assert_eq!(closed, None);
    }
}

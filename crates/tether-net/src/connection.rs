//! Per-connection entity and lifecycle state machine.
//!
//! A [`Connection`] owns exactly one [`Channel`] and a state watch that the
//! registry's per-connection worker drives: `New -> Running -> Confirmed`,
//! with `Running | Confirmed -> Errored -> Closed` on I/O failure and
//! `Running | Confirmed -> Closed` on explicit disconnect. `Confirmed`
//! marks the handshake boundary — the peer has acknowledged session
//! establishment, so the session owner can trust the hash. State changes
//! are broadcast via a [`watch`] channel so lifecycle waits never poll.

use std::sync::Arc;

use tokio::sync::{RwLock, watch};

use crate::channel::Channel;

/// Lifecycle state of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Created but the worker has not started yet.
    New,
    /// Worker running, socket open.
    Running,
    /// Peer acknowledged session establishment.
    Confirmed,
    /// An I/O failure was observed; teardown is imminent.
    Errored,
    /// Torn down. Terminal.
    Closed,
}

impl ConnectionState {
    /// Whether the read loop should keep running.
    pub fn is_live(self) -> bool {
        matches!(self, ConnectionState::Running | ConnectionState::Confirmed)
    }

    /// Whether an outbound queue may still attempt sends through this
    /// connection. `Errored` counts: the queue's retry policy decides
    /// when to give up.
    pub fn is_writable(self) -> bool {
        matches!(
            self,
            ConnectionState::Running | ConnectionState::Confirmed | ConnectionState::Errored
        )
    }
}

/// One tracked connection: a channel plus its lifecycle state and the
/// session hash it currently answers to.
pub struct Connection {
    hash: RwLock<String>,
    state_tx: watch::Sender<ConnectionState>,
    channel: Arc<Channel>,
}

impl Connection {
    /// Create a connection in the `New` state.
    pub fn new(hash: String, channel: Arc<Channel>) -> Self {
        let (state_tx, _) = watch::channel(ConnectionState::New);
        Self {
            hash: RwLock::new(hash),
            state_tx,
            channel,
        }
    }

    /// The hash this connection currently answers to.
    pub async fn hash(&self) -> String {
        self.hash.read().await.clone()
    }

    /// Re-identify the connection. Only the registry calls this, and it
    /// mirrors the change on the owning queue under the same lock.
    pub async fn set_hash(&self, hash: &str) {
        *self.hash.write().await = hash.to_string();
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    /// Subscribe to state transitions.
    pub fn subscribe(&self) -> watch::Receiver<ConnectionState> {
        self.state_tx.subscribe()
    }

    /// The underlying channel.
    pub fn channel(&self) -> &Arc<Channel> {
        &self.channel
    }

    /// Move to `state` unless already closed. `Closed` is terminal.
    pub fn transition(&self, state: ConnectionState) {
        self.state_tx.send_modify(|current| {
            if *current != ConnectionState::Closed {
                *current = state;
            }
        });
    }

    /// Mark the peer's session acknowledgement: `Running -> Confirmed`.
    /// Returns whether the transition happened.
    pub fn confirm(&self) -> bool {
        let mut confirmed = false;
        self.state_tx.send_modify(|current| {
            if *current == ConnectionState::Running {
                *current = ConnectionState::Confirmed;
                confirmed = true;
            }
        });
        confirmed
    }

    /// Close the connection and its channel. Idempotent: this is the one
    /// teardown path, shared by explicit disconnect and worker exit.
    pub fn close(&self) {
        self.state_tx.send_modify(|current| *current = ConnectionState::Closed);
        self.channel.close();
    }
}

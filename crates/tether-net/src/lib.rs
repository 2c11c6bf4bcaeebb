//! Connection management for line-oriented game sessions.
//!
//! The crate tracks TCP (or in-memory) connections under short numeric
//! session hashes and relays separator-framed messages over them. The
//! pieces compose bottom-up:
//!
//! - [`codec`]: the wire format — `0x1F`-separated fields on
//!   newline-terminated lines.
//! - [`channel`]: one bidirectional stream, framed as lines, closable from
//!   any task.
//! - [`connection`]: a channel plus its lifecycle state machine.
//! - [`queue`]: per-connection outbound FIFO with retry and
//!   reconnect-window policies.
//! - [`listener`]: cancellable accept loop for inbound connections.
//! - [`registry`]: the orchestrator — hash allocation, message routing,
//!   disconnect tracking and session reconnection.
//!
//! A [`Registry`] with a [`SessionOwner`] callback is the usual entry
//! point; the lower layers are public for direct use and for tests.

pub mod channel;
pub mod codec;
pub mod connection;
pub mod error;
pub mod hash;
pub mod listener;
pub mod queue;
pub mod registry;
pub mod socket;

pub use channel::Channel;
pub use codec::{SEP, decode, encode};
pub use connection::{Connection, ConnectionState};
pub use error::NetError;
pub use listener::AcceptWorker;
pub use queue::{OutboundQueue, QueueConfig, QueueState};
pub use registry::{
    ACTION_DISCONNECT, ACTION_PING, Registry, RegistryConfig, RegistryMode, SessionOwner,
};
pub use socket::SocketConfig;

//! Accept loop for inbound connections.
//!
//! An [`AcceptWorker`] owns a bound [`TcpListener`] and hands every
//! accepted stream to the registry through a bounded [`mpsc`] channel.
//! Shutdown is a cancellable accept: the loop selects between `accept()`
//! and a `watch` run-flag, so unbinding never needs the classic
//! self-connect trick to break a blocking accept. A stream that arrives in
//! the window between the flag flipping and the loop observing it is
//! dropped silently — that is a closing race, not an error.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use crate::error::NetError;
use crate::socket::{self, SocketConfig};

/// Capacity of the accepted-stream handoff channel.
const ACCEPT_BACKLOG: usize = 32;

/// Owns a listening socket and the task draining its accept queue.
pub struct AcceptWorker {
    local_addr: SocketAddr,
    run_tx: watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl AcceptWorker {
    /// Spawn the accept loop on `listener`. Accepted streams are
    /// configured with `config` and sent to the returned receiver.
    pub fn spawn(
        listener: TcpListener,
        config: SocketConfig,
    ) -> io::Result<(Self, mpsc::Receiver<TcpStream>)> {
        let local_addr = listener.local_addr()?;
        let (accepted_tx, accepted_rx) = mpsc::channel(ACCEPT_BACKLOG);
        let (run_tx, mut run_rx) = watch::channel(true);

        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    result = listener.accept() => match result {
                        Ok((stream, peer)) => {
                            if !*run_rx.borrow() {
                                // Woke with a stream after shutdown began.
                                tracing::debug!(%peer, "dropping connection accepted during shutdown");
                                break;
                            }
                            if let Err(e) = socket::configure_stream(&stream, &config) {
                                tracing::warn!(%peer, error = %e, "failed to configure accepted stream");
                                continue;
                            }
                            tracing::info!(%peer, "accepted connection");
                            if accepted_tx.send(stream).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => {
                            tracing::warn!(error = %e, "accept failed, stopping listener");
                            break;
                        }
                    },
                    _ = run_rx.changed() => {
                        if !*run_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            tracing::info!(%local_addr, "listener stopped");
        });

        Ok((
            Self {
                local_addr,
                run_tx,
                task,
            },
            accepted_rx,
        ))
    }

    /// Address the listener is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Clear the run-flag and wait for the accept loop to exit, bounded
    /// by `wait`.
    pub async fn shutdown(self, wait: Duration) -> Result<(), NetError> {
        let _ = self.run_tx.send(false);
        match tokio::time::timeout(wait, self.task).await {
            Ok(_) => Ok(()),
            Err(_) => Err(NetError::Timeout("listener shutdown")),
        }
    }
}

//! The connection registry: the orchestrating core of the subsystem.
//!
//! A [`Registry`] accepts and tracks connections, assigns each a stable
//! session hash, relays encoded lines over them, and coordinates the two
//! reliability features: per-connection outbound queues and
//! disconnect/reconnect identity remapping. It owns the `hash ->
//! connection` and `hash -> queue` maps plus the set of disconnected
//! hashes eligible for reconnection.
//!
//! All shared state lives behind one coarse mutex; registry operations are
//! infrequent relative to per-connection I/O, which runs entirely off that
//! lock. Per-connection read loops and per-queue drain loops are
//! independent tasks whose lifetime is tied to their connection; they hold
//! a [`Weak`] reference back to the registry so dropping it lets them
//! unwind.
//!
//! Incoming lines are decoded and routed: reserved control actions — the
//! empty liveness ping and `disconnect` — are handled internally; anything
//! else reaches the injected [`SessionOwner`] callback, which may be
//! invoked concurrently from multiple connection workers.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;

use crate::channel::Channel;
use crate::codec;
use crate::connection::{Connection, ConnectionState};
use crate::error::NetError;
use crate::hash;
use crate::listener::AcceptWorker;
use crate::queue::{OutboundQueue, QueueConfig, QueueState};
use crate::socket::{self, SocketConfig};

/// Reserved action: the empty liveness ping (a bare newline on the wire).
pub const ACTION_PING: &str = "";
/// Reserved action: peer-initiated orderly close.
pub const ACTION_DISCONNECT: &str = "disconnect";

/// Poll interval for the bounded wait inside [`Registry::close`].
const CLOSE_POLL_INTERVAL: Duration = Duration::from_millis(10);
/// Upper bound on how long a queue worker parks when it has nothing to do.
/// Wakeups normally arrive through notifications; the bound only caps how
/// stale a missed edge can get.
const QUEUE_IDLE_POLL: Duration = Duration::from_millis(50);

/// Consumer of decoded non-control messages.
///
/// Invoked once per message from whichever connection worker received it,
/// so implementations must tolerate concurrent calls.
pub trait SessionOwner: Send + Sync + 'static {
    /// A decoded message arrived on the connection identified by `hash`.
    /// `fields[0]` is the action name; the rest are its parameters.
    fn on_message(&self, hash: &str, fields: &[String]);
}

/// Blanket implementation for closures.
impl<F> SessionOwner for F
where
    F: Fn(&str, &[String]) + Send + Sync + 'static,
{
    fn on_message(&self, hash: &str, fields: &[String]) {
        self(hash, fields);
    }
}

/// Operating mode of a registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RegistryMode {
    /// Outbound-only: no listening socket.
    Dialing,
    /// A listening socket is bound and accepting.
    Listening,
    /// `close()` completed. Terminal.
    Closed,
    /// `close()` could not empty the registry within its bound.
    Errored,
}

/// Tunables for a registry.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Bounded wait for a new connection's worker to leave `New`.
    /// Default: 5 s.
    pub start_timeout: Duration,
    /// Bounded wait for teardown steps during `close()` and listener
    /// unbind. Default: 5 s.
    pub close_timeout: Duration,
    /// Whether new connections get an outbound queue. Default: false.
    pub use_queues: bool,
    /// Whether disconnected hashes are remembered for reconnection.
    /// Default: false.
    pub use_disconnect_tracking: bool,
    /// Retry policy applied to each new queue.
    pub queue: QueueConfig,
    /// Socket options applied to dialed and accepted streams.
    pub socket: SocketConfig,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            start_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(5),
            use_queues: false,
            use_disconnect_tracking: false,
            queue: QueueConfig::default(),
            socket: SocketConfig::default(),
        }
    }
}

/// Everything behind the registry lock.
struct Shared {
    connections: HashMap<String, Arc<Connection>>,
    queues: HashMap<String, Arc<OutboundQueue>>,
    /// Hashes eligible for reconnection, in disconnect order.
    disconnected: Vec<String>,
    mode: RegistryMode,
    use_queues: bool,
    use_disconnect_tracking: bool,
    listener: Option<AcceptWorker>,
}

struct Inner {
    config: RegistryConfig,
    owner: Arc<dyn SessionOwner>,
    shared: Mutex<Shared>,
}

/// Tracks connections and relays messages over them. Cheap to clone; all
/// clones share the same state.
#[derive(Clone)]
pub struct Registry {
    inner: Arc<Inner>,
}

impl Registry {
    /// Create a registry in `Dialing` mode with the given session owner.
    pub fn new(owner: Arc<dyn SessionOwner>, config: RegistryConfig) -> Self {
        let shared = Shared {
            connections: HashMap::new(),
            queues: HashMap::new(),
            disconnected: Vec::new(),
            mode: RegistryMode::Dialing,
            use_queues: config.use_queues,
            use_disconnect_tracking: config.use_disconnect_tracking,
            listener: None,
        };
        Self {
            inner: Arc::new(Inner {
                config,
                owner,
                shared: Mutex::new(shared),
            }),
        }
    }

    /// Dial `addr` and register the resulting connection. Returns its hash.
    pub async fn connect(&self, addr: SocketAddr) -> Result<String, NetError> {
        let channel = Channel::dial(addr, &self.inner.config.socket).await?;
        Inner::adopt_channel(&self.inner, channel).await
    }

    /// Register an already-connected TCP stream. Returns its hash.
    pub async fn adopt_stream(&self, stream: TcpStream) -> Result<String, NetError> {
        socket::configure_stream(&stream, &self.inner.config.socket)?;
        Inner::adopt_channel(&self.inner, Channel::from_stream(stream)).await
    }

    /// Register an already-open channel. Returns its hash. Tests use this
    /// with in-memory duplex channels.
    pub async fn adopt_channel(&self, channel: Channel) -> Result<String, NetError> {
        Inner::adopt_channel(&self.inner, channel).await
    }

    /// Tear down the connection at `hash`, unblocking its worker even if
    /// it is parked in a read. Unknown hashes are a logged no-op. If
    /// disconnect tracking is enabled the hash becomes eligible for
    /// reconnection and its queue is suspended; otherwise the queue is
    /// torn down with it.
    pub async fn disconnect(&self, hash: &str) {
        self.inner.disconnect(hash).await;
    }

    /// Encode and deliver one message to `hash` — through its queue when
    /// one exists, directly through its channel otherwise. A direct send
    /// that fails disconnects the connection and surfaces the I/O error.
    pub async fn send(&self, hash: &str, action: &str, params: &[&str]) -> Result<(), NetError> {
        self.inner.send_line(hash, codec::encode(action, params)).await
    }

    /// Send one message to several hashes. Per-hash failures are logged
    /// and skipped; the rest of the batch still goes out.
    pub async fn send_to_many(&self, hashes: &[&str], action: &str, params: &[&str]) {
        let line = codec::encode(action, params);
        for hash in hashes {
            if let Err(e) = self.inner.send_line(hash, line.clone()).await {
                tracing::warn!(%hash, error = %e, "send to one of many failed, skipping");
            }
        }
    }

    /// Probe every live connection with an empty message. Connections
    /// whose write fails are disconnected.
    pub async fn ping_all(&self) {
        self.inner.ping_all().await;
    }

    /// Re-identify the connection at `old` as `new`, mirroring the change
    /// on its queue. Whatever previously answered to `new` is disconnected
    /// first. Replacing a hash with itself is rejected.
    pub async fn replace_hash(&self, old: &str, new: &str) -> Result<(), NetError> {
        let mut shared = self.inner.shared.lock().await;
        self.inner.replace_hash_locked(&mut shared, old, new).await
    }

    /// The reconnection protocol: let the live connection at `current`
    /// resume the tracked session `saved`. Returns `false` without effect
    /// when tracking is disabled, `saved` is not tracked (including after
    /// its reconnect window expired), or `current == saved`. On success
    /// the connection answers to `saved`, the suspended queue resumes and
    /// drains its buffered messages in order, and `saved` leaves the
    /// tracked set.
    pub async fn connect_disconnected_socket(
        &self,
        current: &str,
        saved: &str,
    ) -> Result<bool, NetError> {
        self.inner.connect_disconnected_socket(current, saved).await
    }

    /// Record the peer's session acknowledgement: `Running -> Confirmed`.
    pub async fn confirm(&self, hash: &str) -> Result<(), NetError> {
        let conn = self
            .inner
            .connection_for(hash)
            .await
            .ok_or_else(|| NetError::HashNotFound(hash.to_string()))?;
        if conn.confirm() {
            tracing::debug!(%hash, "session confirmed");
        }
        Ok(())
    }

    /// Suspend draining of the queue at `hash`.
    pub async fn pause_queue(&self, hash: &str) -> Result<(), NetError> {
        self.inner.queue_for(hash).await?.pause();
        Ok(())
    }

    /// Resume draining of the queue at `hash`.
    pub async fn resume_queue(&self, hash: &str) -> Result<(), NetError> {
        self.inner.queue_for(hash).await?.resume();
        Ok(())
    }

    /// Drop every pending message on the queue at `hash`.
    pub async fn clear_queue(&self, hash: &str) -> Result<(), NetError> {
        self.inner.queue_for(hash).await?.clear().await;
        Ok(())
    }

    /// Set or clear the reconnect window of the queue at `hash`.
    pub async fn set_queue_reconnect_timeout(
        &self,
        hash: &str,
        timeout: Option<Duration>,
    ) -> Result<(), NetError> {
        self.inner
            .queue_for(hash)
            .await?
            .set_reconnect_timeout(timeout)
            .await;
        Ok(())
    }

    /// Toggle outbound queuing. Enabling applies to connections registered
    /// from now on; disabling tears down every existing queue.
    pub async fn set_use_queues(&self, enabled: bool) {
        let drained: Vec<Arc<OutboundQueue>> = {
            let mut shared = self.inner.shared.lock().await;
            shared.use_queues = enabled;
            if enabled {
                Vec::new()
            } else {
                shared.queues.drain().map(|(_, queue)| queue).collect()
            }
        };
        for queue in drained {
            queue.close().await;
        }
    }

    /// Toggle disconnect tracking. Disabling forgets every tracked hash
    /// and closes queues suspended on them.
    pub async fn set_use_disconnect_tracking(&self, enabled: bool) {
        let closed: Vec<Arc<OutboundQueue>> = {
            let mut shared = self.inner.shared.lock().await;
            shared.use_disconnect_tracking = enabled;
            if enabled {
                Vec::new()
            } else {
                shared.disconnected.clear();
                let suspended: Vec<String> = shared
                    .queues
                    .iter()
                    .filter(|(_, queue)| queue.state().is_disconnected())
                    .map(|(hash, _)| hash.clone())
                    .collect();
                suspended
                    .into_iter()
                    .filter_map(|hash| shared.queues.remove(&hash))
                    .collect()
            }
        };
        for queue in closed {
            queue.close().await;
        }
    }

    /// Bind a listening socket on all interfaces at `port` and start
    /// accepting. Returns the bound address (useful with port 0).
    pub async fn bind_listener(&self, port: u16) -> Result<SocketAddr, NetError> {
        self.bind_listener_addr(SocketAddr::from((Ipv4Addr::UNSPECIFIED, port)))
            .await
    }

    /// Bind a listening socket on `addr` and start accepting. Every
    /// accepted stream becomes a tracked connection.
    pub async fn bind_listener_addr(&self, addr: SocketAddr) -> Result<SocketAddr, NetError> {
        let inner = &self.inner;
        let mut shared = inner.shared.lock().await;
        if shared.mode == RegistryMode::Closed {
            return Err(NetError::InvalidArgument("registry is closed".into()));
        }
        if shared.listener.is_some() {
            return Err(NetError::InvalidArgument("listener already bound".into()));
        }

        let listener = TcpListener::bind(addr).await?;
        let (worker, mut accepted_rx) = AcceptWorker::spawn(listener, inner.config.socket.clone())?;
        let local_addr = worker.local_addr();
        shared.listener = Some(worker);
        shared.mode = RegistryMode::Listening;
        drop(shared);

        let weak = Arc::downgrade(inner);
        tokio::spawn(async move {
            while let Some(stream) = accepted_rx.recv().await {
                let Some(inner) = weak.upgrade() else { break };
                if let Err(e) = Inner::adopt_channel(&inner, Channel::from_stream(stream)).await {
                    tracing::warn!(error = %e, "failed to register accepted connection");
                }
            }
        });

        tracing::info!(%local_addr, "listening");
        Ok(local_addr)
    }

    /// Stop accepting and release the listening socket, bounded by the
    /// close timeout. A no-op when nothing is bound.
    pub async fn unbind_listener(&self) -> Result<(), NetError> {
        let listener = {
            let mut shared = self.inner.shared.lock().await;
            let listener = shared.listener.take();
            if listener.is_some() && shared.mode == RegistryMode::Listening {
                shared.mode = RegistryMode::Dialing;
            }
            listener
        };
        match listener {
            Some(worker) => worker.shutdown(self.inner.config.close_timeout).await,
            None => Ok(()),
        }
    }

    /// Tear everything down: stop tracking disconnects, unbind the
    /// listener, disconnect every live connection, and remove every queue,
    /// waiting (bounded) for the registry to empty before declaring it
    /// `Closed`. Safe to call when some connections are already gone.
    pub async fn close(&self) -> Result<(), NetError> {
        let inner = &self.inner;
        {
            let mut shared = inner.shared.lock().await;
            shared.use_disconnect_tracking = false;
            shared.disconnected.clear();
        }
        self.unbind_listener().await?;

        let hashes: Vec<String> = {
            let shared = inner.shared.lock().await;
            shared.connections.keys().cloned().collect()
        };
        for hash in &hashes {
            inner.disconnect(hash).await;
        }

        let queues: Vec<Arc<OutboundQueue>> = {
            let mut shared = inner.shared.lock().await;
            shared.queues.drain().map(|(_, queue)| queue).collect()
        };
        for queue in queues {
            queue.close().await;
        }

        let deadline = tokio::time::Instant::now() + inner.config.close_timeout;
        loop {
            let (connections, queues) = {
                let shared = inner.shared.lock().await;
                (shared.connections.len(), shared.queues.len())
            };
            if connections == 0 && queues == 0 {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                inner.shared.lock().await.mode = RegistryMode::Errored;
                return Err(NetError::Timeout("registry close"));
            }
            tokio::time::sleep(CLOSE_POLL_INTERVAL).await;
        }

        inner.shared.lock().await.mode = RegistryMode::Closed;
        tracing::info!("registry closed");
        Ok(())
    }

    /// Current operating mode.
    pub async fn mode(&self) -> RegistryMode {
        self.inner.shared.lock().await.mode
    }

    /// Number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.inner.shared.lock().await.connections.len()
    }

    /// Number of queues, live or suspended.
    pub async fn queue_count(&self) -> usize {
        self.inner.shared.lock().await.queues.len()
    }

    /// Whether `hash` is currently eligible for reconnection.
    pub async fn is_tracked(&self, hash: &str) -> bool {
        self.inner
            .shared
            .lock()
            .await
            .disconnected
            .iter()
            .any(|h| h == hash)
    }

    /// State of the connection at `hash`, if one exists.
    pub async fn connection_state(&self, hash: &str) -> Option<ConnectionState> {
        self.inner
            .shared
            .lock()
            .await
            .connections
            .get(hash)
            .map(|conn| conn.state())
    }

    /// State of the queue at `hash`, if one exists.
    pub async fn queue_state(&self, hash: &str) -> Option<QueueState> {
        self.inner
            .shared
            .lock()
            .await
            .queues
            .get(hash)
            .map(|queue| queue.state())
    }
}

impl Inner {
    /// Register a channel: allocate a unique hash, insert the connection
    /// (and queue, when enabled), spawn its workers, and wait — bounded —
    /// for the worker to leave `New`. A start timeout removes the
    /// half-created entry before surfacing the error.
    async fn adopt_channel(inner: &Arc<Inner>, channel: Channel) -> Result<String, NetError> {
        let channel = Arc::new(channel);
        let (hash, conn, queue) = {
            let mut shared = inner.shared.lock().await;
            if shared.mode == RegistryMode::Closed {
                return Err(NetError::InvalidArgument("registry is closed".into()));
            }
            let hash = hash::unique_hash(|candidate| {
                shared.connections.contains_key(candidate)
                    || shared.queues.contains_key(candidate)
                    || shared.disconnected.iter().any(|h| h == candidate)
            });
            let conn = Arc::new(Connection::new(hash.clone(), channel));
            shared.connections.insert(hash.clone(), Arc::clone(&conn));
            let queue = if shared.use_queues {
                let queue = Arc::new(OutboundQueue::new(hash.clone(), inner.config.queue.clone()));
                shared.queues.insert(hash.clone(), Arc::clone(&queue));
                Some(queue)
            } else {
                None
            };
            (hash, conn, queue)
        };

        let mut state_rx = conn.subscribe();
        tokio::spawn(run_connection(Arc::downgrade(inner), Arc::clone(&conn)));
        if let Some(queue) = queue {
            tokio::spawn(run_queue(Arc::downgrade(inner), queue));
        }

        let started = tokio::time::timeout(
            inner.config.start_timeout,
            state_rx.wait_for(|state| *state != ConnectionState::New),
        )
        .await
        // The watch guard must not be held across the cleanup lock below.
        .map(|result| result.map(|_| ()));
        match started {
            Ok(Ok(())) => {
                tracing::info!(%hash, "connection registered");
                Ok(hash)
            }
            _ => {
                let mut shared = inner.shared.lock().await;
                if let Some(conn) = shared.connections.remove(&hash) {
                    conn.close();
                }
                if let Some(queue) = shared.queues.remove(&hash) {
                    queue.close().await;
                }
                Err(NetError::Timeout("connection worker start"))
            }
        }
    }

    async fn connection_for(&self, hash: &str) -> Option<Arc<Connection>> {
        self.shared.lock().await.connections.get(hash).cloned()
    }

    async fn queue_for(&self, hash: &str) -> Result<Arc<OutboundQueue>, NetError> {
        let shared = self.shared.lock().await;
        if !shared.use_queues {
            return Err(NetError::FeatureNotUsed("outbound queues"));
        }
        shared
            .queues
            .get(hash)
            .cloned()
            .ok_or_else(|| NetError::HashNotFound(hash.to_string()))
    }

    /// Dispatch one decoded message: reserved control actions are handled
    /// here, everything else reaches the session owner.
    async fn route(&self, hash: &str, fields: Vec<String>) {
        let action = fields.first().map(String::as_str).unwrap_or(ACTION_PING);
        match action {
            ACTION_PING if fields.len() == 1 => {
                tracing::trace!(%hash, "ping");
            }
            ACTION_DISCONNECT => {
                tracing::info!(%hash, "peer requested disconnect");
                self.disconnect(hash).await;
            }
            _ => self.owner.on_message(hash, &fields),
        }
    }

    async fn disconnect(&self, hash: &str) {
        let mut shared = self.shared.lock().await;
        self.disconnect_locked(&mut shared, hash).await;
    }

    async fn disconnect_locked(&self, shared: &mut Shared, hash: &str) {
        let Some(conn) = shared.connections.remove(hash) else {
            tracing::info!(%hash, "disconnect for unknown hash, nothing to do");
            return;
        };
        conn.close();

        if shared.use_disconnect_tracking {
            if !shared.disconnected.iter().any(|h| h == hash) {
                shared.disconnected.push(hash.to_string());
            }
            if let Some(queue) = shared.queues.get(hash) {
                queue.set_disconnected();
            }
            tracing::info!(%hash, "disconnected, hash tracked for reconnection");
        } else {
            if let Some(queue) = shared.queues.remove(hash) {
                queue.close().await;
            }
            tracing::info!(%hash, "disconnected");
        }
    }

    async fn replace_hash_locked(
        &self,
        shared: &mut Shared,
        old: &str,
        new: &str,
    ) -> Result<(), NetError> {
        if old == new {
            return Err(NetError::InvalidArgument(format!(
                "cannot replace hash {old} with itself"
            )));
        }
        if !shared.connections.contains_key(old) {
            return Err(NetError::HashNotFound(old.to_string()));
        }

        // Whatever currently answers to `new` gets out of the way first:
        // a live connection, a tracked disconnected hash, or a queue still
        // keyed there (suspended or not). A hash is never simultaneously a
        // live connection and a tracked disconnected hash.
        if shared.connections.contains_key(new) {
            self.disconnect_locked(shared, new).await;
        }
        shared.disconnected.retain(|h| h != new);
        if let Some(queue) = shared.queues.remove(new) {
            queue.close().await;
        }

        let Some(conn) = shared.connections.remove(old) else {
            return Err(NetError::HashNotFound(old.to_string()));
        };
        conn.set_hash(new).await;
        shared.connections.insert(new.to_string(), conn);

        if let Some(queue) = shared.queues.remove(old) {
            queue.set_hash(new).await;
            if let Some(previous) = shared.queues.insert(new.to_string(), queue) {
                previous.close().await;
            }
        }

        tracing::info!(%old, %new, "hash replaced");
        Ok(())
    }

    async fn connect_disconnected_socket(
        &self,
        current: &str,
        saved: &str,
    ) -> Result<bool, NetError> {
        let mut shared = self.shared.lock().await;
        if !shared.use_disconnect_tracking {
            return Ok(false);
        }
        if current == saved {
            return Ok(false);
        }
        if !shared.disconnected.iter().any(|h| h == saved) {
            // Either never tracked or the reconnect window already
            // expired and the queue evicted itself.
            return Ok(false);
        }
        // Validate before mutating anything: a failed call must leave the
        // suspended session intact.
        if !shared.connections.contains_key(current) {
            return Err(NetError::HashNotFound(current.to_string()));
        }

        // The fresh connection's own (empty) queue is superseded by the
        // suspended one holding messages buffered across the disconnect.
        // Lift the suspended queue out of the map so the re-key's purge of
        // `saved` cannot close it.
        let suspended = shared.queues.remove(saved);
        if suspended.is_some() {
            if let Some(fresh) = shared.queues.remove(current) {
                fresh.close().await;
            }
        }

        self.replace_hash_locked(&mut shared, current, saved).await?;
        shared.disconnected.retain(|h| h != saved);
        if let Some(queue) = suspended {
            queue.resume();
            shared.queues.insert(saved.to_string(), queue);
        } else if let Some(queue) = shared.queues.get(saved) {
            queue.resume();
        }
        tracing::info!(%current, %saved, "reconnected to saved session");
        Ok(true)
    }

    /// A suspended queue's reconnect window elapsed: forget both the queue
    /// and the tracked hash, but only if the map still holds this exact
    /// queue — the hash may have been reassigned meanwhile.
    async fn evict_queue(&self, hash: &str, queue: &Arc<OutboundQueue>) {
        let mut shared = self.shared.lock().await;
        let matches = shared
            .queues
            .get(hash)
            .is_some_and(|current| Arc::ptr_eq(current, queue));
        if matches {
            shared.queues.remove(hash);
            shared.disconnected.retain(|h| h != hash);
            tracing::info!(%hash, "reconnect window elapsed, session evicted");
        }
    }

    async fn send_line(&self, hash: &str, line: String) -> Result<(), NetError> {
        enum Target {
            Queue(Arc<OutboundQueue>),
            Direct(Arc<Channel>),
        }

        let target = {
            let shared = self.shared.lock().await;
            if let Some(queue) = shared.queues.get(hash) {
                Target::Queue(Arc::clone(queue))
            } else if let Some(conn) = shared.connections.get(hash) {
                Target::Direct(Arc::clone(conn.channel()))
            } else {
                return Err(NetError::HashNotFound(hash.to_string()));
            }
        };

        match target {
            Target::Queue(queue) => {
                if queue.enqueue(line).await {
                    Ok(())
                } else {
                    Err(NetError::HashNotFound(hash.to_string()))
                }
            }
            Target::Direct(channel) => match channel.send(&line).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // A failed direct write means the transport is gone.
                    self.disconnect(hash).await;
                    Err(NetError::Io(e))
                }
            },
        }
    }

    async fn ping_all(&self) {
        let targets: Vec<(String, Arc<Channel>)> = {
            let shared = self.shared.lock().await;
            shared
                .connections
                .iter()
                .map(|(hash, conn)| (hash.clone(), Arc::clone(conn.channel())))
                .collect()
        };
        for (hash, channel) in targets {
            if let Err(e) = channel.send(ACTION_PING).await {
                tracing::warn!(%hash, error = %e, "ping failed, disconnecting");
                self.disconnect(&hash).await;
            }
        }
    }
}

/// Per-connection worker: blocks reading lines, decodes them, and hands
/// them to the router. Orderly EOF is turned into the same `disconnect`
/// control message a peer would send explicitly. Exiting the loop always
/// runs the (idempotent) close path.
async fn run_connection(inner: Weak<Inner>, conn: Arc<Connection>) {
    conn.transition(ConnectionState::Running);
    loop {
        if !conn.state().is_live() {
            break;
        }
        match conn.channel().receive().await {
            Ok(Some(line)) => {
                let Some(inner) = inner.upgrade() else { break };
                let hash = conn.hash().await;
                inner.route(&hash, codec::decode(&line)).await;
            }
            Ok(None) => {
                // Skip the synthetic disconnect if an explicit close beat
                // us to it; that race is the normal local teardown.
                if conn.state().is_live() {
                    let Some(inner) = inner.upgrade() else { break };
                    let hash = conn.hash().await;
                    inner.route(&hash, vec![ACTION_DISCONNECT.to_string()]).await;
                }
                break;
            }
            Err(e) => {
                tracing::warn!(error = %e, "connection read failed");
                if conn.state().is_live() {
                    conn.transition(ConnectionState::Errored);
                    if let Some(inner) = inner.upgrade() {
                        let hash = conn.hash().await;
                        inner.disconnect(&hash).await;
                    }
                }
                break;
            }
        }
    }
    conn.close();
    tracing::debug!("connection worker exited");
}

/// Per-queue worker: drains the FIFO through the owning connection's
/// channel and drives the retry and reconnect-window policies.
async fn run_queue(inner: Weak<Inner>, queue: Arc<OutboundQueue>) {
    queue.start();
    loop {
        let mut state_rx = queue.subscribe();
        let state = *state_rx.borrow_and_update();
        match state {
            QueueState::Closed => break,
            QueueState::New => queue.start(),
            QueueState::Paused => {
                let _ = state_rx.changed().await;
            }
            QueueState::Disconnected { since } => match queue.reconnect_timeout().await {
                None => {
                    // No window configured: wait for resume or close. The
                    // timeout also re-checks a window set after the fact.
                    let _ = tokio::time::timeout(QUEUE_IDLE_POLL, state_rx.changed()).await;
                }
                Some(window) => {
                    let remaining = window.saturating_sub(since.elapsed());
                    if remaining.is_zero() {
                        let hash = queue.hash().await;
                        tracing::warn!(%hash, "reconnect window elapsed, closing queue");
                        queue.close().await;
                        if let Some(inner) = inner.upgrade() {
                            inner.evict_queue(&hash, &queue).await;
                        }
                        break;
                    }
                    let _ = tokio::time::timeout(remaining, state_rx.changed()).await;
                }
            },
            QueueState::Running | QueueState::Errored { .. } => {
                let Some(line) = queue.peek().await else {
                    let _ = tokio::time::timeout(QUEUE_IDLE_POLL, async {
                        tokio::select! {
                            _ = queue.work_notified() => {}
                            _ = state_rx.changed() => {}
                        }
                    })
                    .await;
                    continue;
                };

                let Some(registry) = inner.upgrade() else { break };
                let hash = queue.hash().await;
                let Some(conn) = registry.connection_for(&hash).await else {
                    // Connection gone but the queue not yet suspended or
                    // closed; let the registry settle.
                    tokio::time::sleep(queue.config().retry_interval).await;
                    continue;
                };
                if !conn.state().is_writable() {
                    tokio::time::sleep(queue.config().retry_interval).await;
                    continue;
                }

                match conn.channel().send(&line).await {
                    Ok(()) => {
                        queue.pop_if_head(&line).await;
                        queue.mark_sent();
                    }
                    Err(e) => {
                        let since = queue.mark_errored();
                        if since.elapsed() >= queue.config().send_timeout {
                            tracing::warn!(
                                %hash, error = %e,
                                "send retries exhausted, disconnecting"
                            );
                            queue.pop_if_head(&line).await;
                            registry.disconnect(&hash).await;
                        } else {
                            tracing::debug!(%hash, error = %e, "send failed, will retry");
                            tokio::time::sleep(queue.config().retry_interval).await;
                        }
                    }
                }
            }
        }
    }
    tracing::debug!("queue worker exited");
}

//! TCP socket options applied to every dialed and accepted stream.
//!
//! Keepalive probes catch peers that vanished without a FIN; Nagle is
//! disabled because the protocol exchanges small latency-sensitive lines.

use std::time::Duration;

use socket2::{SockRef, TcpKeepalive};
use tokio::net::TcpStream;

/// Socket options for connection streams.
#[derive(Debug, Clone)]
pub struct SocketConfig {
    /// Disable Nagle's algorithm. Default: true.
    pub nodelay: bool,
    /// Enable TCP keepalive probes. Default: true.
    pub keepalive: bool,
    /// Idle time before the first keepalive probe. Default: 60 s.
    pub keepalive_idle: Duration,
    /// Interval between keepalive probes. Default: 10 s.
    pub keepalive_interval: Duration,
}

impl Default for SocketConfig {
    fn default() -> Self {
        Self {
            nodelay: true,
            keepalive: true,
            keepalive_idle: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(10),
        }
    }
}

/// Apply the configured options to a connected stream.
pub fn configure_stream(stream: &TcpStream, config: &SocketConfig) -> std::io::Result<()> {
    stream.set_nodelay(config.nodelay)?;

    if config.keepalive {
        let sock_ref = SockRef::from(stream);
        let keepalive = TcpKeepalive::new()
            .with_time(config.keepalive_idle)
            .with_interval(config.keepalive_interval);
        sock_ref.set_tcp_keepalive(&keepalive)?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_configure_connected_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let accept = tokio::spawn(async move { listener.accept().await.unwrap() });

        let stream = TcpStream::connect(addr).await.unwrap();
        configure_stream(&stream, &SocketConfig::default()).unwrap();
        assert!(stream.nodelay().unwrap());

        accept.await.unwrap();
    }

    #[test]
    fn test_defaults() {
        let config = SocketConfig::default();
        assert!(config.nodelay);
        assert!(config.keepalive);
        assert_eq!(config.keepalive_idle, Duration::from_secs(60));
    }
}

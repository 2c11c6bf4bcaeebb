//! Line-oriented wrapper around one bidirectional byte stream.
//!
//! A [`Channel`] owns both halves of a stream and exposes blocking-style
//! `send`/`receive` for newline-terminated lines. Orderly peer close and
//! local [`Channel::close`] both surface as an end-of-stream sentinel
//! (`Ok(None)`) rather than an error; hard transport failures surface as
//! `Err`. `close` is idempotent and may be called from any task to unblock
//! a pending `receive` or `send` — the mechanism a disconnect uses to
//! cancel a worker parked in a read.

use std::io;
use std::net::SocketAddr;

use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::sync::{Mutex, watch};

use crate::socket::{self, SocketConfig};

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// One open bidirectional stream, framed as lines.
pub struct Channel {
    reader: Mutex<BufReader<BoxedReader>>,
    writer: Mutex<BoxedWriter>,
    closed_tx: watch::Sender<bool>,
    peer: Option<SocketAddr>,
}

impl Channel {
    /// Dial `addr` and wrap the resulting stream.
    pub async fn dial(addr: SocketAddr, config: &SocketConfig) -> io::Result<Self> {
        let stream = TcpStream::connect(addr).await?;
        socket::configure_stream(&stream, config)?;
        Ok(Self::from_stream(stream))
    }

    /// Wrap an already-connected TCP stream.
    pub fn from_stream(stream: TcpStream) -> Self {
        let peer = stream.peer_addr().ok();
        let (reader, writer) = stream.into_split();
        Self::build(Box::new(reader), Box::new(writer), peer)
    }

    /// Wrap an arbitrary read/write pair. Tests use this with
    /// [`tokio::io::duplex`] to get in-memory channels.
    pub fn from_parts<R, W>(reader: R, writer: W) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
        W: AsyncWrite + Send + Unpin + 'static,
    {
        Self::build(Box::new(reader), Box::new(writer), None)
    }

    fn build(reader: BoxedReader, writer: BoxedWriter, peer: Option<SocketAddr>) -> Self {
        let (closed_tx, _) = watch::channel(false);
        Self {
            reader: Mutex::new(BufReader::new(reader)),
            writer: Mutex::new(writer),
            closed_tx,
            peer,
        }
    }

    /// Peer address, when the underlying stream has one.
    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.peer
    }

    /// Send one line, appending the newline terminator.
    ///
    /// Fails with an I/O error if the transport rejects the write or the
    /// channel was closed locally.
    pub async fn send(&self, line: &str) -> io::Result<()> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"));
        }

        let mut writer = self.writer.lock().await;
        tokio::select! {
            result = async {
                writer.write_all(line.as_bytes()).await?;
                writer.write_all(b"\n").await?;
                writer.flush().await
            } => result,
            _ = closed_rx.wait_for(|closed| *closed) => {
                Err(io::Error::new(io::ErrorKind::BrokenPipe, "channel closed"))
            }
        }
    }

    /// Receive the next line, blocking until one is available.
    ///
    /// Returns `Ok(None)` when the peer performs an orderly close or the
    /// channel is closed locally; the trailing newline (and any carriage
    /// return) is stripped from returned lines.
    pub async fn receive(&self) -> io::Result<Option<String>> {
        let mut closed_rx = self.closed_tx.subscribe();
        if *closed_rx.borrow() {
            return Ok(None);
        }

        let mut reader = self.reader.lock().await;
        let mut line = String::new();
        tokio::select! {
            result = reader.read_line(&mut line) => match result {
                Ok(0) => Ok(None),
                Ok(_) => {
                    while line.ends_with('\n') || line.ends_with('\r') {
                        line.pop();
                    }
                    Ok(Some(line))
                }
                Err(e) => Err(e),
            },
            _ = closed_rx.wait_for(|closed| *closed) => Ok(None),
        }
    }

    /// Close the channel, unblocking any pending `receive` or `send`.
    /// Safe to call repeatedly and from any task.
    pub fn close(&self) {
        // send_replace updates the flag even while no receiver exists;
        // receive/send only subscribe transiently.
        self.closed_tx.send_replace(true);
    }

    /// Whether the channel has been closed locally.
    pub fn is_closed(&self) -> bool {
        *self.closed_tx.borrow()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;

    fn duplex_channel() -> (Channel, tokio::io::DuplexStream) {
        let (near, far) = tokio::io::duplex(4096);
        let (reader, writer) = tokio::io::split(near);
        (Channel::from_parts(reader, writer), far)
    }

    #[tokio::test]
    async fn test_send_appends_newline() {
        let (channel, far) = duplex_channel();
        channel.send("hello").await.unwrap();

        let mut lines = BufReader::new(far).lines();
        assert_eq!(lines.next_line().await.unwrap(), Some("hello".to_string()));
    }

    #[tokio::test]
    async fn test_receive_strips_newline() {
        let (channel, mut far) = duplex_channel();
        far.write_all(b"one\ntwo\r\n").await.unwrap();

        assert_eq!(channel.receive().await.unwrap(), Some("one".to_string()));
        assert_eq!(channel.receive().await.unwrap(), Some("two".to_string()));
    }

    #[tokio::test]
    async fn test_peer_eof_is_end_of_stream() {
        let (channel, far) = duplex_channel();
        drop(far);
        assert_eq!(channel.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_close_unblocks_pending_receive() {
        let (channel, _far) = duplex_channel();
        let channel = Arc::new(channel);

        let receiver = Arc::clone(&channel);
        let task = tokio::spawn(async move { receiver.receive().await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        channel.close();

        let received = tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("receive should unblock after close")
            .unwrap();
        assert_eq!(received.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let (channel, _far) = duplex_channel();
        channel.close();
        assert!(channel.send("late").await.is_err());
    }

    #[tokio::test]
    async fn test_close_is_idempotent() {
        let (channel, _far) = duplex_channel();
        channel.close();
        channel.close();
        assert!(channel.is_closed());
        assert_eq!(channel.receive().await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_send_fails_after_peer_drops() {
        let (channel, far) = duplex_channel();
        drop(far);
        // The duplex buffer may absorb a first write; flushing repeatedly
        // must surface the broken pipe.
        let mut failed = false;
        for _ in 0..16 {
            if channel.send("x").await.is_err() {
                failed = true;
                break;
            }
        }
        assert!(failed, "writes to a dropped peer should fail");
    }
}

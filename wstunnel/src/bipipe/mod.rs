// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The Bipipe virtual I/O layer.
//!
//! A [Bipipe] is a uniform bidirectional byte stream with half-close: either
//! a wrapped local OS socket created by a stub or skeleton endpoint, or a
//! wrapped SSH sub-stream created by the session. When a channel opens, one
//! of each is created and a [bridge::BipipeBridge] forwards traffic between
//! them in both directions. Like a TCP socket, the write side may be closed
//! while reads continue, supporting write-request/close/read-response
//! patterns.

use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use futures::Future;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio_util::sync::WaitForCancellationFutureOwned;

use crate::common::TunnelError;
use crate::util::shutdown::Shutdown;
use crate::util::alloc_connection_id;

pub mod bridge;
pub mod dialer;
pub mod listener;
pub mod loopback;
pub mod net;
pub mod ssh;
pub mod stdio;
pub mod unix_lock;

/// Byte counters for one bipipe, shared with observers.
#[derive(Debug, Default)]
pub struct ByteCounters {
  read: AtomicU64,
  written: AtomicU64,
}

impl ByteCounters {
  pub fn bytes_read(&self) -> u64 {
    self.read.load(Ordering::Relaxed)
  }

  pub fn bytes_written(&self) -> u64 {
    self.written.load(Ordering::Relaxed)
  }
}

/// Metadata about one accepted or dialed connection.
#[derive(Debug, Clone, Default)]
pub struct ConnectionInfo {
  pub description: String,
  pub peer_addr: Option<std::net::SocketAddr>,
}

impl ConnectionInfo {
  pub fn new(description: impl Into<String>) -> Self {
    Self {
      description: description.into(),
      peer_addr: None,
    }
  }

  pub fn with_peer(description: impl Into<String>, peer: std::net::SocketAddr) -> Self {
    Self {
      description: description.into(),
      peer_addr: Some(peer),
    }
  }
}

/// The closed set of transports a [Bipipe] can wrap.
pub enum BipipeStream {
  Tcp(tokio::net::TcpStream),
  Unix(tokio::net::UnixStream),
  Duplex(tokio::io::DuplexStream),
  SshClient(russh::ChannelStream<russh::client::Msg>),
  SshServer(russh::ChannelStream<russh::server::Msg>),
  Merged {
    reader: Box<dyn AsyncRead + Send + Unpin>,
    writer: Box<dyn AsyncWrite + Send + Unpin>,
  },
}

impl AsyncRead for BipipeStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      BipipeStream::Tcp(s) => Pin::new(s).poll_read(cx, buf),
      BipipeStream::Unix(s) => Pin::new(s).poll_read(cx, buf),
      BipipeStream::Duplex(s) => Pin::new(s).poll_read(cx, buf),
      BipipeStream::SshClient(s) => Pin::new(s).poll_read(cx, buf),
      BipipeStream::SshServer(s) => Pin::new(s).poll_read(cx, buf),
      BipipeStream::Merged { reader, .. } => Pin::new(reader).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for BipipeStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      BipipeStream::Tcp(s) => Pin::new(s).poll_write(cx, buf),
      BipipeStream::Unix(s) => Pin::new(s).poll_write(cx, buf),
      BipipeStream::Duplex(s) => Pin::new(s).poll_write(cx, buf),
      BipipeStream::SshClient(s) => Pin::new(s).poll_write(cx, buf),
      BipipeStream::SshServer(s) => Pin::new(s).poll_write(cx, buf),
      BipipeStream::Merged { writer, .. } => Pin::new(writer).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      BipipeStream::Tcp(s) => Pin::new(s).poll_flush(cx),
      BipipeStream::Unix(s) => Pin::new(s).poll_flush(cx),
      BipipeStream::Duplex(s) => Pin::new(s).poll_flush(cx),
      BipipeStream::SshClient(s) => Pin::new(s).poll_flush(cx),
      BipipeStream::SshServer(s) => Pin::new(s).poll_flush(cx),
      BipipeStream::Merged { writer, .. } => Pin::new(writer).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      BipipeStream::Tcp(s) => Pin::new(s).poll_shutdown(cx),
      BipipeStream::Unix(s) => Pin::new(s).poll_shutdown(cx),
      BipipeStream::Duplex(s) => Pin::new(s).poll_shutdown(cx),
      BipipeStream::SshClient(s) => Pin::new(s).poll_shutdown(cx),
      BipipeStream::SshServer(s) => Pin::new(s).poll_shutdown(cx),
      BipipeStream::Merged { writer, .. } => Pin::new(writer).poll_shutdown(cx),
    }
  }
}

enum Halt {
  Armed(Pin<Box<WaitForCancellationFutureOwned>>),
  Fired,
}

/// A bidirectional byte stream with half-close and asynchronous shutdown.
///
/// Created active; shuts down exactly once; after shutdown is initiated all
/// in-flight and future I/O on it fails fast with the advisory cause. The
/// write half maps `close_write` (`AsyncWriteExt::shutdown`) to the
/// transport's native half-close: FIN for sockets, EOF for SSH sub-streams.
///
/// Callers keep at most one read and at most one write in flight at a time;
/// the two sides may run concurrently with each other, so each side carries
/// its own shutdown-wakeup future.
pub struct Bipipe {
  id: u64,
  name: String,
  stream: BipipeStream,
  counters: Arc<ByteCounters>,
  shutdown: Shutdown<TunnelError>,
  read_halt: Halt,
  write_halt: Halt,
  write_closed: bool,
}

impl std::fmt::Debug for Bipipe {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Bipipe")
      .field("id", &self.id)
      .field("name", &self.name)
      .finish_non_exhaustive()
  }
}

impl Bipipe {
  pub fn new(name: impl Into<String>, stream: BipipeStream) -> Self {
    let shutdown = Shutdown::new();
    let _ = shutdown.activate();
    let started = shutdown.started();
    let read_halt = Halt::Armed(Box::pin(started.child_token().cancelled_owned()));
    let write_halt = Halt::Armed(Box::pin(started.child_token().cancelled_owned()));
    Self {
      id: alloc_connection_id(),
      name: name.into(),
      stream,
      counters: Arc::new(ByteCounters::default()),
      shutdown,
      read_halt,
      write_halt,
      write_closed: false,
    }
  }

  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn counters(&self) -> Arc<ByteCounters> {
    Arc::clone(&self.counters)
  }

  /// Cloneable observer handle, valid beyond the bipipe's own lifetime.
  pub fn watch(&self) -> BipipeWatch {
    BipipeWatch {
      id: self.id,
      name: self.name.clone(),
      counters: Arc::clone(&self.counters),
      shutdown: self.shutdown.clone(),
    }
  }

  /// Schedules shutdown with an advisory cause; all I/O fails fast from
  /// here on. Idempotent.
  pub fn start_shutdown(&self, cause: Option<TunnelError>) {
    self.shutdown.start(cause);
  }

  fn halted(
    halt: &mut Halt,
    shutdown: &Shutdown<TunnelError>,
    cx: &mut Context<'_>,
  ) -> Option<std::io::Error> {
    if let Halt::Armed(fut) = halt {
      match fut.as_mut().poll(cx) {
        Poll::Ready(()) => {
          *halt = Halt::Fired;
        }
        Poll::Pending => return None,
      }
    }
    let cause = shutdown.advisory_cause().unwrap_or(TunnelError::ShutDown);
    Some(std::io::Error::new(std::io::ErrorKind::BrokenPipe, cause))
  }
}

impl std::fmt::Display for Bipipe {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "pipe#{}({})", self.id, self.name)
  }
}

impl Drop for Bipipe {
  fn drop(&mut self) {
    // Dropping the transport is the actual teardown; publish completion so
    // observers holding a watch see shutdown-complete with the final cause.
    self.shutdown.start(None);
    self.shutdown.complete_now(None);
  }
}

impl AsyncRead for Bipipe {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if let Some(e) = Self::halted(&mut this.read_halt, &this.shutdown, cx) {
      return Poll::Ready(Err(e));
    }
    let before = buf.filled().len();
    match Pin::new(&mut this.stream).poll_read(cx, buf) {
      Poll::Ready(Ok(())) => {
        let n = buf.filled().len() - before;
        this.counters.read.fetch_add(n as u64, Ordering::Relaxed);
        Poll::Ready(Ok(()))
      }
      other => other,
    }
  }
}

impl AsyncWrite for Bipipe {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    let this = self.get_mut();
    if let Some(e) = Self::halted(&mut this.write_halt, &this.shutdown, cx) {
      return Poll::Ready(Err(e));
    }
    if this.write_closed {
      return Poll::Ready(Err(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "write half is closed",
      )));
    }
    match Pin::new(&mut this.stream).poll_write(cx, buf) {
      Poll::Ready(Ok(n)) => {
        this.counters.written.fetch_add(n as u64, Ordering::Relaxed);
        Poll::Ready(Ok(n))
      }
      other => other,
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    Pin::new(&mut this.stream).poll_flush(cx)
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if let Some(e) = Self::halted(&mut this.write_halt, &this.shutdown, cx) {
      return Poll::Ready(Err(e));
    }
    match Pin::new(&mut this.stream).poll_shutdown(cx) {
      Poll::Ready(Ok(())) => {
        this.write_closed = true;
        Poll::Ready(Ok(()))
      }
      other => other,
    }
  }
}

/// Cloneable observer for a [Bipipe]: byte counters plus the shutdown state
/// machine, usable after the bipipe itself has been consumed by a bridge.
#[derive(Clone)]
pub struct BipipeWatch {
  id: u64,
  name: String,
  counters: Arc<ByteCounters>,
  shutdown: Shutdown<TunnelError>,
}

impl BipipeWatch {
  pub fn id(&self) -> u64 {
    self.id
  }

  pub fn bytes_read(&self) -> u64 {
    self.counters.bytes_read()
  }

  pub fn bytes_written(&self) -> u64 {
    self.counters.bytes_written()
  }

  pub fn start_shutdown(&self, cause: Option<TunnelError>) {
    self.shutdown.start(cause);
  }

  pub fn is_shutdown_complete(&self) -> bool {
    self.shutdown.is_complete()
  }

  pub async fn wait_shutdown(&self) -> Option<TunnelError> {
    self.shutdown.wait().await
  }
}

impl std::fmt::Display for BipipeWatch {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "pipe#{}({})", self.id, self.name)
  }
}

/// An in-process connected pair of bipipes, used by loop plain-dial and by
/// tests; equivalent to a socket pair without touching the OS socket layer.
pub fn duplex_pair(name_a: &str, name_b: &str, max_buf: usize) -> (Bipipe, Bipipe) {
  let (a, b) = tokio::io::duplex(max_buf);
  (
    Bipipe::new(name_a, BipipeStream::Duplex(a)),
    Bipipe::new(name_b, BipipeStream::Duplex(b)),
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn half_close_write_then_read() {
    let fut = async {
      let (mut a, mut b) = duplex_pair("a", "b", 4096);
      a.write_all(b"request").await.unwrap();
      a.shutdown().await.unwrap();
      // Writes after close_write fail.
      assert!(a.write_all(b"more").await.is_err());
      // Peer drains the request then sees end-of-stream.
      let mut buf = Vec::new();
      b.read_to_end(&mut buf).await.unwrap();
      assert_eq!(buf, b"request");
      // Reads on the closing side still observe peer bytes.
      b.write_all(b"response").await.unwrap();
      b.shutdown().await.unwrap();
      let mut buf = Vec::new();
      a.read_to_end(&mut buf).await.unwrap();
      assert_eq!(buf, b"response");
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("half-close test may be deadlocked");
  }

  #[tokio::test]
  async fn shutdown_fails_inflight_and_future_io() {
    let fut = async {
      let (mut a, _b) = duplex_pair("a", "b", 64);
      let watch = a.watch();
      let reader = tokio::spawn(async move {
        let mut buf = [0u8; 8];
        let r = a.read(&mut buf).await;
        (a, r)
      });
      tokio::time::sleep(Duration::from_millis(50)).await;
      watch.start_shutdown(Some(TunnelError::Cancelled));
      let (mut a, r) = reader.await.unwrap();
      assert!(r.is_err(), "in-flight read must fail fast after shutdown");
      assert!(a.write_all(b"x").await.is_err());
      drop(a);
      assert_eq!(watch.wait_shutdown().await, Some(TunnelError::Cancelled));
      assert!(watch.is_shutdown_complete());
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("shutdown fail-fast test may be deadlocked");
  }

  #[tokio::test]
  async fn counters_track_bytes() {
    let (mut a, mut b) = duplex_pair("a", "b", 4096);
    let watch_a = a.watch();
    let watch_b = b.watch();
    a.write_all(b"12345").await.unwrap();
    a.flush().await.unwrap();
    let mut buf = [0u8; 5];
    b.read_exact(&mut buf).await.unwrap();
    assert_eq!(watch_a.bytes_written(), 5);
    assert_eq!(watch_b.bytes_read(), 5);
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! TCP and Unix-domain bipipe factories.
//!
//! Stub listeners wrap OS listeners behind the shared pre-accept queue;
//! skeleton dialers connect on demand. OS half-close (FIN) backs
//! `close_write` on both transports.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::net::{TcpListener, TcpStream, UnixStream};
use tokio::sync::OnceCell;

use super::listener::{AcceptError, AcceptQueue, BipipeListener};
use super::dialer::BipipeDialer;
use super::unix_lock::LockedUnixSocketListener;
use super::{Bipipe, BipipeStream, ConnectionInfo};
use crate::common::descriptor::EndpointDescriptor;
use crate::common::TunnelError;
use crate::util::cancellation::CancellationListener;
use crate::util::shutdown::Shutdown;

/// Stub-side TCP listener bound to the descriptor's `<bind-addr>:<port>`.
pub struct TcpStubListener {
  descriptor: EndpointDescriptor,
  queue: Arc<AcceptQueue>,
  shutdown: Shutdown<TunnelError>,
  started: OnceCell<()>,
  bound: OnceCell<std::net::SocketAddr>,
}

impl TcpStubListener {
  pub fn new(descriptor: EndpointDescriptor) -> Arc<Self> {
    let shutdown = Shutdown::new();
    let _ = shutdown.activate();
    Arc::new(Self {
      descriptor,
      queue: Arc::new(AcceptQueue::new(shutdown.clone())),
      shutdown,
      started: OnceCell::new(),
      bound: OnceCell::new(),
    })
  }

  /// Binds, then reports the actual local address; useful when the
  /// descriptor names port 0.
  pub async fn local_addr(&self) -> Result<std::net::SocketAddr, TunnelError> {
    self.start_listening().await?;
    Ok(
      *self
        .bound
        .get()
        .ok_or(TunnelError::ListenerClosed)?,
    )
  }
}

#[async_trait]
impl BipipeListener for TcpStubListener {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  async fn start_listening(&self) -> Result<(), TunnelError> {
    let result = self
      .started
      .get_or_try_init(|| async {
        if self.shutdown.is_scheduled() {
          return Err(TunnelError::ListenerClosed);
        }
        let listener = TcpListener::bind(&self.descriptor.path)
          .await
          .map_err(|e| {
            TunnelError::Io(format!("listen on {} failed: {}", self.descriptor.path, e))
          })?;
        if let Ok(addr) = listener.local_addr() {
          let _ = self.bound.set(addr);
        }
        tracing::debug!(endpoint = %self.descriptor, "listening");
        spawn_accept_pump(
          listener,
          Arc::clone(&self.queue),
          self.shutdown.clone(),
          self.descriptor.clone(),
        );
        Ok(())
      })
      .await;
    if let Err(e) = &result {
      // A persistent claim failure takes the listener down with it.
      self.shutdown.start(Some(e.clone()));
      let shutdown = self.shutdown.clone();
      let queue = Arc::clone(&self.queue);
      tokio::spawn(async move {
        queue.drain().await;
        shutdown.complete(None).await;
      });
    }
    result.map(|_| ())
  }

  async fn accept(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), AcceptError> {
    self
      .start_listening()
      .await
      .map_err(AcceptError::persistent)?;
    self.queue.accept(cancel).await
  }

  fn shutdown_handle(&self) -> Shutdown<TunnelError> {
    self.shutdown.clone()
  }
}

fn spawn_accept_pump(
  listener: TcpListener,
  queue: Arc<AcceptQueue>,
  shutdown: Shutdown<TunnelError>,
  descriptor: EndpointDescriptor,
) {
  tokio::spawn(async move {
    let started = shutdown.started();
    loop {
      tokio::select! {
        _ = started.cancelled() => break,
        accepted = listener.accept() => match accepted {
          Ok((stream, peer)) => {
            let pipe = Bipipe::new(
              format!("tcp accept {}", peer),
              BipipeStream::Tcp(stream),
            );
            let info = ConnectionInfo::with_peer(format!("{}", descriptor), peer);
            if queue.push(pipe, info).await.is_err() {
              break;
            }
          }
          Err(e) => {
            tracing::debug!(endpoint = %descriptor, error = %e, "accept failed; shutting listener down");
            shutdown.start(Some(TunnelError::Io(e.to_string())));
            break;
          }
        },
      }
    }
    // The OS listener drops here; anything still queued is rudely closed.
    drop(listener);
    queue.drain().await;
    shutdown.complete(None).await;
  });
}

/// Skeleton-side TCP dialer connecting to the descriptor's
/// `<hostname>:<port>`.
pub struct TcpSkeletonDialer {
  descriptor: EndpointDescriptor,
}

impl TcpSkeletonDialer {
  pub fn new(descriptor: EndpointDescriptor) -> Arc<Self> {
    Arc::new(Self { descriptor })
  }
}

#[async_trait]
impl BipipeDialer for TcpSkeletonDialer {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  async fn dial(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), TunnelError> {
    let target = self.descriptor.path.clone();
    let stream = tokio::select! {
      connected = TcpStream::connect(&target) => connected
        .map_err(|e| TunnelError::Io(format!("dial {} failed: {}", target, e)))?,
      _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
    };
    let peer = stream.peer_addr().ok();
    let pipe = Bipipe::new(format!("tcp dial {}", target), BipipeStream::Tcp(stream));
    let mut info = ConnectionInfo::new(target);
    info.peer_addr = peer;
    Ok((pipe, info))
  }
}

/// Stub-side Unix-domain listener with the lock-file collision protocol.
pub struct UnixStubListener {
  descriptor: EndpointDescriptor,
  queue: Arc<AcceptQueue>,
  shutdown: Shutdown<TunnelError>,
  started: OnceCell<()>,
}

impl UnixStubListener {
  pub fn new(descriptor: EndpointDescriptor) -> Arc<Self> {
    let shutdown = Shutdown::new();
    let _ = shutdown.activate();
    Arc::new(Self {
      descriptor,
      queue: Arc::new(AcceptQueue::new(shutdown.clone())),
      shutdown,
      started: OnceCell::new(),
    })
  }
}

#[async_trait]
impl BipipeListener for UnixStubListener {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  async fn start_listening(&self) -> Result<(), TunnelError> {
    let result = self
      .started
      .get_or_try_init(|| async {
        if self.shutdown.is_scheduled() {
          return Err(TunnelError::ListenerClosed);
        }
        let locked = LockedUnixSocketListener::listen(&self.descriptor.path)?;
        tracing::debug!(endpoint = %self.descriptor, "listening on unix socket");
        let queue = Arc::clone(&self.queue);
        let shutdown = self.shutdown.clone();
        let descriptor = self.descriptor.clone();
        tokio::spawn(async move {
          let started = shutdown.started();
          loop {
            tokio::select! {
              _ = started.cancelled() => break,
              accepted = locked.accept() => match accepted {
                Ok(stream) => {
                  let pipe = Bipipe::new(
                    format!("unix accept {}", descriptor.path),
                    BipipeStream::Unix(stream),
                  );
                  let info = ConnectionInfo::new(descriptor.path.clone());
                  if queue.push(pipe, info).await.is_err() {
                    break;
                  }
                }
                Err(e) => {
                  shutdown.start(Some(TunnelError::Io(e.to_string())));
                  break;
                }
              },
            }
          }
          // Unlinks the lock file before releasing the lock.
          locked.close();
          queue.drain().await;
          shutdown.complete(None).await;
        });
        Ok(())
      })
      .await;
    if let Err(e) = &result {
      self.shutdown.start(Some(e.clone()));
      let shutdown = self.shutdown.clone();
      let queue = Arc::clone(&self.queue);
      tokio::spawn(async move {
        queue.drain().await;
        shutdown.complete(None).await;
      });
    }
    result.map(|_| ())
  }

  async fn accept(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), AcceptError> {
    self
      .start_listening()
      .await
      .map_err(AcceptError::persistent)?;
    self.queue.accept(cancel).await
  }

  fn shutdown_handle(&self) -> Shutdown<TunnelError> {
    self.shutdown.clone()
  }
}

/// Skeleton-side Unix-domain dialer.
pub struct UnixSkeletonDialer {
  descriptor: EndpointDescriptor,
}

impl UnixSkeletonDialer {
  pub fn new(descriptor: EndpointDescriptor) -> Arc<Self> {
    Arc::new(Self { descriptor })
  }
}

#[async_trait]
impl BipipeDialer for UnixSkeletonDialer {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  async fn dial(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), TunnelError> {
    let path = self.descriptor.path.clone();
    let stream = tokio::select! {
      connected = UnixStream::connect(&path) => connected
        .map_err(|e| TunnelError::Io(format!("dial unix {} failed: {}", path, e)))?,
      _ = cancel.cancelled() => return Err(TunnelError::Cancelled),
    };
    let pipe = Bipipe::new(format!("unix dial {}", path), BipipeStream::Unix(stream));
    Ok((pipe, ConnectionInfo::new(path)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::descriptor::{EndpointProtocol, EndpointRole};
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio_util::sync::CancellationToken;

  fn stub_descriptor(path: &str) -> EndpointDescriptor {
    EndpointDescriptor::new(EndpointRole::Stub, EndpointProtocol::Tcp, path)
  }

  fn skeleton_descriptor(path: &str) -> EndpointDescriptor {
    EndpointDescriptor::new(EndpointRole::Skeleton, EndpointProtocol::Tcp, path)
  }

  #[tokio::test]
  async fn tcp_accept_and_dial_round_trip() {
    let fut = async {
      let listener = TcpStubListener::new(stub_descriptor("127.0.0.1:0"));
      let addr = listener.local_addr().await.unwrap();
      let dialer = TcpSkeletonDialer::new(skeleton_descriptor(&addr.to_string()));

      let cancel = CancellationListener::none();
      let (mut dialed, _info) = dialer.dial(&cancel).await.unwrap();
      let (mut accepted, info) = listener.accept(&cancel).await.unwrap();
      assert!(info.peer_addr.is_some());

      dialed.write_all(b"hello").await.unwrap();
      let mut buf = [0u8; 5];
      accepted.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"hello");
      listener.close().await;
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("tcp round trip may be deadlocked");
  }

  #[tokio::test]
  async fn cancelling_one_accept_leaves_listener_usable() {
    let fut = async {
      let listener = TcpStubListener::new(stub_descriptor("127.0.0.1:0"));
      let addr = listener.local_addr().await.unwrap();

      let token = CancellationToken::new();
      let cancelled: CancellationListener = (&token).into();
      token.cancel();
      let err = listener.accept(&cancelled).await.unwrap_err();
      assert!(!err.persistent);
      assert_eq!(err.error, TunnelError::Cancelled);

      // The listener still accepts afterwards.
      let dialer = TcpSkeletonDialer::new(skeleton_descriptor(&addr.to_string()));
      let cancel = CancellationListener::none();
      let (_dialed, _) = dialer.dial(&cancel).await.unwrap();
      let (_accepted, _) = listener.accept(&cancel).await.unwrap();
      listener.close().await;
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("accept cancellation test may be deadlocked");
  }

  #[tokio::test]
  async fn accept_after_shutdown_is_persistent_listener_closed() {
    let fut = async {
      let listener = TcpStubListener::new(stub_descriptor("127.0.0.1:0"));
      let _ = listener.local_addr().await.unwrap();
      listener.close().await;
      let err = listener
        .accept(&CancellationListener::none())
        .await
        .unwrap_err();
      assert!(err.persistent);
      assert_eq!(err.error, TunnelError::ListenerClosed);
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("accept-after-shutdown test may be deadlocked");
  }

  #[tokio::test]
  async fn bind_conflict_is_persistent_and_shuts_down() {
    let fut = async {
      let first = TcpStubListener::new(stub_descriptor("127.0.0.1:0"));
      let addr = first.local_addr().await.unwrap();
      let second = TcpStubListener::new(stub_descriptor(&addr.to_string()));
      assert!(second.start_listening().await.is_err());
      assert!(second.shutdown_handle().is_scheduled());
      first.close().await;
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("bind conflict test may be deadlocked");
  }

  #[tokio::test]
  async fn dial_failure_does_not_taint_dialer() {
    let fut = async {
      // Bind then drop to find a port that refuses connections.
      let probe = TcpListener::bind("127.0.0.1:0").await.unwrap();
      let addr = probe.local_addr().unwrap();
      drop(probe);
      let dialer = TcpSkeletonDialer::new(skeleton_descriptor(&addr.to_string()));
      let cancel = CancellationListener::none();
      assert!(dialer.dial(&cancel).await.is_err());
      // The dialer remains usable against a live target.
      let live = TcpStubListener::new(stub_descriptor("127.0.0.1:0"));
      let live_addr = live.local_addr().await.unwrap();
      let dialer2 = TcpSkeletonDialer::new(skeleton_descriptor(&live_addr.to_string()));
      assert!(dialer2.dial(&cancel).await.is_ok());
      live.close().await;
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("dial failure test may be deadlocked");
  }
}

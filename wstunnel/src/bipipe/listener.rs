// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Stub-side bipipe factories: listeners producing one [Bipipe] per
//! accepted caller.

use async_trait::async_trait;
use tokio::sync::mpsc;

use super::{Bipipe, ConnectionInfo};
use crate::common::descriptor::EndpointDescriptor;
use crate::common::TunnelError;
use crate::util::cancellation::CancellationListener;
use crate::util::shutdown::Shutdown;

/// Depth of the pre-accept queue: callers that connected but have not yet
/// been consumed by an accept call. Anything still queued at listener
/// shutdown is rudely closed.
pub const ACCEPT_BACKLOG: usize = 5;

/// Accept failure carrying the persistence flag: a persistent error means
/// the listener has failed or shut down and every other in-flight and future
/// accept will fail the same way.
#[derive(Debug, Clone)]
pub struct AcceptError {
  pub error: TunnelError,
  pub persistent: bool,
}

impl AcceptError {
  pub fn transient(error: TunnelError) -> Self {
    Self {
      error,
      persistent: false,
    }
  }

  pub fn persistent(error: TunnelError) -> Self {
    Self {
      error,
      persistent: true,
    }
  }

  /// The well-known status distinguishing clean listener shutdown from
  /// genuine failure.
  pub fn closed() -> Self {
    Self::persistent(TunnelError::ListenerClosed)
  }
}

impl std::fmt::Display for AcceptError {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.error)
  }
}

/// A virtual bipipe factory that listens for abstract connection requests:
/// a wrapped OS listener receiving connections from local network clients,
/// or a loop listener receiving in-process callers.
#[async_trait]
pub trait BipipeListener: Send + Sync {
  fn descriptor(&self) -> &EndpointDescriptor;

  /// Begins responding to dialing clients in anticipation of accept calls.
  /// Idempotent; implicitly performed by the first accept. A returned error
  /// is persistent and automatically initiates listener shutdown.
  async fn start_listening(&self) -> Result<(), TunnelError>;

  /// Accepts a single incoming connection. Cancellation abandons only this
  /// call; the listener keeps listening and queued connections stay queued.
  async fn accept(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), AcceptError>;

  fn shutdown_handle(&self) -> Shutdown<TunnelError>;

  async fn close(&self) -> Option<TunnelError> {
    let shutdown = self.shutdown_handle();
    shutdown.start(None);
    shutdown.wait().await
  }
}

/// Shared single-queue accept plumbing used by the OS-socket and loop
/// listeners: producers push connected bipipes, accept calls drain them.
pub(crate) struct AcceptQueue {
  tx: mpsc::Sender<(Bipipe, ConnectionInfo)>,
  rx: tokio::sync::Mutex<mpsc::Receiver<(Bipipe, ConnectionInfo)>>,
  shutdown: Shutdown<TunnelError>,
}

impl AcceptQueue {
  pub fn new(shutdown: Shutdown<TunnelError>) -> Self {
    let (tx, rx) = mpsc::channel(ACCEPT_BACKLOG);
    Self {
      tx,
      rx: tokio::sync::Mutex::new(rx),
      shutdown,
    }
  }

  /// Non-blocking enqueue, used by loop dialers; typed error when full.
  pub fn offer(&self, pipe: Bipipe, info: ConnectionInfo) -> Result<(), TunnelError> {
    if self.shutdown.is_scheduled() {
      pipe.start_shutdown(Some(TunnelError::ListenerClosed));
      return Err(TunnelError::ListenerClosed);
    }
    match self.tx.try_send((pipe, info)) {
      Ok(()) => Ok(()),
      Err(mpsc::error::TrySendError::Full((pipe, _))) => {
        pipe.start_shutdown(Some(TunnelError::AcceptBacklogFull));
        Err(TunnelError::AcceptBacklogFull)
      }
      Err(mpsc::error::TrySendError::Closed((pipe, _))) => {
        pipe.start_shutdown(Some(TunnelError::ListenerClosed));
        Err(TunnelError::ListenerClosed)
      }
    }
  }

  /// Blocking enqueue, used by OS accept pumps for backpressure. Unblocks
  /// with an error once listener shutdown starts; the pending connection is
  /// rudely dropped.
  pub async fn push(&self, pipe: Bipipe, info: ConnectionInfo) -> Result<(), TunnelError> {
    let started = self.shutdown.started();
    tokio::select! {
      sent = self.tx.send((pipe, info)) => match sent {
        Ok(()) => Ok(()),
        Err(mpsc::error::SendError((pipe, _))) => {
          pipe.start_shutdown(Some(TunnelError::ListenerClosed));
          Err(TunnelError::ListenerClosed)
        }
      },
      _ = started.cancelled() => Err(TunnelError::ListenerClosed),
    }
  }

  pub async fn accept(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), AcceptError> {
    let closed = || {
      AcceptError::persistent(
        self
          .shutdown
          .advisory_cause()
          .unwrap_or(TunnelError::ListenerClosed),
      )
    };
    if self.shutdown.is_scheduled() {
      return Err(closed());
    }
    let mut rx = tokio::select! {
      guard = self.rx.lock() => guard,
      _ = cancel.cancelled() => return Err(AcceptError::transient(TunnelError::Cancelled)),
    };
    let started = self.shutdown.started();
    tokio::select! {
      item = rx.recv() => match item {
        Some(accepted) => Ok(accepted),
        None => Err(closed()),
      },
      _ = cancel.cancelled() => Err(AcceptError::transient(TunnelError::Cancelled)),
      _ = started.cancelled() => Err(closed()),
    }
  }

  /// Rudely closes everything still queued; used during listener shutdown.
  pub async fn drain(&self) {
    let mut rx = self.rx.lock().await;
    rx.close();
    while let Ok((pipe, _)) = rx.try_recv() {
      pipe.start_shutdown(Some(TunnelError::ListenerClosed));
      drop(pipe);
    }
  }
}

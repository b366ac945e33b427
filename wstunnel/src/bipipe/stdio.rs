// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Stdio bipipes and the nil reader/writer fillers.
//!
//! A stdio bipipe merges the process's standard input (read half) and
//! standard output (write half). There is at most one per process, it can
//! be connected once, and once closed it cannot be reused for the rest of
//! the session.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use super::dialer::BipipeDialer;
use super::listener::{AcceptError, BipipeListener};
use super::{Bipipe, BipipeStream, ConnectionInfo};
use crate::common::descriptor::EndpointDescriptor;
use crate::common::TunnelError;
use crate::util::cancellation::CancellationListener;
use crate::util::shutdown::Shutdown;

static STDIO_CLAIMED: AtomicBool = AtomicBool::new(false);

/// Claims the process's stdio streams as a bipipe. Fails if they are
/// already claimed.
pub fn claim_stdio_bipipe() -> Result<Bipipe, TunnelError> {
  if STDIO_CLAIMED.swap(true, Ordering::SeqCst) {
    return Err(TunnelError::PolicyDenied(
      "stdio is already in use by another channel".to_string(),
    ));
  }
  Ok(Bipipe::new(
    "stdio",
    BipipeStream::Merged {
      reader: Box::new(tokio::io::stdin()),
      writer: Box::new(tokio::io::stdout()),
    },
  ))
}

#[cfg(test)]
pub(crate) fn reset_stdio_claim_for_tests() {
  STDIO_CLAIMED.store(false, Ordering::SeqCst);
}

/// A reader producing end-of-stream: immediately, or only once the holder
/// is done with it (the blocking flavor parks forever).
pub enum NilReader {
  Eof,
  Blocking,
}

impl AsyncRead for NilReader {
  fn poll_read(
    self: Pin<&mut Self>,
    _cx: &mut Context<'_>,
    _buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      NilReader::Eof => Poll::Ready(Ok(())),
      NilReader::Blocking => Poll::Pending,
    }
  }
}

/// A writer that discards bytes and reports full consumption.
pub struct NilWriter;

impl AsyncWrite for NilWriter {
  fn poll_write(
    self: Pin<&mut Self>,
    _cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    Poll::Ready(Ok(buf.len()))
  }

  fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Ok(()))
  }

  fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    Poll::Ready(Ok(()))
  }
}

/// Stub-side stdio listener: yields the process stdio bipipe to exactly one
/// accept, then reports closed once the listener shuts down.
pub struct StdioStubListener {
  descriptor: EndpointDescriptor,
  pipe: std::sync::Mutex<Option<Bipipe>>,
  shutdown: Shutdown<TunnelError>,
}

impl StdioStubListener {
  pub fn new(descriptor: EndpointDescriptor) -> Result<Arc<Self>, TunnelError> {
    let shutdown = Shutdown::new();
    let _ = shutdown.activate();
    let pipe = claim_stdio_bipipe()?;
    {
      let shutdown = shutdown.clone();
      tokio::spawn(async move {
        shutdown.started().cancelled().await;
        shutdown.complete(None).await;
      });
    }
    Ok(Arc::new(Self {
      descriptor,
      pipe: std::sync::Mutex::new(Some(pipe)),
      shutdown,
    }))
  }
}

#[async_trait]
impl BipipeListener for StdioStubListener {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  async fn start_listening(&self) -> Result<(), TunnelError> {
    Ok(())
  }

  async fn accept(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), AcceptError> {
    if let Some(pipe) = self.pipe.lock().unwrap().take() {
      return Ok((pipe, ConnectionInfo::new("stdio")));
    }
    // Stdio connects once; later accepts pend until the listener closes.
    let started = self.shutdown.started();
    tokio::select! {
      _ = cancel.cancelled() => Err(AcceptError::transient(TunnelError::Cancelled)),
      _ = started.cancelled() => Err(AcceptError::closed()),
    }
  }

  fn shutdown_handle(&self) -> Shutdown<TunnelError> {
    self.shutdown.clone()
  }
}

/// Skeleton-side stdio dialer: the one stdio bipipe answers the first dial.
pub struct StdioSkeletonDialer {
  descriptor: EndpointDescriptor,
}

impl StdioSkeletonDialer {
  pub fn new(descriptor: EndpointDescriptor) -> Arc<Self> {
    Arc::new(Self { descriptor })
  }
}

#[async_trait]
impl BipipeDialer for StdioSkeletonDialer {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  async fn dial(
    &self,
    _cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), TunnelError> {
    let pipe = claim_stdio_bipipe()?;
    Ok((pipe, ConnectionInfo::new("stdio")))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  #[tokio::test]
  async fn nil_eof_reader_ends_immediately() {
    let mut buf = Vec::new();
    let n = NilReader::Eof.read_to_end(&mut buf).await.unwrap();
    assert_eq!(n, 0);
  }

  #[tokio::test]
  async fn nil_writer_consumes_everything() {
    let mut w = NilWriter;
    w.write_all(b"discarded entirely").await.unwrap();
    w.flush().await.unwrap();
    w.shutdown().await.unwrap();
  }

  #[tokio::test]
  async fn blocking_nil_reader_pends() {
    let mut r = NilReader::Blocking;
    let mut buf = [0u8; 1];
    let read = tokio::time::timeout(
      std::time::Duration::from_millis(100),
      r.read(&mut buf),
    )
    .await;
    assert!(read.is_err(), "blocking nil reader must not produce data");
  }

  #[tokio::test]
  async fn stdio_is_claimed_at_most_once() {
    reset_stdio_claim_for_tests();
    let first = claim_stdio_bipipe();
    assert!(first.is_ok());
    let second = claim_stdio_bipipe();
    assert!(second.is_err());
    reset_stdio_claim_for_tests();
  }
}

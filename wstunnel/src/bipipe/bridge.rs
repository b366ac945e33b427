// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Bidirectional copy engine between two bipipes.
//!
//! The bridge owns both bipipes and runs one forwarding worker per
//! direction. A worker copies until its source reaches end-of-stream, then
//! half-closes its sink so the opposite reader observes EOF. Any error
//! schedules bridge shutdown with that error as the advisory cause; on
//! completion both bipipes are shut down and their own completion awaited.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};

use super::{Bipipe, BipipeWatch};
use crate::common::TunnelError;
use crate::util::shutdown::Shutdown;
use crate::util::alloc_connection_id;

/// Default forwarding buffer size.
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

#[derive(Debug, Clone, Copy)]
pub struct BridgeOptions {
  pub buffer_size: usize,
  /// When set, the per-edge byte counters are published after every
  /// successful write instead of only at stream completion, at some cost to
  /// throughput: the native copy fast path is bypassed.
  pub publish_progress: bool,
}

impl Default for BridgeOptions {
  fn default() -> Self {
    Self {
      buffer_size: DEFAULT_BUFFER_SIZE,
      publish_progress: false,
    }
  }
}

struct Edge {
  watch: BipipeWatch,
  bytes_written: Arc<AtomicU64>,
}

/// Handle to a running bridge. Dropping the handle does not stop the
/// bridge; it runs until both directions complete or it is shut down.
pub struct BipipeBridge {
  id: u64,
  name: String,
  edges: [Edge; 2],
  shutdown: Shutdown<TunnelError>,
}

/// Starts bridging `a` and `b`, taking ownership of both.
pub fn start(a: Bipipe, b: Bipipe, options: BridgeOptions) -> BipipeBridge {
  let id = alloc_connection_id();
  let name = format!("bridge#{}[{} <=> {}]", id, a, b);
  let shutdown = Shutdown::<TunnelError>::new();
  let _ = shutdown.activate();

  let a_watch = a.watch();
  let b_watch = b.watch();
  let a_written = Arc::new(AtomicU64::new(0));
  let b_written = Arc::new(AtomicU64::new(0));

  let (a_read, a_write) = tokio::io::split(a);
  let (b_read, b_write) = tokio::io::split(b);

  let worker_ab = tokio::spawn(forward_one_direction(
    a_read,
    b_write,
    Arc::clone(&b_written),
    options,
    format!("{} a->b", name),
  ));
  let worker_ba = tokio::spawn(forward_one_direction(
    b_read,
    a_write,
    Arc::clone(&a_written),
    options,
    format!("{} b->a", name),
  ));

  // External shutdown propagates down to both bipipes, which fails the
  // workers fast.
  {
    let shutdown = shutdown.clone();
    let a_watch = a_watch.clone();
    let b_watch = b_watch.clone();
    tokio::spawn(async move {
      shutdown.started().cancelled().await;
      let cause = shutdown.advisory_cause();
      a_watch.start_shutdown(cause.clone());
      b_watch.start_shutdown(cause);
    });
  }

  {
    let shutdown = shutdown.clone();
    let a_watch = a_watch.clone();
    let b_watch = b_watch.clone();
    let name = name.clone();
    tokio::spawn(async move {
      let ra = worker_ab.await;
      let rb = worker_ba.await;
      let first_error = match (&ra, &rb) {
        (Ok(Err(e)), _) => Some(e.clone()),
        (_, Ok(Err(e))) => Some(e.clone()),
        (Err(_), _) | (_, Err(_)) => {
          Some(TunnelError::Internal("bridge worker panicked".to_string()))
        }
        _ => None,
      };
      match &first_error {
        None => tracing::debug!(bridge = %name, "both forwarding workers completed cleanly"),
        Some(e) => tracing::debug!(bridge = %name, error = %e, "bridge tearing down"),
      }
      shutdown.start(first_error.clone());
      a_watch.start_shutdown(first_error.clone());
      b_watch.start_shutdown(first_error.clone());
      // The workers dropped their halves on return, so both bipipes have
      // been released; await their completion before reporting our own.
      a_watch.wait_shutdown().await;
      b_watch.wait_shutdown().await;
      shutdown.complete(first_error).await;
    });
  }

  BipipeBridge {
    id,
    name,
    edges: [
      Edge {
        watch: a_watch,
        bytes_written: a_written,
      },
      Edge {
        watch: b_watch,
        bytes_written: b_written,
      },
    ],
    shutdown,
  }
}

async fn forward_one_direction(
  mut src: ReadHalf<Bipipe>,
  mut dst: WriteHalf<Bipipe>,
  written: Arc<AtomicU64>,
  options: BridgeOptions,
  label: String,
) -> Result<(), TunnelError> {
  let copied: Result<u64, TunnelError> = if options.publish_progress {
    let mut buffer = vec![0u8; options.buffer_size.max(1)];
    let mut total: u64 = 0;
    loop {
      let n = match src.read(&mut buffer).await {
        Ok(0) => break Ok(total),
        Ok(n) => n,
        Err(e) => break Err(map_copy_error(e)),
      };
      if let Err(e) = dst.write_all(&buffer[..n]).await {
        break Err(map_copy_error(e));
      }
      total += n as u64;
      written.fetch_add(n as u64, Ordering::Relaxed);
    }
  } else {
    let mut reader = tokio::io::BufReader::with_capacity(options.buffer_size.max(1), &mut src);
    match tokio::io::copy_buf(&mut reader, &mut dst).await {
      Ok(n) => {
        written.fetch_add(n, Ordering::Relaxed);
        Ok(n)
      }
      Err(e) => Err(map_copy_error(e)),
    }
  };

  match copied {
    Ok(total) => {
      tracing::trace!(worker = %label, bytes = total, "source at end-of-stream; closing sink write half");
      dst
        .shutdown()
        .await
        .map_err(|e| TunnelError::Io(e.to_string()))?;
      Ok(())
    }
    Err(e) => {
      tracing::trace!(worker = %label, error = %e, "forwarding worker failed");
      Err(e)
    }
  }
}

/// A sink accepting fewer bytes than offered without an error is a protocol
/// violation and is surfaced as an internal invariant failure rather than a
/// transport error.
fn map_copy_error(e: std::io::Error) -> TunnelError {
  if e.kind() == std::io::ErrorKind::WriteZero {
    TunnelError::Internal(format!("short write: {}", e))
  } else {
    // Unwrap a cause a Bipipe injected when failing fast.
    match e.get_ref().and_then(|inner| inner.downcast_ref::<TunnelError>()) {
      Some(cause) => cause.clone(),
      None => TunnelError::Io(e.to_string()),
    }
  }
}

impl BipipeBridge {
  pub fn id(&self) -> u64 {
    self.id
  }

  /// Bytes successfully written to edge 0 or 1. With
  /// `publish_progress`, updated after every write; otherwise recorded when
  /// each direction completes.
  pub fn bytes_written(&self, edge: usize) -> u64 {
    self.edges[edge].bytes_written.load(Ordering::Relaxed)
  }

  pub fn edge_watch(&self, edge: usize) -> &BipipeWatch {
    &self.edges[edge].watch
  }

  pub fn start_shutdown(&self, cause: Option<TunnelError>) {
    self.shutdown.start(cause);
  }

  pub fn shutdown_handle(&self) -> Shutdown<TunnelError> {
    self.shutdown.clone()
  }

  /// Resolves when the bridge has fully torn down; `None` iff both
  /// directions reached end-of-stream and both bipipes closed cleanly.
  pub async fn wait(&self) -> Option<TunnelError> {
    self.shutdown.wait().await
  }

  /// Starts shutdown and waits for completion, returning the final cause.
  pub async fn close(&self) -> Option<TunnelError> {
    self.shutdown.start(None);
    self.wait().await
  }
}

impl std::fmt::Display for BipipeBridge {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.name)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::bipipe::duplex_pair;
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};

  /// Bridges (b <-> c) out of two duplex pairs (a,b) and (c,d); traffic
  /// written into `a` appears at `d` and vice versa.
  fn bridged_ends() -> (Bipipe, Bipipe, BipipeBridge) {
    let (a, b) = duplex_pair("a", "b", 4096);
    let (c, d) = duplex_pair("c", "d", 4096);
    let bridge = start(b, c, BridgeOptions::default());
    (a, d, bridge)
  }

  #[tokio::test]
  async fn bytes_flow_both_ways_and_counters_match() {
    let fut = async {
      let (mut a, mut d, bridge) = bridged_ends();
      a.write_all(b"ping from a").await.unwrap();
      a.shutdown().await.unwrap();

      let mut got = Vec::new();
      d.read_to_end(&mut got).await.unwrap();
      assert_eq!(got, b"ping from a");

      d.write_all(b"pong!").await.unwrap();
      d.shutdown().await.unwrap();
      let mut got = Vec::new();
      a.read_to_end(&mut got).await.unwrap();
      assert_eq!(got, b"pong!");

      assert_eq!(bridge.wait().await, None);
      // Edge 1 received everything a produced; edge 0 everything d produced.
      assert_eq!(bridge.bytes_written(1), 11);
      assert_eq!(bridge.bytes_written(0), 5);
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("bridge forwarding test may be deadlocked");
  }

  #[tokio::test]
  async fn progress_publishing_path_behaves_identically() {
    let fut = async {
      let (a, b) = duplex_pair("a", "b", 4096);
      let (c, d) = duplex_pair("c", "d", 4096);
      let bridge = start(
        b,
        c,
        BridgeOptions {
          buffer_size: 7,
          publish_progress: true,
        },
      );
      let (mut a, mut d) = (a, d);
      let payload = vec![0x5au8; 10_000];
      let writer = {
        let payload = payload.clone();
        tokio::spawn(async move {
          a.write_all(&payload).await.unwrap();
          a.shutdown().await.unwrap();
          a
        })
      };
      let mut got = Vec::new();
      d.read_to_end(&mut got).await.unwrap();
      assert_eq!(got, payload);
      let _a = writer.await.unwrap();
      d.shutdown().await.unwrap();
      drop(d);
      assert_eq!(bridge.wait().await, None);
      assert_eq!(bridge.bytes_written(1), 10_000);
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("progress path test may be deadlocked");
  }

  #[tokio::test]
  async fn shutdown_cascades_to_both_bipipes() {
    let fut = async {
      let (_a, _d, bridge) = bridged_ends();
      let w0 = bridge.edge_watch(0).clone();
      let w1 = bridge.edge_watch(1).clone();
      bridge.start_shutdown(Some(TunnelError::Cancelled));
      let cause = bridge.wait().await;
      assert!(cause.is_some());
      assert!(w0.is_shutdown_complete());
      assert!(w1.is_shutdown_complete());
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("bridge shutdown test may be deadlocked");
  }

  #[tokio::test]
  async fn clean_close_reports_no_cause() {
    let fut = async {
      let (mut a, mut d, bridge) = bridged_ends();
      a.shutdown().await.unwrap();
      d.shutdown().await.unwrap();
      let mut buf = Vec::new();
      a.read_to_end(&mut buf).await.unwrap();
      d.read_to_end(&mut buf).await.unwrap();
      assert_eq!(bridge.wait().await, None);
      assert_eq!(bridge.close().await, None);
    };
    tokio::time::timeout(Duration::from_secs(5), fut)
      .await
      .expect("clean close test may be deadlocked");
  }
}

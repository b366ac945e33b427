// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The loop transport: in-process endpoints that never touch the OS socket
//! layer.
//!
//! A [LoopRegistry] maps loop names to the stub listener currently claiming
//! each name. A loop skeleton dialer either creates an in-process duplex
//! pair and enqueues one half on the stub (plain dial), or enqueues the
//! caller's already-connected bipipe directly and waits for it to close
//! (dial-and-serve), saving one hop and one forwarding task when the
//! skeleton side knows it would only bridge through.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};

use async_trait::async_trait;

use super::dialer::BipipeDialer;
use super::listener::{AcceptError, AcceptQueue, BipipeListener};
use super::{duplex_pair, Bipipe, ConnectionInfo};
use crate::common::descriptor::EndpointDescriptor;
use crate::common::TunnelError;
use crate::util::cancellation::CancellationListener;
use crate::util::shutdown::Shutdown;

/// Buffer capacity of the duplex pair created by a plain loop dial.
const LOOP_PAIR_BUFFER: usize = 64 * 1024;

/// Process-shared name→stub map. Holds weak references only: endpoints
/// deregister during their own shutdown, and the registry never initiates
/// shutdown of a registrant.
#[derive(Default)]
pub struct LoopRegistry {
  entries: Mutex<HashMap<String, Weak<LoopStubListener>>>,
}

impl LoopRegistry {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  fn register(&self, name: &str, stub: &Arc<LoopStubListener>) -> Result<(), TunnelError> {
    let mut entries = self.entries.lock().unwrap();
    if let Some(existing) = entries.get(name) {
      if existing.upgrade().is_some() {
        return Err(TunnelError::PolicyDenied(format!(
          "Loop acceptor already registered for name \"{}\"",
          name
        )));
      }
    }
    entries.insert(name.to_string(), Arc::downgrade(stub));
    Ok(())
  }

  /// No-op unless `stub` is the current registrant for `name`.
  fn unregister(&self, name: &str, stub: &LoopStubListener) {
    let mut entries = self.entries.lock().unwrap();
    if let Some(existing) = entries.get(name) {
      let matches = existing
        .upgrade()
        .map(|live| std::ptr::eq(live.as_ref(), stub))
        .unwrap_or(true);
      if matches {
        entries.remove(name);
      }
    }
  }

  pub fn lookup(&self, name: &str) -> Option<Arc<LoopStubListener>> {
    let entries = self.entries.lock().unwrap();
    entries.get(name).and_then(Weak::upgrade)
  }

  /// Number of live registrants for a name; 0 or 1 by construction.
  pub fn count(&self, name: &str) -> usize {
    self.lookup(name).map(|_| 1).unwrap_or(0)
  }
}

/// Stub-side loop listener: accepts callers enqueued by loop dialers on the
/// same proxy.
pub struct LoopStubListener {
  descriptor: EndpointDescriptor,
  registry: Arc<LoopRegistry>,
  queue: AcceptQueue,
  shutdown: Shutdown<TunnelError>,
  listening: Mutex<bool>,
}

impl LoopStubListener {
  pub fn new(descriptor: EndpointDescriptor, registry: Arc<LoopRegistry>) -> Arc<Self> {
    let shutdown = Shutdown::new();
    let _ = shutdown.activate();
    let listener = Arc::new(Self {
      descriptor,
      registry,
      queue: AcceptQueue::new(shutdown.clone()),
      shutdown: shutdown.clone(),
      listening: Mutex::new(false),
    });
    {
      let this = Arc::downgrade(&listener);
      tokio::spawn(async move {
        shutdown.started().cancelled().await;
        if let Some(listener) = this.upgrade() {
          listener
            .registry
            .unregister(&listener.descriptor.path, &listener);
          *listener.listening.lock().unwrap() = false;
          listener.queue.drain().await;
        }
        shutdown.complete(None).await;
      });
    }
    listener
  }

  pub fn loop_name(&self) -> &str {
    &self.descriptor.path
  }

  /// Hands a connected caller bipipe to a pending or future accept.
  /// Non-blocking; fails typed when nothing is listening or the backlog is
  /// full.
  pub fn enqueue_caller(&self, pipe: Bipipe, info: ConnectionInfo) -> Result<(), TunnelError> {
    if !*self.listening.lock().unwrap() {
      pipe.start_shutdown(Some(TunnelError::NotListening(self.loop_name().to_string())));
      return Err(TunnelError::NotListening(self.loop_name().to_string()));
    }
    self.queue.offer(pipe, info)
  }
}

#[async_trait]
impl BipipeListener for LoopStubListener {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  async fn start_listening(&self) -> Result<(), TunnelError> {
    if self.shutdown.is_scheduled() {
      return Err(TunnelError::ListenerClosed);
    }
    // Registration happens in [register_loop_stub], which needs the Arc
    // identity before any caller can dial.
    if !*self.listening.lock().unwrap() {
      return Err(TunnelError::NotListening(self.loop_name().to_string()));
    }
    Ok(())
  }

  async fn accept(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), AcceptError> {
    self.queue.accept(cancel).await
  }

  fn shutdown_handle(&self) -> Shutdown<TunnelError> {
    self.shutdown.clone()
  }
}

/// Creates a loop stub listener and registers it under its loop name.
/// At most one registrant per name exists at any time.
pub fn register_loop_stub(
  descriptor: EndpointDescriptor,
  registry: &Arc<LoopRegistry>,
) -> Result<Arc<LoopStubListener>, TunnelError> {
  let listener = LoopStubListener::new(descriptor, Arc::clone(registry));
  registry.register(&listener.descriptor.path, &listener)?;
  *listener.listening.lock().unwrap() = true;
  Ok(listener)
}

/// Skeleton-side loop dialer.
pub struct LoopSkeletonDialer {
  descriptor: EndpointDescriptor,
  registry: Arc<LoopRegistry>,
}

impl LoopSkeletonDialer {
  pub fn new(descriptor: EndpointDescriptor, registry: Arc<LoopRegistry>) -> Arc<Self> {
    Arc::new(Self {
      descriptor,
      registry,
    })
  }

  fn stub(&self) -> Result<Arc<LoopStubListener>, TunnelError> {
    self
      .registry
      .lookup(&self.descriptor.path)
      .ok_or_else(|| TunnelError::NotListening(self.descriptor.path.clone()))
  }
}

#[async_trait]
impl BipipeDialer for LoopSkeletonDialer {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  /// Plain dial: one extra in-process hop, but fits the general bridge
  /// model expected by callers that need a bipipe back.
  async fn dial(
    &self,
    _cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), TunnelError> {
    let stub = self.stub()?;
    let name = self.descriptor.path.clone();
    let (caller_side, stub_side) = duplex_pair(
      &format!("loop dial {}", name),
      &format!("loop accept {}", name),
      LOOP_PAIR_BUFFER,
    );
    stub.enqueue_caller(stub_side, ConnectionInfo::new(format!("loop:{}", name)))?;
    Ok((caller_side, ConnectionInfo::new(format!("loop:{}", name))))
  }

  /// Dial-and-serve fast path: couples the caller directly to the
  /// acceptor, with no socket pair and no bridge on this side.
  async fn dial_and_serve(
    &self,
    _cancel: &CancellationListener,
    caller: Bipipe,
  ) -> Result<(u64, u64), TunnelError> {
    let stub = match self.stub() {
      Ok(stub) => stub,
      Err(e) => {
        caller.start_shutdown(Some(e.clone()));
        return Err(e);
      }
    };
    let watch = caller.watch();
    let name = self.descriptor.path.clone();
    stub.enqueue_caller(caller, ConnectionInfo::new(format!("loop:{}", name)))?;
    // Whoever accepts runs the bridge; fulfilling our contract only needs
    // waiting for the caller pipe to finish.
    let cause = watch.wait_shutdown().await;
    let counts = (watch.bytes_read(), watch.bytes_written());
    match cause {
      None => Ok(counts),
      Some(e) => Err(e),
    }
  }
}

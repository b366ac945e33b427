// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Stub proxy: one local listener feeding per-connection SSH sub-streams.
//!
//! A stub proxy owns the stub-side listener of one channel. Each accepted
//! caller opens a sub-stream to the peer carrying the channel's skeleton
//! descriptor, and a bridge forwards between the caller and the sub-stream
//! until either side finishes.

use std::sync::Arc;

use crate::bipipe::bridge::{self, BridgeOptions};
use crate::bipipe::listener::BipipeListener;
use crate::common::descriptor::ChannelDescriptor;
use crate::common::TunnelError;
use crate::util::shutdown::Shutdown;
use crate::util::stats::ConnGuard;

use super::env::ChannelEnv;
use super::SubstreamOpener;

pub struct StubProxy {
  name: String,
  descriptor: ChannelDescriptor,
  listener: Arc<dyn BipipeListener>,
  shutdown: Shutdown<TunnelError>,
}

impl StubProxy {
  /// Creates the stub listener for `descriptor` and starts its accept
  /// loop. `index` is the channel's ordinal in the session config, for
  /// logging only.
  pub async fn start(
    index: usize,
    descriptor: ChannelDescriptor,
    env: Arc<ChannelEnv>,
    opener: Arc<dyn SubstreamOpener>,
  ) -> Result<Arc<Self>, TunnelError> {
    let name = format!("proxy#{}:{}", index + 1, descriptor);
    let listener = env.stub_listener(&descriptor.stub)?;
    listener.start_listening().await?;

    let shutdown = Shutdown::<TunnelError>::new();
    let _ = shutdown.activate();

    let proxy = Arc::new(Self {
      name,
      descriptor,
      listener,
      shutdown: shutdown.clone(),
    });

    {
      let proxy = Arc::clone(&proxy);
      let env = Arc::clone(&env);
      tokio::spawn(async move {
        proxy.accept_loop(env, opener).await;
      });
    }
    {
      let listener_shutdown = proxy.listener.shutdown_handle();
      tokio::spawn(async move {
        shutdown.started().cancelled().await;
        listener_shutdown.start(shutdown.advisory_cause());
        listener_shutdown.wait().await;
        shutdown.complete(None).await;
      });
    }

    Ok(proxy)
  }

  pub fn shutdown_handle(&self) -> Shutdown<TunnelError> {
    self.shutdown.clone()
  }

  pub fn start_shutdown(&self, cause: Option<TunnelError>) {
    self.shutdown.start(cause);
  }

  async fn accept_loop(&self, env: Arc<ChannelEnv>, opener: Arc<dyn SubstreamOpener>) {
    let cancel = self.shutdown.started();
    loop {
      match self.listener.accept(&cancel).await {
        Ok((caller, info)) => {
          tracing::debug!(proxy = %self.name, peer = ?info.peer_addr, "caller accepted");
          let skeleton = self.descriptor.skeleton.clone();
          let opener = Arc::clone(&opener);
          let env = Arc::clone(&env);
          let name = self.name.clone();
          tokio::spawn(async move {
            let _guard = ConnGuard::open(env.stats());
            let remote = match opener.open(&skeleton).await {
              Ok(remote) => remote,
              Err(e) => {
                tracing::warn!(proxy = %name, error = %e, "sub-stream open to remote endpoint failed");
                caller.start_shutdown(Some(e));
                return;
              }
            };
            let bridge = bridge::start(caller, remote, BridgeOptions::default());
            let result = bridge.wait().await;
            let to_remote = bridge.bytes_written(1);
            let to_caller = bridge.bytes_written(0);
            match result {
              None => tracing::debug!(
                proxy = %name,
                caller_sent = to_remote,
                service_sent = to_caller,
                stats = %env.stats(),
                "proxy connection ended normally"
              ),
              Some(e) => tracing::debug!(
                proxy = %name,
                caller_sent = to_remote,
                service_sent = to_caller,
                error = %e,
                "proxy connection failed"
              ),
            }
          });
        }
        Err(e) if e.persistent => {
          if !self.shutdown.is_scheduled() {
            tracing::info!(proxy = %self.name, error = %e, "listener failed; stopping accept loop");
            self.shutdown.start(Some(e.error));
          }
          return;
        }
        Err(e) => {
          if self.shutdown.is_scheduled() {
            return;
          }
          tracing::debug!(proxy = %self.name, error = %e, "transient accept failure");
        }
      }
    }
  }
}

impl std::fmt::Display for StubProxy {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.write_str(&self.name)
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Shared environment handed to endpoint factories: which proxy side we
//! are, the loop registry, the SOCKS engine, and connection stats.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bipipe::dialer::BipipeDialer;
use crate::bipipe::listener::BipipeListener;
use crate::bipipe::loopback::{self, LoopRegistry, LoopSkeletonDialer};
use crate::bipipe::net::{TcpSkeletonDialer, TcpStubListener, UnixSkeletonDialer, UnixStubListener};
use crate::bipipe::stdio::{StdioSkeletonDialer, StdioStubListener};
use crate::bipipe::{Bipipe, ConnectionInfo};
use crate::common::descriptor::{EndpointDescriptor, EndpointProtocol, EndpointRole};
use crate::common::TunnelError;
use crate::util::cancellation::CancellationListener;
use crate::util::stats::ConnStats;

/// The shared stateless SOCKS service: given a connected socket, serve the
/// SOCKS protocol on it, dialing out as requested.
pub struct SocksEngine {
  config: Arc<fast_socks5::server::Config>,
}

impl SocksEngine {
  pub fn new() -> Arc<Self> {
    Arc::new(Self {
      config: Arc::new(fast_socks5::server::Config::default()),
    })
  }

  pub async fn serve<S>(&self, socket: S) -> Result<(), TunnelError>
  where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Send + Unpin + 'static,
  {
    let socks = fast_socks5::server::Socks5Socket::new(socket, Arc::clone(&self.config));
    socks
      .upgrade_to_socks5()
      .await
      .map(|_| ())
      .map_err(|e| TunnelError::Io(format!("socks session failed: {}", e)))
  }
}

/// Skeleton endpoint backed by the internal SOCKS engine. Dial-and-serve
/// hands the caller socket straight to the engine; plain dial inserts an
/// in-process pair for callers that need a bipipe back.
pub struct SocksSkeletonDialer {
  descriptor: EndpointDescriptor,
  engine: Arc<SocksEngine>,
}

impl SocksSkeletonDialer {
  pub fn new(descriptor: EndpointDescriptor, engine: Arc<SocksEngine>) -> Arc<Self> {
    Arc::new(Self { descriptor, engine })
  }
}

#[async_trait]
impl BipipeDialer for SocksSkeletonDialer {
  fn descriptor(&self) -> &EndpointDescriptor {
    &self.descriptor
  }

  async fn dial(
    &self,
    _cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), TunnelError> {
    let (app_side, engine_side) = tokio::io::duplex(64 * 1024);
    let engine = Arc::clone(&self.engine);
    tokio::spawn(async move {
      if let Err(e) = engine.serve(engine_side).await {
        tracing::debug!(error = %e, "socks engine session ended with error");
      }
    });
    Ok((
      Bipipe::new("socks", crate::bipipe::BipipeStream::Duplex(app_side)),
      ConnectionInfo::new("socks"),
    ))
  }

  async fn dial_and_serve(
    &self,
    _cancel: &CancellationListener,
    caller: Bipipe,
  ) -> Result<(u64, u64), TunnelError> {
    let watch = caller.watch();
    let result = self.engine.serve(caller).await;
    let counts = (watch.bytes_read(), watch.bytes_written());
    result.map(|_| counts)
  }
}

/// Context for instantiating local channel endpoints on one proxy side.
pub struct ChannelEnv {
  is_server: bool,
  loop_registry: Option<Arc<LoopRegistry>>,
  socks: Option<Arc<SocksEngine>>,
  stats: Arc<ConnStats>,
}

impl ChannelEnv {
  pub fn new(
    is_server: bool,
    loop_registry: Option<Arc<LoopRegistry>>,
    socks: Option<Arc<SocksEngine>>,
    stats: Arc<ConnStats>,
  ) -> Arc<Self> {
    Arc::new(Self {
      is_server,
      loop_registry,
      socks,
      stats,
    })
  }

  pub fn is_server(&self) -> bool {
    self.is_server
  }

  pub fn stats(&self) -> &Arc<ConnStats> {
    &self.stats
  }

  pub fn loop_registry(&self) -> Option<&Arc<LoopRegistry>> {
    self.loop_registry.as_ref()
  }

  /// Instantiates the stub-side listener for a local endpoint descriptor.
  pub fn stub_listener(
    &self,
    descriptor: &EndpointDescriptor,
  ) -> Result<Arc<dyn BipipeListener>, TunnelError> {
    if descriptor.role != EndpointRole::Stub {
      return Err(TunnelError::InvalidDescriptor(format!(
        "{}: Role must be stub",
        descriptor
      )));
    }
    match descriptor.protocol {
      EndpointProtocol::Stdio => {
        if self.is_server {
          Err(TunnelError::PolicyDenied(format!(
            "{}: stdio endpoints are not allowed on the server side",
            descriptor
          )))
        } else {
          let listener = StdioStubListener::new(descriptor.clone())?;
          Ok(listener)
        }
      }
      EndpointProtocol::Loop => match &self.loop_registry {
        None => Err(TunnelError::PolicyDenied(format!(
          "{}: Loop endpoints are disabled",
          descriptor
        ))),
        Some(registry) => {
          let listener = loopback::register_loop_stub(descriptor.clone(), registry)?;
          Ok(listener)
        }
      },
      EndpointProtocol::Tcp => Ok(TcpStubListener::new(descriptor.clone())),
      EndpointProtocol::Unix => Ok(UnixStubListener::new(descriptor.clone())),
      EndpointProtocol::Socks => Err(TunnelError::InvalidDescriptor(format!(
        "{}: Socks endpoint role must be skeleton",
        descriptor
      ))),
    }
  }

  /// Instantiates the skeleton-side dialer for a local endpoint descriptor.
  pub fn skeleton_dialer(
    &self,
    descriptor: &EndpointDescriptor,
  ) -> Result<Arc<dyn BipipeDialer>, TunnelError> {
    if descriptor.role != EndpointRole::Skeleton {
      return Err(TunnelError::InvalidDescriptor(format!(
        "{}: Role must be skeleton",
        descriptor
      )));
    }
    match descriptor.protocol {
      EndpointProtocol::Stdio => {
        if self.is_server {
          Err(TunnelError::PolicyDenied(format!(
            "{}: stdio endpoints are not allowed on the server side",
            descriptor
          )))
        } else {
          Ok(StdioSkeletonDialer::new(descriptor.clone()))
        }
      }
      EndpointProtocol::Loop => match &self.loop_registry {
        None => Err(TunnelError::PolicyDenied(format!(
          "{}: Loop endpoints are disabled",
          descriptor
        ))),
        Some(registry) => Ok(LoopSkeletonDialer::new(
          descriptor.clone(),
          Arc::clone(registry),
        )),
      },
      EndpointProtocol::Tcp => Ok(TcpSkeletonDialer::new(descriptor.clone())),
      EndpointProtocol::Unix => Ok(UnixSkeletonDialer::new(descriptor.clone())),
      EndpointProtocol::Socks => match &self.socks {
        None => Err(TunnelError::PolicyDenied(format!(
          "{}: socks endpoints are disabled",
          descriptor
        ))),
        Some(engine) => Ok(SocksSkeletonDialer::new(
          descriptor.clone(),
          Arc::clone(engine),
        )),
      },
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn env(is_server: bool, with_loop: bool, with_socks: bool) -> Arc<ChannelEnv> {
    ChannelEnv::new(
      is_server,
      with_loop.then(LoopRegistry::new),
      with_socks.then(SocksEngine::new),
      ConnStats::new(),
    )
  }

  fn ep(role: EndpointRole, protocol: EndpointProtocol, path: &str) -> EndpointDescriptor {
    EndpointDescriptor::new(role, protocol, path)
  }

  #[tokio::test]
  async fn server_side_rejects_stdio() {
    let env = env(true, true, true);
    assert!(env
      .stub_listener(&ep(EndpointRole::Stub, EndpointProtocol::Stdio, ""))
      .is_err());
    assert!(env
      .skeleton_dialer(&ep(EndpointRole::Skeleton, EndpointProtocol::Stdio, ""))
      .is_err());
  }

  #[tokio::test]
  async fn disabled_features_are_policy_errors() {
    let env = env(true, false, false);
    let loop_stub = env.stub_listener(&ep(EndpointRole::Stub, EndpointProtocol::Loop, "x"));
    assert!(matches!(loop_stub, Err(TunnelError::PolicyDenied(_))));
    let socks = env.skeleton_dialer(&ep(EndpointRole::Skeleton, EndpointProtocol::Socks, ""));
    assert!(matches!(socks, Err(TunnelError::PolicyDenied(_))));
  }

  #[tokio::test]
  async fn role_mismatch_is_rejected() {
    let env = env(false, true, true);
    assert!(env
      .stub_listener(&ep(EndpointRole::Skeleton, EndpointProtocol::Tcp, "127.0.0.1:1"))
      .is_err());
    assert!(env
      .skeleton_dialer(&ep(EndpointRole::Stub, EndpointProtocol::Tcp, "127.0.0.1:1"))
      .is_err());
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The session data plane: config negotiation over SSH, per-channel
//! sub-streams, stub proxies, and the client/server supervisors.

use std::sync::Arc;

use async_trait::async_trait;

use crate::bipipe::Bipipe;
use crate::common::descriptor::{EndpointDescriptor, EndpointRole};
use crate::common::TunnelError;
use crate::util::cancellation::CancellationListener;
use crate::util::stats::ConnGuard;

pub mod client;
pub mod env;
pub mod proxy;
pub mod rpc;
pub mod server;

use env::ChannelEnv;

/// Opens one SSH sub-stream to the peer, carrying the JSON skeleton
/// descriptor the far side should dial. Implemented over the client and
/// server SSH handles.
#[async_trait]
pub trait SubstreamOpener: Send + Sync {
  async fn open(&self, skeleton: &EndpointDescriptor) -> Result<Bipipe, TunnelError>;
}

/// Handles one inbound SSH sub-stream: parse and validate the skeleton
/// descriptor, instantiate the local skeleton dialer, and serve the
/// sub-stream until both directions complete. Returns the byte counts
/// (caller→service, service→caller).
pub async fn handle_inbound_substream(
  env: &Arc<ChannelEnv>,
  skeleton: EndpointDescriptor,
  pipe: Bipipe,
) -> Result<(u64, u64), TunnelError> {
  if skeleton.role != EndpointRole::Skeleton {
    let e = TunnelError::PolicyDenied("endpoint role must be skeleton".to_string());
    pipe.start_shutdown(Some(e.clone()));
    return Err(e);
  }
  if let Err(e) = skeleton.validate() {
    pipe.start_shutdown(Some(e.clone()));
    return Err(e);
  }
  let dialer = match env.skeleton_dialer(&skeleton) {
    Ok(dialer) => dialer,
    Err(e) => {
      pipe.start_shutdown(Some(e.clone()));
      return Err(e);
    }
  };
  let _guard = ConnGuard::open(env.stats());
  tracing::debug!(endpoint = %skeleton, stats = %env.stats(), "serving inbound sub-stream");
  let result = dialer
    .dial_and_serve(&CancellationListener::none(), pipe)
    .await;
  match &result {
    Ok((sent, received)) => {
      tracing::debug!(endpoint = %skeleton, sent, received, "sub-stream session ended normally")
    }
    Err(e) => {
      tracing::debug!(endpoint = %skeleton, error = %e, "sub-stream session ended with error")
    }
  }
  result
}

/// Parses the UTF-8 JSON skeleton descriptor carried in a sub-stream open
/// request.
pub fn parse_substream_extra(extra: &str) -> Result<EndpointDescriptor, TunnelError> {
  serde_json::from_str(extra)
    .map_err(|e| TunnelError::InvalidDescriptor(format!("bad sub-stream open data: {}", e)))
}

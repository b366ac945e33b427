// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Skeleton-side bipipe factories: dialers producing one [Bipipe] per
//! connection to a locally reachable service.

use async_trait::async_trait;

use super::bridge::{self, BridgeOptions};
use super::{Bipipe, ConnectionInfo};
use crate::common::descriptor::EndpointDescriptor;
use crate::common::TunnelError;
use crate::util::cancellation::CancellationListener;

/// A virtual bipipe factory that creates connections on demand. Dial
/// failures do not taint the dialer; cancelling one dial abandons only that
/// call.
#[async_trait]
pub trait BipipeDialer: Send + Sync {
  fn descriptor(&self) -> &EndpointDescriptor;

  async fn dial(
    &self,
    cancel: &CancellationListener,
  ) -> Result<(Bipipe, ConnectionInfo), TunnelError>;

  /// Dials, then services an already-connected caller bipipe through a
  /// bridge until both directions complete. Returns the byte counts
  /// (caller→service, service→caller). Endpoints that can couple the caller
  /// directly to the far side override this to skip the intermediate hop.
  async fn dial_and_serve(
    &self,
    cancel: &CancellationListener,
    caller: Bipipe,
  ) -> Result<(u64, u64), TunnelError> {
    let (service, _info) = match self.dial(cancel).await {
      Ok(dialed) => dialed,
      Err(e) => {
        caller.start_shutdown(Some(e.clone()));
        return Err(e);
      }
    };
    let bridge = bridge::start(caller, service, BridgeOptions::default());
    let result = bridge.wait().await;
    let sent = bridge.bytes_written(1);
    let received = bridge.bytes_written(0);
    match result {
      None => Ok((sent, received)),
      Some(e) => Err(e),
    }
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! SSH sub-stream bipipes.
//!
//! One SSH channel carries one tunneled connection. `close_write` maps to
//! the SSH EOF message (half-close); reads complete when the peer closes
//! its own write half; shutdown drops the channel, which closes it.

use russh::Channel;

use super::{Bipipe, BipipeStream};

/// Wraps a client-side SSH channel as a bipipe.
pub fn from_client_channel(channel: Channel<russh::client::Msg>, label: &str) -> Bipipe {
  let id = channel.id();
  Bipipe::new(
    format!("ssh:{} #{:?}", label, id),
    BipipeStream::SshClient(channel.into_stream()),
  )
}

/// Wraps a server-side SSH channel as a bipipe.
pub fn from_server_channel(channel: Channel<russh::server::Msg>, label: &str) -> Bipipe {
  let id = channel.id();
  Bipipe::new(
    format!("ssh:{} #{:?}", label, id),
    BipipeStream::SshServer(channel.into_stream()),
  )
}

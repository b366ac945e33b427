// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! One-request/one-reply JSON exchange over an SSH session channel.
//!
//! The config exchange and the steady-state ping both ride this shape: the
//! requester sends one JSON document and half-closes; the responder replies
//! with one JSON document and closes. The server bounds its wait for the
//! first (config) request.

use std::time::Duration;

use russh::{Channel, ChannelMsg};

use crate::common::config::{PeerReply, PeerRequest};
use crate::common::TunnelError;

/// Deadline for the first request on a new session.
pub const FIRST_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

async fn read_document<S>(channel: &mut Channel<S>) -> Result<Vec<u8>, TunnelError>
where
  S: From<(russh::ChannelId, ChannelMsg)> + Send + Sync + 'static,
{
  let mut buf = Vec::new();
  loop {
    match channel.wait().await {
      Some(ChannelMsg::Data { data }) => buf.extend_from_slice(&data),
      Some(ChannelMsg::Eof) | Some(ChannelMsg::Close) | None => break,
      Some(_) => {}
    }
  }
  if buf.is_empty() {
    return Err(TunnelError::Transport(
      "peer closed the request channel without a document".to_string(),
    ));
  }
  Ok(buf)
}

/// Issues one request on a fresh session channel and awaits the reply.
pub async fn call(
  mut channel: Channel<russh::client::Msg>,
  request: &PeerRequest,
) -> Result<PeerReply, TunnelError> {
  let payload = serde_json::to_vec(request)
    .map_err(|e| TunnelError::Internal(format!("request serialization failed: {}", e)))?;
  channel.data(&payload[..]).await?;
  channel.eof().await?;
  let raw = read_document(&mut channel).await?;
  let reply: PeerReply = serde_json::from_slice(&raw)
    .map_err(|e| TunnelError::Transport(format!("malformed reply: {}", e)))?;
  Ok(reply)
}

/// Server side: reads one request, optionally bounded by a deadline.
pub async fn read_request(
  channel: &mut Channel<russh::server::Msg>,
  deadline: Option<Duration>,
) -> Result<PeerRequest, TunnelError> {
  let raw = match deadline {
    Some(d) => tokio::time::timeout(d, read_document(channel))
      .await
      .map_err(|_| TunnelError::Handshake("request not received before deadline".to_string()))??,
    None => read_document(channel).await?,
  };
  let request: PeerRequest = serde_json::from_slice(&raw)
    .map_err(|e| TunnelError::Handshake(format!("malformed request: {}", e)))?;
  Ok(request)
}

/// Server side: sends the reply and closes the channel.
pub async fn respond(
  channel: &mut Channel<russh::server::Msg>,
  reply: &PeerReply,
) -> Result<(), TunnelError> {
  let payload = serde_json::to_vec(reply)
    .map_err(|e| TunnelError::Internal(format!("reply serialization failed: {}", e)))?;
  channel.data(&payload[..]).await?;
  channel.eof().await?;
  channel.close().await?;
  Ok(())
}

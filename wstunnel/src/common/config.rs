// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Session configuration exchange types.
//!
//! The first request on a new session carries the client's
//! [SessionConfigRequest]; the server validates it and replies with a
//! [PeerReply]. At steady state the only out-of-band request is `ping`.
//! Requests and replies are UTF-8 JSON documents.

use serde::{Deserialize, Serialize};

use super::descriptor::ChannelDescriptor;

/// Session configuration sent from client to server as the first request on
/// a new session. The ordinal index of each channel is stable and used only
/// for logging.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfigRequest {
  #[serde(default)]
  pub version: String,
  #[serde(default)]
  pub channels: Vec<ChannelDescriptor>,
}

/// An out-of-band request from one peer to the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PeerRequest {
  Config(SessionConfigRequest),
  Ping,
}

/// Boolean reply to a [PeerRequest]; `reason` carries a human-readable
/// explanation on rejection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerReply {
  pub ok: bool,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub reason: Option<String>,
}

impl PeerReply {
  pub fn accept() -> Self {
    Self {
      ok: true,
      reason: None,
    }
  }

  pub fn reject(reason: impl Into<String>) -> Self {
    Self {
      ok: false,
      reason: Some(reason.into()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::descriptor::*;

  #[test]
  fn config_request_round_trips() {
    let req = PeerRequest::Config(SessionConfigRequest {
      version: "0.9.0".to_string(),
      channels: vec![ChannelDescriptor::parse("3000:google.com:80").unwrap()],
    });
    let json = serde_json::to_string(&req).unwrap();
    let back: PeerRequest = serde_json::from_str(&json).unwrap();
    assert_eq!(back, req);
  }

  #[test]
  fn ping_is_tagged() {
    let json = serde_json::to_string(&PeerRequest::Ping).unwrap();
    assert_eq!(json, r#"{"type":"ping"}"#);
  }

  #[test]
  fn reply_reason_is_omitted_on_accept() {
    let json = serde_json::to_string(&PeerReply::accept()).unwrap();
    assert_eq!(json, r#"{"ok":true}"#);
    let back: PeerReply = serde_json::from_str(r#"{"ok":false,"reason":"denied"}"#).unwrap();
    assert_eq!(back, PeerReply::reject("denied"));
  }
}

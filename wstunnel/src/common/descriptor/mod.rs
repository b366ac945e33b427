// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Typed endpoint and channel descriptors.
//!
//! We adopt the vocabulary of distributed object communication: a *stub*
//! listens locally and impersonates the remote service; a *skeleton* dials
//! locally and impersonates the remote caller. A channel pairs one stub with
//! one skeleton; `reverse` flips which proxy side hosts the stub.

use serde::{Deserialize, Serialize};

use super::TunnelError;

mod parse;

pub use parse::{parse_host_port, split_bracketed_parts, strip_angle_brackets, PortNumber};

/// Which end of a channel pair an endpoint occupies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointRole {
  Stub,
  Skeleton,
}

impl std::fmt::Display for EndpointRole {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EndpointRole::Stub => f.write_str("stub"),
      EndpointRole::Skeleton => f.write_str("skeleton"),
    }
  }
}

/// Transport protocol of one endpoint. A closed set; new transports register
/// a tag here plus a listener/dialer factory pair in the session environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EndpointProtocol {
  Tcp,
  Unix,
  Socks,
  Stdio,
  Loop,
}

impl std::fmt::Display for EndpointProtocol {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      EndpointProtocol::Tcp => f.write_str("tcp"),
      EndpointProtocol::Unix => f.write_str("unix"),
      EndpointProtocol::Socks => f.write_str("socks"),
      EndpointProtocol::Stdio => f.write_str("stdio"),
      EndpointProtocol::Loop => f.write_str("loop"),
    }
  }
}

/// Immutable description of one end of a channel.
///
/// The meaning of `path` depends on role and protocol:
///
/// | protocol | stub                      | skeleton                |
/// |----------|---------------------------|-------------------------|
/// | tcp      | `<bind-addr>:<port>`      | `<hostname>:<port>`     |
/// | unix     | socket path for listen    | socket path for connect |
/// | socks    | (invalid)                 | empty                   |
/// | stdio    | empty                     | empty                   |
/// | loop     | loop name for listen      | loop name for connect   |
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct EndpointDescriptor {
  pub role: EndpointRole,
  #[serde(rename = "type")]
  pub protocol: EndpointProtocol,
  #[serde(default)]
  pub path: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub version: Option<String>,
}

impl EndpointDescriptor {
  pub fn new(role: EndpointRole, protocol: EndpointProtocol, path: impl Into<String>) -> Self {
    Self {
      role,
      protocol,
      path: path.into(),
      version: None,
    }
  }

  /// Validates the descriptor against the per-protocol path rules.
  pub fn validate(&self) -> Result<(), TunnelError> {
    let fail = |msg: String| Err(TunnelError::InvalidDescriptor(format!("{}: {}", self, msg)));
    match self.protocol {
      EndpointProtocol::Tcp => {
        if self.path.is_empty() {
          return fail(match self.role {
            EndpointRole::Stub => "TCP stub endpoint requires a bind address and port".into(),
            EndpointRole::Skeleton => {
              "TCP skeleton endpoint requires a target hostname and port".into()
            }
          });
        }
        let (host, port) =
          parse_host_port(&self.path, "", None).map_err(|e| match self.role {
            EndpointRole::Stub => TunnelError::InvalidDescriptor(format!(
              "{}: TCP stub endpoint <bind-address>:<port> is invalid: {}",
              self, e
            )),
            EndpointRole::Skeleton => TunnelError::InvalidDescriptor(format!(
              "{}: TCP skeleton endpoint <hostname>:<port> is invalid: {}",
              self, e
            )),
          })?;
        if host.is_empty() {
          return fail(match self.role {
            EndpointRole::Stub => "TCP stub endpoint requires a bind address".into(),
            EndpointRole::Skeleton => "TCP skeleton endpoint requires a target hostname".into(),
          });
        }
        if port.is_none() {
          return fail("TCP endpoint requires a port number".into());
        }
      }
      EndpointProtocol::Unix => {
        if self.path.is_empty() {
          return fail("Unix domain socket endpoint requires a socket pathname".into());
        }
      }
      EndpointProtocol::Loop => {
        if self.path.is_empty() {
          return fail("Loop endpoint requires a loop name".into());
        }
      }
      EndpointProtocol::Stdio => {
        if !self.path.is_empty() {
          return fail("STDIO endpoint cannot have a path".into());
        }
      }
      EndpointProtocol::Socks => {
        if !self.path.is_empty() {
          return fail("SOCKS endpoint cannot have a path".into());
        }
        if self.role != EndpointRole::Skeleton {
          return fail("SOCKS endpoint must be placed on the skeleton side".into());
        }
      }
    }
    Ok(())
  }
}

impl std::fmt::Display for EndpointDescriptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "<{}:{}>", self.protocol, self.path)
  }
}

/// One stub endpoint paired with one skeleton endpoint. Owned by the session
/// that negotiated it; cloned, never shared, across the wire.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelDescriptor {
  /// When true, the stub is materialized on the proxy server and the
  /// skeleton on the proxy client.
  #[serde(default)]
  pub reverse: bool,
  pub stub: EndpointDescriptor,
  pub skeleton: EndpointDescriptor,
}

impl ChannelDescriptor {
  pub fn validate(&self) -> Result<(), TunnelError> {
    self.stub.validate()?;
    self.skeleton.validate()?;
    if self.stub.role != EndpointRole::Stub {
      return Err(TunnelError::InvalidDescriptor(format!(
        "{}: Role of stub must be stub",
        self
      )));
    }
    if self.skeleton.role != EndpointRole::Skeleton {
      return Err(TunnelError::InvalidDescriptor(format!(
        "{}: Role of skeleton must be skeleton",
        self
      )));
    }
    // A stdio endpoint is always on the proxy client: the stub in forward
    // mode, the skeleton in reverse mode.
    let server_side = if self.reverse {
      &self.stub
    } else {
      &self.skeleton
    };
    if server_side.protocol == EndpointProtocol::Stdio {
      return Err(TunnelError::InvalidDescriptor(format!(
        "{}: STDIO endpoint must be on client proxy side",
        self
      )));
    }
    Ok(())
  }

  /// Parses the legacy compact channel descriptor grammar; see
  /// [parse::parse_channel_descriptor].
  pub fn parse(s: &str) -> Result<Self, TunnelError> {
    parse::parse_channel_descriptor(s)
  }

  /// The side of this channel local to `is_server`: `(stub_is_local,
  /// skeleton_is_local)`.
  pub fn stub_is_local(&self, is_server: bool) -> bool {
    self.reverse == is_server
  }
}

impl std::fmt::Display for ChannelDescriptor {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    if self.reverse {
      f.write_str("R:")?;
    }
    write!(f, "{}:{}", self.stub, self.skeleton)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ep(role: EndpointRole, protocol: EndpointProtocol, path: &str) -> EndpointDescriptor {
    EndpointDescriptor::new(role, protocol, path)
  }

  #[test]
  fn socks_stub_never_validates() {
    let d = ep(EndpointRole::Stub, EndpointProtocol::Socks, "");
    assert!(d.validate().is_err());
    let d = ep(EndpointRole::Skeleton, EndpointProtocol::Socks, "");
    assert!(d.validate().is_ok());
  }

  #[test]
  fn stdio_with_path_never_validates() {
    let d = ep(EndpointRole::Stub, EndpointProtocol::Stdio, "/dev/tty");
    assert!(d.validate().is_err());
    let d = ep(EndpointRole::Stub, EndpointProtocol::Stdio, "");
    assert!(d.validate().is_ok());
  }

  #[test]
  fn tcp_without_port_never_validates() {
    let d = ep(EndpointRole::Skeleton, EndpointProtocol::Tcp, "localhost");
    assert!(d.validate().is_err());
    let d = ep(EndpointRole::Skeleton, EndpointProtocol::Tcp, "localhost:80");
    assert!(d.validate().is_ok());
  }

  #[test]
  fn stdio_must_live_on_the_client() {
    let chd = ChannelDescriptor {
      reverse: false,
      stub: ep(EndpointRole::Stub, EndpointProtocol::Tcp, "0.0.0.0:22"),
      skeleton: ep(EndpointRole::Skeleton, EndpointProtocol::Stdio, ""),
    };
    assert!(chd.validate().is_err());
    let chd = ChannelDescriptor {
      reverse: true,
      stub: ep(EndpointRole::Stub, EndpointProtocol::Tcp, "0.0.0.0:22"),
      skeleton: ep(EndpointRole::Skeleton, EndpointProtocol::Stdio, ""),
    };
    assert!(chd.validate().is_ok());
  }

  #[test]
  fn display_matches_wire_matching_form() {
    let chd = ChannelDescriptor {
      reverse: true,
      stub: ep(EndpointRole::Stub, EndpointProtocol::Tcp, "0.0.0.0:2222"),
      skeleton: ep(EndpointRole::Skeleton, EndpointProtocol::Tcp, "127.0.0.1:22"),
    };
    assert_eq!(chd.to_string(), "R:<tcp:0.0.0.0:2222>:<tcp:127.0.0.1:22>");
  }

  #[test]
  fn json_wire_form_uses_type_key() {
    let d = ep(EndpointRole::Skeleton, EndpointProtocol::Loop, "name1");
    let json = serde_json::to_string(&d).unwrap();
    assert!(json.contains("\"type\":\"loop\""), "got {}", json);
    let back: EndpointDescriptor = serde_json::from_str(&json).unwrap();
    assert_eq!(back, d);
  }
}

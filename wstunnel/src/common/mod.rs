// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
pub mod authfile;
pub mod config;
pub mod descriptor;
pub mod keys;

/// Error type shared across the tunnel layers. Variants are cloneable so the
/// first observed failure can propagate as the advisory completion cause of
/// every component it cascades through.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TunnelError {
  #[error("I/O failure: {0}")]
  Io(String),
  #[error("Listener was closed")]
  ListenerClosed,
  #[error("Nothing listening on loop name \"{0}\"")]
  NotListening(String),
  #[error("Listener accept backlog full")]
  AcceptBacklogFull,
  #[error("Invalid channel descriptor: {0}")]
  InvalidDescriptor(String),
  #[error("Administratively prohibited: {0}")]
  PolicyDenied(String),
  #[error("Handshake failed: {0}")]
  Handshake(String),
  #[error("Unable to authenticate with the proxy server")]
  AuthenticationFailed,
  #[error("Invalid fingerprint ({0})")]
  FingerprintMismatch(String),
  #[error("Session config rejected: {0}")]
  ConfigRejected(String),
  #[error("Transport failure: {0}")]
  Transport(String),
  #[error("Internal invariant violated: {0}")]
  Internal(String),
  #[error("Operation cancelled")]
  Cancelled,
  #[error("Component is shut down")]
  ShutDown,
}

impl From<std::io::Error> for TunnelError {
  fn from(e: std::io::Error) -> Self {
    TunnelError::Io(e.to_string())
  }
}

impl From<russh::Error> for TunnelError {
  fn from(e: russh::Error) -> Self {
    TunnelError::Transport(e.to_string())
  }
}

impl From<serde_json::Error> for TunnelError {
  fn from(e: serde_json::Error) -> Self {
    TunnelError::InvalidDescriptor(e.to_string())
  }
}

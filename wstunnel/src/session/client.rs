// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The proxy client: WebSocket + SSH handshake, config exchange, stub
//! proxies, keepalive, and the reconnect supervisor.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use russh::{Channel, SshId};
use tokio::net::TcpStream;
use tokio::sync::Notify;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::{HeaderValue, HOST, SEC_WEBSOCKET_PROTOCOL};
use tokio_util::sync::CancellationToken;

use crate::bipipe::loopback::LoopRegistry;
use crate::bipipe::ssh::from_client_channel;
use crate::bipipe::Bipipe;
use crate::common::authfile::parse_auth;
use crate::common::config::{PeerRequest, SessionConfigRequest};
use crate::common::descriptor::{ChannelDescriptor, EndpointDescriptor, EndpointProtocol};
use crate::common::keys;
use crate::common::TunnelError;
use crate::util::shutdown::Shutdown;
use crate::util::stats::ConnStats;
use crate::util::websocket::WebSocketByteStream;
use crate::{BUILD_VERSION, PROTOCOL_VERSION};

use super::env::{ChannelEnv, SocksEngine};
use super::proxy::StubProxy;
use super::rpc;
use super::{handle_inbound_substream, parse_substream_extra, SubstreamOpener};

/// Client configuration, assembled by the CLI.
#[derive(Debug, Clone)]
pub struct ClientConfig {
  /// Server URL; `http(s)` schemes are swapped for `ws(s)`, a missing
  /// scheme defaults to `http`, and a missing port follows the scheme.
  pub server: String,
  pub channels: Vec<ChannelDescriptor>,
  /// Expected server key fingerprint prefix; empty disables checking.
  pub fingerprint: Option<String>,
  /// `user:pass` credentials.
  pub auth: Option<String>,
  /// Interval between keepalive pings; `None` disables them.
  pub keepalive: Option<Duration>,
  /// Maximum connection attempts before giving up; negative means retry
  /// forever.
  pub max_retry_count: i32,
  /// Backoff cap between attempts.
  pub max_retry_interval: Duration,
  /// Optional HTTP CONNECT proxy URL.
  pub http_proxy: Option<String>,
  /// Optional Host header override.
  pub host_header: Option<String>,
}

impl Default for ClientConfig {
  fn default() -> Self {
    Self {
      server: String::new(),
      channels: Vec::new(),
      fingerprint: None,
      auth: None,
      keepalive: None,
      max_retry_count: -1,
      max_retry_interval: Duration::from_secs(5 * 60),
      http_proxy: None,
      host_header: None,
    }
  }
}

/// Exponential backoff between connection attempts; a successful
/// connection resets it.
struct Backoff {
  min: Duration,
  max: Duration,
  attempt: u32,
}

impl Backoff {
  fn new(max: Duration) -> Self {
    Self {
      min: Duration::from_millis(100),
      max,
      attempt: 0,
    }
  }

  fn attempt(&self) -> u32 {
    self.attempt
  }

  fn next(&mut self) -> Duration {
    let exp = self.attempt.min(30);
    self.attempt += 1;
    let d = self
      .min
      .checked_mul(2u32.saturating_pow(exp))
      .unwrap_or(self.max);
    d.min(self.max)
  }

  fn reset(&mut self) {
    self.attempt = 0;
  }
}

/// Normalizes the configured server string into a WebSocket URL.
fn websocket_url(server: &str) -> Result<String, TunnelError> {
  let with_scheme = if server.contains("://") {
    server.to_string()
  } else {
    format!("http://{}", server)
  };
  let (scheme, rest) = with_scheme
    .split_once("://")
    .ok_or_else(|| TunnelError::Handshake(format!("invalid server URL: {}", server)))?;
  let ws_scheme = match scheme {
    "http" | "ws" => "ws",
    "https" | "wss" => "wss",
    other => {
      return Err(TunnelError::Handshake(format!(
        "unsupported server URL scheme: {}",
        other
      )))
    }
  };
  // Apply the default port when the authority carries none.
  let (authority, path) = match rest.find('/') {
    Some(idx) => (&rest[..idx], &rest[idx..]),
    None => (rest, ""),
  };
  let has_port = match authority.rfind(':') {
    Some(idx) => authority[idx + 1..].chars().all(|c| c.is_ascii_digit())
      && !authority[idx + 1..].is_empty()
      && !authority.ends_with(']'),
    None => false,
  };
  let authority = if has_port || authority.ends_with(']') && authority.contains("]:") {
    authority.to_string()
  } else if ws_scheme == "wss" {
    format!("{}:443", authority)
  } else {
    format!("{}:80", authority)
  };
  Ok(format!("{}://{}{}", ws_scheme, authority, path))
}

struct ClientHandlerShared {
  expected_fingerprint: Option<String>,
  seen_fingerprint: Mutex<Option<String>>,
  fingerprint_rejected: Mutex<bool>,
}

/// russh client handler: host key verification plus inbound sub-streams
/// for reverse-mode channels.
struct ClientHandler {
  shared: Arc<ClientHandlerShared>,
  env: Arc<ChannelEnv>,
}

#[async_trait]
impl russh::client::Handler for ClientHandler {
  type Error = russh::Error;

  async fn check_server_key(
    &mut self,
    server_public_key: &russh_keys::key::PublicKey,
  ) -> Result<bool, Self::Error> {
    let got = keys::fingerprint(server_public_key);
    *self.shared.seen_fingerprint.lock().unwrap() = Some(got.clone());
    if let Some(expect) = &self.shared.expected_fingerprint {
      if !expect.is_empty() && !got.starts_with(expect.as_str()) {
        *self.shared.fingerprint_rejected.lock().unwrap() = true;
        return Ok(false);
      }
    }
    tracing::info!(fingerprint = %got, "server fingerprint");
    Ok(true)
  }

  async fn server_channel_open_forwarded_tcpip(
    &mut self,
    channel: Channel<russh::client::Msg>,
    connected_address: &str,
    _connected_port: u32,
    _originator_address: &str,
    _originator_port: u32,
    _session: &mut russh::client::Session,
  ) -> Result<(), Self::Error> {
    let env = Arc::clone(&self.env);
    match parse_substream_extra(connected_address) {
      Ok(skeleton) => {
        let pipe = from_client_channel(channel, &skeleton.to_string());
        tokio::spawn(async move {
          let _ = handle_inbound_substream(&env, skeleton, pipe).await;
        });
      }
      Err(e) => {
        tracing::debug!(error = %e, "rejecting inbound sub-stream with malformed descriptor");
        // The channel drops here, closing it; the client surface has no
        // explicit rejection path.
      }
    }
    Ok(())
  }
}

struct ClientSubstreamOpener {
  handle: russh::client::Handle<ClientHandler>,
}

impl ClientSubstreamOpener {
  async fn ping(&self) -> Result<(), TunnelError> {
    let channel = self.handle.channel_open_session().await?;
    let reply = rpc::call(channel, &PeerRequest::Ping).await?;
    if !reply.ok {
      return Err(TunnelError::Transport(
        reply.reason.unwrap_or_else(|| "ping rejected".to_string()),
      ));
    }
    Ok(())
  }
}

#[async_trait]
impl SubstreamOpener for ClientSubstreamOpener {
  async fn open(&self, skeleton: &EndpointDescriptor) -> Result<Bipipe, TunnelError> {
    let extra = serde_json::to_string(skeleton)
      .map_err(|e| TunnelError::Internal(format!("descriptor serialization failed: {}", e)))?;
    let channel = self
      .handle
      .channel_open_direct_tcpip(extra, 0, "127.0.0.1", 0)
      .await?;
    Ok(from_client_channel(channel, &skeleton.to_string()))
  }
}

/// The proxy client supervisor: owns the per-process environment and runs
/// the reconnect loop.
pub struct ProxyClient {
  config: ClientConfig,
  env: Arc<ChannelEnv>,
  stats: Arc<ConnStats>,
  reconnect_now: Arc<Notify>,
}

impl ProxyClient {
  pub fn new(config: ClientConfig) -> Result<Self, TunnelError> {
    for chd in &config.channels {
      chd.validate()?;
    }
    let stats = ConnStats::new();
    let env = ChannelEnv::new(
      false,
      Some(LoopRegistry::new()),
      Some(SocksEngine::new()),
      Arc::clone(&stats),
    );
    Ok(Self {
      config,
      env,
      stats,
      reconnect_now: Arc::new(Notify::new()),
    })
  }

  pub fn stats(&self) -> &Arc<ConnStats> {
    &self.stats
  }

  /// Handle for the reconnect-now signal: short-circuits the current
  /// backoff sleep.
  pub fn reconnect_now_handle(&self) -> Arc<Notify> {
    Arc::clone(&self.reconnect_now)
  }

  /// Runs the client until the context is cancelled, a terminal error
  /// occurs, or the retry budget is exhausted.
  pub async fn run(&self, ctx: CancellationToken) -> Result<(), TunnelError> {
    let url = websocket_url(&self.config.server)?;
    tracing::info!(server = %url, "connecting");
    let mut backoff = Backoff::new(self.config.max_retry_interval.max(Duration::from_secs(1)));
    let mut last_error: Option<TunnelError> = None;

    loop {
      if ctx.is_cancelled() {
        return Ok(());
      }
      if let Some(e) = &last_error {
        let attempt = backoff.attempt();
        let max = self.config.max_retry_count;
        if max >= 0 && attempt >= max as u32 {
          tracing::info!(error = %e, attempts = attempt, "retry budget exhausted");
          return Err(e.clone());
        }
        let delay = backoff.next();
        tracing::info!(error = %e, attempt = attempt + 1, delay = ?delay, "connection failed; retrying");
        tokio::select! {
          _ = tokio::time::sleep(delay) => {}
          _ = self.reconnect_now.notified() => {
            tracing::info!("reconnect-now signal received; retrying immediately");
          }
          _ = ctx.cancelled() => return Ok(()),
        }
      }

      match self.run_one_session(&url, &ctx, &mut backoff).await {
        Ok(()) => return Ok(()),
        Err(e) if is_terminal(&e) => {
          tracing::error!(error = %e, "terminal failure");
          return Err(e);
        }
        Err(e) => {
          last_error = Some(e);
        }
      }
    }
  }

  /// One full connection attempt: WebSocket, SSH handshake, config
  /// exchange, proxies, then blocks until the transport drops or the
  /// context cancels. Returns Ok(()) only on clean context cancellation;
  /// resets the backoff once the session is fully established.
  async fn run_one_session(
    &self,
    url: &str,
    ctx: &CancellationToken,
    backoff: &mut Backoff,
  ) -> Result<(), TunnelError> {
    let shared = Arc::new(ClientHandlerShared {
      expected_fingerprint: self.config.fingerprint.clone(),
      seen_fingerprint: Mutex::new(None),
      fingerprint_rejected: Mutex::new(false),
    });

    let ws = self.open_websocket(url).await?;
    let byte_stream = WebSocketByteStream::new(ws);
    let transport_closed = byte_stream.closed_signal();

    let ssh_config = Arc::new(russh::client::Config {
      client_id: SshId::Standard(format!("SSH-2.0-{}-client", PROTOCOL_VERSION)),
      ..Default::default()
    });
    let handler = ClientHandler {
      shared: Arc::clone(&shared),
      env: Arc::clone(&self.env),
    };
    tracing::debug!("ssh handshaking");
    let mut handle = russh::client::connect_stream(ssh_config, byte_stream, handler)
      .await
      .map_err(|e| {
        if *shared.fingerprint_rejected.lock().unwrap() {
          let got = shared
            .seen_fingerprint
            .lock()
            .unwrap()
            .clone()
            .unwrap_or_default();
          TunnelError::FingerprintMismatch(got)
        } else {
          TunnelError::Handshake(e.to_string())
        }
      })?;

    let (user, pass) = parse_auth(self.config.auth.as_deref().unwrap_or(""));
    let authenticated = handle
      .authenticate_password(user, pass)
      .await
      .map_err(|e| TunnelError::Handshake(e.to_string()))?;
    if !authenticated {
      return Err(TunnelError::AuthenticationFailed);
    }

    tracing::debug!("sending session config request");
    let started = std::time::Instant::now();
    let config_channel = handle.channel_open_session().await?;
    let reply = rpc::call(
      config_channel,
      &PeerRequest::Config(SessionConfigRequest {
        version: BUILD_VERSION.to_string(),
        channels: self.config.channels.clone(),
      }),
    )
    .await?;
    if !reply.ok {
      return Err(TunnelError::ConfigRejected(
        reply.reason.unwrap_or_else(|| "no reason given".to_string()),
      ));
    }
    tracing::info!(latency = ?started.elapsed(), "connected");
    backoff.reset();

    let session_shutdown = Shutdown::<TunnelError>::new();
    let _ = session_shutdown.activate();
    let opener = Arc::new(ClientSubstreamOpener { handle });
    let opener_dyn: Arc<dyn SubstreamOpener> = Arc::<ClientSubstreamOpener>::clone(&opener);

    // Forward-mode stub listeners run locally; stdio stubs were deferred
    // until now, when the connection is known healthy.
    let mut proxies: Vec<Arc<StubProxy>> = Vec::new();
    let mut startup_error: Option<TunnelError> = None;
    for (index, chd) in self.config.channels.iter().enumerate() {
      if chd.reverse {
        tracing::debug!(index, channel = %chd, "reverse-mode channel; stub runs on the server");
        continue;
      }
      if chd.stub.protocol == EndpointProtocol::Stdio {
        tracing::debug!(index, channel = %chd, "connecting stdio stub");
      }
      match StubProxy::start(
        index,
        chd.clone(),
        Arc::clone(&self.env),
        Arc::clone(&opener_dyn),
      )
      .await
      {
        Ok(proxy) => {
          session_shutdown.add_child(proxy.shutdown_handle());
          proxies.push(proxy);
        }
        Err(e) => {
          startup_error = Some(e);
          break;
        }
      }
    }

    // Optional keepalive: defeat idle-connection closure by middleboxes.
    let keepalive_task = self.config.keepalive.map(|interval| {
      let opener = Arc::<ClientSubstreamOpener>::clone(&opener);
      let halt = session_shutdown.started();
      tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        ticker.tick().await;
        loop {
          tokio::select! {
            _ = halt.cancelled() => return,
            _ = ticker.tick() => {
              // Lack of a reply is tolerated; the traffic itself is the point.
              if let Err(e) = opener.ping().await {
                tracing::debug!(error = %e, "keepalive ping failed");
              }
            }
          }
        }
      })
    });

    let outcome = if let Some(e) = startup_error {
      Err(e)
    } else {
      tokio::select! {
        _ = ctx.cancelled() => Ok(()),
        _ = transport_closed.cancelled() => {
          tracing::info!("disconnected");
          Err(TunnelError::Transport("server disconnected".to_string()))
        }
      }
    };

    session_shutdown.start(None);
    session_shutdown.complete(None).await;
    if let Some(task) = keepalive_task {
      task.abort();
    }

    outcome
  }

  async fn open_websocket(
    &self,
    url: &str,
  ) -> Result<
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<TcpStream>>,
    TunnelError,
  > {
    let mut request = url
      .into_client_request()
      .map_err(|e| TunnelError::Handshake(format!("invalid server URL: {}", e)))?;
    request.headers_mut().insert(
      SEC_WEBSOCKET_PROTOCOL,
      HeaderValue::from_static(PROTOCOL_VERSION),
    );
    if let Some(host) = &self.config.host_header {
      request.headers_mut().insert(
        HOST,
        HeaderValue::from_str(host)
          .map_err(|e| TunnelError::Handshake(format!("invalid Host header: {}", e)))?,
      );
    }

    match &self.config.http_proxy {
      None => {
        let (ws, _response) = tokio_tungstenite::connect_async(request)
          .await
          .map_err(|e| TunnelError::Handshake(format!("websocket connect failed: {}", e)))?;
        Ok(ws)
      }
      Some(proxy) => {
        let stream = http_connect_via_proxy(proxy, request.uri()).await?;
        let (ws, _response) =
          tokio_tungstenite::client_async_tls(request, stream)
            .await
            .map_err(|e| {
              TunnelError::Handshake(format!("websocket connect via proxy failed: {}", e))
            })?;
        Ok(ws)
      }
    }
  }
}

/// Establishes a raw TCP stream to the target through an HTTP CONNECT
/// proxy.
async fn http_connect_via_proxy(
  proxy: &str,
  target: &tokio_tungstenite::tungstenite::http::Uri,
) -> Result<MaybeTls, TunnelError> {
  let proxy_rest = proxy
    .split_once("://")
    .map(|(_, rest)| rest)
    .unwrap_or(proxy);
  let proxy_authority = proxy_rest.split('/').next().unwrap_or(proxy_rest);
  let proxy_addr = if proxy_authority.contains(':') {
    proxy_authority.to_string()
  } else {
    format!("{}:3128", proxy_authority)
  };

  let host = target
    .host()
    .ok_or_else(|| TunnelError::Handshake("server URL has no host".to_string()))?;
  let port = target
    .port_u16()
    .unwrap_or(if target.scheme_str() == Some("wss") { 443 } else { 80 });

  let mut stream = TcpStream::connect(&proxy_addr)
    .await
    .map_err(|e| TunnelError::Handshake(format!("proxy connect failed: {}", e)))?;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  let connect = format!(
    "CONNECT {host}:{port} HTTP/1.1\r\nHost: {host}:{port}\r\n\r\n",
    host = host,
    port = port
  );
  stream
    .write_all(connect.as_bytes())
    .await
    .map_err(|e| TunnelError::Handshake(format!("proxy CONNECT failed: {}", e)))?;
  let mut response = Vec::new();
  let mut byte = [0u8; 1];
  while !response.ends_with(b"\r\n\r\n") {
    let n = stream
      .read(&mut byte)
      .await
      .map_err(|e| TunnelError::Handshake(format!("proxy CONNECT read failed: {}", e)))?;
    if n == 0 {
      return Err(TunnelError::Handshake(
        "proxy closed during CONNECT".to_string(),
      ));
    }
    response.push(byte[0]);
    if response.len() > 16 * 1024 {
      return Err(TunnelError::Handshake(
        "oversized proxy CONNECT response".to_string(),
      ));
    }
  }
  let status_line = String::from_utf8_lossy(&response);
  let ok = status_line
    .split_whitespace()
    .nth(1)
    .map(|code| code.starts_with('2'))
    .unwrap_or(false);
  if !ok {
    return Err(TunnelError::Handshake(format!(
      "proxy refused CONNECT: {}",
      status_line.lines().next().unwrap_or("")
    )));
  }
  Ok(stream)
}

type MaybeTls = TcpStream;

/// Fingerprint mismatch, authentication failure, and config rejection do
/// not enter the retry loop.
fn is_terminal(e: &TunnelError) -> bool {
  matches!(
    e,
    TunnelError::FingerprintMismatch(_)
      | TunnelError::AuthenticationFailed
      | TunnelError::ConfigRejected(_)
      | TunnelError::InvalidDescriptor(_)
  )
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn websocket_url_normalization() {
    assert_eq!(websocket_url("example.com").unwrap(), "ws://example.com:80");
    assert_eq!(
      websocket_url("http://example.com").unwrap(),
      "ws://example.com:80"
    );
    assert_eq!(
      websocket_url("https://example.com").unwrap(),
      "wss://example.com:443"
    );
    assert_eq!(
      websocket_url("example.com:9312").unwrap(),
      "ws://example.com:9312"
    );
    assert_eq!(
      websocket_url("ws://example.com:9312/tunnel").unwrap(),
      "ws://example.com:9312/tunnel"
    );
    assert!(websocket_url("ftp://example.com").is_err());
  }

  #[test]
  fn backoff_grows_and_caps() {
    let mut b = Backoff::new(Duration::from_secs(5));
    let first = b.next();
    let second = b.next();
    assert!(second >= first);
    for _ in 0..20 {
      assert!(b.next() <= Duration::from_secs(5));
    }
    b.reset();
    assert_eq!(b.attempt(), 0);
  }

  #[test]
  fn terminal_errors_do_not_retry() {
    assert!(is_terminal(&TunnelError::AuthenticationFailed));
    assert!(is_terminal(&TunnelError::FingerprintMismatch("ab".into())));
    assert!(is_terminal(&TunnelError::ConfigRejected("denied".into())));
    assert!(!is_terminal(&TunnelError::Transport("io".into())));
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! The proxy server: an HTTP front door that upgrades tunnel clients to
//! WebSocket + SSH sessions, serves health endpoints otherwise, and
//! optionally forwards everything else to a reverse HTTP proxy target.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Incoming;
use hyper::{Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use russh::server::{Auth, Handler, Msg, Session};
use russh::{Channel, MethodSet, SshId};
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::handshake::derive_accept_key;
use tokio_tungstenite::tungstenite::protocol::Role;
use tokio_tungstenite::WebSocketStream;
use tokio_util::sync::CancellationToken;

use crate::bipipe::loopback::LoopRegistry;
use crate::bipipe::ssh::from_server_channel;
use crate::bipipe::Bipipe;
use crate::common::authfile::{parse_auth, User, UserIndex};
use crate::common::config::{PeerReply, PeerRequest, SessionConfigRequest};
use crate::common::descriptor::EndpointDescriptor;
use crate::common::{keys, TunnelError};
use crate::util::shutdown::Shutdown;
use crate::util::stats::ConnStats;
use crate::util::websocket::WebSocketByteStream;
use crate::{BUILD_VERSION, PROTOCOL_VERSION};

use super::env::{ChannelEnv, SocksEngine};
use super::proxy::StubProxy;
use super::rpc;
use super::{handle_inbound_substream, parse_substream_extra, SubstreamOpener};

type ProxyBody = BoxBody<Bytes, hyper::Error>;

fn full_body(data: impl Into<Bytes>) -> ProxyBody {
  Full::new(data.into())
    .map_err(|never| match never {})
    .boxed()
}

/// Server configuration, assembled by the CLI.
#[derive(Debug, Clone, Default)]
pub struct ServerConfig {
  /// Seed for the deterministic host key; empty generates a random key.
  pub key_seed: String,
  /// Path to the JSON auth file.
  pub authfile: Option<std::path::PathBuf>,
  /// Single `user:pass` credential granting access to all channels.
  pub auth: Option<String>,
  /// Reverse HTTP proxy target for non-tunnel requests.
  pub proxy: Option<String>,
  /// Enable the internal SOCKS5 engine.
  pub socks5: bool,
  /// Disable the loop transport.
  pub no_loop: bool,
  /// Allow reverse-mode channels.
  pub reverse: bool,
}

struct ServerState {
  ssh_config: Arc<russh::server::Config>,
  fingerprint: String,
  users: Arc<UserIndex>,
  reverse_ok: bool,
  proxy_target: Option<hyper::Uri>,
  loop_registry: Option<Arc<LoopRegistry>>,
  socks: Option<Arc<SocksEngine>>,
  stats: Arc<ConnStats>,
  shutdown: Shutdown<TunnelError>,
  _authfile_watcher: Mutex<Option<notify::RecommendedWatcher>>,
}

/// The proxy server supervisor: accepts connections, spawns one SSH
/// session per upgraded tunnel client, and shuts sessions down with
/// itself.
pub struct ProxyServer {
  state: Arc<ServerState>,
}

impl ProxyServer {
  pub fn new(config: ServerConfig) -> Result<Self, TunnelError> {
    let users = UserIndex::new();
    let mut watcher = None;
    if let Some(path) = &config.authfile {
      users
        .load_file(path)
        .map_err(|e| TunnelError::Io(format!("{:#}", e)))?;
      watcher = Some(users.watch().map_err(|e| TunnelError::Io(format!("{:#}", e)))?);
    }
    if let Some(auth) = &config.auth {
      let (name, pass) = parse_auth(auth);
      if !name.is_empty() {
        users.add_user(User::allow_all(name, pass));
      }
    }

    let key = keys::generate_key(&config.key_seed)?;
    let fingerprint = keys::keypair_fingerprint(&key)?;

    let ssh_config = Arc::new(russh::server::Config {
      server_id: SshId::Standard(format!("SSH-2.0-{}-server", PROTOCOL_VERSION)),
      auth_rejection_time: Duration::from_millis(250),
      keys: vec![key],
      ..Default::default()
    });

    let proxy_target = match &config.proxy {
      None => None,
      Some(url) => {
        let uri: hyper::Uri = url
          .parse()
          .map_err(|e| TunnelError::Handshake(format!("invalid proxy URL {}: {}", url, e)))?;
        if uri.host().is_none() {
          return Err(TunnelError::Handshake(format!(
            "Missing protocol or host in proxy URL ({})",
            url
          )));
        }
        Some(uri)
      }
    };

    if config.socks5 {
      tracing::info!("SOCKS5 server enabled");
    }
    if config.no_loop {
      tracing::info!("Loop server disabled");
    }
    if config.reverse {
      tracing::info!("Reverse tunnelling enabled");
    }

    let shutdown = Shutdown::new();
    let _ = shutdown.activate();

    Ok(Self {
      state: Arc::new(ServerState {
        ssh_config,
        fingerprint,
        users,
        reverse_ok: config.reverse,
        proxy_target,
        loop_registry: (!config.no_loop).then(LoopRegistry::new),
        socks: config.socks5.then(SocksEngine::new),
        stats: ConnStats::new(),
        shutdown,
        _authfile_watcher: Mutex::new(watcher),
      }),
    })
  }

  pub fn fingerprint(&self) -> &str {
    &self.state.fingerprint
  }

  pub fn stats(&self) -> &Arc<ConnStats> {
    &self.state.stats
  }

  /// Binds the listen socket; [BoundServer::serve] runs it. Split out so
  /// callers can learn the bound address before serving.
  pub async fn bind(&self, host: &str, port: u16) -> Result<BoundServer, TunnelError> {
    let listener = TcpListener::bind((host, port))
      .await
      .map_err(|e| TunnelError::Io(format!("listen on {}:{} failed: {}", host, port, e)))?;
    let local_addr = listener
      .local_addr()
      .map_err(|e| TunnelError::Io(e.to_string()))?;
    tracing::info!(addr = %local_addr, fingerprint = %self.state.fingerprint, "listening");
    if !self.state.users.is_empty() {
      tracing::info!("user authentication enabled");
    }
    if self.state.proxy_target.is_some() {
      tracing::info!("reverse proxy enabled");
    }
    Ok(BoundServer {
      state: Arc::clone(&self.state),
      listener,
      local_addr,
    })
  }

  /// Binds and serves until the context is cancelled.
  pub async fn run(&self, ctx: CancellationToken, host: &str, port: u16) -> Result<(), TunnelError> {
    self.bind(host, port).await?.serve(ctx).await
  }
}

pub struct BoundServer {
  state: Arc<ServerState>,
  listener: TcpListener,
  local_addr: SocketAddr,
}

impl BoundServer {
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Accept loop. On cancellation: stop accepting, signal every session,
  /// and wait for them to wind down.
  pub async fn serve(self, ctx: CancellationToken) -> Result<(), TunnelError> {
    let state = self.state;
    loop {
      tokio::select! {
        _ = ctx.cancelled() => break,
        accepted = self.listener.accept() => {
          match accepted {
            Ok((stream, peer)) => {
              let state = Arc::clone(&state);
              let ctx = ctx.clone();
              tokio::spawn(async move {
                serve_http_connection(state, stream, peer, ctx).await;
              });
            }
            Err(e) => {
              tracing::warn!(error = %e, "accept failed");
            }
          }
        }
      }
    }
    // Stop accepting before signalling sessions, so late dialers are
    // refused instead of parked in the backlog.
    drop(self.listener);
    tracing::info!("shutting down; signalling sessions");
    state.shutdown.start(None);
    state.shutdown.complete(None).await;
    Ok(())
  }
}

async fn serve_http_connection(
  state: Arc<ServerState>,
  stream: tokio::net::TcpStream,
  peer: SocketAddr,
  ctx: CancellationToken,
) {
  let io = TokioIo::new(stream);
  let service = hyper::service::service_fn(move |req: Request<Incoming>| {
    let state = Arc::clone(&state);
    let ctx = ctx.clone();
    async move { route_request(state, req, peer, ctx).await }
  });
  let conn = hyper::server::conn::http1::Builder::new()
    .serve_connection(io, service)
    .with_upgrades();
  if let Err(e) = conn.await {
    tracing::debug!(peer = %peer, error = %e, "http connection ended with error");
  }
}

fn is_tunnel_upgrade(req: &Request<Incoming>) -> bool {
  let header_has = |name: hyper::header::HeaderName, needle: &str| {
    req
      .headers()
      .get(name)
      .and_then(|v| v.to_str().ok())
      .map(|v| v.to_ascii_lowercase().contains(needle))
      .unwrap_or(false)
  };
  header_has(hyper::header::CONNECTION, "upgrade")
    && header_has(hyper::header::UPGRADE, "websocket")
}

async fn route_request(
  state: Arc<ServerState>,
  req: Request<Incoming>,
  peer: SocketAddr,
  ctx: CancellationToken,
) -> Result<Response<ProxyBody>, hyper::Error> {
  if is_tunnel_upgrade(&req) {
    let subprotocol = req
      .headers()
      .get(hyper::header::SEC_WEBSOCKET_PROTOCOL)
      .and_then(|v| v.to_str().ok())
      .map(str::trim)
      .unwrap_or("");
    if subprotocol != PROTOCOL_VERSION {
      // Any unknown subprotocol is not ours to serve.
      tracing::debug!(peer = %peer, subprotocol, "rejecting upgrade with unexpected subprotocol");
      return Ok(
        Response::builder()
          .status(StatusCode::NOT_FOUND)
          .body(full_body("Not Found\n"))
          .unwrap(),
      );
    }
    let key = match req
      .headers()
      .get(hyper::header::SEC_WEBSOCKET_KEY)
      .and_then(|v| v.to_str().ok())
    {
      Some(key) => key.to_string(),
      None => {
        return Ok(
          Response::builder()
            .status(StatusCode::BAD_REQUEST)
            .body(full_body("Missing Sec-WebSocket-Key\n"))
            .unwrap(),
        )
      }
    };

    let mut req = req;
    let upgrade = hyper::upgrade::on(&mut req);
    let accept = derive_accept_key(key.as_bytes());
    tokio::spawn(async move {
      match upgrade.await {
        Ok(upgraded) => {
          let ws = WebSocketStream::from_raw_socket(TokioIo::new(upgraded), Role::Server, None)
            .await;
          run_ssh_session(state, ws, peer, ctx).await;
        }
        Err(e) => {
          tracing::debug!(peer = %peer, error = %e, "upgrade failed");
        }
      }
    });

    return Ok(
      Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(hyper::header::CONNECTION, "Upgrade")
        .header(hyper::header::UPGRADE, "websocket")
        .header(hyper::header::SEC_WEBSOCKET_ACCEPT, accept)
        .header(hyper::header::SEC_WEBSOCKET_PROTOCOL, PROTOCOL_VERSION)
        .body(full_body(Bytes::new()))
        .unwrap(),
    );
  }

  match (req.method(), req.uri().path()) {
    (&hyper::Method::GET, "/health") => Ok(
      Response::builder()
        .status(StatusCode::OK)
        .body(full_body("OK\n"))
        .unwrap(),
    ),
    (&hyper::Method::GET, "/version") => Ok(
      Response::builder()
        .status(StatusCode::OK)
        .body(full_body(format!("{}\n", BUILD_VERSION)))
        .unwrap(),
    ),
    _ => match &state.proxy_target {
      Some(target) => forward_to_proxy(target, req).await,
      None => Ok(
        Response::builder()
          .status(StatusCode::NOT_FOUND)
          .body(full_body("Not Found\n"))
          .unwrap(),
      ),
    },
  }
}

/// Minimal single-host reverse proxy: the request is re-addressed to the
/// configured target, always using the target's scheme and host.
async fn forward_to_proxy(
  target: &hyper::Uri,
  req: Request<Incoming>,
) -> Result<Response<ProxyBody>, hyper::Error> {
  let client: hyper_util::client::legacy::Client<_, Incoming> =
    hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
      .build_http();

  let authority = target.authority().cloned();
  let scheme = target.scheme().cloned();
  let (mut parts, body) = req.into_parts();
  let path_and_query = parts
    .uri
    .path_and_query()
    .cloned()
    .unwrap_or_else(|| "/".parse().unwrap());
  let mut uri_parts = hyper::http::uri::Parts::default();
  uri_parts.scheme = scheme.or_else(|| Some(hyper::http::uri::Scheme::HTTP));
  uri_parts.authority = authority.clone();
  uri_parts.path_and_query = Some(path_and_query);
  match hyper::Uri::from_parts(uri_parts) {
    Ok(uri) => parts.uri = uri,
    Err(e) => {
      tracing::debug!(error = %e, "unable to re-address proxied request");
      return Ok(
        Response::builder()
          .status(StatusCode::BAD_GATEWAY)
          .body(full_body("Bad Gateway\n"))
          .unwrap(),
      );
    }
  }
  if let Some(authority) = authority {
    if let Ok(host) = hyper::header::HeaderValue::from_str(authority.as_str()) {
      parts.headers.insert(hyper::header::HOST, host);
    }
  }

  match client.request(Request::from_parts(parts, body)).await {
    Ok(response) => Ok(response.map(|b| b.boxed())),
    Err(e) => {
      tracing::debug!(error = %e, "reverse proxy request failed");
      Ok(
        Response::builder()
          .status(StatusCode::BAD_GATEWAY)
          .body(full_body("Bad Gateway\n"))
          .unwrap(),
      )
    }
  }
}

async fn run_ssh_session(
  state: Arc<ServerState>,
  ws: WebSocketStream<TokioIo<hyper::upgrade::Upgraded>>,
  peer: SocketAddr,
  ctx: CancellationToken,
) {
  let byte_stream = WebSocketByteStream::new(ws);
  let session_shutdown = Shutdown::<TunnelError>::new();
  let _ = session_shutdown.activate();
  // Sessions are children of the server and wind down with it.
  state.shutdown.add_child(session_shutdown.clone());

  let env = ChannelEnv::new(
    true,
    state.loop_registry.clone(),
    state.socks.clone(),
    Arc::clone(&state.stats),
  );
  let shared = Arc::new(SessionShared {
    state: Arc::clone(&state),
    env,
    accepted: AtomicBool::new(false),
    user: Mutex::new(None),
    shutdown: session_shutdown.clone(),
  });

  let handler = ServerSessionHandler {
    shared: Arc::clone(&shared),
    peer,
    config_channel_pending: true,
  };

  tracing::debug!(peer = %peer, "ssh handshaking");
  let running =
    match russh::server::run_stream(Arc::clone(&state.ssh_config), byte_stream, handler).await {
      Ok(running) => running,
      Err(e) => {
        tracing::info!(peer = %peer, error = %e, "ssh handshake failed");
        session_shutdown.start(Some(TunnelError::Handshake(e.to_string())));
        session_shutdown.complete(None).await;
        return;
      }
    };

  // The first request must be the config request, within a bounded window.
  {
    let shared = Arc::clone(&shared);
    tokio::spawn(async move {
      tokio::time::sleep(rpc::FIRST_REQUEST_TIMEOUT).await;
      if !shared.accepted.load(Ordering::SeqCst) {
        tracing::info!("no session config received in time; dropping session");
        shared.shutdown.start(Some(TunnelError::Handshake(
          "session config not received before deadline".to_string(),
        )));
      }
    });
  }

  let session_started = session_shutdown.started();
  tokio::select! {
    result = running => {
      match result {
        Ok(()) => tracing::debug!(peer = %peer, "ssh session ended"),
        Err(e) => tracing::debug!(peer = %peer, error = %e, "ssh session failed"),
      }
    }
    _ = session_started.cancelled() => {
      tracing::debug!(peer = %peer, "ssh session cancelled");
    }
    _ = ctx.cancelled() => {
      tracing::debug!(peer = %peer, "ssh session cancelled by server shutdown");
    }
  }
  session_shutdown.start(None);
  session_shutdown.complete(None).await;
}

struct SessionShared {
  state: Arc<ServerState>,
  env: Arc<ChannelEnv>,
  accepted: AtomicBool,
  user: Mutex<Option<Arc<User>>>,
  shutdown: Shutdown<TunnelError>,
}

impl SessionShared {
  /// Validates a session config request; an error is the textual reason
  /// reported to the peer.
  fn validate_config(&self, config: &SessionConfigRequest) -> Result<(), String> {
    if config.version != BUILD_VERSION {
      let v = if config.version.is_empty() {
        "<unknown>"
      } else {
        &config.version
      };
      tracing::info!(
        client = %v,
        server = BUILD_VERSION,
        "client version differs from server version"
      );
    }
    for chd in &config.channels {
      chd
        .validate()
        .map_err(|e| format!("Invalid channel descriptor: {}", e))?;
      if chd.reverse && !self.state.reverse_ok {
        return Err("Reverse port forwarding not enabled on server".to_string());
      }
    }
    if let Some(user) = self.user.lock().unwrap().as_ref() {
      for chd in &config.channels {
        let chd_string = chd.to_string();
        if !user.permits(&chd_string) {
          return Err(format!("Access to \"{}\" denied", chd_string));
        }
      }
    }
    Ok(())
  }

  async fn start_reverse_proxies(
    self: &Arc<Self>,
    config: &SessionConfigRequest,
    opener: Arc<dyn SubstreamOpener>,
  ) -> Result<(), String> {
    for (index, chd) in config.channels.iter().enumerate() {
      if !chd.reverse {
        tracing::debug!(index, channel = %chd, "forward-mode channel; connections are created on demand");
        continue;
      }
      tracing::debug!(index, channel = %chd, "reverse-mode channel; starting stub listener");
      match StubProxy::start(
        index,
        chd.clone(),
        Arc::clone(&self.env),
        Arc::clone(&opener),
      )
      .await
      {
        Ok(proxy) => self.shutdown.add_child(proxy.shutdown_handle()),
        Err(e) => {
          return Err(format!("Unable to start stub listener {}: {}", chd, e));
        }
      }
    }
    Ok(())
  }
}

struct ServerSubstreamOpener {
  handle: russh::server::Handle,
}

#[async_trait]
impl SubstreamOpener for ServerSubstreamOpener {
  async fn open(&self, skeleton: &EndpointDescriptor) -> Result<Bipipe, TunnelError> {
    let extra = serde_json::to_string(skeleton)
      .map_err(|e| TunnelError::Internal(format!("descriptor serialization failed: {}", e)))?;
    let channel = self
      .handle
      .channel_open_forwarded_tcpip(extra, 0, "127.0.0.1", 0)
      .await
      .map_err(|e| TunnelError::Transport(format!("sub-stream open failed: {:?}", e)))?;
    Ok(from_server_channel(channel, &skeleton.to_string()))
  }
}

struct ServerSessionHandler {
  shared: Arc<SessionShared>,
  peer: SocketAddr,
  config_channel_pending: bool,
}

#[async_trait]
impl Handler for ServerSessionHandler {
  type Error = russh::Error;

  async fn auth_none(&mut self, _user: &str) -> Result<Auth, Self::Error> {
    if self.shared.state.users.is_empty() {
      Ok(Auth::Accept)
    } else {
      Ok(Auth::Reject {
        proceed_with_methods: Some(MethodSet::PASSWORD),
      })
    }
  }

  async fn auth_password(&mut self, user: &str, password: &str) -> Result<Auth, Self::Error> {
    // An empty auth config accepts all users.
    if self.shared.state.users.is_empty() {
      return Ok(Auth::Accept);
    }
    match self.shared.state.users.get(user) {
      Some(known) if known.pass == password => {
        *self.shared.user.lock().unwrap() = Some(known);
        Ok(Auth::Accept)
      }
      _ => {
        tracing::debug!(peer = %self.peer, user, "login failed");
        Ok(Auth::Reject {
          proceed_with_methods: None,
        })
      }
    }
  }

  async fn channel_open_session(
    &mut self,
    channel: Channel<Msg>,
    session: &mut Session,
  ) -> Result<bool, Self::Error> {
    let shared = Arc::clone(&self.shared);
    let handle = session.handle();
    let expect_config = self.config_channel_pending;
    self.config_channel_pending = false;
    tokio::spawn(async move {
      serve_request_channel(shared, channel, handle, expect_config).await;
    });
    Ok(true)
  }

  async fn channel_open_direct_tcpip(
    &mut self,
    channel: Channel<Msg>,
    host_to_connect: &str,
    _port_to_connect: u32,
    _originator_address: &str,
    _originator_port: u32,
    _session: &mut Session,
  ) -> Result<bool, Self::Error> {
    if !self.shared.accepted.load(Ordering::SeqCst) {
      tracing::debug!(peer = %self.peer, "sub-stream before session config; rejecting");
      return Ok(false);
    }
    let skeleton = match parse_substream_extra(host_to_connect) {
      Ok(skeleton) => skeleton,
      Err(e) => {
        // Malformed descriptor: unknown channel type.
        tracing::debug!(peer = %self.peer, error = %e, "rejecting sub-stream with malformed descriptor");
        return Ok(false);
      }
    };
    if let Err(e) = skeleton.validate() {
      tracing::debug!(peer = %self.peer, error = %e, "rejecting sub-stream with invalid descriptor");
      return Ok(false);
    }
    // Policy and factory failures surface after accept as an immediate
    // close with the cause logged.
    let env = Arc::clone(&self.shared.env);
    let pipe = from_server_channel(channel, &skeleton.to_string());
    tokio::spawn(async move {
      let _ = handle_inbound_substream(&env, skeleton, pipe).await;
    });
    Ok(true)
  }
}

async fn serve_request_channel(
  shared: Arc<SessionShared>,
  mut channel: Channel<Msg>,
  handle: russh::server::Handle,
  expect_config: bool,
) {
  let deadline = expect_config.then_some(rpc::FIRST_REQUEST_TIMEOUT);
  let request = match rpc::read_request(&mut channel, deadline).await {
    Ok(request) => request,
    Err(e) => {
      tracing::debug!(error = %e, "request channel failed");
      // Unrecognized requests are answered false and otherwise ignored.
      let _ = rpc::respond(&mut channel, &PeerReply::reject(e.to_string())).await;
      if expect_config {
        shared.shutdown.start(Some(e));
      }
      return;
    }
  };

  let reply = match (&request, shared.accepted.load(Ordering::SeqCst)) {
    (PeerRequest::Config(config), false) => {
      match shared.validate_config(config) {
        Err(reason) => {
          tracing::info!(reason = %reason, "session config rejected");
          shared
            .shutdown
            .start(Some(TunnelError::ConfigRejected(reason.clone())));
          PeerReply::reject(reason)
        }
        Ok(()) => {
          let opener: Arc<dyn SubstreamOpener> =
            Arc::new(ServerSubstreamOpener { handle });
          match shared.start_reverse_proxies(config, opener).await {
            Err(reason) => {
              tracing::info!(reason = %reason, "reverse listener startup failed");
              shared
                .shutdown
                .start(Some(TunnelError::ConfigRejected(reason.clone())));
              PeerReply::reject(reason)
            }
            Ok(()) => {
              shared.accepted.store(true, Ordering::SeqCst);
              tracing::debug!("session config accepted; session up");
              PeerReply::accept()
            }
          }
        }
      }
    }
    (PeerRequest::Config(_), true) => PeerReply::reject("session already configured"),
    (PeerRequest::Ping, true) => PeerReply::accept(),
    (PeerRequest::Ping, false) => {
      let reason = "expecting config request, got ping";
      shared
        .shutdown
        .start(Some(TunnelError::Handshake(reason.to_string())));
      PeerReply::reject(reason)
    }
  };

  if let Err(e) = rpc::respond(&mut channel, &reply).await {
    tracing::debug!(error = %e, "request reply failed");
    if expect_config {
      shared.shutdown.start(Some(e));
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::common::descriptor::ChannelDescriptor;
  use crate::session::client::{ClientConfig, ProxyClient};
  use std::time::Duration;
  use tokio::io::{AsyncReadExt, AsyncWriteExt};
  use tokio::net::TcpStream;

  const SEED: &str = "end to end test seed";

  /// TCP echo service; copies each connection's input back to it and then
  /// half-closes.
  async fn spawn_echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
      loop {
        let (mut stream, _) = match listener.accept().await {
          Ok(accepted) => accepted,
          Err(_) => return,
        };
        tokio::spawn(async move {
          let (mut read, mut write) = stream.split();
          let _ = tokio::io::copy(&mut read, &mut write).await;
          let _ = write.shutdown().await;
        });
      }
    });
    addr
  }

  async fn start_server(config: ServerConfig) -> (SocketAddr, CancellationToken, String) {
    let server = ProxyServer::new(config).unwrap();
    let fingerprint = server.fingerprint().to_string();
    let bound = server.bind("127.0.0.1", 0).await.unwrap();
    let addr = bound.local_addr();
    let ctx = CancellationToken::new();
    {
      let ctx = ctx.clone();
      tokio::spawn(async move {
        let _ = bound.serve(ctx).await;
      });
    }
    (addr, ctx, fingerprint)
  }

  fn free_port() -> u16 {
    let probe = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = probe.local_addr().unwrap().port();
    drop(probe);
    port
  }

  async fn connect_with_retry(addr: &str) -> TcpStream {
    for _ in 0..100 {
      if let Ok(stream) = TcpStream::connect(addr).await {
        return stream;
      }
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("stub listener at {} never came up", addr);
  }

  fn client_for(server_addr: SocketAddr, channels: &[&str]) -> ClientConfig {
    ClientConfig {
      server: format!("http://{}", server_addr),
      channels: channels
        .iter()
        .map(|s| ChannelDescriptor::parse(s).unwrap())
        .collect(),
      max_retry_count: 0,
      ..ClientConfig::default()
    }
  }

  #[tokio::test]
  async fn tcp_forward_end_to_end() {
    let fut = async {
      let echo = spawn_echo_server().await;
      let (server_addr, server_ctx, _fp) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        ..ServerConfig::default()
      })
      .await;

      let stub_port = free_port();
      let spec = format!("127.0.0.1:{}:127.0.0.1:{}", stub_port, echo.port());
      let config = client_for(server_addr, &[&spec]);
      let client = ProxyClient::new(config).unwrap();
      let client_ctx = CancellationToken::new();
      let run = {
        let ctx = client_ctx.clone();
        tokio::spawn(async move { client.run(ctx).await })
      };

      let mut app = connect_with_retry(&format!("127.0.0.1:{}", stub_port)).await;
      app.write_all(b"echo through the tunnel").await.unwrap();
      app.shutdown().await.unwrap();
      let mut got = Vec::new();
      app.read_to_end(&mut got).await.unwrap();
      assert_eq!(got, b"echo through the tunnel");

      client_ctx.cancel();
      assert!(run.await.unwrap().is_ok());
      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("forward tunnel test may be deadlocked");
  }

  #[tokio::test]
  async fn reverse_tcp_end_to_end() {
    let fut = async {
      let echo = spawn_echo_server().await;
      let (server_addr, server_ctx, _fp) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        reverse: true,
        ..ServerConfig::default()
      })
      .await;

      let stub_port = free_port();
      let spec = format!("R:127.0.0.1:{}:127.0.0.1:{}", stub_port, echo.port());
      let config = client_for(server_addr, &[&spec]);
      let client = ProxyClient::new(config).unwrap();
      let client_ctx = CancellationToken::new();
      let run = {
        let ctx = client_ctx.clone();
        tokio::spawn(async move { client.run(ctx).await })
      };

      // The stub listener lives on the server side.
      let mut app = connect_with_retry(&format!("127.0.0.1:{}", stub_port)).await;
      app.write_all(b"backwards").await.unwrap();
      app.shutdown().await.unwrap();
      let mut got = Vec::new();
      app.read_to_end(&mut got).await.unwrap();
      assert_eq!(got, b"backwards");

      client_ctx.cancel();
      let _ = run.await.unwrap();
      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("reverse tunnel test may be deadlocked");
  }

  #[tokio::test]
  async fn loopback_chain_end_to_end() {
    let fut = async {
      let echo = spawn_echo_server().await;
      let (server_addr, server_ctx, _fp) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        reverse: true,
        ..ServerConfig::default()
      })
      .await;

      // Channel 1 forwards a local port into a server-side loop skeleton;
      // channel 2 reverses the loop stub back out to the local echo
      // service. One byte traverses the tunnel twice and the in-process
      // loop once, with no socket pair in between.
      let stub_port = free_port();
      let spec1 = format!("127.0.0.1:{}:loop://name1", stub_port);
      let spec2 = format!("R:loop://name1:127.0.0.1:{}", echo.port());
      let config = client_for(server_addr, &[&spec1, &spec2]);
      let client = ProxyClient::new(config).unwrap();
      let client_ctx = CancellationToken::new();
      let run = {
        let ctx = client_ctx.clone();
        tokio::spawn(async move { client.run(ctx).await })
      };

      let mut app = connect_with_retry(&format!("127.0.0.1:{}", stub_port)).await;
      app.write_all(b"x").await.unwrap();
      app.shutdown().await.unwrap();
      let mut got = Vec::new();
      app.read_to_end(&mut got).await.unwrap();
      assert_eq!(got, b"x");

      client_ctx.cancel();
      let _ = run.await.unwrap();
      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("loopback chain test may be deadlocked");
  }

  #[tokio::test]
  async fn fingerprint_mismatch_is_terminal() {
    let fut = async {
      let (server_addr, server_ctx, fingerprint) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        ..ServerConfig::default()
      })
      .await;
      assert!(!fingerprint.is_empty());

      let mut config = client_for(server_addr, &["3000:localhost:80"]);
      config.fingerprint = Some("zz:zz".to_string());
      config.max_retry_count = 5;
      let client = ProxyClient::new(config).unwrap();
      let result = client.run(CancellationToken::new()).await;
      match result {
        Err(TunnelError::FingerprintMismatch(got)) => {
          assert_eq!(got, fingerprint);
        }
        other => panic!("expected fingerprint mismatch, got {:?}", other),
      }
      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("fingerprint test may be deadlocked");
  }

  #[tokio::test]
  async fn matching_fingerprint_prefix_is_accepted() {
    let fut = async {
      let echo = spawn_echo_server().await;
      let (server_addr, server_ctx, fingerprint) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        ..ServerConfig::default()
      })
      .await;

      let stub_port = free_port();
      let spec = format!("127.0.0.1:{}:127.0.0.1:{}", stub_port, echo.port());
      let mut config = client_for(server_addr, &[&spec]);
      config.fingerprint = Some(fingerprint[..8].to_string());
      let client = ProxyClient::new(config).unwrap();
      let client_ctx = CancellationToken::new();
      let run = {
        let ctx = client_ctx.clone();
        tokio::spawn(async move { client.run(ctx).await })
      };

      let mut app = connect_with_retry(&format!("127.0.0.1:{}", stub_port)).await;
      app.write_all(b"ok").await.unwrap();
      app.shutdown().await.unwrap();
      let mut got = Vec::new();
      app.read_to_end(&mut got).await.unwrap();
      assert_eq!(got, b"ok");

      client_ctx.cancel();
      let _ = run.await.unwrap();
      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("fingerprint prefix test may be deadlocked");
  }

  #[tokio::test]
  async fn reverse_channel_rejected_without_reverse_mode() {
    let fut = async {
      let (server_addr, server_ctx, _fp) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        reverse: false,
        ..ServerConfig::default()
      })
      .await;

      let config = client_for(server_addr, &["R:12345:localhost:22"]);
      let client = ProxyClient::new(config).unwrap();
      let result = client.run(CancellationToken::new()).await;
      match result {
        Err(TunnelError::ConfigRejected(reason)) => {
          assert!(reason.contains("Reverse port forwarding not enabled"), "{}", reason);
        }
        other => panic!("expected config rejection, got {:?}", other),
      }
      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("reverse rejection test may be deadlocked");
  }

  #[tokio::test]
  async fn password_auth_and_channel_patterns_are_enforced() {
    let fut = async {
      let (server_addr, server_ctx, _fp) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        auth: Some("alice:secret".to_string()),
        ..ServerConfig::default()
      })
      .await;

      // Wrong password is terminal.
      let mut config = client_for(server_addr, &["3000:localhost:80"]);
      config.auth = Some("alice:wrong".to_string());
      config.max_retry_count = 3;
      let client = ProxyClient::new(config).unwrap();
      let result = client.run(CancellationToken::new()).await;
      assert!(matches!(result, Err(TunnelError::AuthenticationFailed)));

      // Correct credentials pass config validation (allow-all patterns).
      let echo = spawn_echo_server().await;
      let stub_port = free_port();
      let spec = format!("127.0.0.1:{}:127.0.0.1:{}", stub_port, echo.port());
      let mut config = client_for(server_addr, &[&spec]);
      config.auth = Some("alice:secret".to_string());
      let client = ProxyClient::new(config).unwrap();
      let client_ctx = CancellationToken::new();
      let run = {
        let ctx = client_ctx.clone();
        tokio::spawn(async move { client.run(ctx).await })
      };
      let mut app = connect_with_retry(&format!("127.0.0.1:{}", stub_port)).await;
      app.write_all(b"authed").await.unwrap();
      app.shutdown().await.unwrap();
      let mut got = Vec::new();
      app.read_to_end(&mut got).await.unwrap();
      assert_eq!(got, b"authed");
      client_ctx.cancel();
      let _ = run.await.unwrap();
      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("auth test may be deadlocked");
  }

  #[tokio::test]
  async fn health_and_version_endpoints() {
    let fut = async {
      let (server_addr, server_ctx, _fp) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        ..ServerConfig::default()
      })
      .await;

      let mut stream = TcpStream::connect(server_addr).await.unwrap();
      stream
        .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
      let mut response = String::new();
      stream.read_to_string(&mut response).await.unwrap();
      assert!(response.starts_with("HTTP/1.1 200"), "{}", response);
      assert!(response.ends_with("OK\n"), "{}", response);

      let mut stream = TcpStream::connect(server_addr).await.unwrap();
      stream
        .write_all(b"GET /version HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
      let mut response = String::new();
      stream.read_to_string(&mut response).await.unwrap();
      assert!(response.contains(BUILD_VERSION), "{}", response);

      let mut stream = TcpStream::connect(server_addr).await.unwrap();
      stream
        .write_all(b"GET /other HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
        .await
        .unwrap();
      let mut response = String::new();
      stream.read_to_string(&mut response).await.unwrap();
      assert!(response.starts_with("HTTP/1.1 404"), "{}", response);

      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("health endpoint test may be deadlocked");
  }

  #[tokio::test]
  async fn keepalive_pings_keep_the_session_healthy() {
    let fut = async {
      let echo = spawn_echo_server().await;
      let (server_addr, server_ctx, _fp) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        ..ServerConfig::default()
      })
      .await;

      let stub_port = free_port();
      let spec = format!("127.0.0.1:{}:127.0.0.1:{}", stub_port, echo.port());
      let mut config = client_for(server_addr, &[&spec]);
      config.keepalive = Some(Duration::from_millis(100));
      let client = ProxyClient::new(config).unwrap();
      let client_ctx = CancellationToken::new();
      let run = {
        let ctx = client_ctx.clone();
        tokio::spawn(async move { client.run(ctx).await })
      };

      let mut app = connect_with_retry(&format!("127.0.0.1:{}", stub_port)).await;
      app.write_all(b"first").await.unwrap();
      let mut buf = [0u8; 5];
      app.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"first");

      // Several keepalive intervals pass; the session must remain usable.
      tokio::time::sleep(Duration::from_millis(500)).await;
      app.write_all(b"again").await.unwrap();
      app.read_exact(&mut buf).await.unwrap();
      assert_eq!(&buf, b"again");

      client_ctx.cancel();
      let _ = run.await.unwrap();
      server_ctx.cancel();
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("keepalive test may be deadlocked");
  }

  #[tokio::test]
  async fn reconnect_exhausts_retry_budget_after_server_loss() {
    let fut = async {
      let (server_addr, server_ctx, _fp) = start_server(ServerConfig {
        key_seed: SEED.to_string(),
        ..ServerConfig::default()
      })
      .await;

      let stub_port = free_port();
      let spec = format!("127.0.0.1:{}:127.0.0.1:1", stub_port);
      let mut config = client_for(server_addr, &[&spec]);
      config.max_retry_count = 2;
      let client = ProxyClient::new(config).unwrap();
      let client_ctx = CancellationToken::new();
      let run = {
        let ctx = client_ctx.clone();
        tokio::spawn(async move { client.run(ctx).await })
      };

      // Wait until the session is up, then take the server away.
      let _probe = connect_with_retry(&format!("127.0.0.1:{}", stub_port)).await;
      server_ctx.cancel();

      // The client retries with backoff and eventually gives up.
      let result = tokio::time::timeout(Duration::from_secs(20), run)
        .await
        .expect("client must give up after the retry budget")
        .unwrap();
      assert!(result.is_err(), "exhausted retries must surface an error");
    };
    tokio::time::timeout(Duration::from_secs(30), fut)
      .await
      .expect("reconnect test may be deadlocked");
  }

  #[tokio::test]
  async fn deterministic_seed_yields_stable_fingerprint() {
    let a = ProxyServer::new(ServerConfig {
      key_seed: "stable".to_string(),
      ..ServerConfig::default()
    })
    .unwrap();
    let b = ProxyServer::new(ServerConfig {
      key_seed: "stable".to_string(),
      ..ServerConfig::default()
    })
    .unwrap();
    assert_eq!(a.fingerprint(), b.fingerprint());
  }
}

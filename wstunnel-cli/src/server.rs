// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use clap::ArgMatches;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use wstunnel::session::server::{ProxyServer, ServerConfig};

pub struct ServerArgs {
  pub host: String,
  pub port: u16,
  pub config: ServerConfig,
}

pub fn server_arg_handling(args: &'_ ArgMatches) -> Result<ServerArgs> {
  let host = args
    .value_of("host")
    .map(str::to_string)
    .or_else(|| std::env::var("HOST").ok())
    .unwrap_or_else(|| "0.0.0.0".to_string());
  let port = match args
    .value_of("port")
    .map(str::to_string)
    .or_else(|| std::env::var("PORT").ok())
  {
    Some(port) => port.parse().context("Invalid listening port")?,
    None => 8080,
  };
  let key_seed = args
    .value_of("key")
    .map(str::to_string)
    .or_else(|| std::env::var("WSTUNNEL_KEY").ok())
    .unwrap_or_default();

  Ok(ServerArgs {
    host,
    port,
    config: ServerConfig {
      key_seed,
      authfile: args.value_of("authfile").map(Into::into),
      auth: args.value_of("auth").map(str::to_string),
      proxy: args.value_of("proxy").map(str::to_string),
      socks5: args.is_present("socks5"),
      no_loop: args.is_present("noloop"),
      reverse: args.is_present("reverse"),
    },
  })
}

pub async fn server_main(args: ServerArgs) -> Result<()> {
  let server = ProxyServer::new(args.config)?;
  let ctx = CancellationToken::new();

  {
    let ctx = ctx.clone();
    tokio::spawn(async move {
      let _ = tokio::signal::ctrl_c().await;
      tracing::info!("SIGINT received; shutting down");
      ctx.cancel();
    });
  }
  {
    let stats = server.stats().clone();
    tokio::spawn(async move {
      let mut usr2 = match signal(SignalKind::user_defined2()) {
        Ok(usr2) => usr2,
        Err(e) => {
          tracing::warn!(error = %e, "unable to install SIGUSR2 handler");
          return;
        }
      };
      while usr2.recv().await.is_some() {
        tracing::info!(stats = %stats, "connection stats");
      }
    });
  }

  server.run(ctx, &args.host, args.port).await?;
  Ok(())
}

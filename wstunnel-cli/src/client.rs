// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Context as AnyhowContext, Result};
use clap::ArgMatches;
use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use wstunnel::common::descriptor::ChannelDescriptor;
use wstunnel::session::client::{ClientConfig, ProxyClient};
use wstunnel::util::validators::parse_duration;

pub fn client_arg_handling(args: &'_ ArgMatches) -> Result<ClientConfig> {
  let mut config = ClientConfig {
    server: args
      .value_of("server")
      .expect("Server argument is required")
      .to_string(),
    ..ClientConfig::default()
  };
  for chd_string in args.values_of("channel").expect("Channels are required") {
    let chd = ChannelDescriptor::parse(chd_string)
      .with_context(|| format!("Failed to parse channel descriptor string '{}'", chd_string))?;
    config.channels.push(chd);
  }
  config.fingerprint = args.value_of("fingerprint").map(str::to_string);
  config.auth = args
    .value_of("auth")
    .map(str::to_string)
    .or_else(|| std::env::var("AUTH").ok());
  if let Some(keepalive) = args.value_of("keepalive") {
    config.keepalive = Some(parse_duration(keepalive)?);
  }
  if let Some(count) = args.value_of("max-retry-count") {
    config.max_retry_count = count
      .parse()
      .context("max-retry-count must be an integer")?;
  }
  if let Some(interval) = args.value_of("max-retry-interval") {
    config.max_retry_interval = parse_duration(interval)?;
  }
  config.http_proxy = args.value_of("proxy").map(str::to_string);
  config.host_header = args.value_of("hostname").map(str::to_string);
  Ok(config)
}

pub async fn client_main(config: ClientConfig) -> Result<()> {
  let client = ProxyClient::new(config)?;
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
    // SIGHUP short-circuits the reconnect backoff.
    let reconnect = client.reconnect_now_handle();
    tokio::spawn(async move {
      let mut hup = match signal(SignalKind::hangup()) {
        Ok(hup) => hup,
        Err(e) => {
          tracing::warn!(error = %e, "unable to install SIGHUP handler");
          return;
        }
      };
      while hup.recv().await.is_some() {
        reconnect.notify_waiters();
      }
    });
  }
  {
    // SIGUSR2 dumps connection counters.
    let stats = client.stats().clone();
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

  client.run(ctx).await?;
  Ok(())
}

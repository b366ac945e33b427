// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
#![warn(unused_imports)]

use anyhow::Result;
use clap::{Arg, ArgMatches, Command};
use wstunnel::util::validators::{
  validate_duration, validate_existing_file, validate_ipaddr, validate_port,
};

mod client;
mod server;

fn main() {
  let app = Command::new(env!("CARGO_BIN_NAME"))
    .version(env!("CARGO_PKG_VERSION"))
    .about(env!("CARGO_PKG_DESCRIPTION"))
    .subcommand(
      Command::new("server")
        .about("Run the proxy server, accepting tunnel sessions from clients")
        .arg(
          Arg::new("host")
            .long("host")
            .help("HTTP listening interface (env HOST)")
            .validator(validate_ipaddr)
            .takes_value(true),
        )
        .arg(
          Arg::new("port")
            .long("port")
            .short('p')
            .help("HTTP listening port (env PORT)")
            .validator(validate_port)
            .takes_value(true),
        )
        .arg(
          Arg::new("key")
            .long("key")
            .help("Seed for the ECDSA host key; share the fingerprint with clients (env WSTUNNEL_KEY)")
            .takes_value(true),
        )
        .arg(
          Arg::new("authfile")
            .long("authfile")
            .help("Path to a users.json file mapping user:pass to channel patterns")
            .validator(validate_existing_file)
            .takes_value(true),
        )
        .arg(
          Arg::new("auth")
            .long("auth")
            .help("A user:pass credential granting access to all channels")
            .takes_value(true),
        )
        .arg(
          Arg::new("proxy")
            .long("proxy")
            .help("Forward non-tunnel HTTP requests to this URL")
            .takes_value(true),
        )
        .arg(
          Arg::new("socks5")
            .long("socks5")
            .help("Allow clients to use the internal SOCKS5 engine"),
        )
        .arg(
          Arg::new("noloop")
            .long("noloop")
            .help("Disable loop endpoints"),
        )
        .arg(
          Arg::new("reverse")
            .long("reverse")
            .help("Allow clients to request reverse-mode channels"),
        )
        .arg(Arg::new("pid").long("pid").help("Write wstunnel.pid in the working directory"))
        .arg(Arg::new("verbose").short('v').help("Enable verbose logging")),
    )
    .subcommand(
      Command::new("client")
        .about("Connect to a proxy server and establish the configured channels")
        .arg(Arg::new("server").takes_value(true).required(true).help("Server URL"))
        .arg(
          Arg::new("channel")
            .takes_value(true)
            .required(true)
            .multiple_values(true)
            .help("Channel descriptors, e.g. 3000:example.com:80 or R:2222:localhost:22"),
        )
        .arg(
          Arg::new("fingerprint")
            .long("fingerprint")
            .help("Expected server key fingerprint prefix; strongly recommended")
            .takes_value(true),
        )
        .arg(
          Arg::new("auth")
            .long("auth")
            .help("user:pass credentials (env AUTH)")
            .takes_value(true),
        )
        .arg(
          Arg::new("keepalive")
            .long("keepalive")
            .help("Interval between keepalive pings, e.g. 25s")
            .validator(validate_duration)
            .takes_value(true),
        )
        .arg(
          Arg::new("max-retry-count")
            .long("max-retry-count")
            .help("Maximum retries before exiting; -1 retries forever")
            .allow_hyphen_values(true)
            .takes_value(true),
        )
        .arg(
          Arg::new("max-retry-interval")
            .long("max-retry-interval")
            .help("Maximum wait between retries (default 5m)")
            .validator(validate_duration)
            .takes_value(true),
        )
        .arg(
          Arg::new("proxy")
            .long("proxy")
            .help("HTTP CONNECT proxy URL to reach the server through")
            .takes_value(true),
        )
        .arg(
          Arg::new("hostname")
            .long("hostname")
            .help("Override the Host header sent to the server")
            .takes_value(true),
        )
        .arg(Arg::new("pid").long("pid").help("Write wstunnel.pid in the working directory"))
        .arg(Arg::new("verbose").short('v').help("Enable verbose logging")),
    )
    .subcommand_required(true)
    .arg_required_else_help(true);

  let matches = app.get_matches();
  let verbose = matches
    .subcommand()
    .map(|(_, opts)| opts.is_present("verbose"))
    .unwrap_or(false);
  let default_level = if verbose { "debug" } else { "info" };
  let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
    .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level));
  let collector = tracing_subscriber::fmt()
    .with_env_filter(env_filter)
    .with_writer(std::io::stderr)
    .finish();
  tracing::subscriber::set_global_default(collector).expect("Logger init must succeed");

  let mode = matches.subcommand_name().unwrap_or("<No subcommand?>");
  let handler = main_args_handler(&matches);
  let rt = tokio::runtime::Builder::new_multi_thread()
    .thread_name("tokio-reactor-worker")
    .enable_all()
    .build()
    .expect("Tokio Runtime setup failure");
  match rt.block_on(handler) {
    Err(err) => {
      tracing::error!(mode = mode, err = ?err, "dispatch_command_failure");
      std::process::exit(1);
    }
    Ok(_) => tracing::info!("{} exited successfully", mode),
  }
}

fn write_pid_file() {
  let pid = std::process::id().to_string();
  if let Err(e) = std::fs::write("wstunnel.pid", pid) {
    tracing::warn!(error = %e, "unable to write pid file");
  }
}

async fn main_args_handler(matches: &'_ ArgMatches) -> Result<()> {
  match matches
    .subcommand()
    .expect("Subcommand is marked as required")
  {
    ("server", opts) => {
      let config = server::server_arg_handling(opts)?;
      if opts.is_present("pid") {
        write_pid_file();
      }
      server::server_main(config).await
    }
    ("client", opts) => {
      let config = client::client_arg_handling(opts)?;
      if opts.is_present("pid") {
        write_pid_file();
      }
      client::client_main(config).await
    }
    (_, _) => unreachable!(),
  }
}

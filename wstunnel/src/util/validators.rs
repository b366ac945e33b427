// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use anyhow::{Error as AnyErr, Result};
use std::path::Path;
use std::time::Duration;

pub fn validate_existing_file(v: &str) -> Result<(), String> {
  if !Path::new(&v).exists() {
    Err(String::from("A file must exist at the given path"))
  } else {
    Ok(())
  }
}

pub fn parse_ipaddr(v: &str) -> Result<std::net::IpAddr> {
  use std::net::{Ipv4Addr, Ipv6Addr};
  match v.parse::<Ipv4Addr>() {
    Ok(addr) => Ok(addr.into()),
    Err(_) => match v.parse::<Ipv6Addr>() {
      Ok(addr) => Ok(addr.into()),
      Err(_) => Err(AnyErr::msg(
        "Could not parse input as ipv4 or ipv6 address",
      )),
    },
  }
}

pub fn parse_port(v: &str) -> Result<u16> {
  v.parse::<u16>()
    .map_err(|_| AnyErr::msg("Port was not a valid u16"))
}

/// Parses a human duration: a bare integer is seconds, otherwise an integer
/// with one of the suffixes `ms`, `s`, `m`, `h`.
pub fn parse_duration(v: &str) -> Result<Duration> {
  let (digits, unit) = match v.find(|c: char| !c.is_ascii_digit()) {
    Some(idx) => v.split_at(idx),
    None => (v, "s"),
  };
  let n: u64 = digits
    .parse()
    .map_err(|_| AnyErr::msg("Duration must begin with an integer"))?;
  match unit {
    "ms" => Ok(Duration::from_millis(n)),
    "s" => Ok(Duration::from_secs(n)),
    "m" => Ok(Duration::from_secs(n * 60)),
    "h" => Ok(Duration::from_secs(n * 3600)),
    _ => Err(AnyErr::msg("Unknown duration suffix")),
  }
}

pub fn validate_ipaddr(v: &str) -> Result<(), String> {
  parse_ipaddr(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_port(v: &str) -> Result<(), String> {
  parse_port(v).map(|_| ()).map_err(|e| e.to_string())
}

pub fn validate_duration(v: &str) -> Result<(), String> {
  parse_duration(v).map(|_| ()).map_err(|e| e.to_string())
}

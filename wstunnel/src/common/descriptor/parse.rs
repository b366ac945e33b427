// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Legacy compact channel descriptor grammar.
//!
//! A channel argument is an optional `R:` prefix followed by `:`-delimited
//! tokens. Balanced `[]`/`<>` groups shield `:` from delimiting (IPv6 hosts),
//! `\` escapes the next character, and an element fully wrapped in balanced
//! angle brackets is unwrapped. The defaulting rules below are bit-exact with
//! the shipped behavior because descriptor strings are user-visible and also
//! feed authorization matching.

use super::{ChannelDescriptor, EndpointDescriptor, EndpointProtocol, EndpointRole};
use crate::common::TunnelError;

/// A TCP port constrained to the usable range. 0 and 65535 are reserved
/// sentinels in the grammar and never parse.
pub type PortNumber = u16;

fn err(msg: impl Into<String>) -> TunnelError {
  TunnelError::InvalidDescriptor(msg.into())
}

struct BracketStack {
  stack: Vec<char>,
}

impl BracketStack {
  fn new() -> Self {
    Self { stack: Vec::new() }
  }

  fn push(&mut self, c: char) {
    self.stack.push(c);
  }

  fn pop(&mut self) -> Option<char> {
    self.stack.pop()
  }

  fn is_balanced(&self) -> bool {
    self.stack.is_empty()
  }
}

fn close_for(open: char) -> char {
  match open {
    '<' => '>',
    '[' => ']',
    '{' => '}',
    '(' => ')',
    other => other,
  }
}

/// Splits a descriptor string on `delimiter`, honoring grouping and escapes:
///
/// - balanced `[]`, `<>`, `{}`, `()` groups and `'`/`"` quoted runs shield
///   the delimiter;
/// - `\` escapes the next character, which then takes no part in delimiting
///   or balancing;
/// - a `:` immediately followed by `//` (as in `loop://name`) is never
///   treated as a delimiter.
fn split_grouped(s: &str, delimiter: char) -> Result<Vec<String>, TunnelError> {
  let chars: Vec<char> = s.chars().collect();
  let mut stack = BracketStack::new();
  let mut result: Vec<String> = Vec::new();
  let mut partial = String::new();
  let mut have_backslash = false;
  let mut quote: Option<char> = None;

  let mut i = 0;
  while i < chars.len() {
    let c = chars[i];
    if have_backslash {
      partial.push(c);
      have_backslash = false;
    } else if c == '\\' {
      have_backslash = true;
    } else if let Some(q) = quote {
      partial.push(c);
      if c == q {
        quote = None;
      }
    } else if c == '\'' || c == '"' {
      partial.push(c);
      quote = Some(c);
    } else if c == '[' || c == '<' || c == '{' || c == '(' {
      partial.push(c);
      stack.push(c);
    } else if c == '>' || c == ']' || c == '}' || c == ')' {
      if stack.is_balanced() {
        return Err(err(format!("unmatched '{}' in descriptor '{}'", c, s)));
      }
      let actual_open = stack.pop().unwrap();
      if close_for(actual_open) != c {
        return Err(err(format!(
          "mismatched bracket types, opened with '{}', closed with '{}' in descriptor '{}'",
          actual_open, c, s
        )));
      }
      partial.push(c);
    } else if c == ':'
      && stack.is_balanced()
      && quote.is_none()
      && chars.get(i + 1) == Some(&'/')
      && chars.get(i + 2) == Some(&'/')
    {
      // A protocol separator, as in `loop://name`; never a delimiter.
      partial.push(c);
    } else if c == delimiter && stack.is_balanced() {
      result.push(std::mem::take(&mut partial));
    } else {
      partial.push(c);
    }
    i += 1;
  }

  if !stack.is_balanced() {
    return Err(err(format!(
      "unmatched '{}' in descriptor '{}'",
      stack.pop().unwrap(),
      s
    )));
  }
  if have_backslash {
    return Err(err(format!("descriptor ends in backslash: '{}'", s)));
  }
  if quote.is_some() {
    return Err(err(format!("unterminated quote in descriptor '{}'", s)));
  }
  if !(partial.is_empty() && result.is_empty()) {
    result.push(partial);
  }

  Ok(result)
}

/// Breaks a `:`-delimited descriptor string into parts; see [split_grouped].
pub fn split_bracketed_parts(s: &str) -> Result<Vec<String>, TunnelError> {
  split_grouped(s, ':')
}

fn is_angle_bracketed(s: &str) -> bool {
  if s.len() < 2 || !s.starts_with('<') || !s.ends_with('>') {
    return false;
  }
  let mut stack = BracketStack::new();
  let mut have_backslash = false;
  let mut close_pos: Option<usize> = None;
  for (i, c) in s.char_indices() {
    if have_backslash {
      have_backslash = false;
    } else if c == '\\' {
      have_backslash = true;
    } else if c == '<' {
      stack.push('<');
    } else if c == '>' || c == ']' {
      stack.pop();
      if stack.is_balanced() {
        close_pos = Some(i);
        break;
      }
    }
  }
  close_pos == Some(s.len() - 1)
}

/// Removes one balanced pair of leading/trailing angle brackets, if present.
pub fn strip_angle_brackets(s: &str) -> &str {
  if is_angle_bracketed(s) {
    &s[1..s.len() - 1]
  } else {
    s
  }
}

/// Parses a string as a usable port number (1..=65534).
pub fn parse_port_number(s: &str) -> Result<PortNumber, TunnelError> {
  let p: u64 = s
    .parse()
    .map_err(|e| err(format!("Invalid port number {}: {}", s, e)))?;
  if p == 65535 {
    return Err(err("65535 is a reserved invalid port number"));
  }
  if p == 0 {
    return Err(err("0 is a reserved unknown port number"));
  }
  if p > 65535 {
    return Err(err(format!("Port number out of range: {}", p)));
  }
  Ok(p as PortNumber)
}

fn is_port_number_string(s: &str) -> bool {
  parse_port_number(s).is_ok()
}

/// Breaks `<hostname>:<port>`, `<hostname>`, or `<port>` into a tuple.
/// Bracket groupings allow IPv6 forms like `[2001:db8::1]:80`; the whole
/// path, or the host alone, may be angle-bracketed.
pub fn parse_host_port(
  path: &str,
  default_host: &str,
  default_port: Option<PortNumber>,
) -> Result<(String, Option<PortNumber>), TunnelError> {
  let bpath = strip_angle_brackets(path);
  let parts = split_bracketed_parts(bpath)
    .map_err(|e| err(format!("Invalid TCP host/port string: {}: {}", e, path)))?;

  let mut host = String::new();
  let mut port: Option<PortNumber> = None;

  if parts.len() > 2 {
    return Err(err(format!(
      "Too many ':'-delimited parts in TCP host/port string: {}",
      path
    )));
  } else if parts.len() == 1 {
    match parse_port_number(&parts[0]) {
      Ok(p) => port = Some(p),
      Err(_) => host = strip_angle_brackets(&parts[0]).to_string(),
    }
  } else if parts.len() == 2 {
    host = strip_angle_brackets(&parts[0]).to_string();
    port = Some(
      parse_port_number(&parts[1])
        .map_err(|e| err(format!("Invalid port in TCP host/port string: {}: {}", e, path)))?,
    );
  }

  if host.is_empty() {
    host = default_host.to_string();
  }
  if port.is_none() {
    port = default_port;
  }

  Ok((host, port))
}

/// An endpoint mid-parse: protocol may still be undetermined, defaulting has
/// not yet been applied.
#[derive(Debug, Clone, Default)]
struct PartialEndpoint {
  protocol: Option<EndpointProtocol>,
  path: String,
}

/// Parses the next endpoint descriptor out of presplit parts, returning it
/// with the count of parts consumed.
fn parse_next_endpoint(
  parts: &[String],
  role: EndpointRole,
) -> Result<(PartialEndpoint, usize), TunnelError> {
  let joined = parts.join(":");
  if parts.is_empty() {
    return Err(err(format!(
      "Empty endpoint descriptor string not allowed: '{}'",
      joined
    )));
  }

  let mut d = PartialEndpoint::default();
  let mut have_type = false;
  let mut have_path = false;
  let mut last_i = parts.len() - 1;

  for (i, p) in parts.iter().enumerate() {
    let sp = strip_angle_brackets(p);
    if sp.contains("://") {
      // Extensible-form spec, e.g. `loop://name1` or `unix://{"path":"..."}`.
      if have_type || have_path {
        break;
      }
      d = parse_uri_endpoint(sp)?;
      last_i = i;
      break;
    }
    match sp {
      "stdio" => {
        if have_type {
          break;
        }
        d.protocol = Some(EndpointProtocol::Stdio);
        last_i = i;
        break;
      }
      "socks" => {
        if have_type {
          break;
        }
        d.protocol = Some(EndpointProtocol::Socks);
        last_i = i;
        break;
      }
      "tcp" => {
        if have_type {
          break;
        }
        d.protocol = Some(EndpointProtocol::Tcp);
        have_type = true;
      }
      "unix" => {
        if have_type {
          break;
        }
        d.protocol = Some(EndpointProtocol::Unix);
        have_type = true;
      }
      "loop" => {
        if have_type {
          break;
        }
        d.protocol = Some(EndpointProtocol::Loop);
        have_type = true;
      }
      _ if is_port_number_string(sp) => {
        if have_type && d.protocol != Some(EndpointProtocol::Tcp) {
          break;
        }
        d.protocol = Some(EndpointProtocol::Tcp);
        let port = parse_port_number(sp).unwrap();
        d.path = format!("{}:{}", d.path, port);
        last_i = i;
        break;
      }
      _ => {
        // Not an endpoint type name or a port number. Either an
        // angle-bracketed standalone descriptor, a path for an already
        // parsed type, or a path with an implicit type (tcp or unix).
        if have_path {
          last_i = i;
          break;
        }
        if !have_type {
          let sp_parts = split_bracketedparts_for(sp, &joined)?;
          if sp_parts.len() > 1 {
            // An angle-bracketed standalone endpoint descriptor; recurse.
            let nested = parse_endpoint_descriptor(sp, role)?;
            d = nested;
            last_i = i;
            break;
          }
          let spp0 = sp_parts
            .first()
            .map(|s| strip_angle_brackets(s).to_string())
            .unwrap_or_default();
          if spp0 == "stdio" {
            d.protocol = Some(EndpointProtocol::Stdio);
            last_i = i;
            break;
          }
          if spp0 == "socks" {
            d.protocol = Some(EndpointProtocol::Socks);
            last_i = i;
            break;
          }
          if spp0.starts_with('/') || spp0.starts_with('.') {
            d.protocol = Some(EndpointProtocol::Unix);
            d.path = spp0;
            last_i = i;
            break;
          }
          d.protocol = Some(EndpointProtocol::Tcp);
          d.path = spp0;
          have_type = true;
          have_path = true;
        } else {
          // A path to go with an explicitly provided endpoint type.
          if d.protocol != Some(EndpointProtocol::Tcp) {
            d.path = strip_angle_brackets(sp).to_string();
            last_i = i;
            break;
          }
          // A TCP path may already contain a port, or consist of one.
          let (host, port) = parse_host_port(sp, "", None).map_err(|e| {
            err(format!(
              "Invalid TCP host/port in endpoint descriptor string '{}': '{}'",
              joined, e
            ))
          })?;
          match port {
            None => {
              d.path = host;
              have_path = true;
            }
            Some(port) => {
              d.path = format!("{}:{}", host, port);
              last_i = i;
              break;
            }
          }
        }
      }
    }
  }

  if d.protocol.is_none() {
    return Err(err(format!(
      "Unable to determine type from endpoint descriptor string '{}'",
      joined
    )));
  }

  if matches!(
    d.protocol,
    Some(EndpointProtocol::Unix) | Some(EndpointProtocol::Loop)
  ) && d.path.is_empty()
  {
    return Err(err(format!(
      "Missing endpoint path in endpoint descriptor string '{}'",
      joined
    )));
  }

  // Unspecified TCP paths are allowed here; defaulting may fill them in
  // from the opposite endpoint.

  Ok((d, last_i + 1))
}

/// Parses one extensible-form endpoint spec: `[role:]<protocol>://<params>`,
/// where `<params>` is a path string, or a JSON object carrying a `path`
/// field when it begins with `{`.
fn parse_uri_endpoint(spec: &str) -> Result<PartialEndpoint, TunnelError> {
  let spec = strip_angle_brackets(spec.trim());
  let (scheme, params) = spec
    .split_once("://")
    .ok_or_else(|| err(format!("Missing '://' in endpoint spec '{}'", spec)))?;
  // An optional role prefix is accepted and ignored; roles are positional.
  let scheme = scheme
    .rsplit_once(':')
    .map(|(role, proto)| match role {
      "stub" | "skeleton" => proto,
      _ => scheme,
    })
    .unwrap_or(scheme);
  let protocol = match scheme {
    "tcp" => EndpointProtocol::Tcp,
    "unix" => EndpointProtocol::Unix,
    "socks" => EndpointProtocol::Socks,
    "stdio" => EndpointProtocol::Stdio,
    "loop" => EndpointProtocol::Loop,
    other => {
      return Err(err(format!(
        "Unknown endpoint protocol '{}' in spec '{}'",
        other, spec
      )))
    }
  };
  let params = strip_angle_brackets(params);
  let path = if params.starts_with('{') {
    let object: serde_json::Value = serde_json::from_str(params)
      .map_err(|e| err(format!("Invalid JSON params in endpoint spec '{}': {}", spec, e)))?;
    object
      .get("path")
      .and_then(|v| v.as_str())
      .map(str::to_string)
      .ok_or_else(|| err(format!("JSON params must carry a \"path\" string: '{}'", spec)))?
  } else {
    params.to_string()
  };
  Ok(PartialEndpoint {
    protocol: Some(protocol),
    path,
  })
}

fn split_bracketedparts_for(sp: &str, joined: &str) -> Result<Vec<String>, TunnelError> {
  split_bracketed_parts(sp)
    .map_err(|e| err(format!("Invalid endpoint descriptor string '{}': '{}'", joined, e)))
}

/// Parses a single standalone endpoint descriptor string.
fn parse_endpoint_descriptor(
  s: &str,
  role: EndpointRole,
) -> Result<PartialEndpoint, TunnelError> {
  let parts = split_bracketed_parts(s)
    .map_err(|e| err(format!("Badly formed channel endpoint descriptor '{}': {}", s, e)))?;
  let (d, consumed) = parse_next_endpoint(&parts, role)?;
  let remaining = &parts[consumed..];
  if remaining.len() > 1 || (remaining.len() == 1 && !remaining[0].is_empty()) {
    return Err(err(format!(
      "Too many parts in channel endpoint descriptor string '{}'",
      s
    )));
  }
  Ok(d)
}

/// Parses a channel descriptor string and applies the defaulting rules. A
/// top-level `,` selects the extensible pair form `[R:]<stub-spec>,
/// <skeleton-spec>`; everything else is the legacy compact grammar (within
/// which an individual `proto://params` token is still accepted).
pub fn parse_channel_descriptor(s: &str) -> Result<ChannelDescriptor, TunnelError> {
  let comma_parts = split_grouped(s, ',')?;
  if comma_parts.len() == 2 {
    let (mut stub_spec, skeleton_spec) = (comma_parts[0].trim(), comma_parts[1].trim());
    let reverse = stub_spec.starts_with("R:");
    if reverse {
      stub_spec = stub_spec[2..].trim_start();
    }
    let stub = parse_standalone_spec(stub_spec, EndpointRole::Stub)?;
    let skeleton = parse_standalone_spec(skeleton_spec, EndpointRole::Skeleton)?;
    return finish_channel_descriptor(s, reverse, stub, skeleton);
  } else if comma_parts.len() > 2 {
    return Err(err(format!(
      "Too many ','-delimited specs in channel descriptor string: '{}'",
      s
    )));
  }

  let mut parts = split_bracketed_parts(s)?;
  let mut reverse = false;
  if parts.first().map(String::as_str) == Some("R") {
    reverse = true;
    parts.remove(0);
  }

  let (stub_partial, consumed) = parse_next_endpoint(&parts, EndpointRole::Stub)?;
  let skeleton_parts = &parts[consumed..];

  let (skeleton_partial, remaining) = if !skeleton_parts.is_empty() {
    let (sk, sk_consumed) = parse_next_endpoint(skeleton_parts, EndpointRole::Skeleton)?;
    (sk, &skeleton_parts[sk_consumed..])
  } else {
    (PartialEndpoint::default(), skeleton_parts)
  };

  if !remaining.is_empty() {
    return Err(err(format!(
      "Too many parts in channel descriptor string: '{}'",
      s
    )));
  }

  finish_channel_descriptor(s, reverse, stub_partial, skeleton_partial)
}

/// One spec of the extensible pair form: either URI form or a standalone
/// legacy endpoint descriptor.
fn parse_standalone_spec(spec: &str, role: EndpointRole) -> Result<PartialEndpoint, TunnelError> {
  if spec.contains("://") {
    parse_uri_endpoint(spec)
  } else {
    parse_endpoint_descriptor(strip_angle_brackets(spec), role)
  }
}

/// Applies the shorthand defaulting rules and validates the finished pair.
fn finish_channel_descriptor(
  s: &str,
  reverse: bool,
  stub_partial: PartialEndpoint,
  skeleton_partial: PartialEndpoint,
) -> Result<ChannelDescriptor, TunnelError> {
  let mut stub = stub_partial;
  let mut skeleton = skeleton_partial;

  // Special case: a bare "socks" is allowed, in which case it moves from the
  // stub position to the skeleton where it belongs.
  if stub.protocol == Some(EndpointProtocol::Socks) && skeleton.protocol.is_none() {
    std::mem::swap(&mut stub, &mut skeleton);
  }
  if stub.protocol == Some(EndpointProtocol::Socks) {
    return Err(err(format!(
      "SOCKS endpoints are only allowed on the skeleton side: '{}'",
      s
    )));
  }
  if stub.protocol.is_none() {
    stub.protocol = Some(EndpointProtocol::Tcp);
  }
  if skeleton.protocol.is_none() {
    skeleton.protocol = Some(EndpointProtocol::Tcp);
  }

  let mut stub_bind = String::new();
  let mut stub_port: Option<PortNumber> = None;
  let mut skeleton_host = String::new();
  let mut skeleton_port: Option<PortNumber> = None;

  if stub.protocol == Some(EndpointProtocol::Tcp) && !stub.path.is_empty() {
    let (h, p) = parse_host_port(&stub.path, "", None)?;
    stub_bind = h;
    stub_port = p;
  }
  if skeleton.protocol == Some(EndpointProtocol::Tcp) && !skeleton.path.is_empty() {
    let (h, p) = parse_host_port(&skeleton.path, "", None)?;
    skeleton_host = h;
    skeleton_port = p;
  }

  if stub.protocol == Some(EndpointProtocol::Tcp) && stub_bind.is_empty() {
    stub_bind = if skeleton.protocol == Some(EndpointProtocol::Socks) {
      "127.0.0.1".to_string()
    } else {
      "0.0.0.0".to_string()
    };
  }
  if stub.protocol == Some(EndpointProtocol::Tcp) && stub_port.is_none() {
    if skeleton.protocol == Some(EndpointProtocol::Socks) {
      stub_port = Some(1080);
    } else if skeleton_port.is_some() {
      stub_port = skeleton_port;
    }
  }
  if skeleton.protocol == Some(EndpointProtocol::Tcp) && skeleton_port.is_none() {
    skeleton_port = stub_port;
  }

  if stub.protocol == Some(EndpointProtocol::Tcp) {
    let port = stub_port.ok_or_else(|| {
      err(format!(
        "Unable to determine stub port number in channel descriptor string: '{}'",
        s
      ))
    })?;
    stub.path = format!("{}:{}", stub_bind, port);
  }
  if skeleton.protocol == Some(EndpointProtocol::Tcp) {
    if skeleton_host.is_empty() {
      skeleton_host = "localhost".to_string();
    }
    let port = skeleton_port.ok_or_else(|| {
      err(format!(
        "Unable to determine skeleton port number in channel descriptor string: '{}'",
        s
      ))
    })?;
    skeleton.path = format!("{}:{}", skeleton_host, port);
  }

  if (stub.protocol == Some(EndpointProtocol::Stdio) && reverse)
    || (skeleton.protocol == Some(EndpointProtocol::Stdio) && !reverse)
  {
    return Err(err(format!(
      "Stdio endpoints are only allowed on the client proxy side: '{}'",
      s
    )));
  }

  let descriptor = ChannelDescriptor {
    reverse,
    stub: EndpointDescriptor::new(EndpointRole::Stub, stub.protocol.unwrap(), stub.path),
    skeleton: EndpointDescriptor::new(
      EndpointRole::Skeleton,
      skeleton.protocol.unwrap(),
      skeleton.path,
    ),
  };
  descriptor.validate()?;
  Ok(descriptor)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn parse(s: &str) -> ChannelDescriptor {
    parse_channel_descriptor(s).unwrap_or_else(|e| panic!("'{}' must parse: {}", s, e))
  }

  #[test]
  fn split_honors_brackets_and_escapes() {
    assert_eq!(
      split_bracketed_parts("a:b:c").unwrap(),
      vec!["a", "b", "c"]
    );
    assert_eq!(
      split_bracketed_parts("[2001:db8::1]:80").unwrap(),
      vec!["[2001:db8::1]", "80"]
    );
    assert_eq!(
      split_bracketed_parts(r"a\:b:c").unwrap(),
      vec!["a:b", "c"]
    );
    assert_eq!(split_bracketed_parts(r"a\\b").unwrap(), vec![r"a\b"]);
    assert_eq!(
      split_bracketed_parts("<x:y>:z").unwrap(),
      vec!["<x:y>", "z"]
    );
    assert!(split_bracketed_parts("a]b").is_err());
    assert!(split_bracketed_parts("[a>").is_err());
    assert!(split_bracketed_parts("[a").is_err());
    assert!(split_bracketed_parts(r"tail\").is_err());
    assert_eq!(split_bracketed_parts("").unwrap(), Vec::<String>::new());
  }

  #[test]
  fn strip_angle_brackets_only_when_balanced() {
    assert_eq!(strip_angle_brackets("<abc>"), "abc");
    assert_eq!(strip_angle_brackets("<a><b>"), "<a><b>");
    assert_eq!(strip_angle_brackets("abc"), "abc");
    assert_eq!(strip_angle_brackets("<a:b>"), "a:b");
  }

  #[test]
  fn port_numbers_reject_sentinels() {
    assert!(parse_port_number("1").is_ok());
    assert!(parse_port_number("65534").is_ok());
    assert!(parse_port_number("0").is_err());
    assert!(parse_port_number("65535").is_err());
    assert!(parse_port_number("x").is_err());
    assert!(parse_port_number("99999").is_err());
  }

  #[test]
  fn host_port_forms() {
    assert_eq!(
      parse_host_port("host:80", "", None).unwrap(),
      ("host".to_string(), Some(80))
    );
    assert_eq!(
      parse_host_port("8080", "", None).unwrap(),
      ("".to_string(), Some(8080))
    );
    assert_eq!(
      parse_host_port("host", "", Some(1)).unwrap(),
      ("host".to_string(), Some(1))
    );
    assert_eq!(
      parse_host_port("[2001:db8::1]:80", "", None).unwrap(),
      ("[2001:db8::1]".to_string(), Some(80))
    );
    assert!(parse_host_port("a:b:c", "", None).is_err());
  }

  #[test]
  fn bare_port_forwards_to_same_remote_port() {
    let d = parse("3000");
    assert_eq!(d.stub.path, "0.0.0.0:3000");
    assert_eq!(d.skeleton.path, "localhost:3000");
    assert_eq!(d.stub.protocol, EndpointProtocol::Tcp);
    assert!(!d.reverse);
  }

  #[test]
  fn classic_three_part_form() {
    let d = parse("3000:google.com:80");
    assert_eq!(d.stub.path, "0.0.0.0:3000");
    assert_eq!(d.skeleton.path, "google.com:80");
  }

  #[test]
  fn four_part_form_with_bind_address() {
    let d = parse("192.168.0.1:3000:google.com:80");
    assert_eq!(d.stub.path, "192.168.0.1:3000");
    assert_eq!(d.skeleton.path, "google.com:80");
  }

  #[test]
  fn reverse_prefix() {
    let d = parse("R:2222:127.0.0.1:22");
    assert!(d.reverse);
    assert_eq!(d.stub.path, "0.0.0.0:2222");
    assert_eq!(d.skeleton.path, "127.0.0.1:22");
  }

  #[test]
  fn socks_alone_moves_to_skeleton_with_defaults() {
    let d = parse("socks");
    assert_eq!(d.skeleton.protocol, EndpointProtocol::Socks);
    assert_eq!(d.stub.protocol, EndpointProtocol::Tcp);
    assert_eq!(d.stub.path, "127.0.0.1:1080");
  }

  #[test]
  fn socks_with_explicit_stub() {
    let d = parse("127.0.0.1:1080:socks");
    assert_eq!(d.stub.path, "127.0.0.1:1080");
    assert_eq!(d.skeleton.protocol, EndpointProtocol::Socks);
  }

  #[test]
  fn stdio_stub_to_remote_port() {
    let d = parse("stdio:google.com:80");
    assert_eq!(d.stub.protocol, EndpointProtocol::Stdio);
    assert_eq!(d.stub.path, "");
    assert_eq!(d.skeleton.path, "google.com:80");
  }

  #[test]
  fn stdio_skeleton_forward_is_rejected() {
    assert!(parse_channel_descriptor("3000:stdio").is_err());
  }

  #[test]
  fn unix_paths_by_leading_slash_or_dot() {
    let d = parse("/tmp/in.sock:/tmp/out.sock");
    assert_eq!(d.stub.protocol, EndpointProtocol::Unix);
    assert_eq!(d.stub.path, "/tmp/in.sock");
    assert_eq!(d.skeleton.protocol, EndpointProtocol::Unix);
    assert_eq!(d.skeleton.path, "/tmp/out.sock");
  }

  #[test]
  fn explicit_unix_type_token() {
    let d = parse("unix:/tmp/a.sock:3000");
    assert_eq!(d.stub.protocol, EndpointProtocol::Unix);
    assert_eq!(d.stub.path, "/tmp/a.sock");
    assert_eq!(d.skeleton.path, "localhost:3000");
  }

  #[test]
  fn loop_skeleton() {
    let d = parse("3000:loop:name1");
    assert_eq!(d.stub.path, "0.0.0.0:3000");
    assert_eq!(d.skeleton.protocol, EndpointProtocol::Loop);
    assert_eq!(d.skeleton.path, "name1");
  }

  #[test]
  fn loop_stub_to_tcp() {
    let d = parse("loop:name1:google.com:80");
    assert_eq!(d.stub.protocol, EndpointProtocol::Loop);
    assert_eq!(d.stub.path, "name1");
    assert_eq!(d.skeleton.path, "google.com:80");
  }

  #[test]
  fn ipv6_bracketed_bind() {
    let d = parse("[2001:db8::1]:3000:google.com:80");
    assert_eq!(d.stub.path, "[2001:db8::1]:3000");
    assert_eq!(d.skeleton.path, "google.com:80");
  }

  #[test]
  fn socks_stub_position_with_skeleton_is_rejected() {
    assert!(parse_channel_descriptor("socks:google.com:80").is_err());
  }

  #[test]
  fn reverse_stdio_stub_is_rejected() {
    assert!(parse_channel_descriptor("R:stdio:google.com:80").is_err());
  }

  #[test]
  fn uri_form_loop_skeleton() {
    let d = parse("3000:loop://name1");
    assert_eq!(d.stub.path, "0.0.0.0:3000");
    assert_eq!(d.skeleton.protocol, EndpointProtocol::Loop);
    assert_eq!(d.skeleton.path, "name1");
  }

  #[test]
  fn uri_form_loop_stub() {
    let d = parse("loop://name1:google.com:80");
    assert_eq!(d.stub.protocol, EndpointProtocol::Loop);
    assert_eq!(d.stub.path, "name1");
    assert_eq!(d.skeleton.path, "google.com:80");
  }

  #[test]
  fn comma_pair_form() {
    let d = parse("tcp://0.0.0.0:3000,tcp://google.com:80");
    assert_eq!(d.stub.path, "0.0.0.0:3000");
    assert_eq!(d.skeleton.path, "google.com:80");
    assert!(!d.reverse);

    let d = parse("R:tcp://0.0.0.0:2222,tcp://127.0.0.1:22");
    assert!(d.reverse);
  }

  #[test]
  fn comma_pair_form_with_json_params() {
    let d = parse(r#"unix://{"path":"/tmp/a:b.sock"},loop://svc"#);
    assert_eq!(d.stub.protocol, EndpointProtocol::Unix);
    assert_eq!(d.stub.path, "/tmp/a:b.sock");
    assert_eq!(d.skeleton.protocol, EndpointProtocol::Loop);
    assert_eq!(d.skeleton.path, "svc");
  }

  #[test]
  fn comma_pair_form_mixing_legacy_spec() {
    let d = parse("3000,tcp://google.com:80");
    assert_eq!(d.stub.path, "0.0.0.0:3000");
    assert_eq!(d.skeleton.path, "google.com:80");
  }

  #[test]
  fn canonical_round_trip() {
    // Parsing the canonical string form of a parsed descriptor yields an
    // equal descriptor.
    for s in [
      "3000",
      "3000:google.com:80",
      "192.168.0.1:3000:google.com:80",
      "R:2222:127.0.0.1:22",
      "socks",
      "3000:loop:name1",
      "/tmp/in.sock:/tmp/out.sock",
    ] {
      let d = parse(s);
      let rendered = d.to_string();
      let reparsed = parse(&rendered);
      assert_eq!(reparsed, d, "round-trip of '{}' via '{}'", s, rendered);
    }
  }
}

// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! User authorization: credentials plus per-user channel patterns.
//!
//! The auth file is a JSON object mapping `"<user>:<pass>"` to an array of
//! regular expressions; a user is granted a channel iff at least one pattern
//! matches the channel descriptor's string form. The index reloads itself on
//! file-change notifications.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use anyhow::{Context, Result};
use notify::{RecommendedWatcher, RecursiveMode, Watcher};
use regex::Regex;

/// Splits a `user:pass` authorization string; both parts are empty when the
/// input carries no `:`.
pub fn parse_auth(auth: &str) -> (String, String) {
  match auth.split_once(':') {
    Some((user, pass)) => (user.to_string(), pass.to_string()),
    None => (String::new(), String::new()),
  }
}

/// A single user's authorization info.
#[derive(Debug, Clone)]
pub struct User {
  pub name: String,
  pub pass: String,
  pub allowed: Vec<Regex>,
}

impl User {
  /// An allow-all user, as created by `--auth user:pass`.
  pub fn allow_all(name: impl Into<String>, pass: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      pass: pass.into(),
      allowed: vec![Regex::new("").unwrap()],
    }
  }

  /// True iff a given channel descriptor string matches any of the user's
  /// allowed patterns.
  pub fn permits(&self, descriptor: &str) -> bool {
    self.allowed.iter().any(|r| r.is_match(descriptor))
  }
}

/// Thread-safe index of users, reloadable from an auth file.
#[derive(Debug, Default)]
pub struct UserIndex {
  users: RwLock<HashMap<String, Arc<User>>>,
  source: RwLock<Option<PathBuf>>,
}

impl UserIndex {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn len(&self) -> usize {
    self.users.read().unwrap().len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  pub fn get(&self, name: &str) -> Option<Arc<User>> {
    self.users.read().unwrap().get(name).cloned()
  }

  pub fn add_user(&self, user: User) {
    self
      .users
      .write()
      .unwrap()
      .insert(user.name.clone(), Arc::new(user));
  }

  /// Replaces the indexed users with the contents of an auth file.
  pub fn load_file(&self, path: &Path) -> Result<()> {
    let raw = std::fs::read_to_string(path)
      .with_context(|| format!("Failed to read auth file {}", path.display()))?;
    let parsed: HashMap<String, Vec<String>> = serde_json::from_str(&raw)
      .with_context(|| format!("Invalid auth file {}", path.display()))?;
    let mut users = HashMap::with_capacity(parsed.len());
    for (auth, patterns) in parsed {
      let (name, pass) = parse_auth(&auth);
      if name.is_empty() {
        anyhow::bail!("Auth file key \"{}\" is not of the form user:pass", auth);
      }
      let mut allowed = Vec::with_capacity(patterns.len());
      for p in &patterns {
        allowed.push(Regex::new(p).with_context(|| {
          format!("Invalid address pattern \"{}\" for user \"{}\"", p, name)
        })?);
      }
      users.insert(
        name.clone(),
        Arc::new(User {
          name,
          pass,
          allowed,
        }),
      );
    }
    *self.users.write().unwrap() = users;
    *self.source.write().unwrap() = Some(path.to_path_buf());
    tracing::debug!(path = %path.display(), count = self.len(), "auth file loaded");
    Ok(())
  }

  /// Watches the loaded auth file and reloads the index on change events.
  /// The watcher lives as long as the returned handle.
  pub fn watch(self: &Arc<Self>) -> Result<RecommendedWatcher> {
    let path = self
      .source
      .read()
      .unwrap()
      .clone()
      .context("No auth file has been loaded")?;
    let index = Arc::clone(self);
    let watched = path.clone();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
      match res {
        Ok(event) if event.kind.is_modify() || event.kind.is_create() => {
          if let Err(e) = index.load_file(&watched) {
            tracing::warn!(error = %e, "auth file reload failed; keeping previous users");
          } else {
            tracing::info!(path = %watched.display(), "auth file reloaded");
          }
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "auth file watch error"),
      }
    })?;
    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    Ok(watcher)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn parse_auth_splits_once() {
    assert_eq!(
      parse_auth("user:pa:ss"),
      ("user".to_string(), "pa:ss".to_string())
    );
    assert_eq!(parse_auth("nopass"), (String::new(), String::new()));
  }

  #[test]
  fn permits_matches_any_pattern() {
    let user = User {
      name: "u".into(),
      pass: "p".into(),
      allowed: vec![
        Regex::new(r"^<tcp:0\.0\.0\.0:3000>").unwrap(),
        Regex::new(r"localhost:22").unwrap(),
      ],
    };
    assert!(user.permits("<tcp:0.0.0.0:3000>:<tcp:google.com:80>"));
    assert!(user.permits("R:<tcp:0.0.0.0:2222>:<tcp:localhost:22>"));
    assert!(!user.permits("<tcp:0.0.0.0:9999>:<tcp:google.com:80>"));
  }

  #[test]
  fn allow_all_permits_everything() {
    let user = User::allow_all("u", "p");
    assert!(user.permits("<tcp:0.0.0.0:1>:<socks:>"));
  }

  #[test]
  fn load_file_parses_user_map() {
    let dir = std::env::temp_dir().join(format!("wstunnel-authfile-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("users.json");
    std::fs::write(
      &path,
      r#"{"alice:secret": ["^<tcp:.*:22>"], "bob:hunter2": [""]}"#,
    )
    .unwrap();
    let index = UserIndex::new();
    index.load_file(&path).unwrap();
    assert_eq!(index.len(), 2);
    let alice = index.get("alice").unwrap();
    assert_eq!(alice.pass, "secret");
    assert!(alice.permits("<tcp:0.0.0.0:22>:<tcp:localhost:22>"));
    assert!(!alice.permits("<tcp:0.0.0.0:80>:<tcp:localhost:80>"));
    assert!(index.get("bob").unwrap().permits("anything"));
    std::fs::remove_dir_all(&dir).ok();
  }

  #[test]
  fn invalid_pattern_is_rejected() {
    let dir = std::env::temp_dir().join(format!("wstunnel-badauth-{}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join("users.json");
    std::fs::write(&path, r#"{"alice:secret": ["["]}"#).unwrap();
    let index = UserIndex::new();
    assert!(index.load_file(&path).is_err());
    std::fs::remove_dir_all(&dir).ok();
  }
}

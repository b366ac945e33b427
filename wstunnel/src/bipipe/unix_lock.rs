// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0

//! Unix-domain socket listener guarded by a lock file.
//!
//! A listener at path P holds an advisory exclusive flock on `P.lock` for
//! its whole lifetime. The lock, not the socket file, is the liveness
//! authority: an orphaned socket left by a crashed process is unlinked and
//! replaced, while a second live listener fails fast on the lock. On
//! shutdown the lock file is unlinked *before* the lock is released, so a
//! successor may immediately recreate and lock it. Lock files are never
//! deleted while some other process holds the lock; the OS releases the
//! lock itself on process death, so a lingering lock file is harmless.
//! Place sockets on ephemeral storage where practical.

use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileTypeExt;
use std::path::{Path, PathBuf};

use nix::fcntl::{Flock, FlockArg};
use tokio::net::{UnixListener, UnixStream};

use crate::common::TunnelError;

pub struct LockedUnixSocketListener {
  path: PathBuf,
  lock_path: PathBuf,
  lock: Option<Flock<File>>,
  listener: Option<UnixListener>,
}

impl LockedUnixSocketListener {
  /// Claims the lock file and starts listening at `path`, cleaning up an
  /// orphaned socket if one is present.
  pub fn listen(path: &str) -> Result<Self, TunnelError> {
    if path.is_empty() {
      return Err(TunnelError::InvalidDescriptor(
        "Empty unix domain socket path".to_string(),
      ));
    }
    let parent = Path::new(path)
      .parent()
      .filter(|p| !p.as_os_str().is_empty())
      .unwrap_or_else(|| Path::new("."));
    let path = std::fs::canonicalize(parent)
      .map_err(|e| TunnelError::Io(format!("Invalid unix domain socket path {}: {}", path, e)))?
      .join(Path::new(path).file_name().ok_or_else(|| {
        TunnelError::InvalidDescriptor(format!("Invalid unix domain socket path {}", path))
      })?);
    let lock_path = {
      let mut p = path.clone().into_os_string();
      p.push(".lock");
      PathBuf::from(p)
    };

    let existing = match std::fs::metadata(&path) {
      Ok(meta) => Some(meta),
      Err(e) if e.kind() == std::io::ErrorKind::NotFound => None,
      Err(e) => {
        return Err(TunnelError::Io(format!(
          "Could not stat unix domain socket path {}: {}",
          path.display(),
          e
        )))
      }
    };
    if let Some(meta) = &existing {
      if !meta.file_type().is_socket() {
        return Err(TunnelError::Io(format!(
          "Path {} exists and is not a unix domain socket",
          path.display()
        )));
      }
    }

    let lock_file = OpenOptions::new()
      .write(true)
      .append(true)
      .create(true)
      .open(&lock_path)
      .map_err(|e| {
        TunnelError::Io(format!(
          "Unable to open unix domain socket lock file {}: {}",
          lock_path.display(),
          e
        ))
      })?;
    let lock = Flock::lock(lock_file, FlockArg::LockExclusiveNonblock).map_err(|(_, errno)| {
      TunnelError::Io(format!(
        "Unix domain socket in use (lock file {} is locked): {}",
        lock_path.display(),
        errno
      ))
    })?;

    if existing.is_some() {
      // Orphan left by a dead listener; the lock proves nobody owns it.
      std::fs::remove_file(&path).map_err(|e| {
        TunnelError::Io(format!(
          "Unable to remove orphaned unix domain socket {}: {}",
          path.display(),
          e
        ))
      })?;
    }

    let listener = UnixListener::bind(&path).map_err(|e| {
      TunnelError::Io(format!(
        "Unix domain socket listen failed for {}: {}",
        path.display(),
        e
      ))
    })?;

    tracing::debug!(path = %path.display(), "unix domain socket listening");

    Ok(Self {
      path,
      lock_path,
      lock: Some(lock),
      listener: Some(listener),
    })
  }

  pub async fn accept(&self) -> std::io::Result<UnixStream> {
    match &self.listener {
      Some(listener) => listener.accept().await.map(|(stream, _)| stream),
      None => Err(std::io::Error::new(
        std::io::ErrorKind::BrokenPipe,
        "listener is closed",
      )),
    }
  }

  /// Releases the socket and the lock in the documented order: close the
  /// listen socket, unlink the socket path, unlink the lock file, and only
  /// then release the lock.
  pub fn close(mut self) {
    if let Some(listener) = self.listener.take() {
      drop(listener);
      let _ = std::fs::remove_file(&self.path);
    }
    if let Some(lock) = self.lock.take() {
      let _ = std::fs::remove_file(&self.lock_path);
      drop(lock);
    }
  }
}

impl Drop for LockedUnixSocketListener {
  fn drop(&mut self) {
    if let Some(listener) = self.listener.take() {
      drop(listener);
      let _ = std::fs::remove_file(&self.path);
    }
    if let Some(lock) = self.lock.take() {
      let _ = std::fs::remove_file(&self.lock_path);
      drop(lock);
    }
  }
}

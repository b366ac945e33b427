// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

/// Live/total connection counters for one proxy endpoint, shared by every
/// session and bridge it owns. Rendered as `[live/total]` in logs and dumped
/// on the stats signal.
#[derive(Debug, Default)]
pub struct ConnStats {
  open: AtomicI64,
  total: AtomicI64,
}

impl ConnStats {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn open(&self) {
    self.open.fetch_add(1, Ordering::Relaxed);
    self.total.fetch_add(1, Ordering::Relaxed);
  }

  pub fn close(&self) {
    self.open.fetch_sub(1, Ordering::Relaxed);
  }

  pub fn live(&self) -> i64 {
    self.open.load(Ordering::Relaxed)
  }

  pub fn total(&self) -> i64 {
    self.total.load(Ordering::Relaxed)
  }
}

impl std::fmt::Display for ConnStats {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "[{}/{}]", self.live(), self.total())
  }
}

/// Guard that decrements the live count when the connection it tracks drops.
pub struct ConnGuard {
  stats: Arc<ConnStats>,
}

impl ConnGuard {
  pub fn open(stats: &Arc<ConnStats>) -> Self {
    stats.open();
    Self {
      stats: Arc::clone(stats),
    }
  }
}

impl Drop for ConnGuard {
  fn drop(&mut self) {
    self.stats.close();
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn guard_balances_live_count() {
    let stats = ConnStats::new();
    let a = ConnGuard::open(&stats);
    let b = ConnGuard::open(&stats);
    assert_eq!(stats.live(), 2);
    assert_eq!(stats.total(), 2);
    drop(a);
    drop(b);
    assert_eq!(stats.live(), 0);
    assert_eq!(stats.total(), 2);
    assert_eq!(format!("{}", stats), "[0/2]");
  }
}

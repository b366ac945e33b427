// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
use std::sync::atomic::{AtomicU64, Ordering};

pub mod cancellation;
pub mod shutdown;
pub mod stats;
pub mod validators;
pub mod websocket;

static LAST_CONNECTION_ID: AtomicU64 = AtomicU64::new(0);

/// Allocates a process-wide monotonically increasing connection id, used to
/// correlate log lines for one bipipe or bridge.
pub fn alloc_connection_id() -> u64 {
  LAST_CONNECTION_ID.fetch_add(1, Ordering::Relaxed) + 1
}

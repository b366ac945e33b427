// Copyright (c) Microsoft Corporation.
// Licensed under the MIT license OR Apache 2.0
// Codebase policy prefers an explicit unit return when it clarifies intent,
// for consistency with Ok(()) returns at the end of Result-bearing functions.
#![allow(clippy::unused_unit)]

pub mod common;
pub mod util;

pub mod bipipe;
pub mod session;

/// WebSocket subprotocol identifying the tunnel protocol revision; the server
/// rejects upgrade requests carrying any other subprotocol.
pub const PROTOCOL_VERSION: &str = "wstunnel-1";

/// Build string advertised in the session config exchange and `/version`.
pub const BUILD_VERSION: &str = env!("CARGO_PKG_VERSION");

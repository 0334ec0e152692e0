//! # br-core
//!
//! Core crate for the botrelay system, providing:
//!
//! - **Types** (`types`): enums, market data records, order/position records
//! - **Configuration** (`config`): JSON config deserialization
//! - **Error types** (`error`): domain-specific `RelayError` via thiserror
//! - **WebSocket** (`ws`): WS client with auto-reconnect and connect hooks
//! - **Time utilities** (`time_util`): epoch timestamps
//! - **Logging** (`logging`): tracing-based structured logging

pub mod config;
pub mod error;
pub mod logging;
pub mod time_util;
pub mod types;
pub mod ws;

// Re-export types at crate root for convenience.
pub use types::*;

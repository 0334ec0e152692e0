//! Typed error definitions for the botrelay system.
//!
//! Provides [`RelayError`] for domain-specific errors that are more informative
//! than plain `anyhow::Error` strings. All variants implement `std::error::Error`
//! via `thiserror`, so they integrate seamlessly with `anyhow::Result`.

use thiserror::Error;

use crate::types::RequestType;

/// Domain-specific errors for the botrelay system.
#[derive(Debug, Error)]
pub enum RelayError {
    /// Configuration parsing or validation error.
    #[error("config error: {0}")]
    Config(String),

    /// A known request type arrived but no upstream source was wired to serve it.
    #[error("no upstream handler registered for {0}")]
    MissingUpstream(RequestType),

    /// WebSocket connection, handshake, or communication error.
    #[error("websocket error: {0}")]
    WebSocket(String),

    /// Malformed inbound or outbound message.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Order submission or reconciliation error.
    #[error("order error: {0}")]
    Order(String),

    /// Checkpoint persistence error.
    #[error("checkpoint error: {0}")]
    Checkpoint(String),
}

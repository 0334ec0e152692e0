//! WebSocket client plumbing shared by every network-backed source.

pub mod client;

pub use client::{
    ConnState, OnConnectCallback, OnMessageCallback, OnStateCallback, PingPayload, WsConnConfig,
    WsConnection, WsHandlers,
};

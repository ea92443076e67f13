//! WebSocket client and server halves (RFC 6455, partial).
//!
//! Frames are encoded and decoded by hand: FIN is always set (no
//! continuation support), client frames are masked, server frames are
//! not, and only text payloads are surfaced to callers. Ping frames are
//! answered with an echoing pong; extensions and close status codes are
//! unsupported.

mod client;
mod frame;
mod server;

pub use client::WsClient;
pub use frame::{accept_key, Frame, Opcode};
pub use server::{WsConnection, WsHandler, WsServer};

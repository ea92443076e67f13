#![deny(missing_docs)]

//! # wiretap
//!
//! An interactive TCP intercepting proxy for development and debugging.
//!
//! `wiretap` terminates client connections, dials an upstream endpoint
//! (plain TCP or TLS) and relays bytes in both directions while
//!
//! - applying literal search/replace substitutions to every chunk,
//! - recomputing the HTTP `Content-Length` header when a substitution
//!   changed a message body,
//! - logging every message as one escaped line, and
//! - optionally handing the connection over to a different host when a
//!   trigger pattern appears in a server-to-client message.
//!
//! The crate also ships the building blocks this requires: a minimal
//! HTTP/1.1 dispatch server with keep-alive and a raw-socket escape for
//! upgrades, and hand-rolled client and server halves of the WebSocket
//! framing layer (RFC 6455, partial).
//!
//! ## Running the proxy
//!
//! ```no_run
//! use wiretap::{LogSink, ProxyConfig, ProxyServer, Rule, Transport};
//!
//! #[tokio::main]
//! async fn main() -> wiretap::Result<()> {
//!   let config = ProxyConfig {
//!     bind_host: "127.0.0.1".into(),
//!     bind_port: 8080,
//!     transport: Transport::Tcp,
//!     upstream_host: "example.org".into(),
//!     upstream_port: 80,
//!     insecure: false,
//!     router: None,
//!     rules: vec![Rule::new("hello", "goodbye")],
//!   };
//!   let server = ProxyServer::bind(config, LogSink::stdout()).await?;
//!   server.run().await
//! }
//! ```
//!
//! This is a line-debugging tool, not a production proxy: substitutions
//! are applied per 64 KiB chunk, HTTP semantics beyond `Content-Length`
//! fixup are not modelled, and TLS peer identity is not verified
//! aggressively.

mod adjust;
mod connector;
mod dispatch;
mod errors;
mod exchange;
mod headers;
mod logsink;
mod prefixed;
mod proxy;
mod relay;
mod router;
mod rules;
mod text;
/// WebSocket framing layer.
pub mod ws;

pub use adjust::adjust_content_length;
pub use connector::{Connector, Stream, Transport};
pub use dispatch::{DispatchServer, HttpHandler};
pub use errors::{Error, Result};
pub use exchange::Exchange;
pub use headers::Headers;
pub use logsink::LogSink;
pub use prefixed::PrefixedReader;
pub use proxy::{ProxyConfig, ProxyServer};
pub use relay::{BoxReader, BoxWriter, Direction, Relay};
pub use router::{PulledSockets, Router, RouterConfig, SwitchedSockets};
pub use rules::{unescape, Rule};

//! Accept loop pairing each accepted client with a freshly dialed
//! upstream.

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::connector::{Connector, Transport};
use crate::errors::{Error, Result};
use crate::logsink::LogSink;
use crate::relay::{Direction, Relay};
use crate::router::{Router, RouterConfig};
use crate::rules::Rule;

/// Proxy configuration, usually assembled by the CLI.
#[derive(Clone, Debug)]
pub struct ProxyConfig {
  /// Host to listen on.
  pub bind_host: String,
  /// Port to listen on.
  pub bind_port: u16,
  /// Transport towards the upstream endpoint.
  pub transport: Transport,
  /// Upstream host to dial for every accepted client.
  pub upstream_host: String,
  /// Upstream port.
  pub upstream_port: u16,
  /// Accept any TLS certificate the upstream presents.
  pub insecure: bool,
  /// Optional mid-stream hand-over configuration.
  pub router: Option<RouterConfig>,
  /// Search/replace rules applied to every relayed chunk.
  pub rules: Vec<Rule>,
}

/// The proxy supervisor: one listener, two relays per accepted client.
pub struct ProxyServer {
  config: ProxyConfig,
  connector: Connector,
  listener: TcpListener,
  log: LogSink,
}

impl ProxyServer {
  /// Binds the configured listener.
  pub async fn bind(config: ProxyConfig, log: LogSink) -> Result<ProxyServer> {
    let connector = Connector::new(config.transport, config.insecure)?;
    let listener = TcpListener::bind((config.bind_host.as_str(), config.bind_port))
      .await
      .map_err(|e| {
        Error::config(format!(
          "failed to bind {}:{}: {e}",
          config.bind_host, config.bind_port
        ))
      })?;
    log.emit(format!(
      "Server listening on {}:{}",
      config.bind_host, config.bind_port
    ));
    Ok(ProxyServer {
      config,
      connector,
      listener,
      log,
    })
  }

  /// The bound address, useful after binding port 0.
  pub fn local_addr(&self) -> Result<SocketAddr> {
    Ok(self.listener.local_addr()?)
  }

  /// Serves connections until accepting or dialing fails.
  ///
  /// An upstream dial failure ends the whole run; every client is only
  /// worth proxying while the upstream is reachable.
  pub async fn run(self) -> Result<()> {
    loop {
      let (client, peer) = self.listener.accept().await?;
      let upstream = self
        .connector
        .connect(&self.config.upstream_host, self.config.upstream_port)
        .await
        .map_err(|e| {
          tracing::error!(
            "IO-error at connect to {}:{}: {e}",
            self.config.upstream_host,
            self.config.upstream_port
          );
          e
        })?;
      self.log.emit(format!(
        "Connection established: {peer} -> {}:{}",
        self.config.upstream_host, self.config.upstream_port
      ));

      let stop = CancellationToken::new();
      let router = match &self.config.router {
        Some(router_config) => Some(Arc::new(Router::new(router_config)?)),
        None => None,
      };
      let rules = Arc::new(self.config.rules.clone());
      let label = match client.local_addr() {
        Ok(local) => format!("{local}-{peer}"),
        Err(_) => peer.to_string(),
      };

      let (client_read, client_write) = client.into_split();
      let (upstream_read, upstream_write) = tokio::io::split(upstream);
      let c2r = Relay::new(
        Box::new(client_read),
        Box::new(upstream_write),
        Direction::C2R,
        &label,
        self.log.clone(),
        stop.clone(),
        rules.clone(),
        router.clone(),
      );
      let r2c = Relay::new(
        Box::new(upstream_read),
        Box::new(client_write),
        Direction::R2C,
        &label,
        self.log.clone(),
        stop,
        rules,
        router,
      );
      tokio::spawn(c2r.run());
      tokio::spawn(r2c.run());
    }
  }
}

//! Command-line entry point for the wiretap proxy.

use clap::Parser;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use wiretap::{
  unescape, LogSink, ProxyConfig, ProxyServer, Result, RouterConfig, Rule, Transport,
};

/// Interactive TCP intercepting proxy for development and debugging.
#[derive(Parser, Debug)]
#[command(name = "wiretap", version, about)]
struct Cli {
  /// Host to listen on, e.g. 127.0.0.1
  bind_host: String,
  /// Port to listen on
  bind_port: u16,
  /// Upstream transport: tcp or tls
  transport: Transport,
  /// Upstream host to dial for every accepted client
  upstream_host: String,
  /// Upstream port
  upstream_port: u16,
  /// Hand the connection over to HOST PORT MSG_PORT when a whole
  /// server-to-client message matches REGEX
  #[arg(
    long = "transfer-connection",
    num_args = 4,
    value_names = ["HOST", "PORT", "MSG_PORT", "REGEX"]
  )]
  transfer_connection: Option<Vec<String>>,
  /// Accept any TLS certificate the upstream presents
  #[arg(long)]
  insecure: bool,
  /// Literal search/replace pairs applied to every relayed chunk;
  /// \n, \r, \t and \\ are unescaped
  #[arg(value_names = ["SEARCH", "REPLACE"])]
  rules: Vec<String>,
}

fn build_config(cli: Cli) -> Result<ProxyConfig> {
  let router = match cli.transfer_connection {
    Some(args) => Some(RouterConfig {
      host: args[0].clone(),
      port: parse_port(&args[1])?,
      msg_port: parse_port(&args[2])?,
      trigger: args[3].clone(),
    }),
    None => None,
  };
  let rules = cli
    .rules
    .chunks_exact(2)
    .map(|pair| Rule::new(unescape(&pair[0]), unescape(&pair[1])))
    .collect();
  Ok(ProxyConfig {
    bind_host: cli.bind_host,
    bind_port: cli.bind_port,
    transport: cli.transport,
    upstream_host: cli.upstream_host,
    upstream_port: cli.upstream_port,
    insecure: cli.insecure,
    router,
    rules,
  })
}

fn parse_port(value: &str) -> Result<u16> {
  value
    .parse()
    .map_err(|_| wiretap::Error::Config(format!("invalid port: {value}")))
}

#[tokio::main]
async fn main() {
  tracing_subscriber::registry()
    .with(
      tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
    )
    .with(tracing_subscriber::fmt::layer())
    .init();

  let cli = match Cli::try_parse() {
    Ok(cli) => cli,
    Err(e) => {
      let _ = e.print();
      std::process::exit(1);
    }
  };
  let config = match build_config(cli) {
    Ok(config) => config,
    Err(e) => {
      eprintln!("{e}");
      std::process::exit(1);
    }
  };

  let log = LogSink::stdout();
  log.emit(format!("Search-Replaces: {:?}", config.rules));
  let server = match ProxyServer::bind(config, log).await {
    Ok(server) => server,
    Err(e) => {
      tracing::error!("{e}");
      std::process::exit(2);
    }
  };
  if let Err(e) = server.run().await {
    tracing::error!("proxy terminated: {e}");
    std::process::exit(2);
  }
}

//! Half-duplex relay between two socket halves.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::adjust::adjust_content_length;
use crate::errors::{Error, Result};
use crate::logsink::{timestamp, LogSink};
use crate::prefixed::PrefixedReader;
use crate::router::Router;
use crate::rules::Rule;
use crate::text::{escape_content, latin1_decode, latin1_encode};

/// Boxed read half used by a relay.
pub type BoxReader = Box<dyn AsyncRead + Send + Unpin>;
/// Boxed write half used by a relay.
pub type BoxWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// Data flow direction of one relay half.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
  /// Client to remote.
  C2R,
  /// Remote to client.
  R2C,
}

impl std::fmt::Display for Direction {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    match self {
      Direction::C2R => f.write_str("C2R"),
      Direction::R2C => f.write_str("R2C"),
    }
  }
}

const READ_BUF_SIZE: usize = 64 * 1024;
const LOG_TRUNCATE_CHARS: usize = 500;
const STATS_INTERVAL: Duration = Duration::from_secs(10);
/// Message-log cap applied once a chunk looks like WebSocket traffic.
const WS_VERBOSE_CAP: u64 = 999;

fn max_msgs_display() -> u64 {
  std::env::var("MAX_MSGS_DISPLAY")
    .ok()
    .and_then(|value| value.parse().ok())
    .unwrap_or(999_999_999)
}

/// One direction of a proxied connection.
///
/// Reads chunks from its input, applies the search/replace rules, fixes
/// up `Content-Length` when a rewrite changed an HTTP body, logs every
/// message, writes to its output and consults the router for mid-stream
/// hand-overs. Any I/O failure cancels the shared stop token, which also
/// tears down the peer relay.
pub struct Relay {
  input: BoxReader,
  output: BoxWriter,
  direction: Direction,
  label: String,
  log: LogSink,
  stop: CancellationToken,
  rules: Arc<Vec<Rule>>,
  router: Option<Arc<Router>>,
}

impl Relay {
  /// Creates a relay over the given halves.
  #[allow(clippy::too_many_arguments)]
  pub fn new(
    input: BoxReader,
    output: BoxWriter,
    direction: Direction,
    label: impl Into<String>,
    log: LogSink,
    stop: CancellationToken,
    rules: Arc<Vec<Rule>>,
    router: Option<Arc<Router>>,
  ) -> Self {
    Self {
      input,
      output,
      direction,
      label: label.into(),
      log,
      stop,
      rules,
      router,
    }
  }

  /// Runs the relay until EOF, I/O failure or cancellation, then closes
  /// both endpoints and emits a final statistics line.
  pub fn run(mut self) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
      let mut msg_counter: u64 = 0;
      let mut total_bytes: u64 = 0;
      let result = self.pump(&mut msg_counter, &mut total_bytes).await;

      self.stop.cancel();
      let _ = self.output.shutdown().await;

      match result {
        Ok(()) => {}
        Err(Error::IO(e)) if is_benign_close(&e) => {
          self
            .log
            .emit(format!("#{} {}: {e}", timestamp(), self.label));
        }
        Err(e) => {
          tracing::error!("{}: relay failed: {e}", self.label);
        }
      }
      self.log.emit(format!(
        "# {} {} {} Connection closed: Packets={}, Total Bytes={}",
        timestamp(),
        self.direction,
        self.label,
        msg_counter,
        total_bytes
      ));
    })
  }

  async fn pump(&mut self, msg_counter: &mut u64, total_bytes: &mut u64) -> Result<()> {
    let mut buf = vec![0u8; READ_BUF_SIZE];
    let mut max_num_msgs = max_msgs_display();
    let mut last_stats: Option<Instant> = None;

    while !self.stop.is_cancelled() {
      if self.direction == Direction::C2R {
        self.pickup_new_client(None);
      }

      let bytes_read = tokio::select! {
        _ = self.stop.cancelled() => break,
        read = self.input.read(&mut buf) => read?,
      };
      if bytes_read == 0 {
        break;
      }
      // A switch that arrived during the read: hand the already-read bytes
      // to the auxiliary relay and skip this iteration.
      if self.direction == Direction::C2R && self.pickup_new_client(Some(&buf[..bytes_read])) {
        continue;
      }

      *total_bytes += bytes_read as u64;
      *msg_counter += 1;
      let msg_no = *msg_counter;
      let ts = timestamp();
      let content = latin1_decode(&buf[..bytes_read]);
      if content.contains("Connection: upgrade") || content.contains("Sec-WebSocket") {
        // WebSocket data is noisy; stop logging message bodies soon.
        max_num_msgs = WS_VERBOSE_CAP;
      }
      let mut modified = Rule::apply_all(&self.rules, &content);

      if msg_no <= max_num_msgs || content.starts_with("GET ") || content.starts_with("POST ") {
        let escaped = escape_content(&content);
        self.log.emit(format!(
          "#{ts} {} {}:\n{}",
          self.direction,
          self.label,
          truncate_chars(&escaped, LOG_TRUNCATE_CHARS)
        ));
      }

      if modified == content {
        self.output.write_all(&buf[..bytes_read]).await?;
      } else {
        modified = adjust_content_length(&content, &modified, &self.log);
        if msg_no <= max_num_msgs {
          self.log.emit(format!(
            "#{ts} {} {} modified\n{}",
            self.direction,
            self.label,
            escape_content(&modified)
          ));
        }
        self.output.write_all(&latin1_encode(&modified)).await?;
      }
      self.output.flush().await?;

      if self.direction == Direction::R2C {
        self.check_switch(&content).await?;
      }

      if msg_no > max_num_msgs {
        let due = match last_stats {
          None => true,
          Some(at) => at.elapsed() >= STATS_INTERVAL,
        };
        if due {
          self.log.emit(format!(
            "# {} {} {} Statistics: Packets={}, Total Bytes={}",
            timestamp(),
            self.direction,
            self.label,
            msg_no,
            total_bytes
          ));
          last_stats = Some(Instant::now());
        }
      }
    }
    Ok(())
  }

  /// Non-blocking pickup of sockets published by the router. On success
  /// the relay reads from the new primary connection from now on, and an
  /// auxiliary relay keeps forwarding the original input over the side
  /// channel. `pending` carries bytes that were already read from the old
  /// input; they are spliced in front of the auxiliary relay's input.
  fn pickup_new_client(&mut self, pending: Option<&[u8]>) -> bool {
    let Some(router) = &self.router else {
      return false;
    };
    let Some(pulled) = router.pull_new_client() else {
      return false;
    };
    let ts = timestamp();
    if let Some(bytes) = pending {
      self.log.emit(format!(
        "#{ts} {} {}: discarded {}",
        self.direction,
        self.label,
        escape_content(&latin1_decode(bytes))
      ));
    }
    let new_peer = peer_label(pulled.new_client_read.peer_addr());
    self.log.emit(format!(
      "#{ts} {} {}: new client {new_peer}",
      self.direction, self.label
    ));

    let side_peer = peer_label(pulled.msgs_old_client_write.peer_addr());
    let old_input = std::mem::replace(&mut self.input, Box::new(pulled.new_client_read));
    let aux_input: BoxReader = match pending {
      Some(bytes) => Box::new(PrefixedReader::new(bytes.to_vec(), old_input)),
      None => old_input,
    };
    let aux = Relay::new(
      aux_input,
      Box::new(pulled.msgs_old_client_write),
      Direction::C2R,
      format!("MSGS-{}-{side_peer}", self.label),
      self.log.clone(),
      self.stop.clone(),
      self.rules.clone(),
      None,
    );
    tokio::spawn(aux.run());
    true
  }

  /// After writing an R2C message, asks the router whether it triggered a
  /// switch. On a switch the relay writes to the new primary connection
  /// from now on, and an auxiliary relay feeds side-channel data back to
  /// the original client.
  async fn check_switch(&mut self, content: &str) -> Result<()> {
    let Some(router) = &self.router else {
      return Ok(());
    };
    let Some(switched) = router.check_for_switch_message(content).await? else {
      return Ok(());
    };
    let ts = timestamp();
    let side_peer = peer_label(switched.msgs_old_client_read.peer_addr());
    self.log.emit(format!(
      "#{ts} {} {}: transfer-socket {}",
      self.direction,
      self.label,
      peer_label(switched.new_client_write.peer_addr())
    ));

    let old_output = std::mem::replace(&mut self.output, Box::new(switched.new_client_write));
    let aux = Relay::new(
      Box::new(switched.msgs_old_client_read),
      old_output,
      Direction::R2C,
      format!("MSGS-{}-{side_peer}", self.label),
      self.log.clone(),
      self.stop.clone(),
      self.rules.clone(),
      None,
    );
    tokio::spawn(aux.run());
    Ok(())
  }
}

fn peer_label(addr: std::io::Result<std::net::SocketAddr>) -> String {
  addr
    .map(|a| a.to_string())
    .unwrap_or_else(|_| String::from("unknown"))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
  if text.chars().count() <= max_chars {
    return text.to_owned();
  }
  let mut truncated: String = text.chars().take(max_chars).collect();
  truncated.push_str("[...]");
  truncated
}

fn is_benign_close(e: &std::io::Error) -> bool {
  matches!(
    e.kind(),
    std::io::ErrorKind::UnexpectedEof
      | std::io::ErrorKind::ConnectionReset
      | std::io::ErrorKind::ConnectionAborted
      | std::io::ErrorKind::BrokenPipe
      | std::io::ErrorKind::NotConnected
  )
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncWriteExt;

  fn quiet() -> LogSink {
    LogSink::new(|_| {})
  }

  #[tokio::test]
  async fn relays_bytes_unchanged_without_rules() {
    let (client, mut client_peer) = tokio::io::duplex(1024);
    let (upstream, mut upstream_peer) = tokio::io::duplex(1024);
    let (client_read, _client_write) = tokio::io::split(client);
    let (_upstream_read, upstream_write) = tokio::io::split(upstream);

    let relay = Relay::new(
      Box::new(client_read),
      Box::new(upstream_write),
      Direction::C2R,
      "test",
      quiet(),
      CancellationToken::new(),
      Arc::new(Vec::new()),
      None,
    );
    let handle = tokio::spawn(relay.run());

    let payload: Vec<u8> = (0..=255).collect();
    client_peer.write_all(&payload).await.unwrap();
    client_peer.shutdown().await.unwrap();

    let mut received = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut upstream_peer, &mut received)
      .await
      .unwrap();
    assert_eq!(received, payload);
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn applies_rules_and_adjusts_content_length() {
    let (client, mut client_peer) = tokio::io::duplex(1024);
    let (upstream, mut upstream_peer) = tokio::io::duplex(1024);
    let (client_read, _client_write) = tokio::io::split(client);
    let (_upstream_read, upstream_write) = tokio::io::split(upstream);

    let rules = Arc::new(vec![Rule::new("L/B/C", "LongBodyContent")]);
    let relay = Relay::new(
      Box::new(client_read),
      Box::new(upstream_write),
      Direction::C2R,
      "test",
      quiet(),
      CancellationToken::new(),
      rules,
      None,
    );
    let handle = tokio::spawn(relay.run());

    client_peer
      .write_all(b"POST /data HTTP/1.1\r\nContent-Length: 5\r\n\r\nL/B/C")
      .await
      .unwrap();
    client_peer.shutdown().await.unwrap();

    let mut received = Vec::new();
    tokio::io::AsyncReadExt::read_to_end(&mut upstream_peer, &mut received)
      .await
      .unwrap();
    assert_eq!(
      received,
      b"POST /data HTTP/1.1\r\nContent-Length: 15\r\n\r\nLongBodyContent"
    );
    handle.await.unwrap();
  }

  #[tokio::test]
  async fn read_error_cancels_the_shared_token() {
    let (client, client_peer) = tokio::io::duplex(64);
    let (upstream, _upstream_peer) = tokio::io::duplex(64);
    let (client_read, _client_write) = tokio::io::split(client);
    let (_upstream_read, upstream_write) = tokio::io::split(upstream);

    let stop = CancellationToken::new();
    let relay = Relay::new(
      Box::new(client_read),
      Box::new(upstream_write),
      Direction::C2R,
      "test",
      quiet(),
      stop.clone(),
      Arc::new(Vec::new()),
      None,
    );
    let handle = tokio::spawn(relay.run());
    drop(client_peer);
    handle.await.unwrap();
    assert!(stop.is_cancelled());
  }

  #[test]
  fn truncation_appends_marker() {
    let text = "x".repeat(600);
    let truncated = truncate_chars(&text, 500);
    assert_eq!(truncated.chars().count(), 505);
    assert!(truncated.ends_with("[...]"));
    assert_eq!(truncate_chars("short", 500), "short");
  }
}

//! WebSocket server half: upgrade handshake and connection management.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

use crate::dispatch::{DispatchServer, HttpHandler};
use crate::errors::{Error, Result};
use crate::exchange::{Exchange, RawReader, RawWriter};
use crate::ws::frame::{self, accept_key, Opcode};

/// Wait applied to each poll of the outgoing queue, so the writer notices
/// a finished connection promptly.
const OUTGOING_POLL: Duration = Duration::from_millis(200);
/// Capacity of the outgoing message queue.
const OUTGOING_QUEUE_SIZE: usize = 64;

/// Hooks for WebSocket connection events.
#[async_trait]
pub trait WsHandler: Send + Sync {
  /// Called when a new connection is established.
  async fn on_open(&self, conn: &WsConnection);
  /// Called for every received text message.
  async fn on_message(&self, conn: &WsConnection, message: String);
  /// Called once when the connection is closed.
  async fn on_close(&self, conn: &WsConnection, code: u16, reason: &str);
  /// Called when an error occurs on the connection.
  async fn on_error(&self, conn: &WsConnection, error: &Error);
}

struct WsPayload {
  payload: Vec<u8>,
  opcode: Opcode,
}

/// A single server-side WebSocket connection.
///
/// Outgoing messages are queued and written by the connection's writer
/// loop; frames to the client are never masked.
pub struct WsConnection {
  writer: Mutex<RawWriter>,
  outgoing: mpsc::Sender<WsPayload>,
  closed: AtomicBool,
}

impl WsConnection {
  /// Queues a text message for delivery to the client.
  pub async fn send_text(&self, message: &str) -> Result<()> {
    self
      .enqueue(WsPayload {
        payload: message.as_bytes().to_vec(),
        opcode: Opcode::Text,
      })
      .await
  }

  /// Queues a binary message for delivery to the client.
  pub async fn send_binary(&self, payload: Vec<u8>) -> Result<()> {
    self
      .enqueue(WsPayload {
        payload,
        opcode: Opcode::Binary,
      })
      .await
  }

  /// Sends a close frame and closes the socket. Idempotent.
  pub async fn close(&self) -> Result<()> {
    if self.closed.swap(true, Ordering::SeqCst) {
      return Ok(());
    }
    let mut writer = self.writer.lock().await;
    let written = frame::write_frame(&mut *writer, Opcode::Close, &[], None).await;
    writer.shutdown().await.ok();
    written
  }

  /// Whether the connection has been closed.
  pub fn is_closed(&self) -> bool {
    self.closed.load(Ordering::SeqCst)
  }

  async fn enqueue(&self, payload: WsPayload) -> Result<()> {
    if self.is_closed() {
      return Err(Error::state("websocket is closed"));
    }
    self
      .outgoing
      .send(payload)
      .await
      .map_err(|_| Error::state("websocket is closed"))
  }

  /// Waits up to [`OUTGOING_POLL`] for a queued message and writes it.
  async fn send_outgoing_message(&self, rx: &mut mpsc::Receiver<WsPayload>) -> Result<bool> {
    let payload = match tokio::time::timeout(OUTGOING_POLL, rx.recv()).await {
      Err(_) | Ok(None) => return Ok(false),
      Ok(Some(payload)) => payload,
    };
    self.write_frame(payload.opcode, &payload.payload).await?;
    Ok(true)
  }

  async fn write_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<()> {
    if self.is_closed() {
      return Err(Error::state("websocket is closed"));
    }
    let mut writer = self.writer.lock().await;
    frame::write_frame(&mut *writer, opcode, payload, None).await
  }
}

/// WebSocket server (RFC 6455, partial) on top of the dispatch server.
///
/// GET requests to the configured path with a valid upgrade handshake are
/// switched to WebSocket framing; every other request goes to the fallback
/// HTTP handler.
pub struct WsServer {
  server: DispatchServer,
  stopped: CancellationToken,
}

impl WsServer {
  /// Binds `host:port` and starts serving.
  ///
  /// `path` is the WebSocket endpoint; `http_handler` serves all other
  /// requests.
  pub async fn bind(
    host: &str,
    port: u16,
    http_handler: Arc<dyn HttpHandler>,
    path: &str,
    handler: Arc<dyn WsHandler>,
  ) -> Result<WsServer> {
    if path.is_empty() {
      return Err(Error::config("websocket path cannot be empty"));
    }
    let stopped = CancellationToken::new();
    let upgrade = UpgradeHandler {
      path: path.to_owned(),
      fallback: http_handler,
      ws_handler: handler,
      stopped: stopped.clone(),
    };
    let server = DispatchServer::bind(host, port, Arc::new(upgrade)).await?;
    tracing::info!(
      "WebSocket server started on {} with path {}",
      server.local_addr(),
      path
    );
    Ok(WsServer { server, stopped })
  }

  /// The bound address.
  pub fn local_addr(&self) -> SocketAddr {
    self.server.local_addr()
  }

  /// Stops the server and all connections.
  pub async fn stop(&self, delay: Duration) {
    self.stopped.cancel();
    self.server.stop(delay).await;
    tracing::info!("WebSocket server stopped");
  }
}

/// HTTP handler performing the WebSocket handshake.
struct UpgradeHandler {
  path: String,
  fallback: Arc<dyn HttpHandler>,
  ws_handler: Arc<dyn WsHandler>,
  stopped: CancellationToken,
}

#[async_trait]
impl HttpHandler for UpgradeHandler {
  async fn handle(&self, exchange: &mut Exchange) -> Result<()> {
    let mut path = exchange
      .raw_path()
      .split('?')
      .next()
      .unwrap_or_default()
      .to_owned();
    if path == "/" {
      path = String::from("/index.html");
    }
    if exchange.method() != "GET" || path != self.path {
      return self.fallback.handle(exchange).await;
    }

    if exchange.request_headers().first("Upgrade") != Some("websocket") {
      return send_handshake_error(exchange, 400, "Invalid WebSocket upgrade request").await;
    }
    let sec_key = match exchange.request_headers().first("Sec-WebSocket-Key") {
      Some(key) if !key.is_empty() => key.to_owned(),
      _ => return send_handshake_error(exchange, 400, "Missing Sec-WebSocket-Key header").await,
    };

    let accept = accept_key(&sec_key);
    exchange.response_headers().set("Upgrade", "websocket")?;
    exchange
      .response_headers()
      .set("Connection", "keep-alive, Upgrade")?;
    exchange
      .response_headers()
      .set("Sec-WebSocket-Accept", accept)?;
    exchange.request_upgrade();
    exchange.send_response_headers(101, 0).await?;

    let (reader, writer) = exchange
      .take_raw_parts()
      .ok_or_else(|| Error::state("raw stream already taken"))?;
    let (outgoing_tx, mut outgoing_rx) = mpsc::channel(OUTGOING_QUEUE_SIZE);
    let conn = Arc::new(WsConnection {
      writer: Mutex::new(writer),
      outgoing: outgoing_tx,
      closed: AtomicBool::new(false),
    });
    let active = Arc::new(AtomicBool::new(true));
    tokio::spawn(receive_loop(
      reader,
      conn.clone(),
      self.ws_handler.clone(),
      self.stopped.clone(),
      active.clone(),
    ));

    while active.load(Ordering::SeqCst) {
      conn.send_outgoing_message(&mut outgoing_rx).await?;
    }
    // last outgoing message
    conn.send_outgoing_message(&mut outgoing_rx).await?;
    Ok(())
  }
}

async fn send_handshake_error(exchange: &mut Exchange, code: u16, message: &str) -> Result<()> {
  let body = format!("HTTP/1.1 {code} {message}\r\n\r\n");
  exchange.send_response_headers(code, body.len() as i64).await?;
  exchange.write_response_body(body.as_bytes()).await?;
  exchange.end_response_body().await
}

async fn receive_loop(
  mut reader: RawReader,
  conn: Arc<WsConnection>,
  handler: Arc<dyn WsHandler>,
  stopped: CancellationToken,
  active: Arc<AtomicBool>,
) {
  handler.on_open(&conn).await;
  let result = loop {
    if conn.is_closed() {
      break Ok(());
    }
    let message = tokio::select! {
      _ = stopped.cancelled() => break Err(Error::state("server has been stopped")),
      message = read_message(&mut reader, &conn) => message,
    };
    match message {
      Ok(Some(text)) => handler.on_message(&conn, text).await,
      Ok(None) => break Ok(()),
      Err(e) => break Err(e),
    }
  };
  if let Err(e) = result {
    handler.on_error(&conn, &e).await;
  }
  if let Err(e) = conn.close().await {
    handler.on_error(&conn, &e).await;
  }
  handler.on_close(&conn, 1000, "Normal closure").await;
  active.store(false, Ordering::SeqCst);
}

/// Reads frames until a text message arrives. Pings are answered with a
/// pong carrying the same payload; a close frame ends the stream.
async fn read_message(reader: &mut RawReader, conn: &WsConnection) -> Result<Option<String>> {
  loop {
    let frame = frame::read_frame(reader).await?;
    match frame.opcode {
      Opcode::Close => {
        conn.close().await?;
        return Ok(None);
      }
      Opcode::Ping => {
        conn.write_frame(Opcode::Pong, &frame.payload).await?;
      }
      Opcode::Pong => {}
      Opcode::Text => {
        return Ok(Some(String::from_utf8_lossy(&frame.payload).into_owned()));
      }
      other => {
        return Err(Error::protocol(format!(
          "unsupported opcode {}",
          other.bits()
        )))
      }
    }
  }
}

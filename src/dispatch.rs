//! Minimal HTTP/1.1 dispatch server with keep-alive and raw-socket upgrade.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::errors::{Error, Result};
use crate::exchange::{Exchange, RawReader, RawWriter};
use crate::headers::Headers;
use crate::text::latin1_decode;

/// Handler invoked for each parsed request.
#[async_trait]
pub trait HttpHandler: Send + Sync {
  /// Handles one exchange. Errors are answered with a best-effort `500`.
  async fn handle(&self, exchange: &mut Exchange) -> Result<()>;
}

/// Minimal HTTP/1.1 server: an accept loop plus one worker task per
/// connection, keep-alive by default, raw-socket escape for upgrades.
pub struct DispatchServer {
  local_addr: SocketAddr,
  running: Arc<AtomicBool>,
  shutdown: CancellationToken,
  force: CancellationToken,
}

impl DispatchServer {
  /// Binds `host:port` and starts accepting connections.
  pub async fn bind(
    host: &str,
    port: u16,
    handler: Arc<dyn HttpHandler>,
  ) -> Result<DispatchServer> {
    let listener = TcpListener::bind((host, port))
      .await
      .map_err(|e| Error::config(format!("failed to bind {host}:{port}: {e}")))?;
    let local_addr = listener.local_addr()?;
    let running = Arc::new(AtomicBool::new(true));
    let shutdown = CancellationToken::new();
    let force = CancellationToken::new();
    tracing::info!("HTTP-server started on {local_addr}");
    tokio::spawn(accept_loop(
      listener,
      handler,
      running.clone(),
      shutdown.clone(),
      force.clone(),
    ));
    Ok(Self {
      local_addr,
      running,
      shutdown,
      force,
    })
  }

  /// The bound address, useful after binding port 0.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Stops the server: clears the run flag, waits `delay`, closes the
  /// listener, waits another `delay`, then aborts the remaining workers.
  pub async fn stop(&self, delay: Duration) {
    self.running.store(false, Ordering::SeqCst);
    tracing::info!("stop server");
    if !delay.is_zero() {
      tokio::time::sleep(delay).await;
      tracing::info!("stop server-socket");
    }
    self.shutdown.cancel();
    tokio::time::sleep(delay).await;
    self.force.cancel();
  }
}

async fn accept_loop(
  listener: TcpListener,
  handler: Arc<dyn HttpHandler>,
  running: Arc<AtomicBool>,
  shutdown: CancellationToken,
  force: CancellationToken,
) {
  loop {
    tokio::select! {
      _ = shutdown.cancelled() => break,
      accepted = listener.accept() => match accepted {
        Ok((mut stream, _peer)) => {
          if !running.load(Ordering::SeqCst) {
            let _ = stream
              .write_all(b"HTTP/1.1 500 server has been stopped\r\n\r\n")
              .await;
            break;
          }
          let handler = handler.clone();
          let running = running.clone();
          let force = force.clone();
          tokio::spawn(async move {
            tokio::select! {
              _ = force.cancelled() => {}
              _ = serve_connection(stream, handler, running) => {}
            }
          });
        }
        Err(e) => {
          if running.load(Ordering::SeqCst) {
            tracing::warn!("error accepting connection: {e}");
          }
        }
      }
    }
  }
  tracing::info!("accept loop has been stopped");
}

async fn serve_connection(
  stream: TcpStream,
  handler: Arc<dyn HttpHandler>,
  running: Arc<AtomicBool>,
) {
  let (read_half, write_half) = stream.into_split();
  let mut io = Some((BufReader::new(read_half), BufWriter::new(write_half)));
  while running.load(Ordering::SeqCst) {
    let Some((reader, writer)) = io.take() else {
      break;
    };
    match serve_request(reader, writer, &*handler).await {
      Ok(Some(parts)) => io = Some(parts),
      Ok(None) => break,
      Err(e) => {
        tracing::error!("error handling HTTP request: {e}");
        break;
      }
    }
  }
}

/// Serves one request. Returns the socket halves when the connection
/// should continue with another request.
async fn serve_request(
  mut reader: RawReader,
  mut writer: RawWriter,
  handler: &dyn HttpHandler,
) -> Result<Option<(RawReader, RawWriter)>> {
  let request_line = match read_crlf_line(&mut reader).await? {
    None => return Ok(None),
    Some(line) if line.is_empty() => return Ok(None),
    Some(line) => line,
  };
  let parts: Vec<&str> = request_line.split_whitespace().collect();
  if parts.len() != 3 {
    tracing::warn!("invalid request line: {request_line}");
    send_bad_request(&mut writer).await.ok();
    return Ok(None);
  }
  let method = parts[0].to_owned();
  let raw_path = parts[1].to_owned();
  let protocol = parts[2].to_owned();

  let headers = parse_headers(&mut reader).await?;
  let keep_alive = protocol == "HTTP/1.1"
    && !headers
      .first("Connection")
      .is_some_and(|v| v.eq_ignore_ascii_case("close"));

  let mut exchange = Exchange::new(
    reader, writer, method, raw_path, protocol, headers, keep_alive,
  );
  if let Err(e) = handler.handle(&mut exchange).await {
    tracing::error!("error in handler: {e}");
    if let Err(e) = exchange.send_response_headers(500, -1).await {
      tracing::debug!("could not send error response: {e}");
    }
  }
  let upgraded = exchange.upgrade_requested();

  match exchange.into_parts() {
    // The raw stream was stolen by an upgrade handler.
    None => Ok(None),
    Some((reader, mut writer)) => {
      if writer.flush().await.is_err() {
        return Ok(None);
      }
      if keep_alive && !upgraded {
        Ok(Some((reader, writer)))
      } else {
        Ok(None)
      }
    }
  }
}

async fn parse_headers(reader: &mut RawReader) -> Result<Headers> {
  let mut headers = Headers::new();
  loop {
    let line = match read_crlf_line(reader).await? {
      None => break,
      Some(line) if line.is_empty() => break,
      Some(line) => line,
    };
    let Some(colon) = line.find(':') else {
      continue;
    };
    if colon == 0 {
      continue;
    }
    let (name, value) = line.split_at(colon);
    if let Err(e) = headers.add(name.trim(), value[1..].trim()) {
      tracing::debug!("skipping invalid header line {line:?}: {e}");
    }
  }
  Ok(headers.into_read_only())
}

async fn send_bad_request(writer: &mut RawWriter) -> Result<()> {
  writer
    .write_all(b"HTTP/1.1 400 Bad Request\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
    .await?;
  writer.flush().await?;
  Ok(())
}

/// Reads one CRLF-terminated line as ISO-8859-1 text, without the
/// terminator. `None` on end of stream.
pub(crate) async fn read_crlf_line<R>(reader: &mut R) -> std::io::Result<Option<String>>
where
  R: AsyncBufRead + Unpin,
{
  let mut buf = Vec::new();
  let n = reader.read_until(b'\n', &mut buf).await?;
  if n == 0 {
    return Ok(None);
  }
  if buf.ends_with(b"\n") {
    buf.pop();
    if buf.ends_with(b"\r") {
      buf.pop();
    }
  }
  Ok(Some(latin1_decode(&buf)))
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  #[tokio::test]
  async fn read_crlf_line_strips_terminator() {
    let mut cursor = Cursor::new(b"GET / HTTP/1.1\r\nHost: x\r\n\r\n".to_vec());
    assert_eq!(
      read_crlf_line(&mut cursor).await.unwrap().as_deref(),
      Some("GET / HTTP/1.1")
    );
    assert_eq!(
      read_crlf_line(&mut cursor).await.unwrap().as_deref(),
      Some("Host: x")
    );
    assert_eq!(read_crlf_line(&mut cursor).await.unwrap().as_deref(), Some(""));
    assert_eq!(read_crlf_line(&mut cursor).await.unwrap(), None);
  }
}

//! WebSocket client half (RFC 6455, partial).

use std::collections::HashMap;

use base64::prelude::BASE64_STANDARD;
use base64::Engine;
use rand::Rng;
use tokio::io::{AsyncWriteExt, BufReader};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;

use crate::dispatch::read_crlf_line;
use crate::errors::{Error, Result};
use crate::ws::frame::{self, accept_key, Opcode};

/// Client side of a WebSocket connection.
///
/// Outgoing data frames are text frames masked with a 4-byte key chosen
/// once per client. Incoming frames are limited to text, ping, pong and
/// close; a binary data frame is treated as a protocol error (a known
/// divergence from RFC 6455).
pub struct WsClient {
  reader: BufReader<OwnedReadHalf>,
  writer: OwnedWriteHalf,
  mask_key: [u8; 4],
  closed: bool,
}

impl WsClient {
  /// Dials `host:port` and performs the opening handshake on `path`.
  ///
  /// The handshake fails when the server answers anything but `101` (the
  /// response body is included in the error) or when the returned
  /// `Sec-WebSocket-Accept` is not exactly the locally computed value.
  pub async fn connect(host: &str, port: u16, path: &str, origin: &str) -> Result<WsClient> {
    let stream = TcpStream::connect((host, port)).await?;
    let (read_half, mut writer) = stream.into_split();
    let mut reader = BufReader::new(read_half);

    let key_bytes: [u8; 16] = rand::rng().random();
    let sec_key = BASE64_STANDARD.encode(key_bytes);
    let mut request = format!("GET {path} HTTP/1.1\r\n");
    push_header(&mut request, "Host", &format!("{host}:{port}"));
    push_header(&mut request, "Upgrade", "websocket");
    push_header(&mut request, "Connection", "keep-alive, Upgrade");
    push_header(&mut request, "Sec-WebSocket-Version", "13");
    push_header(&mut request, "Sec-WebSocket-Key", &sec_key);
    push_header(&mut request, "Origin", origin);
    request.push_str("\r\n");
    writer.write_all(request.as_bytes()).await?;
    writer.flush().await?;

    let status_line = read_crlf_line(&mut reader)
      .await?
      .ok_or_else(|| Error::protocol("no status line received from server"))?;
    let mut parts = status_line.split_whitespace();
    let (_protocol, code, reason) = match (parts.next(), parts.next(), parts.next()) {
      (Some(p), Some(c), Some(r)) => (p, c, r),
      _ => {
        return Err(Error::protocol(format!(
          "invalid status line: {status_line}"
        )))
      }
    };
    let status_code: u16 = code
      .parse()
      .map_err(|_| Error::protocol(format!("invalid status line: {status_line}")))?;
    tracing::debug!("websocket handshake status line: {status_line}");

    if status_code != 101 {
      let _headers = read_response_headers(&mut reader).await?;
      let mut body = String::new();
      while let Some(line) = read_crlf_line(&mut reader).await? {
        body.push_str(&line);
        body.push('\n');
      }
      return Err(Error::protocol(format!(
        "websocket handshake failed: HTTP {status_code} {reason}\n{body}"
      )));
    }

    let headers = read_response_headers(&mut reader).await?;
    match headers.get("sec-websocket-accept") {
      Some(returned) if *returned == accept_key(&sec_key) => {}
      other => {
        return Err(Error::protocol(format!(
          "websocket handshake failed: invalid Sec-WebSocket-Accept header: {other:?}"
        )))
      }
    }

    Ok(WsClient {
      reader,
      writer,
      mask_key: rand::rng().random(),
      closed: false,
    })
  }

  /// Sends `payload` as a masked text frame.
  pub async fn send(&mut self, payload: &[u8]) -> Result<()> {
    if self.closed {
      return Err(Error::state("websocket is closed"));
    }
    frame::write_frame(&mut self.writer, Opcode::Text, payload, Some(self.mask_key)).await
  }

  /// Reads the next text payload, answering pings along the way.
  ///
  /// Returns `None` once the server sent a close frame.
  pub async fn read(&mut self) -> Result<Option<Vec<u8>>> {
    loop {
      let frame = frame::read_frame(&mut self.reader).await?;
      match frame.opcode {
        Opcode::Close => {
          self.close().await?;
          return Ok(None);
        }
        Opcode::Ping => {
          frame::write_frame(&mut self.writer, Opcode::Pong, &frame.payload, None).await?;
        }
        Opcode::Pong => {}
        Opcode::Text => return Ok(Some(frame.payload)),
        other => {
          return Err(Error::protocol(format!(
            "unsupported opcode {}",
            other.bits()
          )))
        }
      }
    }
  }

  /// Sends a close frame and shuts the connection down.
  pub async fn close(&mut self) -> Result<()> {
    if self.closed {
      return Ok(());
    }
    self.closed = true;
    if let Err(e) = frame::write_frame(&mut self.writer, Opcode::Close, &[], None).await {
      tracing::debug!("error sending close frame: {e}");
    }
    self.writer.shutdown().await.ok();
    Ok(())
  }
}

fn push_header(request: &mut String, name: &str, value: &str) {
  request.push_str(name);
  request.push_str(": ");
  request.push_str(value);
  request.push_str("\r\n");
}

async fn read_response_headers(
  reader: &mut BufReader<OwnedReadHalf>,
) -> Result<HashMap<String, String>> {
  let mut headers = HashMap::new();
  loop {
    let line = match read_crlf_line(reader).await? {
      None => break,
      Some(line) if line.is_empty() => break,
      Some(line) => line,
    };
    if let Some((name, value)) = line.split_once(':') {
      // Header names are looked up case-insensitively; servers differ in
      // the casing they emit.
      headers.insert(name.trim().to_ascii_lowercase(), value.trim().to_owned());
    }
  }
  Ok(headers)
}

//! A single HTTP request/response exchange.

use tokio::io::{AsyncReadExt, AsyncWriteExt, BufReader, BufWriter};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};

use crate::errors::{Error, Result};
use crate::headers::Headers;

/// Buffered halves of the client socket, returned to the worker after the
/// handler ran or stolen by an upgrade handler.
pub(crate) type RawReader = BufReader<OwnedReadHalf>;
pub(crate) type RawWriter = BufWriter<OwnedWriteHalf>;

/// One HTTP request/response exchange.
///
/// Exposes the parsed request line, the read-only request headers and a
/// body reader, plus mutable response headers and a body writer. An
/// upgrade handler can steal the raw socket halves with
/// [`take_raw_parts`](Exchange::take_raw_parts), after which the worker
/// stops serving the connection.
pub struct Exchange {
  reader: Option<RawReader>,
  writer: Option<RawWriter>,
  method: String,
  raw_path: String,
  protocol: String,
  request_headers: Headers,
  response_headers: Headers,
  keep_alive: bool,
  response_headers_sent: bool,
  upgrade_requested: bool,
  response_chunked: bool,
}

impl Exchange {
  pub(crate) fn new(
    reader: RawReader,
    writer: RawWriter,
    method: String,
    raw_path: String,
    protocol: String,
    request_headers: Headers,
    keep_alive: bool,
  ) -> Self {
    Self {
      reader: Some(reader),
      writer: Some(writer),
      method,
      raw_path,
      protocol,
      request_headers,
      response_headers: Headers::new(),
      keep_alive,
      response_headers_sent: false,
      upgrade_requested: false,
      response_chunked: false,
    }
  }

  /// The HTTP method, e.g. `GET`.
  pub fn method(&self) -> &str {
    &self.method
  }

  /// The raw request path, including any query string.
  pub fn raw_path(&self) -> &str {
    &self.raw_path
  }

  /// The protocol token of the request line, e.g. `HTTP/1.1`.
  pub fn protocol(&self) -> &str {
    &self.protocol
  }

  /// Whether the connection is kept alive after this exchange.
  pub fn keep_alive(&self) -> bool {
    self.keep_alive
  }

  /// The parsed request headers (read-only).
  pub fn request_headers(&self) -> &Headers {
    &self.request_headers
  }

  /// The response headers, writable until they are sent.
  pub fn response_headers(&mut self) -> &mut Headers {
    &mut self.response_headers
  }

  /// Reads the request body.
  ///
  /// Honors `Transfer-Encoding: chunked` with standard hex-length framing,
  /// otherwise reads exactly `Content-Length` bytes; without either the
  /// body is empty.
  pub async fn read_request_body(&mut self) -> Result<Vec<u8>> {
    let chunked = self
      .request_headers
      .first("Transfer-Encoding")
      .is_some_and(|v| v.eq_ignore_ascii_case("chunked"));
    let reader = self
      .reader
      .as_mut()
      .ok_or_else(|| Error::state("raw stream has been taken"))?;
    if chunked {
      return read_chunked_body(reader).await;
    }
    let length = match self.request_headers.first("Content-Length") {
      Some(value) => value
        .trim()
        .parse::<usize>()
        .map_err(|_| Error::protocol(format!("invalid Content-Length: {value}")))?,
      None => return Ok(Vec::new()),
    };
    let mut body = vec![0u8; length];
    reader.read_exact(&mut body).await?;
    Ok(body)
  }

  /// Sends the status line and all response headers.
  ///
  /// `content_length` selects the framing of the body: a positive value
  /// emits `Content-Length`, anything else selects chunked transfer
  /// encoding except for status 204 and 304. Status 101 writes no default
  /// headers at all; the socket is expected to be stolen by the handler.
  /// Calling this twice is a state error.
  pub async fn send_response_headers(&mut self, status_code: u16, content_length: i64) -> Result<()> {
    if self.response_headers_sent {
      return Err(Error::state("response headers already sent"));
    }
    let status_message = match status_code {
      101 => "Upgrade to WebSocket-Connection",
      200 => "OK",
      400 => "Bad Request",
      404 => "Not Found",
      500 => "Internal Server Error",
      _ => "Unknown",
    };

    if status_code != 101 {
      if !self.response_headers.contains("Connection") {
        let value = if self.keep_alive { "keep-alive" } else { "close" };
        self.response_headers.set("Connection", value)?;
      }
      if content_length > 0 {
        self
          .response_headers
          .set("Content-Length", content_length.to_string())?;
      } else if status_code != 204 && status_code != 304 {
        self.response_headers.set("Transfer-Encoding", "chunked")?;
        self.response_chunked = true;
      }
    }

    let writer = self
      .writer
      .as_mut()
      .ok_or_else(|| Error::state("raw stream has been taken"))?;
    let status_line = format!("{} {} {}\r\n", self.protocol, status_code, status_message);
    writer.write_all(status_line.as_bytes()).await?;
    for (key, values) in self.response_headers.iter() {
      for value in values {
        let header_line = format!("{key}: {value}\r\n");
        writer.write_all(header_line.as_bytes()).await?;
      }
    }
    writer.write_all(b"\r\n").await?;
    writer.flush().await?;

    self.response_headers_sent = true;
    Ok(())
  }

  /// Writes a piece of the response body, using chunked framing when the
  /// response was declared chunked. A state error before
  /// [`send_response_headers`](Exchange::send_response_headers).
  pub async fn write_response_body(&mut self, data: &[u8]) -> Result<()> {
    if !self.response_headers_sent {
      return Err(Error::state("response headers not sent yet"));
    }
    let writer = self
      .writer
      .as_mut()
      .ok_or_else(|| Error::state("raw stream has been taken"))?;
    if self.response_chunked {
      if data.is_empty() {
        return Ok(());
      }
      writer.write_all(format!("{:X}\r\n", data.len()).as_bytes()).await?;
      writer.write_all(data).await?;
      writer.write_all(b"\r\n").await?;
    } else {
      writer.write_all(data).await?;
    }
    Ok(())
  }

  /// Terminates a chunked response body with the final zero-length chunk.
  pub async fn end_response_body(&mut self) -> Result<()> {
    if !self.response_headers_sent {
      return Err(Error::state("response headers not sent yet"));
    }
    let writer = self
      .writer
      .as_mut()
      .ok_or_else(|| Error::state("raw stream has been taken"))?;
    if self.response_chunked {
      writer.write_all(b"0\r\n\r\n").await?;
    }
    writer.flush().await?;
    Ok(())
  }

  /// Latches the upgrade flag; the worker will stop serving further
  /// requests on this connection once the handler returns.
  pub fn request_upgrade(&mut self) {
    self.upgrade_requested = true;
  }

  /// Whether a protocol upgrade was requested.
  pub fn upgrade_requested(&self) -> bool {
    self.upgrade_requested
  }

  /// Steals the buffered socket halves for a protocol upgrade. Subsequent
  /// body operations on the exchange fail with a state error.
  pub fn take_raw_parts(&mut self) -> Option<(RawReader, RawWriter)> {
    match (self.reader.take(), self.writer.take()) {
      (Some(reader), Some(writer)) => Some((reader, writer)),
      _ => None,
    }
  }

  pub(crate) fn into_parts(self) -> Option<(RawReader, RawWriter)> {
    match (self.reader, self.writer) {
      (Some(reader), Some(writer)) => Some((reader, writer)),
      _ => None,
    }
  }
}

async fn read_chunked_body(reader: &mut RawReader) -> Result<Vec<u8>> {
  let mut body = Vec::new();
  loop {
    let line = crate::dispatch::read_crlf_line(reader)
      .await?
      .ok_or_else(|| Error::protocol("unexpected end of stream in chunked body"))?;
    let size_token = line.split(';').next().unwrap_or_default().trim();
    let size = usize::from_str_radix(size_token, 16)
      .map_err(|_| Error::protocol(format!("invalid chunk size: {line}")))?;
    if size == 0 {
      // Trailer section is not supported; expect the terminating CRLF.
      crate::dispatch::read_crlf_line(reader).await?;
      return Ok(body);
    }
    let mut chunk = vec![0u8; size];
    reader.read_exact(&mut chunk).await?;
    body.extend_from_slice(&chunk);
    // CRLF after the chunk data.
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
  }
}

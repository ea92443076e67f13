//! A reader that serves a byte prefix before its inner stream.

use std::pin::Pin;
use std::task::{Context, Poll};

use bytes::Bytes;
use tokio::io::{AsyncRead, ReadBuf};

/// Splices a pre-read byte prefix in front of an underlying reader.
///
/// Reads drain the prefix first and then fall through to the inner reader.
/// A read that straddles the boundary returns only the remaining prefix
/// portion in that call, never a mix of prefix and inner bytes. No
/// buffering happens beyond the supplied prefix.
pub struct PrefixedReader<R> {
  prefix: Bytes,
  inner: R,
}

impl<R: AsyncRead + Unpin> PrefixedReader<R> {
  /// Wraps `inner`, serving `prefix` first.
  pub fn new(prefix: impl Into<Bytes>, inner: R) -> Self {
    Self {
      prefix: prefix.into(),
      inner,
    }
  }
}

impl<R: AsyncRead + Unpin> AsyncRead for PrefixedReader<R> {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    let this = self.get_mut();
    if !this.prefix.is_empty() {
      let n = this.prefix.len().min(buf.remaining());
      let chunk = this.prefix.split_to(n);
      buf.put_slice(&chunk);
      return Poll::Ready(Ok(()));
    }
    Pin::new(&mut this.inner).poll_read(cx, buf)
  }
}

//! Content-Length fixup for rewritten HTTP messages.

use crate::logsink::LogSink;

/// Parsed view of an HTTP message head co-present with the start of its
/// body in one buffer.
struct HeadView<'a> {
  lines: Vec<&'a str>,
  cl_index: usize,
  cl_value: u64,
  body: &'a str,
}

fn parse_head(message: &str) -> Option<HeadView<'_>> {
  let (head, body) = message.split_once("\r\n\r\n")?;
  let lines: Vec<&str> = head.split("\r\n").collect();
  let cl_index = lines.iter().position(|line| {
    line
      .get(..15)
      .is_some_and(|prefix| prefix.eq_ignore_ascii_case("content-length:"))
  })?;
  let cl_value = lines[cl_index][15..].trim().parse::<u64>().ok()?;
  Some(HeadView {
    lines,
    cl_index,
    cl_value,
    body,
  })
}

/// Recomputes the `Content-Length` header of a rewritten HTTP message.
///
/// `orig` is the message as received, `modified` the message after the
/// search/replace rules ran. When the original buffer holds the complete
/// body (declared length equals the actual UTF-8 byte count), the modified
/// message is returned with its `Content-Length` line rewritten to match
/// the new body length, and one `Content-Length adjusted from X to Y` line
/// is emitted. In every soft-failure case (no `HTTP/1.` token, no double
/// CRLF, no or malformed `Content-Length` header, partial body) `modified`
/// is returned unchanged.
///
/// The rewritten header name is canonicalised to `Content-Length` even
/// when the input used a different case.
pub fn adjust_content_length(orig: &str, modified: &str, log: &LogSink) -> String {
  if !orig.contains("HTTP/1.") {
    return modified.to_owned();
  }
  let (orig_view, modified_view) = match (parse_head(orig), parse_head(modified)) {
    (Some(o), Some(m)) => (o, m),
    _ => return modified.to_owned(),
  };
  // Body lengths are measured in UTF-8 bytes, the convention the header
  // describes.
  let orig_body_len = orig_view.body.len() as u64;
  if orig_view.cl_value != orig_body_len {
    // The original buffer does not contain the full body; adjusting from a
    // partial view would produce a wrong length.
    return modified.to_owned();
  }
  let new_cl = orig_view.cl_value + modified_view.body.len() as u64 - orig_body_len;
  let old_cl = modified_view.cl_value;
  let mut lines: Vec<String> = modified_view.lines.iter().map(|s| (*s).to_owned()).collect();
  lines[modified_view.cl_index] = format!("Content-Length: {new_cl}");
  let mut out = lines.join("\r\n");
  out.push_str("\r\n\r\n");
  out.push_str(modified_view.body);
  log.emit(format!("Content-Length adjusted from {old_cl} to {new_cl}"));
  out
}

#[cfg(test)]
mod tests {
  use super::*;

  fn quiet() -> LogSink {
    LogSink::new(|_| {})
  }

  #[test]
  fn grows_body() {
    let orig = "POST /data HTTP/1.1\r\nContent-Length: 5\r\n\r\nL/B/C";
    let modified = "POST /data HTTP/1.1\r\nContent-Length: 5\r\n\r\nLongBodyContent";
    let expected = "POST /data HTTP/1.1\r\nContent-Length: 15\r\n\r\nLongBodyContent";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), expected);
  }

  #[test]
  fn shrinks_body() {
    let orig = "PUT /update HTTP/1.1\r\nContent-Length: 15\r\n\r\nShort         !";
    let modified = "PUT /update HTTP/1.1\r\nContent-Length: 15\r\n\r\nShort";
    let expected = "PUT /update HTTP/1.1\r\nContent-Length: 5\r\n\r\nShort";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), expected);
  }

  #[test]
  fn counts_utf8_bytes_not_characters() {
    let orig = "GET /utf HTTP/1.1\r\nContent-Length: 7\r\n\r\nKarotte";
    let modified = "GET /utf HTTP/1.1\r\nContent-Length: 7\r\n\r\nMöhre";
    // "Möhre" is five code points but six UTF-8 bytes.
    let expected = "GET /utf HTTP/1.1\r\nContent-Length: 6\r\n\r\nMöhre";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), expected);
  }

  #[test]
  fn body_with_linebreaks() {
    let orig = "PUT /update HTTP/1.1\r\nContent-Length: 15\r\n\r\nShort\nLong\r\nEnd";
    let modified = "PUT /update HTTP/1.1\r\nContent-Length: 15\r\n\r\nShort\r\nEnd";
    let expected = "PUT /update HTTP/1.1\r\nContent-Length: 10\r\n\r\nShort\r\nEnd";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), expected);
  }

  #[test]
  fn no_header_is_identity() {
    let orig = "GET /noheader HTTP/1.1\r\nConnection: close\r\n\r\nSomeBody";
    let modified = "GET /noheader HTTP/1.1\r\nConnection: close\r\n\r\nOtherBody";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), modified);
  }

  #[test]
  fn malformed_value_is_identity() {
    let orig = "GET /badvalue HTTP/1.1\r\nContent-Length: invalid\r\n\r\nSomeBody";
    assert_eq!(adjust_content_length(orig, orig, &quiet()), orig);
  }

  #[test]
  fn partial_body_is_left_alone() {
    // Declared length 20, only 5 bytes present: the buffer is a partial
    // view and must pass through untouched.
    let orig = "PUT /update HTTP/1.1\r\nContent-Length: 20\r\n\r\nShort";
    let modified = "PUT /update HTTP/1.1\r\nContent-Length: 20\r\n\r\nShorter";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), modified);
  }

  #[test]
  fn empty_body_is_identity() {
    let orig = "GET /empty HTTP/1.1\r\nContent-Length: 0\r\n\r\n";
    assert_eq!(adjust_content_length(orig, orig, &quiet()), orig);
  }

  #[test]
  fn no_crlf_structure_is_identity() {
    let orig = "Invalid message with no CRLF";
    assert_eq!(adjust_content_length(orig, orig, &quiet()), orig);
  }

  #[test]
  fn not_http_is_identity() {
    let orig = "PING\r\nContent-Length: 4\r\n\r\nbody";
    let modified = "PING\r\nContent-Length: 4\r\n\r\nlonger body";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), modified);
  }

  #[test]
  fn lowercase_header_is_detected_and_canonicalised() {
    let orig = "POST /lowercase HTTP/1.1\r\ncontent-length: 3\r\n\r\nAAA";
    let modified = "POST /lowercase HTTP/1.1\r\ncontent-length: 3\r\n\r\nAAAB";
    let expected = "POST /lowercase HTTP/1.1\r\nContent-Length: 4\r\n\r\nAAAB";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), expected);
  }

  #[test]
  fn other_headers_are_preserved() {
    let orig =
      "PUT /multi HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 4\r\nX-Custom: test\r\n\r\nTest";
    let modified =
      "PUT /multi HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 4\r\nX-Custom: test\r\n\r\nTests";
    let expected =
      "PUT /multi HTTP/1.1\r\nContent-Type: text/plain\r\nContent-Length: 5\r\nX-Custom: test\r\n\r\nTests";
    assert_eq!(adjust_content_length(orig, modified, &quiet()), expected);
  }

  #[test]
  fn identical_strings_recompute_deterministically() {
    let message = "POST /same HTTP/1.1\r\ncontent-length: 4\r\n\r\nSame";
    // Even without a length change the header line is rewritten in
    // canonical form.
    let expected = "POST /same HTTP/1.1\r\nContent-Length: 4\r\n\r\nSame";
    assert_eq!(adjust_content_length(message, message, &quiet()), expected);
  }

  #[test]
  fn adjustment_is_logged() {
    let lines = std::sync::Arc::new(std::sync::Mutex::new(Vec::new()));
    let collected = lines.clone();
    let sink = LogSink::new(move |line| collected.lock().unwrap().push(line));
    let orig = "POST /d HTTP/1.1\r\nContent-Length: 2\r\n\r\nab";
    let modified = "POST /d HTTP/1.1\r\nContent-Length: 2\r\n\r\nabcd";
    adjust_content_length(orig, modified, &sink);
    assert_eq!(
      *lines.lock().unwrap(),
      vec!["Content-Length adjusted from 2 to 4"]
    );
  }
}

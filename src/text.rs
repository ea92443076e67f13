//! Byte-transparent text helpers.
//!
//! Relayed chunks round-trip through ISO-8859-1 so that arbitrary bytes
//! survive a text-level replace; the escape helper renders them for logs.

/// Decodes bytes as ISO-8859-1, one char per byte.
pub(crate) fn latin1_decode(bytes: &[u8]) -> String {
  bytes.iter().map(|&b| char::from(b)).collect()
}

/// Encodes text as ISO-8859-1. Characters outside the range are replaced
/// with `?`, which only happens when a replacement rule introduced them.
pub(crate) fn latin1_encode(text: &str) -> Vec<u8> {
  text
    .chars()
    .map(|c| if (c as u32) <= 0xFF { c as u8 } else { b'?' })
    .collect()
}

/// Escapes control and non-printable characters for one-line log output.
pub(crate) fn escape_content(content: &str) -> String {
  let mut escaped = String::with_capacity(content.len());
  for c in content.chars() {
    match c {
      '\n' => escaped.push_str("\\n"),
      '\t' => escaped.push_str("\\t"),
      '\r' => escaped.push_str("\\r"),
      '\\' => escaped.push_str("\\\\"),
      c if (c as u32) < 32 || (c as u32) > 126 => {
        escaped.push_str(&format!("\\u{:04X}", c as u32));
      }
      c => escaped.push(c),
    }
  }
  escaped
}

//! RFC 6455 frame codec shared by the client and server halves.

use bytes::{BufMut, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::errors::{Error, Result};

/// GUID appended to the client key when computing `Sec-WebSocket-Accept`.
pub(crate) const WEBSOCKET_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

pub(crate) const FIN_BIT: u8 = 0x80;
pub(crate) const MASK_BIT: u8 = 0x80;

/// Frame opcode, the low nibble of the first header byte.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
  /// Continuation of a fragmented message (unsupported here).
  Continuation,
  /// UTF-8 text payload.
  Text,
  /// Binary payload.
  Binary,
  /// Close control frame.
  Close,
  /// Ping control frame.
  Ping,
  /// Pong control frame.
  Pong,
}

impl Opcode {
  pub(crate) fn from_bits(bits: u8) -> Result<Self> {
    match bits {
      0x0 => Ok(Opcode::Continuation),
      0x1 => Ok(Opcode::Text),
      0x2 => Ok(Opcode::Binary),
      0x8 => Ok(Opcode::Close),
      0x9 => Ok(Opcode::Ping),
      0xA => Ok(Opcode::Pong),
      other => Err(Error::protocol(format!("unsupported opcode {other}"))),
    }
  }

  pub(crate) fn bits(self) -> u8 {
    match self {
      Opcode::Continuation => 0x0,
      Opcode::Text => 0x1,
      Opcode::Binary => 0x2,
      Opcode::Close => 0x8,
      Opcode::Ping => 0x9,
      Opcode::Pong => 0xA,
    }
  }
}

/// One decoded frame.
#[derive(Debug)]
pub struct Frame {
  /// The frame's opcode.
  pub opcode: Opcode,
  /// The unmasked payload.
  pub payload: Vec<u8>,
  /// Whether the wire frame carried a mask.
  pub masked: bool,
}

/// Writes one frame with the FIN bit set and flushes.
///
/// Client writers pass their mask key, server writers pass `None`. The
/// payload length is encoded as 7-bit, 126+u16 or 127+u64, network order.
pub(crate) async fn write_frame<W>(
  writer: &mut W,
  opcode: Opcode,
  payload: &[u8],
  mask: Option<[u8; 4]>,
) -> Result<()>
where
  W: AsyncWrite + Unpin,
{
  let mut frame = BytesMut::with_capacity(payload.len() + 14);
  frame.put_u8(FIN_BIT | opcode.bits());
  let mask_bit = if mask.is_some() { MASK_BIT } else { 0 };
  let len = payload.len();
  if len < 126 {
    frame.put_u8(mask_bit | len as u8);
  } else if len <= 0xFFFF {
    frame.put_u8(mask_bit | 126);
    frame.put_u16(len as u16);
  } else {
    frame.put_u8(mask_bit | 127);
    frame.put_u64(len as u64);
  }
  match mask {
    Some(key) => {
      frame.put_slice(&key);
      for (i, b) in payload.iter().enumerate() {
        frame.put_u8(b ^ key[i % 4]);
      }
    }
    None => frame.put_slice(payload),
  }
  writer.write_all(&frame).await?;
  writer.flush().await?;
  Ok(())
}

/// Reads one raw frame, unmasking the payload when a mask key is present.
/// Control-frame handling is left to the caller.
pub(crate) async fn read_frame<R>(reader: &mut R) -> Result<Frame>
where
  R: AsyncRead + Unpin,
{
  let mut head = [0u8; 2];
  reader.read_exact(&mut head).await?;
  let opcode = Opcode::from_bits(head[0] & 0x0F)?;
  let masked = head[1] & MASK_BIT != 0;
  let mut len = u64::from(head[1] & 0x7F);
  if len == 126 {
    let mut ext = [0u8; 2];
    reader.read_exact(&mut ext).await?;
    len = u64::from(u16::from_be_bytes(ext));
  } else if len == 127 {
    let mut ext = [0u8; 8];
    reader.read_exact(&mut ext).await?;
    len = u64::from_be_bytes(ext);
  }
  let mut key = [0u8; 4];
  if masked {
    reader.read_exact(&mut key).await?;
  }
  let mut payload = vec![0u8; len as usize];
  reader.read_exact(&mut payload).await?;
  if masked {
    for (i, b) in payload.iter_mut().enumerate() {
      *b ^= key[i % 4];
    }
  }
  Ok(Frame {
    opcode,
    payload,
    masked,
  })
}

/// Computes the `Sec-WebSocket-Accept` value for a client key:
/// `base64(sha1(key + GUID))`.
pub fn accept_key(sec_websocket_key: &str) -> String {
  use base64::prelude::BASE64_STANDARD;
  use base64::Engine;
  use sha1::{Digest, Sha1};

  let mut hasher = Sha1::new();
  hasher.update(sec_websocket_key.as_bytes());
  hasher.update(WEBSOCKET_GUID.as_bytes());
  BASE64_STANDARD.encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Cursor;

  async fn encode(opcode: Opcode, payload: &[u8], mask: Option<[u8; 4]>) -> Vec<u8> {
    let mut wire = Cursor::new(Vec::new());
    write_frame(&mut wire, opcode, payload, mask).await.unwrap();
    wire.into_inner()
  }

  async fn round_trip(payload: &[u8], mask: Option<[u8; 4]>) -> Frame {
    let wire = encode(Opcode::Text, payload, mask).await;
    let mut cursor = Cursor::new(wire);
    read_frame(&mut cursor).await.unwrap()
  }

  #[tokio::test]
  async fn masked_round_trip() {
    let payload = b"Hallo".to_vec();
    let frame = round_trip(&payload, Some([0x12, 0x34, 0x56, 0x78])).await;
    assert_eq!(frame.opcode, Opcode::Text);
    assert!(frame.masked);
    assert_eq!(frame.payload, payload);
  }

  #[tokio::test]
  async fn unmasked_round_trip() {
    let payload = b"Hallo".to_vec();
    let frame = round_trip(&payload, None).await;
    assert!(!frame.masked);
    assert_eq!(frame.payload, payload);
  }

  #[tokio::test]
  async fn medium_length_uses_sixteen_bit_field() {
    let payload = vec![0xAB; 126];
    let wire = encode(Opcode::Binary, &payload, None).await;
    assert_eq!(wire[1], 126);
    assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 126);
    let mut cursor = Cursor::new(wire);
    let frame = read_frame(&mut cursor).await.unwrap();
    assert_eq!(frame.payload, payload);
  }

  #[tokio::test]
  async fn long_length_uses_sixty_four_bit_field() {
    let payload = vec![0x42; 0x1_0000];
    let wire = encode(Opcode::Binary, &payload, Some([1, 2, 3, 4])).await;
    assert_eq!(wire[1] & 0x7F, 127);
    let mut cursor = Cursor::new(wire);
    let frame = read_frame(&mut cursor).await.unwrap();
    assert_eq!(frame.payload.len(), 0x1_0000);
    assert_eq!(frame.payload, payload);
  }

  #[tokio::test]
  async fn fin_bit_is_always_set() {
    let wire = encode(Opcode::Text, b"x", None).await;
    assert_eq!(wire[0], FIN_BIT | 0x1);
  }

  #[tokio::test]
  async fn unknown_opcode_is_rejected() {
    let wire = vec![FIN_BIT | 0x3, 0x00];
    let mut cursor = Cursor::new(wire);
    assert!(read_frame(&mut cursor).await.is_err());
  }

  #[test]
  fn accept_key_matches_rfc_sample() {
    // The handshake example from RFC 6455 section 1.3.
    assert_eq!(
      accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
      "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
    );
  }
}

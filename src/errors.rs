//! engine error
use thiserror::Error as ThisError;

/// A `Result` alias where the `Err` case is `wiretap::Error`.
pub type Result<T> = std::result::Result<T, Error>;

/// The errors that may occur while proxying, parsing or framing.
#[derive(ThisError, Debug)]
pub enum Error {
  /// I/O failure on a socket or stream.
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// TLS failure while dialing an upstream.
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// A peer violated the HTTP or WebSocket protocol.
  #[error("protocol violation: {0}")]
  Protocol(String),
  /// An operation was invoked in an illegal state.
  #[error("illegal state: {0}")]
  State(String),
  /// Invalid configuration at startup.
  #[error("configuration error: {0}")]
  Config(String),
}

impl Error {
  pub(crate) fn protocol(msg: impl Into<String>) -> Self {
    Error::Protocol(msg.into())
  }

  pub(crate) fn state(msg: impl Into<String>) -> Self {
    Error::State(msg.into())
  }

  pub(crate) fn config(msg: impl Into<String>) -> Self {
    Error::Config(msg.into())
  }
}

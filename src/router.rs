//! Mid-stream hand-over of a proxied connection to another host.

use std::sync::atomic::{AtomicBool, Ordering};

use regex::Regex;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::Mutex;

use crate::errors::{Error, Result};

/// Configuration for the connection hand-over, taken from the
/// `--transfer-connection` arguments.
#[derive(Clone, Debug)]
pub struct RouterConfig {
  /// Host the connection is handed over to.
  pub host: String,
  /// Port of the new primary connection on that host.
  pub port: u16,
  /// Port of the side channel serving the old client's messages.
  pub msg_port: u16,
  /// Pattern that triggers the switch when a whole server-to-client
  /// message matches it.
  pub trigger: String,
}

/// Socket halves published for the client-to-remote relay: it reads from
/// the new primary connection and forwards the old client over the side
/// channel.
pub struct PulledSockets {
  /// Read half of the new primary connection.
  pub new_client_read: OwnedReadHalf,
  /// Write half of the side channel.
  pub msgs_old_client_write: OwnedWriteHalf,
}

/// Socket halves kept by the remote-to-client relay that triggered the
/// switch: it writes to the new primary connection and an auxiliary relay
/// feeds side-channel data back to the old client.
pub struct SwitchedSockets {
  /// Write half of the new primary connection.
  pub new_client_write: OwnedWriteHalf,
  /// Read half of the side channel.
  pub msgs_old_client_read: OwnedReadHalf,
}

/// Hands the client side of a proxied connection over to another server
/// once a trigger message is seen.
///
/// The switch is single-shot: the flag latches on the first match and the
/// one-slot queue is written at most once. The remote-to-client relay
/// produces, the client-to-remote relay consumes.
pub struct Router {
  host: String,
  port: u16,
  msg_port: u16,
  trigger: Regex,
  switched: AtomicBool,
  pulled: Mutex<Option<PulledSockets>>,
}

impl Router {
  /// Compiles the trigger pattern and prepares the router.
  pub fn new(config: &RouterConfig) -> Result<Router> {
    // The pattern must match the entire message, so anchor it.
    let trigger = Regex::new(&format!(r"\A(?:{})\z", config.trigger))
      .map_err(|e| Error::config(format!("invalid trigger pattern {:?}: {e}", config.trigger)))?;
    Ok(Router {
      host: config.host.clone(),
      port: config.port,
      msg_port: config.msg_port,
      trigger,
      switched: AtomicBool::new(false),
      pulled: Mutex::new(None),
    })
  }

  /// Checks a server-to-client message for the switch trigger.
  ///
  /// On the first whole-message match this dials the new primary
  /// connection and the side channel, publishes the halves meant for the
  /// client-to-remote relay, and returns the halves for the caller. Any
  /// later call returns `None`. A dial failure propagates as I/O error.
  pub async fn check_for_switch_message(&self, content: &str) -> Result<Option<SwitchedSockets>> {
    if self.switched.load(Ordering::SeqCst) {
      return Ok(None);
    }
    if !self.trigger.is_match(content) {
      return Ok(None);
    }
    self.switched.store(true, Ordering::SeqCst);
    let new_client = TcpStream::connect((self.host.as_str(), self.port)).await?;
    let msgs_old_client = TcpStream::connect((self.host.as_str(), self.msg_port)).await?;
    let (new_client_read, new_client_write) = new_client.into_split();
    let (msgs_old_client_read, msgs_old_client_write) = msgs_old_client.into_split();
    *self.pulled.lock().await = Some(PulledSockets {
      new_client_read,
      msgs_old_client_write,
    });
    Ok(Some(SwitchedSockets {
      new_client_write,
      msgs_old_client_read,
    }))
  }

  /// Non-blocking take of the sockets published by a switch.
  pub fn pull_new_client(&self) -> Option<PulledSockets> {
    match self.pulled.try_lock() {
      Ok(mut slot) => slot.take(),
      Err(_) => None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::net::TcpListener;

  fn config(host: &str, port: u16, msg_port: u16, trigger: &str) -> RouterConfig {
    RouterConfig {
      host: host.to_owned(),
      port,
      msg_port,
      trigger: trigger.to_owned(),
    }
  }

  #[tokio::test]
  async fn trigger_must_match_whole_message() {
    let router = Router::new(&config("127.0.0.1", 1, 1, "ready")).unwrap();
    // A partial match must not dial anything (the dial would fail loudly
    // on port 1).
    assert!(router
      .check_for_switch_message("not ready yet")
      .await
      .unwrap()
      .is_none());
    assert!(router.pull_new_client().is_none());
  }

  #[tokio::test]
  async fn switch_is_single_shot() {
    let primary = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let side = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let router = Router::new(&config(
      "127.0.0.1",
      primary.local_addr().unwrap().port(),
      side.local_addr().unwrap().port(),
      "ready",
    ))
    .unwrap();

    let switched = router.check_for_switch_message("ready").await.unwrap();
    assert!(switched.is_some());
    let pulled = router.pull_new_client();
    assert!(pulled.is_some());

    // Further matches do not dial or publish again.
    assert!(router.check_for_switch_message("ready").await.unwrap().is_none());
    assert!(router.pull_new_client().is_none());
  }

  #[tokio::test]
  async fn invalid_pattern_is_a_config_error() {
    assert!(matches!(
      Router::new(&config("127.0.0.1", 1, 1, "(unclosed")),
      Err(Error::Config(_))
    ));
  }
}

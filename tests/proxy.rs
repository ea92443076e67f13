//! End-to-end tests driving a live proxy over real sockets.

use std::net::SocketAddr;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use wiretap::{LogSink, ProxyConfig, ProxyServer, RouterConfig, Rule, Transport};

const WAIT: Duration = Duration::from_secs(5);

fn quiet() -> LogSink {
  LogSink::new(|_| {})
}

async fn start_proxy(
  upstream_port: u16,
  router: Option<RouterConfig>,
  rules: Vec<Rule>,
) -> SocketAddr {
  let config = ProxyConfig {
    bind_host: "127.0.0.1".to_owned(),
    bind_port: 0,
    transport: Transport::Tcp,
    upstream_host: "127.0.0.1".to_owned(),
    upstream_port,
    insecure: false,
    router,
    rules,
  };
  let server = ProxyServer::bind(config, quiet()).await.unwrap();
  let addr = server.local_addr().unwrap();
  tokio::spawn(async move {
    let _ = server.run().await;
  });
  addr
}

async fn read_exactly(stream: &mut TcpStream, len: usize) -> Vec<u8> {
  let mut buf = vec![0u8; len];
  timeout(WAIT, stream.read_exact(&mut buf))
    .await
    .expect("timed out waiting for data")
    .expect("read failed");
  buf
}

#[tokio::test]
async fn proxy_is_transparent_without_matching_rules() {
  let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_port = upstream_listener.local_addr().unwrap().port();
  let proxy_addr = start_proxy(upstream_port, None, vec![Rule::new("absent", "never")]).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let (mut upstream, _) = timeout(WAIT, upstream_listener.accept()).await.unwrap().unwrap();

  // All byte values must survive the text round-trip in both directions.
  let payload: Vec<u8> = (0..=255u8).cycle().take(1024).collect();
  client.write_all(&payload).await.unwrap();
  assert_eq!(read_exactly(&mut upstream, payload.len()).await, payload);

  let reply: Vec<u8> = (0..=255u8).rev().collect();
  upstream.write_all(&reply).await.unwrap();
  assert_eq!(read_exactly(&mut client, reply.len()).await, reply);
}

#[tokio::test]
async fn substitution_rewrites_body_and_content_length() {
  let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_port = upstream_listener.local_addr().unwrap().port();
  let rules = vec![Rule::new("L/B/C", "LongBodyContent")];
  let proxy_addr = start_proxy(upstream_port, None, rules).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let (mut upstream, _) = timeout(WAIT, upstream_listener.accept()).await.unwrap().unwrap();

  client
    .write_all(b"POST /data HTTP/1.1\r\nContent-Length: 5\r\n\r\nL/B/C")
    .await
    .unwrap();
  let expected = b"POST /data HTTP/1.1\r\nContent-Length: 15\r\n\r\nLongBodyContent";
  assert_eq!(read_exactly(&mut upstream, expected.len()).await, expected);
}

#[tokio::test]
async fn substitution_applies_in_both_directions() {
  let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_port = upstream_listener.local_addr().unwrap().port();
  let rules = vec![Rule::new("secret", "REDACTED")];
  let proxy_addr = start_proxy(upstream_port, None, rules).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let (mut upstream, _) = timeout(WAIT, upstream_listener.accept()).await.unwrap().unwrap();

  upstream.write_all(b"the secret value").await.unwrap();
  assert_eq!(
    read_exactly(&mut client, b"the REDACTED value".len()).await,
    b"the REDACTED value"
  );
}

#[tokio::test]
async fn closing_the_client_tears_down_the_upstream_side() {
  let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_port = upstream_listener.local_addr().unwrap().port();
  let proxy_addr = start_proxy(upstream_port, None, Vec::new()).await;

  let client = TcpStream::connect(proxy_addr).await.unwrap();
  let (mut upstream, _) = timeout(WAIT, upstream_listener.accept()).await.unwrap().unwrap();
  drop(client);

  // The relays shut both sockets; the upstream read ends instead of
  // blocking forever.
  let mut buf = [0u8; 1];
  let n = timeout(WAIT, upstream.read(&mut buf)).await.unwrap().unwrap();
  assert_eq!(n, 0);
}

#[tokio::test]
async fn trigger_switch_hands_the_connection_over() {
  let upstream_listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let upstream_port = upstream_listener.local_addr().unwrap().port();
  let transfer_primary = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let transfer_msgs = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let router = RouterConfig {
    host: "127.0.0.1".to_owned(),
    port: transfer_primary.local_addr().unwrap().port(),
    msg_port: transfer_msgs.local_addr().unwrap().port(),
    trigger: "ready".to_owned(),
  };
  let proxy_addr = start_proxy(upstream_port, Some(router), Vec::new()).await;

  let mut client = TcpStream::connect(proxy_addr).await.unwrap();
  let (mut upstream, _) = timeout(WAIT, upstream_listener.accept()).await.unwrap().unwrap();

  // The trigger message is still delivered to the original client before
  // the switch takes effect.
  upstream.write_all(b"ready").await.unwrap();
  assert_eq!(read_exactly(&mut client, 5).await, b"ready");

  let (mut new_primary, _) = timeout(WAIT, transfer_primary.accept()).await.unwrap().unwrap();
  let (mut side, _) = timeout(WAIT, transfer_msgs.accept()).await.unwrap().unwrap();

  // Remote-to-client output now goes to the new primary connection.
  upstream.write_all(b"to-new-host").await.unwrap();
  assert_eq!(read_exactly(&mut new_primary, 11).await, b"to-new-host");

  // Bytes the original client sends after the switch flow over the side
  // channel (including the edge packet read during the switch).
  client.write_all(b"client-msg").await.unwrap();
  assert_eq!(read_exactly(&mut side, 10).await, b"client-msg");

  // Bytes from the new primary connection reach the original upstream.
  new_primary.write_all(b"from-new-host").await.unwrap();
  assert_eq!(read_exactly(&mut upstream, 13).await, b"from-new-host");

  // The side channel feeds the original client.
  side.write_all(b"side-reply").await.unwrap();
  assert_eq!(read_exactly(&mut client, 10).await, b"side-reply");

  // The switch is single-shot: a second matching message flows to the new
  // primary connection and no further connection is dialed.
  upstream.write_all(b"ready").await.unwrap();
  assert_eq!(read_exactly(&mut new_primary, 5).await, b"ready");
  assert!(
    timeout(Duration::from_millis(300), transfer_primary.accept())
      .await
      .is_err()
  );
}

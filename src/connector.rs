//! Upstream dialing: plain TCP or TLS.

use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use std::task::{Context, Poll};

use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::rustls::client::danger::{
  HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::crypto::{CryptoProvider, WebPkiSupportedAlgorithms};
use tokio_rustls::rustls::pki_types::{CertificateDer, ServerName, UnixTime};
use tokio_rustls::rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, SignatureScheme};
use tokio_rustls::TlsConnector;

use crate::errors::{Error, Result};

/// Transport used to reach the upstream endpoint.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Transport {
  /// Plain TCP.
  Tcp,
  /// TLS over TCP.
  Tls,
}

impl FromStr for Transport {
  type Err = Error;

  fn from_str(s: &str) -> Result<Self> {
    if s.eq_ignore_ascii_case("tcp") {
      Ok(Transport::Tcp)
    } else if s.eq_ignore_ascii_case("tls") {
      Ok(Transport::Tls)
    } else {
      Err(Error::config(format!("invalid transport value: {s}")))
    }
  }
}

/// A dialed upstream stream.
pub enum Stream {
  /// Plain TCP stream.
  Tcp(TcpStream),
  /// TLS stream over TCP.
  Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncRead for Stream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      Stream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for Stream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<std::io::Result<usize>> {
    match self.get_mut() {
      Stream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      Stream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      Stream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      Stream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      Stream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

enum Dialer {
  Tcp,
  Tls(TlsConnector),
}

/// Dials upstream endpoints for the proxy supervisor.
pub struct Connector {
  dialer: Dialer,
}

impl Connector {
  /// Builds a connector for the given transport.
  ///
  /// With `insecure` set, TLS certificates are accepted without
  /// verification; this tool terminates development traffic, not
  /// production traffic.
  pub fn new(transport: Transport, insecure: bool) -> Result<Connector> {
    let dialer = match transport {
      Transport::Tcp => Dialer::Tcp,
      Transport::Tls => Dialer::Tls(build_tls_connector(insecure)?),
    };
    Ok(Connector { dialer })
  }

  /// Dials `host:port` over the configured transport.
  pub async fn connect(&self, host: &str, port: u16) -> Result<Stream> {
    let tcp = TcpStream::connect((host, port)).await?;
    match &self.dialer {
      Dialer::Tcp => Ok(Stream::Tcp(tcp)),
      Dialer::Tls(connector) => {
        let server_name = ServerName::try_from(host.to_owned())
          .map_err(|e| Error::config(format!("invalid TLS server name {host:?}: {e}")))?;
        let stream = connector.connect(server_name, tcp).await?;
        Ok(Stream::Tls(Box::new(stream)))
      }
    }
  }
}

fn build_tls_connector(insecure: bool) -> Result<TlsConnector> {
  let provider = CryptoProvider::get_default().cloned().unwrap_or_else(|| {
    Arc::new(tokio_rustls::rustls::crypto::ring::default_provider())
  });
  let signature_algorithms = provider.signature_verification_algorithms;
  let builder = ClientConfig::builder_with_provider(provider)
    .with_protocol_versions(tokio_rustls::rustls::ALL_VERSIONS)?;
  let config = if insecure {
    builder
      .dangerous()
      .with_custom_certificate_verifier(Arc::new(NoVerifier(signature_algorithms)))
      .with_no_client_auth()
  } else {
    let mut roots = RootCertStore::empty();
    for cert in rustls_native_certs::load_native_certs().certs {
      roots.add(cert)?;
    }
    builder.with_root_certificates(roots).with_no_client_auth()
  };
  Ok(TlsConnector::from(Arc::new(config)))
}

/// Certificate verifier that accepts any peer.
#[derive(Debug)]
struct NoVerifier(WebPkiSupportedAlgorithms);

impl ServerCertVerifier for NoVerifier {
  fn verify_server_cert(
    &self,
    _end_entity: &CertificateDer,
    _intermediates: &[CertificateDer],
    _server_name: &ServerName,
    _ocsp_response: &[u8],
    _now: UnixTime,
  ) -> std::result::Result<ServerCertVerified, tokio_rustls::rustls::Error> {
    Ok(ServerCertVerified::assertion())
  }

  fn verify_tls12_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn verify_tls13_signature(
    &self,
    _message: &[u8],
    _cert: &CertificateDer,
    _dss: &DigitallySignedStruct,
  ) -> std::result::Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
    Ok(HandshakeSignatureValid::assertion())
  }

  fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
    self.0.supported_schemes()
  }
}

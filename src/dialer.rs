//! Racing multi-address dialer
//!
//! Every candidate address is dialed at once; the first attempt to succeed
//! wins and all other attempts are closed by a reaper task.

use crate::dns::Resolver;
use crate::errors::{new_io_error, Error, Result};
use crate::socket::BoxStream;
use socket2::Socket as RawSocket;
use socket2::{Domain, Protocol, Type};
use std::future::Future;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio_rustls::client::TlsStream;
use tokio_rustls::TlsConnector;

/// Races `connect` over `addrs` and returns the first success.
///
/// Losers that still complete are dropped by a background task, which closes
/// their sockets. If every attempt fails, the last failure is reported.
pub async fn race<T, F, Fut>(addrs: Vec<SocketAddr>, connect: F) -> Result<T>
where
  T: Send + 'static,
  F: Fn(SocketAddr) -> Fut,
  Fut: Future<Output = Result<T>> + Send + 'static,
{
  let attempts = addrs.len();
  if attempts == 0 {
    return Err(new_io_error(
      std::io::ErrorKind::InvalidInput,
      "no candidate addresses to dial",
    ));
  }
  let (tx, mut rx) = mpsc::channel(attempts);
  for addr in addrs {
    let tx = tx.clone();
    let attempt = connect(addr);
    tokio::spawn(async move {
      let result = attempt.await;
      // the receiver is gone once the race is decided and reaped
      let _ = tx.send((addr, result)).await;
    });
  }
  drop(tx);

  let mut last = None;
  while let Some((addr, result)) = rx.recv().await {
    match result {
      Ok(conn) => {
        tracing::debug!("dial race won by {}", addr);
        tokio::spawn(async move {
          while let Some((addr, result)) = rx.recv().await {
            if result.is_ok() {
              tracing::trace!("closing losing connection to {}", addr);
            }
          }
        });
        return Ok(conn);
      }
      Err(e) => {
        tracing::debug!("dial to {} failed: {}", addr, e);
        last = Some(e);
      }
    }
  }
  Err(Error::DialExhausted {
    attempts,
    last: Box::new(last.unwrap_or_else(|| Error::Other("dial race ended without a result".to_string()))),
  })
}

/// Dials upstream servers over every resolved address at once.
#[derive(Clone)]
pub struct RacingDialer {
  resolver: Arc<Resolver>,
  timeout: Duration,
  nodelay: bool,
  keepalive: Option<Duration>,
  tls: TlsConnector,
}

impl RacingDialer {
  /// A dialer bounding each attempt, handshake included, by `timeout`.
  pub fn new(
    resolver: Arc<Resolver>,
    timeout: Duration,
    tls: Arc<tokio_rustls::rustls::ClientConfig>,
  ) -> Self {
    Self {
      resolver,
      timeout,
      nodelay: true,
      keepalive: None,
      tls: TlsConnector::from(tls),
    }
  }
  /// Set `TCP_NODELAY` on upstream sockets.
  pub fn nodelay(mut self, value: bool) -> Self {
    self.nodelay = value;
    self
  }
  /// Enable TCP keepalive on upstream sockets.
  pub fn keepalive(mut self, value: Option<Duration>) -> Self {
    self.keepalive = value;
    self
  }
  /// The resolver consulted when no candidates are given.
  pub fn resolver(&self) -> &Arc<Resolver> {
    &self.resolver
  }

  async fn candidates(&self, host: &str, port: u16, candidates: &[IpAddr]) -> Result<Vec<SocketAddr>> {
    if candidates.is_empty() {
      let primary = self
        .resolver
        .resolve(host, port)
        .await?
        .into_iter()
        .next()
        .ok_or_else(|| Error::Resolve {
          host: host.to_string(),
          reason: "no addresses found".to_string(),
        })?;
      return Ok(vec![primary]);
    }
    Ok(
      candidates
        .iter()
        .map(|ip| SocketAddr::new(*ip, port))
        .collect(),
    )
  }

  /// Races plain TCP connections to `candidates`, or to the primary resolved
  /// address of `host` when `candidates` is empty.
  pub async fn dial(&self, host: &str, port: u16, candidates: &[IpAddr]) -> Result<TcpStream> {
    let addrs = self.candidates(host, port, candidates).await?;
    let (timeout, nodelay, keepalive) = (self.timeout, self.nodelay, self.keepalive);
    race(addrs, move |addr| async move {
      tokio::time::timeout(timeout, connect_tcp(addr, nodelay, keepalive))
        .await
        .map_err(|_| Error::Timeout(format!("dial {}", addr)))?
    })
    .await
  }

  /// Like [`RacingDialer::dial`], but each racer also completes a TLS client
  /// handshake before it can win. `server_name` defaults to `host`.
  pub async fn dial_tls(
    &self,
    host: &str,
    port: u16,
    candidates: &[IpAddr],
    server_name: Option<&str>,
  ) -> Result<TlsStream<TcpStream>> {
    let addrs = self.candidates(host, port, candidates).await?;
    let name = crate::tls::server_name(server_name.unwrap_or(host))?;
    let (timeout, nodelay, keepalive) = (self.timeout, self.nodelay, self.keepalive);
    let connector = self.tls.clone();
    race(addrs, move |addr| {
      let connector = connector.clone();
      let name = name.clone();
      async move {
        let tcp = tokio::time::timeout(timeout, connect_tcp(addr, nodelay, keepalive))
          .await
          .map_err(|_| Error::Timeout(format!("dial {}", addr)))??;
        tokio::time::timeout(timeout, connector.connect(name, tcp))
          .await
          .map_err(|_| Error::Timeout(format!("TLS handshake with {}", addr)))?
          .map_err(|e| Error::tls_error(format!("handshake with {}: {}", addr, e)))
      }
    })
    .await
  }

  /// Resolves `host` and races all of its addresses.
  pub async fn connect(&self, host: &str, port: u16) -> Result<TcpStream> {
    let ips = self.resolver.lookup_host(host).await?;
    self.dial(host, port, &ips).await
  }

  /// Resolves `host` and races TLS connections to all of its addresses.
  pub async fn connect_tls(&self, host: &str, port: u16) -> Result<TlsStream<TcpStream>> {
    let ips = self.resolver.lookup_host(host).await?;
    self.dial_tls(host, port, &ips, None).await
  }

  /// Plain or TLS upstream stream, type-erased.
  pub(crate) async fn connect_stream(&self, host: &str, port: u16, tls: bool) -> Result<BoxStream> {
    Ok(if tls {
      Box::new(self.connect_tls(host, port).await?)
    } else {
      Box::new(self.connect(host, port).await?)
    })
  }
}

impl std::fmt::Debug for RacingDialer {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("RacingDialer")
      .field("timeout", &self.timeout)
      .field("nodelay", &self.nodelay)
      .field("keepalive", &self.keepalive)
      .finish()
  }
}

async fn connect_tcp(addr: SocketAddr, nodelay: bool, keepalive: Option<Duration>) -> Result<TcpStream> {
  let dial_error = |source| Error::Dial { addr, source };
  let raw_socket = RawSocket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))
    .map_err(dial_error)?;
  raw_socket.set_nonblocking(true).map_err(dial_error)?;
  if let Some(idle) = keepalive {
    let keepalive = socket2::TcpKeepalive::new().with_time(idle);
    raw_socket.set_tcp_keepalive(&keepalive).map_err(dial_error)?;
  }
  let socket = TcpSocket::from_std_stream(raw_socket.into());
  if nodelay {
    socket.set_nodelay(true).map_err(dial_error)?;
  }
  socket.connect(addr).await.map_err(dial_error)
}

use std::fmt::{Debug, Formatter};
use std::io::Error;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tokio::net::TcpStream;
use tokio_rustls::server::TlsStream;

/// Any bidirectional byte stream the proxy can own and move between tasks.
pub trait AsyncStream: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Unpin + Send + 'static {}

/// An owned, type-erased stream.
pub type BoxStream = Box<dyn AsyncStream>;

/// Where a decrypted connection originally came from.
///
/// Attached to connections that were intercepted by the MITM path, so that
/// relative request targets are completed with `https` and the tunnel authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsOrigin {
  /// `host:port` of the CONNECT request that opened the tunnel
  pub authority: String,
  /// SNI sent by the client, if any
  pub server_name: Option<String>,
}

/// A client connection accepted by the listener or injected into it.
pub struct Socket {
  inner: MaybeTlsStream,
  peer_addr: SocketAddr,
  origin: Option<TlsOrigin>,
}

impl Socket {
  /// Wraps a freshly accepted TCP connection.
  pub fn tcp(stream: TcpStream, peer_addr: SocketAddr) -> Self {
    Self {
      inner: MaybeTlsStream::Tcp(stream),
      peer_addr,
      origin: None,
    }
  }
  /// Wraps a connection whose TLS handshake was terminated locally.
  pub fn tls(stream: TlsStream<BoxStream>, peer_addr: SocketAddr, authority: String) -> Self {
    let server_name = stream.get_ref().1.server_name().map(str::to_string);
    Self {
      inner: MaybeTlsStream::Tls(Box::new(stream)),
      peer_addr,
      origin: Some(TlsOrigin {
        authority,
        server_name,
      }),
    }
  }
  /// Marks a plain connection as carrying decrypted traffic of a tunnel.
  pub(crate) fn set_origin(&mut self, origin: TlsOrigin) {
    self.origin = Some(origin);
  }
  /// Address of the remote peer.
  pub fn peer_addr(&self) -> SocketAddr {
    self.peer_addr
  }
  /// Whether requests on this connection arrived over TLS.
  pub fn is_tls(&self) -> bool {
    self.origin.is_some() || matches!(self.inner, MaybeTlsStream::Tls(_))
  }
  /// Tunnel information for intercepted connections.
  pub fn origin(&self) -> Option<&TlsOrigin> {
    self.origin.as_ref()
  }
}

impl Debug for Socket {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Socket")
      .field("inner", &self.inner)
      .field("peer_addr", &self.peer_addr)
      .field("origin", &self.origin)
      .finish()
  }
}

/// Transport of a [`Socket`].
pub enum MaybeTlsStream {
  /// TCP
  Tcp(TcpStream),
  /// TLS terminated by the proxy
  Tls(Box<TlsStream<BoxStream>>),
}

impl Debug for MaybeTlsStream {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      MaybeTlsStream::Tcp(s) => f.debug_tuple("Tcp").field(s).finish(),
      MaybeTlsStream::Tls(_) => f.write_str("Tls"),
    }
  }
}

// reads and writes go to the transport
impl AsyncRead for Socket {
  fn poll_read(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    Pin::new(&mut self.inner).poll_read(cx, buf)
  }
}

impl AsyncWrite for Socket {
  fn poll_write(
    mut self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    Pin::new(&mut self.inner).poll_write(cx, buf)
  }

  fn poll_flush(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_flush(cx)
  }

  fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    Pin::new(&mut self.inner).poll_shutdown(cx)
  }
}

impl AsyncRead for MaybeTlsStream {
  fn poll_read(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &mut ReadBuf<'_>,
  ) -> Poll<std::io::Result<()>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_read(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_read(cx, buf),
    }
  }
}

impl AsyncWrite for MaybeTlsStream {
  fn poll_write(
    self: Pin<&mut Self>,
    cx: &mut Context<'_>,
    buf: &[u8],
  ) -> Poll<Result<usize, Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_write(cx, buf),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_write(cx, buf),
    }
  }

  fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_flush(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_flush(cx),
    }
  }

  fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Error>> {
    match self.get_mut() {
      MaybeTlsStream::Tcp(stream) => Pin::new(stream).poll_shutdown(cx),
      MaybeTlsStream::Tls(stream) => Pin::new(stream).poll_shutdown(cx),
    }
  }
}

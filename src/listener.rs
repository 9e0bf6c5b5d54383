//! Accept loop with backoff and connection injection.
//!
//! A [`Listener`] owns a background task that accepts connections and feeds
//! them into a bounded queue. [`ListenerHandle::inject`] pushes connections
//! produced elsewhere (decrypted MITM tunnels) into the same queue.

use crate::errors::{Error, Result};
use crate::socket::{Socket, TlsOrigin};
use std::collections::HashMap;
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Exponential retry delay for transient accept errors.
#[derive(Debug, Clone)]
pub struct Backoff {
  initial: Duration,
  max: Duration,
  current: Option<Duration>,
}

impl Default for Backoff {
  fn default() -> Self {
    Self::new(Duration::from_millis(5), Duration::from_secs(1))
  }
}

impl Backoff {
  /// Starts at `initial` and doubles up to `max`.
  pub fn new(initial: Duration, max: Duration) -> Self {
    Self {
      initial,
      max,
      current: None,
    }
  }
  /// Delay before the next retry.
  pub fn next_delay(&mut self) -> Duration {
    let delay = match self.current {
      None => self.initial,
      Some(prev) => (prev * 2).min(self.max),
    };
    self.current = Some(delay);
    delay
  }
  /// Forget earlier failures.
  pub fn reset(&mut self) {
    self.current = None;
  }
}

/// Source of raw connections for the accept loop.
#[async_trait::async_trait]
pub trait Acceptor: Send + 'static {
  /// Waits for the next connection.
  async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)>;
  /// Bound address.
  fn local_addr(&self) -> io::Result<SocketAddr>;
}

#[async_trait::async_trait]
impl Acceptor for TcpListener {
  async fn accept(&mut self) -> io::Result<(TcpStream, SocketAddr)> {
    TcpListener::accept(self).await
  }
  fn local_addr(&self) -> io::Result<SocketAddr> {
    TcpListener::local_addr(self)
  }
}

/// Whether the accept loop should retry after `e`.
pub fn is_transient(e: &io::Error) -> bool {
  use io::ErrorKind::*;
  if matches!(
    e.kind(),
    WouldBlock | Interrupted | ConnectionAborted | ConnectionReset | TimedOut
  ) {
    return true;
  }
  // EMFILE / ENFILE: out of descriptors, clears when connections close
  matches!(e.raw_os_error(), Some(23) | Some(24))
}

type Registry = Arc<Mutex<HashMap<SocketAddr, TlsOrigin>>>;

/// Cloneable producer side of a [`Listener`].
#[derive(Clone)]
pub struct ListenerHandle {
  tx: mpsc::Sender<Result<Socket>>,
  local_addr: SocketAddr,
  loopback: Registry,
}

impl ListenerHandle {
  /// Address the listener is bound to.
  pub fn local_addr(&self) -> SocketAddr {
    self.local_addr
  }

  /// Queues `socket` as if it had been accepted.
  pub async fn inject(&self, socket: Socket) -> Result<()> {
    tracing::debug!("injecting connection from {}", socket.peer_addr());
    self
      .tx
      .send(Ok(socket))
      .await
      .map_err(|_| Error::ListenerClosed)
  }

  /// Opens a connection to the listener's own address. The accepted end is
  /// marked with `origin`.
  pub async fn connect_loopback(&self, origin: TlsOrigin) -> Result<TcpStream> {
    let target = match self.local_addr.ip() {
      IpAddr::V4(ip) if ip.is_unspecified() => SocketAddr::new(Ipv4Addr::LOCALHOST.into(), self.local_addr.port()),
      IpAddr::V6(ip) if ip.is_unspecified() => SocketAddr::new(Ipv6Addr::LOCALHOST.into(), self.local_addr.port()),
      _ => self.local_addr,
    };
    let socket = if target.is_ipv4() {
      TcpSocket::new_v4()?
    } else {
      TcpSocket::new_v6()?
    };
    let bind_ip: IpAddr = if target.is_ipv4() {
      Ipv4Addr::LOCALHOST.into()
    } else {
      Ipv6Addr::LOCALHOST.into()
    };
    socket.bind(SocketAddr::new(bind_ip, 0))?;
    let local = socket.local_addr()?;
    self.registry().insert(local, origin);
    match socket.connect(target).await {
      Ok(stream) => Ok(stream),
      Err(e) => {
        self.registry().remove(&local);
        Err(Error::Dial { addr: target, source: e })
      }
    }
  }

  fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<SocketAddr, TlsOrigin>> {
    self.loopback.lock().unwrap_or_else(PoisonError::into_inner)
  }

  fn take_origin(&self, peer: &SocketAddr) -> Option<TlsOrigin> {
    self.registry().remove(peer)
  }
}

impl std::fmt::Debug for ListenerHandle {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ListenerHandle")
      .field("local_addr", &self.local_addr)
      .finish()
  }
}

/// Consumer side: yields accepted and injected connections.
pub struct Listener {
  rx: mpsc::Receiver<Result<Socket>>,
  handle: ListenerHandle,
  task: JoinHandle<()>,
  dead: bool,
}

impl Listener {
  /// Binds a TCP listener on `addr`.
  pub async fn bind(addr: SocketAddr, queue: usize) -> Result<Self> {
    let listener = TcpListener::bind(addr).await?;
    tracing::info!("listening on {}", listener.local_addr()?);
    Self::from_acceptor(listener, queue, Backoff::default())
  }

  /// Runs the accept loop over `acceptor`.
  pub fn from_acceptor<A: Acceptor>(acceptor: A, queue: usize, backoff: Backoff) -> Result<Self> {
    let local_addr = acceptor.local_addr()?;
    let (tx, rx) = mpsc::channel(queue.max(1));
    let handle = ListenerHandle {
      tx,
      local_addr,
      loopback: Arc::new(Mutex::new(HashMap::new())),
    };
    let task = tokio::spawn(accept_loop(acceptor, handle.clone(), backoff));
    Ok(Self {
      rx,
      handle,
      task,
      dead: false,
    })
  }

  /// Next connection. Fails once the accept loop died on a permanent error.
  pub async fn accept(&mut self) -> Result<Socket> {
    if self.dead {
      return Err(Error::ListenerClosed);
    }
    match self.rx.recv().await {
      Some(Ok(socket)) => Ok(socket),
      Some(Err(e)) => {
        self.dead = true;
        Err(e)
      }
      None => {
        self.dead = true;
        Err(Error::ListenerClosed)
      }
    }
  }

  /// Producer handle for injection and loopback connections.
  pub fn handle(&self) -> ListenerHandle {
    self.handle.clone()
  }

  /// Bound address.
  pub fn local_addr(&self) -> SocketAddr {
    self.handle.local_addr
  }
}

impl Drop for Listener {
  fn drop(&mut self) {
    self.task.abort();
  }
}

async fn accept_loop<A: Acceptor>(mut acceptor: A, handle: ListenerHandle, mut backoff: Backoff) {
  loop {
    match acceptor.accept().await {
      Ok((stream, peer)) => {
        backoff.reset();
        let mut socket = Socket::tcp(stream, peer);
        if let Some(origin) = handle.take_origin(&peer) {
          socket.set_origin(origin);
        }
        if handle.tx.send(Ok(socket)).await.is_err() {
          return;
        }
      }
      Err(e) if is_transient(&e) => {
        let delay = backoff.next_delay();
        tracing::warn!("accept error: {}; retrying in {:?}", e, delay);
        tokio::time::sleep(delay).await;
      }
      Err(e) => {
        tracing::error!("accept loop stopped: {}", e);
        let _ = handle.tx.send(Err(Error::IO(e))).await;
        return;
      }
    }
  }
}

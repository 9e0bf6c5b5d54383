//! Raw byte relays between two connections.
use crate::context::Context;
use crate::dialer::RacingDialer;
use crate::errors::{Error, Result};
use crate::request::Request;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

/// Status line that opens a tunnel. No headers follow.
pub const CONNECT_ESTABLISHED: &[u8] = b"HTTP/1.1 200 OK\r\n\r\n";

/// Relays bytes in both directions until either side stops.
///
/// Each direction runs in its own task. When one finishes, the other is
/// cancelled and both streams are dropped, which closes them.
pub async fn splice<A, B>(a: A, b: B) -> Result<()>
where
  A: AsyncRead + AsyncWrite + Send + 'static,
  B: AsyncRead + AsyncWrite + Send + 'static,
{
  let (mut a_read, mut a_write) = tokio::io::split(a);
  let (mut b_read, mut b_write) = tokio::io::split(b);
  let mut a_to_b = tokio::spawn(async move {
    let n = tokio::io::copy(&mut a_read, &mut b_write).await;
    let _ = b_write.shutdown().await;
    n
  });
  let mut b_to_a = tokio::spawn(async move {
    let n = tokio::io::copy(&mut b_read, &mut a_write).await;
    let _ = a_write.shutdown().await;
    n
  });
  let finished = tokio::select! {
    r = &mut a_to_b => {
      b_to_a.abort();
      r
    }
    r = &mut b_to_a => {
      a_to_b.abort();
      r
    }
  };
  match finished {
    Ok(Ok(n)) => {
      tracing::trace!("splice finished after {} bytes", n);
      Ok(())
    }
    Ok(Err(e)) => Err(Error::IO(e)),
    Err(e) => Err(Error::Other(format!("splice task failed: {}", e))),
  }
}

/// Opens a passthrough tunnel for a CONNECT request: dials the target,
/// takes over the client connection, confirms the tunnel and relays bytes.
pub async fn connect_tunnel(ctx: &mut Context, dialer: &RacingDialer, req: &Request) -> Result<()> {
  if !ctx.writer().supports_hijack() {
    return Err(Error::HijackUnsupported);
  }
  let (host, port) = req.host_port()?;
  let upstream = dialer.connect(&host, port).await?;
  let mut client = ctx.writer_mut().hijack()?;
  client.write_all(CONNECT_ESTABLISHED).await?;
  client.flush().await?;
  tracing::debug!("tunnel to {}:{} established", host, port);
  splice(client, upstream).await
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::AsyncReadExt;

  #[tokio::test]
  async fn relays_both_directions_and_closes() {
    let (client, proxy_a) = tokio::io::duplex(64);
    let (proxy_b, upstream) = tokio::io::duplex(64);
    let relay = tokio::spawn(splice(proxy_a, proxy_b));

    let (mut client_read, mut client_write) = tokio::io::split(client);
    let (mut upstream_read, mut upstream_write) = tokio::io::split(upstream);
    client_write.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    upstream_read.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");
    upstream_write.write_all(b"pong").await.unwrap();
    client_read.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"pong");

    upstream_write.shutdown().await.unwrap();
    relay.await.unwrap().unwrap();
    let mut rest = Vec::new();
    assert_eq!(client_read.read_to_end(&mut rest).await.unwrap(), 0);
  }
}

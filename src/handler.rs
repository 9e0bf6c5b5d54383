//! Per-connection request loop
use crate::context::Context;
use crate::errors::{Error, Result};
use crate::listener::ListenerHandle;
use crate::pipeline::{Outcome, Pipeline};
use crate::request::{read_request, Request};
use crate::socket::{Socket, TlsOrigin};
use crate::writer::ResponseWriter;
use http::StatusCode;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};

/// Reads requests from one client connection and drives each through the
/// pipeline. Connections are kept alive until the client asks to close,
/// goes idle, or a request fails.
#[derive(Clone)]
pub struct ConnectionHandler {
  pipeline: Arc<Pipeline>,
  read_timeout: Duration,
  write_timeout: Duration,
}

impl ConnectionHandler {
  /// A handler with idle-read and write bounds.
  pub fn new(pipeline: Arc<Pipeline>, read_timeout: Duration, write_timeout: Duration) -> Self {
    Self {
      pipeline,
      read_timeout,
      write_timeout,
    }
  }

  /// The pipeline requests go through.
  pub fn pipeline(&self) -> &Arc<Pipeline> {
    &self.pipeline
  }

  /// Serves `socket` until it closes. `listener` is needed by filters that
  /// hand connections back to the accept loop.
  pub async fn serve(&self, socket: Socket, listener: Option<ListenerHandle>) -> Result<()> {
    let peer = socket.peer_addr();
    let tls = socket.is_tls();
    let origin = socket.origin().cloned();
    let mut conn = BufReader::new(socket);
    loop {
      let mut req = match tokio::time::timeout(self.read_timeout, read_request(&mut conn)).await {
        Err(_) => {
          tracing::trace!("{} idle, closing", peer);
          return close(conn).await;
        }
        Ok(Ok(None)) => return close(conn).await,
        Ok(Ok(Some(req))) => req,
        Ok(Err(e)) => return self.reject(conn, peer, e).await,
      };
      if let Err(e) = normalize(&mut req, tls, origin.as_ref()) {
        return self.reject(conn, peer, e).await;
      }
      let keep_alive = !req.wants_close() && !req.is_connect();
      let line = format!("{} {} {:?}", req.method(), req.uri(), req.version());

      let writer = ResponseWriter::new(conn, Some(self.write_timeout));
      let mut ctx = Context::new(writer, listener.clone(), Some(peer), tls);
      match self.pipeline.handle(&mut ctx, req).await {
        Ok(outcome) => access_log(peer, &line, &outcome),
        Err(e) => {
          tracing::warn!("{} \"{}\" failed: {}", peer, line, e);
          if !ctx.writer().is_started() {
            let status = if e.is_timeout() {
              StatusCode::GATEWAY_TIMEOUT
            } else {
              StatusCode::BAD_GATEWAY
            };
            if let Err(write_error) = ctx.writer_mut().write_error(status, &e).await {
              tracing::debug!("{} error response not delivered: {}", peer, write_error);
            }
          }
          if let Some(conn) = ctx.into_writer().into_conn() {
            close(conn).await?;
          }
          return Err(e);
        }
      }
      conn = match ctx.into_writer().into_conn() {
        Some(conn) => conn,
        // the connection now belongs to a tunnel
        None => return Ok(()),
      };
      if !keep_alive {
        return close(conn).await;
      }
    }
  }

  async fn reject(&self, conn: BufReader<Socket>, peer: SocketAddr, e: Error) -> Result<()> {
    tracing::debug!("{} sent an unusable request: {}", peer, e);
    let mut writer = ResponseWriter::new(conn, Some(self.write_timeout));
    if let Err(write_error) = writer.write_error(StatusCode::BAD_REQUEST, &e).await {
      tracing::debug!("{} 400 response not delivered: {}", peer, write_error);
    }
    if let Some(conn) = writer.into_conn() {
      close(conn).await?;
    }
    Err(e)
  }
}

impl std::fmt::Debug for ConnectionHandler {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("ConnectionHandler")
      .field("request_filters", &self.pipeline.request_filters())
      .field("read_timeout", &self.read_timeout)
      .field("write_timeout", &self.write_timeout)
      .finish()
  }
}

/// Flushes and shuts down the connection; TLS connections send close_notify.
async fn close(mut conn: BufReader<Socket>) -> Result<()> {
  match conn.shutdown().await {
    Ok(()) => Ok(()),
    Err(e) if e.kind() == std::io::ErrorKind::NotConnected => Ok(()),
    Err(e) => Err(Error::IO(e)),
  }
}

fn access_log(peer: SocketAddr, line: &str, outcome: &Outcome) {
  let status = outcome
    .status
    .map(|s| s.as_u16().to_string())
    .unwrap_or_else(|| "-".to_string());
  let length = outcome
    .content_length
    .map(|l| l.to_string())
    .unwrap_or_else(|| "-".to_string());
  tracing::info!("{} \"{} {}\" {} {}", peer, outcome.filter, line, status, length);
}

/// Completes a relative request target into an absolute URL.
///
/// The scheme follows the transport; the authority comes from the `Host`
/// header, then the tunnel authority, then the SNI name.
fn normalize(req: &mut Request, tls: bool, origin: Option<&TlsOrigin>) -> Result<()> {
  if req.is_connect() || req.uri().scheme().is_some() {
    return Ok(());
  }
  let authority = req
    .headers()
    .get(http::header::HOST)
    .and_then(|h| h.to_str().ok())
    .filter(|h| !h.is_empty())
    .map(str::to_string)
    .or_else(|| origin.map(|o| o.authority.clone()))
    .or_else(|| origin.and_then(|o| o.server_name.clone()))
    .ok_or_else(|| Error::invalid_request("relative request target without a host"))?;
  let path = req
    .uri()
    .path_and_query()
    .map(|p| p.as_str().to_string())
    .unwrap_or_else(|| "/".to_string());
  let uri = http::Uri::builder()
    .scheme(if tls { "https" } else { "http" })
    .authority(authority.as_str())
    .path_and_query(path.as_str())
    .build()?;
  *req.uri_mut() = uri;
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;

  fn relative(host: Option<&str>) -> Request {
    let mut builder = Request::builder().uri("/search?q=1");
    if let Some(host) = host {
      builder = builder.header("Host", host);
    }
    builder.body(Vec::new()).unwrap().into()
  }

  #[test]
  fn relative_targets_use_transport_and_host() {
    let mut req = relative(Some("example.com:8443"));
    normalize(&mut req, true, None).unwrap();
    assert_eq!(req.uri(), "https://example.com:8443/search?q=1");

    let mut req = relative(Some("example.com"));
    normalize(&mut req, false, None).unwrap();
    assert_eq!(req.uri(), "http://example.com/search?q=1");
  }

  #[test]
  fn tunnel_origin_fills_missing_host() {
    let origin = TlsOrigin {
      authority: "example.com:443".to_string(),
      server_name: Some("www.example.com".to_string()),
    };
    let mut req = relative(None);
    normalize(&mut req, true, Some(&origin)).unwrap();
    assert_eq!(req.uri(), "https://example.com:443/search?q=1");

    let mut req = relative(None);
    assert!(normalize(&mut req, false, None).is_err());
  }

  #[test]
  fn absolute_and_connect_targets_are_kept() {
    let mut req: Request = Request::builder()
      .uri("http://example.org/a")
      .body(Vec::new())
      .unwrap()
      .into();
    normalize(&mut req, true, None).unwrap();
    assert_eq!(req.uri(), "http://example.org/a");
  }
}

use crate::ca::CertificateAuthority;
use crate::config::{site_matches, TunnelStrategy};
use crate::context::{Context, FilterArgs};
use crate::errors::{Error, Result};
use crate::pipeline::{Filter, Pipeline, RequestFilter, Role};
use crate::request::Request;
use crate::response::Response;
use crate::socket::{BoxStream, Socket, TlsOrigin};
use crate::tunnel::{splice, CONNECT_ESTABLISHED};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio_rustls::TlsAcceptor;

/// Terminates TLS of CONNECT tunnels to configured hosts with a leaf from
/// the certificate authority, and feeds the decrypted connection back into
/// the listener.
pub struct MitmFilter {
  ca: Arc<CertificateAuthority>,
  sites: Vec<String>,
  strategy: TunnelStrategy,
  handshake_timeout: Duration,
}

impl MitmFilter {
  /// Intercepts tunnels whose host suffix-matches one of `sites`.
  pub fn new(ca: Arc<CertificateAuthority>, sites: Vec<String>, strategy: TunnelStrategy) -> Self {
    Self {
      ca,
      sites,
      strategy,
      handshake_timeout: Duration::from_secs(10),
    }
  }
  /// Bound of the client handshake.
  pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
    self.handshake_timeout = timeout;
    self
  }
}

impl Filter for MitmFilter {
  fn name(&self) -> &'static str {
    "MITM"
  }
  fn roles(self: Arc<Self>) -> Vec<Role> {
    vec![Role::Request(self)]
  }
}

#[async_trait::async_trait]
impl RequestFilter for MitmFilter {
  async fn filter(&self, _ctx: &mut Context, req: &Request) -> Result<Option<FilterArgs>> {
    if !req.is_connect() {
      return Ok(None);
    }
    let (host, _) = req.host_port()?;
    if !site_matches(&self.sites, &host) {
      return Ok(None);
    }
    Ok(Some(FilterArgs::new().with("host", host)))
  }

  async fn handle_request(
    &self,
    pipeline: &Pipeline,
    ctx: &mut Context,
    _args: Option<FilterArgs>,
    req: Request,
  ) -> Result<Option<Response>> {
    if !req.is_connect() {
      return pipeline.fetch(ctx, req).await.map(Some);
    }
    if !ctx.writer().supports_hijack() {
      return Err(Error::HijackUnsupported);
    }
    let listener = ctx
      .listener()
      .cloned()
      .ok_or_else(|| Error::pipeline_error("intercepted tunnels need a listener"))?;
    let (host, port) = req.host_port()?;
    let authority = format!("{}:{}", host, port);
    let peer = ctx
      .peer_addr()
      .unwrap_or_else(|| SocketAddr::from(([0, 0, 0, 0], 0)));

    let mut conn = ctx.writer_mut().hijack()?;
    conn.write_all(CONNECT_ESTABLISHED).await?;
    conn.flush().await?;

    let leaf = self.ca.issue(&host).await?;
    let acceptor = TlsAcceptor::from(leaf.server_config());
    let tls = tokio::time::timeout(self.handshake_timeout, acceptor.accept(Box::new(conn) as BoxStream))
      .await
      .map_err(|_| Error::Timeout(format!("client handshake for {}", authority)))?
      .map_err(|e| Error::tls_error(format!("client handshake for {}: {}", authority, e)))?;
    tracing::debug!("intercepted {} with leaf for {}", authority, leaf.domain());

    match self.strategy {
      TunnelStrategy::Inject => listener.inject(Socket::tls(tls, peer, authority)).await?,
      TunnelStrategy::Loopback => {
        let origin = TlsOrigin {
          server_name: tls.get_ref().1.server_name().map(str::to_string),
          authority,
        };
        let inner = listener.connect_loopback(origin).await?;
        splice(tls, inner).await?;
      }
    }
    Ok(None)
  }
}

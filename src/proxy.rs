//! Proxy assembly
use crate::ca::CertificateAuthority;
use crate::config::ProxyConfig;
use crate::dialer::RacingDialer;
use crate::dns::Resolver;
use crate::errors::Result;
use crate::filters::{DirectFilter, MitmFilter, StubFilter};
use crate::handler::ConnectionHandler;
use crate::listener::Listener;
use crate::pipeline::Pipeline;
use std::sync::Arc;

/// An intercepting forward proxy: certificate authority, resolver, dialer
/// and filter pipeline wired to a listener.
pub struct Proxy {
  config: ProxyConfig,
  ca: Arc<CertificateAuthority>,
  resolver: Arc<Resolver>,
  dialer: RacingDialer,
  handler: ConnectionHandler,
}

impl Proxy {
  /// Builds every component from `config`.
  ///
  /// The default pipeline is stub (when rules exist), then MITM (when sites
  /// exist), then direct.
  pub async fn new(config: ProxyConfig) -> Result<Self> {
    let ca = Arc::new(CertificateAuthority::load_or_create(&config.ca).await?);
    let resolver = Arc::new(Resolver::new(config.dns_servers.clone()));
    for (host, addrs) in &config.hosts {
      resolver.set_host(host, addrs.clone());
    }
    for (suffix, target) in &config.cnames {
      resolver.set_cname(suffix, target);
    }
    let tls = crate::tls::client_config(config.verify_upstream, &[])?;
    let dialer = RacingDialer::new(resolver.clone(), config.dial_timeout, tls)
      .nodelay(config.nodelay)
      .keepalive(config.keepalive);

    let mut builder = Pipeline::builder();
    if !config.stubs.is_empty() {
      builder = builder.filter(Arc::new(StubFilter::new(config.stubs.clone())));
    }
    if !config.mitm_sites.is_empty() {
      let mitm = MitmFilter::new(ca.clone(), config.mitm_sites.clone(), config.tunnel_strategy)
        .handshake_timeout(config.read_timeout);
      builder = builder.filter(Arc::new(mitm));
    }
    let direct = DirectFilter::new(dialer.clone(), config.read_timeout);
    let pipeline = builder.filter(Arc::new(direct)).build()?;
    Ok(Self::from_parts(config, ca, resolver, dialer, pipeline))
  }

  /// Assembles a proxy around a custom pipeline.
  pub fn from_parts(
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    resolver: Arc<Resolver>,
    dialer: RacingDialer,
    pipeline: Pipeline,
  ) -> Self {
    let handler = ConnectionHandler::new(
      Arc::new(pipeline),
      config.read_timeout,
      config.write_timeout,
    );
    Self {
      config,
      ca,
      resolver,
      dialer,
      handler,
    }
  }

  /// Binds the configured listen address.
  pub async fn bind(&self) -> Result<Listener> {
    Listener::bind(self.config.listen, self.config.accept_queue).await
  }

  /// Serves connections from `listener`, one task each, until the listener
  /// fails.
  pub async fn serve(&self, mut listener: Listener) -> Result<()> {
    let handle = listener.handle();
    loop {
      let socket = listener.accept().await?;
      let handler = self.handler.clone();
      let handle = handle.clone();
      tokio::spawn(async move {
        let peer = socket.peer_addr();
        if let Err(e) = handler.serve(socket, Some(handle)).await {
          tracing::debug!("{} connection ended with error: {}", peer, e);
        }
      });
    }
  }

  /// Binds and serves.
  pub async fn run(&self) -> Result<()> {
    let listener = self.bind().await?;
    self.serve(listener).await
  }

  /// The certificate authority; its root must be trusted by clients.
  pub fn ca(&self) -> &Arc<CertificateAuthority> {
    &self.ca
  }
  /// The resolver; host entries can be changed while serving.
  pub fn resolver(&self) -> &Arc<Resolver> {
    &self.resolver
  }
  /// The upstream dialer.
  pub fn dialer(&self) -> &RacingDialer {
    &self.dialer
  }
  /// The filter chain.
  pub fn pipeline(&self) -> &Arc<Pipeline> {
    self.handler.pipeline()
  }
  /// Settings the proxy was built from.
  pub fn config(&self) -> &ProxyConfig {
    &self.config
  }
}

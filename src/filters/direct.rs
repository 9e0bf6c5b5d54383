use crate::context::{Context, FilterArgs};
use crate::dialer::RacingDialer;
use crate::errors::{Error, Result};
use crate::pipeline::{Fetcher, Filter, Pipeline, RequestFilter, Role};
use crate::request::Request;
use crate::response::{strip_hop_by_hop, Response, ResponseBuilder};
use crate::tunnel::connect_tunnel;
use http::HeaderValue;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncWriteExt, BufReader};

/// Sends requests straight to their origin server.
///
/// Plain requests are fetched over a fresh raced connection; CONNECT
/// requests become a passthrough tunnel.
#[derive(Debug, Clone)]
pub struct DirectFilter {
  dialer: RacingDialer,
  read_timeout: Duration,
}

impl DirectFilter {
  /// `read_timeout` bounds the wait for the upstream response head.
  pub fn new(dialer: RacingDialer, read_timeout: Duration) -> Self {
    Self {
      dialer,
      read_timeout,
    }
  }
}

impl Filter for DirectFilter {
  fn name(&self) -> &'static str {
    "DIRECT"
  }
  fn roles(self: Arc<Self>) -> Vec<Role> {
    vec![Role::Request(self.clone()), Role::Fetch(self)]
  }
}

#[async_trait::async_trait]
impl RequestFilter for DirectFilter {
  async fn filter(&self, _ctx: &mut Context, _req: &Request) -> Result<Option<FilterArgs>> {
    Ok(Some(FilterArgs::new()))
  }

  async fn handle_request(
    &self,
    pipeline: &Pipeline,
    ctx: &mut Context,
    _args: Option<FilterArgs>,
    req: Request,
  ) -> Result<Option<Response>> {
    if req.is_connect() {
      connect_tunnel(ctx, &self.dialer, &req).await?;
      return Ok(None);
    }
    pipeline.fetch(ctx, req).await.map(Some)
  }
}

#[async_trait::async_trait]
impl Fetcher for DirectFilter {
  async fn fetch(&self, _ctx: &mut Context, mut req: Request) -> Result<Response> {
    if req.is_connect() {
      return Err(Error::invalid_request("CONNECT cannot be fetched"));
    }
    let (host, port) = req.host_port()?;
    let tls = match req.uri().scheme_str() {
      Some("https") => true,
      Some("http") | None => false,
      Some(other) => {
        return Err(Error::invalid_request(format!("unsupported scheme {}", other)));
      }
    };
    strip_hop_by_hop(req.headers_mut());
    req
      .headers_mut()
      .insert(http::header::CONNECTION, HeaderValue::from_static("close"));

    let mut upstream = self.dialer.connect_stream(&host, port, tls).await?;
    upstream.write_all(&req.to_raw()).await?;
    upstream.flush().await?;
    let resp = ResponseBuilder::new(BufReader::new(upstream), req.method().clone())
      .head_timeout(self.read_timeout)
      .build()
      .await?;
    tracing::trace!("{} {} -> {}", req.method(), req.uri(), resp.status_code());
    Ok(resp.for_request(&req))
  }
}

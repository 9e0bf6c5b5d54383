use crate::config::{site_matches, StubRule};
use crate::context::{Context, FilterArgs};
use crate::errors::{Error, Result};
use crate::pipeline::{Filter, Pipeline, RequestFilter, Role};
use crate::request::Request;
use crate::response::Response;
use http::header::{HeaderName, HeaderValue};
use http::{HeaderMap, StatusCode};
use std::sync::Arc;

const STATUS: &str = "StatusCode";
const HEADER: &str = "Header";
const BODY: &str = "Body";

/// Answers requests to configured hosts with a canned response instead of
/// contacting them.
#[derive(Debug, Clone)]
pub struct StubFilter {
  rules: Vec<StubRule>,
}

impl StubFilter {
  /// Rules are tried in order; the first rule whose sites match is used.
  pub fn new(rules: Vec<StubRule>) -> Self {
    Self { rules }
  }

  fn args(rule: &StubRule) -> Result<FilterArgs> {
    let mut headers = HeaderMap::new();
    for (name, value) in &rule.headers {
      let name = HeaderName::from_bytes(name.as_bytes()).map_err(http::Error::from)?;
      headers.append(name, HeaderValue::from_str(value)?);
    }
    Ok(
      FilterArgs::new()
        .with(STATUS, i64::from(rule.status))
        .with(HEADER, headers)
        .with(BODY, rule.body.as_str()),
    )
  }
}

impl Filter for StubFilter {
  fn name(&self) -> &'static str {
    "STUB"
  }
  fn roles(self: Arc<Self>) -> Vec<Role> {
    vec![Role::Request(self)]
  }
}

#[async_trait::async_trait]
impl RequestFilter for StubFilter {
  async fn filter(&self, _ctx: &mut Context, req: &Request) -> Result<Option<FilterArgs>> {
    if req.is_connect() {
      return Ok(None);
    }
    let (host, _) = req.host_port()?;
    match self.rules.iter().find(|r| site_matches(&r.sites, &host)) {
      Some(rule) => Self::args(rule).map(Some),
      None => Ok(None),
    }
  }

  async fn handle_request(
    &self,
    pipeline: &Pipeline,
    ctx: &mut Context,
    args: Option<FilterArgs>,
    req: Request,
  ) -> Result<Option<Response>> {
    let Some(args) = args else {
      return pipeline.fetch(ctx, req).await.map(Some);
    };
    let code = args.get_int(STATUS)?;
    let status = u16::try_from(code)
      .ok()
      .and_then(|c| StatusCode::from_u16(c).ok())
      .ok_or_else(|| Error::pipeline_error(format!("invalid stub status {}", code)))?;
    let body = args.get_string(BODY)?.to_string();
    let mut builder = Response::builder().status(status);
    if let Some(headers) = builder.headers_mut() {
      headers.extend(args.get_headers(HEADER)?.clone());
    }
    let resp: Response = builder.body(body)?.into();
    Ok(Some(resp.for_request(&req)))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::writer::ResponseWriter;

  fn rule() -> StubRule {
    StubRule {
      sites: vec!["ads.example".to_string()],
      status: 403,
      headers: vec![("X-Stub".to_string(), "1".to_string())],
      body: "blocked".to_string(),
    }
  }

  #[tokio::test]
  async fn canned_response_for_matching_hosts() {
    let stub = Arc::new(StubFilter::new(vec![rule()]));
    let pipeline = Pipeline::builder().filter(stub.clone()).build().unwrap();
    let mut ctx = Context::new(ResponseWriter::buffer(), None, None, false);
    let req: Request = Request::builder()
      .uri("http://cdn.ads.example/banner.js")
      .body(Vec::new())
      .unwrap()
      .into();
    let args = stub.filter(&mut ctx, &req).await.unwrap().unwrap();
    assert_eq!(args.get_int(STATUS).unwrap(), 403);
    let resp = stub
      .handle_request(&pipeline, &mut ctx, Some(args), req)
      .await
      .unwrap()
      .unwrap();
    assert_eq!(resp.status_code(), StatusCode::FORBIDDEN);
    assert_eq!(resp.headers()["x-stub"], "1");
    assert_eq!(resp.body().as_deref().map(|b| b.as_ref()), Some(&b"blocked"[..]));

    let other: Request = Request::builder()
      .uri("http://example.org/")
      .body(Vec::new())
      .unwrap()
      .into();
    assert!(stub.filter(&mut ctx, &other).await.unwrap().is_none());
  }
}

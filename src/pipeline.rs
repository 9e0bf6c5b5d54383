//! Request, fetch and response filter chain
//!
//! Each registered filter declares its roles once. A request walks the
//! request filters in order; the first one that matches handles it, and when
//! none matches the last registered request filter handles it anyway. The
//! response, if any, goes through the response filters the same way.

use crate::context::{Context, FilterArgs};
use crate::errors::{Error, Result};
use crate::filters::RawResponseFilter;
use crate::request::Request;
use crate::response::Response;
use http::StatusCode;
use std::sync::Arc;

/// A filter component and the roles it plays.
pub trait Filter: Send + Sync + 'static {
  /// Short name used in access logs.
  fn name(&self) -> &'static str;
  /// Role handles of this filter, queried once at registration.
  fn roles(self: Arc<Self>) -> Vec<Role>;
}

/// One capability of a [`Filter`].
#[derive(Clone)]
pub enum Role {
  /// decides on and handles requests
  Request(Arc<dyn RequestFilter>),
  /// performs upstream round trips
  Fetch(Arc<dyn Fetcher>),
  /// decides on and writes responses
  Response(Arc<dyn ResponseFilter>),
}

/// Request role
#[async_trait::async_trait]
pub trait RequestFilter: Filter {
  /// Returns arguments when this filter takes over `req`.
  async fn filter(&self, ctx: &mut Context, req: &Request) -> Result<Option<FilterArgs>>;
  /// Handles `req`. `args` is `None` when the filter runs only because it
  /// is the last one. A returned response goes through the response filters;
  /// `None` means the filter answered the client itself.
  async fn handle_request(
    &self,
    pipeline: &Pipeline,
    ctx: &mut Context,
    args: Option<FilterArgs>,
    req: Request,
  ) -> Result<Option<Response>>;
}

/// Fetch role: one upstream round trip.
#[async_trait::async_trait]
pub trait Fetcher: Filter {
  /// Sends `req` upstream and reads the response.
  async fn fetch(&self, ctx: &mut Context, req: Request) -> Result<Response>;
}

/// Response role
#[async_trait::async_trait]
pub trait ResponseFilter: Filter {
  /// Returns arguments when this filter takes over `resp`.
  async fn filter(&self, ctx: &mut Context, resp: &Response) -> Result<Option<FilterArgs>>;
  /// Delivers `resp` to the client.
  async fn handle_response(
    &self,
    ctx: &mut Context,
    args: Option<FilterArgs>,
    resp: Response,
  ) -> Result<()>;
}

/// What happened to one request, for the access log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Outcome {
  /// request filter that handled the request
  pub filter: &'static str,
  /// status written to the client, if a response went through the pipeline
  pub status: Option<StatusCode>,
  /// body length of that response
  pub content_length: Option<u64>,
}

/// An immutable filter chain.
pub struct Pipeline {
  request: Vec<Arc<dyn RequestFilter>>,
  fetchers: Vec<Arc<dyn Fetcher>>,
  response: Vec<Arc<dyn ResponseFilter>>,
}

impl Pipeline {
  /// Starts an empty chain.
  pub fn builder() -> PipelineBuilder {
    PipelineBuilder::default()
  }

  /// Names of the request filters in order.
  pub fn request_filters(&self) -> Vec<&'static str> {
    self.request.iter().map(|f| f.name()).collect()
  }

  /// Names of the response filters in order.
  pub fn response_filters(&self) -> Vec<&'static str> {
    self.response.iter().map(|f| f.name()).collect()
  }

  /// Performs a round trip with the first registered fetcher.
  pub async fn fetch(&self, ctx: &mut Context, req: Request) -> Result<Response> {
    let fetcher = self
      .fetchers
      .first()
      .ok_or_else(|| Error::pipeline_error("no fetcher registered"))?;
    tracing::trace!("{} fetching {}", fetcher.name(), req.uri());
    fetcher.fetch(ctx, req).await
  }

  /// Runs `req` through the chain.
  pub async fn handle(&self, ctx: &mut Context, req: Request) -> Result<Outcome> {
    let mut chosen = None;
    for f in &self.request {
      if let Some(args) = f.filter(ctx, &req).await? {
        chosen = Some((f, Some(args)));
        break;
      }
    }
    let (filter, args) = match chosen {
      Some(c) => c,
      None => match self.request.last() {
        Some(last) => (last, None),
        None => return Err(Error::pipeline_error("no request filter registered")),
      },
    };
    let mut outcome = Outcome {
      filter: filter.name(),
      status: None,
      content_length: None,
    };
    let Some(resp) = filter.handle_request(self, ctx, args, req).await? else {
      return Ok(outcome);
    };
    outcome.status = Some(resp.status_code());
    outcome.content_length = resp.body().as_ref().map(|b| b.len() as u64);
    self.respond(ctx, resp).await?;
    Ok(outcome)
  }

  async fn respond(&self, ctx: &mut Context, resp: Response) -> Result<()> {
    let mut chosen = None;
    for f in &self.response {
      if let Some(args) = f.filter(ctx, &resp).await? {
        chosen = Some((f, Some(args)));
        break;
      }
    }
    let (filter, args) = match chosen {
      Some(c) => c,
      None => match self.response.last() {
        Some(last) => (last, None),
        None => return Err(Error::pipeline_error("no response filter registered")),
      },
    };
    filter.handle_response(ctx, args, resp).await
  }
}

/// Collects filters in registration order.
#[derive(Default)]
pub struct PipelineBuilder {
  request: Vec<Arc<dyn RequestFilter>>,
  fetchers: Vec<Arc<dyn Fetcher>>,
  response: Vec<Arc<dyn ResponseFilter>>,
}

impl PipelineBuilder {
  /// Registers every role of `filter`.
  pub fn filter<F: Filter>(mut self, filter: Arc<F>) -> Self {
    let name = filter.name();
    let roles = filter.roles();
    if roles.is_empty() {
      tracing::warn!("filter {} declares no roles", name);
    }
    for role in roles {
      match role {
        Role::Request(f) => self.request.push(f),
        Role::Fetch(f) => self.fetchers.push(f),
        Role::Response(f) => self.response.push(f),
      }
    }
    self
  }

  /// Freezes the chain. Without a response filter, responses are written to
  /// the client unchanged.
  pub fn build(mut self) -> Result<Pipeline> {
    if self.request.is_empty() {
      return Err(Error::pipeline_error("at least one request filter is required"));
    }
    if self.response.is_empty() {
      self.response.push(Arc::new(RawResponseFilter));
    }
    Ok(Pipeline {
      request: self.request,
      fetchers: self.fetchers,
      response: self.response,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::writer::ResponseWriter;
  use std::sync::Mutex;

  struct Recorder {
    name: &'static str,
    matches: bool,
    calls: Mutex<Vec<Option<usize>>>,
  }

  impl Recorder {
    fn new(name: &'static str, matches: bool) -> Arc<Self> {
      Arc::new(Self {
        name,
        matches,
        calls: Mutex::new(Vec::new()),
      })
    }
  }

  impl Filter for Recorder {
    fn name(&self) -> &'static str {
      self.name
    }
    fn roles(self: Arc<Self>) -> Vec<Role> {
      vec![Role::Request(self)]
    }
  }

  #[async_trait::async_trait]
  impl RequestFilter for Recorder {
    async fn filter(&self, _ctx: &mut Context, _req: &Request) -> Result<Option<FilterArgs>> {
      Ok(self.matches.then(|| FilterArgs::new().with("by", self.name)))
    }
    async fn handle_request(
      &self,
      _pipeline: &Pipeline,
      _ctx: &mut Context,
      args: Option<FilterArgs>,
      _req: Request,
    ) -> Result<Option<Response>> {
      self.calls.lock().unwrap().push(args.map(|a| a.len()));
      let resp = Response::builder()
        .status(StatusCode::NO_CONTENT)
        .body(Vec::new())?;
      Ok(Some(resp.into()))
    }
  }

  fn request() -> Request {
    Request::builder()
      .uri("http://example.com/")
      .body(Vec::new())
      .unwrap()
      .into()
  }

  fn context() -> Context {
    Context::new(ResponseWriter::buffer(), None, None, false)
  }

  #[tokio::test]
  async fn last_filter_runs_when_nothing_matches() {
    let first = Recorder::new("first", false);
    let last = Recorder::new("last", false);
    let pipeline = Pipeline::builder()
      .filter(first.clone())
      .filter(last.clone())
      .build()
      .unwrap();
    let mut ctx = context();
    let outcome = pipeline.handle(&mut ctx, request()).await.unwrap();
    assert_eq!(outcome.filter, "last");
    assert_eq!(outcome.status, Some(StatusCode::NO_CONTENT));
    assert!(first.calls.lock().unwrap().is_empty());
    assert_eq!(*last.calls.lock().unwrap(), vec![None]);
    let written = String::from_utf8_lossy(ctx.writer().buffered().unwrap()).to_string();
    assert!(written.starts_with("HTTP/1.1 204 No Content\r\n"));
  }

  #[tokio::test]
  async fn first_match_short_circuits() {
    let skip = Recorder::new("skip", false);
    let hit = Recorder::new("hit", true);
    let never = Recorder::new("never", true);
    let pipeline = Pipeline::builder()
      .filter(skip.clone())
      .filter(hit.clone())
      .filter(never.clone())
      .build()
      .unwrap();
    assert_eq!(pipeline.request_filters(), vec!["skip", "hit", "never"]);
    assert_eq!(pipeline.response_filters(), vec!["RAW"]);
    let outcome = pipeline.handle(&mut context(), request()).await.unwrap();
    assert_eq!(outcome.filter, "hit");
    assert_eq!(*hit.calls.lock().unwrap(), vec![Some(1)]);
    assert!(never.calls.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn fetch_without_fetcher_fails() {
    let pipeline = Pipeline::builder()
      .filter(Recorder::new("only", true))
      .build()
      .unwrap();
    assert!(matches!(
      pipeline.fetch(&mut context(), request()).await,
      Err(Error::Pipeline(_))
    ));
    assert!(Pipeline::builder().build().is_err());
  }
}

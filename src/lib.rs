#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

//! # sluice
//!
//! The `sluice` crate is the core of an intercepting HTTP/HTTPS forward
//! proxy.
//!
//! - A [filter pipeline](Pipeline) that decides, per request, who fetches it
//!   and who writes the response
//! - A [certificate authority](CertificateAuthority) that mints leaf
//!   certificates on demand to intercept CONNECT tunnels
//! - A [racing dialer](RacingDialer) that connects to every address of an
//!   upstream at once and keeps the fastest
//! - A [resolver](Resolver) with a static host table and suffix aliases
//! - A [listener](Listener) with accept backoff and connection injection
//!
//! ## Running a proxy
//!
//! ```rust,no_run
//! # async fn run() -> sluice::Result<()> {
//! let config = sluice::ProxyConfig {
//!   mitm_sites: vec!["example.com".to_string()],
//!   ..Default::default()
//! };
//! let proxy = sluice::Proxy::new(config).await?;
//! println!("trust this root:\n{}", proxy.ca().root().pem());
//! proxy.run().await
//! # }
//! ```
//!
//! ## Custom filters
//!
//! A filter implements [`Filter`] and one or more of [`RequestFilter`],
//! [`Fetcher`] and [`ResponseFilter`]. Request filters are tried in
//! registration order and the first match handles the request; the last
//! registered request filter handles whatever nothing else matched.
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use sluice::{Context, Filter, FilterArgs, Pipeline, Request, RequestFilter, Response, Role};
//!
//! struct Deny;
//!
//! impl Filter for Deny {
//!   fn name(&self) -> &'static str {
//!     "DENY"
//!   }
//!   fn roles(self: Arc<Self>) -> Vec<Role> {
//!     vec![Role::Request(self)]
//!   }
//! }
//!
//! #[async_trait::async_trait]
//! impl RequestFilter for Deny {
//!   async fn filter(&self, _: &mut Context, req: &Request) -> sluice::Result<Option<FilterArgs>> {
//!     Ok(req.uri().path().starts_with("/ads").then(FilterArgs::new))
//!   }
//!   async fn handle_request(
//!     &self,
//!     _: &Pipeline,
//!     _: &mut Context,
//!     _: Option<FilterArgs>,
//!     _: Request,
//!   ) -> sluice::Result<Option<Response>> {
//!     let resp = Response::builder().status(403).body("denied")?;
//!     Ok(Some(resp.into()))
//!   }
//! }
//! ```
//!
//! ## Logging
//!
//! Diagnostics go through [`tracing`](https://docs.rs/tracing). One line per
//! request is logged at `info` level; install a subscriber to see it.
//!
//! ## Optional Features
//!
//! - **serde**: `Serialize` and `Deserialize` for the configuration types.

mod body;
pub mod ca;
mod config;
mod context;
mod dialer;
mod dns;
mod errors;
pub mod filters;
mod handler;
mod listener;
mod pipeline;
mod proxy;
mod request;
mod response;
mod socket;
pub mod tls;
mod tunnel;
mod writer;

pub use body::Body;
pub use ca::{registrable_domain, CertificateAuthority, LeafCertificate, RootCertificate};
pub use config::{CaConfig, ProxyConfig, StubRule, TunnelStrategy};
pub use context::{Context, FilterArgs, Value, Values};
pub use dialer::{race, RacingDialer};
pub use dns::Resolver;
pub use errors::{Error, Result};
pub use handler::ConnectionHandler;
pub use http::header;
pub use http::uri;
pub use http::Method;
pub use http::{StatusCode, Version};
pub use listener::{is_transient, Acceptor, Backoff, Listener, ListenerHandle};
pub use pipeline::{
  Fetcher, Filter, Outcome, Pipeline, PipelineBuilder, RequestFilter, ResponseFilter, Role,
};
pub use proxy::Proxy;
pub use request::Request;
pub use response::{strip_hop_by_hop, Response, ResponseBuilder};
pub use socket::{AsyncStream, BoxStream, MaybeTlsStream, Socket, TlsOrigin};
pub use tunnel::{connect_tunnel, splice, CONNECT_ESTABLISHED};
pub use writer::{ResponseWriter, WriteState};

pub(crate) const CR_LF: &[u8] = &[13, 10];
pub(crate) const SPACE: &[u8] = &[32];
pub(crate) const COLON_SPACE: &[u8] = &[58, 32];

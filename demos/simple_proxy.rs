//! Intercepting proxy with a stub rule
//!
//! Listens on 127.0.0.1:8000, intercepts HTTPS to example.com and answers
//! requests to ads.example with 204.
//!
//! To run:
//! ```bash
//! RUST_LOG=sluice=debug cargo run --example simple_proxy
//! curl --cacert CA.crt -x http://127.0.0.1:8000 https://example.com/
//! ```

use sluice::{Proxy, ProxyConfig, StubRule};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
  tracing_subscriber::fmt()
    .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("sluice=info")))
    .init();

  let config = ProxyConfig {
    mitm_sites: vec!["example.com".to_string()],
    stubs: vec![StubRule {
      sites: vec!["ads.example".to_string()],
      status: 204,
      ..Default::default()
    }],
    ..Default::default()
  };
  let proxy = Proxy::new(config).await?;
  println!("root CA written to {}", proxy.ca().path().display());
  println!("request filters: {:?}", proxy.pipeline().request_filters());
  proxy.run().await?;
  Ok(())
}

//! Proxy settings
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::time::Duration;

#[cfg(feature = "serde")]
use serde::{Deserialize, Serialize};

const DAY: u64 = 24 * 3600;

/// How a decrypted MITM connection re-enters the request pipeline.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "lowercase"))]
pub enum TunnelStrategy {
  /// Push the TLS connection into the listener queue.
  #[default]
  Inject,
  /// Connect to the listener over loopback and splice the two connections.
  Loopback,
}

/// Certificate authority settings
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct CaConfig {
  /// PEM file holding the root certificate followed by its private key
  pub path: PathBuf,
  /// Subject common name of a generated root
  pub common_name: String,
  /// Validity of a generated root
  pub validity: Duration,
  /// Validity of issued leaves
  pub leaf_validity: Duration,
  /// RSA modulus size for the root and the leaves
  pub key_bits: usize,
  /// Maximum number of cached leaves
  pub cache_capacity: u64,
}

impl Default for CaConfig {
  fn default() -> Self {
    Self {
      path: PathBuf::from("CA.crt"),
      common_name: "Sluice Root CA".to_string(),
      validity: Duration::from_secs(3 * 365 * DAY),
      leaf_validity: Duration::from_secs(365 * DAY),
      key_bits: 2048,
      cache_capacity: 512,
    }
  }
}

/// A canned answer for matching hosts.
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct StubRule {
  /// Host suffixes this rule applies to; `*` matches every host
  pub sites: Vec<String>,
  /// Response status
  pub status: u16,
  /// Extra response headers
  pub headers: Vec<(String, String)>,
  /// Response body
  pub body: String,
}

impl Default for StubRule {
  fn default() -> Self {
    Self {
      sites: Vec::new(),
      status: 200,
      headers: Vec::new(),
      body: String::new(),
    }
  }
}

/// Configuration for the proxy
#[derive(Debug, Clone)]
#[cfg_attr(feature = "serde", derive(Serialize, Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct ProxyConfig {
  /// Address the listener binds
  pub listen: SocketAddr,
  /// Root CA settings
  pub ca: CaConfig,
  /// Bound of one dial attempt, handshake included
  pub dial_timeout: Duration,
  /// Bound of an idle read from a client
  pub read_timeout: Duration,
  /// Bound of a write to a client
  pub write_timeout: Duration,
  /// DNS servers; the system configuration is used when empty
  pub dns_servers: Vec<SocketAddr>,
  /// Static host table
  pub hosts: HashMap<String, Vec<IpAddr>>,
  /// Suffix aliases `(suffix, target)` checked in order
  pub cnames: Vec<(String, String)>,
  /// Host suffixes whose CONNECT tunnels are intercepted; `*` matches all
  pub mitm_sites: Vec<String>,
  /// Canned responses
  pub stubs: Vec<StubRule>,
  /// Re-entry of decrypted connections
  pub tunnel_strategy: TunnelStrategy,
  /// Verify upstream server certificates
  pub verify_upstream: bool,
  /// Disable Nagle on upstream connections
  pub nodelay: bool,
  /// TCP keepalive for upstream connections
  pub keepalive: Option<Duration>,
  /// Capacity of the accepted-connection queue
  pub accept_queue: usize,
}

impl Default for ProxyConfig {
  fn default() -> Self {
    Self {
      listen: SocketAddr::from(([127, 0, 0, 1], 8000)),
      ca: CaConfig::default(),
      dial_timeout: Duration::from_secs(8),
      read_timeout: Duration::from_secs(10),
      write_timeout: Duration::from_secs(10),
      dns_servers: Vec::new(),
      hosts: HashMap::new(),
      cnames: Vec::new(),
      mitm_sites: Vec::new(),
      stubs: Vec::new(),
      tunnel_strategy: TunnelStrategy::default(),
      verify_upstream: true,
      nodelay: true,
      keepalive: None,
      accept_queue: 200,
    }
  }
}

/// Whether `host` equals one of `sites` or is a subdomain of one.
pub(crate) fn site_matches(sites: &[String], host: &str) -> bool {
  let host = host.trim_end_matches('.').as_bytes();
  sites.iter().any(|site| {
    let site = site.trim_start_matches("*.").trim_start_matches('.');
    if site == "*" {
      return true;
    }
    let site = site.as_bytes();
    host.eq_ignore_ascii_case(site)
      || (host.len() > site.len()
        && host[host.len() - site.len()..].eq_ignore_ascii_case(site)
        && host[host.len() - site.len() - 1] == b'.')
  })
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn defaults() {
    let config = ProxyConfig::default();
    assert_eq!(config.listen, "127.0.0.1:8000".parse().unwrap());
    assert_eq!(config.ca.path, PathBuf::from("CA.crt"));
    assert_eq!(config.ca.key_bits, 2048);
    assert_eq!(config.ca.cache_capacity, 512);
    assert_eq!(config.dial_timeout, Duration::from_secs(8));
    assert_eq!(config.accept_queue, 200);
    assert_eq!(config.tunnel_strategy, TunnelStrategy::Inject);
  }

  #[test]
  fn suffix_matching() {
    let sites = vec!["example.com".to_string(), ".example.org".to_string()];
    assert!(site_matches(&sites, "example.com"));
    assert!(site_matches(&sites, "www.Example.com"));
    assert!(site_matches(&sites, "a.example.org"));
    assert!(!site_matches(&sites, "badexample.com"));
    assert!(!site_matches(&sites, "example.net"));
    assert!(site_matches(&["*".to_string()], "anything.test"));
  }

  #[cfg(feature = "serde")]
  #[test]
  fn deserialize_partial() {
    let config: ProxyConfig = serde_json::from_str(
      r#"{"listen":"0.0.0.0:8080","mitm_sites":["example.com"],"tunnel_strategy":"loopback"}"#,
    )
    .unwrap();
    assert_eq!(config.listen.port(), 8080);
    assert_eq!(config.tunnel_strategy, TunnelStrategy::Loopback);
    assert!(config.verify_upstream);
  }
}

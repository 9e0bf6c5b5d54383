//! Name resolution with a static host table and suffix aliases.
//!
//! Lookups consult the in-memory tables first and fall back to a DNS client
//! (hickory) over UDP. The tables can be updated while the proxy runs.

use crate::errors::{Error, Result};
use hickory_resolver::config::{NameServerConfig, NameServerConfigGroup, ResolverConfig};
use hickory_resolver::name_server::TokioConnectionProvider;
use hickory_resolver::proto::xfer::Protocol;
use hickory_resolver::TokioResolver;
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{PoisonError, RwLock};

#[derive(Default)]
struct Tables {
  hosts: HashMap<String, Vec<IpAddr>>,
  aliases: Vec<(String, String)>,
}

/// Hostname to address resolver.
pub struct Resolver {
  tables: RwLock<Tables>,
  dns: TokioResolver,
}

impl Resolver {
  /// Creates a resolver querying `dns_servers`, or the system configuration
  /// when the list is empty.
  pub fn new(dns_servers: Vec<SocketAddr>) -> Self {
    let dns = if dns_servers.is_empty() {
      match TokioResolver::builder_tokio() {
        Ok(builder) => builder.build(),
        Err(e) => {
          tracing::warn!("system resolver configuration unavailable, using defaults: {}", e);
          TokioResolver::builder_with_config(
            ResolverConfig::default(),
            TokioConnectionProvider::default(),
          )
          .build()
        }
      }
    } else {
      let name_servers: Vec<NameServerConfig> = dns_servers
        .into_iter()
        .map(|addr| NameServerConfig::new(addr, Protocol::Udp))
        .collect();
      let config = ResolverConfig::from_parts(None, vec![], NameServerConfigGroup::from(name_servers));
      TokioResolver::builder_with_config(config, TokioConnectionProvider::default()).build()
    };
    Self {
      tables: RwLock::new(Tables::default()),
      dns,
    }
  }

  /// Pins `host` to `addrs`, replacing earlier entries.
  pub fn set_host(&self, host: &str, addrs: Vec<IpAddr>) {
    let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
    tables.hosts.insert(normalize(host), addrs);
  }

  /// Resolves names ending in `suffix` through the host-table entry of
  /// `target`. Re-registering a suffix replaces its target in place.
  pub fn set_cname(&self, suffix: &str, target: &str) {
    let suffix = normalize(suffix);
    let target = normalize(target);
    let mut tables = self.tables.write().unwrap_or_else(PoisonError::into_inner);
    match tables.aliases.iter_mut().find(|(s, _)| *s == suffix) {
      Some(entry) => entry.1 = target,
      None => tables.aliases.push((suffix, target)),
    }
  }

  /// Table lookup only. The first alias whose suffix matches is applied;
  /// aliases are never chained.
  pub fn lookup_in_memory(&self, name: &str) -> Option<Vec<IpAddr>> {
    let name = normalize(name);
    let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
    if let Some(addrs) = tables.hosts.get(&name) {
      return Some(addrs.clone());
    }
    let (_, target) = tables
      .aliases
      .iter()
      .find(|(suffix, _)| name.ends_with(suffix.as_str()))?;
    tracing::trace!("{} aliased to {}", name, target);
    tables.hosts.get(target).cloned()
  }

  /// Candidate addresses of `name`.
  pub async fn lookup_host(&self, name: &str) -> Result<Vec<IpAddr>> {
    let bare = name.trim_start_matches('[').trim_end_matches(']');
    if let Ok(ip) = bare.parse::<IpAddr>() {
      return Ok(vec![ip]);
    }
    if let Some(addrs) = self.lookup_in_memory(bare) {
      if !addrs.is_empty() {
        return Ok(addrs);
      }
    }
    let lookup = self.dns.lookup_ip(bare).await.map_err(|e| Error::Resolve {
      host: bare.to_string(),
      reason: e.to_string(),
    })?;
    let addrs: Vec<IpAddr> = lookup.iter().collect();
    if addrs.is_empty() {
      return Err(Error::Resolve {
        host: bare.to_string(),
        reason: "no addresses found".to_string(),
      });
    }
    tracing::debug!("resolved {} to {:?}", bare, addrs);
    Ok(addrs)
  }

  /// Candidate socket addresses of `host:port`.
  pub async fn resolve(&self, host: &str, port: u16) -> Result<Vec<SocketAddr>> {
    Ok(
      self
        .lookup_host(host)
        .await?
        .into_iter()
        .map(|ip| SocketAddr::new(ip, port))
        .collect(),
    )
  }
}

impl std::fmt::Debug for Resolver {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let tables = self.tables.read().unwrap_or_else(PoisonError::into_inner);
    f.debug_struct("Resolver")
      .field("hosts", &tables.hosts.len())
      .field("aliases", &tables.aliases)
      .finish()
  }
}

fn normalize(name: &str) -> String {
  name.trim_end_matches('.').to_ascii_lowercase()
}

#[cfg(test)]
mod tests {
  use super::*;

  fn ip(s: &str) -> IpAddr {
    s.parse().unwrap()
  }

  #[tokio::test]
  async fn host_table_and_literals() {
    let resolver = Resolver::new(vec!["127.0.0.1:53".parse().unwrap()]);
    resolver.set_host("Example.COM", vec![ip("10.0.0.1"), ip("10.0.0.2")]);
    assert_eq!(
      resolver.lookup_host("example.com.").await.unwrap(),
      vec![ip("10.0.0.1"), ip("10.0.0.2")]
    );
    assert_eq!(resolver.lookup_host("[::1]").await.unwrap(), vec![ip("::1")]);
    let addrs = resolver.resolve("example.com", 443).await.unwrap();
    assert_eq!(addrs[0], "10.0.0.1:443".parse().unwrap());
  }

  #[tokio::test]
  async fn first_registered_suffix_wins_without_chaining() {
    let resolver = Resolver::new(vec!["127.0.0.1:53".parse().unwrap()]);
    resolver.set_host("edge-a", vec![ip("10.1.0.1")]);
    resolver.set_host("edge-b", vec![ip("10.2.0.1")]);
    resolver.set_host("cdn.example.net", vec![ip("10.3.0.1")]);
    resolver.set_cname(".example.com", "edge-a");
    resolver.set_cname(".static.example.com", "edge-b");
    resolver.set_cname(".example.org", "cdn.example.net");
    resolver.set_cname(".example.net", "edge-b");

    assert_eq!(
      resolver.lookup_in_memory("img.static.example.com"),
      Some(vec![ip("10.1.0.1")])
    );
    // the alias target is looked up in the host table only
    assert_eq!(
      resolver.lookup_in_memory("www.example.org"),
      Some(vec![ip("10.3.0.1")])
    );
    assert_eq!(resolver.lookup_in_memory("unknown.test"), None);

    resolver.set_cname(".example.com", "edge-b");
    assert_eq!(
      resolver.lookup_in_memory("www.example.com"),
      Some(vec![ip("10.2.0.1")])
    );
  }

  #[tokio::test]
  async fn alias_without_host_entry_misses() {
    let resolver = Resolver::new(vec!["127.0.0.1:53".parse().unwrap()]);
    resolver.set_cname(".example.com", "nowhere");
    assert_eq!(resolver.lookup_in_memory("www.example.com"), None);
  }
}

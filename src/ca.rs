//! Certificate Authority (CA) used to intercept TLS tunnels
//!
//! One RSA root is loaded from (or generated into) a single PEM file. Leaf
//! certificates are minted on demand, one per registrable domain, and kept
//! in a bounded in-memory cache.

use crate::config::CaConfig;
use crate::errors::{Error, Result};
use moka::future::Cache;
use rcgen::{
  BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa,
  Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use rsa::pkcs1::{DecodeRsaPrivateKey, EncodeRsaPrivateKey, LineEnding};
use rsa::pkcs8::EncodePrivateKey;
use rsa::RsaPrivateKey;
use rustls_pemfile::Item;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use time::{Duration, OffsetDateTime};
use tokio::fs;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use tokio_rustls::rustls::ServerConfig;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Backdating of the root to tolerate clock skew
const ROOT_NOT_BEFORE_OFFSET: Duration = Duration::minutes(5);
/// Backdating of issued leaves to tolerate clock skew
const LEAF_NOT_BEFORE_OFFSET: Duration = Duration::minutes(10);

/// The self-signed root. Immutable once loaded.
pub struct RootCertificate {
  cert_der: CertificateDer<'static>,
  cert_pem: String,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  serial: Vec<u8>,
}

impl RootCertificate {
  /// DER encoding, for trust stores.
  pub fn der(&self) -> &CertificateDer<'static> {
    &self.cert_der
  }
  /// PEM encoding, for installation into clients.
  pub fn pem(&self) -> &str {
    &self.cert_pem
  }
  /// Start of validity.
  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }
  /// End of validity.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
  /// Big-endian serial number.
  pub fn serial(&self) -> &[u8] {
    &self.serial
  }
}

/// A certificate minted for one registrable domain.
pub struct LeafCertificate {
  domain: String,
  chain: Vec<CertificateDer<'static>>,
  key: PrivateKeyDer<'static>,
  not_before: OffsetDateTime,
  not_after: OffsetDateTime,
  server_config: Arc<ServerConfig>,
}

impl LeafCertificate {
  /// The registrable domain this leaf covers.
  pub fn domain(&self) -> &str {
    &self.domain
  }
  /// `[leaf, root]`
  pub fn chain(&self) -> &[CertificateDer<'static>] {
    &self.chain
  }
  /// The leaf alone.
  pub fn cert_der(&self) -> &CertificateDer<'static> {
    &self.chain[0]
  }
  /// PKCS#8 private key of the leaf.
  pub fn key(&self) -> &PrivateKeyDer<'static> {
    &self.key
  }
  /// Start of validity.
  pub fn not_before(&self) -> OffsetDateTime {
    self.not_before
  }
  /// End of validity.
  pub fn not_after(&self) -> OffsetDateTime {
    self.not_after
  }
  /// Ready-made TLS server configuration presenting this leaf.
  pub fn server_config(&self) -> Arc<ServerConfig> {
    self.server_config.clone()
  }
}

/// Certificate Authority for generating certificates
pub struct CertificateAuthority {
  root: RootCertificate,
  issuer: Issuer<'static, KeyPair>,
  path: PathBuf,
  cache: Cache<String, Arc<LeafCertificate>>,
  leaf_validity: Duration,
  key_bits: usize,
  last_serial: AtomicU64,
  issued: AtomicU64,
}

impl CertificateAuthority {
  /// Load the root from `config.path`, or generate and persist it.
  pub async fn load_or_create(config: &CaConfig) -> Result<Self> {
    let path = config.path.clone();
    let last_serial = AtomicU64::new(0);
    let (root, issuer) = if fs::try_exists(&path).await? {
      tracing::info!("loading root CA from {}", path.display());
      Self::load_root(&path).await?
    } else {
      tracing::info!("generating {}-bit root CA into {}", config.key_bits, path.display());
      let serial = next_serial(&last_serial);
      Self::generate_root(&path, config, serial).await?
    };
    let cache = Cache::builder()
      .max_capacity(config.cache_capacity)
      .time_to_live(config.leaf_validity / 2)
      .build();
    Ok(Self {
      root,
      issuer,
      path,
      cache,
      leaf_validity: to_time_duration(config.leaf_validity),
      key_bits: config.key_bits,
      last_serial,
      issued: AtomicU64::new(0),
    })
  }

  async fn load_root(path: &Path) -> Result<(RootCertificate, Issuer<'static, KeyPair>)> {
    let pem = fs::read(path).await?;
    let mut cert_der = None;
    let mut key_pair = None;
    for item in rustls_pemfile::read_all(&mut pem.as_slice()) {
      let item = item.map_err(|e| {
        Error::crypto_error(format!("malformed PEM in {}: {}", path.display(), e))
      })?;
      match item {
        Item::X509Certificate(cert) if cert_der.is_none() => cert_der = Some(cert),
        Item::Pkcs1Key(key) if key_pair.is_none() => {
          let rsa = RsaPrivateKey::from_pkcs1_der(key.secret_pkcs1_der())
            .map_err(|e| Error::crypto_error(format!("invalid RSA root key: {}", e)))?;
          key_pair = Some(rsa_key_pair(&rsa)?);
        }
        Item::Pkcs8Key(key) if key_pair.is_none() => {
          key_pair = Some(
            KeyPair::from_pkcs8_der_and_sign_algo(&key, &PKCS_RSA_SHA256)
              .map_err(|e| Error::crypto_error(format!("invalid RSA root key: {}", e)))?,
          );
        }
        _ => {}
      }
    }
    let cert_der = cert_der.ok_or_else(|| {
      Error::crypto_error(format!("no CERTIFICATE block in {}", path.display()))
    })?;
    let key_pair = key_pair.ok_or_else(|| {
      Error::crypto_error(format!("no RSA PRIVATE KEY block in {}", path.display()))
    })?;
    let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)?;
    Ok((root_certificate(cert_der)?, issuer))
  }

  async fn generate_root(
    path: &Path,
    config: &CaConfig,
    serial: u64,
  ) -> Result<(RootCertificate, Issuer<'static, KeyPair>)> {
    let rsa = generate_rsa(config.key_bits).await?;
    let key_pair = rsa_key_pair(&rsa)?;

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, config.common_name.as_str());
    dn.push(DnType::OrganizationName, config.common_name.as_str());
    params.distinguished_name = dn;
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params.key_usages = vec![
      KeyUsagePurpose::KeyCertSign,
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
    params.serial_number = Some(SerialNumber::from(serial));
    let now = OffsetDateTime::now_utc();
    params.not_before = now - ROOT_NOT_BEFORE_OFFSET;
    params.not_after = now + to_time_duration(config.validity);

    let cert = params.self_signed(&key_pair)?;
    let key_pem = rsa
      .to_pkcs1_pem(LineEnding::LF)
      .map_err(|e| Error::crypto_error(format!("Failed to encode root key: {}", e)))?;
    let mut file = cert.pem();
    file.push_str(key_pem.as_str());
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
      fs::create_dir_all(parent).await?;
    }
    fs::write(path, file.as_bytes()).await?;

    let cert_der = cert.der().clone();
    let issuer = Issuer::from_ca_cert_der(&cert_der, key_pair)?;
    Ok((root_certificate(cert_der)?, issuer))
  }

  /// Get or mint the leaf covering `host`.
  ///
  /// Concurrent callers for the same registrable domain share one issuance
  /// and receive the same certificate object.
  pub async fn issue(&self, host: &str) -> Result<Arc<LeafCertificate>> {
    let domain = registrable_domain(host);
    if let Some(leaf) = self.cache.get(&domain).await {
      return Ok(leaf);
    }
    self
      .cache
      .try_get_with(domain.clone(), self.sign_leaf(domain))
      .await
      .map_err(|e| Arc::try_unwrap(e).unwrap_or_else(|e| Error::Crypto(e.to_string())))
  }

  async fn sign_leaf(&self, domain: String) -> Result<Arc<LeafCertificate>> {
    let rsa = generate_rsa(self.key_bits).await?;
    let key_pair = rsa_key_pair(&rsa)?;

    let mut params = CertificateParams::default();
    params.serial_number = Some(SerialNumber::from(next_serial(&self.last_serial)));
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, domain.as_str());
    params.distinguished_name = dn;
    params.subject_alt_names = leaf_sans(&domain)?;
    params.extended_key_usages = vec![
      ExtendedKeyUsagePurpose::ServerAuth,
      ExtendedKeyUsagePurpose::ClientAuth,
    ];
    params.key_usages = vec![
      KeyUsagePurpose::DigitalSignature,
      KeyUsagePurpose::KeyEncipherment,
    ];
    params.use_authority_key_identifier_extension = true;
    let now = OffsetDateTime::now_utc();
    params.not_before = now - LEAF_NOT_BEFORE_OFFSET;
    params.not_after = now + self.leaf_validity;

    let cert = params
      .signed_by(&key_pair, &self.issuer)
      .map_err(|e| Error::crypto_error(format!("Failed to sign leaf for {}: {}", domain, e)))?;
    let key = PrivateKeyDer::try_from(key_pair.serialize_der())
      .map_err(|_| Error::crypto_error("Failed to serialize leaf key"))?;
    let chain = vec![cert.der().clone(), self.root.cert_der.clone()];
    let server_config = crate::tls::mitm_server_config(chain.clone(), key.clone_key(), &self.root.cert_der)?;
    let issued = self.issued.fetch_add(1, Ordering::SeqCst) + 1;
    tracing::debug!("issued leaf #{} for {}", issued, domain);
    Ok(Arc::new(LeafCertificate {
      domain,
      chain,
      key,
      not_before: params.not_before,
      not_after: params.not_after,
      server_config,
    }))
  }

  /// The root certificate.
  pub fn root(&self) -> &RootCertificate {
    &self.root
  }
  /// Path of the PEM file holding the root.
  pub fn path(&self) -> &Path {
    &self.path
  }
  /// Number of leaves signed since start.
  pub fn issued_count(&self) -> u64 {
    self.issued.load(Ordering::SeqCst)
  }
}

/// The name a leaf is issued for: effective TLD plus one label, plus every
/// label but the first when the host has two or more labels in front of that.
///
/// `a.b.example.co.uk` becomes `b.example.co.uk`, `www.example.com` becomes
/// `example.com`, and `a.b.c.example.com` becomes `b.c.example.com` so that
/// the wildcard still covers the host. IP literals and names without a known
/// suffix are kept.
pub fn registrable_domain(host: &str) -> String {
  let host = host
    .trim_start_matches('[')
    .trim_end_matches(']')
    .trim_end_matches('.')
    .to_ascii_lowercase();
  if host.parse::<IpAddr>().is_ok() {
    return host;
  }
  let Some(domain) = psl::domain_str(&host) else {
    return host;
  };
  let prefix = host[..host.len() - domain.len()].trim_end_matches('.');
  match prefix.split_once('.') {
    Some((_, rest)) => format!("{}.{}", rest, domain),
    None => domain.to_string(),
  }
}

fn leaf_sans(domain: &str) -> Result<Vec<SanType>> {
  if let Ok(ip) = domain.parse::<IpAddr>() {
    return Ok(vec![SanType::IpAddress(ip)]);
  }
  let invalid = |_| Error::crypto_error(format!("Invalid domain name: {}", domain));
  Ok(vec![
    SanType::DnsName(format!("*.{}", domain).try_into().map_err(invalid)?),
    SanType::DnsName(domain.try_into().map_err(invalid)?),
  ])
}

/// Time-derived serial that never repeats within this process.
fn next_serial(last: &AtomicU64) -> u64 {
  let now = OffsetDateTime::now_utc().unix_timestamp_nanos() as u64;
  let prev = last
    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |prev| {
      Some(now.max(prev + 1))
    })
    .unwrap_or_else(|prev| prev);
  now.max(prev + 1)
}

async fn generate_rsa(bits: usize) -> Result<RsaPrivateKey> {
  tokio::task::spawn_blocking(move || RsaPrivateKey::new(&mut rand::thread_rng(), bits))
    .await
    .map_err(|e| Error::crypto_error(format!("key generation task failed: {}", e)))?
    .map_err(|e| Error::crypto_error(format!("Failed to generate {}-bit RSA key: {}", bits, e)))
}

fn rsa_key_pair(rsa: &RsaPrivateKey) -> Result<KeyPair> {
  let pkcs8 = rsa
    .to_pkcs8_der()
    .map_err(|e| Error::crypto_error(format!("Failed to encode RSA key: {}", e)))?;
  let der = PrivatePkcs8KeyDer::from(pkcs8.as_bytes().to_vec());
  KeyPair::from_pkcs8_der_and_sign_algo(&der, &PKCS_RSA_SHA256)
    .map_err(|e| Error::crypto_error(format!("Failed to load RSA key: {}", e)))
}

/// Validity and serial are read back from the DER so loaded and generated
/// roots report the same values.
fn root_certificate(cert_der: CertificateDer<'static>) -> Result<RootCertificate> {
  let (not_before, not_after, serial) = {
    let (_, cert) = X509Certificate::from_der(&cert_der)
      .map_err(|e| Error::crypto_error(format!("invalid root certificate: {}", e)))?;
    let validity = cert.validity();
    (
      validity.not_before.to_datetime(),
      validity.not_after.to_datetime(),
      cert.raw_serial().to_vec(),
    )
  };
  Ok(RootCertificate {
    cert_pem: pem_encode("CERTIFICATE", &cert_der),
    not_before,
    not_after,
    serial,
    cert_der,
  })
}

fn pem_encode(label: &str, der: &[u8]) -> String {
  let block = pem::Pem::new(label, der.to_vec());
  pem::encode_config(
    &block,
    pem::EncodeConfig::new().set_line_ending(pem::LineEnding::LF),
  )
}

fn to_time_duration(d: std::time::Duration) -> Duration {
  Duration::try_from(d).unwrap_or(Duration::MAX)
}

//! Integration tests for sluice

use sluice::{Proxy, ProxyConfig, StubRule, TunnelStrategy};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio_rustls::rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use tokio_rustls::rustls::{self, ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

fn ca_path(name: &str) -> PathBuf {
  let dir = std::env::temp_dir().join(format!("sluice-it-{}-{}", name, std::process::id()));
  std::fs::remove_dir_all(&dir).ok();
  dir.join("CA.crt")
}

fn config(name: &str) -> ProxyConfig {
  let mut config = ProxyConfig {
    listen: "127.0.0.1:0".parse().unwrap(),
    dns_servers: vec!["127.0.0.1:53".parse().unwrap()],
    verify_upstream: false,
    dial_timeout: Duration::from_secs(2),
    read_timeout: Duration::from_secs(5),
    ..Default::default()
  };
  config.ca.path = ca_path(name);
  config
    .hosts
    .insert("example.com".to_string(), vec!["127.0.0.1".parse().unwrap()]);
  config
    .hosts
    .insert("origin.test".to_string(), vec!["127.0.0.1".parse().unwrap()]);
  config
}

async fn start(config: ProxyConfig) -> (Arc<Proxy>, SocketAddr) {
  let proxy = Arc::new(Proxy::new(config).await.unwrap());
  let listener = proxy.bind().await.unwrap();
  let addr = listener.local_addr();
  let server = proxy.clone();
  tokio::spawn(async move { server.serve(listener).await });
  (proxy, addr)
}

/// Answers every connection with one fixed response, after reading the head.
async fn plain_upstream(response: &'static [u8]) -> u16 {
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      tokio::spawn(async move {
        let mut reader = BufReader::new(stream);
        read_head(&mut reader).await;
        reader.get_mut().write_all(response).await.ok();
        reader.get_mut().shutdown().await.ok();
      });
    }
  });
  port
}

/// A TLS origin for example.com with a self-signed certificate.
async fn tls_upstream(response: &'static [u8]) -> u16 {
  let key = rcgen::KeyPair::generate().unwrap();
  let cert = rcgen::CertificateParams::new(vec!["example.com".to_string()])
    .unwrap()
    .self_signed(&key)
    .unwrap();
  let server_config = ServerConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_no_client_auth()
    .with_single_cert(
      vec![cert.der().clone()],
      PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key.serialize_der())),
    )
    .unwrap();
  let acceptor = TlsAcceptor::from(Arc::new(server_config));
  let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = listener.local_addr().unwrap().port();
  tokio::spawn(async move {
    while let Ok((stream, _)) = listener.accept().await {
      let acceptor = acceptor.clone();
      tokio::spawn(async move {
        let Ok(tls) = acceptor.accept(stream).await else {
          return;
        };
        let mut reader = BufReader::new(tls);
        read_head(&mut reader).await;
        reader.get_mut().write_all(response).await.ok();
        reader.get_mut().shutdown().await.ok();
      });
    }
  });
  port
}

async fn read_head<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> String {
  let mut head = String::new();
  loop {
    let mut line = String::new();
    if reader.read_line(&mut line).await.unwrap_or(0) == 0 {
      break;
    }
    head.push_str(&line);
    if line == "\r\n" {
      break;
    }
  }
  head
}

/// Reads one Content-Length framed response.
async fn read_response<R: AsyncRead + Unpin>(reader: &mut BufReader<R>) -> (String, String) {
  let head = read_head(reader).await;
  let length = head
    .lines()
    .find_map(|l| {
      let (name, value) = l.split_once(':')?;
      name
        .eq_ignore_ascii_case("content-length")
        .then(|| value.trim().parse::<usize>().ok())?
    })
    .unwrap_or(0);
  let mut body = vec![0u8; length];
  reader.read_exact(&mut body).await.unwrap();
  (head, String::from_utf8(body).unwrap())
}

async fn connect_through(proxy: SocketAddr, target: &str) -> TcpStream {
  let mut stream = TcpStream::connect(proxy).await.unwrap();
  let connect = format!("CONNECT {0} HTTP/1.1\r\nHost: {0}\r\n\r\n", target);
  stream.write_all(connect.as_bytes()).await.unwrap();
  let mut established = [0u8; 19];
  stream.read_exact(&mut established).await.unwrap();
  assert_eq!(&established, sluice::CONNECT_ESTABLISHED);
  stream
}

async fn intercepted_get(strategy: TunnelStrategy, name: &str) {
  let origin_port = tls_upstream(b"HTTP/1.1 200 OK\r\nContent-Length: 5\r\nX-Origin: tls\r\n\r\nhello").await;
  let mut config = config(name);
  config.mitm_sites = vec!["example.com".to_string()];
  config.tunnel_strategy = strategy;
  let (proxy, addr) = start(config).await;

  let authority = format!("example.com:{}", origin_port);
  let tunnel = connect_through(addr, &authority).await;

  let mut roots = RootCertStore::empty();
  roots.add(proxy.ca().root().der().clone()).unwrap();
  let client_config = ClientConfig::builder_with_provider(Arc::new(rustls::crypto::ring::default_provider()))
    .with_safe_default_protocol_versions()
    .unwrap()
    .with_root_certificates(roots)
    .with_no_client_auth();
  let connector = TlsConnector::from(Arc::new(client_config));
  let server_name = ServerName::try_from("example.com").unwrap();
  let mut tls = connector.connect(server_name, tunnel).await.unwrap();

  let request = format!(
    "GET / HTTP/1.1\r\nHost: {}\r\nConnection: close\r\n\r\n",
    authority
  );
  tls.write_all(request.as_bytes()).await.unwrap();
  let mut raw = Vec::new();
  tls.read_to_end(&mut raw).await.unwrap();
  let text = String::from_utf8_lossy(&raw);
  assert!(text.starts_with("HTTP/1.1 200 OK\r\n"), "{}", text);
  assert!(text.to_ascii_lowercase().contains("x-origin: tls\r\n"));
  assert!(text.ends_with("\r\n\r\nhello"));

  assert_eq!(proxy.ca().issued_count(), 1);
  let cert = tls.get_ref().1.peer_certificates().unwrap()[0].clone();
  let leaf = proxy.ca().issue("example.com").await.unwrap();
  assert_eq!(&cert, leaf.cert_der());
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mitm_connect_with_injection() {
  intercepted_get(TunnelStrategy::Inject, "inject").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_mitm_connect_with_loopback() {
  intercepted_get(TunnelStrategy::Loopback, "loopback").await;
}

#[tokio::test(flavor = "multi_thread")]
async fn test_plain_http_is_forwarded() {
  let port = plain_upstream(b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n").await;
  let (_proxy, addr) = start(config("plain")).await;
  let mut stream = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "GET http://origin.test:{0}/path HTTP/1.1\r\nHost: origin.test:{0}\r\nConnection: close\r\n\r\n",
    port
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut reader = BufReader::new(stream);
  let (head, body) = read_response(&mut reader).await;
  assert!(head.starts_with("HTTP/1.1 200 OK\r\n"));
  assert!(!head.to_ascii_lowercase().contains("transfer-encoding"));
  assert_eq!(body, "hello");
}

#[tokio::test(flavor = "multi_thread")]
async fn test_passthrough_connect_splices_bytes() {
  let echo = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = echo.local_addr().unwrap().port();
  tokio::spawn(async move {
    let (mut stream, _) = echo.accept().await.unwrap();
    let mut buf = [0u8; 4];
    stream.read_exact(&mut buf).await.unwrap();
    stream.write_all(&buf).await.unwrap();
  });
  let (proxy, addr) = start(config("passthrough")).await;
  let mut tunnel = connect_through(addr, &format!("origin.test:{}", port)).await;
  tunnel.write_all(b"ping").await.unwrap();
  let mut buf = [0u8; 4];
  tunnel.read_exact(&mut buf).await.unwrap();
  assert_eq!(&buf, b"ping");
  let mut rest = Vec::new();
  assert_eq!(tunnel.read_to_end(&mut rest).await.unwrap(), 0);
  assert_eq!(proxy.ca().issued_count(), 0);
}

#[tokio::test(flavor = "multi_thread")]
async fn test_stub_answers_and_keeps_connection_alive() {
  let mut config = config("stub");
  config.stubs = vec![StubRule {
    sites: vec!["ads.example".to_string()],
    status: 403,
    headers: vec![("X-Stub".to_string(), "1".to_string())],
    body: "blocked".to_string(),
  }];
  let (proxy, addr) = start(config).await;
  assert_eq!(proxy.pipeline().request_filters(), vec!["STUB", "DIRECT"]);

  let stream = TcpStream::connect(addr).await.unwrap();
  let mut reader = BufReader::new(stream);
  for path in ["/a.js", "/b.js"] {
    let request = format!("GET http://ads.example{} HTTP/1.1\r\nHost: ads.example\r\n\r\n", path);
    reader.get_mut().write_all(request.as_bytes()).await.unwrap();
    let (head, body) = read_response(&mut reader).await;
    assert!(head.starts_with("HTTP/1.1 403 Forbidden\r\n"));
    assert!(head.to_ascii_lowercase().contains("x-stub: 1\r\n"));
    assert_eq!(body, "blocked");
  }
}

#[tokio::test(flavor = "multi_thread")]
async fn test_unreachable_upstream_yields_502() {
  let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
  let port = closed.local_addr().unwrap().port();
  drop(closed);
  let (_proxy, addr) = start(config("unreachable")).await;
  let mut stream = TcpStream::connect(addr).await.unwrap();
  let request = format!(
    "GET http://origin.test:{0}/ HTTP/1.1\r\nHost: origin.test:{0}\r\n\r\n",
    port
  );
  stream.write_all(request.as_bytes()).await.unwrap();
  let mut raw = Vec::new();
  stream.read_to_end(&mut raw).await.unwrap();
  let text = String::from_utf8_lossy(&raw);
  assert!(text.starts_with("HTTP/1.1 502 Bad Gateway\r\n"), "{}", text);
  assert!(text.contains("Error: "));
}

#[tokio::test(flavor = "multi_thread")]
async fn test_malformed_request_yields_400() {
  let (_proxy, addr) = start(config("malformed")).await;
  let mut stream = TcpStream::connect(addr).await.unwrap();
  stream.write_all(b"NOT A REQUEST\r\n\r\n").await.unwrap();
  let mut raw = Vec::new();
  stream.read_to_end(&mut raw).await.unwrap();
  assert!(String::from_utf8_lossy(&raw).starts_with("HTTP/1.1 400 Bad Request\r\n"));
}

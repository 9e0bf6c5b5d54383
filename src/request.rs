use std::fmt::{Debug, Formatter};

use bytes::Bytes;
use http::Request as HttpRequest;
use http::{HeaderMap, HeaderValue, Method, Version};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::body::{framing, Body, Framing};
use crate::errors::{Error, Result};
use crate::response::read_headers;
use crate::{COLON_SPACE, CR_LF, SPACE};

/// Upper bound for a request or status line.
pub(crate) const MAX_LINE: u64 = 8 * 1024;

/// A request received from a client.
#[derive(Default, Clone)]
pub struct Request {
  uri: http::Uri,
  version: Version,
  method: Method,
  headers: HeaderMap<HeaderValue>,
  body: Option<Body>,
}

impl Debug for Request {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Request")
      .field("uri", &self.uri)
      .field("version", &self.version)
      .field("method", &self.method)
      .field("headers", &self.headers)
      .field("body", &self.body)
      .finish()
  }
}

impl<T> From<HttpRequest<T>> for Request
where
  T: Into<Body>,
{
  fn from(value: HttpRequest<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      uri: parts.uri,
      version: parts.version,
      method: parts.method,
      headers: parts.headers,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Request {
  /// Serializes the request in origin form for an upstream server.
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_requests = Vec::new();
    http_requests.extend(self.method.as_str().as_bytes());
    http_requests.extend(SPACE);
    http_requests.extend(self.uri.path().as_bytes());
    if let Some(q) = self.uri.query() {
      http_requests.extend(b"?");
      http_requests.extend(q.as_bytes());
    }
    http_requests.extend(SPACE);
    http_requests.extend(b"HTTP/1.1");
    http_requests.extend(CR_LF);
    if self.headers.get(http::header::HOST).is_none() {
      http_requests.extend(http::header::HOST.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      if let Some(s) = self.uri.authority() {
        http_requests.extend(s.as_str().as_bytes());
      }
      http_requests.extend(CR_LF);
    }
    let mut headers = self.headers.clone();
    headers.remove(http::header::CONTENT_LENGTH);
    if let Some(b) = self.body() {
      headers.insert(http::header::CONTENT_LENGTH, HeaderValue::from(b.len()));
    }
    for (k, v) in headers.iter() {
      http_requests.extend(k.as_str().as_bytes());
      http_requests.extend(COLON_SPACE);
      http_requests.extend(v.as_bytes());
      http_requests.extend(CR_LF);
    }
    http_requests.extend(CR_LF);
    if let Some(b) = self.body() {
      http_requests.extend(b.as_ref());
    }
    Bytes::from(http_requests)
  }
  /// Creates a new builder-style object to manufacture a `Request`
  pub fn builder() -> http::request::Builder {
    http::request::Builder::new()
  }
}

impl Request {
  /// Get the http method of this `Request`.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get the target of this `Request`.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get a mutable reference to the target.
  #[inline]
  pub fn uri_mut(&mut self) -> &mut http::Uri {
    &mut self.uri
  }
  /// Get the headers of this `Request`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the headers.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the body, if any.
  pub fn body(&self) -> Option<&Body> {
    self.body.as_ref()
  }
  /// Get the HTTP `Version` of this `Request`.
  #[inline]
  pub fn version(&self) -> Version {
    self.version
  }
  /// Whether this is a tunnel request.
  pub fn is_connect(&self) -> bool {
    self.method == Method::CONNECT
  }
  /// `host` and `port` of the target, falling back to the `Host` header and
  /// the default port of the scheme.
  pub fn host_port(&self) -> Result<(String, u16)> {
    let default_port = match self.uri.scheme_str() {
      Some("https") => 443,
      Some(_) => 80,
      None if self.is_connect() => 443,
      None => 80,
    };
    let authority = match self.uri.authority() {
      Some(a) => a.clone(),
      None => self
        .headers
        .get(http::header::HOST)
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| Error::invalid_request("request has no target host"))?
        .parse()?,
    };
    let host = authority
      .host()
      .trim_start_matches('[')
      .trim_end_matches(']')
      .to_string();
    if host.is_empty() {
      return Err(Error::invalid_request("request has an empty target host"));
    }
    Ok((host, authority.port_u16().unwrap_or(default_port)))
  }
  /// Whether the client asked to close the connection after this exchange.
  pub fn wants_close(&self) -> bool {
    let connection = self
      .headers
      .get_all(http::header::CONNECTION)
      .iter()
      .chain(self.headers.get_all("proxy-connection").iter())
      .filter_map(|v| v.to_str().ok())
      .flat_map(|v| v.split(','))
      .map(|v| v.trim().to_ascii_lowercase())
      .collect::<Vec<_>>();
    if connection.iter().any(|v| v == "close") {
      return true;
    }
    self.version < Version::HTTP_11 && !connection.iter().any(|v| v == "keep-alive")
  }
}

/// Reads the next request from a client connection.
///
/// Returns `Ok(None)` when the peer closed the connection between requests.
pub(crate) async fn read_request<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Option<Request>> {
  let mut line = Vec::new();
  loop {
    line.clear();
    let n = (&mut *reader)
      .take(MAX_LINE)
      .read_until(b'\n', &mut line)
      .await?;
    if n == 0 {
      return Ok(None);
    }
    if !line.ends_with(b"\n") {
      return Err(Error::invalid_request("request line too long"));
    }
    // tolerate stray empty lines between requests
    if line != CR_LF && line != b"\n" {
      break;
    }
  }
  let (method, uri, version) = parser_request_line(&line)?;
  let headers = read_headers(reader).await?;
  let body = if method == Method::CONNECT {
    Vec::new()
  } else {
    framing(&headers, Framing::Empty)?.read(reader).await?
  };
  let mut request: Request = Request::builder()
    .method(method)
    .uri(uri)
    .version(version)
    .body(body)?
    .into();
  request.headers = headers;
  Ok(Some(request))
}

fn parser_request_line(line: &[u8]) -> Result<(Method, http::Uri, Version)> {
  let line = line.strip_suffix(b"\n").unwrap_or(line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  let mut parts = line.split(|b| *b == b' ').filter(|p| !p.is_empty());
  let (Some(method), Some(target), Some(version), None) =
    (parts.next(), parts.next(), parts.next(), parts.next())
  else {
    return Err(Error::invalid_request(format!(
      "malformed request line {:?}",
      String::from_utf8_lossy(line)
    )));
  };
  let method = Method::from_bytes(method)
    .map_err(|_| Error::invalid_request("invalid request method"))?;
  let version = match version {
    b"HTTP/1.0" => Version::HTTP_10,
    b"HTTP/1.1" => Version::HTTP_11,
    _ => return Err(Error::invalid_request("unsupported http version")),
  };
  let uri = http::Uri::try_from(target)?;
  if method == Method::CONNECT && uri.authority().is_none() {
    return Err(Error::invalid_request("CONNECT target must be host:port"));
  }
  Ok((method, uri, version))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  async fn read(wire: &'static [u8]) -> Result<Option<Request>> {
    read_request(&mut BufReader::new(wire)).await
  }

  #[tokio::test]
  async fn reads_pipelined_requests_with_bodies() {
    let wire: &'static [u8] = b"POST http://example.com/a?b=1 HTTP/1.1\r\nHost: example.com\r\nContent-Length: 3\r\n\r\nabc\
GET /next HTTP/1.1\r\nHost: example.com\r\n\r\n";
    let mut reader = BufReader::new(wire);
    let first = read_request(&mut reader).await.unwrap().unwrap();
    assert_eq!(first.method(), Method::POST);
    assert_eq!(first.body().unwrap().as_ref(), b"abc");
    assert_eq!(first.host_port().unwrap(), ("example.com".to_string(), 80));
    let second = read_request(&mut reader).await.unwrap().unwrap();
    assert_eq!(second.uri().path(), "/next");
    assert!(second.uri().authority().is_none());
    assert!(read_request(&mut reader).await.unwrap().is_none());
  }

  #[tokio::test]
  async fn connect_target_is_authority_form() {
    let req = read(b"CONNECT example.com:8443 HTTP/1.1\r\nHost: example.com:8443\r\n\r\n")
      .await
      .unwrap()
      .unwrap();
    assert!(req.is_connect());
    assert_eq!(req.host_port().unwrap(), ("example.com".to_string(), 8443));
    assert!(read(b"CONNECT / HTTP/1.1\r\n\r\n").await.is_err());
  }

  #[tokio::test]
  async fn rejects_malformed_request_line() {
    assert!(read(b"GET /\r\n\r\n").await.is_err());
    assert!(read(b"GET / HTTP/2.0\r\n\r\n").await.is_err());
  }

  #[test]
  fn connection_close_rules() {
    let req: Request = Request::builder()
      .uri("http://example.com/")
      .version(Version::HTTP_10)
      .body(Vec::new())
      .unwrap()
      .into();
    assert!(req.wants_close());
    let req: Request = Request::builder()
      .uri("http://example.com/")
      .header("Proxy-Connection", "Keep-Alive")
      .version(Version::HTTP_10)
      .body(Vec::new())
      .unwrap()
      .into();
    assert!(!req.wants_close());
    let req: Request = Request::builder()
      .uri("http://example.com/")
      .header("Connection", "upgrade, close")
      .body(Vec::new())
      .unwrap()
      .into();
    assert!(req.wants_close());
  }

  #[test]
  fn origin_form_serialization() {
    let req: Request = Request::builder()
      .method("POST")
      .uri("http://example.com:8080/p?q=1")
      .header("Content-Length", "99")
      .body("xy")
      .unwrap()
      .into();
    let raw = req.to_raw();
    let text = String::from_utf8_lossy(&raw);
    assert!(text.starts_with("POST /p?q=1 HTTP/1.1\r\nhost: example.com:8080\r\n"));
    assert!(text.contains("content-length: 2\r\n"));
    assert!(text.ends_with("\r\n\r\nxy"));
  }
}

use std::fmt::Debug;
use std::time::Duration;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, AsyncReadExt, BufReader};

use crate::body::{framing, Body, Framing};
use crate::errors::{new_io_error, Error, Result};
use crate::request::Request;
use crate::{COLON_SPACE, CR_LF, SPACE};
use bytes::Bytes;
use http::{HeaderMap, HeaderValue, Method, Response as HttpResponse, StatusCode};

/// Upper bound for the header block of one message.
pub(crate) const MAX_HEADERS: u64 = 64 * 1024;

/// Headers that describe one hop and are never forwarded.
const HOP_BY_HOP: [&str; 9] = [
  "connection",
  "proxy-connection",
  "keep-alive",
  "proxy-authenticate",
  "proxy-authorization",
  "te",
  "trailer",
  "transfer-encoding",
  "upgrade",
];

/// A response obtained from upstream or produced by a filter.
#[derive(Debug, Default, Clone)]
pub struct Response {
  version: http::Version,
  uri: http::Uri,
  method: Method,
  status_code: StatusCode,
  headers: HeaderMap<HeaderValue>,
  extensions: http::Extensions,
  body: Option<Body>,
}

impl PartialEq for Response {
  fn eq(&self, other: &Self) -> bool {
    self.version == other.version
      && self.status_code == other.status_code
      && self.headers == other.headers
      && self.body == other.body
  }
}

impl<T> From<HttpResponse<T>> for Response
where
  T: Into<Body>,
{
  fn from(value: HttpResponse<T>) -> Self {
    let (parts, body) = value.into_parts();
    let body = body.into();
    Self {
      version: parts.version,
      uri: Default::default(),
      method: Method::GET,
      status_code: parts.status,
      headers: parts.headers,
      extensions: parts.extensions,
      body: if body.is_empty() { None } else { Some(body) },
    }
  }
}

impl Response {
  pub(crate) fn to_raw(&self) -> Bytes {
    let mut http_response = Vec::new();
    http_response.extend(format!("{:?}", self.version).as_bytes());
    http_response.extend(SPACE);
    http_response.extend(format!("{}", self.status_code).as_bytes());
    http_response.extend(CR_LF);
    for (k, v) in self.headers.iter() {
      http_response.extend(k.as_str().as_bytes());
      http_response.extend(COLON_SPACE);
      http_response.extend(v.as_bytes());
      http_response.extend(CR_LF);
    }
    http_response.extend(CR_LF);
    if let Some(b) = self.body() {
      if !b.is_empty() && self.may_have_body() {
        http_response.extend(b.as_ref());
      }
    }
    Bytes::from(http_response)
  }
  /// An HTTP response builder
  ///
  /// This type can be used to construct an instance of `Response` through a
  /// builder-like pattern.
  pub fn builder() -> http::response::Builder {
    http::response::Builder::new()
  }
  /// Records the request this response answers.
  pub fn for_request(mut self, request: &Request) -> Self {
    self.method = request.method().clone();
    self.uri = request.uri().clone();
    self
  }
  /// Rewrites the framing headers for a buffered body so the message can be
  /// written to the client as is.
  pub fn prepare_for_client(&mut self) {
    strip_hop_by_hop(&mut self.headers);
    self.version = http::Version::HTTP_11;
    if self.method == Method::HEAD || !self.status_allows_body() {
      return;
    }
    let len = self.body.as_ref().map(|b| b.len()).unwrap_or_default();
    self
      .headers
      .insert(http::header::CONTENT_LENGTH, HeaderValue::from(len));
  }
  fn status_allows_body(&self) -> bool {
    !(self.status_code.is_informational()
      || self.status_code == StatusCode::NO_CONTENT
      || self.status_code == StatusCode::NOT_MODIFIED)
  }
  fn may_have_body(&self) -> bool {
    self.method != Method::HEAD && self.status_allows_body()
  }
}

impl Response {
  /// Get the `StatusCode` of this `Response`.
  #[inline]
  pub fn status_code(&self) -> StatusCode {
    self.status_code
  }
  /// Get the HTTP `Version` of this `Response`.
  #[inline]
  pub fn version(&self) -> http::Version {
    self.version
  }
  /// Get the `Headers` of this `Response`.
  #[inline]
  pub fn headers(&self) -> &HeaderMap {
    &self.headers
  }
  /// Get a mutable reference to the `Headers` of this `Response`.
  #[inline]
  pub fn headers_mut(&mut self) -> &mut HeaderMap {
    &mut self.headers
  }
  /// Get the content-length of the response, if it is known.
  pub fn content_length(&self) -> Option<u64> {
    self
      .headers
      .get(http::header::CONTENT_LENGTH)
      .and_then(|x| x.to_str().ok()?.parse().ok())
  }
  /// Get the final `http::Uri` of the request that produced this response.
  #[inline]
  pub fn uri(&self) -> &http::Uri {
    &self.uri
  }
  /// Get the method of the request that produced this response.
  #[inline]
  pub fn method(&self) -> &Method {
    &self.method
  }
  /// Get the full response body.
  pub fn body(&self) -> &Option<Body> {
    &self.body
  }
  /// Get a mutable reference to the body.
  pub fn body_mut(&mut self) -> &mut Option<Body> {
    &mut self.body
  }
  /// Returns a reference to the associated extensions.
  pub fn extensions(&self) -> &http::Extensions {
    &self.extensions
  }
  /// Returns a mutable reference to the associated extensions.
  pub fn extensions_mut(&mut self) -> &mut http::Extensions {
    &mut self.extensions
  }
}

/// Reads one response from an upstream connection.
#[derive(Debug)]
pub struct ResponseBuilder<T: AsyncRead> {
  builder: http::response::Builder,
  reader: BufReader<T>,
  method: Method,
  head_timeout: Option<Duration>,
}

impl<T: AsyncRead + Unpin + Sized> ResponseBuilder<T> {
  /// Constructs a new response reader for a request made with `method`.
  pub fn new(reader: BufReader<T>, method: Method) -> ResponseBuilder<T> {
    ResponseBuilder {
      builder: Default::default(),
      reader,
      method,
      head_timeout: None,
    }
  }
  /// Bounds the wait for the status line and headers. The body is read
  /// without a deadline so long transfers are not cut off.
  pub fn head_timeout(mut self, timeout: Duration) -> Self {
    self.head_timeout = Some(timeout);
    self
  }
  async fn parser_version(&mut self) -> Result<(http::Version, StatusCode)> {
    let mut line = Vec::new();
    let n = (&mut self.reader)
      .take(crate::request::MAX_LINE)
      .read_until(b'\n', &mut line)
      .await?;
    if n == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "upstream closed before sending a status line",
      ));
    }
    let line = line.strip_suffix(CR_LF).unwrap_or(&line);
    let mut parts = line.splitn(3, |b| b == &b' ');
    let version = match parts.next() {
      Some(b"HTTP/1.0") => http::Version::HTTP_10,
      Some(b"HTTP/1.1") => http::Version::HTTP_11,
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version",
        ));
      }
    };
    let status = match parts.next() {
      Some(code) if !code.is_empty() => {
        StatusCode::from_bytes(code).map_err(|x| Error::Http(http::Error::from(x)))?
      }
      _ => {
        return Err(new_io_error(
          std::io::ErrorKind::InvalidData,
          "invalid http version and status_code data",
        ));
      }
    };
    Ok((version, status))
  }

  async fn read_head(&mut self) -> Result<(http::Version, StatusCode, HeaderMap)> {
    loop {
      let (v, c) = self.parser_version().await?;
      let header = read_headers(&mut self.reader).await?;
      if c.is_informational() && c != StatusCode::SWITCHING_PROTOCOLS {
        continue;
      }
      return Ok((v, c, header));
    }
  }

  /// Read a response, skipping interim `1xx` responses other than `101`.
  pub async fn build(mut self) -> Result<Response> {
    let (v, c, header) = match self.head_timeout {
      Some(timeout) => tokio::time::timeout(timeout, self.read_head())
        .await
        .map_err(|_| Error::Timeout("upstream response head".to_string()))??,
      None => self.read_head().await?,
    };
    let bodyless = self.method == Method::HEAD
      || c.is_informational()
      || c == StatusCode::NO_CONTENT
      || c == StatusCode::NOT_MODIFIED;
    let body = if bodyless {
      Vec::new()
    } else {
      framing(&header, Framing::Close)?
        .read(&mut self.reader)
        .await?
    };
    self.builder = self.builder.version(v).status(c);
    if let Some(h) = self.builder.headers_mut() {
      *h = header;
    }
    let resp = self.builder.body(body)?;
    let mut resp: Response = resp.into();
    resp.method = self.method;
    Ok(resp)
  }
}

/// Reads a header block up to and including the empty line.
pub(crate) async fn read_headers<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<HeaderMap> {
  let mut headers = HeaderMap::new();
  let mut header_line = Vec::new();
  let mut total = 0u64;
  loop {
    header_line.clear();
    let length = (&mut *reader)
      .take(MAX_HEADERS)
      .read_until(b'\n', &mut header_line)
      .await?;
    total += length as u64;
    if total > MAX_HEADERS {
      return Err(Error::invalid_request("header block too large"));
    }
    if length == 0 {
      return Err(new_io_error(
        std::io::ErrorKind::UnexpectedEof,
        "connection closed inside the header block",
      ));
    }
    if header_line == CR_LF || header_line == b"\n" {
      break;
    }
    if let Ok((Some(k), Some(v))) = parser_headers(&header_line) {
      headers.append(k, v);
    };
  }
  Ok(headers)
}

pub(crate) fn parser_headers(
  buffer: &[u8],
) -> Result<(Option<http::HeaderName>, Option<http::HeaderValue>)> {
  let mut k = None;
  let mut v = None;
  let buffer = buffer.strip_suffix(b"\n").unwrap_or(buffer);
  let buffer = buffer.strip_suffix(b"\r").unwrap_or(buffer);
  for (index, h) in buffer.splitn(2, |s| s == &b':').enumerate() {
    let h = h.trim_ascii();
    match index {
      0 => match http::HeaderName::from_bytes(h) {
        Ok(hk) => k = Some(hk),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      1 => match http::HeaderValue::from_bytes(h) {
        Ok(hv) => v = Some(hv),
        Err(err) => {
          return Err(Error::Http(http::Error::from(err)));
        }
      },
      _ => {}
    }
  }
  Ok((k, v))
}

/// Removes hop-by-hop headers, including those named by `Connection`.
pub fn strip_hop_by_hop(headers: &mut HeaderMap) {
  let named: Vec<String> = headers
    .get_all(http::header::CONNECTION)
    .iter()
    .filter_map(|v| v.to_str().ok())
    .flat_map(|v| v.split(','))
    .map(|v| v.trim().to_ascii_lowercase())
    .filter(|v| !v.is_empty())
    .collect();
  for name in HOP_BY_HOP.iter().copied().chain(named.iter().map(String::as_str)) {
    headers.remove(name);
  }
}

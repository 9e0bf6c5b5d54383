use std::fmt;
use std::ops::Deref;

use bytes::Bytes;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt};

use crate::errors::{new_io_error, Error, Result};
use crate::CR_LF;

/// Upper bound for a buffered message body.
pub(crate) const MAX_BODY: u64 = 64 * 1024 * 1024;
const MAX_CHUNK_LINE: u64 = 4 * 1024;

/// A fully buffered message body.
#[derive(Clone, PartialEq, Default)]
pub struct Body {
  inner: Bytes,
}

impl Deref for Body {
  type Target = Bytes;

  fn deref(&self) -> &Self::Target {
    &self.inner
  }
}

impl From<Bytes> for Body {
  #[inline]
  fn from(b: Bytes) -> Body {
    Body { inner: b }
  }
}

impl From<String> for Body {
  #[inline]
  fn from(s: String) -> Body {
    s.into_bytes().into()
  }
}

impl From<&'static str> for Body {
  #[inline]
  fn from(s: &'static str) -> Body {
    Body {
      inner: Bytes::from_static(s.as_bytes()),
    }
  }
}

impl From<Vec<u8>> for Body {
  #[inline]
  fn from(v: Vec<u8>) -> Body {
    Body { inner: v.into() }
  }
}

impl fmt::Debug for Body {
  fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
    match std::str::from_utf8(&self.inner) {
      Ok(s) => fmt::Debug::fmt(s, f),
      Err(_err) => fmt::Debug::fmt(&self.inner, f),
    }
  }
}

/// How the length of a message body is delimited on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Framing {
  /// no body at all
  Empty,
  /// `Content-Length`
  Length(u64),
  /// `Transfer-Encoding: chunked`
  Chunked,
  /// read until the peer closes
  Close,
}

impl Framing {
  pub(crate) async fn read<R: AsyncBufRead + Unpin>(self, reader: &mut R) -> Result<Vec<u8>> {
    self.read_limited(reader, MAX_BODY).await
  }

  /// Reads the body, failing once it grows past `limit` bytes.
  async fn read_limited<R: AsyncBufRead + Unpin>(
    self,
    reader: &mut R,
    limit: u64,
  ) -> Result<Vec<u8>> {
    match self {
      Framing::Empty => Ok(Vec::new()),
      Framing::Length(len) => {
        if len > limit {
          return Err(too_large());
        }
        let mut body = vec![0; len as usize];
        reader.read_exact(&mut body).await?;
        Ok(body)
      }
      Framing::Chunked => read_chunked(reader, limit).await,
      Framing::Close => {
        let mut body = Vec::new();
        reader.take(limit + 1).read_to_end(&mut body).await?;
        if body.len() as u64 > limit {
          return Err(too_large());
        }
        Ok(body)
      }
    }
  }
}

fn too_large() -> Error {
  new_io_error(
    std::io::ErrorKind::InvalidData,
    "message body exceeds the buffer limit",
  )
}

/// Picks the framing from message headers; `fallback` applies when neither
/// `Transfer-Encoding` nor `Content-Length` is present.
pub(crate) fn framing(headers: &http::HeaderMap, fallback: Framing) -> Result<Framing> {
  if let Some(te) = headers.get(http::header::TRANSFER_ENCODING) {
    let chunked = te
      .to_str()
      .map(|v| v.to_ascii_lowercase().contains("chunked"))
      .unwrap_or(false);
    return Ok(if chunked { Framing::Chunked } else { Framing::Close });
  }
  match headers.get(http::header::CONTENT_LENGTH) {
    Some(cl) => {
      let len: u64 = cl
        .to_str()
        .map_err(|_| new_io_error(std::io::ErrorKind::InvalidData, "invalid content-length"))?
        .trim()
        .parse()?;
      Ok(if len == 0 {
        Framing::Empty
      } else {
        Framing::Length(len)
      })
    }
    None => Ok(fallback),
  }
}

async fn read_chunk_line<R: AsyncBufRead + Unpin>(reader: &mut R) -> Result<Vec<u8>> {
  let mut line = Vec::new();
  let n = (&mut *reader)
    .take(MAX_CHUNK_LINE)
    .read_until(b'\n', &mut line)
    .await?;
  if n == 0 || !line.ends_with(b"\n") {
    return Err(new_io_error(
      std::io::ErrorKind::UnexpectedEof,
      "truncated chunked body",
    ));
  }
  let line = line.strip_suffix(b"\n").unwrap_or(&line);
  let line = line.strip_suffix(b"\r").unwrap_or(line);
  Ok(line.to_vec())
}

async fn read_chunked<R: AsyncBufRead + Unpin>(reader: &mut R, limit: u64) -> Result<Vec<u8>> {
  let mut body: Vec<u8> = Vec::new();
  loop {
    let line = read_chunk_line(reader).await?;
    // chunk extensions follow a ';'
    let size = line.split(|b| *b == b';').next().unwrap_or_default();
    let size = String::from_utf8_lossy(size);
    let size = u64::from_str_radix(size.trim(), 16)?;
    if size == 0 {
      // trailers end with an empty line
      while !read_chunk_line(reader).await?.is_empty() {}
      break;
    }
    if size > limit || body.len() as u64 + size > limit {
      return Err(too_large());
    }
    let start = body.len();
    body.resize(start + size as usize, 0);
    reader.read_exact(&mut body[start..]).await?;
    let mut crlf = [0u8; 2];
    reader.read_exact(&mut crlf).await?;
    if &crlf[..] != CR_LF {
      return Err(new_io_error(
        std::io::ErrorKind::InvalidData,
        "chunk is not terminated by CRLF",
      ));
    }
  }
  Ok(body)
}

#[cfg(test)]
mod tests {
  use super::*;
  use tokio::io::BufReader;

  #[tokio::test]
  async fn chunked_body_with_extensions_and_trailers() {
    let wire = b"5;name=x\r\nhello\r\n6\r\n world\r\n0\r\nExpires: never\r\n\r\nNEXT";
    let mut reader = BufReader::new(&wire[..]);
    let body = Framing::Chunked.read(&mut reader).await.unwrap();
    assert_eq!(body, b"hello world");
    let mut rest = String::new();
    reader.read_to_string(&mut rest).await.unwrap();
    assert_eq!(rest, "NEXT");
  }

  #[tokio::test]
  async fn truncated_chunk_is_an_error() {
    let wire = b"a\r\nshort";
    let mut reader = BufReader::new(&wire[..]);
    assert!(Framing::Chunked.read(&mut reader).await.is_err());
  }

  #[tokio::test]
  async fn close_delimited_body_over_limit_is_an_error() {
    let wire = b"0123456789";
    let mut reader = BufReader::new(&wire[..]);
    assert!(Framing::Close.read_limited(&mut reader, 8).await.is_err());
    let mut reader = BufReader::new(&wire[..]);
    let body = Framing::Close.read_limited(&mut reader, 10).await.unwrap();
    assert_eq!(body, wire);
    let mut reader = BufReader::new(&wire[..]);
    assert!(Framing::Length(10).read_limited(&mut reader, 8).await.is_err());
  }

  #[test]
  fn framing_prefers_transfer_encoding() {
    let mut headers = http::HeaderMap::new();
    headers.insert(http::header::CONTENT_LENGTH, "10".parse().unwrap());
    assert_eq!(framing(&headers, Framing::Empty).unwrap(), Framing::Length(10));
    headers.insert(http::header::TRANSFER_ENCODING, "gzip, chunked".parse().unwrap());
    assert_eq!(framing(&headers, Framing::Empty).unwrap(), Framing::Chunked);
    assert_eq!(
      framing(&http::HeaderMap::new(), Framing::Close).unwrap(),
      Framing::Close
    );
  }
}

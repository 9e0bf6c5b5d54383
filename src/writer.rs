//! Client-facing response sink.
use std::fmt::Display;
use std::time::Duration;

use http::{HeaderValue, StatusCode};
use tokio::io::{AsyncWriteExt, BufReader};

use crate::errors::{Error, Result};
use crate::response::Response;
use crate::socket::Socket;

/// Progress of the response on a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
  /// nothing has been written
  Idle,
  /// a response head went out
  Started,
  /// the connection was taken over by a tunnel
  Hijacked,
}

enum Sink {
  Conn(BufReader<Socket>),
  Buffer(Vec<u8>),
  Gone,
}

/// Writes responses to the client, or hands the raw connection to a tunnel.
pub struct ResponseWriter {
  sink: Sink,
  state: WriteState,
  write_timeout: Option<Duration>,
}

impl ResponseWriter {
  /// A writer over a live client connection. Bytes the client sent ahead of
  /// a hijack stay in the reader buffer and are handed over with it.
  pub fn new(conn: BufReader<Socket>, write_timeout: Option<Duration>) -> Self {
    Self {
      sink: Sink::Conn(conn),
      state: WriteState::Idle,
      write_timeout,
    }
  }
  /// A writer that collects output in memory and cannot be hijacked.
  pub fn buffer() -> Self {
    Self {
      sink: Sink::Buffer(Vec::new()),
      state: WriteState::Idle,
      write_timeout: None,
    }
  }
  /// Current progress.
  pub fn state(&self) -> WriteState {
    self.state
  }
  /// Whether anything reached the client already.
  pub fn is_started(&self) -> bool {
    self.state != WriteState::Idle
  }
  /// Whether [`ResponseWriter::hijack`] can succeed.
  pub fn supports_hijack(&self) -> bool {
    matches!(self.sink, Sink::Conn(_))
  }
  /// Bytes written to an in-memory writer.
  pub fn buffered(&self) -> Option<&[u8]> {
    match &self.sink {
      Sink::Buffer(buf) => Some(buf),
      _ => None,
    }
  }

  /// Writes a complete response.
  pub async fn write_response(&mut self, response: &Response) -> Result<()> {
    let raw = response.to_raw();
    self.write_all(&raw).await
  }

  /// Writes a short plain-text error response and asks the client to close.
  pub async fn write_error(&mut self, status: StatusCode, error: impl Display) -> Result<()> {
    let body = format!("Error: {}\n", error);
    let mut response: Response = Response::builder()
      .status(status)
      .header(http::header::CONTENT_TYPE, "text/plain; charset=utf-8")
      .body(body)?
      .into();
    response.prepare_for_client();
    response
      .headers_mut()
      .insert(http::header::CONNECTION, HeaderValue::from_static("close"));
    self.write_response(&response).await
  }

  async fn write_all(&mut self, raw: &[u8]) -> Result<()> {
    match &mut self.sink {
      Sink::Conn(conn) => {
        self.state = WriteState::Started;
        let write = async {
          conn.write_all(raw).await?;
          conn.flush().await
        };
        match self.write_timeout {
          Some(t) => tokio::time::timeout(t, write)
            .await
            .map_err(|_| Error::Timeout("client write".to_string()))??,
          None => write.await?,
        }
        Ok(())
      }
      Sink::Buffer(buf) => {
        self.state = WriteState::Started;
        buf.extend_from_slice(raw);
        Ok(())
      }
      Sink::Gone => Err(Error::HijackUnsupported),
    }
  }

  /// Takes over the client connection. No further response can be written.
  pub fn hijack(&mut self) -> Result<BufReader<Socket>> {
    match std::mem::replace(&mut self.sink, Sink::Gone) {
      Sink::Conn(conn) => {
        self.state = WriteState::Hijacked;
        Ok(conn)
      }
      other => {
        self.sink = other;
        Err(Error::HijackUnsupported)
      }
    }
  }

  /// Returns the connection for the next request, unless it was hijacked.
  pub(crate) fn into_conn(self) -> Option<BufReader<Socket>> {
    match self.sink {
      Sink::Conn(conn) => Some(conn),
      _ => None,
    }
  }
}

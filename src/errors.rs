//! proxy error
use std::io::ErrorKind;
use std::net::SocketAddr;
use std::num::ParseIntError;
use thiserror::Error as ThisError;
/// A `Result` alias where the `Err` case is `sluice::Error`.
pub type Result<T> = std::result::Result<T, Error>;
/// The Errors that may occur while proxying a connection.
#[derive(ThisError, Debug)]
pub enum Error {
  /// tls Error
  #[error(transparent)]
  Tls(#[from] tokio_rustls::rustls::Error),
  /// Error
  #[error(transparent)]
  IO(#[from] std::io::Error),
  /// http::Error
  #[error(transparent)]
  Http(http::Error),
  /// ParseIntError
  #[error(transparent)]
  IntError(#[from] ParseIntError),
  /// Key generation, signing or certificate parsing failed
  #[error("certificate error: {0}")]
  Crypto(String),
  /// The client sent something that is not a usable proxy request
  #[error("invalid request: {0}")]
  InvalidRequest(String),
  /// Name resolution failed
  #[error("resolve {host}: {reason}")]
  Resolve {
    /// name that was looked up
    host: String,
    /// resolver message
    reason: String,
  },
  /// A single connection attempt failed
  #[error("dial {addr}: {source}")]
  Dial {
    /// address of the attempt
    addr: SocketAddr,
    /// cause
    source: std::io::Error,
  },
  /// An operation exceeded its time bound
  #[error("{0} timed out")]
  Timeout(String),
  /// Every racer of a dial race failed
  #[error("all {attempts} dial attempts failed, last error: {last}")]
  DialExhausted {
    /// number of racers
    attempts: usize,
    /// last failure observed
    last: Box<Error>,
  },
  /// The response sink cannot hand out its underlying connection
  #[error("response writer does not support hijacking")]
  HijackUnsupported,
  /// The listener accept loop is gone
  #[error("listener closed")]
  ListenerClosed,
  /// A filter argument is absent
  #[error("filter argument {0:?} is missing")]
  MissingArgument(String),
  /// A filter argument holds another type
  #[error("filter argument {key:?} is not {expected}")]
  ArgumentType {
    /// argument name
    key: String,
    /// expected type
    expected: &'static str,
  },
  /// The filter pipeline could not be assembled or dispatched
  #[error("pipeline: {0}")]
  Pipeline(String),
  /// Unknown Error
  #[error("{0}")]
  Other(String),
}

impl Error {
  /// Create a certificate error and log it
  pub fn crypto_error(msg: impl Into<String>) -> Self {
    let error = Error::Crypto(msg.into());
    tracing::error!("{}", error);
    error
  }
  /// Create a TLS error and log it
  pub fn tls_error(msg: impl Into<String>) -> Self {
    let error = Error::Tls(tokio_rustls::rustls::Error::General(msg.into()));
    tracing::debug!("TLS error: {}", error);
    error
  }
  /// Create an invalid request error and log it
  pub fn invalid_request(msg: impl Into<String>) -> Self {
    let error = Error::InvalidRequest(msg.into());
    tracing::debug!("{}", error);
    error
  }
  /// Create a pipeline error and log it
  pub fn pipeline_error(msg: impl Into<String>) -> Self {
    let error = Error::Pipeline(msg.into());
    tracing::error!("{}", error);
    error
  }
  /// Whether this error, or the last error of an exhausted race, is a timeout
  pub fn is_timeout(&self) -> bool {
    match self {
      Error::Timeout(_) => true,
      Error::IO(e) | Error::Dial { source: e, .. } => e.kind() == ErrorKind::TimedOut,
      Error::DialExhausted { last, .. } => last.is_timeout(),
      _ => false,
    }
  }
}

impl From<http::Error> for Error {
  fn from(value: http::Error) -> Self {
    Error::Http(value)
  }
}

impl From<http::header::InvalidHeaderValue> for Error {
  fn from(value: http::header::InvalidHeaderValue) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<http::uri::InvalidUri> for Error {
  fn from(value: http::uri::InvalidUri) -> Self {
    Error::Http(http::Error::from(value))
  }
}

impl From<rcgen::Error> for Error {
  fn from(value: rcgen::Error) -> Self {
    Error::crypto_error(value.to_string())
  }
}

impl From<tokio::time::error::Elapsed> for Error {
  fn from(_value: tokio::time::error::Elapsed) -> Self {
    Error::Timeout("operation".to_string())
  }
}

pub(crate) fn new_io_error(error_kind: ErrorKind, msg: &str) -> Error {
  Error::IO(std::io::Error::new(error_kind, msg))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn exhausted_race_reports_last_timeout() {
    let err = Error::DialExhausted {
      attempts: 3,
      last: Box::new(Error::Timeout("dial 10.0.0.1:443".to_string())),
    };
    assert!(err.is_timeout());
    assert!(err.to_string().contains("all 3 dial attempts failed"));
    let refused = Error::DialExhausted {
      attempts: 1,
      last: Box::new(new_io_error(ErrorKind::ConnectionRefused, "refused")),
    };
    assert!(!refused.is_timeout());
  }
}

//! Per-request state shared by the filters of a pipeline.
use std::any::Any;
use std::collections::HashMap;
use std::fmt::{Debug, Formatter};
use std::net::SocketAddr;
use std::sync::Arc;

use http::HeaderMap;

use crate::errors::{Error, Result};
use crate::listener::ListenerHandle;
use crate::writer::ResponseWriter;

/// A value stored in [`Values`].
#[derive(Clone)]
pub enum Value {
  /// text
  Str(String),
  /// integer
  Int(i64),
  /// flag
  Bool(bool),
  /// header set
  Headers(HeaderMap),
  /// anything else
  Opaque(Arc<dyn Any + Send + Sync>),
}

impl Value {
  fn kind(&self) -> &'static str {
    match self {
      Value::Str(_) => "a string",
      Value::Int(_) => "an integer",
      Value::Bool(_) => "a bool",
      Value::Headers(_) => "a header map",
      Value::Opaque(_) => "an opaque value",
    }
  }
}

impl Debug for Value {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      Value::Str(s) => Debug::fmt(s, f),
      Value::Int(i) => Debug::fmt(i, f),
      Value::Bool(b) => Debug::fmt(b, f),
      Value::Headers(h) => Debug::fmt(h, f),
      Value::Opaque(_) => f.write_str("<opaque>"),
    }
  }
}

impl From<&str> for Value {
  fn from(value: &str) -> Self {
    Value::Str(value.to_string())
  }
}

impl From<String> for Value {
  fn from(value: String) -> Self {
    Value::Str(value)
  }
}

impl From<i64> for Value {
  fn from(value: i64) -> Self {
    Value::Int(value)
  }
}

impl From<bool> for Value {
  fn from(value: bool) -> Self {
    Value::Bool(value)
  }
}

impl From<HeaderMap> for Value {
  fn from(value: HeaderMap) -> Self {
    Value::Headers(value)
  }
}

/// String-keyed bag of values. Entries are added, never removed.
#[derive(Debug, Clone, Default)]
pub struct Values {
  inner: HashMap<String, Value>,
}

/// Arguments a matching filter hands to its own handler.
pub type FilterArgs = Values;

impl Values {
  /// An empty bag.
  pub fn new() -> Self {
    Self::default()
  }
  /// Builder-style insert.
  pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.insert(key, value);
    self
  }
  /// Stores `value` under `key`, replacing an older value.
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.inner.insert(key.into(), value.into());
  }
  /// Stores an arbitrary shared value.
  pub fn insert_opaque<T: Any + Send + Sync>(&mut self, key: impl Into<String>, value: T) {
    self.inner.insert(key.into(), Value::Opaque(Arc::new(value)));
  }
  /// Raw lookup.
  pub fn get(&self, key: &str) -> Option<&Value> {
    self.inner.get(key)
  }
  /// Whether `key` is present.
  pub fn contains_key(&self, key: &str) -> bool {
    self.inner.contains_key(key)
  }
  /// Number of entries.
  pub fn len(&self) -> usize {
    self.inner.len()
  }
  /// Whether the bag is empty.
  pub fn is_empty(&self) -> bool {
    self.inner.is_empty()
  }
  fn require(&self, key: &str) -> Result<&Value> {
    self
      .inner
      .get(key)
      .ok_or_else(|| Error::MissingArgument(key.to_string()))
  }
  fn mismatch(key: &str, expected: &'static str, found: &Value) -> Error {
    tracing::debug!("filter argument {:?} holds {}", key, found.kind());
    Error::ArgumentType {
      key: key.to_string(),
      expected,
    }
  }
  /// Text value of `key`.
  pub fn get_string(&self, key: &str) -> Result<&str> {
    match self.require(key)? {
      Value::Str(s) => Ok(s),
      other => Err(Self::mismatch(key, "a string", other)),
    }
  }
  /// Integer value of `key`; numeric strings are accepted.
  pub fn get_int(&self, key: &str) -> Result<i64> {
    match self.require(key)? {
      Value::Int(i) => Ok(*i),
      Value::Str(s) => s
        .trim()
        .parse()
        .map_err(|_| Self::mismatch(key, "an integer", &Value::Str(s.clone()))),
      other => Err(Self::mismatch(key, "an integer", other)),
    }
  }
  /// Flag value of `key`.
  pub fn get_bool(&self, key: &str) -> Result<bool> {
    match self.require(key)? {
      Value::Bool(b) => Ok(*b),
      other => Err(Self::mismatch(key, "a bool", other)),
    }
  }
  /// Header set stored under `key`.
  pub fn get_headers(&self, key: &str) -> Result<&HeaderMap> {
    match self.require(key)? {
      Value::Headers(h) => Ok(h),
      other => Err(Self::mismatch(key, "a header map", other)),
    }
  }
  /// Shared value of type `T` stored under `key`.
  pub fn get_opaque<T: Any + Send + Sync>(&self, key: &str) -> Result<Arc<T>> {
    match self.require(key)? {
      Value::Opaque(v) => v
        .clone()
        .downcast::<T>()
        .map_err(|_| Self::mismatch(key, std::any::type_name::<T>(), &Value::Opaque(v.clone()))),
      other => Err(Self::mismatch(key, std::any::type_name::<T>(), other)),
    }
  }
}

/// State of one request travelling through the pipeline.
pub struct Context {
  writer: ResponseWriter,
  listener: Option<ListenerHandle>,
  peer_addr: Option<SocketAddr>,
  tls: bool,
  values: Values,
}

impl Context {
  /// A context for a request read from `peer_addr`.
  pub fn new(
    writer: ResponseWriter,
    listener: Option<ListenerHandle>,
    peer_addr: Option<SocketAddr>,
    tls: bool,
  ) -> Self {
    Self {
      writer,
      listener,
      peer_addr,
      tls,
      values: Values::new(),
    }
  }
  /// The client-facing response sink.
  pub fn writer(&self) -> &ResponseWriter {
    &self.writer
  }
  /// The client-facing response sink.
  pub fn writer_mut(&mut self) -> &mut ResponseWriter {
    &mut self.writer
  }
  /// Handle of the listener that accepted the connection.
  pub fn listener(&self) -> Option<&ListenerHandle> {
    self.listener.as_ref()
  }
  /// Address of the client.
  pub fn peer_addr(&self) -> Option<SocketAddr> {
    self.peer_addr
  }
  /// Whether the request arrived over TLS.
  pub fn is_tls(&self) -> bool {
    self.tls
  }
  /// Values added by filters so far.
  pub fn values(&self) -> &Values {
    &self.values
  }
  /// Adds a value for later filters.
  pub fn insert(&mut self, key: impl Into<String>, value: impl Into<Value>) {
    self.values.insert(key, value);
  }
  pub(crate) fn into_writer(self) -> ResponseWriter {
    self.writer
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[derive(Debug, PartialEq)]
  struct Marker(u8);

  #[test]
  fn typed_getters() {
    let mut headers = HeaderMap::new();
    headers.insert("x-stub", "1".parse().unwrap());
    let mut args = FilterArgs::new()
      .with("StatusCode", 404i64)
      .with("Legacy", "302")
      .with("Body", "gone")
      .with("Header", headers);
    args.insert_opaque("marker", Marker(7));
    assert_eq!(args.get_int("StatusCode").unwrap(), 404);
    assert_eq!(args.get_int("Legacy").unwrap(), 302);
    assert_eq!(args.get_string("Body").unwrap(), "gone");
    assert_eq!(args.get_headers("Header").unwrap()["x-stub"], "1");
    assert_eq!(*args.get_opaque::<Marker>("marker").unwrap(), Marker(7));
    assert!(matches!(
      args.get_int("Body"),
      Err(Error::ArgumentType { .. })
    ));
    assert!(matches!(
      args.get_opaque::<String>("marker"),
      Err(Error::ArgumentType { .. })
    ));
    assert!(matches!(
      args.get_string("missing"),
      Err(Error::MissingArgument(_))
    ));
  }
}

//! Model synchronization: CRUD intents translated to HTTP requests and back.
//!
//! Every adapter resolves a sync to exactly one `Ok(SyncResponse)` or `Err(SyncError)`.

mod api;
mod cached;
mod client;
mod hateoas;
mod model;
pub mod offline;
pub mod request;
mod rest;

pub use api::ApiAdapter;
pub use cached::CachedAdapter;
pub use client::{HttpTransport, Transport};
pub use hateoas::HateoasAdapter;
pub use model::{Collection, HttpDefaults, Model, ModelDescriptor, Syncable};
pub use offline::{LocalStore, Offline, OfflineAdapter, OfflineHandler};
pub use request::SyncRequest;
pub use rest::RestAdapter;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use crate::cache::CacheSource;
use crate::error::{ConfigError, SyncError};

/// Canonical model operations.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncMethod {
  Create,
  Read,
  Update,
  Delete,
  Patch,
}

impl SyncMethod {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Create => "create",
      Self::Read => "read",
      Self::Update => "update",
      Self::Delete => "delete",
      Self::Patch => "patch",
    }
  }

  /// Whether the operation changes server state.
  pub fn is_write(self) -> bool {
    !matches!(self, Self::Read)
  }
}

impl FromStr for SyncMethod {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s.to_ascii_lowercase().as_str() {
      "create" => Ok(Self::Create),
      "read" => Ok(Self::Read),
      "update" => Ok(Self::Update),
      "delete" => Ok(Self::Delete),
      "patch" => Ok(Self::Patch),
      other => Err(format!("unknown sync method '{other}'")),
    }
  }
}

impl fmt::Display for SyncMethod {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpVerb {
  Get,
  Post,
  Put,
  Patch,
  Delete,
}

impl HttpVerb {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Get => "GET",
      Self::Post => "POST",
      Self::Put => "PUT",
      Self::Patch => "PATCH",
      Self::Delete => "DELETE",
    }
  }

  pub fn to_method(self) -> reqwest::Method {
    match self {
      Self::Get => reqwest::Method::GET,
      Self::Post => reqwest::Method::POST,
      Self::Put => reqwest::Method::PUT,
      Self::Patch => reqwest::Method::PATCH,
      Self::Delete => reqwest::Method::DELETE,
    }
  }
}

impl fmt::Display for HttpVerb {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Adapter flavours a model can be bound to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AdapterKind {
  #[default]
  Rest,
  Api,
  Hateoas,
  /// Local mirror in front of a network adapter
  Offline,
}

impl AdapterKind {
  pub fn as_str(self) -> &'static str {
    match self {
      Self::Rest => "rest",
      Self::Api => "api",
      Self::Hateoas => "hateoas",
      Self::Offline => "offline",
    }
  }
}

impl FromStr for AdapterKind {
  type Err = ConfigError;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "rest" => Ok(Self::Rest),
      "api" => Ok(Self::Api),
      "hateoas" => Ok(Self::Hateoas),
      "offline" => Ok(Self::Offline),
      other => Err(ConfigError::UnknownAdapter(other.to_string())),
    }
  }
}

impl fmt::Display for AdapterKind {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

/// Query string source for a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Query {
  /// Serialized as `application/x-www-form-urlencoded`
  Params(BTreeMap<String, String>),
  /// Used as-is, `?` added when missing
  Raw(String),
}

/// Per-call options.
#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
  /// Send an update as a partial PATCH
  pub patch: bool,
  /// Attribute names to send in a partial update
  pub changed: Option<Vec<String>>,
  pub query: Option<Query>,
  pub headers: BTreeMap<String, String>,
  /// Overrides the computed URL
  pub url: Option<String>,
  /// Overrides the descriptor's emulate-HTTP setting
  pub emulate_http: Option<bool>,
  /// Serve reads from cache for this many seconds
  pub ttl: Option<u64>,
}

impl SyncOptions {
  pub fn new() -> Self {
    Self::default()
  }

  /// Partial update sending only `fields`.
  pub fn patch<I, S>(mut self, fields: I) -> Self
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    self.patch = true;
    self.changed = Some(fields.into_iter().map(Into::into).collect());
    self
  }

  pub fn param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    match &mut self.query {
      Some(Query::Params(params)) => {
        params.insert(key.into(), value.into());
      }
      _ => {
        let mut params = BTreeMap::new();
        params.insert(key.into(), value.into());
        self.query = Some(Query::Params(params));
      }
    }
    self
  }

  pub fn raw_query(mut self, query: impl Into<String>) -> Self {
    self.query = Some(Query::Raw(query.into()));
    self
  }

  pub fn header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(key.into(), value.into());
    self
  }

  pub fn emulate_http(mut self, enabled: bool) -> Self {
    self.emulate_http = Some(enabled);
    self
  }

  pub fn ttl(mut self, secs: u64) -> Self {
    self.ttl = Some(secs);
    self
  }
}

/// Paging metadata returned alongside a HATEOAS collection.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Pagination {
  pub size: Option<u64>,
  pub total_elements: Option<u64>,
  pub total_pages: Option<u64>,
  /// Zero-based current page
  pub number: Option<u64>,
  /// Relation name to href
  #[serde(default)]
  pub links: BTreeMap<String, String>,
}

impl Pagination {
  pub fn next_url(&self) -> Option<&str> {
    self.links.get("next").map(String::as_str)
  }

  pub fn has_next(&self) -> bool {
    if self.links.contains_key("next") {
      return true;
    }
    match (self.number, self.total_pages) {
      (Some(number), Some(total)) => number + 1 < total,
      _ => false,
    }
  }
}

/// Successful sync outcome.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncResponse {
  /// Model attributes or collection array
  pub payload: Value,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub pagination: Option<Pagination>,
  #[serde(skip)]
  pub source: CacheSource,
}

impl SyncResponse {
  pub fn new(payload: Value) -> Self {
    Self {
      payload,
      pagination: None,
      source: CacheSource::Network,
    }
  }

  pub fn with_pagination(mut self, pagination: Option<Pagination>) -> Self {
    self.pagination = pagination;
    self
  }

  pub fn with_source(mut self, source: CacheSource) -> Self {
    self.source = source;
    self
  }
}

/// Translates a CRUD intent on a model into I/O and normalizes the answer.
#[async_trait]
pub trait SyncAdapter: Send + Sync {
  async fn sync(
    &self,
    method: SyncMethod,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError>;

  fn kind(&self) -> AdapterKind;
}

#[cfg(test)]
pub(crate) mod testing {
  use super::*;
  use std::collections::VecDeque;
  use std::sync::Mutex;

  /// Transport replaying canned responses and recording requests.
  #[derive(Default)]
  pub struct StubTransport {
    responses: Mutex<VecDeque<Result<Value, SyncError>>>,
    pub requests: Mutex<Vec<SyncRequest>>,
  }

  impl StubTransport {
    pub fn new() -> Self {
      Self::default()
    }

    pub fn respond(self, body: Value) -> Self {
      self.responses.lock().unwrap().push_back(Ok(body));
      self
    }

    pub fn fail(self, status: u16) -> Self {
      self
        .responses
        .lock()
        .unwrap()
        .push_back(Err(SyncError::Transport {
          status: Some(status),
          message: "stub failure".into(),
          body: Value::Null,
        }));
      self
    }

    pub fn last_request(&self) -> SyncRequest {
      self.requests.lock().unwrap().last().cloned().unwrap()
    }

    pub fn request_count(&self) -> usize {
      self.requests.lock().unwrap().len()
    }
  }

  #[async_trait]
  impl Transport for StubTransport {
    async fn send(&self, request: &SyncRequest) -> Result<Value, SyncError> {
      self.requests.lock().unwrap().push(request.clone());
      self
        .responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or_else(|| {
          Err(SyncError::Transport {
            status: None,
            message: "no stub response".into(),
            body: Value::Null,
          })
        })
    }
  }

  pub fn descriptor(kind: AdapterKind) -> ModelDescriptor {
    ModelDescriptor::new("users", kind, "https://api.test/v1")
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_method_parse() {
    assert_eq!("READ".parse::<SyncMethod>().unwrap(), SyncMethod::Read);
    assert!("upsert".parse::<SyncMethod>().is_err());
    assert!(SyncMethod::Patch.is_write());
    assert!(!SyncMethod::Read.is_write());
  }

  #[test]
  fn test_options_param_accumulates() {
    let opts = SyncOptions::new().param("page", "2").param("q", "a b");
    match opts.query {
      Some(Query::Params(params)) => {
        assert_eq!(params.len(), 2);
        assert_eq!(params["q"], "a b");
      }
      other => panic!("unexpected query {other:?}"),
    }
  }

  #[test]
  fn test_pagination_has_next() {
    let page = Pagination {
      number: Some(0),
      total_pages: Some(2),
      ..Default::default()
    };
    assert!(page.has_next());

    let last = Pagination {
      number: Some(1),
      total_pages: Some(2),
      ..Default::default()
    };
    assert!(!last.has_next());
  }

  #[test]
  fn test_adapter_kind_parse() {
    assert_eq!("hateoas".parse::<AdapterKind>().unwrap(), AdapterKind::Hateoas);
    assert_eq!(
      "soap".parse::<AdapterKind>().unwrap_err(),
      ConfigError::UnknownAdapter("soap".into())
    );
  }
}

//! Wire request construction and response normalization shared by the adapters.

use serde_json::{Map, Value};
use std::collections::BTreeMap;
use tracing::debug;

use super::model::{id_to_string, Syncable};
use super::{HttpVerb, Query, SyncMethod, SyncOptions};
use crate::error::SyncError;

pub const METHOD_OVERRIDE_HEADER: &str = "X-HTTP-Method-Override";

/// A request ready to hand to a [`super::Transport`].
#[derive(Debug, Clone, PartialEq)]
pub struct SyncRequest {
  pub method: SyncMethod,
  pub url: String,
  /// Verb actually sent on the wire
  pub http_method: HttpVerb,
  pub headers: BTreeMap<String, String>,
  pub body: Option<Value>,
}

impl SyncRequest {
  pub fn header(&self, name: &str) -> Option<&str> {
    self
      .headers
      .iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(name))
      .map(|(_, v)| v.as_str())
  }
}

/// How an adapter flavours request construction.
#[derive(Debug, Clone, Copy)]
pub struct RequestRules {
  /// Verb for a full update
  pub update_verb: HttpVerb,
  /// Merge the descriptor's default query into every request
  pub merge_default_query: bool,
}

/// CRUD to HTTP verb mapping, before any emulation rewrite.
pub fn http_verb(method: SyncMethod, opts: &SyncOptions, update_verb: HttpVerb) -> HttpVerb {
  match method {
    SyncMethod::Create => HttpVerb::Post,
    SyncMethod::Read => HttpVerb::Get,
    SyncMethod::Delete => HttpVerb::Delete,
    SyncMethod::Patch => HttpVerb::Patch,
    SyncMethod::Update if opts.patch => HttpVerb::Patch,
    SyncMethod::Update => update_verb,
  }
}

/// Join a base URL and a path segment with exactly one slash.
pub fn join_url(base: &str, segment: &str) -> String {
  let segment = segment.trim_start_matches('/');
  if segment.is_empty() {
    return base.to_string();
  }
  format!("{}/{}", base.trim_end_matches('/'), segment)
}

/// Append a query to `url`, continuing an existing query string if there is one.
pub fn append_query(url: &str, query: &Query) -> String {
  let encoded = match query {
    Query::Params(params) => url::form_urlencoded::Serializer::new(String::new())
      .extend_pairs(params.iter())
      .finish(),
    Query::Raw(raw) => raw.trim_start_matches('?').to_string(),
  };

  if encoded.is_empty() {
    return url.to_string();
  }

  let separator = if url.contains('?') { '&' } else { '?' };
  format!("{url}{separator}{encoded}")
}

/// URL of the model without query: collection URL plus `/id` for a known single model.
pub fn resource_url(method: SyncMethod, model: &dyn Syncable) -> String {
  let descriptor = model.descriptor();
  let base = join_url(&descriptor.base_url, &descriptor.name);

  match model.id() {
    Some(id) if method != SyncMethod::Create => join_url(&base, &id_to_string(&id)),
    _ => base,
  }
}

/// Full request URL including the query string.
pub fn request_url(
  method: SyncMethod,
  model: &dyn Syncable,
  opts: &SyncOptions,
  rules: RequestRules,
) -> String {
  let mut url = opts
    .url
    .clone()
    .unwrap_or_else(|| resource_url(method, model));

  let defaults = &model.descriptor().http_defaults.query;
  if rules.merge_default_query && !defaults.is_empty() {
    // Call-level params win over configured defaults
    let mut merged = defaults.clone();
    match &opts.query {
      Some(Query::Params(params)) => {
        merged.extend(params.clone());
        return append_query(&url, &Query::Params(merged));
      }
      Some(raw @ Query::Raw(_)) => {
        url = append_query(&url, &Query::Params(merged));
        return append_query(&url, raw);
      }
      None => return append_query(&url, &Query::Params(merged)),
    }
  }

  match &opts.query {
    Some(query) => append_query(&url, query),
    None => url,
  }
}

/// Serialized request body: full attributes, only the change set for patches, none otherwise.
pub fn request_body(method: SyncMethod, model: &dyn Syncable, opts: &SyncOptions) -> Option<Value> {
  let partial = method == SyncMethod::Patch || (method == SyncMethod::Update && opts.patch);

  match method {
    SyncMethod::Read | SyncMethod::Delete => None,
    _ if partial => {
      let attributes = model.to_json();
      let mut body = Map::new();
      for field in opts.changed.iter().flatten() {
        if let Some(value) = attributes.get(field) {
          body.insert(field.clone(), value.clone());
        }
      }
      Some(Value::Object(body))
    }
    _ => Some(model.to_json()),
  }
}

/// Build the wire request for a sync.
pub fn build_request(
  method: SyncMethod,
  model: &dyn Syncable,
  opts: &SyncOptions,
  rules: RequestRules,
) -> SyncRequest {
  let descriptor = model.descriptor();
  let update_verb = descriptor
    .http_defaults
    .update_method
    .unwrap_or(rules.update_verb);

  let mut http_method = http_verb(method, opts, update_verb);

  let mut headers = descriptor.http_defaults.headers.clone();
  headers.extend(opts.headers.clone());

  let emulate = opts
    .emulate_http
    .unwrap_or(descriptor.http_defaults.emulate_http);
  if emulate && matches!(http_method, HttpVerb::Put | HttpVerb::Patch | HttpVerb::Delete) {
    headers.insert(
      METHOD_OVERRIDE_HEADER.to_string(),
      http_method.as_str().to_string(),
    );
    http_method = HttpVerb::Post;
  }

  let request = SyncRequest {
    method,
    url: request_url(method, model, opts, rules),
    http_method,
    headers,
    body: request_body(method, model, opts),
  };
  debug!(method = %method, verb = %request.http_method, url = %request.url, "built sync request");
  request
}

/// Extract the array of a collection response: bare, or under `wrapper`.
pub fn normalize_collection(body: Value, wrapper: &str) -> Result<Value, SyncError> {
  if body.is_array() {
    return Ok(body);
  }

  let wrapped = body
    .as_object()
    .and_then(|map| map.get(wrapper))
    .filter(|items| items.is_array())
    .cloned();

  wrapped.ok_or_else(|| {
    SyncError::validation(
      format!("expected an array or an object with an array in '{wrapper}'"),
      body,
    )
  })
}

/// Check a single-model response carries a non-null id.
pub fn normalize_single(body: Value, id_attribute: &str) -> Result<Value, SyncError> {
  let has_id = body
    .get(id_attribute)
    .map(|id| !id.is_null())
    .unwrap_or(false);

  if has_id {
    Ok(body)
  } else {
    Err(SyncError::validation(
      format!("response has no '{id_attribute}'"),
      body,
    ))
  }
}

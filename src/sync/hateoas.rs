//! Adapter for hypermedia APIs returning `content`/`page`/`links` envelopes.

use async_trait::async_trait;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::Arc;

use super::client::Transport;
use super::model::Syncable;
use super::request::{build_request, normalize_collection, normalize_single, RequestRules};
use super::{
  AdapterKind, HttpVerb, Pagination, SyncAdapter, SyncMethod, SyncOptions, SyncResponse,
};
use crate::error::SyncError;

const RULES: RequestRules = RequestRules {
  update_verb: HttpVerb::Put,
  merge_default_query: false,
};

#[derive(Clone)]
pub struct HateoasAdapter {
  transport: Arc<dyn Transport>,
}

impl HateoasAdapter {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }
}

/// Fail when the body carries an `{"error": {...}}` marker.
fn check_error_marker(body: Value) -> Result<Value, SyncError> {
  let marker = body.get("error").and_then(Value::as_object).map(|error| {
    let field = |name: &str| {
      error
        .get(name)
        .and_then(Value::as_str)
        .map(str::to_string)
    };
    (
      field("type").unwrap_or_else(|| "error".to_string()),
      field("message").unwrap_or_default(),
    )
  });

  match marker {
    Some((kind, message)) => Err(SyncError::Remote {
      kind,
      message,
      body,
    }),
    None => Ok(body),
  }
}

/// Collect links from HAL (`_links: {rel: {href}}`) or list (`links: [{rel, href}]`) form.
fn parse_links(body: &Value) -> BTreeMap<String, String> {
  let mut links = BTreeMap::new();

  if let Some(hal) = body.get("_links").and_then(Value::as_object) {
    for (rel, link) in hal {
      if let Some(href) = link.get("href").and_then(Value::as_str) {
        links.insert(rel.clone(), href.to_string());
      }
    }
  }

  if let Some(list) = body.get("links").and_then(Value::as_array) {
    for link in list {
      let rel = link.get("rel").and_then(Value::as_str);
      let href = link.get("href").and_then(Value::as_str);
      if let (Some(rel), Some(href)) = (rel, href) {
        links.insert(rel.to_string(), href.to_string());
      }
    }
  }

  links
}

fn parse_pagination(body: &Value) -> Option<Pagination> {
  let page = body.get("page").and_then(Value::as_object);
  let links = parse_links(body);
  if page.is_none() && links.is_empty() {
    return None;
  }

  let number = |name: &str| page.and_then(|p| p.get(name)).and_then(Value::as_u64);
  Some(Pagination {
    size: number("size"),
    total_elements: number("totalElements"),
    total_pages: number("totalPages"),
    number: number("number"),
    links,
  })
}

fn extract_collection(body: Value, name: &str, wrapper: &str) -> Result<Value, SyncError> {
  if let Some(content @ Value::Array(_)) = body.get("content") {
    return Ok(content.clone());
  }

  if let Some(embedded) = body.get("_embedded").and_then(Value::as_object) {
    let items = embedded
      .get(name)
      .filter(|v| v.is_array())
      .or_else(|| embedded.values().find(|v| v.is_array()));
    if let Some(items) = items {
      return Ok(items.clone());
    }
  }

  normalize_collection(body, wrapper)
}

fn extract_single(body: Value) -> Value {
  let mut map: Map<String, Value> = match body {
    Value::Object(map) => map,
    other => return other,
  };

  if let Some(Value::Object(content)) = map.remove("content") {
    return Value::Object(content);
  }
  map.remove("_links");
  map.remove("links");
  Value::Object(map)
}

#[async_trait]
impl SyncAdapter for HateoasAdapter {
  async fn sync(
    &self,
    method: SyncMethod,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let request = build_request(method, model, opts, RULES);
    let body = check_error_marker(self.transport.send(&request).await?)?;
    let descriptor = model.descriptor();

    if method == SyncMethod::Delete {
      return Ok(SyncResponse::new(body));
    }

    if model.is_collection() {
      let pagination = parse_pagination(&body);
      let items = extract_collection(body, &descriptor.name, &descriptor.collection_wrapper)?;
      return Ok(SyncResponse::new(items).with_pagination(pagination));
    }

    let payload = normalize_single(extract_single(body), &descriptor.id_attribute)?;
    Ok(SyncResponse::new(payload))
  }

  fn kind(&self) -> AdapterKind {
    AdapterKind::Hateoas
  }
}

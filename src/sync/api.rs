use async_trait::async_trait;
use serde_json::Value;
use std::sync::Arc;

use super::client::Transport;
use super::model::Syncable;
use super::request::{build_request, normalize_collection, normalize_single, RequestRules};
use super::{AdapterKind, HttpVerb, SyncAdapter, SyncMethod, SyncOptions, SyncResponse};
use crate::error::SyncError;

const RULES: RequestRules = RequestRules {
  update_verb: HttpVerb::Post,
  merge_default_query: true,
};

/// Adapter for RPC-flavoured JSON APIs.
///
/// Updates go out as POST unless the descriptor says otherwise, every request
/// carries the configured default query, and single models may come back inside
/// the same wrapper field as collections.
#[derive(Clone)]
pub struct ApiAdapter {
  transport: Arc<dyn Transport>,
}

impl ApiAdapter {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }
}

/// Unwrap `{wrapper: {...}}` around a single model.
fn unwrap_single(body: Value, wrapper: &str) -> Value {
  match body {
    Value::Object(mut map) if map.get(wrapper).is_some_and(Value::is_object) => {
      map.remove(wrapper).unwrap_or(Value::Null)
    }
    other => other,
  }
}

#[async_trait]
impl SyncAdapter for ApiAdapter {
  async fn sync(
    &self,
    method: SyncMethod,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let request = build_request(method, model, opts, RULES);
    let body = self.transport.send(&request).await?;
    let descriptor = model.descriptor();

    let payload = match method {
      SyncMethod::Delete => body,
      _ if model.is_collection() => normalize_collection(body, &descriptor.collection_wrapper)?,
      _ => normalize_single(
        unwrap_single(body, &descriptor.collection_wrapper),
        &descriptor.id_attribute,
      )?,
    };

    Ok(SyncResponse::new(payload))
  }

  fn kind(&self) -> AdapterKind {
    AdapterKind::Api
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::testing::{descriptor, StubTransport};
  use crate::sync::{HttpDefaults, Model};
  use serde_json::json;
  use std::collections::BTreeMap;

  #[tokio::test]
  async fn test_update_posts_and_merges_default_query() {
    let transport = Arc::new(StubTransport::new().respond(json!({"data": {"id": 3, "n": 1}})));
    let api = ApiAdapter::new(transport.clone());

    let defaults = HttpDefaults {
      query: BTreeMap::from([("lang".to_string(), "en".to_string())]),
      headers: BTreeMap::from([("X-App".to_string(), "demo".to_string())]),
      ..Default::default()
    };
    let model = Model::new(descriptor(AdapterKind::Api).with_http_defaults(defaults))
      .with_attributes(json!({"id": 3, "n": 1}));

    let response = api
      .sync(SyncMethod::Update, &model, &SyncOptions::new().param("lang", "it"))
      .await
      .unwrap();

    assert_eq!(response.payload, json!({"id": 3, "n": 1}));
    let request = transport.last_request();
    assert_eq!(request.http_method, HttpVerb::Post);
    assert_eq!(request.url, "https://api.test/v1/users/3?lang=it");
    assert_eq!(request.header("x-app"), Some("demo"));
  }

  #[tokio::test]
  async fn test_raw_query_follows_default_query() {
    let transport = Arc::new(StubTransport::new().respond(json!([])));
    let api = ApiAdapter::new(transport.clone());

    let defaults = HttpDefaults {
      query: BTreeMap::from([("v".to_string(), "2".to_string())]),
      ..Default::default()
    };
    let collection =
      crate::sync::Collection::new(descriptor(AdapterKind::Api).with_http_defaults(defaults));

    api
      .sync(SyncMethod::Read, &collection, &SyncOptions::new().raw_query("?q=x"))
      .await
      .unwrap();
    assert_eq!(transport.last_request().url, "https://api.test/v1/users?v=2&q=x");
  }

  #[test]
  fn test_unwrap_single_only_unwraps_objects() {
    assert_eq!(unwrap_single(json!({"data": {"id": 1}}), "data"), json!({"id": 1}));
    assert_eq!(
      unwrap_single(json!({"id": 1, "data": [1]}), "data"),
      json!({"id": 1, "data": [1]})
    );
  }
}

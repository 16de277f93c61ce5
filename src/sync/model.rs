//! Model boundary consumed by the adapters.

use serde_json::{Map, Value};
use std::collections::BTreeMap;

use super::{AdapterKind, HttpVerb};

/// Per-model HTTP settings supplied by configuration.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HttpDefaults {
  pub headers: BTreeMap<String, String>,
  pub query: BTreeMap<String, String>,
  pub emulate_http: bool,
  /// Verb for full updates; the adapter decides when unset
  pub update_method: Option<HttpVerb>,
  /// Cache reads for this many seconds
  pub ttl: Option<u64>,
}

/// Read-only description of how a model talks to its backend.
#[derive(Debug, Clone, PartialEq)]
pub struct ModelDescriptor {
  /// Resource name appended to the base URL
  pub name: String,
  pub adapter: AdapterKind,
  pub base_url: String,
  pub id_attribute: String,
  /// Field wrapping arrays in collection responses
  pub collection_wrapper: String,
  pub http_defaults: HttpDefaults,
}

impl ModelDescriptor {
  pub fn new(name: impl Into<String>, adapter: AdapterKind, base_url: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      adapter,
      base_url: base_url.into(),
      id_attribute: "id".to_string(),
      collection_wrapper: "data".to_string(),
      http_defaults: HttpDefaults::default(),
    }
  }

  pub fn with_id_attribute(mut self, attr: impl Into<String>) -> Self {
    self.id_attribute = attr.into();
    self
  }

  pub fn with_collection_wrapper(mut self, field: impl Into<String>) -> Self {
    self.collection_wrapper = field.into();
    self
  }

  pub fn with_http_defaults(mut self, defaults: HttpDefaults) -> Self {
    self.http_defaults = defaults;
    self
  }
}

/// Anything an adapter can sync: a single model or a collection.
pub trait Syncable: Send + Sync {
  fn descriptor(&self) -> &ModelDescriptor;

  /// Attributes of a model, or the array of a collection.
  fn to_json(&self) -> Value;

  fn is_collection(&self) -> bool {
    false
  }

  fn get(&self, attr: &str) -> Option<Value> {
    match self.to_json() {
      Value::Object(mut map) => map.remove(attr),
      _ => None,
    }
  }

  /// Non-null id of a single model.
  fn id(&self) -> Option<Value> {
    if self.is_collection() {
      return None;
    }
    self
      .get(&self.descriptor().id_attribute)
      .filter(|v| !v.is_null())
  }
}

/// Render an id value as a path segment.
pub fn id_to_string(id: &Value) -> String {
  match id {
    Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

/// A single model with JSON attributes.
#[derive(Debug, Clone, PartialEq)]
pub struct Model {
  descriptor: ModelDescriptor,
  attributes: Map<String, Value>,
}

impl Model {
  pub fn new(descriptor: ModelDescriptor) -> Self {
    Self {
      descriptor,
      attributes: Map::new(),
    }
  }

  /// Replace the attributes; non-object values are ignored.
  pub fn with_attributes(mut self, attributes: Value) -> Self {
    if let Value::Object(map) = attributes {
      self.attributes = map;
    }
    self
  }

  pub fn set(&mut self, attr: impl Into<String>, value: Value) {
    self.attributes.insert(attr.into(), value);
  }

  /// Merge a server payload into the attributes.
  pub fn apply(&mut self, payload: &Value) {
    if let Value::Object(map) = payload {
      for (key, value) in map {
        self.attributes.insert(key.clone(), value.clone());
      }
    }
  }

  pub fn attributes(&self) -> &Map<String, Value> {
    &self.attributes
  }
}

impl Syncable for Model {
  fn descriptor(&self) -> &ModelDescriptor {
    &self.descriptor
  }

  fn to_json(&self) -> Value {
    Value::Object(self.attributes.clone())
  }

  fn get(&self, attr: &str) -> Option<Value> {
    self.attributes.get(attr).cloned()
  }
}

/// An ordered list of models sharing one descriptor.
#[derive(Debug, Clone, PartialEq)]
pub struct Collection {
  descriptor: ModelDescriptor,
  models: Vec<Model>,
}

impl Collection {
  pub fn new(descriptor: ModelDescriptor) -> Self {
    Self {
      descriptor,
      models: Vec::new(),
    }
  }

  /// Replace the contents with the items of a normalized array payload.
  pub fn reset(&mut self, payload: &Value) {
    self.models = payload
      .as_array()
      .map(|items| {
        items
          .iter()
          .map(|item| Model::new(self.descriptor.clone()).with_attributes(item.clone()))
          .collect()
      })
      .unwrap_or_default();
  }

  pub fn models(&self) -> &[Model] {
    &self.models
  }

  pub fn len(&self) -> usize {
    self.models.len()
  }

  pub fn is_empty(&self) -> bool {
    self.models.is_empty()
  }
}

impl Syncable for Collection {
  fn descriptor(&self) -> &ModelDescriptor {
    &self.descriptor
  }

  fn to_json(&self) -> Value {
    Value::Array(self.models.iter().map(Syncable::to_json).collect())
  }

  fn is_collection(&self) -> bool {
    true
  }
}

//! Offline handling: a swappable handler in front of (or instead of) the network.
//!
//! Each mirrored model is either `Synced` or `PendingOffline`. Writes that cannot
//! reach the network land in the mirror as pending; `fullsync` replays them and
//! only a successful replay moves a record back to `Synced`.

use async_trait::async_trait;
use chrono::Utc;
use color_eyre::eyre::{eyre, Report};
use rusqlite::{params, OptionalExtension};
use serde_json::Value;
use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::model::{id_to_string, Collection, Model, ModelDescriptor, Syncable};
use super::{AdapterKind, SyncAdapter, SyncMethod, SyncOptions, SyncResponse};
use crate::cache::CacheSource;
use crate::db::{schema::OFFLINE_SCHEMA, Database};
use crate::error::SyncError;

/// Prefix of ids assigned to models created while offline.
pub const LOCAL_ID_PREFIX: &str = "local-";

/// Handler implementation behind [`Offline`]. Unimplemented operations fail by name.
#[async_trait]
pub trait OfflineHandler: Send + Sync {
  async fn create(
    &self,
    _model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    Err(SyncError::NotImplemented("create"))
  }

  async fn read(
    &self,
    _model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    Err(SyncError::NotImplemented("read"))
  }

  async fn update(
    &self,
    _model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    Err(SyncError::NotImplemented("update"))
  }

  async fn delete(
    &self,
    _model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    Err(SyncError::NotImplemented("delete"))
  }

  async fn patch(
    &self,
    _model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    Err(SyncError::NotImplemented("patch"))
  }

  /// Reconcile the local mirror with the network.
  async fn fullsync(
    &self,
    _model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    Err(SyncError::NotImplemented("fullsync"))
  }

  /// Read from the local mirror only.
  async fn read_offline(
    &self,
    _model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    Err(SyncError::NotImplemented("read_offline"))
  }

  /// Drop local copies without touching the network.
  async fn destroy_offline(
    &self,
    _model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    Err(SyncError::NotImplemented("destroy_offline"))
  }

  fn set_offline(&self, _model: &dyn Syncable, _value: bool) -> Result<(), SyncError> {
    Err(SyncError::NotImplemented("set_offline"))
  }

  fn is_offline(&self, _model: &dyn Syncable) -> Result<bool, SyncError> {
    Err(SyncError::NotImplemented("is_offline"))
  }
}

/// Dispatches sync intents to the configured handler.
#[derive(Clone)]
pub struct Offline {
  handler: Arc<dyn OfflineHandler>,
}

impl Offline {
  pub fn new(handler: Arc<dyn OfflineHandler>) -> Self {
    Self { handler }
  }

  pub async fn sync(
    &self,
    method: SyncMethod,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    match method {
      SyncMethod::Create => self.handler.create(model, opts).await,
      SyncMethod::Read => self.handler.read(model, opts).await,
      SyncMethod::Update => self.handler.update(model, opts).await,
      SyncMethod::Delete => self.handler.delete(model, opts).await,
      SyncMethod::Patch => self.handler.patch(model, opts).await,
    }
  }

  pub async fn fullsync(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    self.handler.fullsync(model, opts).await
  }

  pub async fn read_offline(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    self.handler.read_offline(model, opts).await
  }

  pub async fn destroy_offline(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    self.handler.destroy_offline(model, opts).await
  }

  pub fn set_offline(&self, model: &dyn Syncable, value: bool) -> Result<(), SyncError> {
    self.handler.set_offline(model, value)
  }

  pub fn is_offline(&self, model: &dyn Syncable) -> Result<bool, SyncError> {
    self.handler.is_offline(model)
  }
}

/// Adapter binding models to the offline layer.
#[derive(Clone)]
pub struct OfflineAdapter {
  offline: Offline,
}

impl OfflineAdapter {
  pub fn new(offline: Offline) -> Self {
    Self { offline }
  }
}

#[async_trait]
impl SyncAdapter for OfflineAdapter {
  async fn sync(
    &self,
    method: SyncMethod,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    self.offline.sync(method, model, opts).await
  }

  fn kind(&self) -> AdapterKind {
    AdapterKind::Offline
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OfflineState {
  /// Local copy matches the last network answer
  Synced,
  /// Local changes not yet confirmed by the network
  PendingOffline,
}

/// A mirrored model.
#[derive(Debug, Clone, PartialEq)]
pub struct OfflineRecord {
  pub adapter: String,
  pub id: String,
  pub data: Value,
  pub offline: bool,
  /// Deleted locally, deletion not yet replayed
  pub deleted: bool,
  pub updated_at: String,
}

impl OfflineRecord {
  pub fn state(&self) -> OfflineState {
    if self.offline {
      OfflineState::PendingOffline
    } else {
      OfflineState::Synced
    }
  }

  /// Created offline and never seen by the server.
  pub fn is_local_only(&self) -> bool {
    self.id.starts_with(LOCAL_ID_PREFIX)
  }
}

fn storage_err(err: Report) -> SyncError {
  SyncError::storage(err)
}

fn offline_response(payload: Value) -> SyncResponse {
  SyncResponse::new(payload).with_source(CacheSource::Offline)
}

/// Merge `payload` over `base` when both are objects.
fn merge(base: Value, payload: &Value) -> Value {
  match (base, payload) {
    (Value::Object(mut base), Value::Object(patch)) => {
      for (key, value) in patch {
        base.insert(key.clone(), value.clone());
      }
      Value::Object(base)
    }
    (_, payload) => payload.clone(),
  }
}

/// Offline handler mirroring models into SQLite.
///
/// With an upstream adapter, network results are mirrored and transport failures
/// fall back to the mirror. Without one, everything stays local.
pub struct LocalStore {
  db: Database,
  upstream: Option<Arc<dyn SyncAdapter>>,
  next_local: AtomicU64,
}

impl LocalStore {
  pub fn open(path: &Path) -> color_eyre::Result<Self> {
    let db = Database::try_open(path, OFFLINE_SCHEMA)
      .ok_or_else(|| eyre!("Offline mirror unavailable at {}", path.display()))?;
    Ok(Self::with_db(db))
  }

  pub fn in_memory() -> color_eyre::Result<Self> {
    Ok(Self::with_db(Database::open_in_memory(OFFLINE_SCHEMA)?))
  }

  fn with_db(db: Database) -> Self {
    Self {
      db,
      upstream: None,
      next_local: AtomicU64::new(0),
    }
  }

  /// Network adapter used for writes, reads and replay.
  pub fn with_upstream(mut self, upstream: Arc<dyn SyncAdapter>) -> Self {
    self.upstream = Some(upstream);
    self
  }

  fn local_id(&self) -> String {
    let nanos = Utc::now().timestamp_nanos_opt().unwrap_or_default();
    let seq = self.next_local.fetch_add(1, Ordering::Relaxed);
    format!("{LOCAL_ID_PREFIX}{nanos}-{seq}")
  }

  pub fn record(&self, adapter: &str, id: &str) -> Result<Option<OfflineRecord>, SyncError> {
    self
      .db
      .with_conn("Failed to read offline record", |conn| {
        conn
          .query_row(
            "SELECT adapter, id, data, offline, deleted, updated_at FROM offline_mirror
             WHERE adapter = ? AND id = ?",
            params![adapter, id],
            decode_row,
          )
          .optional()
      })
      .map_err(storage_err)
  }

  /// All records for `adapter`, optionally only the pending ones.
  pub fn records(
    &self,
    adapter: &str,
    pending_only: bool,
  ) -> Result<Vec<OfflineRecord>, SyncError> {
    let mut records = Vec::new();
    self
      .db
      .each_row(
        "SELECT adapter, id, data, offline, deleted, updated_at FROM offline_mirror
         WHERE adapter = ? AND (offline = 1 OR ? = 0)
         ORDER BY updated_at, rowid",
        params![adapter, pending_only],
        |row| {
          records.push(decode_row(row)?);
          Ok(())
        },
      )
      .map_err(storage_err)?;
    Ok(records)
  }

  fn upsert(
    &self,
    adapter: &str,
    id: &str,
    data: &Value,
    offline: bool,
    deleted: bool,
  ) -> Result<(), SyncError> {
    let bytes = serde_json::to_vec(data).map_err(SyncError::storage)?;
    self
      .db
      .with_conn("Failed to store offline record", |conn| {
        conn.execute(
          "INSERT OR REPLACE INTO offline_mirror (adapter, id, data, offline, deleted, updated_at)
           VALUES (?, ?, ?, ?, ?, datetime('now'))",
          params![adapter, id, bytes, offline, deleted],
        )
      })
      .map_err(storage_err)?;
    Ok(())
  }

  fn remove(&self, adapter: &str, id: &str) -> Result<(), SyncError> {
    self
      .db
      .with_conn("Failed to remove offline record", |conn| {
        conn.execute(
          "DELETE FROM offline_mirror WHERE adapter = ? AND id = ?",
          params![adapter, id],
        )
      })
      .map_err(storage_err)?;
    Ok(())
  }

  fn remove_all(&self, adapter: &str) -> Result<(), SyncError> {
    self
      .db
      .with_conn("Failed to clear offline records", |conn| {
        conn.execute("DELETE FROM offline_mirror WHERE adapter = ?", params![adapter])
      })
      .map_err(storage_err)?;
    Ok(())
  }

  /// Mirror a network collection, leaving pending records untouched.
  ///
  /// With `prune`, synced records missing from `items` are dropped.
  fn mirror_collection(
    &self,
    descriptor: &ModelDescriptor,
    items: &Value,
    prune: bool,
  ) -> Result<(), SyncError> {
    let pending: HashSet<String> = self
      .records(&descriptor.name, true)?
      .into_iter()
      .map(|r| r.id)
      .collect();

    let mut seen = HashSet::new();
    for item in items.as_array().into_iter().flatten() {
      let Some(id) = item
        .get(&descriptor.id_attribute)
        .filter(|id| !id.is_null())
        .map(id_to_string)
      else {
        continue;
      };
      if !pending.contains(&id) {
        self.upsert(&descriptor.name, &id, item, false, false)?;
      }
      seen.insert(id);
    }

    if prune {
      for record in self.records(&descriptor.name, false)? {
        if !record.offline && !seen.contains(&record.id) {
          self.remove(&descriptor.name, &record.id)?;
        }
      }
    }

    Ok(())
  }

  /// Collection payload with pending local changes laid over the network items.
  fn overlay_pending(
    &self,
    descriptor: &ModelDescriptor,
    items: Value,
  ) -> Result<Value, SyncError> {
    let pending = self.records(&descriptor.name, true)?;
    if pending.is_empty() {
      return Ok(items);
    }

    let mut out = Vec::new();
    let mut seen = HashSet::new();
    for item in items.as_array().into_iter().flatten() {
      let id = item.get(&descriptor.id_attribute).map(id_to_string);
      match id.as_deref().and_then(|id| pending.iter().find(|r| r.id == id)) {
        Some(record) if record.deleted => {}
        Some(record) => out.push(record.data.clone()),
        None => out.push(item.clone()),
      }
      if let Some(id) = id {
        seen.insert(id);
      }
    }

    for record in &pending {
      if !record.deleted && !seen.contains(&record.id) {
        out.push(record.data.clone());
      }
    }

    Ok(Value::Array(out))
  }

  fn local_collection(&self, descriptor: &ModelDescriptor) -> Result<Value, SyncError> {
    let items = self
      .records(&descriptor.name, false)?
      .into_iter()
      .filter(|r| !r.deleted)
      .map(|r| r.data)
      .collect();
    Ok(Value::Array(items))
  }

  async fn write(
    &self,
    method: SyncMethod,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let descriptor = model.descriptor();

    if let Some(upstream) = &self.upstream {
      match upstream.sync(method, model, opts).await {
        Ok(response) => {
          let data = merge(model.to_json(), &response.payload);
          if let Some(id) = data.get(&descriptor.id_attribute).filter(|v| !v.is_null()) {
            self.upsert(&descriptor.name, &id_to_string(id), &data, false, false)?;
          }
          return Ok(response);
        }
        Err(e) if e.is_unreachable() => {
          warn!(
            model = %descriptor.name,
            method = %method,
            error = %e,
            "network unavailable, writing offline"
          );
        }
        Err(e) => return Err(e),
      }
    }

    let mut data = model.to_json();
    let id = match model.id() {
      Some(id) => id_to_string(&id),
      None => {
        let id = self.local_id();
        if let Value::Object(map) = &mut data {
          map.insert(descriptor.id_attribute.clone(), Value::String(id.clone()));
        }
        id
      }
    };

    self.upsert(&descriptor.name, &id, &data, true, false)?;
    debug!(model = %descriptor.name, id = %id, "stored pending offline write");
    Ok(offline_response(data))
  }

  /// Push one pending record to the network and mark it synced.
  async fn replay(
    &self,
    upstream: &dyn SyncAdapter,
    descriptor: &ModelDescriptor,
    record: OfflineRecord,
  ) -> Result<(), SyncError> {
    let opts = SyncOptions::new();

    if record.deleted {
      if !record.is_local_only() {
        let target = Model::new(descriptor.clone()).with_attributes(record.data.clone());
        upstream.sync(SyncMethod::Delete, &target, &opts).await?;
      }
      return self.remove(&descriptor.name, &record.id);
    }

    if record.is_local_only() {
      let mut data = record.data.clone();
      if let Value::Object(map) = &mut data {
        map.remove(&descriptor.id_attribute);
      }
      let target = Model::new(descriptor.clone()).with_attributes(data.clone());
      let response = upstream.sync(SyncMethod::Create, &target, &opts).await?;
      let merged = merge(data, &response.payload);
      let id = merged
        .get(&descriptor.id_attribute)
        .map(id_to_string)
        .ok_or_else(|| {
          SyncError::validation("replayed create returned no id", response.payload.clone())
        })?;

      self.remove(&descriptor.name, &record.id)?;
      return self.upsert(&descriptor.name, &id, &merged, false, false);
    }

    let target = Model::new(descriptor.clone()).with_attributes(record.data.clone());
    let response = upstream.sync(SyncMethod::Update, &target, &opts).await?;
    let merged = merge(record.data, &response.payload);
    self.upsert(&descriptor.name, &record.id, &merged, false, false)
  }
}

fn decode_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<OfflineRecord> {
  let bytes: Vec<u8> = row.get(2)?;
  let data = serde_json::from_slice(&bytes).map_err(|e| {
    rusqlite::Error::FromSqlConversionFailure(2, rusqlite::types::Type::Blob, Box::new(e))
  })?;
  Ok(OfflineRecord {
    adapter: row.get(0)?,
    id: row.get(1)?,
    data,
    offline: row.get(3)?,
    deleted: row.get(4)?,
    updated_at: row.get(5)?,
  })
}

#[async_trait]
impl OfflineHandler for LocalStore {
  async fn create(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    self.write(SyncMethod::Create, model, opts).await
  }

  async fn update(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    self.write(SyncMethod::Update, model, opts).await
  }

  async fn patch(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    self.write(SyncMethod::Patch, model, opts).await
  }

  async fn read(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let descriptor = model.descriptor();

    if model.is_collection() {
      if let Some(upstream) = &self.upstream {
        match upstream.sync(SyncMethod::Read, model, opts).await {
          Ok(response) => {
            self.mirror_collection(descriptor, &response.payload, false)?;
            let payload = self.overlay_pending(descriptor, response.payload)?;
            return Ok(SyncResponse::new(payload).with_pagination(response.pagination));
          }
          Err(e) if e.is_unreachable() => {
            warn!(model = %descriptor.name, error = %e, "network unavailable, reading offline");
          }
          Err(e) => return Err(e),
        }
      }
      return Ok(offline_response(self.local_collection(descriptor)?));
    }

    let local = match model.id() {
      Some(id) => self.record(&descriptor.name, &id_to_string(&id))?,
      None => None,
    };

    // Unconfirmed local edits win over the network copy
    if let Some(record) = local.as_ref().filter(|r| r.offline) {
      if record.deleted {
        return Err(SyncError::validation("model deleted offline", Value::Null));
      }
      return Ok(offline_response(record.data.clone()));
    }

    if let Some(upstream) = &self.upstream {
      match upstream.sync(SyncMethod::Read, model, opts).await {
        Ok(response) => {
          if let Some(id) = response
            .payload
            .get(&descriptor.id_attribute)
            .filter(|v| !v.is_null())
          {
            self.upsert(&descriptor.name, &id_to_string(id), &response.payload, false, false)?;
          }
          return Ok(response);
        }
        Err(e) if e.is_unreachable() && local.is_some() => {
          warn!(model = %descriptor.name, error = %e, "network unavailable, reading offline");
        }
        Err(e) => return Err(e),
      }
    }

    match local {
      Some(record) => Ok(offline_response(record.data)),
      None => Err(SyncError::validation(
        format!("no offline copy of '{}'", descriptor.name),
        Value::Null,
      )),
    }
  }

  async fn delete(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let descriptor = model.descriptor();
    let Some(id) = model.id().map(|id| id_to_string(&id)) else {
      return Err(SyncError::validation("cannot delete a model without id", model.to_json()));
    };

    let local_only = id.starts_with(LOCAL_ID_PREFIX);
    if let (Some(upstream), false) = (&self.upstream, local_only) {
      match upstream.sync(SyncMethod::Delete, model, opts).await {
        Ok(response) => {
          self.remove(&descriptor.name, &id)?;
          return Ok(response);
        }
        Err(e) if e.is_unreachable() => {
          warn!(
            model = %descriptor.name,
            id = %id,
            error = %e,
            "network unavailable, deleting offline"
          );
        }
        Err(e) => return Err(e),
      }
    }

    if local_only {
      self.remove(&descriptor.name, &id)?;
    } else {
      self.upsert(&descriptor.name, &id, &model.to_json(), true, true)?;
    }
    Ok(offline_response(Value::Null))
  }

  async fn fullsync(
    &self,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let Some(upstream) = &self.upstream else {
      return Err(SyncError::NotImplemented("fullsync"));
    };
    let descriptor = model.descriptor();

    let pending = self.records(&descriptor.name, true)?;
    let replayed = pending.len();
    for record in pending {
      let id = record.id.clone();
      if let Err(e) = self.replay(upstream.as_ref(), descriptor, record).await {
        warn!(
          model = %descriptor.name,
          id = %id,
          error = %e,
          "replay failed, record stays pending"
        );
        return Err(e);
      }
    }

    let collection = Collection::new(descriptor.clone());
    let response = upstream.sync(SyncMethod::Read, &collection, opts).await?;
    self.mirror_collection(descriptor, &response.payload, true)?;
    info!(model = %descriptor.name, replayed, "offline mirror synchronized");

    Ok(response)
  }

  async fn read_offline(
    &self,
    model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let descriptor = model.descriptor();
    if model.is_collection() {
      return Ok(offline_response(self.local_collection(descriptor)?));
    }

    let record = match model.id() {
      Some(id) => self.record(&descriptor.name, &id_to_string(&id))?,
      None => None,
    };
    match record.filter(|r| !r.deleted) {
      Some(record) => Ok(offline_response(record.data)),
      None => Err(SyncError::validation(
        format!("no offline copy of '{}'", descriptor.name),
        Value::Null,
      )),
    }
  }

  async fn destroy_offline(
    &self,
    model: &dyn Syncable,
    _opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let descriptor = model.descriptor();
    match model.id() {
      Some(id) if !model.is_collection() => self.remove(&descriptor.name, &id_to_string(&id))?,
      _ => self.remove_all(&descriptor.name)?,
    }
    Ok(offline_response(Value::Null))
  }

  fn set_offline(&self, model: &dyn Syncable, value: bool) -> Result<(), SyncError> {
    let descriptor = model.descriptor();
    let Some(id) = model.id().map(|id| id_to_string(&id)) else {
      return Err(SyncError::validation("cannot flag a model without id", model.to_json()));
    };

    match self.record(&descriptor.name, &id)? {
      Some(record) => self.upsert(&descriptor.name, &id, &record.data, value, record.deleted),
      None => self.upsert(&descriptor.name, &id, &model.to_json(), value, false),
    }
  }

  fn is_offline(&self, model: &dyn Syncable) -> Result<bool, SyncError> {
    let descriptor = model.descriptor();
    match model.id() {
      Some(id) => Ok(
        self
          .record(&descriptor.name, &id_to_string(&id))?
          .map(|r| r.offline)
          .unwrap_or(false),
      ),
      None => Ok(false),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::sync::testing::{descriptor, StubTransport};
  use crate::sync::RestAdapter;
  use serde_json::json;

  struct ReadOnly;

  #[async_trait]
  impl OfflineHandler for ReadOnly {
    async fn read(
      &self,
      _model: &dyn Syncable,
      _opts: &SyncOptions,
    ) -> Result<SyncResponse, SyncError> {
      Ok(SyncResponse::new(json!([])))
    }
  }

  fn store(transport: &Arc<StubTransport>) -> LocalStore {
    LocalStore::in_memory()
      .unwrap()
      .with_upstream(Arc::new(RestAdapter::new(transport.clone())))
  }

  fn model(attrs: Value) -> Model {
    Model::new(descriptor(AdapterKind::Offline)).with_attributes(attrs)
  }

  #[tokio::test]
  async fn test_missing_method_is_reported_by_name() {
    let offline = Offline::new(Arc::new(ReadOnly));
    let m = model(json!({"id": 1}));

    assert!(offline.sync(SyncMethod::Read, &m, &SyncOptions::new()).await.is_ok());
    let err = offline
      .sync(SyncMethod::Delete, &m, &SyncOptions::new())
      .await
      .unwrap_err();
    assert!(matches!(err, SyncError::NotImplemented("delete")));

    let err = offline.fullsync(&m, &SyncOptions::new()).await.unwrap_err();
    assert!(err.to_string().contains("fullsync"));
    assert!(offline.is_offline(&m).is_err());
  }

  #[tokio::test]
  async fn test_offline_flag_roundtrip() {
    let store = LocalStore::in_memory().unwrap();
    let m = model(json!({"id": 7, "name": "n"}));

    assert!(!store.is_offline(&m).unwrap());
    store.set_offline(&m, true).unwrap();
    assert!(store.is_offline(&m).unwrap());
    store.set_offline(&m, false).unwrap();
    assert!(!store.is_offline(&m).unwrap());

    let record = store.record("users", "7").unwrap().unwrap();
    assert_eq!(record.state(), OfflineState::Synced);
    assert_eq!(record.data, json!({"id": 7, "name": "n"}));
  }

  #[tokio::test]
  async fn test_write_falls_back_to_pending_on_transport_error() {
    let transport = Arc::new(StubTransport::new().fail(503));
    let store = store(&transport);
    let m = model(json!({"id": 3, "name": "draft"}));

    let response = store.update(&m, &SyncOptions::new()).await.unwrap();
    assert_eq!(response.source, CacheSource::Offline);
    assert!(store.is_offline(&m).unwrap());
  }

  #[tokio::test]
  async fn test_validation_error_is_not_queued() {
    let transport = Arc::new(StubTransport::new().respond(json!({})));
    let store = store(&transport);
    let m = model(json!({"name": "x"}));

    let err = store.create(&m, &SyncOptions::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Validation { .. }));
    assert!(store.records("users", false).unwrap().is_empty());
  }

  #[tokio::test]
  async fn test_client_rejection_is_not_queued() {
    let transport = Arc::new(StubTransport::new().fail(422).fail(422).fail(404));
    let store = store(&transport);
    let m = model(json!({"id": 4, "name": "bad"}));

    let err = store.update(&m, &SyncOptions::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport { status: Some(422), .. }));
    assert!(store.record("users", "4").unwrap().is_none());

    store.upsert("users", "4", &json!({"id": 4}), false, false).unwrap();
    let err = store.delete(&m, &SyncOptions::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport { status: Some(422), .. }));
    let record = store.record("users", "4").unwrap().unwrap();
    assert_eq!(record.state(), OfflineState::Synced);
    assert!(!record.deleted);

    let collection = Collection::new(descriptor(AdapterKind::Offline));
    let err = store.read(&collection, &SyncOptions::new()).await.unwrap_err();
    assert!(matches!(err, SyncError::Transport { status: Some(404), .. }));
    assert!(store.records("users", true).unwrap().is_empty());
  }

  #[test]
  fn test_corrupt_row_is_storage_error() {
    let store = LocalStore::in_memory().unwrap();
    store
      .db
      .with_conn("insert corrupt row", |conn| {
        conn.execute(
          "INSERT INTO offline_mirror (adapter, id, data) VALUES ('users', '1', x'7b6e6f')",
          [],
        )
      })
      .unwrap();

    assert!(matches!(store.record("users", "1"), Err(SyncError::Storage(_))));
    assert!(matches!(store.records("users", false), Err(SyncError::Storage(_))));
  }

  #[tokio::test]
  async fn test_fullsync_replays_pending_then_mirrors() {
    let transport = Arc::new(
      StubTransport::new()
        .fail(503) // offline create
        .respond(json!({"id": 10, "name": "new"})) // replayed create
        .respond(json!([{"id": 10, "name": "new"}, {"id": 11, "name": "other"}])),
    );
    let store = store(&transport);
    let m = model(json!({"name": "new"}));

    let created = store.create(&m, &SyncOptions::new()).await.unwrap();
    let local_id = created.payload["id"].as_str().unwrap().to_string();
    assert!(local_id.starts_with(LOCAL_ID_PREFIX));
    assert_eq!(store.records("users", true).unwrap().len(), 1);

    let synced = store.fullsync(&m, &SyncOptions::new()).await.unwrap();
    assert_eq!(synced.payload.as_array().unwrap().len(), 2);

    // Replayed create is posted without the local id
    let requests = transport.requests.lock().unwrap().clone();
    assert_eq!(requests[1].body, Some(json!({"name": "new"})));

    assert!(store.records("users", true).unwrap().is_empty());
    assert!(store.record("users", &local_id).unwrap().is_none());
    assert_eq!(store.record("users", "10").unwrap().unwrap().state(), OfflineState::Synced);
    assert!(store.record("users", "11").unwrap().is_some());
  }

  #[tokio::test]
  async fn test_failed_replay_stays_pending() {
    let transport = Arc::new(StubTransport::new().fail(503).fail(503));
    let store = store(&transport);
    let m = model(json!({"id": 4, "name": "edit"}));

    store.update(&m, &SyncOptions::new()).await.unwrap();
    assert!(store.fullsync(&m, &SyncOptions::new()).await.is_err());

    let record = store.record("users", "4").unwrap().unwrap();
    assert_eq!(record.state(), OfflineState::PendingOffline);
  }

  #[tokio::test]
  async fn test_collection_read_overlays_pending_and_falls_back() {
    let transport = Arc::new(
      StubTransport::new()
        .fail(503) // offline update of id 1
        .respond(json!([{"id": 1, "v": "server"}, {"id": 2, "v": "server"}]))
        .fail(503),
    );
    let store = store(&transport);
    store
      .update(&model(json!({"id": 1, "v": "local"})), &SyncOptions::new())
      .await
      .unwrap();

    let collection = Collection::new(descriptor(AdapterKind::Offline));
    let online = store.read(&collection, &SyncOptions::new()).await.unwrap();
    assert_eq!(
      online.payload,
      json!([{"id": 1, "v": "local"}, {"id": 2, "v": "server"}])
    );

    let offline = store.read(&collection, &SyncOptions::new()).await.unwrap();
    assert_eq!(offline.source, CacheSource::Offline);
    assert_eq!(offline.payload.as_array().unwrap().len(), 2);
  }

  #[tokio::test]
  async fn test_delete_offline_creates_tombstone() {
    let transport = Arc::new(
      StubTransport::new()
        .fail(503)
        .respond(Value::Null)
        .respond(json!([])),
    );
    let store = store(&transport);
    let m = model(json!({"id": 9}));

    store.delete(&m, &SyncOptions::new()).await.unwrap();
    let record = store.record("users", "9").unwrap().unwrap();
    assert!(record.deleted);
    assert!(store.read_offline(&m, &SyncOptions::new()).await.is_err());

    store.fullsync(&m, &SyncOptions::new()).await.unwrap();
    assert!(store.record("users", "9").unwrap().is_none());
  }

  #[tokio::test]
  async fn test_destroy_offline_clears_collection() {
    let store = LocalStore::in_memory().unwrap();
    store.create(&model(json!({"id": 1})), &SyncOptions::new()).await.unwrap();
    store.create(&model(json!({"id": 2})), &SyncOptions::new()).await.unwrap();

    let collection = Collection::new(descriptor(AdapterKind::Offline));
    let local = store.read_offline(&collection, &SyncOptions::new()).await.unwrap();
    assert_eq!(local.payload.as_array().unwrap().len(), 2);

    store.destroy_offline(&collection, &SyncOptions::new()).await.unwrap();
    assert!(store.records("users", false).unwrap().is_empty());
  }
}

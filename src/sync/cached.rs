//! Adapter decorator serving reads through the cache manager.

use async_trait::async_trait;
use std::sync::Arc;
use tracing::{debug, warn};

use super::model::{Collection, Syncable};
use super::request::{request_url, RequestRules};
use super::{AdapterKind, HttpVerb, SyncAdapter, SyncMethod, SyncOptions, SyncResponse};
use crate::cache::CacheManager;
use crate::error::SyncError;

/// Wraps an adapter with transparent read caching.
///
/// Reads with a TTL (per call or from the descriptor) are answered from a live
/// cache entry when there is one. Successful writes drop the cached entries for
/// the model and its collection.
#[derive(Clone)]
pub struct CachedAdapter {
  inner: Arc<dyn SyncAdapter>,
  cache: CacheManager,
}

impl CachedAdapter {
  pub fn new(inner: Arc<dyn SyncAdapter>, cache: CacheManager) -> Self {
    Self { inner, cache }
  }

  /// Collections and single models share a URL when the model has no id.
  fn cache_key(model: &dyn Syncable, url: &str) -> String {
    let shape = if model.is_collection() { "collection" } else { "model" };
    format!("sync:{}:{}:{}", model.descriptor().name, shape, url)
  }

  fn rules(&self) -> RequestRules {
    RequestRules {
      update_verb: HttpVerb::Put,
      merge_default_query: self.inner.kind() == AdapterKind::Api,
    }
  }

  /// Drop the unqueried reads of the model and its collection.
  fn invalidate(&self, model: &dyn Syncable) {
    let plain = SyncOptions::new();
    let collection = Collection::new(model.descriptor().clone());
    let collection_url = request_url(SyncMethod::Read, &collection, &plain, self.rules());
    let model_url = request_url(SyncMethod::Read, model, &plain, self.rules());

    let keys = [
      (Self::cache_key(&collection, &collection_url), collection_url),
      (Self::cache_key(model, &model_url), model_url),
    ];
    for (key, url) in keys {
      if let Err(e) = self.cache.remove(&key) {
        warn!(url = %url, error = %e, "failed to invalidate cached read");
      }
    }
  }
}

#[async_trait]
impl SyncAdapter for CachedAdapter {
  async fn sync(
    &self,
    method: SyncMethod,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> Result<SyncResponse, SyncError> {
    let ttl = opts.ttl.or(model.descriptor().http_defaults.ttl);

    match (method, ttl) {
      (SyncMethod::Read, Some(ttl)) => {
        // Key on the query-bearing URL so different pages cache separately
        let key = Self::cache_key(model, &request_url(method, model, opts, self.rules()));

        let result = self
          .cache
          .fetch(&key, Some(ttl), || self.inner.sync(method, model, opts))
          .await?;
        debug!(key = %key, source = ?result.source, "cached read");
        Ok(result.data.with_source(result.source))
      }
      _ => {
        let response = self.inner.sync(method, model, opts).await?;
        if method.is_write() {
          self.invalidate(model);
        }
        Ok(response)
      }
    }
  }

  fn kind(&self) -> AdapterKind {
    self.inner.kind()
  }
}

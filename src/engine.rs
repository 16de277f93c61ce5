//! Engine assembly: one explicit registry of adapters, cache and offline layer.

use color_eyre::Result;
use futures::future::join_all;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::cache::CacheManager;
use crate::config::{Config, OfflineHandlerKind};
use crate::error::{ConfigError, SyncError};
use crate::event::{EventBus, SyncEvent};
use crate::sync::{
  AdapterKind, ApiAdapter, CachedAdapter, Collection, HateoasAdapter, HttpTransport, LocalStore,
  Model, ModelDescriptor, Offline, OfflineAdapter, OfflineHandler, RestAdapter, SyncAdapter,
  SyncMethod, SyncOptions, SyncResponse, Syncable, Transport,
};

/// Routes sync intents to the adapter named by each model's descriptor.
pub struct SyncEngine {
  config: Config,
  transport: Arc<dyn Transport>,
  adapters: HashMap<AdapterKind, Arc<dyn SyncAdapter>>,
  cache: Option<CacheManager>,
  offline: Option<Offline>,
  events: EventBus,
}

impl SyncEngine {
  /// Build the engine with a reqwest transport authenticated from the environment.
  pub fn from_config(config: Config) -> Result<Self> {
    let transport = HttpTransport::new(&config.http, Config::get_api_token())?;
    Self::with_transport(config, Arc::new(transport))
  }

  /// Build the engine over any transport.
  pub fn with_transport(config: Config, transport: Arc<dyn Transport>) -> Result<Self> {
    let cache = if config.cache.enabled {
      Some(CacheManager::from_config(&config.cache)?)
    } else {
      None
    };

    let mut engine = Self {
      config,
      transport: Arc::clone(&transport),
      adapters: HashMap::new(),
      cache,
      offline: None,
      events: EventBus::new(),
    };

    engine.register_adapter(Arc::new(RestAdapter::new(Arc::clone(&transport))));
    engine.register_adapter(Arc::new(ApiAdapter::new(Arc::clone(&transport))));
    engine.register_adapter(Arc::new(HateoasAdapter::new(transport)));

    if let Some(kind) = engine.config.offline.handler {
      let handler: Arc<dyn OfflineHandler> = match kind {
        OfflineHandlerKind::Local => {
          let path = engine.config.offline.path()?;
          let upstream = Arc::new(RestAdapter::new(Arc::clone(&engine.transport)));
          Arc::new(LocalStore::open(&path)?.with_upstream(upstream))
        }
      };
      engine.register_offline_handler(handler);
    }

    engine.validate()?;
    Ok(engine)
  }

  /// Install an adapter under its kind, replacing any previous one.
  ///
  /// Network adapters are wrapped with the read cache when caching is enabled.
  pub fn register_adapter(&mut self, adapter: Arc<dyn SyncAdapter>) {
    let kind = adapter.kind();
    let adapter: Arc<dyn SyncAdapter> = match (&self.cache, kind) {
      (Some(cache), kind) if kind != AdapterKind::Offline => {
        Arc::new(CachedAdapter::new(adapter, cache.clone()))
      }
      _ => adapter,
    };
    debug!(adapter = %kind, "registered adapter");
    self.adapters.insert(kind, adapter);
  }

  /// Install the handler behind offline-kind models.
  pub fn register_offline_handler(&mut self, handler: Arc<dyn OfflineHandler>) {
    let offline = Offline::new(handler);
    self.offline = Some(offline.clone());
    self.register_adapter(Arc::new(OfflineAdapter::new(offline)));
  }

  fn validate(&self) -> std::result::Result<(), ConfigError> {
    for (name, adapter) in &self.config.adapters {
      if !self.adapters.contains_key(&adapter.kind) {
        return Err(match adapter.kind {
          AdapterKind::Offline => ConfigError::MissingOfflineHandler(name.clone()),
          kind => ConfigError::UnknownAdapter(kind.to_string()),
        });
      }
    }
    Ok(())
  }

  pub fn config(&self) -> &Config {
    &self.config
  }

  pub fn cache(&self) -> Option<&CacheManager> {
    self.cache.as_ref()
  }

  pub fn offline(&self) -> Option<&Offline> {
    self.offline.as_ref()
  }

  pub fn subscribe(&self) -> mpsc::UnboundedReceiver<SyncEvent> {
    self.events.subscribe()
  }

  pub fn descriptor(&self, name: &str) -> std::result::Result<ModelDescriptor, ConfigError> {
    self.config.descriptor(name)
  }

  /// Empty model of the configured type `name`.
  pub fn model(&self, name: &str) -> std::result::Result<Model, ConfigError> {
    Ok(Model::new(self.descriptor(name)?))
  }

  /// Empty collection of the configured type `name`.
  pub fn collection(&self, name: &str) -> std::result::Result<Collection, ConfigError> {
    Ok(Collection::new(self.descriptor(name)?))
  }

  fn adapter(
    &self,
    descriptor: &ModelDescriptor,
  ) -> std::result::Result<&Arc<dyn SyncAdapter>, SyncError> {
    self.adapters.get(&descriptor.adapter).ok_or_else(|| {
      let err = match descriptor.adapter {
        AdapterKind::Offline => ConfigError::MissingOfflineHandler(descriptor.name.clone()),
        kind => ConfigError::UnknownAdapter(kind.to_string()),
      };
      SyncError::Config(err)
    })
  }

  /// Run one sync and report the outcome to subscribers.
  pub async fn sync(
    &self,
    method: SyncMethod,
    model: &dyn Syncable,
    opts: &SyncOptions,
  ) -> std::result::Result<SyncResponse, SyncError> {
    let descriptor = model.descriptor();
    let result = match self.adapter(descriptor) {
      Ok(adapter) => adapter.sync(method, model, opts).await,
      Err(e) => Err(e),
    };
    self.report(&descriptor.name, method, &result);
    result
  }

  fn report(
    &self,
    model: &str,
    method: SyncMethod,
    result: &std::result::Result<SyncResponse, SyncError>,
  ) {
    let event = match result {
      Ok(response) => {
        info!(model, method = %method, source = ?response.source, "sync completed");
        SyncEvent::Fetched {
          model: model.to_string(),
          method,
          source: response.source,
        }
      }
      Err(e) => {
        warn!(model, method = %method, error = %e, "sync failed");
        SyncEvent::Failed {
          model: model.to_string(),
          method,
          error: e.to_string(),
        }
      }
    };
    self.events.emit(event);
  }

  /// Reconcile the offline mirror of model type `name` with the network.
  pub async fn fullsync(&self, name: &str) -> std::result::Result<SyncResponse, SyncError> {
    let collection = self.collection(name)?;
    let offline = self
      .offline
      .as_ref()
      .ok_or_else(|| SyncError::Config(ConfigError::MissingOfflineHandler(name.to_string())))?;

    let result = offline.fullsync(&collection, &SyncOptions::new()).await;
    self.report(name, SyncMethod::Read, &result);
    result
  }

  /// Fullsync every offline-backed model type concurrently.
  pub async fn fullsync_all(&self) -> Vec<(String, std::result::Result<SyncResponse, SyncError>)> {
    let names: Vec<String> = self
      .config
      .adapters
      .iter()
      .filter(|(_, adapter)| adapter.kind == AdapterKind::Offline)
      .map(|(name, _)| name.clone())
      .collect();

    let results = join_all(names.iter().map(|name| self.fullsync(name))).await;
    names.into_iter().zip(results).collect()
  }
}

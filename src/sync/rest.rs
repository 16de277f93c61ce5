use async_trait::async_trait;
use std::sync::Arc;

use super::client::Transport;
use super::model::Syncable;
use super::request::{build_request, normalize_collection, normalize_single, RequestRules};
use super::{AdapterKind, HttpVerb, SyncAdapter, SyncMethod, SyncOptions, SyncResponse};
use crate::error::SyncError;

const RULES: RequestRules = RequestRules {
  update_verb: HttpVerb::Put,
  merge_default_query: false,
};

/// Plain REST adapter: PUT for updates, PATCH for partial updates.
#[derive(Clone)]
pub struct RestAdapter {
  transport: Arc<dyn Transport>,
}

impl RestAdapter {
  pub fn new(transport: Arc<dyn Transport>) -> Self {
    Self { transport }
  }
}

#[async_trait]
impl SyncAdapter for RestAdapter {
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
      _ => normalize_single(body, &descriptor.id_attribute)?,
    };

    Ok(SyncResponse::new(payload))
  }

  fn kind(&self) -> AdapterKind {
    AdapterKind::Rest
  }
}

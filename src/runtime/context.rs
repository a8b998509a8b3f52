use std::sync::Arc;

use crate::config::HarnessConfig;
use crate::runtime::blob::BlobStoreAdapter;
use crate::runtime::storage::BlobStore;

/// 运行时上下文 (Runtime Context)
/// Built once at process start and passed by reference into the worker,
/// the decider and every handler. Cheap to clone (just Arcs).
#[derive(Clone)]
pub struct Context {
    pub config: Arc<HarnessConfig>,
    pub blobs: BlobStoreAdapter,
}

impl Context {
    pub fn new(config: HarnessConfig, store: Arc<dyn BlobStore>) -> Self {
        let blobs = BlobStoreAdapter::new(store, config.retry.clone(), config.blob.clone());
        Self {
            config: Arc::new(config),
            blobs,
        }
    }

    pub fn shard_extension(&self) -> &str {
        &self.config.blob.shard_extension
    }
}

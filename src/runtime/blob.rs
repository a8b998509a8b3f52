use std::sync::Arc;

use tracing::{debug, warn};

use crate::config::BlobConfig;
use crate::error::Result;
use crate::retry::{RetryPolicy, retry};
use crate::runtime::storage::BlobStore;

/// 对象存储适配器
///
/// Wraps a raw `BlobStore` with the shared retry policy, transparent
/// multipart upload for large bodies, and paged listing.
#[derive(Clone)]
pub struct BlobStoreAdapter {
    store: Arc<dyn BlobStore>,
    retry: RetryPolicy,
    config: BlobConfig,
}

impl BlobStoreAdapter {
    pub fn new(store: Arc<dyn BlobStore>, retry: RetryPolicy, config: BlobConfig) -> Self {
        Self { store, retry, config }
    }

    pub fn store(&self) -> &Arc<dyn BlobStore> {
        &self.store
    }

    pub fn config(&self) -> &BlobConfig {
        &self.config
    }

    pub async fn get(&self, key: &str) -> Result<Vec<u8>> {
        retry(&self.retry, "get_object", || self.store.get_object(key)).await
    }

    pub async fn put(&self, key: &str, body: Vec<u8>) -> Result<()> {
        let mut writer = self.writer(key);
        writer.write(&body).await?;
        writer.finish().await.map(|_| ())
    }

    /// Streaming upload to `key`. Once the buffered body passes the multipart
    /// threshold it goes out in `part_size_bytes` parts as they fill.
    pub fn writer(&self, key: &str) -> BlobWriter<'_> {
        BlobWriter {
            adapter: self,
            key: key.to_string(),
            buffer: Vec::new(),
            upload_id: None,
            parts: 0,
            written: 0,
        }
    }

    async fn abort(&self, upload_id: &str) {
        if let Err(e) = self.store.abort_multipart_upload(upload_id).await {
            warn!(upload_id, error = %e, "Failed to abort multipart upload");
        }
    }

    pub fn list(&self, prefix: &str) -> ListPager<'_> {
        ListPager {
            adapter: self,
            prefix: prefix.to_string(),
            continuation: None,
            done: false,
        }
    }
}

/// 流式写入器
///
/// Memory stays bounded by the multipart threshold plus one part. An upload
/// that fails part way is aborted; nothing is visible under the key until
/// `finish` succeeds.
pub struct BlobWriter<'a> {
    adapter: &'a BlobStoreAdapter,
    key: String,
    buffer: Vec<u8>,
    upload_id: Option<String>,
    parts: u32,
    written: u64,
}

impl BlobWriter<'_> {
    /// Bytes accepted so far.
    pub fn written(&self) -> u64 {
        self.written
    }

    pub async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        self.buffer.extend_from_slice(bytes);
        self.written += bytes.len() as u64;
        if self.upload_id.is_none() && self.buffer.len() <= self.adapter.config.multipart_threshold_bytes {
            return Ok(());
        }
        let part_size = self.adapter.config.part_size_bytes.max(1);
        while self.buffer.len() >= part_size {
            let part: Vec<u8> = self.buffer.drain(..part_size).collect();
            self.send_part(part).await?;
        }
        Ok(())
    }

    async fn send_part(&mut self, part: Vec<u8>) -> Result<()> {
        let adapter = self.adapter;
        let upload_id = match &self.upload_id {
            Some(id) => id.clone(),
            None => {
                let key = self.key.as_str();
                let id = retry(&adapter.retry, "create_multipart_upload", || {
                    adapter.store.create_multipart_upload(key)
                })
                .await?;
                self.upload_id = Some(id.clone());
                id
            }
        };
        self.parts += 1;
        let part_number = self.parts;
        let sent = retry(&adapter.retry, "upload_part", || {
            adapter.store.upload_part(&upload_id, part_number, part.clone())
        })
        .await;
        if let Err(e) = sent {
            adapter.abort(&upload_id).await;
            self.upload_id = None;
            return Err(e);
        }
        Ok(())
    }

    /// Makes the body visible under the key. Returns the total size.
    pub async fn finish(mut self) -> Result<u64> {
        let adapter = self.adapter;
        let Some(upload_id) = self.upload_id.clone() else {
            let body = std::mem::take(&mut self.buffer);
            let key = self.key.as_str();
            retry(&adapter.retry, "put_object", || adapter.store.put_object(key, body.clone())).await?;
            return Ok(self.written);
        };
        if !self.buffer.is_empty() {
            let rest = std::mem::take(&mut self.buffer);
            self.send_part(rest).await?;
        }

        let key = self.key.as_str();
        let parts = self.parts;
        let completed = retry(&adapter.retry, "complete_multipart_upload", || {
            adapter.store.complete_multipart_upload(key, &upload_id, parts)
        })
        .await;
        if let Err(e) = completed {
            adapter.abort(&upload_id).await;
            return Err(e);
        }
        debug!(key, parts, bytes = self.written, "Multipart upload complete");
        Ok(self.written)
    }
}

/// Lazy, restartable walk over the keys under a prefix.
pub struct ListPager<'a> {
    adapter: &'a BlobStoreAdapter,
    prefix: String,
    continuation: Option<String>,
    done: bool,
}

impl ListPager<'_> {
    /// Next page of keys, or `None` once the listing is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        if self.done {
            return Ok(None);
        }
        let page_size = self.adapter.config.list_page_size;
        let page = retry(&self.adapter.retry, "list_objects", || {
            self.adapter
                .store
                .list_objects(&self.prefix, self.continuation.clone(), page_size)
        })
        .await?;

        match page.next_continuation {
            Some(next) => self.continuation = Some(next),
            None => self.done = true,
        }
        Ok(Some(page.keys))
    }

    /// Starts over from the first key.
    pub fn restart(&mut self) {
        self.continuation = None;
        self.done = false;
    }

    pub async fn collect_all(mut self) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        while let Some(page) = self.next_page().await? {
            keys.extend(page);
        }
        Ok(keys)
    }
}

use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::TaskHandler;
use crate::error::{HarnessError, Result};
use crate::runtime::context::Context;
use crate::runtime::heartbeat::HeartbeatUpdater;
use crate::runtime::task::{ActivityInput, ActivityTask, ChildShard, DivideOutput};

/// Splits a node's shard into contiguous child shards.
#[derive(Debug, Default)]
pub struct DivideHandler;

/// Newline-delimited entries of a shard. A trailing newline does not produce
/// an empty final entry.
pub fn split_entries(body: &[u8]) -> Vec<&[u8]> {
    if body.is_empty() {
        return Vec::new();
    }
    let body = body.strip_suffix(b"\n").unwrap_or(body);
    body.split(|b| *b == b'\n').collect()
}

/// Joins entries back into a shard body, one entry per line.
pub fn join_entries<'a>(entries: impl IntoIterator<Item = &'a [u8]>) -> Vec<u8> {
    let mut out = Vec::new();
    for entry in entries {
        out.extend_from_slice(entry);
        out.push(b'\n');
    }
    out
}

/// Contiguous near-equal chunks; the first `len % fan_out` chunks take one
/// extra entry. Empty chunks are dropped.
pub fn partition<T>(entries: &[T], fan_out: usize) -> Vec<&[T]> {
    let fan_out = fan_out.max(1);
    let base = entries.len() / fan_out;
    let extra = entries.len() % fan_out;
    let mut chunks = Vec::with_capacity(fan_out);
    let mut start = 0;
    for i in 0..fan_out {
        let len = base + usize::from(i < extra);
        if len == 0 {
            continue;
        }
        chunks.push(&entries[start..start + len]);
        start += len;
    }
    chunks
}

#[async_trait]
impl TaskHandler for DivideHandler {
    fn name(&self) -> &str {
        "divide"
    }

    fn validate(&self, input: &ActivityInput) -> Result<()> {
        if input.child_inputs.len() != 1 {
            return Err(HarnessError::MalformedInput(format!(
                "divide expects exactly one shard key, got {}",
                input.child_inputs.len()
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &Context, task: &ActivityTask, updater: &HeartbeatUpdater) -> Result<Value> {
        let input = &task.input;
        self.validate(input)?;
        let shard_key = &input.child_inputs[0];
        let extension = ctx.shard_extension();

        let body = ctx.blobs.get(shard_key).await?;
        let entries = split_entries(&body);
        let chunks = partition(&entries, ctx.config.policy.fan_out);
        debug!(shard_key, entries = entries.len(), chunks = chunks.len(), "Dividing shard");

        let mut children = Vec::with_capacity(chunks.len());
        for (index, chunk) in chunks.into_iter().enumerate() {
            let child_path = input.path_input.child(index);
            let key = input.main_input.part_key(&child_path, extension);
            let child_body = join_entries(chunk.iter().copied());
            let bytes = child_body.len() as u64;
            ctx.blobs.put(&key, child_body).await?;
            updater.beat(Some(json!({ "written": index + 1 }))).await?;
            children.push(ChildShard {
                zip_name: key,
                entries: chunk.len() as u64,
                bytes,
            });
        }

        info!(
            path = %input.path_input,
            children = children.len(),
            "Divide complete"
        );
        let output = DivideOutput {
            child_count: children.len(),
            children,
        };
        Ok(serde_json::to_value(output)?)
    }
}

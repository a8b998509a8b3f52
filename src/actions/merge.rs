use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::{debug, info};

use super::TaskHandler;
use super::divide::split_entries;
use crate::error::{HarnessError, Result};
use crate::runtime::context::Context;
use crate::runtime::blob::BlobWriter;
use crate::runtime::heartbeat::HeartbeatUpdater;
use crate::runtime::task::{ActivityInput, ActivityTask, MergeOutput};

struct Cursor<I: Iterator> {
    head: I::Item,
    rest: I,
}

/// k 路归并
///
/// Combines pre-sorted sources into one sorted stream. Equal heads are taken
/// from the lowest-indexed source first. Exhausted sources are removed
/// in place, keeping the remaining ones in registration order.
pub struct KWayMerge<I: Iterator> {
    cursors: Vec<Cursor<I>>,
}

impl<I> KWayMerge<I>
where
    I: Iterator,
    I::Item: Ord,
{
    pub fn new(sources: impl IntoIterator<Item = I>) -> Self {
        let cursors = sources
            .into_iter()
            .filter_map(|mut rest| rest.next().map(|head| Cursor { head, rest }))
            .collect();
        Self { cursors }
    }

    /// Sources that still have unconsumed entries.
    pub fn active_sources(&self) -> usize {
        self.cursors.len()
    }

    fn min_index(&self) -> usize {
        let mut min = 0;
        for (i, cursor) in self.cursors.iter().enumerate().skip(1) {
            if cursor.head < self.cursors[min].head {
                min = i;
            }
        }
        min
    }
}

impl<I> Iterator for KWayMerge<I>
where
    I: Iterator,
    I::Item: Ord,
{
    type Item = I::Item;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursors.is_empty() {
            return None;
        }
        // With one source left its tail goes out without comparisons.
        let min = if self.cursors.len() == 1 { 0 } else { self.min_index() };
        match self.cursors[min].rest.next() {
            Some(next) => Some(std::mem::replace(&mut self.cursors[min].head, next)),
            None => Some(self.cursors.remove(min).head),
        }
    }
}

/// Sorts a leaf shard, or merges a node's sorted children. The output is
/// streamed to the blob store as it is produced.
#[derive(Debug, Default)]
pub struct MergeHandler;

/// Writes each entry followed by a newline. Returns the entry count.
pub async fn write_entries<'a>(writer: &mut BlobWriter<'_>, entries: impl Iterator<Item = &'a [u8]>) -> Result<u64> {
    let mut count = 0u64;
    for entry in entries {
        writer.write(entry).await?;
        writer.write(b"\n").await?;
        count += 1;
    }
    Ok(count)
}

#[async_trait]
impl TaskHandler for MergeHandler {
    fn name(&self) -> &str {
        "merge"
    }

    fn validate(&self, input: &ActivityInput) -> Result<()> {
        if input.leaf && input.child_inputs.len() != 1 {
            return Err(HarnessError::MalformedInput(format!(
                "leaf merge expects exactly one shard key, got {}",
                input.child_inputs.len()
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &Context, task: &ActivityTask, updater: &HeartbeatUpdater) -> Result<Value> {
        let input = &task.input;
        self.validate(input)?;
        let output_key = input.main_input.sorted_key(&input.path_input, ctx.shard_extension());

        let mut bodies = Vec::with_capacity(input.child_inputs.len());
        for key in &input.child_inputs {
            bodies.push(ctx.blobs.get(key).await?);
        }
        updater.beat(Some(json!({ "sources_read": bodies.len() }))).await?;

        let mut writer = ctx.blobs.writer(&output_key);
        let entries = if input.leaf {
            let mut sorted = split_entries(&bodies[0]);
            sorted.sort();
            write_entries(&mut writer, sorted.into_iter()).await?
        } else if bodies.len() == 1 {
            writer.write(&bodies[0]).await?;
            split_entries(&bodies[0]).len() as u64
        } else {
            let sources: Vec<_> = bodies.iter().map(|b| split_entries(b).into_iter()).collect();
            write_entries(&mut writer, KWayMerge::new(sources)).await?
        };
        debug!(output_key, sources = input.child_inputs.len(), leaf = input.leaf, "Merged");

        let bytes = writer.finish().await?;
        info!(path = %input.path_input, entries, bytes, "Merge complete");

        let output = MergeOutput {
            zip_name: output_key,
            entries,
            bytes,
        };
        Ok(serde_json::to_value(output)?)
    }
}

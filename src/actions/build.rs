use async_trait::async_trait;
use serde_json::{Value, json};
use tracing::info;

use super::TaskHandler;
use super::divide::split_entries;
use super::merge::write_entries;
use crate::error::{HarnessError, Result};
use crate::runtime::context::Context;
use crate::runtime::heartbeat::HeartbeatUpdater;
use crate::runtime::task::{ActivityInput, ActivityTask, BuildOutput};

/// 字典构建
///
/// Turns the root's sorted output into the final dictionary: adjacent
/// duplicates collapse to one entry. Unsorted input is rejected.
#[derive(Debug, Default)]
pub struct BuildHandler;

#[async_trait]
impl TaskHandler for BuildHandler {
    fn name(&self) -> &str {
        "build"
    }

    fn validate(&self, input: &ActivityInput) -> Result<()> {
        if input.child_inputs.len() != 1 {
            return Err(HarnessError::MalformedInput(format!(
                "build expects exactly one sorted input, got {}",
                input.child_inputs.len()
            )));
        }
        Ok(())
    }

    async fn execute(&self, ctx: &Context, task: &ActivityTask, updater: &HeartbeatUpdater) -> Result<Value> {
        let input = &task.input;
        self.validate(input)?;
        let source = &input.child_inputs[0];
        let body = ctx.blobs.get(source).await?;
        let entries = split_entries(&body);
        if let Some(at) = entries.windows(2).position(|w| w[0] > w[1]) {
            return Err(HarnessError::MalformedInput(format!(
                "{} is not sorted at entry {}",
                source,
                at + 1
            )));
        }
        updater.beat(Some(json!({ "entries_read": entries.len() }))).await?;

        let output_key = input.main_input.build_key(ctx.shard_extension());
        let mut writer = ctx.blobs.writer(&output_key);
        let mut unique = entries.clone();
        unique.dedup();
        let written = write_entries(&mut writer, unique.into_iter()).await?;
        let bytes = writer.finish().await?;
        let duplicates = entries.len() as u64 - written;
        info!(output_key, entries = written, duplicates, "Build complete");

        let output = BuildOutput {
            zip_name: output_key,
            entries: written,
            duplicates,
            bytes,
        };
        Ok(serde_json::to_value(output)?)
    }
}

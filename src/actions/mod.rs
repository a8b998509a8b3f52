use async_trait::async_trait;
use serde_json::Value;
use std::fmt::Debug;

use crate::error::Result;
use crate::runtime::context::Context;
use crate::runtime::heartbeat::HeartbeatUpdater;
use crate::runtime::task::{ActivityInput, ActivityTask};

pub mod build;
pub mod divide;
pub mod merge;

/// 插件接口：所有活动处理器必须实现此 Trait
///
/// `execute` receives the process context, the claimed task (main input,
/// `path_input` and child inputs live in `task.input`) and the heartbeat
/// updater for progress reports.
#[async_trait]
pub trait TaskHandler: Send + Sync + Debug {
    fn name(&self) -> &str;
    fn validate(&self, input: &ActivityInput) -> Result<()>;
    async fn execute(&self, ctx: &Context, task: &ActivityTask, updater: &HeartbeatUpdater) -> Result<Value>;
}

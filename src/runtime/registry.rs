use std::collections::HashMap;
use std::sync::Arc;

use crate::actions::TaskHandler;
use crate::actions::build::BuildHandler;
use crate::actions::divide::DivideHandler;
use crate::actions::merge::MergeHandler;
use crate::config::HarnessConfig;
use crate::error::{HarnessError, Result};
use crate::runtime::task::{ActivityType, TaskKind};

/// Process-local map from activity type to handler.
#[derive(Default)]
pub struct TaskRegistry {
    handlers: HashMap<ActivityType, Arc<dyn TaskHandler>>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Binds every `TaskKind` to its handler under the configured activity type.
    pub fn standard(config: &HarnessConfig) -> Result<Self> {
        let mut registry = Self::new();
        for kind in [TaskKind::Divide, TaskKind::Merge, TaskKind::Build] {
            let handler: Arc<dyn TaskHandler> = match kind {
                TaskKind::Divide => Arc::new(DivideHandler),
                TaskKind::Merge => Arc::new(MergeHandler),
                TaskKind::Build => Arc::new(BuildHandler),
            };
            registry.register(config.activity_type(kind).clone(), handler)?;
        }
        Ok(registry)
    }

    /// Registering the same handler twice is a no-op; binding a different
    /// handler to a taken (name, version) is an error.
    pub fn register(&mut self, activity_type: ActivityType, handler: Arc<dyn TaskHandler>) -> Result<()> {
        if let Some(existing) = self.handlers.get(&activity_type) {
            if Arc::ptr_eq(existing, &handler) {
                return Ok(());
            }
            return Err(HarnessError::DuplicateTask {
                name: activity_type.name,
                version: activity_type.version,
            });
        }
        self.handlers.insert(activity_type, handler);
        Ok(())
    }

    pub fn resolve(&self, activity_type: &ActivityType) -> Result<Arc<dyn TaskHandler>> {
        self.handlers
            .get(activity_type)
            .cloned()
            .ok_or_else(|| HarnessError::UnknownTask {
                name: activity_type.name.clone(),
                version: activity_type.version.clone(),
            })
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

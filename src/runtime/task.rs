use std::fmt;

use serde::{Deserialize, Serialize};

/// Activity type: the (name, version) pair a handler is registered under.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ActivityType {
    pub name: String,
    pub version: String,
}

impl ActivityType {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for ActivityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.name, self.version)
    }
}

/// The closed set of activities the decider knows how to schedule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TaskKind {
    Divide,
    Merge,
    /// Final pass over the root's sorted output.
    Build,
}

impl TaskKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskKind::Divide => "divide",
            TaskKind::Merge => "merge",
            TaskKind::Build => "build",
        }
    }
}

/// 树坐标：从根节点出发的子节点下标序列
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PathInput(pub Vec<usize>);

impl PathInput {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn child(&self, index: usize) -> Self {
        let mut path = self.0.clone();
        path.push(index);
        Self(path)
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            return None;
        }
        Some(Self(self.0[..self.0.len() - 1].to_vec()))
    }

    pub fn depth(&self) -> usize {
        self.0.len()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }
}

/// Renders as `_0_2`; the root renders as the empty string.
impl fmt::Display for PathInput {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for index in &self.0 {
            write!(f, "_{}", index)?;
        }
        Ok(())
    }
}

/// Location of the root dataset and the base name derived blobs are named after.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MainInput {
    pub s3_dir: String,
    pub s3_file: String,
    pub base: String,
}

impl MainInput {
    pub fn new(s3_dir: impl Into<String>, s3_file: impl Into<String>) -> Self {
        let s3_file = s3_file.into();
        let base = s3_file
            .rsplit_once('.')
            .map(|(stem, _)| stem.to_string())
            .unwrap_or_else(|| s3_file.clone());
        Self {
            s3_dir: s3_dir.into(),
            s3_file,
            base,
        }
    }

    pub fn root_key(&self) -> String {
        blob_key(&self.s3_dir, &self.s3_file)
    }

    /// Key of the raw shard a divide wrote for `path`.
    pub fn part_key(&self, path: &PathInput, extension: &str) -> String {
        blob_key(&self.s3_dir, &format!("{}_part{}.{}", self.base, path, extension))
    }

    /// Key of the sorted output of the merge for `path`.
    pub fn sorted_key(&self, path: &PathInput, extension: &str) -> String {
        blob_key(&self.s3_dir, &format!("{}_sorted{}.{}", self.base, path, extension))
    }
}

impl MainInput {
    /// Key of the deduplicated dictionary the build step writes.
    pub fn build_key(&self, extension: &str) -> String {
        blob_key(&self.s3_dir, &format!("{}_dictionary.{}", self.base, extension))
    }
}

/// `s3_dir/s3_file` composite key.
pub fn blob_key(dir: &str, file: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        file.to_string()
    } else {
        format!("{}/{}", dir, file)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub domain: String,
    pub workflow_id: String,
    pub run_id: String,
}

impl fmt::Display for WorkflowExecution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.domain, self.workflow_id, self.run_id)
    }
}

/// Payload of one scheduled activity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityInput {
    pub main_input: MainInput,
    pub path_input: PathInput,
    /// Divide: the node's own shard. Merge: the ordered sources to combine.
    pub child_inputs: Vec<String>,
    /// Merge over the node's raw shard rather than over sorted children.
    #[serde(default)]
    pub leaf: bool,
}

/// A claimed unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivityTask {
    pub task_token: String,
    pub activity_id: String,
    pub activity_type: ActivityType,
    pub execution: WorkflowExecution,
    pub input: ActivityInput,
    pub attempt: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActivityFailure {
    pub reason: String,
    pub details: String,
    pub retryable: bool,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatAck {
    pub cancel_requested: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChildShard {
    pub zip_name: String,
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DivideOutput {
    pub child_count: usize,
    pub children: Vec<ChildShard>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeOutput {
    pub zip_name: String,
    pub entries: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildOutput {
    pub zip_name: String,
    pub entries: u64,
    pub duplicates: u64,
    pub bytes: u64,
}

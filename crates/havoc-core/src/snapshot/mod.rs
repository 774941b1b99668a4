//! Resource snapshots of homeserver processes.
//!
//! Snapshotters are plugins keyed by a string type tag, like restarters.
//! One snapshot per homeserver is taken at bootstrap and after every tick;
//! entries are appended to a local sqlite table.

use crate::HarnessError;
use async_trait::async_trait;
use havoc_proto::HomeserverConfig;

mod docker;
mod storage;

pub use docker::{new_docker_snapshotter, SNAPSHOT_TYPE_DOCKER};
pub use storage::Storage;

/// Resource usage of one homeserver process at one instant.
#[derive(Debug, Clone, PartialEq)]
pub struct ProcessSnapshot {
    pub homeserver: String,
    pub process_name: String,
    pub memory_bytes: i64,
    pub milli_cpus: i64,
}

impl std::fmt::Display for ProcessSnapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} ({}) CPU={}m Mem={}MB",
            self.homeserver,
            self.process_name,
            self.milli_cpus,
            (self.memory_bytes / 1024) / 1024
        )
    }
}

/// Samples resource usage for one homeserver.
#[async_trait]
pub trait Snapshotter: Send + Sync + std::fmt::Debug {
    async fn snapshot(&self) -> Result<Vec<ProcessSnapshot>, HarnessError>;
}

/// Constructor registered per snapshot type tag.
pub type CreateSnapshotter = fn(&HomeserverConfig) -> Result<Box<dyn Snapshotter>, HarnessError>;

//! Docker snapshotter: one-shot container stats via the engine API.

use super::{ProcessSnapshot, Snapshotter};
use crate::HarnessError;
use async_trait::async_trait;
use bollard::container::StatsOptions;
use bollard::Docker;
use futures_util::StreamExt;
use havoc_proto::{plugin_config, HomeserverConfig};
use serde::Deserialize;

pub const SNAPSHOT_TYPE_DOCKER: &str = "docker";

#[derive(Debug, Deserialize)]
struct DockerSnapshotConfig {
    container_name: String,
}

#[derive(Debug)]
struct DockerSnapshotter {
    api: Docker,
    hs_config: HomeserverConfig,
    container_name: String,
}

/// Build a docker snapshotter from a homeserver's snapshot config.
pub fn new_docker_snapshotter(
    hsc: &HomeserverConfig,
) -> Result<Box<dyn Snapshotter>, HarnessError> {
    let api = Docker::connect_with_local_defaults()?;
    let cfg: DockerSnapshotConfig = plugin_config(&hsc.snapshot.config)?;
    Ok(Box::new(DockerSnapshotter {
        api,
        hs_config: hsc.clone(),
        container_name: cfg.container_name,
    }))
}

#[async_trait]
impl Snapshotter for DockerSnapshotter {
    async fn snapshot(&self) -> Result<Vec<ProcessSnapshot>, HarnessError> {
        let mut stream = self.api.stats(
            &self.container_name,
            Some(StatsOptions {
                stream: false,
                one_shot: true,
            }),
        );
        let stats = stream
            .next()
            .await
            .ok_or_else(|| {
                HarnessError::Snapshot(format!("no stats returned for {}", self.container_name))
            })??;

        let memory_bytes = stats.memory_stats.usage.unwrap_or(0) as i64;
        // ns -> ms
        let milli_cpus = (stats.cpu_stats.cpu_usage.total_usage / 1_000 / 1_000) as i64;
        Ok(vec![ProcessSnapshot {
            homeserver: self.hs_config.domain.clone(),
            process_name: self.container_name.clone(),
            memory_bytes,
            milli_cpus,
        }])
    }
}

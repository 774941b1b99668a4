//! Docker restarter: restarts the homeserver's container via the engine
//! API.

use super::Restarter;
use crate::HarnessError;
use async_trait::async_trait;
use bollard::container::RestartContainerOptions;
use bollard::Docker;
use havoc_proto::{plugin_config, HomeserverConfig};
use serde::Deserialize;

pub const RESTART_TYPE_DOCKER: &str = "docker";

const DEFAULT_STOP_TIMEOUT_SECS: isize = 3;

#[derive(Debug, Deserialize)]
struct DockerRestartConfig {
    container_name: String,
    timeout_secs: Option<isize>,
}

#[derive(Debug)]
struct DockerRestarter {
    api: Docker,
    hs_config: HomeserverConfig,
    container_name: String,
    timeout_secs: isize,
}

/// Build a docker restarter from a homeserver's restart config.
pub fn new_docker_restarter(
    hsc: &HomeserverConfig,
) -> Result<Box<dyn Restarter>, HarnessError> {
    let api = Docker::connect_with_local_defaults()?;
    let cfg: DockerRestartConfig = plugin_config(&hsc.restart.config)?;
    Ok(Box::new(DockerRestarter {
        api,
        hs_config: hsc.clone(),
        container_name: cfg.container_name,
        timeout_secs: cfg.timeout_secs.unwrap_or(DEFAULT_STOP_TIMEOUT_SECS),
    }))
}

#[async_trait]
impl Restarter for DockerRestarter {
    async fn restart(&self) -> Result<(), HarnessError> {
        self.api
            .restart_container(
                &self.container_name,
                Some(RestartContainerOptions {
                    t: self.timeout_secs,
                }),
            )
            .await?;
        Ok(())
    }

    fn config(&self) -> &HomeserverConfig {
        &self.hs_config
    }
}

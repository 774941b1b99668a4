//! Restarting homeservers.
//!
//! Restarters are plugins keyed by a string type tag in the homeserver
//! config; the bootstrap registry constructs one per configured server.

use crate::HarnessError;
use async_trait::async_trait;
use havoc_proto::HomeserverConfig;

mod docker;

pub use docker::{new_docker_restarter, RESTART_TYPE_DOCKER};

/// Restarts one homeserver.
#[async_trait]
pub trait Restarter: Send + Sync + std::fmt::Debug {
    async fn restart(&self) -> Result<(), HarnessError>;
    fn config(&self) -> &HomeserverConfig;
}

/// Constructor registered per restart type tag.
pub type CreateRestarter = fn(&HomeserverConfig) -> Result<Box<dyn Restarter>, HarnessError>;

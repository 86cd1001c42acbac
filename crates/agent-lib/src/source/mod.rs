//! Container observation sources
//!
//! A source adapter turns the live container fleet into a cancellable
//! stream of add/remove observations. Two interchangeable adapters share
//! the contract: the Kubernetes reconciler and the Docker engine event
//! listener, selected at startup by configuration.

mod docker;
mod kubernetes;

#[cfg(test)]
mod tests;

pub use docker::DockerSource;
pub use kubernetes::{KubernetesConfig, KubernetesSource};

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{broadcast, mpsc};

use crate::models::Observation;

/// Buffer between an adapter's emit loop and the evaluation workers
pub(crate) const OBSERVATION_BUFFER: usize = 64;

/// Capability: produce a cancellable stream of container observations.
#[async_trait]
pub trait ContainerSource: Send + Sync {
    /// Start the adapter's background loops and return the observation
    /// stream. The stream closes once the shutdown signal fires.
    async fn observe(
        &self,
        shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<mpsc::Receiver<Observation>>;
}

/// Which container fleet to watch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    Kubernetes,
    Docker,
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("unsupported container source {0:?}, expected \"kubernetes\" or \"docker\"")]
pub struct UnknownSourceError(String);

impl FromStr for SourceKind {
    type Err = UnknownSourceError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "kubernetes" => Ok(SourceKind::Kubernetes),
            "docker" => Ok(SourceKind::Docker),
            other => Err(UnknownSourceError(other.to_string())),
        }
    }
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SourceKind::Kubernetes => f.write_str("kubernetes"),
            SourceKind::Docker => f.write_str("docker"),
        }
    }
}

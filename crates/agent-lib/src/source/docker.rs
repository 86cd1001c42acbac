//! Docker engine source
//!
//! The simpler event-driven variant of the source contract: enumerate
//! running containers once, then follow the engine event stream, emitting
//! an added observation per created container and a removed observation
//! per died container. Engine containers carry no pull-secret material;
//! the base keychain covers their registries.

use std::collections::HashMap;

use anyhow::Context;
use async_trait::async_trait;
use bollard::container::{InspectContainerOptions, ListContainersOptions};
use bollard::models::{ContainerSummary, EventMessage, EventMessageTypeEnum};
use bollard::system::EventsOptions;
use bollard::Docker;
use futures::StreamExt;
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, warn};

use crate::models::{Observation, ObservationAction};
use crate::source::{ContainerSource, OBSERVATION_BUFFER};

pub struct DockerSource {
    docker: Docker,
}

impl DockerSource {
    /// Connect to the local engine socket. Failure is fatal at startup.
    pub fn connect() -> anyhow::Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("failed to connect to the Docker engine")?;
        Ok(Self { docker })
    }
}

#[async_trait]
impl ContainerSource for DockerSource {
    async fn observe(
        &self,
        mut shutdown: broadcast::Receiver<()>,
    ) -> anyhow::Result<mpsc::Receiver<Observation>> {
        let (tx, rx) = mpsc::channel(OBSERVATION_BUFFER);

        // The initial enumeration doubles as the startup connectivity
        // check: an unreachable engine aborts startup.
        let containers = self
            .docker
            .list_containers(Some(ListContainersOptions::<String> {
                all: false,
                ..Default::default()
            }))
            .await
            .context("failed to list running containers")?;

        let docker = self.docker.clone();
        tokio::spawn(async move {
            for container in containers {
                debug!(container = ?container.id, "container info");
                let Some(id) = container.id.clone() else { continue };
                let Some(image) = container.image.clone() else { continue };
                let name = first_name_or_id(&container);
                if send_added(&docker, &tx, &id, &name, &image).await.is_err() {
                    return;
                }
            }

            let mut events = docker.events(Some(EventsOptions::<String>::default()));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    event = events.next() => match event {
                        Some(Ok(message)) => {
                            if handle_event(&docker, &tx, message).await.is_err() {
                                break;
                            }
                        }
                        Some(Err(error)) => {
                            error!(error = %error, "error reading engine events");
                            break;
                        }
                        None => break,
                    },
                }
            }
        });

        Ok(rx)
    }
}

async fn handle_event(
    docker: &Docker,
    tx: &mpsc::Sender<Observation>,
    message: EventMessage,
) -> Result<(), mpsc::error::SendError<Observation>> {
    if message.typ != Some(EventMessageTypeEnum::CONTAINER) {
        return Ok(());
    }
    debug!(event = ?message.action, actor = ?message.actor, "engine event");

    let actor = message.actor.unwrap_or_default();
    let attributes = actor.attributes.unwrap_or_default();

    match message.action.as_deref() {
        Some("create") => {
            let id = actor.id.unwrap_or_default();
            let name = attributes
                .get("name")
                .cloned()
                .unwrap_or_else(|| id.clone());
            let image = attributes.get("image").cloned().unwrap_or_default();
            send_added(docker, tx, &id, &name, &image).await?;
        }
        Some("die") => {
            let name = attributes.get("name").cloned().unwrap_or_default();
            tx.send(Observation::removed(name)).await?;
        }
        _ => {}
    }
    Ok(())
}

async fn send_added(
    docker: &Docker,
    tx: &mpsc::Sender<Observation>,
    id: &str,
    name: &str,
    image: &str,
) -> Result<(), mpsc::error::SendError<Observation>> {
    let labels = match container_labels(docker, id).await {
        Ok(labels) => labels,
        Err(error) => {
            warn!(id = %id, error = %error, "error getting container labels");
            HashMap::new()
        }
    };

    tx.send(Observation {
        action: ObservationAction::Added,
        identity: name.to_string(),
        image: Some(image.to_string()),
        labels: labels.clone(),
        // The engine has no annotation concept; labels stand in so the
        // pin-mode lookup still works.
        annotations: labels,
        credentials: None,
    })
    .await
}

async fn container_labels(
    docker: &Docker,
    id: &str,
) -> Result<HashMap<String, String>, bollard::errors::Error> {
    let details = docker
        .inspect_container(id, None::<InspectContainerOptions>)
        .await?;
    Ok(details
        .config
        .and_then(|config| config.labels)
        .unwrap_or_default())
}

fn first_name_or_id(container: &ContainerSummary) -> String {
    container
        .names
        .as_ref()
        .and_then(|names| names.first())
        .map(|name| name.trim_start_matches('/').to_string())
        .unwrap_or_else(|| container.id.clone().unwrap_or_default())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_name_or_id() {
        let container = ContainerSummary {
            id: Some("abc123".to_string()),
            names: Some(vec!["/web".to_string(), "/alias".to_string()]),
            ..Default::default()
        };
        assert_eq!(first_name_or_id(&container), "web");

        let unnamed = ContainerSummary {
            id: Some("abc123".to_string()),
            names: None,
            ..Default::default()
        };
        assert_eq!(first_name_or_id(&unnamed), "abc123");
    }
}

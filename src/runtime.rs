//! Thin abstraction over the container runtime (spec.md §6).
//!
//! Every component that needs to talk to Docker does so through
//! [`ContainerRuntime`] rather than `bollard` directly, so that
//! `DeploymentManager`, `ContainerSource` and the `Updater` can be unit
//! tested against [`FakeRuntime`] without a real daemon.

use async_trait::async_trait;
use futures::stream::BoxStream;
use std::collections::HashMap;

/// Action named on a Docker container lifecycle event, filtered down to the
/// set spec.md §4.1 cares about.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventAction {
    Start,
    Restart,
    Die,
    Stop,
    Kill,
}

impl EventAction {
    pub fn from_str(action: &str) -> Option<Self> {
        match action {
            "start" => Some(EventAction::Start),
            "restart" => Some(EventAction::Restart),
            "die" => Some(EventAction::Die),
            "stop" => Some(EventAction::Stop),
            "kill" => Some(EventAction::Kill),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ContainerEvent {
    pub action: EventAction,
    pub container_id: String,
}

/// Health as reported by the container runtime's own healthcheck, if one is
/// configured on the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    /// No HEALTHCHECK configured on the image.
    None,
    Starting,
    Healthy,
    Unhealthy,
}

/// Result of inspecting a single container.
#[derive(Debug, Clone)]
pub struct ContainerInspectInfo {
    pub id: String,
    pub labels: HashMap<String, String>,
    pub running: bool,
    pub health: HealthState,
    /// Network name -> IP address, for every network this container is attached to.
    pub networks: HashMap<String, String>,
}

impl ContainerInspectInfo {
    /// IP address on the named overlay network, if attached to it.
    pub fn ip_on_network(&self, network: &str) -> Option<&str> {
        self.networks.get(network).map(String::as_str)
    }

    /// True if the runtime considers this container fully healthy: running,
    /// and either no healthcheck is configured or it reports healthy.
    pub fn is_healthy(&self) -> bool {
        self.running && matches!(self.health, HealthState::None | HealthState::Healthy)
    }
}

#[derive(Debug, Clone)]
pub struct ContainerSummary {
    pub id: String,
    pub labels: HashMap<String, String>,
}

/// Abstraction over the container runtime operations the core depends on.
#[async_trait]
pub trait ContainerRuntime: Send + Sync {
    /// List running containers labelled `role=<role>`.
    async fn list_running_by_role(&self, role: &str) -> anyhow::Result<Vec<ContainerSummary>>;

    /// Full inspect of a single container, including label map, run state,
    /// health, and network attachment.
    async fn inspect(&self, container_id: &str) -> anyhow::Result<ContainerInspectInfo>;

    /// Subscribe to the lifecycle event stream, already filtered to the
    /// actions named in spec.md §4.1.
    fn subscribe_events(&self) -> BoxStream<'static, anyhow::Result<ContainerEvent>>;

    /// Gracefully stop a container.
    async fn stop(&self, container_id: &str) -> anyhow::Result<()>;

    /// Send a named signal to a running container (used to trigger the
    /// proxy's zero-downtime reload via `SIGUSR2`).
    async fn kill(&self, container_id: &str, signal: &str) -> anyhow::Result<()>;

    /// Remove a stopped container.
    async fn remove(&self, container_id: &str) -> anyhow::Result<()>;

    /// Prune dangling images and stopped containers (maintenance ticker).
    async fn prune(&self) -> anyhow::Result<()>;
}

pub mod bollard_impl {
    use super::*;
    use bollard::container::{
        KillContainerOptions, ListContainersOptions, RemoveContainerOptions, StopContainerOptions,
    };
    use bollard::image::PruneImagesOptions;
    use bollard::container::PruneContainersOptions;
    use bollard::system::EventsOptions;
    use bollard::Docker;
    use futures::StreamExt;
    use std::collections::HashMap as StdHashMap;

    pub struct BollardRuntime {
        docker: Docker,
    }

    impl BollardRuntime {
        pub fn connect() -> anyhow::Result<Self> {
            let docker = Docker::connect_with_local_defaults()?;
            Ok(Self { docker })
        }
    }

    #[async_trait]
    impl ContainerRuntime for BollardRuntime {
        async fn list_running_by_role(&self, role: &str) -> anyhow::Result<Vec<ContainerSummary>> {
            let mut filters: StdHashMap<String, Vec<String>> = StdHashMap::new();
            filters.insert("status".to_string(), vec!["running".to_string()]);
            filters.insert(
                "label".to_string(),
                vec![format!("{}={}", crate::labels::LABEL_ROLE, role)],
            );
            let options = ListContainersOptions {
                all: false,
                filters,
                ..Default::default()
            };
            let containers = self.docker.list_containers(Some(options)).await?;
            Ok(containers
                .into_iter()
                .map(|c| ContainerSummary {
                    id: c.id.unwrap_or_default(),
                    labels: c.labels.unwrap_or_default(),
                })
                .collect())
        }

        async fn inspect(&self, container_id: &str) -> anyhow::Result<ContainerInspectInfo> {
            let inspect = self.docker.inspect_container(container_id, None).await?;

            let labels = inspect
                .config
                .as_ref()
                .and_then(|c| c.labels.clone())
                .unwrap_or_default();

            let state = inspect.state.as_ref();
            let running = state.and_then(|s| s.running).unwrap_or(false);
            let health = state
                .and_then(|s| s.health.as_ref())
                .and_then(|h| h.status)
                .map(|status| match status {
                    bollard::models::HealthStatusEnum::HEALTHY => HealthState::Healthy,
                    bollard::models::HealthStatusEnum::UNHEALTHY => HealthState::Unhealthy,
                    bollard::models::HealthStatusEnum::STARTING => HealthState::Starting,
                    _ => HealthState::None,
                })
                .unwrap_or(HealthState::None);

            let mut networks = StdHashMap::new();
            if let Some(settings) = inspect.network_settings {
                if let Some(nets) = settings.networks {
                    for (name, endpoint) in nets {
                        if let Some(ip) = endpoint.ip_address {
                            if !ip.is_empty() {
                                networks.insert(name, ip);
                            }
                        }
                    }
                }
            }

            Ok(ContainerInspectInfo {
                id: inspect.id.unwrap_or_else(|| container_id.to_string()),
                labels,
                running,
                health,
                networks,
            })
        }

        fn subscribe_events(&self) -> BoxStream<'static, anyhow::Result<ContainerEvent>> {
            let mut filters: StdHashMap<String, Vec<String>> = StdHashMap::new();
            filters.insert("type".to_string(), vec!["container".to_string()]);
            filters.insert(
                "event".to_string(),
                vec![
                    "start".to_string(),
                    "restart".to_string(),
                    "die".to_string(),
                    "stop".to_string(),
                    "kill".to_string(),
                ],
            );
            let options = EventsOptions::<String> {
                since: None,
                until: None,
                filters,
            };
            let stream = self.docker.events(Some(options));
            stream
                .filter_map(|item| async move {
                    match item {
                        Ok(message) => {
                            let action = message.action.as_deref().and_then(EventAction::from_str)?;
                            let container_id = message.actor?.id?;
                            Some(Ok(ContainerEvent {
                                action,
                                container_id,
                            }))
                        }
                        Err(e) => Some(Err(anyhow::anyhow!(e))),
                    }
                })
                .boxed()
        }

        async fn stop(&self, container_id: &str) -> anyhow::Result<()> {
            self.docker
                .stop_container(container_id, Some(StopContainerOptions { t: 10 }))
                .await?;
            Ok(())
        }

        async fn kill(&self, container_id: &str, signal: &str) -> anyhow::Result<()> {
            self.docker
                .kill_container(
                    container_id,
                    Some(KillContainerOptions {
                        signal: signal.to_string(),
                    }),
                )
                .await?;
            Ok(())
        }

        async fn remove(&self, container_id: &str) -> anyhow::Result<()> {
            self.docker
                .remove_container(
                    container_id,
                    Some(RemoveContainerOptions {
                        force: true,
                        ..Default::default()
                    }),
                )
                .await?;
            Ok(())
        }

        async fn prune(&self) -> anyhow::Result<()> {
            self.docker
                .prune_containers(None::<PruneContainersOptions<String>>)
                .await?;
            self.docker
                .prune_images(None::<PruneImagesOptions<String>>)
                .await?;
            Ok(())
        }
    }
}

/// Test doubles shared across modules' `#[cfg(test)]` suites.
#[cfg(test)]
pub mod tests {
    use super::*;
    use futures::StreamExt;

    /// A `ContainerRuntime` that never has any containers and fails any
    /// mutating call. Useful where a test only exercises rendering logic
    /// and needs a runtime handle to satisfy a constructor.
    pub struct NullRuntime;

    #[async_trait]
    impl ContainerRuntime for NullRuntime {
        async fn list_running_by_role(&self, _role: &str) -> anyhow::Result<Vec<ContainerSummary>> {
            Ok(Vec::new())
        }

        async fn inspect(&self, container_id: &str) -> anyhow::Result<ContainerInspectInfo> {
            anyhow::bail!("NullRuntime has no container {container_id}")
        }

        fn subscribe_events(&self) -> BoxStream<'static, anyhow::Result<ContainerEvent>> {
            futures::stream::empty().boxed()
        }

        async fn stop(&self, _container_id: &str) -> anyhow::Result<()> {
            anyhow::bail!("NullRuntime cannot stop containers")
        }

        async fn kill(&self, _container_id: &str, _signal: &str) -> anyhow::Result<()> {
            anyhow::bail!("NullRuntime cannot signal containers")
        }

        async fn remove(&self, _container_id: &str) -> anyhow::Result<()> {
            anyhow::bail!("NullRuntime cannot remove containers")
        }

        async fn prune(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }
}

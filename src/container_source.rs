//! `ContainerSource` — the runtime event feed filtered down to containers
//! that actually matter for reconciliation (spec.md §4.1).
//!
//! The filtered record itself is not retained anywhere: the DeploymentManager
//! rescans the full container set on every reconcile, so a dropped or
//! reordered event never produces an incorrect deployment model, only a
//! delayed one.

use crate::labels::{ContainerLabels, Role};
use crate::runtime::{ContainerEvent, ContainerRuntime};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// A container event that has survived the role + network-membership filter.
#[derive(Debug, Clone)]
pub struct RelevantEvent {
    pub event: ContainerEvent,
    pub app_name: String,
}

/// Subscribes to the runtime event stream and forwards only events for
/// `role=app` containers attached to the configured overlay network.
pub struct ContainerSource {
    runtime: Arc<dyn ContainerRuntime>,
    overlay_network: String,
}

impl ContainerSource {
    pub fn new(runtime: Arc<dyn ContainerRuntime>, overlay_network: String) -> Self {
        Self {
            runtime,
            overlay_network,
        }
    }

    /// Runs until `shutdown` is cancelled, forwarding filtered events on
    /// `tx`. Reconnects the underlying stream on any error other than a
    /// clean EOF, waiting a fixed delay between attempts (spec.md §4.1).
    pub async fn run(&self, tx: mpsc::Sender<RelevantEvent>, shutdown: CancellationToken) {
        loop {
            if shutdown.is_cancelled() {
                return;
            }

            info!("subscribing to container event stream");
            if let Err(e) = self.consume_until_error(&tx, &shutdown).await {
                warn!("container event stream ended: {e}; reconnecting in {RECONNECT_DELAY:?}");
            }

            tokio::select! {
                _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                _ = shutdown.cancelled() => return,
            }
        }
    }

    async fn consume_until_error(
        &self,
        tx: &mpsc::Sender<RelevantEvent>,
        shutdown: &CancellationToken,
    ) -> anyhow::Result<()> {
        use futures::StreamExt;

        let mut stream = self.runtime.subscribe_events();
        loop {
            let next = tokio::select! {
                item = stream.next() => item,
                _ = shutdown.cancelled() => return Ok(()),
            };

            let Some(item) = next else {
                anyhow::bail!("event stream closed");
            };
            let event = item?;

            match self.inspect_and_filter(&event).await {
                Ok(Some(relevant)) => {
                    if tx.send(relevant).await.is_err() {
                        return Ok(());
                    }
                }
                Ok(None) => {}
                Err(e) => debug!(container_id = %event.container_id, "discarding event, inspect/filter failed: {e}"),
            }
        }
    }

    async fn inspect_and_filter(
        &self,
        event: &ContainerEvent,
    ) -> anyhow::Result<Option<RelevantEvent>> {
        let info = self.runtime.inspect(&event.container_id).await?;

        match ContainerLabels::role(&event.container_id, &info.labels) {
            Ok(Role::App) => {}
            Ok(Role::Proxy) => return Ok(None),
            Err(_) => return Ok(None),
        }
        if info.ip_on_network(&self.overlay_network).is_none() {
            return Ok(None);
        }

        let labels = ContainerLabels::parse(&event.container_id, &info.labels)?;
        Ok(Some(RelevantEvent {
            event: event.clone(),
            app_name: labels.app_name,
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runtime::{ContainerInspectInfo, ContainerSummary, EventAction, HealthState};
    use async_trait::async_trait;
    use futures::stream::BoxStream;
    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct ScriptedRuntime {
        events: Vec<ContainerEvent>,
        infos: HashMap<String, ContainerInspectInfo>,
        call_count: AtomicUsize,
    }

    #[async_trait]
    impl ContainerRuntime for ScriptedRuntime {
        async fn list_running_by_role(&self, _role: &str) -> anyhow::Result<Vec<ContainerSummary>> {
            Ok(Vec::new())
        }

        async fn inspect(&self, container_id: &str) -> anyhow::Result<ContainerInspectInfo> {
            self.infos
                .get(container_id)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("unknown container"))
        }

        fn subscribe_events(&self) -> BoxStream<'static, anyhow::Result<ContainerEvent>> {
            use futures::StreamExt;
            self.call_count.fetch_add(1, Ordering::SeqCst);
            futures::stream::iter(self.events.clone().into_iter().map(Ok)).boxed()
        }

        async fn stop(&self, _container_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn kill(&self, _container_id: &str, _signal: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn remove(&self, _container_id: &str) -> anyhow::Result<()> {
            Ok(())
        }
        async fn prune(&self) -> anyhow::Result<()> {
            Ok(())
        }
    }

    fn app_info(app_name: &str, network: &str) -> ContainerInspectInfo {
        let mut labels = HashMap::new();
        labels.insert("rise.role".to_string(), "app".to_string());
        labels.insert("rise.appName".to_string(), app_name.to_string());
        labels.insert("rise.deploymentID".to_string(), "1".to_string());
        let mut networks = HashMap::new();
        networks.insert(network.to_string(), "10.0.0.5".to_string());
        ContainerInspectInfo {
            id: "c1".to_string(),
            labels,
            running: true,
            health: HealthState::None,
            networks,
        }
    }

    #[tokio::test]
    async fn forwards_only_app_containers_on_overlay_network() {
        let mut infos = HashMap::new();
        infos.insert("c1".to_string(), app_info("web", "rise_net"));
        infos.insert(
            "c2".to_string(),
            {
                let mut info = app_info("web", "other_net");
                info.id = "c2".to_string();
                info
            },
        );

        let runtime = Arc::new(ScriptedRuntime {
            events: vec![
                ContainerEvent {
                    action: EventAction::Start,
                    container_id: "c1".to_string(),
                },
                ContainerEvent {
                    action: EventAction::Start,
                    container_id: "c2".to_string(),
                },
            ],
            infos,
            call_count: AtomicUsize::new(0),
        });

        let source = ContainerSource::new(runtime, "rise_net".to_string());
        let (tx, mut rx) = mpsc::channel(8);
        let shutdown = CancellationToken::new();

        source.consume_until_error(&tx, &shutdown).await.unwrap_err();

        let first = rx.try_recv().unwrap();
        assert_eq!(first.app_name, "web");
        assert!(rx.try_recv().is_err(), "c2 should have been filtered out");
    }
}

//! `EventLoop` — wires container events, the certificate-renewal signal, and
//! a maintenance ticker into `Updater.reconcile` calls (spec.md §4.5).

use crate::container_source::{ContainerSource, RelevantEvent};
use crate::debounce::KeyedDebouncer;
use crate::runtime::ContainerRuntime;
use crate::updater::{ReconcileReason, TriggerContext, Updater, UserTrigger};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct EventLoopConfig {
    pub debounce_window: Duration,
    pub reconcile_timeout: Duration,
    pub cert_reconcile_timeout: Duration,
    pub maintenance_interval: Duration,
    pub log_retention: chrono::Duration,
    pub logs_dir: std::path::PathBuf,
}

pub struct EventLoop {
    runtime: Arc<dyn ContainerRuntime>,
    container_source: ContainerSource,
    updater: Arc<Updater>,
    proxy: Arc<crate::proxy::ProxyManager>,
    deployments: Arc<crate::deployment::DeploymentManager>,
    cert_signal_rx: mpsc::Receiver<&'static str>,
    user_trigger_rx: mpsc::Receiver<UserTrigger>,
    cert_dir: std::path::PathBuf,
    config: EventLoopConfig,
}

impl EventLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        overlay_network: String,
        updater: Arc<Updater>,
        proxy: Arc<crate::proxy::ProxyManager>,
        deployments: Arc<crate::deployment::DeploymentManager>,
        cert_signal_rx: mpsc::Receiver<&'static str>,
        user_trigger_rx: mpsc::Receiver<UserTrigger>,
        cert_dir: std::path::PathBuf,
        config: EventLoopConfig,
    ) -> Self {
        Self {
            container_source: ContainerSource::new(runtime.clone(), overlay_network),
            runtime,
            updater,
            proxy,
            deployments,
            cert_signal_rx,
            user_trigger_rx,
            cert_dir,
            config,
        }
    }

    pub async fn run(mut self, shutdown: CancellationToken) {
        let (event_tx, mut event_rx) = mpsc::channel::<RelevantEvent>(256);
        let (debouncer, mut debounce_rx) =
            KeyedDebouncer::new(self.config.debounce_window, shutdown.clone());

        let source = self.container_source;
        let source_shutdown = shutdown.clone();
        tokio::spawn(async move {
            source.run(event_tx, source_shutdown).await;
        });

        let debounce_shutdown = shutdown.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(event) = event_rx.recv() => {
                        debouncer.fire(event.app_name.clone(), event).await;
                    }
                    _ = debounce_shutdown.cancelled() => return,
                    else => return,
                }
            }
        });

        let mut maintenance = tokio::time::interval(self.config.maintenance_interval);
        maintenance.tick().await; // first tick fires immediately; skip it

        loop {
            tokio::select! {
                Some((app_name, event)) = debounce_rx.recv() => {
                    self.handle_app_trigger(app_name, Some(event)).await;
                }
                Some(request) = self.user_trigger_rx.recv() => {
                    self.handle_user_trigger(request).await;
                }
                Some(_signal) = self.cert_signal_rx.recv() => {
                    self.handle_cert_signal().await;
                }
                _ = maintenance.tick() => {
                    self.spawn_maintenance();
                }
                _ = shutdown.cancelled() => {
                    info!("event loop shutting down");
                    return;
                }
            }
        }
    }

    /// Resolves `app_name`'s current winning generation (if any) into the
    /// `TriggerContext` a reconcile needs, falling back to a conservative
    /// default when the app has no deployment yet (e.g. its first-ever
    /// container just started and hasn't been rebuilt into the snapshot).
    async fn build_trigger_context(&self, app_name: &str) -> TriggerContext {
        let snapshot = self.deployments.snapshot().await;
        match snapshot.get(app_name) {
            Some(deployment) => TriggerContext {
                app_name: app_name.to_string(),
                deployment_id: deployment.deployment_id().to_string(),
                max_containers_to_keep: deployment.labels.max_containers_to_keep,
            },
            None => TriggerContext {
                app_name: app_name.to_string(),
                deployment_id: String::new(),
                max_containers_to_keep: 6,
            },
        }
    }

    async fn handle_app_trigger(&self, app_name: String, event: Option<RelevantEvent>) {
        let trigger = self.build_trigger_context(&app_name).await;

        let fut = self
            .updater
            .reconcile(ReconcileReason::AppUpdated, Some(&trigger));

        match tokio::time::timeout(self.config.reconcile_timeout, fut).await {
            Ok(Ok(Some(success))) => {
                info!(app_name = %success.app_name, deployment_id = %success.deployment_id, "reconcile succeeded");
            }
            Ok(Ok(None)) => {
                info!(%app_name, action = ?event.map(|e| e.event.action), "reconcile observed no change");
            }
            Ok(Err(e)) => error!(%app_name, stage = %e.stage, "reconcile failed: {e}"),
            Err(_) => error!(%app_name, timeout = ?self.config.reconcile_timeout, "reconcile timed out"),
        }
    }

    async fn handle_user_trigger(&self, request: UserTrigger) {
        let trigger = self.build_trigger_context(&request.app_name).await;
        let fut = self
            .updater
            .reconcile(ReconcileReason::AppUpdated, Some(&trigger));
        let result = tokio::time::timeout(self.config.reconcile_timeout, fut)
            .await
            .unwrap_or_else(|_| {
                Err(crate::error::CoreError::new(
                    crate::error::Stage::Build,
                    anyhow::anyhow!("reconcile timed out after {:?}", self.config.reconcile_timeout),
                ))
            });
        let _ = request.reply.send(result);
    }

    async fn handle_cert_signal(&self) {
        let snapshot = self.deployments.snapshot().await;
        let fut = self.proxy.apply_config(&snapshot, &self.cert_dir);
        match tokio::time::timeout(self.config.cert_reconcile_timeout, fut).await {
            Ok(Ok(())) => info!("reloaded proxy after out-of-band certificate renewal"),
            Ok(Err(e)) => error!("failed to reload proxy after certificate renewal: {e}"),
            Err(_) => error!("proxy reload after certificate renewal timed out"),
        }
    }

    /// Spawns the periodic maintenance pass (pruning, log retention, and a
    /// full `Periodic` reconcile) onto its own task, under the same
    /// `reconcile_timeout` bound every other reconcile carries, so a slow
    /// pass (health checks, ACME round-trips) never blocks container
    /// events, user triggers, or cert-renewal signals for the rest of its
    /// duration (spec.md §4.5 "runs ... in a background goroutine", §5
    /// "each reconcile has an upper-bound timeout").
    fn spawn_maintenance(&self) {
        let runtime = self.runtime.clone();
        let updater = self.updater.clone();
        let logs_dir = self.config.logs_dir.clone();
        let log_retention = self.config.log_retention;
        let reconcile_timeout = self.config.reconcile_timeout;

        tokio::spawn(async move {
            info!("running periodic maintenance pass");

            if let Err(e) = runtime.prune().await {
                warn!("periodic image/container prune failed: {e}");
            }

            if let Err(e) = prune_old_logs(&logs_dir, log_retention).await {
                warn!("log retention cleanup failed: {e}");
            }

            let fut = updater.reconcile(ReconcileReason::Periodic, None);
            match tokio::time::timeout(reconcile_timeout, fut).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => error!(stage = %e.stage, "periodic reconcile failed: {e}"),
                Err(_) => error!(timeout = ?reconcile_timeout, "periodic reconcile timed out"),
            }
        });
    }
}

async fn prune_old_logs(logs_dir: &std::path::Path, log_retention: chrono::Duration) -> std::io::Result<()> {
    let mut entries = match tokio::fs::read_dir(logs_dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
        Err(e) => return Err(e),
    };

    let cutoff = chrono::Utc::now() - log_retention;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        let Ok(modified) = metadata.modified() else {
            continue;
        };
        let modified: chrono::DateTime<chrono::Utc> = modified.into();
        if modified < cutoff {
            if let Err(e) = tokio::fs::remove_file(entry.path()).await {
                warn!(path = %entry.path().display(), "failed to remove expired log file: {e}");
            }
        }
    }
    Ok(())
}

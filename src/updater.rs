//! `Updater` — composes `DeploymentManager`, `CertificatesManager`, and
//! `ProxyManager` under a single reconcile algorithm (spec.md §4.5).

use crate::certificates::CertificatesManager;
use crate::deployment::{DeploymentManager, ManagedDomain};
use crate::error::{CoreError, Stage, UnhealthyContainersError};
use crate::proxy::ProxyManager;
use crate::runtime::ContainerRuntime;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tracing::{info, warn};

/// A user-initiated reconcile request for a single app, the only inbound
/// control surface the core exposes without the full HTTP/SSE API (spec §2).
/// `EventLoop` owns the receiving end and replies on `reply` once the
/// reconcile it drove to completion.
pub struct UserTrigger {
    pub app_name: String,
    pub reply: oneshot::Sender<Result<Option<ReconcileSuccess>, CoreError>>,
}

/// Why a reconcile pass was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileReason {
    /// A debounced container event for one app.
    AppUpdated,
    /// The maintenance ticker's full pass.
    Periodic,
}

/// Carries the detail of the triggering event so the reconcile can target
/// cert issuance and old-container retirement at the right app (spec.md
/// §4.5 "TriggerContext").
#[derive(Debug, Clone)]
pub struct TriggerContext {
    pub app_name: String,
    pub deployment_id: String,
    pub max_containers_to_keep: u32,
}

/// Reported back to a user-initiated trigger on success (spec.md §4.5 step 10).
#[derive(Debug, Clone)]
pub struct ReconcileSuccess {
    pub app_name: String,
    pub deployment_id: String,
}

pub struct Updater {
    runtime: Arc<dyn ContainerRuntime>,
    deployments: Arc<DeploymentManager>,
    certificates: Arc<CertificatesManager>,
    proxy: Arc<ProxyManager>,
    cert_dir: PathBuf,
    trigger_tx: mpsc::Sender<UserTrigger>,
}

impl Updater {
    /// Builds the `Updater` plus the receiving end of its `UserTrigger`
    /// channel. The receiver belongs to whoever drives the event loop
    /// (`EventLoop`) since only it can safely interleave user-initiated
    /// reconciles with debounced container events and the maintenance tick.
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        deployments: Arc<DeploymentManager>,
        certificates: Arc<CertificatesManager>,
        proxy: Arc<ProxyManager>,
        cert_dir: PathBuf,
    ) -> (Self, mpsc::Receiver<UserTrigger>) {
        let (trigger_tx, trigger_rx) = mpsc::channel(16);
        (
            Self {
                runtime,
                deployments,
                certificates,
                proxy,
                cert_dir,
                trigger_tx,
            },
            trigger_rx,
        )
    }

    /// The entire public surface a hypothetical HTTP/SSE layer would call:
    /// ask for `app_name` to be reconciled now and wait for the outcome.
    /// Queues onto the same channel `EventLoop` drains in its select loop,
    /// so a user trigger never runs concurrently with a debounced one.
    pub async fn trigger(&self, app_name: String) -> Result<Option<ReconcileSuccess>, CoreError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        let request = UserTrigger {
            app_name,
            reply: reply_tx,
        };
        if self.trigger_tx.send(request).await.is_err() {
            return Err(CoreError::new(
                Stage::Build,
                anyhow::anyhow!("event loop is not running, trigger channel closed"),
            ));
        }
        match reply_rx.await {
            Ok(result) => result,
            Err(_) => Err(CoreError::new(
                Stage::Build,
                anyhow::anyhow!("event loop dropped the trigger reply"),
            )),
        }
    }

    pub async fn reconcile(
        &self,
        reason: ReconcileReason,
        trigger: Option<&TriggerContext>,
    ) -> Result<Option<ReconcileSuccess>, CoreError> {
        let (changed, compare, failed) = self
            .deployments
            .rebuild()
            .await
            .map_err(|e| CoreError::new(Stage::Build, e))?;

        for failure in &failed {
            warn!(
                container_id = %failure.container_id,
                app_name = ?failure.app_name,
                reason = %failure.reason,
                "stopping container that failed inspect/parse during rebuild"
            );
            if let Err(e) = self.runtime.stop(&failure.container_id).await {
                warn!(container_id = %failure.container_id, "failed to stop unhealthy-at-rebuild container: {e}");
            }
        }

        if !changed {
            return Ok(None);
        }

        let outcome = self.deployments.health_check_new_containers(&compare).await;
        if !outcome.is_all_healthy() {
            return Err(CoreError::new(
                Stage::Health,
                UnhealthyContainersError(outcome.unhealthy_containers),
            ));
        }

        let domains = self.deployments.certificate_domains().await;

        match trigger {
            Some(ctx) if domains.iter().any(|d| d.owner_app == ctx.app_name) => {
                let scoped: Vec<ManagedDomain> = domains
                    .iter()
                    .filter(|d| d.owner_app == ctx.app_name)
                    .cloned()
                    .collect();
                self.certificates
                    .refresh_sync(scoped)
                    .await
                    .into_result()
                    .map_err(|e| CoreError::new(Stage::Certs, e))?;
            }
            _ => {
                self.certificates.refresh_async(domains.clone()).await;
            }
        }

        if reason == ReconcileReason::Periodic {
            self.certificates.cleanup_expired(&domains).await;
        }

        let snapshot = self.deployments.snapshot().await;
        self.proxy
            .apply_config(&snapshot, &self.cert_dir)
            .await
            .map_err(|e| CoreError::new(Stage::Proxy, e))?;

        if let Some(ctx) = trigger {
            self.retire_superseded(ctx).await;
        }

        Ok(trigger.map(|ctx| ReconcileSuccess {
            app_name: ctx.app_name.clone(),
            deployment_id: ctx.deployment_id.clone(),
        }))
    }

    /// Stops containers from superseded generations of `trigger.appName`,
    /// then retires the oldest beyond `maxContainersToKeep` (spec.md §4.5
    /// step 9).
    async fn retire_superseded(&self, trigger: &TriggerContext) {
        // Newest-generation-first; everything here has a different
        // deploymentID than the trigger's winning generation.
        let old_instances = self
            .deployments
            .instances_for_other_generations(&trigger.app_name, &trigger.deployment_id)
            .await;

        for container_id in &old_instances {
            info!(app_name = %trigger.app_name, %container_id, "stopping superseded container");
            if let Err(e) = self.runtime.stop(container_id).await {
                warn!(%container_id, "failed to stop superseded container: {e}");
            }
        }

        let keep = trigger.max_containers_to_keep as usize;
        if old_instances.len() > keep {
            for container_id in &old_instances[keep..] {
                info!(app_name = %trigger.app_name, %container_id, "removing retired container beyond maxContainersToKeep");
                if let Err(e) = self.runtime.remove(container_id).await {
                    warn!(%container_id, "failed to remove retired container: {e}");
                }
            }
        }
    }
}

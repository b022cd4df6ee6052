//! Entry point for `portsided`, the reconciliation daemon.
//!
//! Wires together `ContainerSource`, `DeploymentManager`, `CertificatesManager`,
//! `ProxyManager`, and the `Updater`/`EventLoop` pair described in the core
//! design, and runs until SIGINT/SIGTERM.

mod certificates;
mod container_source;
mod debounce;
mod deployment;
mod error;
mod event_loop;
mod labels;
mod proxy;
mod runtime;
mod settings;
mod updater;

use deployment::DeploymentManager;
use event_loop::{EventLoop, EventLoopConfig};
use runtime::bollard_impl::BollardRuntime;
use runtime::ContainerRuntime;
use settings::Settings;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};
use updater::Updater;

#[tokio::main]
async fn main() {
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| "info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    if let Err(e) = run().await {
        error!("fatal error: {e:#}");
        std::process::exit(1);
    }
}

async fn run() -> anyhow::Result<()> {
    let settings = Settings::new()?;
    info!(cert_dir = %settings.certificates.cert_dir, config_dir = %settings.proxy.config_dir, "starting portsided");

    let runtime: Arc<dyn ContainerRuntime> = Arc::new(
        BollardRuntime::connect().map_err(|e| e.context("failed to connect to container runtime"))?,
    );

    let shutdown = CancellationToken::new();

    let deployments = Arc::new(DeploymentManager::new(
        runtime.clone(),
        settings.runtime.overlay_network.clone(),
        Duration::from_secs(settings.updater.health_check_deadline_secs),
    ));

    let cert_dir = std::path::PathBuf::from(&settings.certificates.cert_dir);
    let (certificates, cert_signal_rx) = certificates::CertificatesManager::new(
        cert_dir.clone(),
        settings.certificates.tls_staging,
        settings.certificates.renewal_window_days,
        settings.certificates.http01_port,
        settings.certificates.infra_domain.clone(),
        settings.certificates.infra_email.clone(),
        Duration::from_secs(settings.updater.cert_debounce_secs),
        shutdown.clone(),
    );

    let proxy = Arc::new(proxy::ProxyManager::new(
        runtime.clone(),
        std::path::PathBuf::from(&settings.proxy.config_dir),
        settings.proxy.proxy_config_file.clone(),
        std::path::PathBuf::from(&settings.proxy.template_path),
        settings.proxy.dry_run,
        Duration::from_secs(settings.proxy.locate_timeout_secs),
    ));

    let (updater, user_trigger_rx) = Updater::new(
        runtime.clone(),
        deployments.clone(),
        certificates.clone(),
        proxy.clone(),
        cert_dir.clone(),
    );
    let updater = Arc::new(updater);

    let event_loop = EventLoop::new(
        runtime.clone(),
        settings.runtime.overlay_network.clone(),
        updater,
        proxy,
        deployments,
        cert_signal_rx,
        user_trigger_rx,
        cert_dir,
        EventLoopConfig {
            debounce_window: Duration::from_secs(settings.updater.debounce_secs),
            reconcile_timeout: Duration::from_secs(settings.updater.reconcile_timeout_secs),
            cert_reconcile_timeout: Duration::from_secs(settings.updater.cert_reconcile_timeout_secs),
            maintenance_interval: Duration::from_secs(settings.updater.maintenance_interval_secs),
            log_retention: chrono::Duration::days(settings.updater.log_retention_days),
            logs_dir: std::path::PathBuf::from(&settings.logs_dir),
        },
    );

    let loop_shutdown = shutdown.clone();
    let loop_handle = tokio::spawn(async move {
        event_loop.run(loop_shutdown).await;
    });

    wait_for_shutdown_signal().await;
    info!("shutdown signal received, draining in-flight work");
    shutdown.cancel();
    let _ = loop_handle.await;

    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate()).expect("failed to install SIGTERM handler");
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {}
        _ = sigterm.recv() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

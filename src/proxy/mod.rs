//! `ProxyManager` — renders the reverse-proxy configuration from the current
//! `DeploymentSet` and issued certificate bundles, then signals the proxy
//! container to reload (spec.md §4.4).

use crate::certificates::artifact;
use crate::deployment::{Deployment, DeploymentSet};
use crate::runtime::ContainerRuntime;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tera::Tera;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("failed to render proxy config template: {0}")]
    Render(#[from] tera::Error),
    #[error("failed to write proxy config file: {0}")]
    Write(#[from] std::io::Error),
    #[error("no running proxy container found (label role=proxy) after {0:?}")]
    ProxyNotFound(Duration),
    #[error("failed to signal proxy container for reload: {0}")]
    Signal(anyhow::Error),
}

const LOCATE_POLL_INTERVAL: Duration = Duration::from_secs(1);
const RELOAD_SIGNAL: &str = "SIGUSR2";

/// One ACL + backend routing entry derived from a single canonical or alias
/// hostname (spec.md §4.4 "Rendering rules").
#[derive(Serialize)]
struct HostRoute {
    acl_name: String,
    hostname: String,
    backend: String,
}

#[derive(Serialize)]
struct AliasRedirect {
    acl_name: String,
    hostname: String,
    canonical_hostname: String,
}

#[derive(Serialize)]
struct Backend {
    app_name: String,
    servers: Vec<BackendServer>,
}

#[derive(Serialize)]
struct BackendServer {
    name: String,
    ip: String,
    port: String,
}

pub struct ProxyManager {
    runtime: Arc<dyn ContainerRuntime>,
    config_dir: PathBuf,
    proxy_config_file: String,
    template_path: PathBuf,
    dry_run: bool,
    locate_timeout: Duration,
    write_mutex: Mutex<()>,
}

impl ProxyManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        config_dir: PathBuf,
        proxy_config_file: String,
        template_path: PathBuf,
        dry_run: bool,
        locate_timeout: Duration,
    ) -> Self {
        Self {
            runtime,
            config_dir,
            proxy_config_file,
            template_path,
            dry_run,
            locate_timeout,
            write_mutex: Mutex::new(()),
        }
    }

    fn sanitize(hostname: &str) -> String {
        hostname.replace('.', "_")
    }

    fn render(&self, deployments: &DeploymentSet, cert_dir: &std::path::Path) -> Result<String, ProxyError> {
        let mut backends = Vec::new();
        let mut https_acls = Vec::new();
        let mut https_use_backend = Vec::new();
        let mut http_redirects = Vec::new();
        let mut alias_redirects = Vec::new();

        let mut app_names: Vec<&String> = deployments.keys().collect();
        app_names.sort();

        for app_name in app_names {
            let deployment: &Deployment = &deployments[app_name];

            let servers = deployment
                .instances
                .iter()
                .enumerate()
                .map(|(i, inst)| BackendServer {
                    name: format!("app{i}"),
                    ip: inst.ip.clone(),
                    port: inst.port.clone(),
                })
                .collect();
            backends.push(Backend {
                app_name: app_name.clone(),
                servers,
            });

            for record in deployment.domains() {
                // Only reference certificate bundles actually present on
                // disk; a pending issuance must not block proxy startup.
                let has_cert = artifact::bundle_path(cert_dir, &record.canonical).exists();
                if !has_cert {
                    warn!(canonical = %record.canonical, "no certificate bundle yet, omitting HTTPS routing");
                }

                let canonical_acl = format!("{}_canonical", Self::sanitize(&record.canonical));
                https_acls.push(HostRoute {
                    acl_name: canonical_acl.clone(),
                    hostname: record.canonical.clone(),
                    backend: app_name.clone(),
                });
                if has_cert {
                    https_use_backend.push(HostRoute {
                        acl_name: canonical_acl.clone(),
                        hostname: record.canonical.clone(),
                        backend: app_name.clone(),
                    });
                }
                http_redirects.push(HostRoute {
                    acl_name: canonical_acl,
                    hostname: record.canonical.clone(),
                    backend: app_name.clone(),
                });

                for alias in &record.aliases {
                    let alias_acl = format!("{}_alias", Self::sanitize(alias));
                    http_redirects.push(HostRoute {
                        acl_name: alias_acl.clone(),
                        hostname: alias.clone(),
                        backend: app_name.clone(),
                    });
                    alias_redirects.push(AliasRedirect {
                        acl_name: alias_acl,
                        hostname: alias.clone(),
                        canonical_hostname: record.canonical.clone(),
                    });
                }
            }
        }

        let template_source = std::fs::read_to_string(&self.template_path)?;
        let mut tera = Tera::default();
        tera.add_raw_template("proxy_config.tera", &template_source)?;

        let mut ctx = tera::Context::new();
        ctx.insert("backends", &backends);
        ctx.insert("https_acls", &https_acls);
        ctx.insert("https_use_backend", &https_use_backend);
        ctx.insert("http_redirects", &http_redirects);
        ctx.insert("alias_redirects", &alias_redirects);

        Ok(tera.render("proxy_config.tera", &ctx)?)
    }

    /// Render, write, and trigger a reload. Serialised behind a single
    /// mutex so the on-disk config is always a fully-rendered snapshot
    /// (spec.md §4.4, §8 property 1).
    pub async fn apply_config(&self, deployments: &DeploymentSet, cert_dir: &std::path::Path) -> Result<(), ProxyError> {
        let _guard = self.write_mutex.lock().await;

        let rendered = self.render(deployments, cert_dir)?;

        if self.dry_run {
            info!(bytes = rendered.len(), "dry-run: skipping proxy config write and reload");
            return Ok(());
        }

        let path = self.config_dir.join(&self.proxy_config_file);
        tokio::fs::create_dir_all(&self.config_dir).await?;
        tokio::fs::write(&path, &rendered).await?;
        set_mode(&path, 0o644).await?;

        let container_id = self.locate_proxy_container().await?;
        self.runtime
            .kill(&container_id, RELOAD_SIGNAL)
            .await
            .map_err(ProxyError::Signal)?;

        info!(%container_id, "reloaded proxy configuration");
        Ok(())
    }

    async fn locate_proxy_container(&self) -> Result<String, ProxyError> {
        let deadline = tokio::time::Instant::now() + self.locate_timeout;
        loop {
            let containers = self
                .runtime
                .list_running_by_role("proxy")
                .await
                .map_err(ProxyError::Signal)?;
            if let Some(container) = containers.into_iter().next() {
                return Ok(container.id);
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(ProxyError::ProxyNotFound(self.locate_timeout));
            }
            tokio::time::sleep(LOCATE_POLL_INTERVAL).await;
        }
    }
}

#[cfg(unix)]
async fn set_mode(path: &std::path::Path, mode: u32) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(mode)).await
}

#[cfg(not(unix))]
async fn set_mode(_path: &std::path::Path, _mode: u32) -> std::io::Result<()> {
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::deployment::{Deployment, DeploymentInstance};
    use crate::labels::ContainerLabels;

    fn labels(app: &str, domains: Vec<crate::labels::DomainRecord>) -> ContainerLabels {
        ContainerLabels {
            app_name: app.to_string(),
            deployment_id: "1".to_string(),
            domains,
            port: "8080".to_string(),
            acme_email: None,
            max_containers_to_keep: 6,
            health_check_path: "/".to_string(),
        }
    }

    #[test]
    fn sanitize_replaces_dots() {
        assert_eq!(ProxyManager::sanitize("www.example.com"), "www_example_com");
    }

    #[test]
    fn render_produces_backend_and_acl_sections() {
        let mut deployments = DeploymentSet::new();
        deployments.insert(
            "web".to_string(),
            Deployment {
                labels: labels(
                    "web",
                    vec![crate::labels::DomainRecord {
                        canonical: "example.com".to_string(),
                        aliases: vec!["www.example.com".to_string()],
                    }],
                ),
                instances: vec![DeploymentInstance {
                    container_id: "c1".to_string(),
                    ip: "10.0.0.2".to_string(),
                    port: "8080".to_string(),
                }],
            },
        );

        let dir = tempfile::tempdir().unwrap();
        let template_path = dir.path().join("proxy_config.tera");
        std::fs::copy(
            concat!(env!("CARGO_MANIFEST_DIR"), "/templates/proxy_config.tera"),
            &template_path,
        )
        .unwrap();

        let runtime: Arc<dyn ContainerRuntime> = Arc::new(crate::runtime::tests::NullRuntime);
        let manager = ProxyManager::new(
            runtime,
            dir.path().to_path_buf(),
            "haproxy.cfg".to_string(),
            template_path,
            true,
            Duration::from_secs(1),
        );

        let rendered = manager.render(&deployments, dir.path()).unwrap();
        assert!(rendered.contains("backend web"));
        assert!(rendered.contains("example_com_canonical"));
        assert!(rendered.contains("www_example_com_alias"));
    }
}

//! `DeploymentManager` — aggregates app containers into per-app deployments,
//! diffs them against the previous snapshot, and derives the managed domain
//! set consumed by `CertificatesManager` and `ProxyManager` (spec.md §4.2).

use crate::labels::{ContainerLabels, DomainRecord, Role};
use crate::runtime::ContainerRuntime;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// One running instance of a deployment: a container plus its reachable
/// address on the overlay network.
#[derive(Debug, Clone, PartialEq)]
pub struct DeploymentInstance {
    pub container_id: String,
    pub ip: String,
    pub port: String,
}

/// The set of running containers that share the greatest `deploymentID` for
/// a given app name.
#[derive(Debug, Clone, PartialEq)]
pub struct Deployment {
    pub labels: ContainerLabels,
    pub instances: Vec<DeploymentInstance>,
}

impl Deployment {
    pub fn app_name(&self) -> &str {
        &self.labels.app_name
    }

    pub fn deployment_id(&self) -> &str {
        &self.labels.deployment_id
    }

    pub fn domains(&self) -> &[DomainRecord] {
        &self.labels.domains
    }

    fn instance_id_set(&self) -> HashSet<&str> {
        self.instances.iter().map(|i| i.container_id.as_str()).collect()
    }
}

/// `appName -> Deployment`, rebuilt from scratch on every rescan.
pub type DeploymentSet = HashMap<String, Deployment>;

/// A container that failed inspect/label-parse/IP-lookup during a rebuild.
#[derive(Debug, Clone)]
pub struct FailedContainerInfo {
    pub container_id: String,
    pub app_name: Option<String>,
    pub reason: String,
}

/// Result of diffing two `DeploymentSet`s (spec.md §3).
#[derive(Debug, Clone, Default)]
pub struct CompareResult {
    pub added: DeploymentSet,
    pub removed: DeploymentSet,
    pub updated: DeploymentSet,
}

impl CompareResult {
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.updated.is_empty()
    }

    /// Deployments that need a health check: everything newly added or
    /// whose generation/instance set changed (spec.md §4.2).
    pub fn needs_health_check(&self) -> impl Iterator<Item = &Deployment> {
        self.added.values().chain(self.updated.values())
    }
}

fn diff(old: &DeploymentSet, new: &DeploymentSet) -> CompareResult {
    let mut result = CompareResult::default();
    let keys: HashSet<&String> = old.keys().chain(new.keys()).collect();
    for app_name in keys {
        match (old.get(app_name), new.get(app_name)) {
            (Some(old_dep), None) => {
                result.removed.insert(app_name.clone(), old_dep.clone());
            }
            (None, Some(new_dep)) => {
                result.added.insert(app_name.clone(), new_dep.clone());
            }
            (Some(old_dep), Some(new_dep)) => {
                let changed = old_dep.deployment_id() != new_dep.deployment_id()
                    || old_dep.instance_id_set() != new_dep.instance_id_set();
                if changed {
                    result.updated.insert(app_name.clone(), new_dep.clone());
                }
            }
            (None, None) => unreachable!(),
        }
    }
    result
}

/// A domain this core is responsible for obtaining/renewing a certificate
/// for, derived from the current `DeploymentSet` (spec.md §3).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManagedDomain {
    pub canonical: String,
    pub aliases: Vec<String>,
    pub email: Option<String>,
    pub owner_app: String,
}

/// Outcome of `healthCheckNewContainers` (spec.md §4.2).
#[derive(Debug, Default)]
pub struct HealthCheckOutcome {
    pub healthy: Vec<Deployment>,
    pub unhealthy_containers: Vec<String>,
}

impl HealthCheckOutcome {
    pub fn is_all_healthy(&self) -> bool {
        self.unhealthy_containers.is_empty()
    }
}

pub struct DeploymentManager {
    runtime: Arc<dyn ContainerRuntime>,
    overlay_network: String,
    health_check_deadline: Duration,
    snapshot: RwLock<DeploymentSet>,
    /// Sticky `hostname -> owning appName` registry, covering every
    /// canonical *and* alias across all apps, so that domain-conflict
    /// rejection (spec.md §3 "duplicates across ManagedDomains are a
    /// configuration error", §9 Open Questions (c)) is consistent across
    /// rebuilds rather than re-decided arbitrarily on every pass.
    hostname_owners: Mutex<HashMap<String, String>>,
    /// Running instances belonging to non-winning generations, observed at
    /// the last rebuild, newest generation first. Used by the `Updater` to
    /// retire superseded containers once a trigger names the new winner
    /// (spec.md §4.5 step 9).
    superseded: RwLock<HashMap<String, Vec<(String, Vec<String>)>>>,
}

impl DeploymentManager {
    pub fn new(
        runtime: Arc<dyn ContainerRuntime>,
        overlay_network: String,
        health_check_deadline: Duration,
    ) -> Self {
        Self {
            runtime,
            overlay_network,
            health_check_deadline,
            snapshot: RwLock::new(DeploymentSet::new()),
            hostname_owners: Mutex::new(HashMap::new()),
            superseded: RwLock::new(HashMap::new()),
        }
    }

    /// Rescan the container set, rebuild the `DeploymentSet`, and atomically
    /// replace the snapshot. Returns whether anything changed, the compare
    /// result (used to target health checks), and any containers that could
    /// not be parsed/inspected.
    pub async fn rebuild(
        &self,
    ) -> anyhow::Result<(bool, CompareResult, Vec<FailedContainerInfo>)> {
        let summaries = self.runtime.list_running_by_role("app").await?;

        let mut failed = Vec::new();
        // appName -> deploymentID -> (labels, instances)
        let mut groups: HashMap<String, HashMap<String, (ContainerLabels, Vec<DeploymentInstance>)>> =
            HashMap::new();

        for summary in summaries {
            match self.inspect_one(&summary.id).await {
                Ok((labels, instance)) => {
                    let app_entry = groups.entry(labels.app_name.clone()).or_default();
                    let gen_entry = app_entry
                        .entry(labels.deployment_id.clone())
                        .or_insert_with(|| (labels.clone(), Vec::new()));
                    gen_entry.1.push(instance);
                }
                Err(reason) => {
                    warn!(container_id = %summary.id, %reason, "failed to inspect/parse app container");
                    failed.push(FailedContainerInfo {
                        container_id: summary.id,
                        app_name: summary.labels.get(crate::labels::LABEL_APP_NAME).cloned(),
                        reason,
                    });
                }
            }
        }

        let mut new_set = DeploymentSet::new();
        let mut superseded: HashMap<String, Vec<(String, Vec<String>)>> = HashMap::new();
        for (app_name, mut generations) in groups {
            let winning_id = generations.keys().max().cloned();
            if let Some(winning_id) = winning_id {
                let (labels, instances) = generations.remove(&winning_id).unwrap();
                debug!(%app_name, deployment_id = %winning_id, instances = instances.len(), "resolved current deployment");
                new_set.insert(app_name.clone(), Deployment { labels, instances });

                let mut rest: Vec<(String, Vec<String>)> = generations
                    .into_iter()
                    .map(|(gen_id, (_, instances))| {
                        (
                            gen_id,
                            instances.into_iter().map(|i| i.container_id).collect(),
                        )
                    })
                    .collect();
                rest.sort_by(|a, b| b.0.cmp(&a.0));
                if !rest.is_empty() {
                    superseded.insert(app_name, rest);
                }
            }
        }
        *self.superseded.write().await = superseded;

        let previous = {
            let guard = self.snapshot.read().await;
            guard.clone()
        };
        let compare = diff(&previous, &new_set);
        let changed = !compare.is_empty();

        if changed {
            info!(
                added = compare.added.len(),
                removed = compare.removed.len(),
                updated = compare.updated.len(),
                "deployment set changed"
            );
            let mut guard = self.snapshot.write().await;
            *guard = new_set;
        }

        Ok((changed, compare, failed))
    }

    async fn inspect_one(&self, container_id: &str) -> Result<(ContainerLabels, DeploymentInstance), String> {
        let inspect = self
            .runtime
            .inspect(container_id)
            .await
            .map_err(|e| format!("inspect failed: {e}"))?;

        match crate::labels::ContainerLabels::role(container_id, &inspect.labels) {
            Ok(Role::App) => {}
            Ok(Role::Proxy) => return Err("container has role=proxy, not app".to_string()),
            Err(e) => return Err(e.to_string()),
        }

        let labels = ContainerLabels::parse(container_id, &inspect.labels).map_err(|e| e.to_string())?;

        let ip = inspect
            .ip_on_network(&self.overlay_network)
            .ok_or_else(|| format!("not attached to overlay network '{}'", self.overlay_network))?
            .to_string();

        Ok((
            labels.clone(),
            DeploymentInstance {
                container_id: container_id.to_string(),
                ip,
                port: labels.port,
            },
        ))
    }

    /// A deep-enough copy of the current deployment set, safe to read
    /// without holding the manager's lock.
    pub async fn snapshot(&self) -> DeploymentSet {
        self.snapshot.read().await.clone()
    }

    /// Derive the managed domain set from the current snapshot, rejecting
    /// canonical *and alias* hostnames claimed by more than one app — the
    /// whole hostname namespace (every canonical and alias, across every
    /// app) must be unique, since a collision anywhere in it produces
    /// conflicting routing ACLs in the rendered proxy config (spec.md §3
    /// "duplicates across ManagedDomains are a configuration error
    /// surfaced at reconcile time", §9).
    pub async fn certificate_domains(&self) -> Vec<ManagedDomain> {
        let snapshot = self.snapshot.read().await.clone();
        let mut owners = self.hostname_owners.lock().await;

        // Drop stale ownership: apps that disappeared or no longer declare
        // the hostname (canonical or alias) they used to own release it.
        owners.retain(|hostname, owner_app| {
            snapshot
                .get(owner_app)
                .map(|dep| {
                    dep.domains()
                        .iter()
                        .any(|d| &d.canonical == hostname || d.aliases.iter().any(|a| a == hostname))
                })
                .unwrap_or(false)
        });

        let mut app_names: Vec<&String> = snapshot.keys().collect();
        app_names.sort();

        let mut result = Vec::new();
        for app_name in app_names {
            let deployment = &snapshot[app_name];
            for record in deployment.domains() {
                if let Some(owner) = owners.get(&record.canonical) {
                    if owner != app_name {
                        warn!(
                            canonical = %record.canonical,
                            rejected_app = %app_name,
                            owning_app = %owner,
                            "canonical domain already claimed by another app; rejecting later claimant"
                        );
                        continue;
                    }
                }

                // Aliases share the same hostname namespace as every
                // canonical and alias across all apps. Drop only the
                // colliding alias rather than the whole record, so one bad
                // alias doesn't also take down the app's canonical routing.
                let mut aliases = Vec::with_capacity(record.aliases.len());
                for alias in &record.aliases {
                    match owners.get(alias) {
                        Some(owner) if owner != app_name => {
                            warn!(
                                alias = %alias,
                                canonical = %record.canonical,
                                rejected_app = %app_name,
                                owning_app = %owner,
                                "alias already claimed by another app's canonical/alias; dropping it from this record"
                            );
                        }
                        _ => aliases.push(alias.clone()),
                    }
                }

                owners.insert(record.canonical.clone(), app_name.clone());
                for alias in &aliases {
                    owners.insert(alias.clone(), app_name.clone());
                }

                result.push(ManagedDomain {
                    canonical: record.canonical.clone(),
                    aliases,
                    email: deployment.labels.acme_email.clone(),
                    owner_app: app_name.clone(),
                });
            }
        }
        result
    }

    /// Probe instances of added/updated deployments until they report
    /// healthy or the per-instance deadline elapses.
    pub async fn health_check_new_containers(&self, compare: &CompareResult) -> HealthCheckOutcome {
        let mut outcome = HealthCheckOutcome::default();
        for deployment in compare.needs_health_check() {
            let mut all_healthy = true;
            for instance in &deployment.instances {
                if self.wait_until_healthy(&instance.container_id).await {
                    continue;
                }
                all_healthy = false;
                outcome.unhealthy_containers.push(instance.container_id.clone());
            }
            if all_healthy {
                outcome.healthy.push(deployment.clone());
            }
        }
        outcome
    }

    /// Container IDs belonging to generations of `app_name` other than
    /// `current_deployment_id`, ordered newest generation first. Generations
    /// beyond `maxContainersToKeep` are candidates for removal, not just
    /// stopping (spec.md §4.5 step 9).
    pub async fn instances_for_other_generations(
        &self,
        app_name: &str,
        _current_deployment_id: &str,
    ) -> Vec<String> {
        self.superseded
            .read()
            .await
            .get(app_name)
            .map(|generations| {
                generations
                    .iter()
                    .flat_map(|(_, ids)| ids.iter().cloned())
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn wait_until_healthy(&self, container_id: &str) -> bool {
        let deadline = tokio::time::Instant::now() + self.health_check_deadline;
        loop {
            match self.runtime.inspect(container_id).await {
                Ok(info) if info.is_healthy() => return true,
                _ => {}
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500)).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::labels::DomainRecord;

    fn label(app: &str, gen: &str) -> ContainerLabels {
        ContainerLabels {
            app_name: app.to_string(),
            deployment_id: gen.to_string(),
            domains: vec![],
            port: "80".to_string(),
            acme_email: None,
            max_containers_to_keep: 6,
            health_check_path: "/".to_string(),
        }
    }

    fn instance(id: &str) -> DeploymentInstance {
        DeploymentInstance {
            container_id: id.to_string(),
            ip: "10.0.0.1".to_string(),
            port: "80".to_string(),
        }
    }

    #[test]
    fn diff_detects_added_removed_updated() {
        let mut old = DeploymentSet::new();
        old.insert(
            "web".to_string(),
            Deployment {
                labels: label("web", "A"),
                instances: vec![instance("c1")],
            },
        );
        old.insert(
            "gone".to_string(),
            Deployment {
                labels: label("gone", "A"),
                instances: vec![instance("c9")],
            },
        );

        let mut new = DeploymentSet::new();
        new.insert(
            "web".to_string(),
            Deployment {
                labels: label("web", "B"),
                instances: vec![instance("c2")],
            },
        );
        new.insert(
            "fresh".to_string(),
            Deployment {
                labels: label("fresh", "A"),
                instances: vec![instance("c3")],
            },
        );

        let cmp = diff(&old, &new);
        assert!(cmp.added.contains_key("fresh"));
        assert!(cmp.removed.contains_key("gone"));
        assert!(cmp.updated.contains_key("web"));
    }

    #[test]
    fn diff_same_generation_same_instances_is_noop() {
        let mut old = DeploymentSet::new();
        old.insert(
            "web".to_string(),
            Deployment {
                labels: label("web", "A"),
                instances: vec![instance("c1")],
            },
        );
        let new = old.clone();
        let cmp = diff(&old, &new);
        assert!(cmp.is_empty());
    }

    #[test]
    fn diff_same_generation_instance_set_changed_is_updated() {
        let mut old = DeploymentSet::new();
        old.insert(
            "web".to_string(),
            Deployment {
                labels: label("web", "A"),
                instances: vec![instance("c1")],
            },
        );
        let mut new = DeploymentSet::new();
        new.insert(
            "web".to_string(),
            Deployment {
                labels: label("web", "A"),
                instances: vec![instance("c1"), instance("c2")],
            },
        );
        let cmp = diff(&old, &new);
        assert!(cmp.updated.contains_key("web"));
    }

    #[test]
    fn domain_record_roundtrip() {
        let record = DomainRecord {
            canonical: "example.com".to_string(),
            aliases: vec!["www.example.com".to_string()],
        };
        let json = serde_json::to_string(&record).unwrap();
        let back: DomainRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(record, back);
    }

    fn label_with_domains(app: &str, domains: Vec<DomainRecord>) -> ContainerLabels {
        ContainerLabels {
            domains,
            ..label(app, "A")
        }
    }

    fn manager() -> DeploymentManager {
        let runtime: Arc<dyn ContainerRuntime> = Arc::new(crate::runtime::tests::NullRuntime);
        DeploymentManager::new(runtime, "rise_net".to_string(), Duration::from_secs(1))
    }

    #[tokio::test]
    async fn rejects_canonical_claimed_by_two_apps() {
        let mgr = manager();
        let mut set = DeploymentSet::new();
        set.insert(
            "web".to_string(),
            Deployment {
                labels: label_with_domains(
                    "web",
                    vec![DomainRecord {
                        canonical: "example.com".to_string(),
                        aliases: vec![],
                    }],
                ),
                instances: vec![instance("c1")],
            },
        );
        set.insert(
            "impostor".to_string(),
            Deployment {
                labels: label_with_domains(
                    "impostor",
                    vec![DomainRecord {
                        canonical: "example.com".to_string(),
                        aliases: vec![],
                    }],
                ),
                instances: vec![instance("c2")],
            },
        );
        *mgr.snapshot.write().await = set;

        let domains = mgr.certificate_domains().await;
        assert_eq!(domains.len(), 1);
        // App names are processed in sorted order, so "impostor" claims the
        // canonical before "web" is ever considered.
        assert_eq!(domains[0].owner_app, "impostor");
    }

    #[tokio::test]
    async fn drops_alias_claimed_by_another_apps_canonical_or_alias() {
        let mgr = manager();
        let mut set = DeploymentSet::new();
        set.insert(
            "web".to_string(),
            Deployment {
                labels: label_with_domains(
                    "web",
                    vec![DomainRecord {
                        canonical: "example.com".to_string(),
                        aliases: vec!["www.example.com".to_string()],
                    }],
                ),
                instances: vec![instance("c1")],
            },
        );
        set.insert(
            "api".to_string(),
            Deployment {
                labels: label_with_domains(
                    "api",
                    vec![DomainRecord {
                        canonical: "api.example.com".to_string(),
                        // Both collide: one with "web"'s canonical, one
                        // with "web"'s alias.
                        aliases: vec!["example.com".to_string(), "www.example.com".to_string()],
                    }],
                ),
                instances: vec![instance("c2")],
            },
        );
        *mgr.snapshot.write().await = set;

        let domains = mgr.certificate_domains().await;
        let web = domains.iter().find(|d| d.owner_app == "web").unwrap();
        let api = domains.iter().find(|d| d.owner_app == "api").unwrap();
        assert_eq!(web.aliases, vec!["www.example.com".to_string()]);
        assert!(api.aliases.is_empty(), "both aliases collide and should be dropped");
        assert_eq!(api.canonical, "api.example.com");
    }

    #[tokio::test]
    async fn ownership_is_sticky_across_rebuilds_but_released_when_app_drops_hostname() {
        let mgr = manager();

        let mut first = DeploymentSet::new();
        first.insert(
            "web".to_string(),
            Deployment {
                labels: label_with_domains(
                    "web",
                    vec![DomainRecord {
                        canonical: "example.com".to_string(),
                        aliases: vec![],
                    }],
                ),
                instances: vec![instance("c1")],
            },
        );
        *mgr.snapshot.write().await = first;
        let domains = mgr.certificate_domains().await;
        assert_eq!(domains[0].owner_app, "web");

        // "web" no longer declares the hostname; it should become claimable
        // by another app instead of staying stuck to a stale owner.
        let mut second = DeploymentSet::new();
        second.insert(
            "web".to_string(),
            Deployment {
                labels: label_with_domains("web", vec![]),
                instances: vec![instance("c1")],
            },
        );
        second.insert(
            "newowner".to_string(),
            Deployment {
                labels: label_with_domains(
                    "newowner",
                    vec![DomainRecord {
                        canonical: "example.com".to_string(),
                        aliases: vec![],
                    }],
                ),
                instances: vec![instance("c3")],
            },
        );
        *mgr.snapshot.write().await = second;
        let domains = mgr.certificate_domains().await;
        assert_eq!(domains.len(), 1);
        assert_eq!(domains[0].owner_app, "newowner");
    }
}

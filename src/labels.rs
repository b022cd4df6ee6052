//! Parsing of the container label schema described in spec.md §3/§6.
//!
//! The exact encoding of the `domains` label is explicitly out of scope in
//! the source specification; this module fixes one concrete encoding
//! (`rise.domains` as a JSON array) so the rest of the core is runnable.
//! Swapping this parser for a different label scheme should not require
//! touching anything downstream of [`ContainerLabels`].

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use thiserror::Error;

pub const LABEL_ROLE: &str = "rise.role";
pub const LABEL_APP_NAME: &str = "rise.appName";
pub const LABEL_DEPLOYMENT_ID: &str = "rise.deploymentID";
pub const LABEL_DOMAINS: &str = "rise.domains";
pub const LABEL_PORT: &str = "rise.port";
pub const LABEL_ACME_EMAIL: &str = "rise.acmeEmail";
pub const LABEL_MAX_CONTAINERS: &str = "rise.maxContainersToKeep";
pub const LABEL_HEALTH_CHECK_PATH: &str = "rise.healthCheckPath";

const DEFAULT_PORT: &str = "80";
const DEFAULT_MAX_CONTAINERS_TO_KEEP: u32 = 6;
const DEFAULT_HEALTH_CHECK_PATH: &str = "/";

#[derive(Debug, Error, Clone)]
pub enum LabelParseError {
    #[error("container {container_id}: missing required label '{label}'")]
    MissingLabel { container_id: String, label: String },
    #[error("container {container_id}: label '{label}' is not valid: {reason}")]
    InvalidLabel {
        container_id: String,
        label: String,
        reason: String,
    },
    #[error("container {container_id}: unrecognized role '{role}'")]
    UnknownRole { container_id: String, role: String },
}

/// Role a container plays, as declared by the `rise.role` label.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    App,
    Proxy,
}

impl Role {
    fn parse(container_id: &str, raw: &str) -> Result<Self, LabelParseError> {
        match raw {
            "app" => Ok(Role::App),
            "proxy" => Ok(Role::Proxy),
            other => Err(LabelParseError::UnknownRole {
                container_id: container_id.to_string(),
                role: other.to_string(),
            }),
        }
    }
}

/// One canonical domain plus its aliases, as declared in the `domains` label.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainRecord {
    pub canonical: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Fully parsed labels for a single `role=app` container.
#[derive(Debug, Clone, PartialEq)]
pub struct ContainerLabels {
    pub app_name: String,
    pub deployment_id: String,
    pub domains: Vec<DomainRecord>,
    pub port: String,
    pub acme_email: Option<String>,
    pub max_containers_to_keep: u32,
    pub health_check_path: String,
}

impl ContainerLabels {
    /// Parse the label map of a container known to have `role=app`.
    pub fn parse(
        container_id: &str,
        labels: &HashMap<String, String>,
    ) -> Result<Self, LabelParseError> {
        let app_name = required(container_id, labels, LABEL_APP_NAME)?;
        if app_name.trim().is_empty() {
            return Err(LabelParseError::InvalidLabel {
                container_id: container_id.to_string(),
                label: LABEL_APP_NAME.to_string(),
                reason: "must not be empty".to_string(),
            });
        }
        let deployment_id = required(container_id, labels, LABEL_DEPLOYMENT_ID)?;

        let domains = match labels.get(LABEL_DOMAINS) {
            Some(raw) if !raw.trim().is_empty() => {
                parse_domains(container_id, raw)?
            }
            _ => Vec::new(),
        };
        validate_domains(container_id, &domains)?;

        let port = labels
            .get(LABEL_PORT)
            .cloned()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_PORT.to_string());

        let acme_email = labels.get(LABEL_ACME_EMAIL).cloned().filter(|e| !e.is_empty());

        let max_containers_to_keep = match labels.get(LABEL_MAX_CONTAINERS) {
            Some(raw) if !raw.is_empty() => raw.parse::<u32>().map_err(|e| {
                LabelParseError::InvalidLabel {
                    container_id: container_id.to_string(),
                    label: LABEL_MAX_CONTAINERS.to_string(),
                    reason: e.to_string(),
                }
            })?,
            _ => DEFAULT_MAX_CONTAINERS_TO_KEEP,
        };

        let health_check_path = labels
            .get(LABEL_HEALTH_CHECK_PATH)
            .cloned()
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| DEFAULT_HEALTH_CHECK_PATH.to_string());

        Ok(Self {
            app_name,
            deployment_id,
            domains,
            port,
            acme_email,
            max_containers_to_keep,
            health_check_path,
        })
    }

    /// Parse only the `role` label, used by `ContainerSource` to decide
    /// whether a container deserves full label parsing at all.
    pub fn role(container_id: &str, labels: &HashMap<String, String>) -> Result<Role, LabelParseError> {
        let raw = required(container_id, labels, LABEL_ROLE)?;
        Role::parse(container_id, &raw)
    }
}

fn required(
    container_id: &str,
    labels: &HashMap<String, String>,
    label: &str,
) -> Result<String, LabelParseError> {
    labels
        .get(label)
        .filter(|v| !v.is_empty())
        .cloned()
        .ok_or_else(|| LabelParseError::MissingLabel {
            container_id: container_id.to_string(),
            label: label.to_string(),
        })
}

fn parse_domains(container_id: &str, raw: &str) -> Result<Vec<DomainRecord>, LabelParseError> {
    serde_json::from_str(raw).map_err(|e| LabelParseError::InvalidLabel {
        container_id: container_id.to_string(),
        label: LABEL_DOMAINS.to_string(),
        reason: format!("invalid JSON: {e}"),
    })
}

fn validate_domains(
    container_id: &str,
    domains: &[DomainRecord],
) -> Result<(), LabelParseError> {
    for record in domains {
        if record.canonical.trim().is_empty() {
            return Err(LabelParseError::InvalidLabel {
                container_id: container_id.to_string(),
                label: LABEL_DOMAINS.to_string(),
                reason: "canonical domain must not be empty".to_string(),
            });
        }
        let mut seen = std::collections::HashSet::new();
        for alias in &record.aliases {
            if !seen.insert(alias) {
                return Err(LabelParseError::InvalidLabel {
                    container_id: container_id.to_string(),
                    label: LABEL_DOMAINS.to_string(),
                    reason: format!("duplicate alias '{alias}' for canonical '{}'", record.canonical),
                });
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn labels(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn parses_minimal_labels_with_defaults() {
        let l = labels(&[
            (LABEL_APP_NAME, "web"),
            (LABEL_DEPLOYMENT_ID, "01H000A"),
        ]);
        let parsed = ContainerLabels::parse("c1", &l).unwrap();
        assert_eq!(parsed.app_name, "web");
        assert_eq!(parsed.port, "80");
        assert_eq!(parsed.max_containers_to_keep, 6);
        assert_eq!(parsed.health_check_path, "/");
        assert!(parsed.domains.is_empty());
    }

    #[test]
    fn parses_domains_json() {
        let l = labels(&[
            (LABEL_APP_NAME, "web"),
            (LABEL_DEPLOYMENT_ID, "01H000A"),
            (
                LABEL_DOMAINS,
                r#"[{"canonical":"example.com","aliases":["www.example.com"]}]"#,
            ),
        ]);
        let parsed = ContainerLabels::parse("c1", &l).unwrap();
        assert_eq!(parsed.domains.len(), 1);
        assert_eq!(parsed.domains[0].canonical, "example.com");
        assert_eq!(parsed.domains[0].aliases, vec!["www.example.com"]);
    }

    #[test]
    fn rejects_empty_app_name() {
        let l = labels(&[(LABEL_APP_NAME, ""), (LABEL_DEPLOYMENT_ID, "01H000A")]);
        assert!(ContainerLabels::parse("c1", &l).is_err());
    }

    #[test]
    fn rejects_missing_deployment_id() {
        let l = labels(&[(LABEL_APP_NAME, "web")]);
        assert!(matches!(
            ContainerLabels::parse("c1", &l),
            Err(LabelParseError::MissingLabel { .. })
        ));
    }

    #[test]
    fn rejects_duplicate_aliases() {
        let l = labels(&[
            (LABEL_APP_NAME, "web"),
            (LABEL_DEPLOYMENT_ID, "01H000A"),
            (
                LABEL_DOMAINS,
                r#"[{"canonical":"example.com","aliases":["www.example.com","www.example.com"]}]"#,
            ),
        ]);
        assert!(ContainerLabels::parse("c1", &l).is_err());
    }

    #[test]
    fn role_parses_app_and_proxy() {
        let l = labels(&[(LABEL_ROLE, "app")]);
        assert_eq!(ContainerLabels::role("c1", &l).unwrap(), Role::App);
        let l = labels(&[(LABEL_ROLE, "proxy")]);
        assert_eq!(ContainerLabels::role("c1", &l).unwrap(), Role::Proxy);
        let l = labels(&[(LABEL_ROLE, "sidecar")]);
        assert!(ContainerLabels::role("c1", &l).is_err());
    }
}

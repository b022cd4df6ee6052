//! `CertificatesManager` — maintains ACME-issued bundles for every managed
//! domain, serialised behind a single renewal mutex (spec.md §4.3).

pub mod acme;
pub mod artifact;
mod dns;
pub mod http01;

use crate::debounce::KeyedDebouncer;
use crate::deployment::ManagedDomain;
use acme::AcmeClientCache;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Debug, Error)]
pub enum CertificateError {
    #[error("DNS pre-check failed for {canonical}: {source}")]
    DnsPrecheck {
        canonical: String,
        #[source]
        source: dns::DnsPrecheckError,
    },
    #[error("ACME issuance failed for {canonical}: {source}")]
    Acme {
        canonical: String,
        #[source]
        source: acme::AcmeError,
    },
    #[error("failed to write certificate bundle for {canonical}: {source}")]
    Write {
        canonical: String,
        #[source]
        source: std::io::Error,
    },
}

/// One or more domains failed to obtain/renew a certificate during a single
/// `checkRenewals` pass. Returned alongside the renewed list from
/// `refreshSync` so a user-initiated deploy can report failure instead of
/// silently succeeding (spec.md §4.3 `refreshSync`, §7).
#[derive(Debug, Error)]
#[error("{failed} of {total} domain(s) failed certificate renewal: {first}")]
pub struct CertificateBatchError {
    pub errors: Vec<CertificateError>,
    pub failed: usize,
    pub total: usize,
    pub first: String,
}

/// Outcome of a `checkRenewals` pass: the canonicals that were (re)issued,
/// and any per-domain failures encountered along the way (spec.md §4.3).
#[derive(Debug, Default)]
pub struct RenewalOutcome {
    pub renewed: Vec<String>,
    pub failed: Vec<CertificateError>,
}

impl RenewalOutcome {
    /// Turns per-domain failures into a single error the caller can
    /// propagate, if any occurred.
    pub fn into_result(self) -> Result<Vec<String>, CertificateBatchError> {
        if self.failed.is_empty() {
            return Ok(self.renewed);
        }
        let total = self.renewed.len() + self.failed.len();
        let first = self.failed[0].to_string();
        Err(CertificateBatchError {
            failed: self.failed.len(),
            total,
            first,
            errors: self.failed,
        })
    }
}

/// Single debounce key: all renewal checks for the whole instance share one
/// window (spec.md §4.3 "single key, 5 s window").
const RENEWAL_DEBOUNCE_KEY: &str = "renewals";

pub struct CertificatesManager {
    cert_dir: PathBuf,
    renewal_window: chrono::Duration,
    infra_domain: Option<ManagedDomain>,
    acme: AcmeClientCache,
    /// Guarantees at-most-one concurrent `checkRenewals` pass (spec.md §4.3,
    /// §8 property 6).
    renewal_mutex: Mutex<()>,
    debouncer: KeyedDebouncer<&'static str, Vec<ManagedDomain>>,
    signal_tx: mpsc::Sender<&'static str>,
}

impl CertificatesManager {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cert_dir: PathBuf,
        tls_staging: bool,
        renewal_window_days: i64,
        http01_port: u16,
        infra_domain: Option<String>,
        infra_email: Option<String>,
        cert_debounce: Duration,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<&'static str>) {
        let challenge_store = http01::ChallengeStore::new();
        let acme = AcmeClientCache::new(tls_staging, challenge_store.clone(), cert_dir.clone());

        let infra_domain = infra_domain.map(|canonical| ManagedDomain {
            canonical,
            aliases: Vec::new(),
            email: infra_email,
            owner_app: "__infra__".to_string(),
        });

        let (debouncer, mut debounce_rx) =
            KeyedDebouncer::new(cert_debounce, shutdown.clone());
        let (signal_tx, signal_rx) = mpsc::channel(5);

        let manager = Arc::new(Self {
            cert_dir,
            renewal_window: chrono::Duration::days(renewal_window_days),
            infra_domain,
            acme,
            renewal_mutex: Mutex::new(()),
            debouncer,
            signal_tx: signal_tx.clone(),
        });

        // Drain the debounce channel and run `checkRenewals` asynchronously,
        // forwarding a non-blocking "certificates_renewed" notification on
        // success (spec.md §4.3 `refreshAsync`).
        let bg_manager = manager.clone();
        tokio::spawn(async move {
            while let Some((_, domains)) = debounce_rx.recv().await {
                let outcome = bg_manager.check_renewals(domains).await;
                for e in &outcome.failed {
                    error!("background certificate renewal pass failed: {e}");
                }
                if !outcome.renewed.is_empty() {
                    let _ = bg_manager.signal_tx.try_send("certificates_renewed");
                }
            }
        });

        tokio::spawn({
            let port = http01_port;
            async move {
                if let Err(e) = http01::spawn(port, challenge_store).await {
                    error!("failed to start HTTP-01 challenge responder: {e}");
                }
            }
        });

        (manager, signal_rx)
    }

    /// Schedule a renewal pass under the keyed debouncer; returns
    /// immediately. Used for opportunistic refreshes (spec.md §4.3).
    pub async fn refresh_async(&self, domains: Vec<ManagedDomain>) {
        self.debouncer.fire(RENEWAL_DEBOUNCE_KEY, domains).await;
    }

    /// Run `checkRenewals` on the caller's task and return the domains that
    /// were (re)issued alongside any per-domain failures. Used for
    /// user-initiated deploys (spec.md §4.3 `refreshSync`) — callers that
    /// need a deploy to fail on a bad certificate should call
    /// `.into_result()` on the outcome.
    pub async fn refresh_sync(&self, domains: Vec<ManagedDomain>) -> RenewalOutcome {
        self.check_renewals(domains).await
    }

    async fn check_renewals(&self, mut domains: Vec<ManagedDomain>) -> RenewalOutcome {
        let _guard = self.renewal_mutex.lock().await;

        if let Some(infra) = &self.infra_domain {
            if !domains.iter().any(|d| d.canonical == infra.canonical) {
                domains.push(infra.clone());
            }
        }

        let domains = dedup_by_canonical(domains);

        let mut renewed = Vec::new();
        let mut failed = Vec::new();
        for domain in domains {
            match self.reconcile_one(&domain).await {
                Ok(true) => renewed.push(domain.canonical.clone()),
                Ok(false) => {}
                Err(e) => {
                    error!(canonical = %domain.canonical, "certificate reconcile failed: {e}");
                    failed.push(e);
                }
            }
        }
        RenewalOutcome { renewed, failed }
    }

    /// Returns `Ok(true)` if a new certificate was obtained.
    async fn reconcile_one(&self, domain: &ManagedDomain) -> Result<bool, CertificateError> {
        let bundle = artifact::bundle_path(&self.cert_dir, &domain.canonical);
        let expected = artifact::expected_sans(&domain.canonical, &domain.aliases);

        let leaf = artifact::read_leaf_info(&bundle).ok();

        let configuration_changed = match &leaf {
            None => true,
            Some(info) => info.dns_names != expected,
        };
        let expiry_renewal = match &leaf {
            None => false, // already covered by configuration_changed
            Some(info) => {
                let remaining = info.not_after - chrono::Utc::now();
                remaining < self.renewal_window
            }
        };

        if !(configuration_changed || expiry_renewal) {
            return Ok(false);
        }

        if configuration_changed && bundle.exists() {
            self.delete_triple(&domain.canonical);
        }

        self.obtain_certificate(domain, &expected).await?;
        Ok(true)
    }

    async fn obtain_certificate(
        &self,
        domain: &ManagedDomain,
        sans: &[String],
    ) -> Result<(), CertificateError> {
        dns::resolves(&domain.canonical)
            .await
            .map_err(|source| CertificateError::DnsPrecheck {
                canonical: domain.canonical.clone(),
                source,
            })?;

        let email = domain
            .email
            .clone()
            .unwrap_or_else(|| "admin@localhost".to_string());

        let issued = self
            .acme
            .obtain_certificate(&email, sans)
            .await
            .map_err(|source| CertificateError::Acme {
                canonical: domain.canonical.clone(),
                source,
            })?;

        if let Err(e) = self.write_bundle(&domain.canonical, &issued).await {
            warn!(canonical = %domain.canonical, "rolling back partial certificate write: {e}");
            self.delete_triple(&domain.canonical);
            return Err(CertificateError::Write {
                canonical: domain.canonical.clone(),
                source: e,
            });
        }

        info!(canonical = %domain.canonical, sans = ?sans, "obtained certificate");
        Ok(())
    }

    async fn write_bundle(
        &self,
        canonical: &str,
        issued: &acme::IssuedCertificate,
    ) -> std::io::Result<()> {
        tokio::fs::create_dir_all(&self.cert_dir).await?;

        let crt_path = artifact::cert_path(&self.cert_dir, canonical);
        let key_path = artifact::key_path(&self.cert_dir, canonical);
        let bundle_path = artifact::bundle_path(&self.cert_dir, canonical);

        tokio::fs::write(&crt_path, &issued.chain_pem).await?;
        set_mode(&crt_path, 0o644).await?;

        tokio::fs::write(&key_path, &issued.key_pem).await?;
        set_mode(&key_path, 0o600).await?;

        let mut bundle = issued.chain_pem.clone();
        if !bundle.ends_with('\n') {
            bundle.push('\n');
        }
        bundle.push_str(&issued.key_pem);
        tokio::fs::write(&bundle_path, &bundle).await?;
        set_mode(&bundle_path, 0o600).await?;

        Ok(())
    }

    fn delete_triple(&self, canonical: &str) {
        for path in [
            artifact::cert_path(&self.cert_dir, canonical),
            artifact::key_path(&self.cert_dir, canonical),
            artifact::bundle_path(&self.cert_dir, canonical),
        ] {
            if path.exists() {
                if let Err(e) = std::fs::remove_file(&path) {
                    warn!(path = %path.display(), "failed to remove stale certificate artifact: {e}");
                }
            }
        }
    }

    /// Delete `*.crt.key` bundles whose canonical is not in `managed` and
    /// whose leaf certificate is already past expiry (spec.md §4.3
    /// `cleanupExpired`, §8 property 5).
    pub async fn cleanup_expired(&self, managed: &[ManagedDomain]) {
        let managed_canonicals: std::collections::HashSet<&str> =
            managed.iter().map(|d| d.canonical.as_str()).collect();

        let mut entries = match tokio::fs::read_dir(&self.cert_dir).await {
            Ok(e) => e,
            Err(e) => {
                warn!("failed to scan certificate directory for cleanup: {e}");
                return;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let Some(canonical) = file_name.strip_suffix(".crt.key") else {
                continue;
            };
            if managed_canonicals.contains(canonical) {
                continue;
            }

            match artifact::read_leaf_info(&path) {
                Ok(info) if info.not_after < chrono::Utc::now() => {
                    info!(canonical, "deleting expired, unmanaged certificate bundle");
                    self.delete_triple(canonical);
                }
                Ok(_) => {}
                Err(e) => warn!(canonical, "failed to parse certificate during cleanup: {e}"),
            }
        }
    }
}

fn dedup_by_canonical(domains: Vec<ManagedDomain>) -> Vec<ManagedDomain> {
    let mut by_canonical: std::collections::HashMap<String, ManagedDomain> =
        std::collections::HashMap::new();
    for domain in domains {
        by_canonical
            .entry(domain.canonical.clone())
            .and_modify(|existing| {
                if domain.aliases.len() > existing.aliases.len() {
                    *existing = domain.clone();
                }
            })
            .or_insert(domain);
    }
    by_canonical.into_values().collect()
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

    fn domain(canonical: &str, aliases: &[&str]) -> ManagedDomain {
        ManagedDomain {
            canonical: canonical.to_string(),
            aliases: aliases.iter().map(|s| s.to_string()).collect(),
            email: None,
            owner_app: "web".to_string(),
        }
    }

    #[test]
    fn dedup_keeps_entry_with_more_aliases() {
        let domains = vec![
            domain("example.com", &[]),
            domain("example.com", &["www.example.com", "ww2.example.com"]),
        ];
        let result = dedup_by_canonical(domains);
        assert_eq!(result.len(), 1);
        assert_eq!(result[0].aliases.len(), 2);
    }

    #[test]
    fn dedup_tie_keeps_first() {
        let domains = vec![domain("example.com", &["a"]), domain("example.com", &["b"])];
        let result = dedup_by_canonical(domains);
        assert_eq!(result[0].aliases, vec!["a"]);
    }

    fn dns_error(canonical: &str) -> CertificateError {
        CertificateError::DnsPrecheck {
            canonical: canonical.to_string(),
            source: dns::DnsPrecheckError {
                domain: canonical.to_string(),
                cause: "no A/AAAA record".to_string(),
            },
        }
    }

    #[test]
    fn renewal_outcome_with_no_failures_converts_to_ok() {
        let outcome = RenewalOutcome {
            renewed: vec!["example.com".to_string()],
            failed: Vec::new(),
        };
        assert_eq!(outcome.into_result().unwrap(), vec!["example.com"]);
    }

    #[test]
    fn renewal_outcome_with_failures_converts_to_batch_error() {
        let outcome = RenewalOutcome {
            renewed: vec!["ok.example.com".to_string()],
            failed: vec![dns_error("bad.example.com")],
        };
        let err = outcome.into_result().unwrap_err();
        assert_eq!(err.failed, 1);
        assert_eq!(err.total, 2);
        assert!(err.first.contains("bad.example.com"));
        assert_eq!(err.errors.len(), 1);
    }
}

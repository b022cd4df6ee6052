//! ACME v2 client wrapper around `instant-acme`, modelling the
//! "load-or-register, one client per email, double-checked locking" cache
//! described in spec.md §4.3 / §9.

use super::http01::ChallengeStore;
use instant_acme::{
    Account, AccountCredentials, AuthorizationStatus, ChallengeType, Identifier, NewAccount,
    NewOrder, OrderStatus,
};
use rcgen::{CertificateParams, KeyPair};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

pub const LETS_ENCRYPT_PRODUCTION: &str = "https://acme-v02.api.letsencrypt.org/directory";
pub const LETS_ENCRYPT_STAGING: &str = "https://acme-staging-v02.api.letsencrypt.org/directory";

#[derive(Debug, Error)]
pub enum AcmeError {
    #[error("ACME protocol error: {0}")]
    Protocol(#[from] instant_acme::Error),
    #[error("challenge validation failed for {domain}: {detail}")]
    ChallengeFailed { domain: String, detail: String },
    #[error("order did not reach 'ready' before finalization: status={0:?}")]
    OrderNotReady(OrderStatus),
    #[error("certificate generation failed: {0}")]
    CertGeneration(String),
    #[error("account registration failed: {0}")]
    Account(String),
    #[error("account credentials file is corrupt: {0}")]
    CorruptAccountFile(String),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Issued certificate, ready to be written out as a bundle.
pub struct IssuedCertificate {
    pub chain_pem: String,
    pub key_pem: String,
}

/// One cached ACME account, keyed by contact email.
struct CachedAccount {
    account: Account,
}

/// Maps `email -> ACME account client`, with double-checked locking on
/// insert so two concurrent `obtainCertificate` calls for the same email
/// don't each register a fresh account.
pub struct AcmeClientCache {
    directory_url: String,
    challenge_store: ChallengeStore,
    cert_dir: std::path::PathBuf,
    accounts: RwLock<HashMap<String, Arc<CachedAccount>>>,
}

impl AcmeClientCache {
    pub fn new(staging: bool, challenge_store: ChallengeStore, cert_dir: std::path::PathBuf) -> Self {
        Self {
            directory_url: if staging {
                LETS_ENCRYPT_STAGING.to_string()
            } else {
                LETS_ENCRYPT_PRODUCTION.to_string()
            }
            .to_string(),
            challenge_store,
            cert_dir,
            accounts: RwLock::new(HashMap::new()),
        }
    }

    async fn account_for(&self, email: &str) -> Result<Arc<CachedAccount>, AcmeError> {
        if let Some(existing) = self.accounts.read().await.get(email) {
            return Ok(existing.clone());
        }

        let mut guard = self.accounts.write().await;
        if let Some(existing) = guard.get(email) {
            return Ok(existing.clone());
        }

        let account = self.load_or_register(email).await?;
        let cached = Arc::new(CachedAccount { account });
        guard.insert(email.to_string(), cached.clone());
        Ok(cached)
    }

    async fn load_or_register(&self, email: &str) -> Result<Account, AcmeError> {
        let key_path = super::artifact::account_key_path(&self.cert_dir, email);

        if key_path.exists() {
            let raw = tokio::fs::read_to_string(&key_path).await?;
            let credentials: AccountCredentials = serde_json::from_str(&raw)
                .map_err(|e| AcmeError::CorruptAccountFile(e.to_string()))?;
            debug!(%email, "loaded existing ACME account credentials");
            let account = Account::from_credentials(credentials).await?;
            return Ok(account);
        }

        info!(%email, directory = %self.directory_url, "registering new ACME account");
        let (account, credentials) = Account::create(
            &NewAccount {
                contact: &[&format!("mailto:{email}")],
                terms_of_service_agreed: true,
                only_return_existing: false,
            },
            &self.directory_url,
            None,
        )
        .await?;

        if let Some(parent) = key_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let serialized = serde_json::to_string(&credentials)
            .map_err(|e| AcmeError::Account(e.to_string()))?;
        tokio::fs::write(&key_path, &serialized).await?;
        set_mode_0600(&key_path).await?;

        Ok(account)
    }

    /// Request a bundled certificate covering `{canonical} ∪ aliases`,
    /// driving the HTTP-01 challenge flow to completion.
    pub async fn obtain_certificate(
        &self,
        email: &str,
        sans: &[String],
    ) -> Result<IssuedCertificate, AcmeError> {
        let cached = self.account_for(email).await?;
        let account = &cached.account;

        let identifiers: Vec<Identifier> =
            sans.iter().map(|d| Identifier::Dns(d.clone())).collect();

        let mut order = account
            .new_order(&NewOrder {
                identifiers: &identifiers,
            })
            .await?;

        let authorizations = order.authorizations().await?;
        let mut pending_tokens = Vec::new();
        for authz in &authorizations {
            if authz.status == AuthorizationStatus::Valid {
                continue;
            }
            let Identifier::Dns(domain) = &authz.identifier;

            let challenge = authz
                .challenges
                .iter()
                .find(|c| c.r#type == ChallengeType::Http01)
                .ok_or_else(|| AcmeError::ChallengeFailed {
                    domain: domain.clone(),
                    detail: "no HTTP-01 challenge offered".to_string(),
                })?;

            let key_auth = order.key_authorization(challenge);
            self.challenge_store
                .insert(challenge.token.clone(), key_auth.as_str().to_string())
                .await;
            pending_tokens.push(challenge.token.clone());

            order.set_challenge_ready(&challenge.url).await?;
        }

        let result = self.poll_until_ready(&mut order).await;

        for token in &pending_tokens {
            self.challenge_store.remove(token).await;
        }
        result?;

        let key_pair = KeyPair::generate().map_err(|e| AcmeError::CertGeneration(e.to_string()))?;
        let mut params = CertificateParams::new(sans.to_vec())
            .map_err(|e| AcmeError::CertGeneration(e.to_string()))?;
        params.distinguished_name = rcgen::DistinguishedName::new();
        let csr = params
            .serialize_request(&key_pair)
            .map_err(|e| AcmeError::CertGeneration(e.to_string()))?;

        order.finalize(csr.der()).await?;

        let chain_pem = loop {
            match order.certificate().await? {
                Some(pem) => break pem,
                None => tokio::time::sleep(Duration::from_secs(1)).await,
            }
        };

        Ok(IssuedCertificate {
            chain_pem,
            key_pem: key_pair.serialize_pem(),
        })
    }

    async fn poll_until_ready(&self, order: &mut instant_acme::Order) -> Result<(), AcmeError> {
        let mut delay = Duration::from_millis(500);
        for _ in 0..20 {
            let state = order.refresh().await?;
            match state.status {
                OrderStatus::Ready | OrderStatus::Valid => return Ok(()),
                OrderStatus::Invalid => {
                    return Err(AcmeError::ChallengeFailed {
                        domain: "order".to_string(),
                        detail: "order became invalid during validation".to_string(),
                    })
                }
                OrderStatus::Pending | OrderStatus::Processing => {
                    tokio::time::sleep(delay).await;
                    delay = (delay * 2).min(Duration::from_secs(10));
                }
            }
        }
        warn!("order did not reach 'ready' within the polling budget");
        Err(AcmeError::OrderNotReady(OrderStatus::Pending))
    }
}

#[cfg(unix)]
async fn set_mode_0600(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let perms = std::fs::Permissions::from_mode(0o600);
    tokio::fs::set_permissions(path, perms).await
}

#[cfg(not(unix))]
async fn set_mode_0600(_path: &Path) -> std::io::Result<()> {
    Ok(())
}

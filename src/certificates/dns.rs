//! DNS pre-check ahead of an ACME order, so a misconfigured domain fails
//! with operator-readable guidance instead of an opaque ACME timeout
//! (spec.md §4.3 `obtainCertificate`).

use hickory_resolver::config::{ResolverConfig, ResolverOpts};
use hickory_resolver::TokioAsyncResolver;
use thiserror::Error;

#[derive(Debug, Error)]
#[error(
    "DNS pre-check failed for '{domain}': {cause}\n\
     checklist:\n\
     - confirm an A/AAAA record for '{domain}' exists and points at this host\n\
     - confirm the domain's registration has not expired\n\
     - confirm the domain's nameservers are reachable and correctly delegated\n\
     - if this just changed, allow time for DNS propagation and retry"
)]
pub struct DnsPrecheckError {
    pub domain: String,
    pub cause: String,
}

pub async fn resolves(domain: &str) -> Result<(), DnsPrecheckError> {
    let resolver =
        TokioAsyncResolver::tokio(ResolverConfig::default(), ResolverOpts::default());

    match tokio::time::timeout(
        std::time::Duration::from_secs(5),
        resolver.lookup_ip(domain),
    )
    .await
    {
        Ok(Ok(lookup)) if lookup.iter().next().is_some() => Ok(()),
        Ok(Ok(_)) => Err(DnsPrecheckError {
            domain: domain.to_string(),
            cause: "lookup succeeded but returned no addresses".to_string(),
        }),
        Ok(Err(e)) => Err(DnsPrecheckError {
            domain: domain.to_string(),
            cause: e.to_string(),
        }),
        Err(_) => Err(DnsPrecheckError {
            domain: domain.to_string(),
            cause: "DNS lookup timed out after 5s".to_string(),
        }),
    }
}

//! Filesystem layout and PEM/X.509 helpers for certificate bundles
//! (spec.md §3, §6: `<certDir>/<canonical>.{crt,key,crt.key}`).

use std::path::{Path, PathBuf};

pub fn cert_path(cert_dir: &Path, canonical: &str) -> PathBuf {
    cert_dir.join(format!("{canonical}.crt"))
}

pub fn key_path(cert_dir: &Path, canonical: &str) -> PathBuf {
    cert_dir.join(format!("{canonical}.key"))
}

pub fn bundle_path(cert_dir: &Path, canonical: &str) -> PathBuf {
    cert_dir.join(format!("{canonical}.crt.key"))
}

pub fn account_key_path(cert_dir: &Path, email: &str) -> PathBuf {
    cert_dir.join("accounts").join(format!("{}.key", sanitize_email(email)))
}

/// Replace everything but alphanumerics, `.` and `-` with `_` so an email
/// address is safe to use as a filename.
pub fn sanitize_email(email: &str) -> String {
    email
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '.' || c == '-' { c } else { '_' })
        .collect()
}

/// What a parsed leaf certificate tells us about its fitness for a given
/// SAN set (spec.md §4.3 `checkRenewals`).
#[derive(Debug, Clone)]
pub struct LeafInfo {
    pub not_after: chrono::DateTime<chrono::Utc>,
    pub dns_names: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum CertReadError {
    #[error("no such file")]
    NotFound,
    #[error("failed to read file: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to parse PEM: {0}")]
    Pem(String),
    #[error("failed to parse X.509 certificate: {0}")]
    X509(String),
}

/// Parse the leaf certificate out of a `.crt.key` or `.crt` bundle (leaf PEM
/// comes first).
pub fn read_leaf_info(path: &Path) -> Result<LeafInfo, CertReadError> {
    if !path.exists() {
        return Err(CertReadError::NotFound);
    }
    let raw = std::fs::read(path)?;
    let pems = pem::parse_many(&raw).map_err(|e| CertReadError::Pem(e.to_string()))?;
    let leaf = pems
        .iter()
        .find(|p| p.tag() == "CERTIFICATE")
        .ok_or_else(|| CertReadError::Pem("no CERTIFICATE block found".to_string()))?;

    let (_, cert) = x509_parser::parse_x509_certificate(leaf.contents())
        .map_err(|e| CertReadError::X509(e.to_string()))?;

    let not_after = chrono::DateTime::from_timestamp(cert.validity().not_after.timestamp(), 0)
        .ok_or_else(|| CertReadError::X509("invalid notAfter timestamp".to_string()))?;

    let mut dns_names: Vec<String> = cert
        .subject_alternative_name()
        .ok()
        .flatten()
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    x509_parser::extensions::GeneralName::DNSName(d) => Some(d.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();
    dns_names.sort();

    Ok(LeafInfo { not_after, dns_names })
}

/// Sorted `{canonical} ∪ aliases`, used to compare against a leaf's SANs.
pub fn expected_sans(canonical: &str, aliases: &[String]) -> Vec<String> {
    let mut all: Vec<String> = std::iter::once(canonical.to_string())
        .chain(aliases.iter().cloned())
        .collect();
    all.sort();
    all.dedup();
    all
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_email_replaces_special_chars() {
        assert_eq!(sanitize_email("a+b@example.com"), "a_b_example.com");
    }

    #[test]
    fn expected_sans_sorts_and_dedups() {
        let sans = expected_sans(
            "b.example.com",
            &["a.example.com".to_string(), "a.example.com".to_string()],
        );
        assert_eq!(sans, vec!["a.example.com", "b.example.com"]);
    }

    #[test]
    fn read_leaf_info_missing_file() {
        let result = read_leaf_info(Path::new("/nonexistent/path.crt.key"));
        assert!(matches!(result, Err(CertReadError::NotFound)));
    }
}

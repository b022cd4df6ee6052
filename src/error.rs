//! Structured error types shared across the reconciliation core.
//!
//! Per-entity errors (label parsing, certificate issuance, proxy rendering)
//! are defined next to the component that raises them and funnel into
//! [`CoreError`] at the `Updater` boundary, tagged with the stage that
//! failed so log readers can locate it (spec §7).

use thiserror::Error;

/// One stage of `Updater::reconcile`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    Build,
    Health,
    Certs,
    Proxy,
    Retire,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Build => "build",
            Stage::Health => "health",
            Stage::Certs => "certs",
            Stage::Proxy => "proxy",
            Stage::Retire => "retire",
        };
        write!(f, "{name}")
    }
}

/// Top-level error surfaced by a reconcile pass.
///
/// Carries the stage at which the pass aborted plus the underlying cause,
/// so that an operator-facing log line can say exactly where things went
/// wrong without reaching into the source error's internals.
#[derive(Debug, Error)]
#[error("reconcile failed at stage '{stage}': {source}")]
pub struct CoreError {
    pub stage: Stage,
    #[source]
    pub source: anyhow::Error,
}

impl CoreError {
    pub fn new(stage: Stage, source: impl Into<anyhow::Error>) -> Self {
        Self {
            stage,
            source: source.into(),
        }
    }
}

/// Errors raised while health-checking newly added/updated deployments.
#[derive(Debug, Error)]
#[error("containers failed health check: {0:?}")]
pub struct UnhealthyContainersError(pub Vec<String>);

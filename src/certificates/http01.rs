//! Shared HTTP-01 challenge responder.
//!
//! A single small `axum` server answers `/.well-known/acme-challenge/*`
//! for every domain across every email account, backed by an in-memory
//! token store the ACME client populates before asking the directory to
//! validate a challenge (spec.md §4.3, §6).

use axum::{extract::Path as AxumPath, extract::State, http::StatusCode, routing::get, Router};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::info;

#[derive(Clone, Default)]
pub struct ChallengeStore {
    tokens: Arc<RwLock<HashMap<String, String>>>,
}

impl ChallengeStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, token: String, key_authorization: String) {
        self.tokens.write().await.insert(token, key_authorization);
    }

    pub async fn remove(&self, token: &str) {
        self.tokens.write().await.remove(token);
    }

    async fn get(&self, token: &str) -> Option<String> {
        self.tokens.read().await.get(token).cloned()
    }
}

async fn serve_challenge(
    State(store): State<ChallengeStore>,
    AxumPath(token): AxumPath<String>,
) -> Result<String, StatusCode> {
    store.get(&token).await.ok_or(StatusCode::NOT_FOUND)
}

/// Bind and serve the HTTP-01 responder in the background. The proxy
/// forwards `/.well-known/acme-challenge/*` to this port (spec.md §4.3).
pub async fn spawn(port: u16, store: ChallengeStore) -> anyhow::Result<()> {
    let app = Router::new()
        .route("/.well-known/acme-challenge/{token}", get(serve_challenge))
        .with_state(store);

    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!(%addr, "HTTP-01 challenge responder listening");
    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("HTTP-01 challenge responder exited: {e}");
        }
    });
    Ok(())
}

//! Caller secret registry.
//!
//! Valid secrets are read from a JSON file at startup and published into the
//! counter store, where every proxy instance can validate callers against
//! them. The key mirrors its value so a poisoned entry is detectable.

use std::path::Path;

use crate::error::StoreError;
use crate::store::CounterStore;

/// Errors loading the caller secrets file.
#[derive(thiserror::Error, Debug)]
pub enum SecretsError {
    #[error("reading secrets file: {0}")]
    Io(#[from] std::io::Error),
    #[error("secrets file is not a JSON list of strings: {0}")]
    Json(#[from] serde_json::Error),
}

/// Store key holding a valid caller secret.
pub fn secret_key(secret: &str) -> String {
    format!("user:sec:{secret}")
}

/// Store key holding a caller's request count for the current second.
pub fn count_key(secret: &str) -> String {
    format!("user:sec:count:{secret}")
}

/// Parses a secrets file body: a JSON array of opaque tokens.
pub fn parse_secrets(data: &str) -> Result<Vec<String>, serde_json::Error> {
    serde_json::from_str(data)
}

/// Reads and parses a secrets file.
pub fn load_secrets(path: impl AsRef<Path>) -> Result<Vec<String>, SecretsError> {
    let data = std::fs::read_to_string(path)?;
    Ok(parse_secrets(&data)?)
}

/// Publishes every secret to the counter store.
pub async fn publish_secrets(
    store: &dyn CounterStore,
    secrets: &[String],
) -> Result<(), StoreError> {
    for secret in secrets {
        store.put(&secret_key(secret), secret).await?;
    }
    tracing::info!(count = secrets.len(), "caller secrets published");
    Ok(())
}

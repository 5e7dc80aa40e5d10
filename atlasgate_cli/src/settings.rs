//! Proxy settings, read from the environment.

use std::fmt::Display;
use std::str::FromStr;

use anyhow::{anyhow, bail, Result};
use atlasgate_lib::RedisSettings;

const DEFAULT_REQUESTS_PER_SECOND: u32 = 5;
const DEFAULT_STORE_MAX_RETRIES: u32 = 5;
const DEFAULT_SECRETS_FILE: &str = "./secrets.json";

/// Everything the proxy needs to start, with the environment variable each
/// field comes from.
#[derive(Debug, Clone)]
pub struct Settings {
    /// `ATLAS_URL`
    pub atlas_url: String,
    /// `ATLAS_SECRET` (required)
    pub atlas_secret: String,
    /// `REDIS_HOST`, `REDIS_PORT`, `REDIS_USER`, `REDIS_PASSWORD`, `REDIS_DB`
    pub redis: RedisSettings,
    /// `REDIS_MAX_RETRIES`
    pub store_max_retries: u32,
    /// `USERS_SECRETS_FILE`
    pub secrets_file: String,
    /// `DS_REQUESTS_PER_SECOND`
    pub requests_per_second: u32,
    /// `MAX_WAITING_REQUESTS`; unset keeps the limiter's own default bound.
    pub max_waiting_requests: Option<u64>,
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let Some(atlas_secret) = non_empty_env("ATLAS_SECRET") else {
            bail!("env variable ATLAS_SECRET is not set");
        };

        let redis = RedisSettings {
            host: env_or("REDIS_HOST", "localhost"),
            port: parsed_env("REDIS_PORT")?.unwrap_or(6379),
            username: non_empty_env("REDIS_USER"),
            password: non_empty_env("REDIS_PASSWORD"),
            db: parsed_env("REDIS_DB")?.unwrap_or(0),
        };

        Ok(Self {
            atlas_url: env_or("ATLAS_URL", atlasgate_lib::atlas_api::DEFAULT_BASE_URL),
            atlas_secret,
            redis,
            store_max_retries: parsed_env("REDIS_MAX_RETRIES")?
                .unwrap_or(DEFAULT_STORE_MAX_RETRIES),
            secrets_file: env_or("USERS_SECRETS_FILE", DEFAULT_SECRETS_FILE),
            requests_per_second: parsed_env("DS_REQUESTS_PER_SECOND")?
                .unwrap_or(DEFAULT_REQUESTS_PER_SECOND),
            max_waiting_requests: parsed_env("MAX_WAITING_REQUESTS")?,
        })
    }
}

fn non_empty_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|value| !value.is_empty())
}

fn env_or(name: &str, default: &str) -> String {
    non_empty_env(name).unwrap_or_else(|| default.to_string())
}

fn parsed_env<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: Display,
{
    match non_empty_env(name) {
        None => Ok(None),
        Some(raw) => raw
            .parse()
            .map(Some)
            .map_err(|err| anyhow!("converting `{name}` value {raw:?}: {err}")),
    }
}

//! The `serve` subcommand: run the proxy.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use atlasgate_lib::atlas_api::{AtlasClient, UpstreamLimiter};
use atlasgate_lib::{
    load_secrets, publish_secrets, router, AppState, CounterStore, DownstreamLimiter, RedisStore,
};
use clap::Args;
use tokio::net::TcpListener;

use crate::settings::Settings;

/// Deadline for the startup reachability probe against the counter store.
const STORE_PING_DEADLINE: Duration = Duration::from_secs(2);

const DEFAULT_PORT: u16 = 80;

#[derive(Args, Debug)]
pub struct ServeArgs {
    /// TCP port to listen on
    #[arg(long, default_value_t = DEFAULT_PORT)]
    pub port: u16,
}

impl Default for ServeArgs {
    fn default() -> Self {
        Self { port: DEFAULT_PORT }
    }
}

pub async fn run(args: ServeArgs) -> Result<()> {
    let settings = Settings::from_env()?;

    let store = RedisStore::connect(&settings.redis)
        .await
        .context("connecting to the counter store")?;
    store
        .ping(STORE_PING_DEADLINE)
        .await
        .context("counter store is unreachable")?;
    let store: Arc<dyn CounterStore> = Arc::new(store);

    let secrets = load_secrets(&settings.secrets_file)
        .with_context(|| format!("loading secrets from {}", settings.secrets_file))?;
    publish_secrets(store.as_ref(), &secrets).await?;

    let atlas = AtlasClient::new(&settings.atlas_url, &settings.atlas_secret)?;
    let initial = atlas
        .probe()
        .await
        .context("probing the upstream rate limits")?;
    tracing::info!(
        limit = initial.limit,
        remaining = initial.remaining,
        "upstream rate limits learned"
    );
    let upstream = UpstreamLimiter::new(&initial, settings.max_waiting_requests);

    let downstream = DownstreamLimiter::new(
        Arc::clone(&store),
        settings.requests_per_second,
        settings.store_max_retries,
    );

    let app = router(AppState::new(atlas, upstream, downstream));
    let listener = TcpListener::bind(("0.0.0.0", args.port))
        .await
        .with_context(|| format!("binding port {}", args.port))?;
    tracing::info!(port = args.port, "atlasgate listening");
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    store.close().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!(%err, "listening for the shutdown signal");
    }
}

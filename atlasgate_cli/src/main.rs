//! `atlasgate` — a rate-limiting reverse proxy in front of the Atlas esports
//! data API, plus a small load-generation tool for poking at a running proxy.

mod commands;
mod settings;

use anyhow::Result;
use clap::{Parser, Subcommand};

/// Top-level CLI structure parsed by clap.
#[derive(Parser)]
#[command(name = "atlasgate")]
#[command(about = "Rate-limiting reverse proxy for the Atlas esports data API")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

/// Available subcommands; `serve` is the default.
#[derive(Subcommand)]
enum Commands {
    /// Run the proxy
    Serve(commands::serve::ServeArgs),
    /// Hammer a running proxy with simulated clients
    Stress(commands::stress::StressArgs),
    /// Inspect a caller secrets file
    Secrets(commands::secrets::SecretsArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load .env if present (silently ignore if missing)
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("atlasgate_cli=info".parse().unwrap())
                .add_directive("atlasgate_lib=info".parse().unwrap())
                .add_directive("atlas_api=info".parse().unwrap()),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    match cli.command.unwrap_or_default() {
        Commands::Serve(args) => commands::serve::run(args).await,
        Commands::Stress(args) => commands::stress::run(args).await,
        Commands::Secrets(args) => commands::secrets::run(&args),
    }
}

impl Default for Commands {
    fn default() -> Self {
        Self::Serve(commands::serve::ServeArgs::default())
    }
}

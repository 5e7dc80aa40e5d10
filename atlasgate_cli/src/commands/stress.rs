//! The `stress` subcommand: simulated clients against a running proxy.
//!
//! Each simulated client takes one secret from the secrets file and sends
//! `rounds` requests with a fixed pause between them, printing the returned
//! status per request. Useful for watching both limiters under load.

use std::time::Duration;

use anyhow::{bail, Result};
use atlasgate_lib::atlas_api::{
    BURST_HEADER, LIMIT_HEADER, REMAINING_HEADER, RESET_HEADER, RETRY_AFTER_HEADER,
};
use atlasgate_lib::{load_secrets, CALLER_SECRET_HEADER};
use clap::Args;
use tokio::task::JoinSet;

#[derive(Args, Debug)]
pub struct StressArgs {
    /// Proxy endpoint to hit
    #[arg(long, default_value = "http://localhost:80/teams/live")]
    pub endpoint: String,
    /// Caller secrets file
    #[arg(long, default_value = "./secrets.json")]
    pub secrets: String,
    /// Records to take per request
    #[arg(long, default_value_t = 1)]
    pub take: u64,
    /// Records to skip per request
    #[arg(long, default_value_t = 0)]
    pub skip: u64,
    /// Pause between a client's requests, in milliseconds
    #[arg(long, default_value_t = 1_000)]
    pub pause: u64,
    /// Requests each client sends
    #[arg(long, default_value_t = 3)]
    pub rounds: u32,
    /// Simulated clients, one secret each
    #[arg(long, default_value_t = 5)]
    pub clients: usize,
    /// Print the response bodies
    #[arg(long)]
    pub print: bool,
}

pub async fn run(args: StressArgs) -> Result<()> {
    let secrets = load_secrets(&args.secrets)?;
    if args.clients < 1 || args.clients > secrets.len() {
        bail!(
            "expected a client count in the range [1 .. {}]",
            secrets.len()
        );
    }

    let client = reqwest::Client::new();
    let mut tasks = JoinSet::new();
    for secret in secrets.into_iter().take(args.clients) {
        let client = client.clone();
        let endpoint = args.endpoint.clone();
        let (take, skip, pause, rounds, print) =
            (args.take, args.skip, args.pause, args.rounds, args.print);
        tasks.spawn(async move {
            for _ in 0..rounds {
                send_request(&client, &endpoint, &secret, take, skip, print).await;
                tokio::time::sleep(Duration::from_millis(pause)).await;
            }
        });
    }
    while let Some(finished) = tasks.join_next().await {
        finished?;
    }
    Ok(())
}

async fn send_request(
    client: &reqwest::Client,
    endpoint: &str,
    secret: &str,
    take: u64,
    skip: u64,
    print: bool,
) {
    let request = client
        .get(endpoint)
        .query(&[("take", take.to_string()), ("skip", skip.to_string())])
        .header(CALLER_SECRET_HEADER, secret);
    let response = match request.send().await {
        Ok(response) => response,
        Err(err) => {
            eprintln!("{secret}: {err}");
            return;
        }
    };
    tracing::debug!(
        limit = header_value(&response, LIMIT_HEADER),
        burst = header_value(&response, BURST_HEADER),
        remaining = header_value(&response, REMAINING_HEADER),
        reset = header_value(&response, RESET_HEADER),
        retry_after = header_value(&response, RETRY_AFTER_HEADER),
        "rate limit headers"
    );
    println!("{secret} {}", response.status());
    if print {
        match response.text().await {
            Ok(body) => println!("{body}"),
            Err(err) => eprintln!("{secret}: reading body: {err}"),
        }
    }
}

fn header_value<'a>(response: &'a reqwest::Response, name: &str) -> &'a str {
    response
        .headers()
        .get(name)
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
}

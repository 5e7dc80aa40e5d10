//! The `secrets` subcommand: inspect a caller secrets file.

use anyhow::Result;
use atlasgate_lib::load_secrets;
use clap::Args;

#[derive(Args, Debug)]
pub struct SecretsArgs {
    /// Caller secrets file
    #[arg(long, default_value = "./secrets.json")]
    pub file: String,
    /// List the secrets instead of only counting them
    #[arg(long)]
    pub list: bool,
}

pub fn run(args: &SecretsArgs) -> Result<()> {
    let secrets = load_secrets(&args.file)?;
    println!("{} secrets", secrets.len());
    if args.list {
        for secret in &secrets {
            println!("{secret}");
        }
    }
    Ok(())
}

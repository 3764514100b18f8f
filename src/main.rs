use clap::Parser;

use tonlink::cli::{self, Cli};
use tonlink::config::Config;
use tonlink::logging;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Commands that need a valid config report the error themselves.
    match Config::from_env_with_toml(cli.config.as_deref()) {
        Ok(config) => logging::init_from_config(&config.logging),
        Err(_) => logging::init("info", false),
    }

    cli::run(cli).await
}

//! Command-line interface.

pub mod doctor;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};

use crate::config::Config;
use crate::protocol::{HttpManifestLoader, ManifestLoader};
use crate::settings::Settings;
use crate::store::{AppRegistry, CursorStore, FileVault, Vault};
use crate::wallet::WalletAddress;

#[derive(Parser, Debug)]
#[command(name = "tonlink", version, about = "Wallet-side TON Connect engine")]
pub struct Cli {
    /// Explicit TOML config file instead of ~/.tonlink/config.toml.
    #[arg(long, global = true, env = "TONLINK_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Parse a connection deeplink and print its parameters.
    Parse { deeplink: String },

    /// Parse a deeplink and fetch the app manifest.
    Handshake { deeplink: String },

    /// List apps connected to a wallet.
    Apps {
        /// Wallet address, raw (`0:abcd...`) or user-friendly.
        wallet: String,
    },

    /// Print the last processed bridge event id.
    Cursor,

    /// Manage the configuration file.
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },

    /// Check configuration, vault and remote services.
    Doctor {
        /// Exit non-zero when any check fails.
        #[arg(long)]
        strict: bool,
    },
}

#[derive(Subcommand, Debug)]
pub enum ConfigCommand {
    /// Write a default config file and generate a vault key.
    Init {
        /// Overwrite an existing config file.
        #[arg(long)]
        force: bool,
    },
    /// Print every effective setting.
    Show,
    /// Print one setting by dotted path, e.g. `bridge.ttl_secs`.
    Get { path: String },
}

pub async fn run(cli: Cli) -> anyhow::Result<()> {
    let toml_path = cli.config.as_deref();
    match cli.command {
        Command::Parse { deeplink } => {
            let parameters = crate::protocol::parse(&deeplink)?;
            println!("{}", serde_json::to_string_pretty(&parameters)?);
        }
        Command::Handshake { deeplink } => {
            let config = Config::from_env_with_toml(toml_path)?;
            let parameters = crate::protocol::parse(&deeplink)?;
            let loader = HttpManifestLoader::new(&config.manifest);
            let manifest = loader.load(parameters.manifest_url()).await?;
            let out = serde_json::json!({
                "parameters": parameters,
                "manifest": manifest,
            });
            println!("{}", serde_json::to_string_pretty(&out)?);
        }
        Command::Apps { wallet } => {
            let config = Config::from_env_with_toml(toml_path)?;
            let wallet: WalletAddress = wallet.parse()?;
            let registry = AppRegistry::new(open_vault(&config)?);
            let apps = registry.get(&wallet).await?;
            if apps.is_empty() {
                println!("No apps connected to {wallet}");
            }
            for app in apps {
                println!(
                    "{}  {}  {}  connected {}",
                    app.client_id,
                    app.manifest.name,
                    app.manifest.url,
                    app.connected_at.to_rfc3339()
                );
            }
        }
        Command::Cursor => {
            let config = Config::from_env_with_toml(toml_path)?;
            let cursor = CursorStore::new(open_vault(&config)?);
            match cursor.last_event_id().await? {
                Some(id) => println!("{id}"),
                None => println!("No bridge events processed yet"),
            }
        }
        Command::Config { command } => run_config_command(command, toml_path)?,
        Command::Doctor { strict } => doctor::run_doctor_command(toml_path, strict).await?,
    }
    Ok(())
}

fn open_vault(config: &Config) -> anyhow::Result<Arc<dyn Vault>> {
    let key = config.vault.require_master_key()?;
    let vault = FileVault::new(&config.vault.dir, key)
        .with_context(|| format!("opening vault at {}", config.vault.dir.display()))?;
    Ok(Arc::new(vault))
}

fn run_config_command(command: ConfigCommand, toml_path: Option<&Path>) -> anyhow::Result<()> {
    let path = toml_path
        .map(PathBuf::from)
        .unwrap_or_else(Settings::default_toml_path);

    match command {
        ConfigCommand::Init { force } => {
            if path.exists() && !force {
                anyhow::bail!(
                    "{} already exists; pass --force to overwrite",
                    path.display()
                );
            }
            Settings::default()
                .save_toml(&path)
                .map_err(anyhow::Error::msg)?;
            println!("Wrote {}", path.display());

            let env_path = crate::bootstrap::tonlink_env_path();
            if crate::bootstrap::ensure_vault_key(&env_path)? {
                println!("Generated vault key in {}", env_path.display());
            }
        }
        ConfigCommand::Show => {
            crate::bootstrap::load_tonlink_env();
            for (key, value) in effective_settings(&path)?.list() {
                println!("{key} = {value}");
            }
        }
        ConfigCommand::Get { path: key } => {
            crate::bootstrap::load_tonlink_env();
            match effective_settings(&path)?.get(&key) {
                Some(value) => println!("{value}"),
                None => anyhow::bail!("unknown setting '{key}'"),
            }
        }
    }
    Ok(())
}

/// Settings as the engine would see them: defaults, then the file, then env.
fn effective_settings(path: &Path) -> anyhow::Result<Settings> {
    let mut settings = Settings::default();
    if let Some(file) = Settings::load_toml(path).map_err(anyhow::Error::msg)? {
        settings.merge_from(&file);
    }
    Config::overlay_env(&mut settings)?;
    Ok(settings)
}

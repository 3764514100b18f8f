//! Configuration for tonlink.
//!
//! Settings are resolved with priority: env var > TOML file > default.
//! The vault master key only ever comes from the environment
//! (`TONLINK_VAULT_KEY`, loadable from `~/.tonlink/.env`).

pub(crate) mod helpers;

use std::path::{Path, PathBuf};

use secrecy::SecretString;
use url::Url;

use crate::error::ConfigError;
use crate::settings::{Settings, tonlink_home};
use crate::wallet::Network;

/// Highest connect protocol version this wallet speaks.
pub const MAX_PROTOCOL_VERSION: u8 = 2;

/// Resolved configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub bridge: BridgeConfig,
    pub chain: ChainConfig,
    pub manifest: ManifestConfig,
    pub device: DeviceConfig,
    pub vault: VaultConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone)]
pub struct BridgeConfig {
    pub url: String,
    pub ttl_secs: u64,
    pub timeout_ms: u64,
}

impl BridgeConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let url = helpers::optional_env("TONLINK_BRIDGE_URL")?
            .unwrap_or_else(|| settings.bridge.url.clone());
        validate_http_url("TONLINK_BRIDGE_URL", &url)?;

        let ttl_secs = helpers::require_positive(
            "TONLINK_BRIDGE_TTL_SECS",
            helpers::parse_env_or("TONLINK_BRIDGE_TTL_SECS", settings.bridge.ttl_secs)?,
        )?;
        let timeout_ms = helpers::require_positive(
            "TONLINK_BRIDGE_TIMEOUT_MS",
            helpers::parse_env_or("TONLINK_BRIDGE_TIMEOUT_MS", settings.bridge.timeout_ms)?,
        )?;

        Ok(Self {
            url,
            ttl_secs,
            timeout_ms,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub network: Network,
    pub api_url: String,
    pub api_key: Option<SecretString>,
    pub timeout_ms: u64,
}

fn parse_network(value: &str, key: &str) -> Result<Network, ConfigError> {
    match normalize_variant(value).as_str() {
        "mainnet" | "-239" => Ok(Network::Mainnet),
        "testnet" | "-3" => Ok(Network::Testnet),
        _ => Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected 'mainnet' or 'testnet', got '{value}'"),
        }),
    }
}

fn default_api_url(network: Network) -> &'static str {
    match network {
        Network::Mainnet => "https://tonapi.io",
        Network::Testnet => "https://testnet.tonapi.io",
    }
}

impl ChainConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let network = parse_network(
            &helpers::optional_env("TONLINK_NETWORK")?
                .unwrap_or_else(|| settings.chain.network.clone()),
            "TONLINK_NETWORK",
        )?;

        let api_url = helpers::optional_env("TONLINK_CHAIN_API_URL")?
            .or_else(|| settings.chain.api_url.clone())
            .unwrap_or_else(|| default_api_url(network).to_string());
        validate_http_url("TONLINK_CHAIN_API_URL", &api_url)?;

        let api_key = helpers::optional_env("TONLINK_CHAIN_API_KEY")?.map(SecretString::from);

        let timeout_ms = helpers::require_positive(
            "TONLINK_CHAIN_TIMEOUT_MS",
            helpers::parse_env_or("TONLINK_CHAIN_TIMEOUT_MS", settings.chain.timeout_ms)?,
        )?;

        Ok(Self {
            network,
            api_url,
            api_key,
            timeout_ms,
        })
    }
}

#[derive(Debug, Clone)]
pub struct ManifestConfig {
    pub timeout_ms: u64,
    pub max_bytes: usize,
}

impl ManifestConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let timeout_ms = helpers::require_positive(
            "TONLINK_MANIFEST_TIMEOUT_MS",
            helpers::parse_env_or("TONLINK_MANIFEST_TIMEOUT_MS", settings.manifest.timeout_ms)?,
        )?;
        let max_bytes =
            helpers::parse_env_or("TONLINK_MANIFEST_MAX_BYTES", settings.manifest.max_bytes)?;
        if max_bytes == 0 {
            return Err(ConfigError::InvalidValue {
                key: "TONLINK_MANIFEST_MAX_BYTES".to_string(),
                message: "must be > 0".to_string(),
            });
        }
        Ok(Self {
            timeout_ms,
            max_bytes,
        })
    }
}

impl Default for ManifestConfig {
    fn default() -> Self {
        let settings = crate::settings::ManifestSettings::default();
        Self {
            timeout_ms: settings.timeout_ms,
            max_bytes: settings.max_bytes,
        }
    }
}

/// Wallet identity advertised in connect events.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub app_name: String,
    pub app_version: String,
    pub platform: String,
    pub max_protocol_version: u8,
    pub max_messages: usize,
}

impl DeviceConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let app_name = helpers::optional_env("TONLINK_APP_NAME")?
            .unwrap_or_else(|| settings.device.app_name.clone());
        let max_messages =
            helpers::parse_env_or("TONLINK_MAX_MESSAGES", settings.device.max_messages)?;
        if max_messages == 0 || max_messages > 255 {
            return Err(ConfigError::InvalidValue {
                key: "TONLINK_MAX_MESSAGES".to_string(),
                message: format!("must be between 1 and 255, got {max_messages}"),
            });
        }

        Ok(Self {
            app_name,
            app_version: settings.device.app_version.clone(),
            platform: settings.device.platform.clone(),
            max_protocol_version: MAX_PROTOCOL_VERSION,
            max_messages,
        })
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let settings = crate::settings::DeviceSettings::default();
        Self {
            app_name: settings.app_name,
            app_version: settings.app_version,
            platform: settings.platform,
            max_protocol_version: MAX_PROTOCOL_VERSION,
            max_messages: settings.max_messages,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VaultConfig {
    pub dir: PathBuf,
    pub master_key: Option<SecretString>,
}

impl VaultConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        let dir = helpers::optional_env("TONLINK_VAULT_DIR")?
            .map(PathBuf::from)
            .or_else(|| settings.vault.dir.clone())
            .unwrap_or_else(default_vault_dir);
        let master_key = helpers::optional_env("TONLINK_VAULT_KEY")?.map(SecretString::from);
        Ok(Self { dir, master_key })
    }

    pub fn require_master_key(&self) -> Result<&SecretString, ConfigError> {
        self.master_key
            .as_ref()
            .ok_or_else(|| ConfigError::MissingRequired {
                key: "TONLINK_VAULT_KEY".to_string(),
                hint: "Set it in the environment or in ~/.tonlink/.env".to_string(),
            })
    }
}

#[derive(Debug, Clone)]
pub struct LoggingConfig {
    pub filter: String,
    pub json: bool,
}

impl LoggingConfig {
    pub(crate) fn resolve(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            filter: helpers::optional_env("TONLINK_LOG")?
                .unwrap_or_else(|| settings.logging.filter.clone()),
            json: helpers::parse_bool_env("TONLINK_LOG_JSON", settings.logging.json)?,
        })
    }
}

fn normalize_variant(value: &str) -> String {
    value.trim().to_ascii_lowercase().replace([' '], "_")
}

fn validate_http_url(key: &str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|e| ConfigError::InvalidValue {
        key: key.to_string(),
        message: format!("not a URL: {e}"),
    })?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(ConfigError::InvalidValue {
            key: key.to_string(),
            message: format!("expected an http(s) URL, got scheme '{}'", url.scheme()),
        });
    }
    Ok(())
}

fn default_vault_dir() -> PathBuf {
    tonlink_home().join("vault")
}

impl Config {
    /// Load configuration from env vars and the default TOML file.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_env_with_toml(None)
    }

    /// Load from env with an optional explicit TOML config file.
    pub fn from_env_with_toml(toml_path: Option<&Path>) -> Result<Self, ConfigError> {
        crate::bootstrap::load_tonlink_env();
        let mut settings = Settings::default();
        Self::apply_toml_overlay(&mut settings, toml_path)?;
        Self::build(&settings)
    }

    /// Load and merge a TOML config file into settings.
    ///
    /// If `explicit_path` is `Some`, loads from that path (errors are fatal).
    /// If `None`, tries `~/.tonlink/config.toml` (missing file is ignored).
    fn apply_toml_overlay(
        settings: &mut Settings,
        explicit_path: Option<&Path>,
    ) -> Result<(), ConfigError> {
        let path = explicit_path
            .map(PathBuf::from)
            .unwrap_or_else(Settings::default_toml_path);

        match Settings::load_toml(&path) {
            Ok(Some(toml_settings)) => {
                settings.merge_from(&toml_settings);
                tracing::debug!("Loaded TOML config from {}", path.display());
            }
            Ok(None) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Config file not found: {}",
                        path.display()
                    )));
                }
            }
            Err(e) => {
                if explicit_path.is_some() {
                    return Err(ConfigError::ParseError(format!(
                        "Failed to load config file {}: {}",
                        path.display(),
                        e
                    )));
                }
                tracing::warn!("Failed to load default config file: {}", e);
            }
        }
        Ok(())
    }

    /// Fold the non-secret env overrides into `settings`.
    ///
    /// Uses the same keys as [`Config::build`]. API and vault keys never
    /// land in settings.
    pub fn overlay_env(settings: &mut Settings) -> Result<(), ConfigError> {
        if let Some(url) = helpers::optional_env("TONLINK_BRIDGE_URL")? {
            settings.bridge.url = url;
        }
        settings.bridge.ttl_secs =
            helpers::parse_env_or("TONLINK_BRIDGE_TTL_SECS", settings.bridge.ttl_secs)?;
        settings.bridge.timeout_ms =
            helpers::parse_env_or("TONLINK_BRIDGE_TIMEOUT_MS", settings.bridge.timeout_ms)?;

        if let Some(network) = helpers::optional_env("TONLINK_NETWORK")? {
            settings.chain.network = network;
        }
        if let Some(api_url) = helpers::optional_env("TONLINK_CHAIN_API_URL")? {
            settings.chain.api_url = Some(api_url);
        }
        settings.chain.timeout_ms =
            helpers::parse_env_or("TONLINK_CHAIN_TIMEOUT_MS", settings.chain.timeout_ms)?;

        settings.manifest.timeout_ms =
            helpers::parse_env_or("TONLINK_MANIFEST_TIMEOUT_MS", settings.manifest.timeout_ms)?;
        settings.manifest.max_bytes =
            helpers::parse_env_or("TONLINK_MANIFEST_MAX_BYTES", settings.manifest.max_bytes)?;

        if let Some(app_name) = helpers::optional_env("TONLINK_APP_NAME")? {
            settings.device.app_name = app_name;
        }
        settings.device.max_messages =
            helpers::parse_env_or("TONLINK_MAX_MESSAGES", settings.device.max_messages)?;

        if let Some(dir) = helpers::optional_env("TONLINK_VAULT_DIR")? {
            settings.vault.dir = Some(PathBuf::from(dir));
        }

        if let Some(filter) = helpers::optional_env("TONLINK_LOG")? {
            settings.logging.filter = filter;
        }
        settings.logging.json = helpers::parse_bool_env("TONLINK_LOG_JSON", settings.logging.json)?;
        Ok(())
    }

    /// Resolve every section from settings plus env overrides.
    pub fn build(settings: &Settings) -> Result<Self, ConfigError> {
        Ok(Self {
            bridge: BridgeConfig::resolve(settings)?,
            chain: ChainConfig::resolve(settings)?,
            manifest: ManifestConfig::resolve(settings)?,
            device: DeviceConfig::resolve(settings)?,
            vault: VaultConfig::resolve(settings)?,
            logging: LoggingConfig::resolve(settings)?,
        })
    }
}

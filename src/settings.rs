//! User settings persisted as TOML.
//!
//! Every field is defaulted so a partial `config.toml` is valid. Values are
//! resolved into typed config by [`crate::config::Config`], where env vars
//! take priority over this file.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct Settings {
    #[serde(default)]
    pub bridge: BridgeSettings,

    #[serde(default)]
    pub chain: ChainSettings,

    #[serde(default)]
    pub manifest: ManifestSettings,

    #[serde(default)]
    pub device: DeviceSettings,

    #[serde(default)]
    pub vault: VaultSettings,

    #[serde(default)]
    pub logging: LoggingSettings,
}

/// Relay endpoint and message lifetime.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BridgeSettings {
    #[serde(default = "default_bridge_url")]
    pub url: String,

    /// Seconds the relay keeps an undelivered message.
    #[serde(default = "default_bridge_ttl_secs")]
    pub ttl_secs: u64,

    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_bridge_url() -> String {
    "https://bridge.tonapi.io/bridge".to_string()
}

fn default_bridge_ttl_secs() -> u64 {
    300
}

fn default_http_timeout_ms() -> u64 {
    15_000
}

impl Default for BridgeSettings {
    fn default() -> Self {
        Self {
            url: default_bridge_url(),
            ttl_secs: default_bridge_ttl_secs(),
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChainSettings {
    #[serde(default = "default_network")]
    pub network: String,

    /// Overrides the network's default API base URL.
    #[serde(default)]
    pub api_url: Option<String>,

    #[serde(default = "default_http_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_network() -> String {
    "mainnet".to_string()
}

impl Default for ChainSettings {
    fn default() -> Self {
        Self {
            network: default_network(),
            api_url: None,
            timeout_ms: default_http_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ManifestSettings {
    #[serde(default = "default_manifest_timeout_ms")]
    pub timeout_ms: u64,

    #[serde(default = "default_manifest_max_bytes")]
    pub max_bytes: usize,
}

fn default_manifest_timeout_ms() -> u64 {
    10_000
}

fn default_manifest_max_bytes() -> usize {
    64 * 1024
}

impl Default for ManifestSettings {
    fn default() -> Self {
        Self {
            timeout_ms: default_manifest_timeout_ms(),
            max_bytes: default_manifest_max_bytes(),
        }
    }
}

/// How the wallet describes itself in connect events.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeviceSettings {
    #[serde(default = "default_app_name")]
    pub app_name: String,

    #[serde(default = "default_app_version")]
    pub app_version: String,

    #[serde(default = "default_platform")]
    pub platform: String,

    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_app_name() -> String {
    "tonlink".to_string()
}

fn default_app_version() -> String {
    env!("CARGO_PKG_VERSION").to_string()
}

fn default_platform() -> String {
    std::env::consts::OS.to_string()
}

fn default_max_messages() -> usize {
    4
}

impl Default for DeviceSettings {
    fn default() -> Self {
        Self {
            app_name: default_app_name(),
            app_version: default_app_version(),
            platform: default_platform(),
            max_messages: default_max_messages(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct VaultSettings {
    /// Defaults to `~/.tonlink/vault`.
    #[serde(default)]
    pub dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LoggingSettings {
    #[serde(default = "default_log_filter")]
    pub filter: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for LoggingSettings {
    fn default() -> Self {
        Self {
            filter: default_log_filter(),
            json: false,
        }
    }
}

/// Base directory for tonlink state (`~/.tonlink`).
pub fn tonlink_home() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".tonlink")
}

impl Settings {
    /// Default TOML config file path (~/.tonlink/config.toml).
    pub fn default_toml_path() -> PathBuf {
        tonlink_home().join("config.toml")
    }

    /// Load settings from a TOML file.
    ///
    /// Returns `None` if the file doesn't exist. Returns an error only
    /// if the file exists but can't be parsed.
    pub fn load_toml(path: &std::path::Path) -> Result<Option<Self>, String> {
        let data = match std::fs::read_to_string(path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(format!("failed to read {}: {}", path.display(), e)),
        };

        let settings: Self = toml::from_str(&data)
            .map_err(|e| format!("invalid TOML in {}: {}", path.display(), e))?;
        Ok(Some(settings))
    }

    /// Write a commented TOML config file with current settings.
    pub fn save_toml(&self, path: &std::path::Path) -> Result<(), String> {
        let raw = toml::to_string_pretty(self)
            .map_err(|e| format!("failed to serialize settings: {}", e))?;

        let content = format!(
            "# tonlink configuration file.\n\
             #\n\
             # Priority: env var > this file > defaults.\n\
             # The vault master key is never stored here; set TONLINK_VAULT_KEY.\n\
             # Run `tonlink config init` to regenerate this file.\n\
             \n\
             {raw}"
        );

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| format!("failed to create {}: {}", parent.display(), e))?;
        }

        std::fs::write(path, content)
            .map_err(|e| format!("failed to write {}: {}", path.display(), e))
    }

    /// Merge values from `other` into `self`, preferring `other` for
    /// fields that differ from the default.
    pub fn merge_from(&mut self, other: &Self) {
        let default_json = match serde_json::to_value(Self::default()) {
            Ok(v) => v,
            Err(_) => return,
        };
        let other_json = match serde_json::to_value(other) {
            Ok(v) => v,
            Err(_) => return,
        };
        let mut self_json = match serde_json::to_value(&*self) {
            Ok(v) => v,
            Err(_) => return,
        };

        merge_non_default(&mut self_json, &other_json, &default_json);

        if let Ok(merged) = serde_json::from_value(self_json) {
            *self = merged;
        }
    }

    /// Get a setting value by dotted path (e.g., "bridge.ttl_secs").
    pub fn get(&self, path: &str) -> Option<String> {
        let json = serde_json::to_value(self).ok()?;
        let mut current = &json;

        for part in path.split('.') {
            current = current.get(part)?;
        }

        match current {
            serde_json::Value::Object(_) => None,
            other => Some(render_value(other)),
        }
    }

    /// List all settings as (path, value) pairs.
    pub fn list(&self) -> Vec<(String, String)> {
        let json = match serde_json::to_value(self) {
            Ok(v) => v,
            Err(_) => return Vec::new(),
        };

        let mut results = Vec::new();
        collect_settings(&json, String::new(), &mut results);
        results.sort_by(|a, b| a.0.cmp(&b.0));
        results
    }
}

fn render_value(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => "null".to_string(),
        other => other.to_string(),
    }
}

/// Recursively collect settings paths and values.
fn collect_settings(
    value: &serde_json::Value,
    prefix: String,
    results: &mut Vec<(String, String)>,
) {
    match value {
        serde_json::Value::Object(obj) => {
            for (key, val) in obj {
                let path = if prefix.is_empty() {
                    key.clone()
                } else {
                    format!("{}.{}", prefix, key)
                };
                collect_settings(val, path, results);
            }
        }
        other => results.push((prefix, render_value(other))),
    }
}

/// Recursively merge `other` into `target`, but only for fields where
/// `other` differs from `defaults`.
fn merge_non_default(
    target: &mut serde_json::Value,
    other: &serde_json::Value,
    defaults: &serde_json::Value,
) {
    match (target, other, defaults) {
        (
            serde_json::Value::Object(t),
            serde_json::Value::Object(o),
            serde_json::Value::Object(d),
        ) => {
            for (key, other_val) in o {
                let default_val = d.get(key).cloned().unwrap_or(serde_json::Value::Null);
                if let Some(target_val) = t.get_mut(key) {
                    merge_non_default(target_val, other_val, &default_val);
                } else if other_val != &default_val {
                    t.insert(key.clone(), other_val.clone());
                }
            }
        }
        (target, other, defaults) => {
            if other != defaults {
                *target = other.clone();
            }
        }
    }
}

//! Bootstrap helpers for tonlink.
//!
//! Secrets that must never land in `config.toml` (the vault master key,
//! chain API keys) are kept in `~/.tonlink/.env` and loaded with dotenvy
//! before configuration is resolved.

use std::path::{Path, PathBuf};

use rand::RngCore;
use rand::rngs::OsRng;

use crate::settings::tonlink_home;

/// Path to the tonlink-specific `.env` file: `~/.tonlink/.env`.
pub fn tonlink_env_path() -> PathBuf {
    tonlink_home().join(".env")
}

/// Load `./.env` and then `~/.tonlink/.env`.
///
/// dotenvy never overwrites existing env vars, so the effective priority is:
///
///   explicit env vars > `./.env` > `~/.tonlink/.env`
pub fn load_tonlink_env() {
    let _ = dotenvy::dotenv();

    let path = tonlink_env_path();
    if path.exists() {
        let _ = dotenvy::from_path(&path);
    }
}

/// Write key/value pairs to a dotenv file, replacing its contents.
///
/// Values are double-quoted so that `#` and other shell-special characters
/// are preserved by dotenvy.
pub fn save_env_vars(path: &Path, vars: &[(&str, &str)]) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = String::new();
    for (key, value) in vars {
        // Escape backslashes and double quotes so a value cannot start a new line.
        let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
        content.push_str(&format!("{}=\"{}\"\n", key, escaped));
    }
    std::fs::write(path, content)
}

/// Fresh 32-byte vault master key, hex encoded.
pub fn generate_vault_key() -> String {
    let mut key = [0u8; 32];
    OsRng.fill_bytes(&mut key);
    hex::encode(key)
}

/// Generate a vault key into `path` unless one is already there.
///
/// Returns `true` when a new key was written. Other entries in the file are
/// kept.
pub fn ensure_vault_key(path: &Path) -> std::io::Result<bool> {
    let mut existing: Vec<(String, String)> = match dotenvy::from_path_iter(path) {
        Ok(iter) => iter.filter_map(|r| r.ok()).collect(),
        Err(_) => Vec::new(),
    };
    if existing.iter().any(|(key, _)| key == "TONLINK_VAULT_KEY") {
        return Ok(false);
    }

    existing.push(("TONLINK_VAULT_KEY".to_string(), generate_vault_key()));
    let vars: Vec<(&str, &str)> = existing
        .iter()
        .map(|(k, v)| (k.as_str(), v.as_str()))
        .collect();
    save_env_vars(path, &vars)?;
    Ok(true)
}

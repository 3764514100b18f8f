//! Wallet identity as seen by the connection engine.
//!
//! Key storage lives outside this crate; the engine only asks a
//! [`KeyProvider`] for an Ed25519 signing key when it must produce a
//! binding signature.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use base64::Engine;
use base64::engine::general_purpose::{STANDARD, URL_SAFE};
use crc::{CRC_16_XMODEM, Crc};
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{KeyError, ProtocolError};

/// Raw account address: workchain plus 32-byte account hash.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WalletAddress {
    pub workchain: i32,
    pub hash: [u8; 32],
}

impl WalletAddress {
    pub fn new(workchain: i32, hash: [u8; 32]) -> Self {
        Self { workchain, hash }
    }

    /// Parse the raw `workchain:hex` form.
    pub fn parse_raw(raw: &str) -> Result<Self, ProtocolError> {
        let (workchain, hash) = raw
            .trim()
            .split_once(':')
            .ok_or_else(|| ProtocolError::invalid(format!("address '{raw}' is not raw form")))?;
        let workchain = workchain
            .parse::<i32>()
            .map_err(|_| ProtocolError::invalid(format!("address '{raw}' has a bad workchain")))?;
        let hash = hex::decode(hash)
            .ok()
            .and_then(|bytes| <[u8; 32]>::try_from(bytes).ok())
            .ok_or_else(|| ProtocolError::invalid(format!("address '{raw}' has a bad hash")))?;
        Ok(Self { workchain, hash })
    }

    /// Parse either the raw form or the 48-character user-friendly form.
    pub fn parse(value: &str) -> Result<Self, ProtocolError> {
        let value = value.trim();
        if value.contains(':') {
            Self::parse_raw(value)
        } else {
            Self::parse_friendly(value)
        }
    }

    /// Parse the base64 user-friendly form: tag, workchain, hash, CRC16.
    pub fn parse_friendly(value: &str) -> Result<Self, ProtocolError> {
        let bad = || ProtocolError::invalid(format!("address '{value}' is not user-friendly form"));
        if value.len() != FRIENDLY_LENGTH {
            return Err(bad());
        }
        let bytes = URL_SAFE
            .decode(value)
            .or_else(|_| STANDARD.decode(value))
            .map_err(|_| bad())?;
        let bytes: [u8; 36] = bytes.try_into().map_err(|_| bad())?;

        let checksum = u16::from_be_bytes([bytes[34], bytes[35]]);
        if ADDRESS_CRC.checksum(&bytes[..34]) != checksum {
            return Err(ProtocolError::invalid(format!(
                "address '{value}' has a bad checksum"
            )));
        }
        if !matches!(bytes[0] & !TESTNET_FLAG, BOUNCEABLE_TAG | NON_BOUNCEABLE_TAG) {
            return Err(bad());
        }

        let mut hash = [0u8; 32];
        hash.copy_from_slice(&bytes[2..34]);
        Ok(Self {
            workchain: i32::from(bytes[1] as i8),
            hash,
        })
    }

    /// Canonical raw form, lowercase hex. Used as the registry key.
    pub fn to_raw(&self) -> String {
        format!("{}:{}", self.workchain, hex::encode(self.hash))
    }
}

const FRIENDLY_LENGTH: usize = 48;
const BOUNCEABLE_TAG: u8 = 0x11;
const NON_BOUNCEABLE_TAG: u8 = 0x51;
const TESTNET_FLAG: u8 = 0x80;

/// Checksum trailing the user-friendly form.
const ADDRESS_CRC: Crc<u16> = Crc::<u16>::new(&CRC_16_XMODEM);

impl fmt::Display for WalletAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_raw())
    }
}

impl FromStr for WalletAddress {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl Serialize for WalletAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_raw())
    }
}

impl<'de> Deserialize<'de> for WalletAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).map_err(serde::de::Error::custom)
    }
}

/// What the wallet can do with its keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WalletKind {
    /// Mnemonic held locally; can sign.
    Regular,
    /// Address only.
    WatchOnly,
    /// Keys live on an external signer that is not wired up yet.
    External,
}

impl WalletKind {
    pub fn can_sign(self) -> bool {
        matches!(self, Self::Regular)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Regular => "regular",
            Self::WatchOnly => "watch_only",
            Self::External => "external",
        }
    }
}

impl fmt::Display for WalletKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Network {
    Mainnet,
    Testnet,
}

impl Network {
    /// Chain id string used on the wire.
    pub fn chain_id(self) -> &'static str {
        match self {
            Self::Mainnet => "-239",
            Self::Testnet => "-3",
        }
    }

    pub fn from_chain_id(value: &str) -> Option<Self> {
        match value.trim() {
            "-239" => Some(Self::Mainnet),
            "-3" => Some(Self::Testnet),
            _ => None,
        }
    }
}

/// A wallet account the user operates.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Wallet {
    pub name: String,
    pub address: WalletAddress,
    #[serde(with = "hex_key")]
    pub public_key: [u8; 32],
    pub kind: WalletKind,
    pub network: Network,
    /// Base64 state init of the wallet contract.
    pub state_init: String,
}

impl Wallet {
    pub fn can_sign(&self) -> bool {
        self.kind.can_sign()
    }
}

mod hex_key {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(key: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(key))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let raw = String::deserialize(deserializer)?;
        let bytes = hex::decode(raw).map_err(serde::de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|_| serde::de::Error::custom("public key must be 32 bytes"))
    }
}

/// Source of wallet signing keys.
#[async_trait]
pub trait KeyProvider: Send + Sync {
    async fn signing_key(&self, wallet: &Wallet) -> Result<SigningKey, KeyError>;
}

/// In-memory key provider keyed by raw wallet address.
#[derive(Default)]
pub struct StaticKeyProvider {
    keys: HashMap<WalletAddress, SigningKey>,
}

impl StaticKeyProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_key(mut self, address: WalletAddress, key: SigningKey) -> Self {
        self.keys.insert(address, key);
        self
    }
}

#[async_trait]
impl KeyProvider for StaticKeyProvider {
    async fn signing_key(&self, wallet: &Wallet) -> Result<SigningKey, KeyError> {
        let key = self
            .keys
            .get(&wallet.address)
            .cloned()
            .ok_or_else(|| KeyError::Unavailable {
                wallet: wallet.address.to_raw(),
            })?;
        if key.verifying_key().to_bytes() != wallet.public_key {
            return Err(KeyError::Invalid {
                wallet: wallet.address.to_raw(),
            });
        }
        Ok(key)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RAW: &str = "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8";

    #[test]
    fn raw_address_round_trip() {
        let address = WalletAddress::parse_raw(RAW).expect("parse");

        assert_eq!(address.workchain, 0);
        assert_eq!(address.to_raw(), RAW);
        assert_eq!(
            WalletAddress::parse_raw(&RAW.to_ascii_uppercase())
                .expect("upper hex")
                .to_raw(),
            RAW
        );
    }

    #[test]
    fn rejects_malformed_addresses() {
        assert!(WalletAddress::parse_raw("83dfd552").is_err());
        assert!(WalletAddress::parse_raw("x:83dfd552").is_err());
        assert!(WalletAddress::parse_raw("0:zz").is_err());
        assert!(WalletAddress::parse_raw("-1:83df").is_err());
    }

    #[test]
    fn parses_friendly_form() {
        let raw = WalletAddress::parse_raw(RAW).expect("raw");
        let mut bytes = vec![BOUNCEABLE_TAG, 0];
        bytes.extend_from_slice(&raw.hash);
        let crc = ADDRESS_CRC.checksum(&bytes);
        bytes.extend_from_slice(&crc.to_be_bytes());
        let friendly = URL_SAFE.encode(&bytes);

        assert_eq!(WalletAddress::parse(&friendly).expect("friendly"), raw);

        let mut tampered = bytes.clone();
        tampered[5] ^= 1;
        assert!(WalletAddress::parse(&URL_SAFE.encode(&tampered)).is_err());
    }

    #[test]
    fn address_checksum_is_crc16_xmodem() {
        assert_eq!(ADDRESS_CRC.checksum(b"123456789"), 0x31c3);
    }

    #[test]
    fn only_regular_wallets_sign() {
        assert!(WalletKind::Regular.can_sign());
        assert!(!WalletKind::WatchOnly.can_sign());
        assert!(!WalletKind::External.can_sign());
    }

    #[test]
    fn network_chain_ids() {
        assert_eq!(Network::Mainnet.chain_id(), "-239");
        assert_eq!(Network::from_chain_id("-3"), Some(Network::Testnet));
        assert_eq!(Network::from_chain_id("1"), None);
    }

    #[tokio::test]
    async fn static_provider_checks_public_key() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let address = WalletAddress::parse_raw(RAW).expect("parse");
        let mut wallet = Wallet {
            name: "Main".to_string(),
            address,
            public_key: key.verifying_key().to_bytes(),
            kind: WalletKind::Regular,
            network: Network::Mainnet,
            state_init: String::new(),
        };
        let provider = StaticKeyProvider::new().with_key(address, key);

        assert!(provider.signing_key(&wallet).await.is_ok());

        wallet.public_key = [0u8; 32];
        assert!(matches!(
            provider.signing_key(&wallet).await,
            Err(KeyError::Invalid { .. })
        ));
    }
}

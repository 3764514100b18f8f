use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::wallet::WalletAddress;

/// One outgoing message an app asks the wallet to send.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessageIntent {
    #[serde(rename = "address")]
    pub destination: WalletAddress,
    /// Amount in nanotons; decimal string on the wire.
    #[serde(with = "nanotons")]
    pub amount: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_init: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub payload: Option<String>,
}

/// Wallet send mode flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SendMode(pub u8);

impl SendMode {
    pub const PAY_FEES_SEPARATELY: u8 = 1;
    pub const IGNORE_ERRORS: u8 = 2;
}

impl Default for SendMode {
    fn default() -> Self {
        Self(Self::PAY_FEES_SEPARATELY | Self::IGNORE_ERRORS)
    }
}

mod nanotons {
    use super::*;

    pub fn serialize<S: Serializer>(amount: &u64, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&amount.to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u64, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Amount {
            Text(String),
            Number(u64),
        }

        match Amount::deserialize(deserializer)? {
            Amount::Number(value) => Ok(value),
            Amount::Text(text) => text
                .trim()
                .parse::<u64>()
                .map_err(|_| serde::de::Error::custom(format!("invalid amount '{text}'"))),
        }
    }
}

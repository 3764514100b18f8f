//! JSON shapes exchanged with apps through the bridge.

use serde::{Deserialize, Serialize};

use crate::config::DeviceConfig;
use crate::crypto::TonProof;

/// Error codes understood by connected apps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCode {
    Unknown,
    BadRequest,
    UnknownApp,
    UserDeclined,
    MethodNotSupported,
}

impl ErrorCode {
    pub fn code(self) -> u16 {
        match self {
            Self::Unknown => 0,
            Self::BadRequest => 1,
            Self::UnknownApp => 100,
            Self::UserDeclined => 300,
            Self::MethodNotSupported => 400,
        }
    }

    pub fn message(self) -> &'static str {
        match self {
            Self::Unknown => "Unknown error",
            Self::BadRequest => "Bad request",
            Self::UnknownApp => "Unknown app",
            Self::UserDeclined => "User declined the transaction",
            Self::MethodNotSupported => "Method not supported",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Feature {
    Legacy(String),
    Named(NamedFeature),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum NamedFeature {
    SendTransaction {
        #[serde(rename = "maxMessages")]
        max_messages: usize,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceInfo {
    pub platform: String,
    pub app_name: String,
    pub app_version: String,
    pub max_protocol_version: u8,
    pub features: Vec<Feature>,
}

impl DeviceInfo {
    pub fn from_config(config: &DeviceConfig) -> Self {
        Self {
            platform: config.platform.clone(),
            app_name: config.app_name.clone(),
            app_version: config.app_version.clone(),
            max_protocol_version: config.max_protocol_version,
            features: vec![
                Feature::Legacy("SendTransaction".to_string()),
                Feature::Named(NamedFeature::SendTransaction {
                    max_messages: config.max_messages,
                }),
            ],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum ConnectItemReply {
    #[serde(rename = "ton_addr", rename_all = "camelCase")]
    Address {
        address: String,
        network: String,
        public_key: String,
        wallet_state_init: String,
    },
    #[serde(rename = "ton_proof")]
    Proof { proof: TonProof },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEventPayload {
    pub items: Vec<ConnectItemReply>,
    pub device: DeviceInfo,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectEvent {
    pub event: String,
    pub id: u64,
    pub payload: ConnectEventPayload,
}

impl ConnectEvent {
    pub fn new(id: u64, payload: ConnectEventPayload) -> Self {
        Self {
            event: "connect".to_string(),
            id,
            payload,
        }
    }
}

/// Sent when the wallet drops the connection.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DisconnectEvent {
    pub event: String,
    pub id: u64,
    pub payload: serde_json::Map<String, serde_json::Value>,
}

impl DisconnectEvent {
    pub fn new(id: u64) -> Self {
        Self {
            event: "disconnect".to_string(),
            id,
            payload: serde_json::Map::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireError {
    pub code: u16,
    pub message: String,
}

/// Reply to an app request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RequestReply {
    Success {
        result: serde_json::Value,
        id: String,
    },
    Error { error: WireError, id: String },
}

impl RequestReply {
    pub fn success(result: impl Into<serde_json::Value>, id: impl Into<String>) -> Self {
        Self::Success {
            result: result.into(),
            id: id.into(),
        }
    }

    pub fn error(code: ErrorCode, id: impl Into<String>) -> Self {
        Self::Error {
            error: WireError {
                code: code.code(),
                message: code.message().to_string(),
            },
            id: id.into(),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Success { id, .. } | Self::Error { id, .. } => id,
        }
    }
}

/// Decrypted request envelope as sent by an app.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppRequestEnvelope {
    pub method: String,
    #[serde(default)]
    pub params: Vec<String>,
    pub id: String,
}

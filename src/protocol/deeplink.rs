//! Connection deeplink parsing.
//!
//! `tc://?v=2&id=<client id>&r=<url-encoded JSON>`; the long key names
//! `version`, `clientId` and `requestPayload` are accepted as aliases.

use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

use crate::error::ProtocolError;

pub const DEEPLINK_SCHEME: &str = "tc";

const VERSION_KEYS: &[&str] = &["v", "version"];
const CLIENT_ID_KEYS: &[&str] = &["id", "clientId"];
const PAYLOAD_KEYS: &[&str] = &["r", "requestPayload"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolVersion {
    #[serde(rename = "2")]
    V2,
}

impl ProtocolVersion {
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim() {
            "2" => Some(Self::V2),
            _ => None,
        }
    }

    pub fn as_u8(self) -> u8 {
        match self {
            Self::V2 => 2,
        }
    }
}

impl fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_u8())
    }
}

/// One item the app asks for in the connect response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "name")]
pub enum ConnectItem {
    #[serde(rename = "ton_addr")]
    Address,
    #[serde(rename = "ton_proof")]
    Proof { payload: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectRequestPayload {
    pub manifest_url: Url,
    pub items: Vec<ConnectItem>,
}

/// Parameters carried by a connection deeplink. Immutable once parsed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionParameters {
    pub version: ProtocolVersion,
    pub client_id: String,
    pub request_payload: ConnectRequestPayload,
}

impl ConnectionParameters {
    pub fn manifest_url(&self) -> &Url {
        &self.request_payload.manifest_url
    }

    pub fn items(&self) -> &[ConnectItem] {
        &self.request_payload.items
    }
}

fn query_value(url: &Url, keys: &[&str]) -> Option<String> {
    url.query_pairs()
        .find(|(name, _)| keys.contains(&name.as_ref()))
        .map(|(_, value)| value.into_owned())
}

/// Parse a connection deeplink. Pure; performs no I/O.
pub fn parse(deeplink: &str) -> Result<ConnectionParameters, ProtocolError> {
    let url = Url::parse(deeplink.trim())
        .map_err(|e| ProtocolError::deeplink(format!("not a URL: {e}")))?;

    if url.scheme() != DEEPLINK_SCHEME {
        return Err(ProtocolError::deeplink(format!(
            "expected scheme '{DEEPLINK_SCHEME}', got '{}'",
            url.scheme()
        )));
    }

    let raw_version = query_value(&url, VERSION_KEYS)
        .ok_or_else(|| ProtocolError::deeplink("missing version parameter"))?;
    let version = ProtocolVersion::parse(&raw_version).ok_or_else(|| {
        ProtocolError::deeplink(format!("unsupported protocol version '{raw_version}'"))
    })?;

    let client_id = query_value(&url, CLIENT_ID_KEYS)
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ProtocolError::deeplink("missing client id parameter"))?;
    crate::crypto::parse_public_key(&client_id)
        .map_err(|_| ProtocolError::deeplink("client id is not a 32-byte hex public key"))?;

    let raw_payload = query_value(&url, PAYLOAD_KEYS)
        .ok_or_else(|| ProtocolError::deeplink("missing request payload parameter"))?;
    let request_payload: ConnectRequestPayload = serde_json::from_str(&raw_payload)
        .map_err(|e| ProtocolError::deeplink(format!("request payload is not valid JSON: {e}")))?;
    if request_payload.items.is_empty() {
        return Err(ProtocolError::deeplink("request payload lists no items"));
    }

    Ok(ConnectionParameters {
        version,
        client_id,
        request_payload,
    })
}

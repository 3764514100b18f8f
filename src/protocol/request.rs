//! Decoding of requests apps send through the bridge.

use serde::{Deserialize, Serialize};

use super::messages::AppRequestEnvelope;
use crate::error::ProtocolError;
use crate::store::ConnectedApp;
use crate::transfer::MessageIntent;
use crate::wallet::{Wallet, WalletAddress};

pub const SEND_TRANSACTION: &str = "sendTransaction";
pub const DISCONNECT: &str = "disconnect";

/// One `sendTransaction` parameter group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendTransactionParams {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub valid_until: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub from: Option<WalletAddress>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub network: Option<String>,
    pub messages: Vec<MessageIntent>,
}

impl SendTransactionParams {
    /// Checks that hold before anything is built or signed.
    pub fn validate(
        &self,
        wallet: &Wallet,
        now_unix: u64,
        max_messages: usize,
    ) -> Result<(), ProtocolError> {
        if let Some(valid_until) = self.valid_until
            && valid_until <= now_unix
        {
            return Err(ProtocolError::invalid(format!(
                "request expired at {valid_until}"
            )));
        }
        if let Some(from) = &self.from
            && *from != wallet.address
        {
            return Err(ProtocolError::invalid(format!(
                "request is for {from}, not {}",
                wallet.address
            )));
        }
        if let Some(network) = &self.network
            && network != wallet.network.chain_id()
        {
            return Err(ProtocolError::invalid(format!(
                "request targets network {network}, wallet is on {}",
                wallet.network.chain_id()
            )));
        }
        if self.messages.is_empty() {
            return Err(ProtocolError::invalid("request has no messages"));
        }
        if self.messages.len() > max_messages {
            return Err(ProtocolError::invalid(format!(
                "request has {} messages, at most {max_messages} allowed",
                self.messages.len()
            )));
        }
        Ok(())
    }
}

/// A decoded app request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AppRequest {
    SendTransaction {
        id: String,
        params: Vec<SendTransactionParams>,
    },
    Disconnect {
        id: String,
    },
    Unsupported {
        id: String,
        method: String,
    },
}

/// Decode the decrypted JSON envelope. Fails only if there is no usable id.
pub fn decode_envelope(plaintext: &[u8]) -> Result<AppRequestEnvelope, ProtocolError> {
    let envelope: AppRequestEnvelope = serde_json::from_slice(plaintext)
        .map_err(|e| ProtocolError::invalid(format!("request is not a valid envelope: {e}")))?;
    if envelope.id.trim().is_empty() {
        return Err(ProtocolError::invalid("request has an empty id"));
    }
    Ok(envelope)
}

impl TryFrom<AppRequestEnvelope> for AppRequest {
    type Error = ProtocolError;

    fn try_from(envelope: AppRequestEnvelope) -> Result<Self, Self::Error> {
        match envelope.method.as_str() {
            SEND_TRANSACTION => {
                let params = envelope
                    .params
                    .iter()
                    .map(|raw| {
                        serde_json::from_str::<SendTransactionParams>(raw).map_err(|e| {
                            ProtocolError::invalid(format!("sendTransaction params: {e}"))
                        })
                    })
                    .collect::<Result<Vec<_>, _>>()?;
                if params.is_empty() {
                    return Err(ProtocolError::invalid("sendTransaction has no params"));
                }
                Ok(Self::SendTransaction {
                    id: envelope.id,
                    params,
                })
            }
            DISCONNECT => Ok(Self::Disconnect { id: envelope.id }),
            _ => Ok(Self::Unsupported {
                id: envelope.id,
                method: envelope.method,
            }),
        }
    }
}

/// A transaction request waiting for the user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomingRequest {
    pub id: String,
    pub params: Vec<SendTransactionParams>,
    pub app: ConnectedApp,
}

impl IncomingRequest {
    /// The group that gets built and signed. Extra groups are ignored.
    pub fn primary_params(&self) -> Result<&SendTransactionParams, ProtocolError> {
        if self.params.len() > 1 {
            tracing::warn!(
                request_id = %self.id,
                groups = self.params.len(),
                "Request carries several parameter groups, using the first"
            );
        }
        self.params
            .first()
            .ok_or_else(|| ProtocolError::invalid("request has no parameter groups"))
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::wallet::{Network, WalletKind};

    const WALLET: &str = "0:83dfd552e63729b472fcbcc8c45ebcc6691702558b68ec7527e1ba403a0f31a8";
    const DEST: &str = "0:0101010101010101010101010101010101010101010101010101010101010101";

    fn wallet() -> Wallet {
        Wallet {
            name: "Main".to_string(),
            address: WalletAddress::parse_raw(WALLET).expect("address"),
            public_key: [0u8; 32],
            kind: WalletKind::Regular,
            network: Network::Mainnet,
            state_init: String::new(),
        }
    }

    fn envelope(method: &str, params: Vec<String>) -> Vec<u8> {
        serde_json::to_vec(&json!({"method": method, "params": params, "id": "12"}))
            .expect("json")
    }

    fn params_json(extra: serde_json::Value) -> String {
        let mut value = json!({
            "messages": [{"address": DEST, "amount": "1000"}]
        });
        if let (Some(target), Some(extra)) = (value.as_object_mut(), extra.as_object()) {
            target.extend(extra.clone());
        }
        value.to_string()
    }

    #[test]
    fn decodes_send_transaction() {
        let raw = envelope(SEND_TRANSACTION, vec![params_json(json!({"valid_until": 99}))]);
        let request = AppRequest::try_from(decode_envelope(&raw).expect("envelope")).expect("req");

        match request {
            AppRequest::SendTransaction { id, params } => {
                assert_eq!(id, "12");
                assert_eq!(params.len(), 1);
                assert_eq!(params[0].valid_until, Some(99));
                assert_eq!(params[0].messages[0].amount, 1000);
            }
            other => panic!("unexpected request {other:?}"),
        }
    }

    #[test]
    fn recognizes_disconnect_and_unknown_methods() {
        let disconnect = decode_envelope(&envelope(DISCONNECT, vec![])).expect("envelope");
        assert_eq!(
            AppRequest::try_from(disconnect).expect("req"),
            AppRequest::Disconnect {
                id: "12".to_string()
            }
        );

        let unknown = decode_envelope(&envelope("signData", vec![])).expect("envelope");
        assert_eq!(
            AppRequest::try_from(unknown).expect("req"),
            AppRequest::Unsupported {
                id: "12".to_string(),
                method: "signData".to_string()
            }
        );
    }

    #[test]
    fn bad_params_keep_the_envelope_id() {
        let envelope = decode_envelope(&envelope(SEND_TRANSACTION, vec!["{}".to_string()]))
            .expect("envelope");
        assert_eq!(envelope.id, "12");
        assert!(AppRequest::try_from(envelope).is_err());
    }

    #[test]
    fn validate_checks_expiry_sender_network_and_count() {
        let wallet = wallet();
        let ok: SendTransactionParams = serde_json::from_str(&params_json(json!({
            "valid_until": 200, "from": WALLET, "network": "-239"
        })))
        .expect("params");
        assert!(ok.validate(&wallet, 100, 4).is_ok());
        assert!(ok.validate(&wallet, 200, 4).is_err());

        let foreign: SendTransactionParams =
            serde_json::from_str(&params_json(json!({"from": DEST}))).expect("params");
        assert!(foreign.validate(&wallet, 100, 4).is_err());

        let testnet: SendTransactionParams =
            serde_json::from_str(&params_json(json!({"network": "-3"}))).expect("params");
        assert!(testnet.validate(&wallet, 100, 4).is_err());

        assert!(ok.validate(&wallet, 100, 0).is_err());
    }
}

//! Encrypted replies to connected apps.

use chrono::{DateTime, Utc};
use ed25519_dalek::SigningKey;
use serde::Serialize;

use super::deeplink::ConnectItem;
use super::manifest::Manifest;
use super::messages::{
    ConnectEvent, ConnectEventPayload, ConnectItemReply, DeviceInfo, DisconnectEvent, ErrorCode,
    RequestReply,
};
use crate::crypto::{SessionCrypto, sign_ton_proof};
use crate::error::ProtocolError;
use crate::transfer::ChainMessage;
use crate::wallet::Wallet;

/// Builds relay-ready bodies. Pure apart from the encryption nonce.
#[derive(Debug, Clone)]
pub struct ResponseBuilder {
    device: DeviceInfo,
}

impl ResponseBuilder {
    pub fn new(device: DeviceInfo) -> Self {
        Self { device }
    }

    /// Connect event answering every requested item, sealed for `client_id`.
    #[allow(clippy::too_many_arguments)]
    pub fn connect_success(
        &self,
        items: &[ConnectItem],
        wallet: &Wallet,
        session: &SessionCrypto,
        signing_key: &SigningKey,
        manifest: &Manifest,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ProtocolError> {
        let domain = manifest.domain();
        let timestamp = u64::try_from(now.timestamp())
            .map_err(|_| ProtocolError::invalid("clock is before the unix epoch"))?;

        let replies = items
            .iter()
            .map(|item| match item {
                ConnectItem::Address => ConnectItemReply::Address {
                    address: wallet.address.to_raw(),
                    network: wallet.network.chain_id().to_string(),
                    public_key: hex::encode(wallet.public_key),
                    wallet_state_init: wallet.state_init.clone(),
                },
                ConnectItem::Proof { payload } => ConnectItemReply::Proof {
                    proof: sign_ton_proof(&wallet.address, &domain, timestamp, payload, signing_key),
                },
            })
            .collect();

        let event = ConnectEvent::new(
            now.timestamp_millis().max(0) as u64,
            ConnectEventPayload {
                items: replies,
                device: self.device.clone(),
            },
        );
        seal(session, &event, client_id)
    }

    pub fn transaction_success(
        &self,
        session: &SessionCrypto,
        message: &ChainMessage,
        request_id: &str,
        client_id: &str,
    ) -> Result<String, ProtocolError> {
        let reply = RequestReply::success(message.as_base64(), request_id);
        seal(session, &reply, client_id)
    }

    /// Acknowledge an app-initiated `disconnect` with an empty result.
    pub fn disconnect_ack(
        &self,
        session: &SessionCrypto,
        request_id: &str,
        client_id: &str,
    ) -> Result<String, ProtocolError> {
        let reply = RequestReply::success(serde_json::json!({}), request_id);
        seal(session, &reply, client_id)
    }

    pub fn transaction_error(
        &self,
        session: &SessionCrypto,
        code: ErrorCode,
        request_id: &str,
        client_id: &str,
    ) -> Result<String, ProtocolError> {
        let reply = RequestReply::error(code, request_id);
        seal(session, &reply, client_id)
    }

    pub fn disconnect(
        &self,
        session: &SessionCrypto,
        client_id: &str,
        now: DateTime<Utc>,
    ) -> Result<String, ProtocolError> {
        let event = DisconnectEvent::new(now.timestamp_millis().max(0) as u64);
        seal(session, &event, client_id)
    }
}

fn seal<T: Serialize>(
    session: &SessionCrypto,
    value: &T,
    client_id: &str,
) -> Result<String, ProtocolError> {
    let plaintext = serde_json::to_vec(value)
        .map_err(|e| ProtocolError::invalid(format!("reply does not serialize: {e}")))?;
    session
        .seal(&plaintext, client_id)
        .map_err(|e| ProtocolError::invalid(format!("cannot seal reply for {client_id}: {e}")))
}

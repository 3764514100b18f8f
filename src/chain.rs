//! Chain access: seqno lookup, emulation, broadcast and NFT metadata.

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{Client, RequestBuilder};
use secrecy::{ExposeSecret, SecretString};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::ChainConfig;
use crate::error::ChainError;
use crate::transfer::ChainMessage;
use crate::wallet::WalletAddress;

/// What a simulated message would do.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Emulation {
    /// Total fee in nanotons.
    pub fee: u64,
    pub actions: Vec<EmulatedAction>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EmulatedAction {
    TonTransfer {
        recipient: WalletAddress,
        amount: u64,
    },
    JettonTransfer {
        recipient: WalletAddress,
        symbol: String,
        decimals: u32,
        /// Raw units as a decimal string.
        amount: String,
    },
    NftTransfer {
        nft: WalletAddress,
        recipient: Option<WalletAddress>,
    },
    Other {
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NftItem {
    pub address: WalletAddress,
    pub name: Option<String>,
    pub collection: Option<String>,
    pub image: Option<String>,
}

#[async_trait]
pub trait ChainService: Send + Sync {
    async fn seqno(&self, wallet: &WalletAddress) -> Result<u32, ChainError>;

    async fn emulate(&self, message: &ChainMessage) -> Result<Emulation, ChainError>;

    async fn broadcast(&self, message: &ChainMessage) -> Result<(), ChainError>;

    async fn nfts(&self, addresses: &[WalletAddress]) -> Result<Vec<NftItem>, ChainError>;
}

#[derive(Serialize)]
struct BocBody<'a> {
    boc: &'a str,
}

#[derive(Deserialize)]
struct SeqnoResponse {
    seqno: u32,
}

#[derive(Deserialize)]
struct AccountRef {
    address: String,
}

#[derive(Deserialize)]
struct JettonRef {
    symbol: String,
    #[serde(default)]
    decimals: u32,
}

#[derive(Deserialize)]
struct RawAction {
    #[serde(rename = "type")]
    kind: String,
    #[serde(rename = "TonTransfer")]
    ton_transfer: Option<RawTonTransfer>,
    #[serde(rename = "JettonTransfer")]
    jetton_transfer: Option<RawJettonTransfer>,
    #[serde(rename = "NftItemTransfer")]
    nft_transfer: Option<RawNftTransfer>,
}

#[derive(Deserialize)]
struct RawTonTransfer {
    recipient: AccountRef,
    amount: u64,
}

#[derive(Deserialize)]
struct RawJettonTransfer {
    recipient: Option<AccountRef>,
    amount: String,
    jetton: JettonRef,
}

#[derive(Deserialize)]
struct RawNftTransfer {
    nft: String,
    recipient: Option<AccountRef>,
}

#[derive(Deserialize)]
struct RawEvent {
    #[serde(default)]
    actions: Vec<RawAction>,
    /// Balance change beyond the transfers; negative when fees are paid.
    #[serde(default)]
    extra: i64,
}

#[derive(Deserialize)]
struct EmulateResponse {
    event: RawEvent,
}

#[derive(Serialize)]
struct NftBulkBody {
    account_ids: Vec<String>,
}

#[derive(Deserialize)]
struct RawNftMetadata {
    name: Option<String>,
    image: Option<String>,
}

#[derive(Deserialize)]
struct RawNftCollection {
    name: Option<String>,
}

#[derive(Deserialize)]
struct RawNftItem {
    address: String,
    metadata: Option<RawNftMetadata>,
    collection: Option<RawNftCollection>,
}

#[derive(Deserialize)]
struct NftBulkResponse {
    nft_items: Vec<RawNftItem>,
}

fn parse_address(endpoint: &str, raw: &str) -> Result<WalletAddress, ChainError> {
    WalletAddress::parse(raw).map_err(|e| ChainError::InvalidResponse {
        endpoint: endpoint.to_string(),
        reason: e.to_string(),
    })
}

impl RawAction {
    fn into_action(self, endpoint: &str) -> Result<EmulatedAction, ChainError> {
        let kind = self.kind.clone();
        let action = match (kind.as_str(), self) {
            (
                "TonTransfer",
                RawAction {
                    ton_transfer: Some(transfer),
                    ..
                },
            ) => EmulatedAction::TonTransfer {
                recipient: parse_address(endpoint, &transfer.recipient.address)?,
                amount: transfer.amount,
            },
            (
                "JettonTransfer",
                RawAction {
                    jetton_transfer: Some(RawJettonTransfer {
                        recipient: Some(recipient),
                        amount,
                        jetton,
                    }),
                    ..
                },
            ) => EmulatedAction::JettonTransfer {
                recipient: parse_address(endpoint, &recipient.address)?,
                symbol: jetton.symbol,
                decimals: jetton.decimals,
                amount,
            },
            (
                "NftItemTransfer",
                RawAction {
                    nft_transfer: Some(transfer),
                    ..
                },
            ) => EmulatedAction::NftTransfer {
                nft: parse_address(endpoint, &transfer.nft)?,
                recipient: transfer
                    .recipient
                    .map(|r| parse_address(endpoint, &r.address))
                    .transpose()?,
            },
            (_, other) => EmulatedAction::Other { kind: other.kind },
        };
        Ok(action)
    }
}

/// Chain service over a tonapi-compatible HTTP API.
pub struct HttpChainService {
    client: Client,
    base_url: String,
    api_key: Option<SecretString>,
}

impl HttpChainService {
    pub fn new(config: &ChainConfig) -> Self {
        Self {
            client: Client::builder()
                .timeout(Duration::from_millis(config.timeout_ms))
                .build()
                .unwrap_or_else(|_| Client::new()),
            base_url: config.api_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.api_key {
            Some(key) => request.bearer_auth(key.expose_secret()),
            None => request,
        }
    }

    async fn execute<T: DeserializeOwned>(
        &self,
        endpoint: &str,
        request: RequestBuilder,
    ) -> Result<T, ChainError> {
        let response = self.authorize(request).send().await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::RequestFailed {
                endpoint: endpoint.to_string(),
                reason: format!("HTTP {status}: {body}"),
            });
        }
        response
            .json::<T>()
            .await
            .map_err(|e| ChainError::InvalidResponse {
                endpoint: endpoint.to_string(),
                reason: e.to_string(),
            })
    }
}

#[async_trait]
impl ChainService for HttpChainService {
    async fn seqno(&self, wallet: &WalletAddress) -> Result<u32, ChainError> {
        let endpoint = format!("{}/v2/wallet/{}/seqno", self.base_url, wallet.to_raw());
        let response: SeqnoResponse = self
            .execute(&endpoint, self.client.get(&endpoint))
            .await?;
        tracing::debug!(wallet = %wallet, seqno = response.seqno, "Fetched seqno");
        Ok(response.seqno)
    }

    async fn emulate(&self, message: &ChainMessage) -> Result<Emulation, ChainError> {
        let endpoint = format!("{}/v2/wallet/emulate", self.base_url);
        let request = self.client.post(&endpoint).json(&BocBody {
            boc: message.as_base64(),
        });
        let response: EmulateResponse = self.execute(&endpoint, request).await?;

        let actions = response
            .event
            .actions
            .into_iter()
            .map(|action| action.into_action(&endpoint))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Emulation {
            fee: response.event.extra.min(0).unsigned_abs(),
            actions,
        })
    }

    async fn broadcast(&self, message: &ChainMessage) -> Result<(), ChainError> {
        let endpoint = format!("{}/v2/blockchain/message", self.base_url);
        let response = self
            .authorize(self.client.post(&endpoint).json(&BocBody {
                boc: message.as_base64(),
            }))
            .send()
            .await?;

        let status = response.status();
        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return Err(ChainError::Rejected {
                reason: format!("HTTP {status}: {body}"),
            });
        }
        if !status.is_success() {
            return Err(ChainError::RequestFailed {
                endpoint,
                reason: format!("HTTP {status}"),
            });
        }
        tracing::info!("Broadcast signed message");
        Ok(())
    }

    async fn nfts(&self, addresses: &[WalletAddress]) -> Result<Vec<NftItem>, ChainError> {
        if addresses.is_empty() {
            return Ok(Vec::new());
        }
        let endpoint = format!("{}/v2/nfts/_bulk", self.base_url);
        let request = self.client.post(&endpoint).json(&NftBulkBody {
            account_ids: addresses.iter().map(WalletAddress::to_raw).collect(),
        });
        let response: NftBulkResponse = self.execute(&endpoint, request).await?;

        response
            .nft_items
            .into_iter()
            .map(|item| {
                Ok(NftItem {
                    address: parse_address(&endpoint, &item.address)?,
                    name: item.metadata.as_ref().and_then(|m| m.name.clone()),
                    image: item.metadata.and_then(|m| m.image),
                    collection: item.collection.and_then(|c| c.name),
                })
            })
            .collect()
    }
}

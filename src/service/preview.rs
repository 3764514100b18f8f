//! User-facing preview of an emulated transfer.

use rust_decimal::Decimal;
use serde::Serialize;

use crate::chain::{EmulatedAction, Emulation, NftItem};
use crate::wallet::{Wallet, WalletAddress};

/// Decimal places of one TON.
pub const TON_DECIMALS: u32 = 9;

/// Convert nanotons to TON.
pub fn nanotons_to_ton(nanotons: u64) -> Decimal {
    Decimal::from_i128_with_scale(i128::from(nanotons), TON_DECIMALS)
}

/// Scale raw jetton units. `None` when the value does not fit a decimal.
pub fn scale_units(raw: &str, decimals: u32) -> Option<Decimal> {
    let units: i128 = raw.trim().parse().ok()?;
    Decimal::try_from_i128_with_scale(units, decimals)
        .ok()
        .map(|d| d.normalize())
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PreviewAction {
    SendTon {
        recipient: WalletAddress,
        amount: Decimal,
    },
    SendJetton {
        recipient: WalletAddress,
        symbol: String,
        amount: Option<Decimal>,
        raw_amount: String,
    },
    SendNft {
        nft: WalletAddress,
        recipient: Option<WalletAddress>,
        item: Option<NftItem>,
    },
    Other {
        kind: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Preview {
    pub request_id: String,
    pub app_name: String,
    pub wallet_name: String,
    pub wallet: WalletAddress,
    /// Estimated fee in TON.
    pub fee: Decimal,
    /// TON leaving the wallet, fee excluded.
    pub total_ton: Decimal,
    pub actions: Vec<PreviewAction>,
}

impl Preview {
    pub fn from_emulation(
        request_id: &str,
        app_name: &str,
        wallet: &Wallet,
        emulation: &Emulation,
        nfts: &[NftItem],
    ) -> Self {
        let mut total = 0u64;
        let actions = emulation
            .actions
            .iter()
            .map(|action| match action {
                EmulatedAction::TonTransfer { recipient, amount } => {
                    // Refunds back to the wallet do not leave it.
                    if *recipient != wallet.address {
                        total = total.saturating_add(*amount);
                    }
                    PreviewAction::SendTon {
                        recipient: *recipient,
                        amount: nanotons_to_ton(*amount),
                    }
                }
                EmulatedAction::JettonTransfer {
                    recipient,
                    symbol,
                    decimals,
                    amount,
                } => PreviewAction::SendJetton {
                    recipient: *recipient,
                    symbol: symbol.clone(),
                    amount: scale_units(amount, *decimals),
                    raw_amount: amount.clone(),
                },
                EmulatedAction::NftTransfer { nft, recipient } => PreviewAction::SendNft {
                    nft: *nft,
                    recipient: *recipient,
                    item: nfts.iter().find(|item| item.address == *nft).cloned(),
                },
                EmulatedAction::Other { kind } => PreviewAction::Other { kind: kind.clone() },
            })
            .collect();

        Self {
            request_id: request_id.to_string(),
            app_name: app_name.to_string(),
            wallet_name: wallet.name.clone(),
            wallet: wallet.address,
            fee: nanotons_to_ton(emulation.fee),
            total_ton: nanotons_to_ton(total),
            actions,
        }
    }
}

/// NFT items referenced by the emulation, deduplicated.
pub fn referenced_nfts(emulation: &Emulation) -> Vec<WalletAddress> {
    let mut addresses = Vec::new();
    for action in &emulation.actions {
        if let EmulatedAction::NftTransfer { nft, .. } = action
            && !addresses.contains(nft)
        {
            addresses.push(*nft);
        }
    }
    addresses
}

#[cfg(test)]
mod tests {
    use std::str::FromStr;

    use pretty_assertions::assert_eq;

    use super::*;
    use crate::wallet::{Network, WalletKind};

    fn wallet() -> Wallet {
        Wallet {
            name: "Savings".to_string(),
            address: WalletAddress::new(0, [1u8; 32]),
            public_key: [2u8; 32],
            kind: WalletKind::Regular,
            network: Network::Mainnet,
            state_init: String::new(),
        }
    }

    #[test]
    fn nanotons_render_as_ton() {
        assert_eq!(nanotons_to_ton(1_500_000_000), Decimal::from_str("1.5").unwrap());
        assert_eq!(nanotons_to_ton(1).to_string(), "0.000000001");
    }

    #[test]
    fn jetton_units_scale_by_decimals() {
        assert_eq!(scale_units("2500000", 6), Some(Decimal::from_str("2.5").unwrap()));
        assert_eq!(scale_units("not a number", 6), None);
    }

    #[test]
    fn maps_actions_and_enriches_nfts() {
        let nft = WalletAddress::new(0, [9u8; 32]);
        let recipient = WalletAddress::new(0, [3u8; 32]);
        let emulation = Emulation {
            fee: 5_000_000,
            actions: vec![
                EmulatedAction::TonTransfer {
                    recipient,
                    amount: 2_000_000_000,
                },
                EmulatedAction::NftTransfer {
                    nft,
                    recipient: Some(recipient),
                },
                EmulatedAction::NftTransfer {
                    nft,
                    recipient: None,
                },
            ],
        };
        assert_eq!(referenced_nfts(&emulation), vec![nft]);

        let item = NftItem {
            address: nft,
            name: Some("Punk #1".to_string()),
            collection: None,
            image: None,
        };
        let preview = Preview::from_emulation("7", "Demo", &wallet(), &emulation, &[item.clone()]);

        assert_eq!(preview.wallet_name, "Savings");
        assert_eq!(preview.fee, Decimal::from_str("0.005").unwrap());
        assert_eq!(preview.total_ton, Decimal::from_str("2").unwrap());
        assert_eq!(
            preview.actions[1],
            PreviewAction::SendNft {
                nft,
                recipient: Some(recipient),
                item: Some(item),
            }
        );
    }

    #[test]
    fn refunds_to_the_wallet_are_not_counted_as_spent() {
        let wallet = wallet();
        let emulation = Emulation {
            fee: 1,
            actions: vec![
                EmulatedAction::TonTransfer {
                    recipient: WalletAddress::new(0, [3u8; 32]),
                    amount: 1_000_000_000,
                },
                EmulatedAction::TonTransfer {
                    recipient: wallet.address,
                    amount: 300_000_000,
                },
            ],
        };

        let preview = Preview::from_emulation("8", "Demo", &wallet, &emulation, &[]);

        assert_eq!(preview.total_ton, Decimal::ONE);
        assert_eq!(preview.actions.len(), 2);
    }
}

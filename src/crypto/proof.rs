//! `ton_proof` ownership proofs.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use ed25519_dalek::{Signer, SigningKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::wallet::WalletAddress;

const PROOF_PREFIX: &[u8] = b"ton-proof-item-v2/";
const CONNECT_PREFIX: &[u8] = b"ton-connect";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProofDomain {
    pub length_bytes: u32,
    pub value: String,
}

/// Signed proof that the wallet owns `address`, bound to the app's domain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TonProof {
    pub timestamp: u64,
    pub domain: ProofDomain,
    pub signature: String,
    pub payload: String,
}

fn proof_message(address: &WalletAddress, domain: &str, timestamp: u64, payload: &str) -> Vec<u8> {
    let mut message = Vec::with_capacity(
        PROOF_PREFIX.len() + 4 + 32 + 4 + domain.len() + 8 + payload.len(),
    );
    message.extend_from_slice(PROOF_PREFIX);
    message.extend_from_slice(&(address.workchain as u32).to_be_bytes());
    message.extend_from_slice(&address.hash);
    message.extend_from_slice(&(domain.len() as u32).to_le_bytes());
    message.extend_from_slice(domain.as_bytes());
    message.extend_from_slice(&timestamp.to_le_bytes());
    message.extend_from_slice(payload.as_bytes());
    message
}

/// Digest the wallet key actually signs.
pub fn proof_digest(address: &WalletAddress, domain: &str, timestamp: u64, payload: &str) -> [u8; 32] {
    let inner = Sha256::digest(proof_message(address, domain, timestamp, payload));

    let mut outer = Sha256::new();
    outer.update([0xff, 0xff]);
    outer.update(CONNECT_PREFIX);
    outer.update(inner);
    outer.finalize().into()
}

pub fn sign_ton_proof(
    address: &WalletAddress,
    domain: &str,
    timestamp: u64,
    payload: &str,
    key: &SigningKey,
) -> TonProof {
    let digest = proof_digest(address, domain, timestamp, payload);
    let signature = key.sign(&digest);

    TonProof {
        timestamp,
        domain: ProofDomain {
            length_bytes: domain.len() as u32,
            value: domain.to_string(),
        },
        signature: STANDARD.encode(signature.to_bytes()),
        payload: payload.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signature, Verifier};

    use super::*;

    #[test]
    fn proof_verifies_against_wallet_key() {
        let key = SigningKey::from_bytes(&[3u8; 32]);
        let address = WalletAddress::new(0, [9u8; 32]);

        let proof = sign_ton_proof(&address, "app.example", 1_700_000_000, "nonce-1", &key);

        let signature = STANDARD.decode(&proof.signature).expect("base64");
        let signature = Signature::from_slice(&signature).expect("signature");
        let digest = proof_digest(&address, "app.example", 1_700_000_000, "nonce-1");
        assert!(key.verifying_key().verify(&digest, &signature).is_ok());
        assert_eq!(proof.domain.length_bytes, 11);
    }

    #[test]
    fn digest_binds_every_field() {
        let address = WalletAddress::new(0, [9u8; 32]);
        let base = proof_digest(&address, "app.example", 1, "p");

        assert_ne!(base, proof_digest(&address, "app.example", 2, "p"));
        assert_ne!(base, proof_digest(&address, "evil.example", 1, "p"));
        assert_ne!(base, proof_digest(&address, "app.example", 1, "q"));
        assert_ne!(
            base,
            proof_digest(&WalletAddress::new(-1, [9u8; 32]), "app.example", 1, "p")
        );
    }
}

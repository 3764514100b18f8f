use std::fmt;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use bytes::{Buf, BufMut, Bytes, BytesMut};
use ed25519_dalek::{Signer, SigningKey};
use sha2::{Digest, Sha256};

use super::intent::{MessageIntent, SendMode};
use crate::error::ProtocolError;
use crate::wallet::{Wallet, WalletAddress};

pub const SIGNATURE_LENGTH: usize = 64;

const ENVELOPE_MAGIC: &[u8; 4] = b"tltx";
const ENVELOPE_VERSION: u8 = 1;

/// How a transfer gets its signature.
///
/// `NoOp` yields an all-zero signature that simulation accepts and the chain
/// rejects. `RealKey` signs with the wallet key.
pub enum SigningStrategy {
    NoOp,
    RealKey(SigningKey),
}

impl SigningStrategy {
    pub fn is_binding(&self) -> bool {
        matches!(self, Self::RealKey(_))
    }

    fn sign(&self, digest: &[u8; 32]) -> [u8; SIGNATURE_LENGTH] {
        match self {
            Self::NoOp => [0u8; SIGNATURE_LENGTH],
            Self::RealKey(key) => key.sign(digest).to_bytes(),
        }
    }
}

impl fmt::Debug for SigningStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NoOp => f.write_str("NoOp"),
            Self::RealKey(_) => f.write_str("RealKey([REDACTED])"),
        }
    }
}

/// Transfer body before signing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsignedTransfer {
    pub wallet: WalletAddress,
    pub seqno: u32,
    pub valid_until: u32,
    pub send_mode: SendMode,
    pub messages: Vec<MessageIntent>,
}

fn put_address(buf: &mut BytesMut, address: &WalletAddress) {
    buf.put_i32(address.workchain);
    buf.put_slice(&address.hash);
}

fn put_optional(buf: &mut BytesMut, value: Option<&str>) {
    match value {
        Some(value) => {
            buf.put_u8(1);
            buf.put_u32(value.len() as u32);
            buf.put_slice(value.as_bytes());
        }
        None => buf.put_u8(0),
    }
}

fn truncated() -> ProtocolError {
    ProtocolError::invalid("chain message is truncated")
}

fn need(buf: &Bytes, len: usize) -> Result<(), ProtocolError> {
    if buf.remaining() < len {
        return Err(truncated());
    }
    Ok(())
}

fn get_address(buf: &mut Bytes) -> Result<WalletAddress, ProtocolError> {
    need(buf, 4 + 32)?;
    let workchain = buf.get_i32();
    let mut hash = [0u8; 32];
    buf.copy_to_slice(&mut hash);
    Ok(WalletAddress::new(workchain, hash))
}

fn get_optional(buf: &mut Bytes) -> Result<Option<String>, ProtocolError> {
    need(buf, 1)?;
    if buf.get_u8() == 0 {
        return Ok(None);
    }
    need(buf, 4)?;
    let len = buf.get_u32() as usize;
    need(buf, len)?;
    let raw = buf.split_to(len);
    String::from_utf8(raw.to_vec())
        .map(Some)
        .map_err(|_| ProtocolError::invalid("chain message field is not UTF-8"))
}

impl UnsignedTransfer {
    /// Canonical byte encoding the signature covers.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(64 + self.messages.len() * 64);
        buf.put_slice(ENVELOPE_MAGIC);
        buf.put_u8(ENVELOPE_VERSION);
        put_address(&mut buf, &self.wallet);
        buf.put_u32(self.seqno);
        buf.put_u32(self.valid_until);
        buf.put_u8(self.send_mode.0);
        buf.put_u8(self.messages.len() as u8);
        for message in &self.messages {
            put_address(&mut buf, &message.destination);
            buf.put_u64(message.amount);
            put_optional(&mut buf, message.state_init.as_deref());
            put_optional(&mut buf, message.payload.as_deref());
        }
        buf.freeze()
    }

    pub fn decode(mut buf: Bytes) -> Result<Self, ProtocolError> {
        need(&buf, ENVELOPE_MAGIC.len() + 1)?;
        if &buf[..ENVELOPE_MAGIC.len()] != ENVELOPE_MAGIC {
            return Err(ProtocolError::invalid("chain message has an unknown envelope"));
        }
        buf.advance(ENVELOPE_MAGIC.len());
        let version = buf.get_u8();
        if version != ENVELOPE_VERSION {
            return Err(ProtocolError::invalid(format!(
                "chain message envelope version {version} is not supported"
            )));
        }

        let wallet = get_address(&mut buf)?;
        need(&buf, 4 + 4 + 1 + 1)?;
        let seqno = buf.get_u32();
        let valid_until = buf.get_u32();
        let send_mode = SendMode(buf.get_u8());
        let count = buf.get_u8() as usize;

        let mut messages = Vec::with_capacity(count);
        for _ in 0..count {
            let destination = get_address(&mut buf)?;
            need(&buf, 8)?;
            let amount = buf.get_u64();
            let state_init = get_optional(&mut buf)?;
            let payload = get_optional(&mut buf)?;
            messages.push(MessageIntent {
                destination,
                amount,
                state_init,
                payload,
            });
        }
        if buf.has_remaining() {
            return Err(ProtocolError::invalid("chain message has trailing bytes"));
        }

        Ok(Self {
            wallet,
            seqno,
            valid_until,
            send_mode,
            messages,
        })
    }

    pub fn signing_digest(&self) -> [u8; 32] {
        Sha256::digest(self.encode()).into()
    }
}

/// Signed, serialized transfer ready for broadcast.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainMessage {
    encoded: String,
}

impl ChainMessage {
    pub fn from_base64(encoded: impl Into<String>) -> Self {
        Self {
            encoded: encoded.into(),
        }
    }

    pub fn as_base64(&self) -> &str {
        &self.encoded
    }

    /// Split back into signature and transfer body.
    pub fn decode(&self) -> Result<([u8; SIGNATURE_LENGTH], UnsignedTransfer), ProtocolError> {
        let raw = STANDARD
            .decode(&self.encoded)
            .map_err(|_| ProtocolError::invalid("chain message is not base64"))?;
        let mut raw = Bytes::from(raw);
        need(&raw, SIGNATURE_LENGTH)?;
        let mut signature = [0u8; SIGNATURE_LENGTH];
        raw.copy_to_slice(&mut signature);
        Ok((signature, UnsignedTransfer::decode(raw)?))
    }
}

/// Assembles transfers for one wallet.
#[derive(Debug, Clone)]
pub struct TransactionMessageBuilder {
    max_messages: usize,
}

impl TransactionMessageBuilder {
    pub fn new(max_messages: usize) -> Self {
        Self { max_messages }
    }

    /// Build and sign a transfer. `sender`, when the app names one, must be
    /// the wallet itself.
    #[allow(clippy::too_many_arguments)]
    pub fn build(
        &self,
        wallet: &Wallet,
        seqno: u32,
        valid_until: u32,
        intents: &[MessageIntent],
        sender: Option<&WalletAddress>,
        send_mode: SendMode,
        strategy: &SigningStrategy,
    ) -> Result<ChainMessage, ProtocolError> {
        if let Some(sender) = sender
            && *sender != wallet.address
        {
            return Err(ProtocolError::invalid(format!(
                "request sender {sender} is not wallet {}",
                wallet.address
            )));
        }
        if intents.is_empty() {
            return Err(ProtocolError::invalid("transfer has no messages"));
        }
        if intents.len() > self.max_messages {
            return Err(ProtocolError::invalid(format!(
                "transfer has {} messages, at most {} allowed",
                intents.len(),
                self.max_messages
            )));
        }

        let transfer = UnsignedTransfer {
            wallet: wallet.address,
            seqno,
            valid_until,
            send_mode,
            messages: intents.to_vec(),
        };
        let signature = strategy.sign(&transfer.signing_digest());

        let body = transfer.encode();
        let mut signed = BytesMut::with_capacity(SIGNATURE_LENGTH + body.len());
        signed.put_slice(&signature);
        signed.put_slice(&body);

        tracing::debug!(
            wallet = %wallet.address,
            seqno,
            messages = intents.len(),
            binding = strategy.is_binding(),
            "Built transfer message"
        );
        Ok(ChainMessage::from_base64(STANDARD.encode(signed)))
    }
}

#[cfg(test)]
mod tests {
    use ed25519_dalek::{Signature, Verifier};
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::wallet::{Network, WalletKind};

    fn wallet(key: &SigningKey) -> Wallet {
        Wallet {
            name: "Main".to_string(),
            address: WalletAddress::new(0, [1u8; 32]),
            public_key: key.verifying_key().to_bytes(),
            kind: WalletKind::Regular,
            network: Network::Mainnet,
            state_init: String::new(),
        }
    }

    fn intents() -> Vec<MessageIntent> {
        vec![
            MessageIntent {
                destination: WalletAddress::new(0, [2u8; 32]),
                amount: 1_000,
                state_init: None,
                payload: Some("te6cc".to_string()),
            },
            MessageIntent {
                destination: WalletAddress::new(-1, [3u8; 32]),
                amount: 42,
                state_init: Some("init".to_string()),
                payload: None,
            },
        ]
    }

    #[test]
    fn real_key_signature_verifies() {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let wallet = wallet(&key);
        let builder = TransactionMessageBuilder::new(4);

        let message = builder
            .build(
                &wallet,
                17,
                1_800_000_000,
                &intents(),
                None,
                SendMode::default(),
                &SigningStrategy::RealKey(key.clone()),
            )
            .expect("build");

        let (signature, transfer) = message.decode().expect("decode");
        assert_eq!(transfer.seqno, 17);
        assert_eq!(transfer.messages, intents());
        let signature = Signature::from_bytes(&signature);
        assert!(
            key.verifying_key()
                .verify(&transfer.signing_digest(), &signature)
                .is_ok()
        );
    }

    #[test]
    fn noop_strategy_produces_zero_signature() {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let wallet = wallet(&key);

        let message = TransactionMessageBuilder::new(4)
            .build(
                &wallet,
                3,
                0,
                &intents(),
                Some(&wallet.address),
                SendMode::default(),
                &SigningStrategy::NoOp,
            )
            .expect("build");

        let (signature, transfer) = message.decode().expect("decode");
        assert_eq!(signature, [0u8; SIGNATURE_LENGTH]);
        assert_eq!(transfer.wallet, wallet.address);
    }

    #[test]
    fn rejects_foreign_sender_and_message_limits() {
        let key = SigningKey::from_bytes(&[5u8; 32]);
        let wallet = wallet(&key);
        let builder = TransactionMessageBuilder::new(1);
        let other = WalletAddress::new(0, [9u8; 32]);

        let build = |intents: &[MessageIntent], sender: Option<&WalletAddress>| {
            builder.build(
                &wallet,
                1,
                0,
                intents,
                sender,
                SendMode::default(),
                &SigningStrategy::NoOp,
            )
        };

        assert!(build(&intents()[..1], Some(&other)).is_err());
        assert!(build(&[], None).is_err());
        assert!(build(&intents(), None).is_err());
        assert!(build(&intents()[..1], None).is_ok());
    }

    #[test]
    fn decode_rejects_truncated_messages() {
        let short = ChainMessage::from_base64(STANDARD.encode([0u8; 10]));
        assert!(short.decode().is_err());
        assert!(ChainMessage::from_base64("%%%").decode().is_err());
    }

    #[test]
    fn strategy_debug_hides_key() {
        let strategy = SigningStrategy::RealKey(SigningKey::from_bytes(&[5u8; 32]));
        assert_eq!(format!("{strategy:?}"), "RealKey([REDACTED])");
    }
}

//! Per-app session keys and authenticated bridge encryption.
//!
//! Every wallet/app relationship gets its own X25519 key pair. Each message
//! derives the AES-256-GCM key from the X25519 shared secret via HKDF-SHA256,
//! so both sides arrive at the same key from their own secret and the peer's
//! public key. Wire layout is `nonce (12) || ciphertext || tag (16)`.

use std::fmt;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Key, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use hkdf::Hkdf;
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use sha2::Sha256;
use x25519_dalek::{PublicKey, StaticSecret};

use crate::error::CryptoError;

pub const KEY_LENGTH: usize = 32;
pub const NONCE_LENGTH: usize = 12;
pub const TAG_LENGTH: usize = 16;

const HKDF_INFO: &[u8] = b"tonlink/bridge-session/v1";

/// Hex-encoded session public key that identifies the wallet side to the relay.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SessionId(String);

impl SessionId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// X25519 key pair bound to a single connected app.
#[derive(Clone)]
pub struct SessionKeyPair {
    secret: StaticSecret,
    public: PublicKey,
}

impl SessionKeyPair {
    /// Fresh key pair from the OS RNG.
    pub fn generate() -> Self {
        let secret = StaticSecret::random_from_rng(OsRng);
        let public = PublicKey::from(&secret);
        Self { secret, public }
    }

    /// Rebuild a persisted key pair from its 32-byte secret.
    pub fn from_private_key(bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes: [u8; KEY_LENGTH] = bytes.try_into().map_err(|_| CryptoError::InvalidKey {
            reason: format!("session secret must be {KEY_LENGTH} bytes"),
        })?;
        let secret = StaticSecret::from(bytes);
        let public = PublicKey::from(&secret);
        Ok(Self { secret, public })
    }

    pub fn public_key(&self) -> [u8; KEY_LENGTH] {
        self.public.to_bytes()
    }

    pub fn private_key(&self) -> [u8; KEY_LENGTH] {
        self.secret.to_bytes()
    }

    pub fn session_id(&self) -> SessionId {
        session_id(self)
    }
}

impl PartialEq for SessionKeyPair {
    fn eq(&self, other: &Self) -> bool {
        self.public == other.public
    }
}

impl Eq for SessionKeyPair {}

impl fmt::Debug for SessionKeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionKeyPair")
            .field("public", &hex::encode(self.public.as_bytes()))
            .finish_non_exhaustive()
    }
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StoredKeyPair {
    public_key: String,
    secret_key: String,
}

impl Serialize for SessionKeyPair {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        StoredKeyPair {
            public_key: hex::encode(self.public.as_bytes()),
            secret_key: hex::encode(self.secret.to_bytes()),
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for SessionKeyPair {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let stored = StoredKeyPair::deserialize(deserializer)?;
        let secret = hex::decode(&stored.secret_key).map_err(serde::de::Error::custom)?;
        let pair = SessionKeyPair::from_private_key(&secret).map_err(serde::de::Error::custom)?;
        if hex::encode(pair.public.as_bytes()) != stored.public_key.to_ascii_lowercase() {
            return Err(serde::de::Error::custom(
                "stored session public key does not match its secret",
            ));
        }
        Ok(pair)
    }
}

/// Deterministic session id: lowercase hex of the public key.
pub fn session_id(key_pair: &SessionKeyPair) -> SessionId {
    SessionId(hex::encode(key_pair.public.as_bytes()))
}

/// Parse a peer public key from its hex form (the relay client id).
pub fn parse_public_key(hex_key: &str) -> Result<[u8; KEY_LENGTH], CryptoError> {
    let bytes = hex::decode(hex_key.trim()).map_err(|_| CryptoError::InvalidKey {
        reason: "public key is not valid hex".to_string(),
    })?;
    bytes.try_into().map_err(|_| CryptoError::InvalidKey {
        reason: format!("public key must be {KEY_LENGTH} bytes"),
    })
}

fn derive_cipher(
    ours: &SessionKeyPair,
    their_public: &[u8; KEY_LENGTH],
) -> Result<Aes256Gcm, CryptoError> {
    let shared = ours.secret.diffie_hellman(&PublicKey::from(*their_public));
    if !shared.was_contributory() {
        return Err(CryptoError::InvalidKey {
            reason: "peer public key is a low-order point".to_string(),
        });
    }

    let hk = Hkdf::<Sha256>::new(None, shared.as_bytes());
    let mut okm = [0u8; KEY_LENGTH];
    hk.expand(HKDF_INFO, &mut okm)
        .map_err(|_| CryptoError::EncryptionFailed)?;
    Ok(Aes256Gcm::new(Key::<Aes256Gcm>::from_slice(&okm)))
}

/// Encrypt `plaintext` for the holder of `their_public`.
pub fn encrypt(
    plaintext: &[u8],
    ours: &SessionKeyPair,
    their_public: &[u8; KEY_LENGTH],
) -> Result<Vec<u8>, CryptoError> {
    let cipher = derive_cipher(ours, their_public)?;

    let mut nonce = [0u8; NONCE_LENGTH];
    OsRng.fill_bytes(&mut nonce);

    let ciphertext = cipher
        .encrypt(Nonce::from_slice(&nonce), plaintext)
        .map_err(|_| CryptoError::EncryptionFailed)?;

    let mut out = Vec::with_capacity(NONCE_LENGTH + ciphertext.len());
    out.extend_from_slice(&nonce);
    out.extend_from_slice(&ciphertext);
    Ok(out)
}

/// Decrypt a buffer produced by [`encrypt`] on the peer's side.
pub fn decrypt(
    ciphertext: &[u8],
    ours: &SessionKeyPair,
    their_public: &[u8; KEY_LENGTH],
) -> Result<Vec<u8>, CryptoError> {
    if ciphertext.len() < NONCE_LENGTH + TAG_LENGTH {
        return Err(CryptoError::InvalidCiphertext);
    }
    let cipher = derive_cipher(ours, their_public)?;
    let (nonce, body) = ciphertext.split_at(NONCE_LENGTH);
    cipher
        .decrypt(Nonce::from_slice(nonce), body)
        .map_err(|_| CryptoError::InvalidCiphertext)
}

/// Session key pair plus the framing used on the relay (base64 bodies).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionCrypto {
    key_pair: SessionKeyPair,
}

impl SessionCrypto {
    pub fn generate() -> Self {
        Self {
            key_pair: SessionKeyPair::generate(),
        }
    }

    pub fn from_private_key(bytes: &[u8]) -> Result<Self, CryptoError> {
        SessionKeyPair::from_private_key(bytes).map(Self::from)
    }

    pub fn key_pair(&self) -> &SessionKeyPair {
        &self.key_pair
    }

    pub fn session_id(&self) -> SessionId {
        session_id(&self.key_pair)
    }

    /// Encrypt and base64-encode a relay body for the app with client id `their_hex`.
    pub fn seal(&self, plaintext: &[u8], their_hex: &str) -> Result<String, CryptoError> {
        let their_public = parse_public_key(their_hex)?;
        let sealed = encrypt(plaintext, &self.key_pair, &their_public)?;
        Ok(STANDARD.encode(sealed))
    }

    /// Decode and decrypt a base64 relay body sent by the app with client id `their_hex`.
    pub fn open(&self, body: &str, their_hex: &str) -> Result<Vec<u8>, CryptoError> {
        let their_public = parse_public_key(their_hex)?;
        let sealed = STANDARD
            .decode(body.trim())
            .map_err(|_| CryptoError::InvalidCiphertext)?;
        decrypt(&sealed, &self.key_pair, &their_public)
    }
}

impl From<SessionKeyPair> for SessionCrypto {
    fn from(key_pair: SessionKeyPair) -> Self {
        Self { key_pair }
    }
}

//! Cryptography for bridge sessions and wallet proofs.

mod proof;
mod session;

pub use self::proof::{ProofDomain, TonProof, proof_digest, sign_ton_proof};
pub use self::session::{
    KEY_LENGTH, NONCE_LENGTH, SessionCrypto, SessionId, SessionKeyPair, TAG_LENGTH, decrypt,
    encrypt, parse_public_key, session_id,
};

//! Commit signing keys.
//!
//! Repositories are signed with secp256k1 ECDSA keys. Signatures are
//! deterministic (RFC 6979) and low-S normalised, so re-signing the same
//! commit bytes always yields the same signature. Private keys travel as
//! multibase (base58btc) strings carrying the secp256k1-priv multicodec
//! prefix.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use multibase::Base;

/// Varint encoding of the secp256k1-priv multicodec (0x1301).
const SECP256K1_PRIV_MULTICODEC: [u8; 2] = [0x81, 0x26];

#[derive(Debug, thiserror::Error)]
pub enum SigningError {
    #[error("invalid signing key: {0}")]
    InvalidKey(String),
}

/// Generates a new secp256k1 private key as a multibase string.
pub fn generate_key() -> String {
    encode_key(&SigningKey::random(&mut rand::rngs::OsRng))
}

/// Encodes a private key in its multibase storage form.
pub fn encode_key(key: &SigningKey) -> String {
    let mut data = Vec::with_capacity(SECP256K1_PRIV_MULTICODEC.len() + 32);
    data.extend_from_slice(&SECP256K1_PRIV_MULTICODEC);
    data.extend_from_slice(&key.to_bytes());
    multibase::encode(Base::Base58Btc, data)
}

/// Parses a private key from its multibase storage form.
pub fn parse_key(encoded: &str) -> Result<SigningKey, SigningError> {
    let (_, data) =
        multibase::decode(encoded).map_err(|e| SigningError::InvalidKey(e.to_string()))?;
    let raw = data
        .strip_prefix(&SECP256K1_PRIV_MULTICODEC[..])
        .ok_or_else(|| SigningError::InvalidKey("unsupported key multicodec".to_string()))?;
    SigningKey::from_slice(raw).map_err(|e| SigningError::InvalidKey(e.to_string()))
}

/// Signs a message, returning the 64-byte compact signature.
pub fn sign(key: &SigningKey, message: &[u8]) -> Vec<u8> {
    let sig: Signature = key.sign(message);
    let sig = sig.normalize_s().unwrap_or(sig);
    sig.to_bytes().to_vec()
}

/// Verifies a compact signature over a message.
pub fn verify(key: &VerifyingKey, message: &[u8], signature: &[u8]) -> bool {
    let Ok(sig) = Signature::from_slice(signature) else {
        return false;
    };
    let sig = sig.normalize_s().unwrap_or(sig);
    key.verify(message, &sig).is_ok()
}

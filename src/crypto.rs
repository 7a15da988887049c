//! Signature scheme, hashing, and address derivation.
//!
//! Ed25519 keypairs back every signature here; see DESIGN.md for why
//! this was chosen over an RSA-style scheme.

use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("invalid public key bytes")]
    InvalidPublicKey,
    #[error("invalid signature bytes")]
    InvalidSignature,
    #[error("invalid hex encoding: {0}")]
    InvalidHex(#[from] hex::FromHexError),
}

/// Output encoding for [`hash`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Hex,
    Base64,
}

/// SHA-256 of `bytes`, rendered in the requested encoding.
pub fn hash(bytes: &[u8], encoding: Encoding) -> String {
    let digest = Sha256::digest(bytes);
    match encoding {
        Encoding::Hex => hex::encode(digest),
        Encoding::Base64 => BASE64.encode(digest),
    }
}

/// Ed25519 public key, wrapped for `Ord`/serde/text-form hashing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PublicKey(VerifyingKey);

impl PublicKey {
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self, CryptoError> {
        VerifyingKey::from_bytes(bytes)
            .map(PublicKey)
            .map_err(|_| CryptoError::InvalidPublicKey)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.0.to_bytes()
    }

    /// Canonical text form used as the preimage for address derivation
    /// and as the wire representation in transaction JSON.
    pub fn to_text(&self) -> String {
        hex::encode(self.0.to_bytes())
    }

    pub fn from_text(s: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(s)?;
        let arr: [u8; 32] = bytes
            .try_into()
            .map_err(|_| CryptoError::InvalidPublicKey)?;
        Self::from_bytes(&arr)
    }
}

impl PartialOrd for PublicKey {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for PublicKey {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.0.to_bytes().cmp(&other.0.to_bytes())
    }
}

impl Serialize for PublicKey {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_text())
    }
}

impl<'de> Deserialize<'de> for PublicKey {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let text = String::deserialize(deserializer)?;
        PublicKey::from_text(&text).map_err(serde::de::Error::custom)
    }
}

impl std::fmt::Display for PublicKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_text())
    }
}

/// Hex-encoded ed25519 signature, as it travels on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature(String);

impl Signature {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Signature {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

pub struct KeyPair {
    pub public: PublicKey,
    signing_key: SigningKey,
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        let public = PublicKey(signing_key.verifying_key());
        KeyPair {
            public,
            signing_key,
        }
    }

    pub fn private_sign(&self, message: &str) -> Signature {
        sign(&self.signing_key, message)
    }
}

/// Generate a fresh keypair. Ed25519 has no modulus parameter to
/// configure.
pub fn generate_keypair() -> KeyPair {
    KeyPair::generate()
}

/// Sign the canonical text form of `message` with `private_key`.
pub fn sign(private_key: &SigningKey, message: &str) -> Signature {
    let sig = private_key.sign(message.as_bytes());
    Signature(hex::encode(sig.to_bytes()))
}

/// Verify `signature` over `message` under `public_key`.
pub fn verify_signature(public_key: &PublicKey, message: &str, signature: &Signature) -> bool {
    let Ok(bytes) = hex::decode(&signature.0) else {
        return false;
    };
    let Ok(arr) = <[u8; 64]>::try_from(bytes.as_slice()) else {
        return false;
    };
    let sig = ed25519_dalek::Signature::from_bytes(&arr);
    public_key.0.verify(message.as_bytes(), &sig).is_ok()
}

/// `hash(publicKey_text, base64)`.
pub fn calc_address(public_key: &PublicKey) -> String {
    hash(public_key.to_text().as_bytes(), Encoding::Base64)
}

pub fn address_matches_key(address: &str, public_key: &PublicKey) -> bool {
    calc_address(public_key) == address
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_round_trip() {
        let kp = generate_keypair();
        let sig = sign_with_keypair(&kp, "hello");
        assert!(verify_signature(&kp.public, "hello", &sig));
        assert!(!verify_signature(&kp.public, "goodbye", &sig));
    }

    fn sign_with_keypair(kp: &KeyPair, msg: &str) -> Signature {
        kp.private_sign(msg)
    }

    #[test]
    fn empty_input_hashes_normally() {
        let h = hash(b"", Encoding::Hex);
        assert_eq!(h.len(), 64);
    }

    #[test]
    fn address_matches_only_its_own_key() {
        let kp1 = generate_keypair();
        let kp2 = generate_keypair();
        let addr1 = calc_address(&kp1.public);
        assert!(address_matches_key(&addr1, &kp1.public));
        assert!(!address_matches_key(&addr1, &kp2.public));
    }

    #[test]
    fn public_key_json_round_trips() {
        let kp = generate_keypair();
        let json = serde_json::to_string(&kp.public).unwrap();
        let back: PublicKey = serde_json::from_str(&json).unwrap();
        assert_eq!(kp.public, back);
    }
}

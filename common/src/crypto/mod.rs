//! Ed25519 primitives for node identity.
//!
//! Inter-node artifacts (block candidates, admin tokens) are signed with the
//! node's Ed25519 key. The message is always the ASCII hex encoding of the
//! canonical JSON bytes of the target value, so every node computes the same
//! bytes regardless of struct field order.

use ed25519_dalek::{
    pkcs8::{spki::EncodePublicKey, DecodePrivateKey, EncodePrivateKey},
    Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey, SECRET_KEY_LENGTH,
    SIGNATURE_LENGTH,
};
use pkcs8::LineEnding;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use thiserror::Error;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Size of Ed25519 secret key in bytes.
pub const ED25519_SECRET_KEY_SIZE: usize = SECRET_KEY_LENGTH;

/// Size of Ed25519 public key in bytes.
pub const ED25519_PUBLIC_KEY_SIZE: usize = 32;

/// Size of Ed25519 signature in bytes.
pub const ED25519_SIGNATURE_SIZE: usize = SIGNATURE_LENGTH;

/// Error types for signing key operations.
#[derive(Error, Debug, Clone)]
pub enum CryptoError {
    /// Invalid public key length.
    #[error(
        "Invalid public key length: expected {}, got {}",
        ED25519_PUBLIC_KEY_SIZE,
        _0
    )]
    InvalidPublicKeyLength(usize),

    /// Invalid signature length.
    #[error(
        "Invalid signature length: expected {}, got {}",
        ED25519_SIGNATURE_SIZE,
        _0
    )]
    InvalidSignatureLength(usize),

    /// Failed to parse public key bytes.
    #[error("Failed to parse public key")]
    InvalidPublicKey,

    /// Failed to parse a PEM encoded key.
    #[error("Invalid PEM key material: {0}")]
    InvalidPem(String),

    /// Signature verification failed.
    #[error("Signature verification failed")]
    VerificationFailed,

    /// Hex decoding error.
    #[error("Invalid hex string: {0}")]
    HexError(String),

    /// The target value could not be serialized.
    #[error("Unserializable signing target: {0}")]
    Serialize(String),
}

/// Canonical JSON bytes of a value: keys sorted lexicographically, no
/// whitespace, absent optional fields omitted. serde_json's default map is
/// a BTreeMap, which is exactly the sorted order required here; the
/// workspace must never enable its `preserve_order` feature.
pub fn canonical_json_bytes(value: &Value) -> Result<Vec<u8>, CryptoError> {
    serde_json::to_vec(value).map_err(|e| CryptoError::Serialize(e.to_string()))
}

/// Ed25519 public key (32 bytes).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Ed25519PublicKey([u8; ED25519_PUBLIC_KEY_SIZE]);

impl Ed25519PublicKey {
    pub fn from_bytes(bytes: [u8; ED25519_PUBLIC_KEY_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != ED25519_PUBLIC_KEY_SIZE {
            return Err(CryptoError::InvalidPublicKeyLength(slice.len()));
        }
        let mut bytes = [0u8; ED25519_PUBLIC_KEY_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex).map_err(|e| CryptoError::HexError(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ED25519_PUBLIC_KEY_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// SPKI PEM form, kept for wire compatibility with older deployments.
    pub fn to_pem(&self) -> Result<String, CryptoError> {
        let key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        key.to_public_key_pem(LineEnding::LF)
            .map_err(|e| CryptoError::InvalidPem(e.to_string()))
    }

    /// Verify a signature over a raw message.
    pub fn verify(&self, message: &[u8], signature: &Ed25519Signature) -> Result<(), CryptoError> {
        let verifying_key =
            VerifyingKey::from_bytes(&self.0).map_err(|_| CryptoError::InvalidPublicKey)?;
        let dalek_sig = DalekSignature::from_bytes(&signature.0);
        verifying_key
            .verify(message, &dalek_sig)
            .map_err(|_| CryptoError::VerificationFailed)
    }

    /// Verify a hex signature over the canonical JSON of `target`.
    /// Returns Ok(false) for a well-formed signature that does not match.
    pub fn verify_json(&self, sig_hex: &str, target: &Value) -> Result<bool, CryptoError> {
        let sig = Ed25519Signature::from_hex(sig_hex)?;
        let message = hex::encode(canonical_json_bytes(target)?);
        match self.verify(message.as_bytes(), &sig) {
            Ok(()) => Ok(true),
            Err(CryptoError::VerificationFailed) => Ok(false),
            Err(e) => Err(e),
        }
    }
}

impl fmt::Debug for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519PublicKey({})", self.to_hex())
    }
}

impl fmt::Display for Ed25519PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Ed25519 signature (64 bytes).
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct Ed25519Signature([u8; ED25519_SIGNATURE_SIZE]);

impl Ed25519Signature {
    pub fn from_bytes(bytes: [u8; ED25519_SIGNATURE_SIZE]) -> Self {
        Self(bytes)
    }

    pub fn from_slice(slice: &[u8]) -> Result<Self, CryptoError> {
        if slice.len() != ED25519_SIGNATURE_SIZE {
            return Err(CryptoError::InvalidSignatureLength(slice.len()));
        }
        let mut bytes = [0u8; ED25519_SIGNATURE_SIZE];
        bytes.copy_from_slice(slice);
        Ok(Self(bytes))
    }

    pub fn from_hex(hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(hex).map_err(|e| CryptoError::HexError(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; ED25519_SIGNATURE_SIZE] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Ed25519Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Ed25519Signature({}...)", &self.to_hex()[..16])
    }
}

/// Ed25519 key pair.
///
/// The secret key material is zeroized on drop.
#[derive(Clone, Zeroize, ZeroizeOnDrop)]
pub struct Ed25519KeyPair {
    #[zeroize(skip)]
    signing_key: SigningKey,
}

impl Ed25519KeyPair {
    /// Generate a new random key pair using a cryptographically secure RNG.
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Load a key pair from a PKCS#8 PEM string.
    pub fn from_pkcs8_pem(pem: &str) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_pkcs8_pem(pem)
            .map_err(|e| CryptoError::InvalidPem(e.to_string()))?;
        Ok(Self { signing_key })
    }

    /// PKCS#8 PEM form of the private key.
    pub fn to_pkcs8_pem(&self) -> Result<String, CryptoError> {
        self.signing_key
            .to_pkcs8_pem(LineEnding::LF)
            .map(|z| z.to_string())
            .map_err(|e| CryptoError::InvalidPem(e.to_string()))
    }

    pub fn public_key(&self) -> Ed25519PublicKey {
        Ed25519PublicKey::from_bytes(self.signing_key.verifying_key().to_bytes())
    }

    /// Sign a raw message.
    pub fn sign(&self, message: &[u8]) -> Ed25519Signature {
        let signature = self.signing_key.sign(message);
        Ed25519Signature::from_bytes(signature.to_bytes())
    }

    /// Sign the canonical JSON of `target`; returns the hex signature.
    pub fn sign_json(&self, target: &Value) -> Result<String, CryptoError> {
        let message = hex::encode(canonical_json_bytes(target)?);
        Ok(self.sign(message.as_bytes()).to_hex())
    }
}

impl fmt::Debug for Ed25519KeyPair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519KeyPair")
            .field("public_key", &self.public_key())
            .field("secret_key", &"[REDACTED]")
            .finish()
    }
}

/// A node's published verification key, stored on-chain as the `data` of a
/// reserved transaction tagged with `cc_tx`.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Eq)]
pub struct PublicKeyEntry {
    #[serde(rename = "nodeName")]
    pub node_name: String,
    /// SPKI PEM, kept for wire compatibility.
    #[serde(rename = "verifyKey")]
    pub verify_key: String,
    #[serde(rename = "verifyKeyHex")]
    pub verify_key_hex: String,
}

impl PublicKeyEntry {
    pub fn parse_key(&self) -> Result<Ed25519PublicKey, CryptoError> {
        Ed25519PublicKey::from_hex(&self.verify_key_hex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_keypair_generation() {
        let keypair = Ed25519KeyPair::generate();
        assert_eq!(keypair.public_key().as_bytes().len(), ED25519_PUBLIC_KEY_SIZE);
    }

    #[test]
    fn test_sign_and_verify_json() {
        let keypair = Ed25519KeyPair::generate();
        let target = json!({"b": 1, "a": {"y": [1, 2], "x": "v"}});

        let sig = keypair.sign_json(&target).unwrap();
        assert!(keypair.public_key().verify_json(&sig, &target).unwrap());
    }

    #[test]
    fn test_verify_wrong_target() {
        let keypair = Ed25519KeyPair::generate();
        let sig = keypair.sign_json(&json!({"a": 1})).unwrap();
        assert!(!keypair
            .public_key()
            .verify_json(&sig, &json!({"a": 2}))
            .unwrap());
    }

    #[test]
    fn test_verify_wrong_key() {
        let keypair1 = Ed25519KeyPair::generate();
        let keypair2 = Ed25519KeyPair::generate();
        let sig = keypair1.sign_json(&json!({"a": 1})).unwrap();
        assert!(!keypair2
            .public_key()
            .verify_json(&sig, &json!({"a": 1}))
            .unwrap());
    }

    #[test]
    fn test_canonical_bytes_are_key_order_independent() {
        let a = json!({"z": 1, "a": 2});
        let b: Value = serde_json::from_str(r#"{"a":2,"z":1}"#).unwrap();
        assert_eq!(
            canonical_json_bytes(&a).unwrap(),
            canonical_json_bytes(&b).unwrap()
        );
    }

    #[test]
    fn test_pem_roundtrip() {
        let keypair = Ed25519KeyPair::generate();
        let pem = keypair.to_pkcs8_pem().unwrap();
        let restored = Ed25519KeyPair::from_pkcs8_pem(&pem).unwrap();
        assert_eq!(keypair.public_key(), restored.public_key());
    }

    #[test]
    fn test_public_pem_has_spki_header() {
        let keypair = Ed25519KeyPair::generate();
        let pem = keypair.public_key().to_pem().unwrap();
        assert!(pem.starts_with("-----BEGIN PUBLIC KEY-----"));
    }

    #[test]
    fn test_invalid_hex_is_rejected() {
        assert!(Ed25519PublicKey::from_hex("zzzz").is_err());
        assert!(Ed25519Signature::from_hex("not-hex").is_err());
    }

    #[test]
    fn test_malformed_signature_is_an_error_not_false() {
        let keypair = Ed25519KeyPair::generate();
        let res = keypair
            .public_key()
            .verify_json("abcd", &json!({"a": 1}));
        assert!(res.is_err());
    }
}

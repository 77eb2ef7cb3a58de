//! Commit signing and verification
//!
//! Signatures are detached: they cover the canonical encoding of the
//! unsigned commit. Signers and verifiers are passed explicitly into every
//! call; there is no global key.

use std::fmt;
use std::str::FromStr;

use ed25519_dalek::{Signature, SigningKey, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Supported signature algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SignatureAlgorithm {
    Ed25519,
}

impl SignatureAlgorithm {
    pub fn as_str(&self) -> &'static str {
        match self {
            SignatureAlgorithm::Ed25519 => "ed25519",
        }
    }
}

impl FromStr for SignatureAlgorithm {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "ed25519" => Ok(SignatureAlgorithm::Ed25519),
            other => Err(SigningError::UnsupportedAlgorithm(other.to_string())),
        }
    }
}

/// A public key tagged with its algorithm, written as `<alg>:<hex>`
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PublicKey {
    pub algorithm: SignatureAlgorithm,
    pub bytes: Vec<u8>,
}

impl PublicKey {
    pub fn ed25519(bytes: [u8; 32]) -> Self {
        Self {
            algorithm: SignatureAlgorithm::Ed25519,
            bytes: bytes.to_vec(),
        }
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.algorithm.as_str(), hex::encode(&self.bytes))
    }
}

impl FromStr for PublicKey {
    type Err = SigningError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (alg, key_hex) = s
            .split_once(':')
            .ok_or_else(|| SigningError::KeyParseError(format!("missing algorithm prefix in {}", s)))?;
        let algorithm = alg.parse()?;
        let bytes = hex::decode(key_hex).map_err(|e| SigningError::KeyParseError(e.to_string()))?;
        Ok(Self { algorithm, bytes })
    }
}

/// Produces detached signatures
pub trait Signer: Send + Sync {
    fn public_key(&self) -> PublicKey;

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError>;
}

/// Checks detached signatures
pub trait Verifier: Send + Sync {
    fn verify(&self, message: &[u8], signature: &[u8], key: &PublicKey) -> Result<(), SigningError>;
}

/// Ed25519 signing key
pub struct Ed25519Signer {
    signing_key: SigningKey,
}

impl Ed25519Signer {
    /// Generate a new random Ed25519 key pair
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate(&mut OsRng);
        Self { signing_key }
    }

    /// Create from a 32-byte seed (hex-encoded)
    pub fn from_seed_hex(seed_hex: &str) -> Result<Self, SigningError> {
        let seed_bytes = hex::decode(seed_hex).map_err(|e| SigningError::KeyParseError(e.to_string()))?;
        let seed: [u8; 32] = seed_bytes.as_slice().try_into().map_err(|_| {
            SigningError::KeyParseError(format!("Seed must be 32 bytes, got {}", seed_bytes.len()))
        })?;
        Ok(Self {
            signing_key: SigningKey::from_bytes(&seed),
        })
    }

    /// Get the seed as hex (for storage)
    pub fn seed_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }
}

impl fmt::Debug for Ed25519Signer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ed25519Signer")
            .field("public_key", &self.public_key().to_string())
            .finish_non_exhaustive()
    }
}

impl Signer for Ed25519Signer {
    fn public_key(&self) -> PublicKey {
        PublicKey::ed25519(self.signing_key.verifying_key().to_bytes())
    }

    fn sign(&self, message: &[u8]) -> Result<Vec<u8>, SigningError> {
        use ed25519_dalek::Signer as _;
        Ok(self.signing_key.sign(message).to_bytes().to_vec())
    }
}

/// Verifier that dispatches on the key's algorithm
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultVerifier;

impl Verifier for DefaultVerifier {
    fn verify(&self, message: &[u8], signature: &[u8], key: &PublicKey) -> Result<(), SigningError> {
        match key.algorithm {
            SignatureAlgorithm::Ed25519 => verify_ed25519(message, signature, &key.bytes),
        }
    }
}

fn verify_ed25519(message: &[u8], signature: &[u8], key: &[u8]) -> Result<(), SigningError> {
    use ed25519_dalek::Verifier as _;

    let key: [u8; 32] = key.try_into().map_err(|_| {
        SigningError::KeyParseError(format!("Public key must be 32 bytes, got {}", key.len()))
    })?;
    let verifying_key =
        VerifyingKey::from_bytes(&key).map_err(|e| SigningError::KeyParseError(e.to_string()))?;

    let sig: [u8; 64] = signature.try_into().map_err(|_| {
        SigningError::SignatureParseError(format!("Signature must be 64 bytes, got {}", signature.len()))
    })?;
    let signature = Signature::from_bytes(&sig);

    verifying_key
        .verify(message, &signature)
        .map_err(|_| SigningError::InvalidSignature)
}

/// Verify a detached signature with the default verifier
pub fn verify_signature(message: &[u8], signature: &[u8], key: &PublicKey) -> Result<(), SigningError> {
    DefaultVerifier.verify(message, signature, key)
}

/// Signature verification policy for imported data
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VerificationPolicy {
    /// No signature verification
    Off,
    /// Warn on invalid signatures but continue
    Warn,
    /// Require valid signatures
    #[default]
    Require,
}

impl VerificationPolicy {
    /// Parse from string
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "off" => Some(VerificationPolicy::Off),
            "warn" => Some(VerificationPolicy::Warn),
            "require" => Some(VerificationPolicy::Require),
            _ => None,
        }
    }

    /// Convert to string
    pub fn as_str(&self) -> &'static str {
        match self {
            VerificationPolicy::Off => "off",
            VerificationPolicy::Warn => "warn",
            VerificationPolicy::Require => "require",
        }
    }
}

/// Errors that can occur during signing or verification
#[derive(Debug, Error)]
pub enum SigningError {
    #[error("invalid signature")]
    InvalidSignature,

    #[error("unsupported signature algorithm: {0}")]
    UnsupportedAlgorithm(String),

    #[error("key parse error: {0}")]
    KeyParseError(String),

    #[error("signature parse error: {0}")]
    SignatureParseError(String),
}

use ed25519_dalek::pkcs8::{DecodePrivateKey, EncodePrivateKey};
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use ripemd::Ripemd160;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// A 32-byte SHA-256 digest (block hashes, transaction ids)
pub type Hash = [u8; 32];

/// A 20-byte RIPEMD-160(SHA-256(public key)) digest identifying an owner
pub type PubKeyHash = [u8; 20];

/// Version byte prepended to the public key hash in an address
pub const ADDRESS_VERSION: u8 = 0x00;

/// Number of checksum bytes appended to an address payload
pub const ADDRESS_CHECKSUM_LEN: usize = 4;

const ADDRESS_PAYLOAD_LEN: usize = 1 + 20 + ADDRESS_CHECKSUM_LEN;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Malformed address: {0}")]
    MalformedAddress(String),

    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Key encoding error: {0}")]
    KeyEncoding(String),
}

/// Computes the SHA-256 digest of `data`
pub fn sha256(data: &[u8]) -> Hash {
    Sha256::digest(data).into()
}

/// Hashes a raw public key into the 20-byte owner identity
pub fn hash_pub_key(public_key: &[u8]) -> PubKeyHash {
    let sha = Sha256::digest(public_key);
    Ripemd160::digest(sha).into()
}

/// First four bytes of a double SHA-256 over `payload`
fn checksum(payload: &[u8]) -> [u8; ADDRESS_CHECKSUM_LEN] {
    let second = sha256(&sha256(payload));
    let mut out = [0u8; ADDRESS_CHECKSUM_LEN];
    out.copy_from_slice(&second[..ADDRESS_CHECKSUM_LEN]);
    out
}

/// Represents a wallet address: base58(version ‖ pubkey_hash ‖ checksum)
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Address(pub String);

impl Address {
    /// Encodes an owner's public key hash as an address
    pub fn from_pub_key_hash(pub_key_hash: &PubKeyHash) -> Self {
        let mut payload = Vec::with_capacity(ADDRESS_PAYLOAD_LEN);
        payload.push(ADDRESS_VERSION);
        payload.extend_from_slice(pub_key_hash);
        let sum = checksum(&payload);
        payload.extend_from_slice(&sum);

        Address(bs58::encode(payload).into_string())
    }

    /// Decodes the address back to the public key hash, validating version and checksum
    pub fn pub_key_hash(&self) -> Result<PubKeyHash, CryptoError> {
        let payload = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::MalformedAddress(e.to_string()))?;

        if payload.len() != ADDRESS_PAYLOAD_LEN {
            return Err(CryptoError::MalformedAddress(format!(
                "expected {} decoded bytes, got {}",
                ADDRESS_PAYLOAD_LEN,
                payload.len()
            )));
        }

        let (versioned, sum) = payload.split_at(ADDRESS_PAYLOAD_LEN - ADDRESS_CHECKSUM_LEN);
        if checksum(versioned)[..] != *sum {
            return Err(CryptoError::MalformedAddress("checksum mismatch".to_string()));
        }
        if versioned[0] != ADDRESS_VERSION {
            return Err(CryptoError::MalformedAddress(format!(
                "unknown version byte {:#04x}",
                versioned[0]
            )));
        }

        let mut hash = [0u8; 20];
        hash.copy_from_slice(&versioned[1..]);
        Ok(hash)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for Address {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let address = Address(s.to_string());
        // Reject anything that does not decode to a valid payload
        address.pub_key_hash()?;
        Ok(address)
    }
}

/// Represents a wallet with a keypair
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
    address: Address,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        let mut csprng = OsRng;
        Self::from_signing_key(SigningKey::generate(&mut csprng))
    }

    /// Restores a wallet from a PKCS#8 DER encoded private key
    pub fn from_pkcs8_der(der: &[u8]) -> Result<Self, CryptoError> {
        let signing_key = SigningKey::from_pkcs8_der(der)
            .map_err(|e| CryptoError::InvalidPrivateKey(e.to_string()))?;

        Ok(Self::from_signing_key(signing_key))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let verifying_key = VerifyingKey::from(&signing_key);
        let address = Address::from_pub_key_hash(&hash_pub_key(verifying_key.as_bytes()));

        Wallet {
            signing_key,
            verifying_key,
            address,
        }
    }

    /// Gets the wallet's address
    pub fn address(&self) -> &Address {
        &self.address
    }

    /// Raw public key bytes as carried in transaction inputs
    pub fn public_key(&self) -> Vec<u8> {
        self.verifying_key.as_bytes().to_vec()
    }

    pub fn pub_key_hash(&self) -> PubKeyHash {
        hash_pub_key(self.verifying_key.as_bytes())
    }

    /// Signs a message with the wallet's private key
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        self.signing_key.sign(message).to_bytes().to_vec()
    }

    /// Exports the private key as PKCS#8 DER
    pub fn export_pkcs8_der(&self) -> Result<Vec<u8>, CryptoError> {
        let document = self
            .signing_key
            .to_pkcs8_der()
            .map_err(|e| CryptoError::KeyEncoding(e.to_string()))?;

        Ok(document.as_bytes().to_vec())
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Self::new()
    }
}

/// Verifies a signature against a message and raw public key bytes
///
/// Malformed keys or signatures are errors; a well-formed signature that
/// does not match yields `Ok(false)`.
pub fn verify_signature(
    message: &[u8],
    signature: &[u8],
    public_key: &[u8],
) -> Result<bool, CryptoError> {
    let key_bytes: [u8; 32] = public_key.try_into().map_err(|_| {
        CryptoError::InvalidPublicKey(format!("expected 32 bytes, got {}", public_key.len()))
    })?;
    let public_key = VerifyingKey::from_bytes(&key_bytes)
        .map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))?;

    let signature =
        Signature::from_slice(signature).map_err(|e| CryptoError::InvalidSignature(e.to_string()))?;

    Ok(public_key.verify(message, &signature).is_ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wallet_creation() {
        let wallet = Wallet::new();
        assert!(!wallet.address().0.is_empty());
        assert_eq!(wallet.public_key().len(), 32);
    }

    #[test]
    fn test_signing_and_verification() {
        let wallet = Wallet::new();
        let message = b"Hello, world!";

        let signature = wallet.sign(message);
        assert!(verify_signature(message, &signature, &wallet.public_key()).unwrap());

        let wrong_message = b"Wrong message";
        assert!(!verify_signature(wrong_message, &signature, &wallet.public_key()).unwrap());

        let other = Wallet::new();
        assert!(!verify_signature(message, &signature, &other.public_key()).unwrap());
    }

    #[test]
    fn test_malformed_signature_is_error() {
        let wallet = Wallet::new();
        let result = verify_signature(b"msg", &[1, 2, 3], &wallet.public_key());
        assert!(matches!(result, Err(CryptoError::InvalidSignature(_))));
    }

    #[test]
    fn test_address_round_trip() {
        let wallet = Wallet::new();
        let address = wallet.address();

        assert_eq!(address.pub_key_hash().unwrap(), wallet.pub_key_hash());

        let parsed: Address = address.0.parse().unwrap();
        assert_eq!(&parsed, address);
    }

    #[test]
    fn test_corrupted_address_fails_checksum() {
        let hash = hash_pub_key(b"some public key");
        let address = Address::from_pub_key_hash(&hash);
        let payload = bs58::decode(&address.0).into_vec().unwrap();

        for i in 0..payload.len() {
            let mut corrupted = payload.clone();
            corrupted[i] ^= 0x01;
            let bad = Address(bs58::encode(corrupted).into_string());
            assert!(
                matches!(bad.pub_key_hash(), Err(CryptoError::MalformedAddress(_))),
                "corruption at byte {} was accepted",
                i
            );
        }
    }

    #[test]
    fn test_garbage_address_rejected() {
        assert!("not-base58-0OIl".parse::<Address>().is_err());
        assert!("abc".parse::<Address>().is_err());
    }

    #[test]
    fn test_pkcs8_round_trip() {
        let wallet = Wallet::new();
        let der = wallet.export_pkcs8_der().unwrap();

        let restored = Wallet::from_pkcs8_der(&der).unwrap();
        assert_eq!(restored.address(), wallet.address());
        assert_eq!(restored.public_key(), wallet.public_key());
    }
}

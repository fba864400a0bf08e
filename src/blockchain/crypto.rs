use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use std::fmt;
use std::str::FromStr;

/// Errors that can occur during cryptographic operations
#[derive(Debug, Error)]
pub enum CryptoError {
    #[error("Invalid public key: {0}")]
    InvalidPublicKey(String),

    #[error("Invalid private key: {0}")]
    InvalidPrivateKey(String),

    #[error("Invalid signature: {0}")]
    InvalidSignature(String),

    #[error("Decoding error: {0}")]
    DecodingError(String),
}

/// Hash of an all-zero block, used as the genesis previous hash
pub const ZERO_HASH: &str = "0000000000000000000000000000000000000000000000000000000000000000";

/// SHA-256 of `data` as a lowercase hex string
pub fn hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hashes two hex digests together (left first)
pub fn hash_pair(left: &str, right: &str) -> String {
    let mut data = String::with_capacity(left.len() + right.len());
    data.push_str(left);
    data.push_str(right);
    hash(data.as_bytes())
}

/// Merkle tree over an ordered list of leaf hashes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MerkleTree {
    /// Root hash, empty when there are no leaves
    pub root: String,

    /// Every level from the leaves up to the root
    pub levels: Vec<Vec<String>>,
}

/// Builds a Merkle tree by pairwise hashing
///
/// Levels with an odd number of nodes duplicate their last node. The root
/// depends on leaf order: the same leaves in a different order generally
/// produce a different root.
pub fn merkle_tree(leaves: &[String]) -> MerkleTree {
    if leaves.is_empty() {
        return MerkleTree {
            root: String::new(),
            levels: Vec::new(),
        };
    }

    let mut levels = vec![leaves.to_vec()];

    while let Some(level) = levels.last() {
        if level.len() == 1 {
            break;
        }

        let next: Vec<String> = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => hash_pair(left, right),
                [single] => hash_pair(single, single),
                _ => unreachable!("chunks(2) yields one or two items"),
            })
            .collect();

        levels.push(next);
    }

    let root = levels
        .last()
        .and_then(|level| level.first())
        .cloned()
        .unwrap_or_default();

    MerkleTree { root, levels }
}

/// Commits to `data` without revealing it until `nonce` is disclosed
pub fn commitment(data: &str, nonce: &str) -> String {
    hash(format!("{}:{}", data, nonce).as_bytes())
}

/// Checks a revealed `data` and `nonce` against an earlier commitment
pub fn verify_commitment(commitment_hash: &str, data: &str, nonce: &str) -> bool {
    commitment(data, nonce) == commitment_hash
}

/// Identifier of a peer: the base58 encoding of its ed25519 verifying key
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(pub String);

impl PeerId {
    /// Creates a peer id from a public key
    pub fn from_public_key(public_key: &VerifyingKey) -> Self {
        PeerId(bs58::encode(public_key.as_bytes()).into_string())
    }

    /// Converts the peer id back to a public key
    pub fn to_public_key(&self) -> Result<VerifyingKey, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let key_bytes: [u8; 32] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidPublicKey("Invalid public key bytes".to_string())
        })?;

        VerifyingKey::from_bytes(&key_bytes).map_err(|e| CryptoError::InvalidPublicKey(e.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for PeerId {
    type Err = CryptoError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let peer = PeerId(s.to_string());
        peer.to_public_key()?;
        Ok(peer)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        PeerId(s.to_string())
    }
}

/// Represents a digital signature (base58)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DigitalSignature(pub String);

impl DigitalSignature {
    /// Creates a new digital signature from a signature
    pub fn from_signature(signature: &Signature) -> Self {
        DigitalSignature(bs58::encode(signature.to_bytes()).into_string())
    }

    /// Converts the digital signature to a signature
    pub fn to_signature(&self) -> Result<Signature, CryptoError> {
        let bytes = bs58::decode(&self.0)
            .into_vec()
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;

        let signature_bytes: [u8; 64] = bytes.try_into().map_err(|_| {
            CryptoError::InvalidSignature("Invalid signature length".to_string())
        })?;

        Ok(Signature::from_bytes(&signature_bytes))
    }
}

/// A signature together with the peer that produced it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignatureRecord {
    pub signer: PeerId,
    pub signature: DigitalSignature,
}

impl SignatureRecord {
    /// Placeholder used while a structure is being built, never verifies
    pub fn unsigned() -> Self {
        SignatureRecord {
            signer: PeerId(String::new()),
            signature: DigitalSignature(String::new()),
        }
    }
}

/// Pluggable signing backend
///
/// `verify` must only depend on the message and the record, so any node can
/// check a record produced by any other node.
pub trait SignatureScheme: Send + Sync {
    /// The identity signatures are produced under
    fn peer_id(&self) -> &PeerId;

    fn sign(&self, message: &[u8]) -> SignatureRecord;

    fn verify(&self, message: &[u8], record: &SignatureRecord) -> bool;
}

/// Verifies an ed25519 signature record
pub fn verify_signature(message: &[u8], record: &SignatureRecord) -> Result<bool, CryptoError> {
    let public_key = record.signer.to_public_key()?;
    let signature = record.signature.to_signature()?;

    Ok(public_key.verify(message, &signature).is_ok())
}

/// Represents a wallet with a keypair
#[derive(Debug, Clone)]
pub struct Wallet {
    signing_key: SigningKey,
    peer_id: PeerId,
}

impl Wallet {
    /// Creates a new wallet with a random keypair
    pub fn new() -> Self {
        let mut csprng = OsRng;
        let signing_key = SigningKey::generate(&mut csprng);
        Wallet::from_signing_key(signing_key)
    }

    /// Creates a wallet from an existing secret key
    pub fn from_secret_key(secret_key_bytes: &[u8]) -> Result<Self, CryptoError> {
        let bytes_array: [u8; 32] = secret_key_bytes.try_into().map_err(|_| {
            CryptoError::InvalidPrivateKey("Invalid private key length".to_string())
        })?;

        Ok(Wallet::from_signing_key(SigningKey::from_bytes(&bytes_array)))
    }

    /// Creates a wallet from a hex encoded secret key
    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, CryptoError> {
        let bytes = hex::decode(secret_hex.trim())
            .map_err(|e| CryptoError::DecodingError(e.to_string()))?;
        Wallet::from_secret_key(&bytes)
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let peer_id = PeerId::from_public_key(&signing_key.verifying_key());
        Wallet {
            signing_key,
            peer_id,
        }
    }

    /// Gets the wallet's public key
    pub fn public_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    /// Exports the wallet's secret key as bytes
    pub fn export_secret_key(&self) -> Vec<u8> {
        self.signing_key.to_bytes().to_vec()
    }
}

impl Default for Wallet {
    fn default() -> Self {
        Wallet::new()
    }
}

impl SignatureScheme for Wallet {
    fn peer_id(&self) -> &PeerId {
        &self.peer_id
    }

    fn sign(&self, message: &[u8]) -> SignatureRecord {
        let signature = self.signing_key.sign(message);
        SignatureRecord {
            signer: self.peer_id.clone(),
            signature: DigitalSignature::from_signature(&signature),
        }
    }

    fn verify(&self, message: &[u8], record: &SignatureRecord) -> bool {
        verify_signature(message, record).unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn leaves(n: usize) -> Vec<String> {
        (0..n).map(|i| hash(format!("leaf-{}", i).as_bytes())).collect()
    }

    #[test]
    fn test_hash_is_hex_sha256() {
        let digest = hash(b"hello world");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
        assert_eq!(ZERO_HASH.len(), 64);
    }

    #[test]
    fn test_merkle_empty_and_single() {
        let empty = merkle_tree(&[]);
        assert_eq!(empty.root, "");
        assert!(empty.levels.is_empty());

        let single = leaves(1);
        assert_eq!(merkle_tree(&single).root, single[0]);
    }

    #[test]
    fn test_merkle_odd_level_duplicates_last() {
        let three = leaves(3);
        let tree = merkle_tree(&three);

        let left = hash_pair(&three[0], &three[1]);
        let right = hash_pair(&three[2], &three[2]);
        assert_eq!(tree.root, hash_pair(&left, &right));
        assert_eq!(tree.levels.len(), 3);
        assert_eq!(tree.levels[1].len(), 2);
    }

    #[test]
    fn test_merkle_is_deterministic_and_order_sensitive() {
        let ordered = leaves(6);
        assert_eq!(merkle_tree(&ordered).root, merkle_tree(&ordered).root);

        let mut reordered = ordered.clone();
        reordered.swap(0, 5);
        // A different order is expected to summarise to a different root
        assert_ne!(merkle_tree(&ordered).root, merkle_tree(&reordered).root);
    }

    #[test]
    fn test_commitment_reveal() {
        let committed = commitment("secret vote", "n0nce");
        assert!(verify_commitment(&committed, "secret vote", "n0nce"));
        assert!(!verify_commitment(&committed, "secret vote", "other"));
        assert!(!verify_commitment(&committed, "another vote", "n0nce"));
    }

    #[test]
    fn test_signing_and_verification() {
        let wallet = Wallet::new();
        let message = b"Hello, world!";

        let record = wallet.sign(message);
        assert_eq!(&record.signer, wallet.peer_id());
        assert!(wallet.verify(message, &record));

        // Same message and key always verify
        assert!(wallet.verify(message, &wallet.sign(message)));

        assert!(!wallet.verify(b"Wrong message", &record));
    }

    #[test]
    fn test_signature_from_other_signer_fails() {
        let alice = Wallet::new();
        let mallory = Wallet::new();
        let message = b"block hash";

        // Claiming alice as signer over mallory's signature must not verify
        let mut forged = mallory.sign(message);
        forged.signer = alice.peer_id().clone();
        assert!(!alice.verify(message, &forged));

        assert!(!alice.verify(message, &SignatureRecord::unsigned()));
    }

    #[test]
    fn test_peer_id_conversion() {
        let wallet = Wallet::new();
        let public_key = wallet.peer_id().to_public_key().unwrap();
        assert_eq!(public_key.as_bytes(), wallet.public_key().as_bytes());

        assert!(PeerId::from_str("not-base58-0OIl").is_err());
    }

    #[test]
    fn test_wallet_from_secret_hex_roundtrip() {
        let wallet = Wallet::new();
        let secret_hex = hex::encode(wallet.export_secret_key());
        let restored = Wallet::from_secret_hex(&secret_hex).unwrap();
        assert_eq!(restored.peer_id(), wallet.peer_id());

        assert!(Wallet::from_secret_key(&[1u8; 7]).is_err());
    }
}

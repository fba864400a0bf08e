use serde::{Deserialize, Serialize};
use serde_json::json;

use super::crypto::{merkle_tree, PeerId, SignatureRecord, SignatureScheme};
use super::event::Event;
use super::pow::{hash_with_nonce, meets_difficulty};

/// Nonce and difficulty a block was sealed with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Proof {
    pub nonce: u64,
    pub difficulty: usize,
}

/// Represents a block in the chain
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Block {
    /// Index of the block in the chain, genesis is 0
    pub index: u64,

    /// Milliseconds since the Unix epoch
    pub timestamp: u64,

    /// Events sealed into this block, in queue order
    pub events: Vec<Event>,

    /// Hash of the previous block
    pub previous_hash: String,

    /// Hash of the header and nonce
    pub hash: String,

    /// Merkle root over the event hashes
    pub merkle_root: String,

    pub proof: Proof,

    /// Peer that sealed the block
    pub producer_id: PeerId,

    /// Producer's signature over `hash`
    pub signature: SignatureRecord,
}

/// Summary of a block, as exchanged during sync
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockSummary {
    pub index: u64,
    pub hash: String,
    pub timestamp: u64,
}

impl Block {
    /// Merkle root of an ordered list of events
    pub fn merkle_root_of(events: &[Event]) -> String {
        let leaves: Vec<String> = events.iter().map(|event| event.hash.clone()).collect();
        merkle_tree(&leaves).root
    }

    /// Canonical encoding of every header field except the nonce
    ///
    /// The proof-of-work input is this string followed by the nonce.
    pub fn header_data(
        index: u64,
        timestamp: u64,
        previous_hash: &str,
        merkle_root: &str,
        producer_id: &PeerId,
        difficulty: usize,
    ) -> String {
        json!({
            "index": index,
            "timestamp": timestamp,
            "previousHash": previous_hash,
            "merkleRoot": merkle_root,
            "producerId": producer_id,
            "difficulty": difficulty,
        })
        .to_string()
    }

    /// Header encoding of this block
    pub fn header(&self) -> String {
        Block::header_data(
            self.index,
            self.timestamp,
            &self.previous_hash,
            &self.merkle_root,
            &self.producer_id,
            self.proof.difficulty,
        )
    }

    /// Calculates the hash of the block from its current fields
    pub fn calculate_hash(&self) -> String {
        hash_with_nonce(&self.header(), self.proof.nonce)
    }

    /// Whether the stored hash satisfies the declared difficulty
    pub fn meets_difficulty(&self) -> bool {
        meets_difficulty(&self.hash, self.proof.difficulty)
    }

    /// Whether the producer signed the stored hash
    pub fn has_valid_signature(&self, verifier: &dyn SignatureScheme) -> bool {
        self.signature.signer == self.producer_id
            && verifier.verify(self.hash.as_bytes(), &self.signature)
    }

    pub fn summary(&self) -> BlockSummary {
        BlockSummary {
            index: self.index,
            hash: self.hash.clone(),
            timestamp: self.timestamp,
        }
    }

    pub fn is_genesis(&self) -> bool {
        self.index == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::{Wallet, ZERO_HASH};
    use crate::blockchain::pow::proof_of_work;

    fn sealed_block(wallet: &Wallet) -> Block {
        let events = vec![Event::new("note", json!(1), ZERO_HASH, 10, wallet)];
        let merkle_root = Block::merkle_root_of(&events);
        let header = Block::header_data(0, 10, ZERO_HASH, &merkle_root, wallet.peer_id(), 2);
        let solution = proof_of_work(&header, 2);

        Block {
            index: 0,
            timestamp: 10,
            events,
            previous_hash: ZERO_HASH.to_string(),
            hash: solution.hash.clone(),
            merkle_root,
            proof: Proof {
                nonce: solution.nonce,
                difficulty: 2,
            },
            producer_id: wallet.peer_id().clone(),
            signature: wallet.sign(solution.hash.as_bytes()),
        }
    }

    #[test]
    fn test_calculate_hash_matches_sealed_hash() {
        let wallet = Wallet::new();
        let block = sealed_block(&wallet);

        assert_eq!(block.calculate_hash(), block.hash);
        assert!(block.meets_difficulty());
        assert!(block.has_valid_signature(&wallet));
        assert!(block.is_genesis());
    }

    #[test]
    fn test_header_changes_change_hash() {
        let wallet = Wallet::new();
        let block = sealed_block(&wallet);

        let mut moved = block.clone();
        moved.timestamp += 1;
        assert_ne!(moved.calculate_hash(), block.hash);

        let mut renonced = block.clone();
        renonced.proof.nonce += 1;
        assert_ne!(renonced.calculate_hash(), block.hash);
    }

    #[test]
    fn test_signature_must_come_from_producer() {
        let wallet = Wallet::new();
        let other = Wallet::new();
        let mut block = sealed_block(&wallet);

        block.signature = other.sign(block.hash.as_bytes());
        assert!(!block.has_valid_signature(&wallet));
    }

    #[test]
    fn test_summary() {
        let wallet = Wallet::new();
        let block = sealed_block(&wallet);
        let summary = block.summary();

        assert_eq!(summary.index, 0);
        assert_eq!(summary.hash, block.hash);
        assert_eq!(summary.timestamp, 10);
    }
}

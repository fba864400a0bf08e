use thiserror::Error;

use super::block::Block;
use super::crypto::{SignatureScheme, ZERO_HASH};

/// Reasons a block, chain or signed message fails verification
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("Bad signature on {0}")]
    BadSignature(String),

    #[error("Weight {0} is outside [0, 1]")]
    BadWeight(String),

    #[error("Finalization for {0} carries a result that did not reach consensus")]
    BadFinalization(String),

    #[error("Chain is empty")]
    EmptyChain,

    #[error("Genesis block is malformed")]
    BadGenesis,

    #[error("Block {index}: expected index {expected}")]
    BadIndex { index: u64, expected: u64 },

    #[error("Block {0}: previous hash does not match the prior block")]
    BrokenLinkage(u64),

    #[error("Block {index}: event {event} failed verification")]
    BadEvent { index: u64, event: String },

    #[error("Block {0}: merkle root does not match its events")]
    BadMerkleRoot(u64),

    #[error("Block {0}: stored hash does not match its contents")]
    BadHash(u64),

    #[error("Block {0}: hash does not meet the declared difficulty")]
    InsufficientWork(u64),

    #[error("Block {0}: producer signature is invalid")]
    BadProducerSignature(u64),
}

/// Validates one block against its predecessor
///
/// # Arguments
///
/// * `block` - The block to check
/// * `previous` - The prior block, `None` for genesis
/// * `verifier` - Any signature scheme; records carry their own signer
pub fn validate_block(
    block: &Block,
    previous: Option<&Block>,
    verifier: &dyn SignatureScheme,
) -> Result<(), ValidationError> {
    match previous {
        None => {
            if block.index != 0 || block.previous_hash != ZERO_HASH {
                return Err(ValidationError::BadGenesis);
            }
        }
        Some(previous) => {
            let expected = previous.index + 1;
            if block.index != expected {
                return Err(ValidationError::BadIndex {
                    index: block.index,
                    expected,
                });
            }

            if block.previous_hash != previous.hash {
                return Err(ValidationError::BrokenLinkage(block.index));
            }
        }
    }

    if let Some(event) = block.events.iter().find(|event| !event.verify(verifier)) {
        return Err(ValidationError::BadEvent {
            index: block.index,
            event: event.id.clone(),
        });
    }

    if block.merkle_root != Block::merkle_root_of(&block.events) {
        return Err(ValidationError::BadMerkleRoot(block.index));
    }

    if block.hash != block.calculate_hash() {
        return Err(ValidationError::BadHash(block.index));
    }

    if !block.meets_difficulty() {
        return Err(ValidationError::InsufficientWork(block.index));
    }

    if !block.has_valid_signature(verifier) {
        return Err(ValidationError::BadProducerSignature(block.index));
    }

    Ok(())
}

/// Validates a whole chain, stopping at the first failure
pub fn validate_blocks(blocks: &[Block], verifier: &dyn SignatureScheme) -> Result<(), ValidationError> {
    let genesis = blocks.first().ok_or(ValidationError::EmptyChain)?;
    validate_block(genesis, None, verifier)?;

    for pair in blocks.windows(2) {
        validate_block(&pair[1], Some(&pair[0]), verifier)?;
    }

    Ok(())
}

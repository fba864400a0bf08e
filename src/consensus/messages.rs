// Signed consensus messages
//
// Every message signs the canonical JSON of its fields without the signature.
// Weights are signed at fixed precision so a value that went through a JSON
// round trip still verifies.

use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::blockchain::block::BlockSummary;
use crate::blockchain::crypto::{PeerId, SignatureRecord, SignatureScheme};
use crate::blockchain::validation::ValidationError;

use super::vote::{ConsensusResult, Decision};

/// Canonical text of a weight inside signed payloads
pub fn weight_repr(weight: f64) -> String {
    format!("{:.6}", weight)
}

/// Common behaviour of signed consensus messages
pub trait SignedMessage {
    /// Name used in logs and errors
    const KIND: &'static str;

    /// Bytes covered by the signature
    fn signing_bytes(&self) -> Vec<u8>;

    fn signature(&self) -> &SignatureRecord;

    /// Identity the message claims to come from, if it names one
    fn claimed_signer(&self) -> Option<&PeerId> {
        None
    }

    /// Checks the signature and that it belongs to the claimed sender
    fn verify(&self, verifier: &dyn SignatureScheme) -> Result<(), ValidationError> {
        let record = self.signature();
        let claimed = self.claimed_signer().map_or(true, |peer| peer == &record.signer);

        if claimed && verifier.verify(&self.signing_bytes(), record) {
            Ok(())
        } else {
            Err(ValidationError::BadSignature(Self::KIND.to_string()))
        }
    }

    /// Peer that signed the message
    fn signer(&self) -> &PeerId {
        &self.signature().signer
    }
}

/// Announces a sealed block for voting
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalMessage {
    pub block_hash: String,
    pub block_index: u64,
    pub timestamp: u64,
    pub event_count: usize,
    pub merkle_root: String,
    pub proposer_id: PeerId,
    pub signature: SignatureRecord,
}

impl SignedMessage for ProposalMessage {
    const KIND: &'static str = "propose_block";

    fn signing_bytes(&self) -> Vec<u8> {
        json!({
            "blockHash": self.block_hash,
            "blockIndex": self.block_index,
            "timestamp": self.timestamp,
            "eventCount": self.event_count,
            "merkleRoot": self.merkle_root,
            "proposerId": self.proposer_id,
        })
        .to_string()
        .into_bytes()
    }

    fn signature(&self) -> &SignatureRecord {
        &self.signature
    }

    fn claimed_signer(&self) -> Option<&PeerId> {
        Some(&self.proposer_id)
    }
}

/// A peer's vote on a proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoteMessage {
    pub block_hash: String,
    pub voter_id: PeerId,
    pub decision: Decision,
    pub weight: f64,
    pub timestamp: u64,
    pub signature: SignatureRecord,
}

impl SignedMessage for VoteMessage {
    const KIND: &'static str = "cast_vote";

    fn signing_bytes(&self) -> Vec<u8> {
        json!({
            "blockHash": self.block_hash,
            "voterId": self.voter_id,
            "decision": self.decision,
            "weight": weight_repr(self.weight),
            "timestamp": self.timestamp,
        })
        .to_string()
        .into_bytes()
    }

    fn signature(&self) -> &SignatureRecord {
        &self.signature
    }

    fn claimed_signer(&self) -> Option<&PeerId> {
        Some(&self.voter_id)
    }
}

/// Announces that a block reached consensus
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FinalizationMessage {
    pub block_hash: String,
    pub consensus: ConsensusResult,
    pub timestamp: u64,
    pub signature: SignatureRecord,
}

impl SignedMessage for FinalizationMessage {
    const KIND: &'static str = "finalize_block";

    fn signing_bytes(&self) -> Vec<u8> {
        json!({
            "blockHash": self.block_hash,
            "consensus": {
                "blockHash": self.consensus.block_hash,
                "reached": self.consensus.reached,
                "approvedCount": self.consensus.approved_count,
                "totalVotes": self.consensus.total_votes,
                "averageWeight": weight_repr(self.consensus.average_weight),
            },
            "timestamp": self.timestamp,
        })
        .to_string()
        .into_bytes()
    }

    fn signature(&self) -> &SignatureRecord {
        &self.signature
    }
}

/// Asks a peer for the blocks after `last_known_index`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestMessage {
    pub last_known_index: u64,
    pub timestamp: u64,
    pub signature: SignatureRecord,
}

impl SignedMessage for SyncRequestMessage {
    const KIND: &'static str = "sync_request";

    fn signing_bytes(&self) -> Vec<u8> {
        json!({
            "lastKnownIndex": self.last_known_index,
            "timestamp": self.timestamp,
        })
        .to_string()
        .into_bytes()
    }

    fn signature(&self) -> &SignatureRecord {
        &self.signature
    }
}

/// Summaries of the blocks a sync request asked for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncResponseMessage {
    pub blocks: Vec<BlockSummary>,
    pub timestamp: u64,
    pub signature: SignatureRecord,
}

impl SignedMessage for SyncResponseMessage {
    const KIND: &'static str = "sync_response";

    fn signing_bytes(&self) -> Vec<u8> {
        json!({
            "blocks": self.blocks,
            "timestamp": self.timestamp,
        })
        .to_string()
        .into_bytes()
    }

    fn signature(&self) -> &SignatureRecord {
        &self.signature
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::Wallet;

    fn signed_vote(wallet: &Wallet, weight: f64) -> VoteMessage {
        let mut vote = VoteMessage {
            block_hash: "abc".to_string(),
            voter_id: wallet.peer_id().clone(),
            decision: Decision::Approve,
            weight,
            timestamp: 5,
            signature: SignatureRecord::unsigned(),
        };
        vote.signature = wallet.sign(&vote.signing_bytes());
        vote
    }

    #[test]
    fn test_vote_survives_json_round_trip() {
        let wallet = Wallet::new();
        let vote = signed_vote(&wallet, 0.1 + 0.2);

        let text = serde_json::to_string(&vote).unwrap();
        let decoded: VoteMessage = serde_json::from_str(&text).unwrap();

        assert!(decoded.verify(&wallet).is_ok());
        assert!(text.contains("\"voterId\""));
        assert!(text.contains("\"decision\":\"approve\""));
    }

    #[test]
    fn test_vote_from_impostor_is_rejected() {
        let alice = Wallet::new();
        let mallory = Wallet::new();

        let mut vote = signed_vote(&mallory, 0.9);
        vote.voter_id = alice.peer_id().clone();
        assert_eq!(
            vote.verify(&alice),
            Err(ValidationError::BadSignature("cast_vote".to_string()))
        );

        let mut vote = signed_vote(&alice, 0.9);
        vote.decision = Decision::Reject;
        assert!(vote.verify(&alice).is_err());
    }

    #[test]
    fn test_sync_messages_sign_their_contents() {
        let wallet = Wallet::new();
        let mut request = SyncRequestMessage {
            last_known_index: 3,
            timestamp: 9,
            signature: SignatureRecord::unsigned(),
        };
        request.signature = wallet.sign(&request.signing_bytes());
        assert!(request.verify(&wallet).is_ok());
        assert_eq!(request.signer(), wallet.peer_id());

        request.last_known_index = 0;
        assert!(request.verify(&wallet).is_err());
    }
}

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;

use super::messages::{
    FinalizationMessage, ProposalMessage, SignedMessage, SyncRequestMessage, SyncResponseMessage,
    VoteMessage,
};
use super::vote::{resonance_weight, tally_votes, ConsensusResult, Decision, Phase, Vote};
use crate::blockchain::block::Block;
use crate::blockchain::crypto::{PeerId, SignatureRecord, SignatureScheme};
use crate::blockchain::validation::ValidationError;
use crate::clock::Clock;
use crate::logging::LogSink;

/// Blocks without a proposal whose votes are held at most
pub const MAX_BUFFERED_BLOCKS: usize = 256;

/// Depth below the local tip after which settled proposals are forgotten
pub const RETAINED_BLOCKS: u64 = 64;

/// Errors that can occur while driving consensus
#[derive(Debug, Error, PartialEq)]
pub enum ConsensusError {
    #[error("Consensus not reached for {0}")]
    NotReached(String),

    #[error("Block {0} was already finalized with a different result")]
    DuplicateFinalize(String),

    #[error("Block {0} was already rejected")]
    AlreadyRejected(String),

    #[error("Block {0} was already finalized")]
    AlreadyFinalized(String),

    #[error("Unknown block {0}")]
    UnknownBlock(String),

    #[error("Validation error: {0}")]
    Validation(#[from] ValidationError),
}

fn default_approval_threshold() -> f64 {
    0.66
}

fn default_min_average_weight() -> f64 {
    0.5
}

fn default_min_resonance() -> f64 {
    0.5
}

fn default_vote_timeout_ms() -> u64 {
    30_000
}

/// Consensus thresholds
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusConfig {
    /// Share of approving votes needed to finalize
    #[serde(default = "default_approval_threshold")]
    pub approval_threshold: f64,

    /// Minimum average vote weight needed to finalize
    #[serde(default = "default_min_average_weight")]
    pub min_average_weight: f64,

    /// Weight at or above which a node approves
    #[serde(default = "default_min_resonance")]
    pub min_resonance: f64,

    /// How long a proposer waits for missing votes before concluding
    #[serde(default = "default_vote_timeout_ms")]
    pub vote_timeout_ms: u64,
}

impl Default for ConsensusConfig {
    fn default() -> Self {
        ConsensusConfig {
            approval_threshold: default_approval_threshold(),
            min_average_weight: default_min_average_weight(),
            min_resonance: default_min_resonance(),
            vote_timeout_ms: default_vote_timeout_ms(),
        }
    }
}

/// Result of handing an inbound vote to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VoteOutcome {
    /// First vote from this voter for this block
    Counted,

    /// The voter already voted for this block; the earlier vote stands
    Duplicate,

    /// The proposal is already finalized or rejected
    Closed,
}

/// Snapshot of a proposal for status queries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusStatus {
    pub block_hash: String,
    pub phase: Option<Phase>,
    pub proposer_id: Option<PeerId>,
    pub votes: Vec<Vote>,
    pub result: ConsensusResult,
}

#[derive(Debug)]
struct ProposalState {
    /// Missing when votes or a finalization arrived before the proposal
    proposal: Option<ProposalMessage>,
    phase: Phase,
    finalization: Option<FinalizationMessage>,
}

impl ProposalState {
    fn new(proposal: Option<ProposalMessage>) -> Self {
        ProposalState {
            proposal,
            phase: Phase::Proposed,
            finalization: None,
        }
    }

    fn advance(&mut self, phase: Phase) {
        if phase > self.phase {
            self.phase = phase;
        }
    }
}

/// Threshold-voting state machine
///
/// Holds proposals, votes and finalizations keyed by block hash. The engine
/// does no I/O: callers broadcast the messages it returns.
pub struct ConsensusEngine {
    config: ConsensusConfig,
    signer: Arc<dyn SignatureScheme>,
    clock: Arc<dyn Clock>,
    log: Arc<dyn LogSink>,

    proposals: HashMap<String, ProposalState>,

    /// Votes by block hash, then voter; kept even for unknown blocks
    votes: HashMap<String, HashMap<PeerId, Vote>>,

    /// Votes this node cast, returned again on repeated proposals
    own_votes: HashMap<String, VoteMessage>,

    /// Hashes seen only through votes or finalizations, oldest first
    buffered: VecDeque<String>,

    known_peers: HashSet<PeerId>,
}

impl ConsensusEngine {
    pub fn new(
        config: ConsensusConfig,
        signer: Arc<dyn SignatureScheme>,
        clock: Arc<dyn Clock>,
        log: Arc<dyn LogSink>,
    ) -> Self {
        ConsensusEngine {
            config,
            signer,
            clock,
            log,
            proposals: HashMap::new(),
            votes: HashMap::new(),
            own_votes: HashMap::new(),
            buffered: VecDeque::new(),
            known_peers: HashSet::new(),
        }
    }

    pub fn config(&self) -> &ConsensusConfig {
        &self.config
    }

    pub fn peer_id(&self) -> &PeerId {
        self.signer.peer_id()
    }

    /// Remembers a peer whose proposals earn the known-proposer bonus
    pub fn add_known_peer(&mut self, peer: PeerId) {
        self.known_peers.insert(peer);
    }

    pub fn is_known_peer(&self, peer: &PeerId) -> bool {
        self.known_peers.contains(peer)
    }

    /// Opens voting on a locally sealed block
    pub fn propose_block(&mut self, block: &Block) -> ProposalMessage {
        let mut proposal = ProposalMessage {
            block_hash: block.hash.clone(),
            block_index: block.index,
            timestamp: self.clock.now_millis(),
            event_count: block.events.len(),
            merkle_root: block.merkle_root.clone(),
            proposer_id: self.peer_id().clone(),
            signature: SignatureRecord::unsigned(),
        };
        proposal.signature = self.signer.sign(&proposal.signing_bytes());

        self.track_proposal(&proposal);
        self.log.info(
            "proposing block",
            json!({ "hash": proposal.block_hash, "index": proposal.block_index }),
        );
        proposal
    }

    fn track_proposal(&mut self, proposal: &ProposalMessage) {
        let has_votes = self
            .votes
            .get(&proposal.block_hash)
            .map_or(false, |votes| !votes.is_empty());

        let state = self
            .proposals
            .entry(proposal.block_hash.clone())
            .or_insert_with(|| ProposalState::new(None));
        if state.proposal.is_none() {
            state.proposal = Some(proposal.clone());
        }
        if has_votes {
            state.advance(Phase::Voting);
        }
        self.buffered.retain(|hash| hash != &proposal.block_hash);
    }

    fn is_unseen(&self, block_hash: &str) -> bool {
        !self.proposals.contains_key(block_hash) && !self.votes.contains_key(block_hash)
    }

    /// Remembers a hash with no proposal, forgetting the oldest past the cap
    fn buffer_unknown(&mut self, block_hash: &str) {
        self.buffered.push_back(block_hash.to_string());

        while self.buffered.len() > MAX_BUFFERED_BLOCKS {
            let Some(oldest) = self.buffered.pop_front() else {
                break;
            };
            let unproposed = self
                .proposals
                .get(&oldest)
                .map_or(true, |state| state.proposal.is_none());
            if unproposed {
                self.forget(&oldest);
            }
        }
    }

    fn forget(&mut self, block_hash: &str) {
        self.proposals.remove(block_hash);
        self.votes.remove(block_hash);
        self.own_votes.remove(block_hash);
    }

    /// Forgets proposals for blocks below `min_index`
    ///
    /// This node's own proposals are kept until they are concluded.
    ///
    /// # Returns
    ///
    /// The number of proposals forgotten
    pub fn prune_before(&mut self, min_index: u64) -> usize {
        let me = self.peer_id().clone();
        let stale: Vec<String> = self
            .proposals
            .iter()
            .filter(|(_, state)| {
                state.proposal.as_ref().map_or(false, |proposal| {
                    proposal.block_index < min_index
                        && (state.phase.is_closed() || proposal.proposer_id != me)
                })
            })
            .map(|(hash, _)| hash.clone())
            .collect();

        for hash in &stale {
            self.forget(hash);
        }
        stale.len()
    }

    /// Number of blocks the engine holds state for
    pub fn tracked_blocks(&self) -> usize {
        let mut hashes: HashSet<&String> = self.proposals.keys().collect();
        hashes.extend(self.votes.keys());
        hashes.len()
    }

    /// This node's open proposals whose voting window has passed
    pub fn expired_proposals(&self) -> Vec<String> {
        let now = self.clock.now_millis();
        let me = self.peer_id();

        let mut expired: Vec<String> = self
            .proposals
            .iter()
            .filter(|(_, state)| !state.phase.is_closed())
            .filter(|(_, state)| {
                state.proposal.as_ref().map_or(false, |proposal| {
                    &proposal.proposer_id == me
                        && now.saturating_sub(proposal.timestamp) >= self.config.vote_timeout_ms
                })
            })
            .map(|(hash, _)| hash.clone())
            .collect();
        expired.sort();
        expired
    }

    /// Signs and records this node's vote
    ///
    /// Approves when `weight` reaches the minimum resonance, rejects
    /// otherwise.
    pub fn cast_vote(&mut self, block_hash: &str, weight: f64) -> VoteMessage {
        let decision = if weight >= self.config.min_resonance {
            Decision::Approve
        } else {
            Decision::Reject
        };
        self.sign_and_record(block_hash, decision, weight)
    }

    fn sign_and_record(&mut self, block_hash: &str, decision: Decision, weight: f64) -> VoteMessage {
        if let Some(existing) = self.own_votes.get(block_hash) {
            return existing.clone();
        }

        let weight = weight.clamp(0.0, 1.0);
        let mut vote = VoteMessage {
            block_hash: block_hash.to_string(),
            voter_id: self.peer_id().clone(),
            decision,
            weight,
            timestamp: self.clock.now_millis(),
            signature: SignatureRecord::unsigned(),
        };
        vote.signature = self.signer.sign(&vote.signing_bytes());

        self.record_vote(&vote);
        self.own_votes.insert(block_hash.to_string(), vote.clone());
        vote
    }

    /// Handles a peer's proposal and returns this node's vote on it
    ///
    /// # Arguments
    ///
    /// * `proposal` - The inbound proposal
    /// * `local_tip` - Index of this node's latest block
    /// * `proposer_known` - Whether the proposer is a known peer
    ///
    /// A proposal more than one block ahead of `local_tip` gets an abstain
    /// vote; the caller is expected to request a sync.
    pub fn receive_proposal(
        &mut self,
        proposal: &ProposalMessage,
        local_tip: u64,
        proposer_known: bool,
    ) -> Result<VoteMessage, ConsensusError> {
        proposal.verify(self.signer.as_ref())?;
        self.track_proposal(proposal);

        let age = self.clock.now_millis().saturating_sub(proposal.timestamp);
        let weight = resonance_weight(proposal.event_count, age, proposer_known);

        let vote = if proposal.block_index > local_tip.saturating_add(1) {
            self.sign_and_record(&proposal.block_hash, Decision::Abstain, weight)
        } else {
            self.cast_vote(&proposal.block_hash, weight)
        };
        Ok(vote)
    }

    /// Records a peer's vote
    ///
    /// The first vote from a voter for a block wins; later ones are
    /// reported as duplicates and ignored.
    pub fn receive_vote(&mut self, vote: &VoteMessage) -> Result<VoteOutcome, ConsensusError> {
        if !(0.0..=1.0).contains(&vote.weight) {
            return Err(ValidationError::BadWeight(vote.weight.to_string()).into());
        }
        vote.verify(self.signer.as_ref())?;

        if self.phase(&vote.block_hash).map_or(false, Phase::is_closed) {
            return Ok(VoteOutcome::Closed);
        }

        Ok(self.record_vote(vote))
    }

    fn record_vote(&mut self, vote: &VoteMessage) -> VoteOutcome {
        if self.is_unseen(&vote.block_hash) {
            self.buffer_unknown(&vote.block_hash);
        }

        let votes = self.votes.entry(vote.block_hash.clone()).or_default();
        if votes.contains_key(&vote.voter_id) {
            return VoteOutcome::Duplicate;
        }

        votes.insert(
            vote.voter_id.clone(),
            Vote {
                block_hash: vote.block_hash.clone(),
                voter_id: vote.voter_id.clone(),
                decision: vote.decision,
                weight: vote.weight,
                timestamp: vote.timestamp,
            },
        );

        if let Some(state) = self.proposals.get_mut(&vote.block_hash) {
            state.advance(Phase::Voting);
        }
        VoteOutcome::Counted
    }

    /// Tallies the votes recorded for a block
    pub fn tally(&self, block_hash: &str) -> ConsensusResult {
        let votes = self.votes.get(block_hash).into_iter().flat_map(|votes| votes.values());
        tally_votes(
            block_hash,
            votes,
            self.config.approval_threshold,
            self.config.min_average_weight,
        )
    }

    /// Peers that have voted on a block
    pub fn voters(&self, block_hash: &str) -> HashSet<PeerId> {
        self.votes
            .get(block_hash)
            .map(|votes| votes.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Finalizes a block whose tally reached consensus
    ///
    /// `result` must match the engine's own tally of the block. Finalizing
    /// again with the same result returns the original message.
    pub fn finalize(
        &mut self,
        block_hash: &str,
        result: &ConsensusResult,
    ) -> Result<FinalizationMessage, ConsensusError> {
        if !result.reached {
            return Err(ConsensusError::NotReached(block_hash.to_string()));
        }

        if let Some(state) = self.proposals.get(block_hash) {
            match state.phase {
                Phase::Rejected => {
                    return Err(ConsensusError::AlreadyRejected(block_hash.to_string()))
                }
                Phase::Finalized => {
                    return match &state.finalization {
                        Some(existing) if existing.consensus == *result => Ok(existing.clone()),
                        _ => Err(ConsensusError::DuplicateFinalize(block_hash.to_string())),
                    };
                }
                Phase::Proposed | Phase::Voting => {}
            }
        } else if !self.votes.contains_key(block_hash) {
            return Err(ConsensusError::UnknownBlock(block_hash.to_string()));
        }

        let tally = self.tally(block_hash);
        if !tally.reached || tally != *result {
            return Err(ConsensusError::NotReached(block_hash.to_string()));
        }

        let mut message = FinalizationMessage {
            block_hash: block_hash.to_string(),
            consensus: tally,
            timestamp: self.clock.now_millis(),
            signature: SignatureRecord::unsigned(),
        };
        message.signature = self.signer.sign(&message.signing_bytes());

        let state = self
            .proposals
            .entry(block_hash.to_string())
            .or_insert_with(|| ProposalState::new(None));
        state.advance(Phase::Finalized);
        state.finalization = Some(message.clone());

        self.log.info(
            "finalized block",
            json!({
                "hash": block_hash,
                "approved": result.approved_count,
                "votes": result.total_votes,
            }),
        );
        Ok(message)
    }

    /// Closes a proposal that did not reach consensus
    pub fn reject(&mut self, block_hash: &str) -> Result<(), ConsensusError> {
        let state = self
            .proposals
            .get_mut(block_hash)
            .ok_or_else(|| ConsensusError::UnknownBlock(block_hash.to_string()))?;

        match state.phase {
            Phase::Finalized => Err(ConsensusError::AlreadyFinalized(block_hash.to_string())),
            Phase::Rejected => Ok(()),
            Phase::Proposed | Phase::Voting => {
                state.advance(Phase::Rejected);
                self.log.info("rejected block", json!({ "hash": block_hash }));
                Ok(())
            }
        }
    }

    /// Accepts a peer's finalization of a block
    pub fn receive_finalization(&mut self, message: &FinalizationMessage) -> Result<(), ConsensusError> {
        message.verify(self.signer.as_ref())?;
        if !message.consensus.reached || message.consensus.block_hash != message.block_hash {
            return Err(ValidationError::BadFinalization(message.block_hash.clone()).into());
        }

        if self.is_unseen(&message.block_hash) {
            self.buffer_unknown(&message.block_hash);
        }

        let state = self
            .proposals
            .entry(message.block_hash.clone())
            .or_insert_with(|| ProposalState::new(None));

        match state.phase {
            Phase::Rejected => Err(ConsensusError::AlreadyRejected(message.block_hash.clone())),
            Phase::Finalized => Ok(()),
            Phase::Proposed | Phase::Voting => {
                state.advance(Phase::Finalized);
                state.finalization = Some(message.clone());
                Ok(())
            }
        }
    }

    /// Current phase of a block, `None` if no proposal or finalization was seen
    pub fn phase(&self, block_hash: &str) -> Option<Phase> {
        self.proposals.get(block_hash).map(|state| state.phase)
    }

    /// Finalization recorded for a block
    pub fn finalization(&self, block_hash: &str) -> Option<&FinalizationMessage> {
        self.proposals
            .get(block_hash)
            .and_then(|state| state.finalization.as_ref())
    }

    /// Everything known about a block, for status queries
    pub fn status(&self, block_hash: &str) -> ConsensusStatus {
        let mut votes: Vec<Vote> = self
            .votes
            .get(block_hash)
            .map(|votes| votes.values().cloned().collect())
            .unwrap_or_default();
        votes.sort_by(|a, b| a.voter_id.cmp(&b.voter_id));

        let state = self.proposals.get(block_hash);
        ConsensusStatus {
            block_hash: block_hash.to_string(),
            phase: state.map(|state| state.phase),
            proposer_id: state
                .and_then(|state| state.proposal.as_ref())
                .map(|proposal| proposal.proposer_id.clone()),
            votes,
            result: self.tally(block_hash),
        }
    }

    /// Signed request for the blocks after `last_known_index`
    pub fn request_sync(&self, last_known_index: u64) -> SyncRequestMessage {
        let mut request = SyncRequestMessage {
            last_known_index,
            timestamp: self.clock.now_millis(),
            signature: SignatureRecord::unsigned(),
        };
        request.signature = self.signer.sign(&request.signing_bytes());
        request
    }

    /// Signed summaries of `blocks`
    pub fn respond_sync(&self, blocks: &[Block]) -> SyncResponseMessage {
        let mut response = SyncResponseMessage {
            blocks: blocks.iter().map(Block::summary).collect(),
            timestamp: self.clock.now_millis(),
            signature: SignatureRecord::unsigned(),
        };
        response.signature = self.signer.sign(&response.signing_bytes());
        response
    }

    pub fn verify_sync_request(&self, request: &SyncRequestMessage) -> Result<(), ValidationError> {
        request.verify(self.signer.as_ref())
    }

    pub fn verify_sync_response(&self, response: &SyncResponseMessage) -> Result<(), ValidationError> {
        response.verify(self.signer.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blockchain::crypto::{Wallet, ZERO_HASH};
    use crate::blockchain::{Ledger, LedgerConfig};
    use crate::clock::ManualClock;
    use crate::logging::MemorySink;

    fn engine_for(wallet: &Arc<Wallet>, clock: &Arc<ManualClock>) -> ConsensusEngine {
        ConsensusEngine::new(
            ConsensusConfig::default(),
            wallet.clone(),
            clock.clone(),
            Arc::new(MemorySink::new()),
        )
    }

    fn sealed_block(wallet: &Arc<Wallet>) -> Block {
        let ledger = Ledger::new(
            LedgerConfig {
                difficulty: 1,
                ..LedgerConfig::default()
            },
            wallet.clone(),
            Arc::new(ManualClock::new(0)),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        ledger.latest_block()
    }

    fn vote_from(wallet: &Wallet, block_hash: &str, decision: Decision, weight: f64) -> VoteMessage {
        let mut vote = VoteMessage {
            block_hash: block_hash.to_string(),
            voter_id: wallet.peer_id().clone(),
            decision,
            weight,
            timestamp: 1,
            signature: SignatureRecord::unsigned(),
        };
        vote.signature = wallet.sign(&vote.signing_bytes());
        vote
    }

    struct Fixture {
        clock: Arc<ManualClock>,
        engine: ConsensusEngine,
        block: Block,
    }

    fn fixture() -> Fixture {
        let wallet = Arc::new(Wallet::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let engine = engine_for(&wallet, &clock);
        let block = sealed_block(&wallet);
        Fixture { clock, engine, block }
    }

    #[test]
    fn test_proposal_is_signed_by_proposer() {
        let mut f = fixture();
        let proposal = f.engine.propose_block(&f.block);

        assert_eq!(proposal.block_hash, f.block.hash);
        assert_eq!(&proposal.proposer_id, f.engine.peer_id());
        assert!(proposal.verify(&Wallet::new()).is_ok());
        assert_eq!(f.engine.phase(&f.block.hash), Some(Phase::Proposed));
    }

    #[test]
    fn test_cast_vote_decision_follows_threshold() {
        let mut f = fixture();
        assert_eq!(f.engine.cast_vote("a", 0.5).decision, Decision::Approve);
        assert_eq!(f.engine.cast_vote("b", 0.49).decision, Decision::Reject);
        assert_eq!(f.engine.tally("a").total_votes, 1);
    }

    #[test]
    fn test_votes_reach_consensus_and_finalize() {
        let mut f = fixture();
        let hash = f.engine.propose_block(&f.block).block_hash;

        for (decision, weight) in [
            (Decision::Approve, 0.9),
            (Decision::Approve, 0.8),
            (Decision::Reject, 0.3),
        ] {
            let vote = vote_from(&Wallet::new(), &hash, decision, weight);
            assert_eq!(f.engine.receive_vote(&vote), Ok(VoteOutcome::Counted));
        }
        assert_eq!(f.engine.phase(&hash), Some(Phase::Voting));

        let result = f.engine.tally(&hash);
        assert!(result.reached);

        let finalization = f.engine.finalize(&hash, &result).unwrap();
        assert!(finalization.verify(&Wallet::new()).is_ok());
        assert_eq!(f.engine.phase(&hash), Some(Phase::Finalized));

        // Same result again is idempotent
        assert_eq!(f.engine.finalize(&hash, &result), Ok(finalization));

        let mut different = result.clone();
        different.total_votes += 1;
        assert_eq!(
            f.engine.finalize(&hash, &different),
            Err(ConsensusError::DuplicateFinalize(hash.clone()))
        );

        // Late votes do not reopen the block
        let late = vote_from(&Wallet::new(), &hash, Decision::Approve, 1.0);
        assert_eq!(f.engine.receive_vote(&late), Ok(VoteOutcome::Closed));
    }

    #[test]
    fn test_finalize_requires_reached_result() {
        let mut f = fixture();
        let hash = f.engine.propose_block(&f.block).block_hash;

        for (decision, weight) in [
            (Decision::Approve, 0.9),
            (Decision::Reject, 0.3),
            (Decision::Reject, 0.2),
        ] {
            f.engine
                .receive_vote(&vote_from(&Wallet::new(), &hash, decision, weight))
                .unwrap();
        }

        let result = f.engine.tally(&hash);
        assert!(!result.reached);
        assert_eq!(
            f.engine.finalize(&hash, &result),
            Err(ConsensusError::NotReached(hash.clone()))
        );

        f.engine.reject(&hash).unwrap();
        assert_eq!(f.engine.phase(&hash), Some(Phase::Rejected));

        let mut forced = result;
        forced.reached = true;
        assert_eq!(
            f.engine.finalize(&hash, &forced),
            Err(ConsensusError::AlreadyRejected(hash))
        );
    }

    #[test]
    fn test_finalize_checks_result_against_own_tally() {
        let mut f = fixture();
        let hash = f.engine.propose_block(&f.block).block_hash;

        let fabricated = ConsensusResult {
            block_hash: hash.clone(),
            reached: true,
            approved_count: 9,
            total_votes: 9,
            average_weight: 0.9,
        };
        assert_eq!(
            f.engine.finalize(&hash, &fabricated),
            Err(ConsensusError::NotReached(hash.clone()))
        );
        assert_eq!(f.engine.phase(&hash), Some(Phase::Proposed));

        f.engine
            .receive_vote(&vote_from(&Wallet::new(), &hash, Decision::Approve, 0.9))
            .unwrap();
        let mut inflated = f.engine.tally(&hash);
        assert!(inflated.reached);
        inflated.approved_count += 1;
        inflated.total_votes += 1;
        assert_eq!(
            f.engine.finalize(&hash, &inflated),
            Err(ConsensusError::NotReached(hash.clone()))
        );

        let real = f.engine.tally(&hash);
        assert_eq!(f.engine.finalize(&hash, &real).unwrap().consensus, real);
    }

    #[test]
    fn test_reject_after_finalize() {
        let mut f = fixture();
        let hash = f.engine.propose_block(&f.block).block_hash;
        f.engine
            .receive_vote(&vote_from(&Wallet::new(), &hash, Decision::Approve, 0.9))
            .unwrap();
        f.engine.finalize(&hash, &f.engine.tally(&hash)).unwrap();

        assert_eq!(
            f.engine.reject(&hash),
            Err(ConsensusError::AlreadyFinalized(hash.clone()))
        );
        assert_eq!(f.engine.phase(&hash), Some(Phase::Finalized));
    }

    #[test]
    fn test_votes_for_unknown_blocks_are_capped() {
        let mut f = fixture();
        let voter = Wallet::new();

        for n in 0..MAX_BUFFERED_BLOCKS + 10 {
            let vote = vote_from(&voter, &format!("unknown-{}", n), Decision::Approve, 0.9);
            f.engine.receive_vote(&vote).unwrap();
        }
        assert_eq!(f.engine.tracked_blocks(), MAX_BUFFERED_BLOCKS);
        assert_eq!(f.engine.tally("unknown-0").total_votes, 0);
        assert_eq!(
            f.engine
                .tally(&format!("unknown-{}", MAX_BUFFERED_BLOCKS + 9))
                .total_votes,
            1
        );

        // A proposed block is never pushed out by unknown ones
        let hash = f.engine.propose_block(&f.block).block_hash;
        f.engine
            .receive_vote(&vote_from(&voter, &hash, Decision::Approve, 0.9))
            .unwrap();
        for n in 0..MAX_BUFFERED_BLOCKS {
            let vote = vote_from(&voter, &format!("flood-{}", n), Decision::Approve, 0.9);
            f.engine.receive_vote(&vote).unwrap();
        }
        assert_eq!(f.engine.tally(&hash).total_votes, 1);
        assert_eq!(f.engine.phase(&hash), Some(Phase::Voting));
    }

    #[test]
    fn test_prune_before_keeps_own_open_proposals() {
        let mut f = fixture();
        let own = f.engine.propose_block(&f.block).block_hash;

        let peer = Arc::new(Wallet::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let mut remote = engine_for(&peer, &clock);
        let mut block = sealed_block(&peer);
        block.index = 3;
        let proposal = remote.propose_block(&block);
        f.engine.receive_proposal(&proposal, 2, true).unwrap();

        assert_eq!(f.engine.prune_before(0), 0);
        assert_eq!(f.engine.prune_before(10), 1);
        assert_eq!(f.engine.phase(&proposal.block_hash), None);
        assert_eq!(f.engine.phase(&own), Some(Phase::Proposed));

        f.engine.reject(&own).unwrap();
        assert_eq!(f.engine.prune_before(10), 1);
        assert_eq!(f.engine.tracked_blocks(), 0);
    }

    #[test]
    fn test_expired_proposals() {
        let mut f = fixture();
        let hash = f.engine.propose_block(&f.block).block_hash;
        assert!(f.engine.expired_proposals().is_empty());

        f.clock.advance(f.engine.config().vote_timeout_ms);
        assert_eq!(f.engine.expired_proposals(), vec![hash.clone()]);

        f.engine.reject(&hash).unwrap();
        assert!(f.engine.expired_proposals().is_empty());
    }

    #[test]
    fn test_finalize_unknown_block() {
        let mut f = fixture();
        let result = ConsensusResult {
            block_hash: "missing".to_string(),
            reached: true,
            approved_count: 1,
            total_votes: 1,
            average_weight: 1.0,
        };
        assert_eq!(
            f.engine.finalize("missing", &result),
            Err(ConsensusError::UnknownBlock("missing".to_string()))
        );
        assert_eq!(
            f.engine.reject("missing"),
            Err(ConsensusError::UnknownBlock("missing".to_string()))
        );
    }

    #[test]
    fn test_first_vote_wins() {
        let mut f = fixture();
        let hash = f.engine.propose_block(&f.block).block_hash;
        let voter = Wallet::new();

        let first = vote_from(&voter, &hash, Decision::Approve, 0.9);
        let second = vote_from(&voter, &hash, Decision::Reject, 0.1);

        assert_eq!(f.engine.receive_vote(&first), Ok(VoteOutcome::Counted));
        assert_eq!(f.engine.receive_vote(&second), Ok(VoteOutcome::Duplicate));
        assert_eq!(f.engine.receive_vote(&first), Ok(VoteOutcome::Duplicate));

        let result = f.engine.tally(&hash);
        assert_eq!(result.total_votes, 1);
        assert_eq!(result.approved_count, 1);
    }

    #[test]
    fn test_votes_before_proposal_are_kept() {
        let mut f = fixture();
        let hash = f.block.hash.clone();

        let vote = vote_from(&Wallet::new(), &hash, Decision::Approve, 0.9);
        assert_eq!(f.engine.receive_vote(&vote), Ok(VoteOutcome::Counted));
        assert_eq!(f.engine.phase(&hash), None);

        f.engine.propose_block(&f.block);
        assert_eq!(f.engine.phase(&hash), Some(Phase::Voting));
        assert_eq!(f.engine.tally(&hash).total_votes, 1);
    }

    #[test]
    fn test_forged_and_out_of_range_votes_are_rejected() {
        let mut f = fixture();
        let hash = f.engine.propose_block(&f.block).block_hash;
        let honest = Wallet::new();

        let mut forged = vote_from(&Wallet::new(), &hash, Decision::Approve, 0.9);
        forged.voter_id = honest.peer_id().clone();
        assert!(matches!(
            f.engine.receive_vote(&forged),
            Err(ConsensusError::Validation(ValidationError::BadSignature(_)))
        ));

        let heavy = vote_from(&honest, &hash, Decision::Approve, 1.5);
        assert!(matches!(
            f.engine.receive_vote(&heavy),
            Err(ConsensusError::Validation(ValidationError::BadWeight(_)))
        ));
        assert_eq!(f.engine.tally(&hash).total_votes, 0);
    }

    #[test]
    fn test_receive_proposal_votes_with_resonance_weight() {
        let proposer = Arc::new(Wallet::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let mut proposing = engine_for(&proposer, &clock);
        let proposal = proposing.propose_block(&sealed_block(&proposer));

        let mut f = fixture();
        f.clock.set(1_000);
        let vote = f.engine.receive_proposal(&proposal, 0, true).unwrap();

        assert_eq!(vote.decision, Decision::Approve);
        assert!((vote.weight - resonance_weight(1, 0, true)).abs() < 1e-9);
        assert_eq!(f.engine.phase(&proposal.block_hash), Some(Phase::Voting));

        // Repeated proposals return the same vote
        assert_eq!(f.engine.receive_proposal(&proposal, 0, true), Ok(vote.clone()));

        // The proposer counts the vote
        assert_eq!(proposing.receive_vote(&vote), Ok(VoteOutcome::Counted));
        assert!(proposing.tally(&proposal.block_hash).reached);
    }

    #[test]
    fn test_proposal_ahead_of_tip_gets_abstain() {
        let proposer = Arc::new(Wallet::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut proposing = engine_for(&proposer, &clock);

        let mut block = sealed_block(&proposer);
        block.index = 5;
        let proposal = proposing.propose_block(&block);

        let mut f = fixture();
        let vote = f.engine.receive_proposal(&proposal, 1, false).unwrap();
        assert_eq!(vote.decision, Decision::Abstain);
    }

    #[test]
    fn test_tampered_proposal_is_rejected() {
        let proposer = Arc::new(Wallet::new());
        let clock = Arc::new(ManualClock::new(0));
        let mut proposing = engine_for(&proposer, &clock);
        let mut proposal = proposing.propose_block(&sealed_block(&proposer));
        proposal.event_count = 10;

        let mut f = fixture();
        assert!(matches!(
            f.engine.receive_proposal(&proposal, 0, true),
            Err(ConsensusError::Validation(ValidationError::BadSignature(_)))
        ));
        assert_eq!(f.engine.phase(&proposal.block_hash), None);
    }

    #[test]
    fn test_receive_finalization() {
        let mut f = fixture();
        let hash = f.engine.propose_block(&f.block).block_hash;
        f.engine
            .receive_vote(&vote_from(&Wallet::new(), &hash, Decision::Approve, 0.9))
            .unwrap();
        let finalization = f.engine.finalize(&hash, &f.engine.tally(&hash)).unwrap();

        let mut other = fixture();
        other.engine.receive_finalization(&finalization).unwrap();
        assert_eq!(other.engine.phase(&hash), Some(Phase::Finalized));
        assert_eq!(other.engine.finalization(&hash), Some(&finalization));

        let mut unreached = finalization.clone();
        unreached.consensus.reached = false;
        assert!(other.engine.receive_finalization(&unreached).is_err());
    }

    #[test]
    fn test_sync_round_trip() {
        let mut f = fixture();
        let request = f.engine.request_sync(0);
        assert!(f.engine.verify_sync_request(&request).is_ok());

        let response = f.engine.respond_sync(&[f.block.clone()]);
        assert_eq!(response.blocks, vec![f.block.summary()]);
        assert!(f.engine.verify_sync_response(&response).is_ok());

        let mut forged = response;
        forged.blocks[0].hash = ZERO_HASH.to_string();
        assert!(f.engine.verify_sync_response(&forged).is_err());

        f.engine.add_known_peer(request.signature.signer.clone());
        assert!(f.engine.is_known_peer(&request.signature.signer));
    }
}

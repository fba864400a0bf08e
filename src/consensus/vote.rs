use serde::{Deserialize, Serialize};

use crate::blockchain::crypto::PeerId;

/// Events at which the size bonus saturates
pub const FULL_BLOCK_EVENTS: usize = 10;

/// Age at which the freshness bonus reaches zero (one day)
pub const FRESHNESS_WINDOW_MS: u64 = 86_400_000;

/// A voter's answer to a proposal
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Decision {
    Approve,
    Reject,
    Abstain,
}

/// Lifecycle of a proposal
///
/// Phases only move forward: `Proposed -> Voting -> Finalized | Rejected`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Proposed,
    Voting,
    Finalized,
    Rejected,
}

impl Phase {
    pub fn is_closed(self) -> bool {
        matches!(self, Phase::Finalized | Phase::Rejected)
    }
}

/// A counted vote
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vote {
    pub block_hash: String,
    pub voter_id: PeerId,
    pub decision: Decision,
    pub weight: f64,
    pub timestamp: u64,
}

/// Outcome of tallying the votes for one block
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsensusResult {
    pub block_hash: String,
    pub reached: bool,
    pub approved_count: usize,
    pub total_votes: usize,
    pub average_weight: f64,
}

/// Weight a node gives a proposal
///
/// Starts at 0.5, adds up to 0.2 for block size (saturating at ten events),
/// up to 0.2 for freshness (linear decay over a day) and 0.1 when the
/// proposer is a known peer. The result is clamped to [0, 1].
pub fn resonance_weight(event_count: usize, age_ms: u64, proposer_known: bool) -> f64 {
    let size = (event_count as f64 / FULL_BLOCK_EVENTS as f64).min(1.0);
    let freshness = (1.0 - age_ms as f64 / FRESHNESS_WINDOW_MS as f64).max(0.0);
    let known = if proposer_known { 0.1 } else { 0.0 };

    (0.5 + 0.2 * size + 0.2 * freshness + known).clamp(0.0, 1.0)
}

/// Tallies votes for a block
///
/// Votes are summed in voter order so the result does not depend on the
/// order they arrived in.
pub fn tally_votes<'a>(
    block_hash: &str,
    votes: impl IntoIterator<Item = &'a Vote>,
    approval_threshold: f64,
    min_average_weight: f64,
) -> ConsensusResult {
    let mut votes: Vec<&Vote> = votes.into_iter().collect();
    votes.sort_by(|a, b| a.voter_id.cmp(&b.voter_id));

    let total_votes = votes.len();
    let approved_count = votes
        .iter()
        .filter(|vote| vote.decision == Decision::Approve)
        .count();
    let average_weight = if total_votes == 0 {
        0.0
    } else {
        votes.iter().map(|vote| vote.weight).sum::<f64>() / total_votes as f64
    };

    let reached = total_votes > 0
        && approved_count as f64 / total_votes as f64 >= approval_threshold
        && average_weight >= min_average_weight;

    ConsensusResult {
        block_hash: block_hash.to_string(),
        reached,
        approved_count,
        total_votes,
        average_weight,
    }
}

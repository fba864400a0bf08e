// Consensus module
//
// Threshold voting over sealed blocks:
// - Signed wire messages
// - Votes, tallies and vote weights
// - The proposal state machine

pub mod engine;
pub mod messages;
pub mod vote;

pub use engine::{ConsensusConfig, ConsensusEngine, ConsensusError, ConsensusStatus, VoteOutcome};
pub use messages::{
    FinalizationMessage, ProposalMessage, SignedMessage, SyncRequestMessage, SyncResponseMessage,
    VoteMessage,
};
pub use vote::{ConsensusResult, Decision, Phase, Vote};

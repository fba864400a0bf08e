// Blockchain module
//
// This module contains the event ledger including:
// - Hashing, Merkle trees and signatures
// - Chunked proof of work
// - Event and block structures
// - Balance state
// - The ledger itself and chain validation

pub mod account;
pub mod block;
pub mod chain;
pub mod crypto;
pub mod event;
pub mod pow;
pub mod validation;

// Re-export main components for easier access
pub use block::{Block, BlockSummary};
pub use chain::{Ledger, LedgerConfig, LedgerError};
pub use crypto::{PeerId, SignatureRecord, SignatureScheme, Wallet};
pub use event::Event;
pub use validation::ValidationError;

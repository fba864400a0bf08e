// resonance_node
//
// A peer-to-peer node with a proof-of-work event ledger, threshold voting
// consensus and a WebSocket transport.

pub mod api;
pub mod blockchain;
pub mod clock;
pub mod config;
pub mod consensus;
pub mod health;
pub mod logging;
pub mod network;
pub mod node;

pub use config::NodeConfig;
pub use node::{Node, NodeError};

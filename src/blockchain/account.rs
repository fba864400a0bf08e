// Balance state is used internally by the ledger
use dashmap::DashMap;
use thiserror::Error;

use std::collections::BTreeMap;
use std::sync::Arc;

use super::crypto::PeerId;

/// Errors that can occur during balance operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AccountError {
    #[error("Insufficient funds: required {required}, available {available}")]
    InsufficientFunds { required: u64, available: u64 },

    #[error("Invalid amount: {0}")]
    InvalidAmount(String),

    #[error("Balance overflow for {0}")]
    Overflow(PeerId),
}

/// Committed balances of every peer seen in a sealed block
///
/// Balances are unsigned and only change through `credit` and `transfer`, so
/// they can never go negative.
#[derive(Debug, Clone, Default)]
pub struct BalanceLedger {
    balances: Arc<DashMap<PeerId, u64>>,
}

impl BalanceLedger {
    /// Creates an empty balance ledger
    pub fn new() -> Self {
        BalanceLedger::default()
    }

    /// Gets the balance of a peer, zero when unknown
    pub fn balance(&self, peer: &PeerId) -> u64 {
        self.balances.get(peer).map(|entry| *entry).unwrap_or(0)
    }

    /// Increases a peer's balance
    ///
    /// # Arguments
    ///
    /// * `peer` - The peer to credit
    /// * `amount` - The amount to add
    pub fn credit(&self, peer: &PeerId, amount: u64) -> Result<(), AccountError> {
        let mut entry = self.balances.entry(peer.clone()).or_insert(0);
        *entry = entry
            .checked_add(amount)
            .ok_or_else(|| AccountError::Overflow(peer.clone()))?;
        Ok(())
    }

    /// Moves funds between peers
    ///
    /// # Arguments
    ///
    /// * `from` - The sender
    /// * `to` - The recipient
    /// * `amount` - The amount to move
    ///
    /// # Returns
    ///
    /// Result indicating success or failure; nothing changes on failure
    pub fn transfer(&self, from: &PeerId, to: &PeerId, amount: u64) -> Result<(), AccountError> {
        if amount == 0 {
            return Err(AccountError::InvalidAmount(
                "Amount must be positive".to_string(),
            ));
        }

        let available = self.balance(from);
        if available < amount {
            return Err(AccountError::InsufficientFunds {
                required: amount,
                available,
            });
        }

        if from == to {
            return Ok(());
        }

        // Check the credit side first so a failure leaves both balances intact
        self.balance(to)
            .checked_add(amount)
            .ok_or_else(|| AccountError::Overflow(to.clone()))?;

        self.balances.insert(from.clone(), available - amount);
        self.credit(to, amount)
    }

    /// Gets every balance, ordered by peer id
    pub fn snapshot(&self) -> BTreeMap<PeerId, u64> {
        self.balances
            .iter()
            .map(|entry| (entry.key().clone(), *entry.value()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_peer_has_zero_balance() {
        let ledger = BalanceLedger::new();
        assert_eq!(ledger.balance(&PeerId::from("nobody")), 0);
    }

    #[test]
    fn test_credit_and_transfer() {
        let ledger = BalanceLedger::new();
        let sender = PeerId::from("sender");
        let recipient = PeerId::from("recipient");

        ledger.credit(&sender, 100).unwrap();
        ledger.transfer(&sender, &recipient, 40).unwrap();

        assert_eq!(ledger.balance(&sender), 60);
        assert_eq!(ledger.balance(&recipient), 40);
        assert_eq!(ledger.snapshot().len(), 2);
    }

    #[test]
    fn test_insufficient_funds_changes_nothing() {
        let ledger = BalanceLedger::new();
        let sender = PeerId::from("sender");
        let recipient = PeerId::from("recipient");
        ledger.credit(&sender, 10).unwrap();

        let result = ledger.transfer(&sender, &recipient, 11);
        assert_eq!(
            result,
            Err(AccountError::InsufficientFunds {
                required: 11,
                available: 10
            })
        );
        assert_eq!(ledger.balance(&sender), 10);
        assert_eq!(ledger.balance(&recipient), 0);
    }

    #[test]
    fn test_zero_amount_is_rejected() {
        let ledger = BalanceLedger::new();
        let peer = PeerId::from("peer");
        assert!(matches!(
            ledger.transfer(&peer, &peer, 0),
            Err(AccountError::InvalidAmount(_))
        ));
    }
}

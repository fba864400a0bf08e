use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::account::BalanceLedger;
use super::block::{Block, Proof};
use super::crypto::{PeerId, SignatureScheme, ZERO_HASH};
use super::event::{Event, GenesisPayload, TransferPayload, GENESIS_KIND, TRANSFER_KIND};
use super::pow::{solve, PowSearch, MAX_DIFFICULTY};
use super::validation::validate_blocks;
use crate::clock::Clock;
use crate::logging::LogSink;

/// Errors that can occur during ledger operations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LedgerError {
    #[error("No pending events to seal")]
    EmptyQueue,

    #[error("A block is already being sealed")]
    SealInProgress,

    #[error("Invalid ledger configuration: {0}")]
    InvalidConfig(String),
}

fn default_difficulty() -> usize {
    3
}

fn default_batch_size() -> usize {
    10
}

fn default_initial_balance() -> u64 {
    1000
}

fn default_pow_chunk_size() -> u64 {
    1000
}

/// Ledger settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LedgerConfig {
    /// Leading zero hex characters required in a block hash
    #[serde(default = "default_difficulty")]
    pub difficulty: usize,

    /// Pending events that trigger an automatic seal
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Balance the genesis block grants the local peer
    #[serde(default = "default_initial_balance")]
    pub initial_balance: u64,

    /// Proof-of-work attempts between yields
    #[serde(default = "default_pow_chunk_size")]
    pub pow_chunk_size: u64,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        LedgerConfig {
            difficulty: default_difficulty(),
            batch_size: default_batch_size(),
            initial_balance: default_initial_balance(),
            pow_chunk_size: default_pow_chunk_size(),
        }
    }
}

impl LedgerConfig {
    pub fn validate(&self) -> Result<(), LedgerError> {
        if self.difficulty > MAX_DIFFICULTY {
            return Err(LedgerError::InvalidConfig(format!(
                "difficulty {} exceeds {}",
                self.difficulty, MAX_DIFFICULTY
            )));
        }
        if self.batch_size == 0 {
            return Err(LedgerError::InvalidConfig(
                "batch size must be positive".to_string(),
            ));
        }
        if self.pow_chunk_size == 0 {
            return Err(LedgerError::InvalidConfig(
                "proof-of-work chunk size must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// Clears the seal flag on every exit path
struct SealGuard<'a>(&'a AtomicBool);

impl<'a> SealGuard<'a> {
    fn acquire(flag: &'a AtomicBool) -> Result<Self, LedgerError> {
        flag.compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| LedgerError::SealInProgress)?;
        Ok(SealGuard(flag))
    }
}

impl Drop for SealGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Releases the batch being sealed once the seal ends, committed or not
struct InFlightBatch<'a>(&'a Mutex<Vec<Event>>);

impl Drop for InFlightBatch<'_> {
    fn drop(&mut self) {
        lock(self.0).clear();
    }
}

fn outgoing<'a>(events: impl IntoIterator<Item = &'a Event>, peer: &PeerId) -> u64 {
    events
        .into_iter()
        .filter_map(Event::transfer_payload)
        .filter(|transfer| &transfer.from == peer)
        .fold(0u64, |total, transfer| total.saturating_add(transfer.amount))
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Append-only event ledger sealed into proof-of-work blocks
#[derive(Clone)]
pub struct Ledger {
    config: LedgerConfig,

    /// Signs events and blocks produced by this node
    signer: Arc<dyn SignatureScheme>,

    clock: Arc<dyn Clock>,
    log: Arc<dyn LogSink>,

    /// The chain of blocks
    chain: Arc<Mutex<Vec<Block>>>,

    /// Events waiting for the next seal
    pending: Arc<Mutex<Vec<Event>>>,

    /// Events taken by the running seal and not yet applied
    in_flight: Arc<Mutex<Vec<Event>>>,

    /// Committed balances
    balances: BalanceLedger,

    sealing: Arc<AtomicBool>,

    /// Receives every block this ledger seals
    subscriber: Arc<Mutex<Option<mpsc::UnboundedSender<Block>>>>,
}

impl Ledger {
    /// Creates a ledger with a sealed genesis block
    ///
    /// The genesis block holds a single `genesis` event that grants the
    /// local peer its initial balance.
    pub fn new(
        config: LedgerConfig,
        signer: Arc<dyn SignatureScheme>,
        clock: Arc<dyn Clock>,
        log: Arc<dyn LogSink>,
    ) -> Result<Self, LedgerError> {
        config.validate()?;

        let ledger = Ledger {
            config,
            signer,
            clock,
            log,
            chain: Arc::new(Mutex::new(Vec::new())),
            pending: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(Mutex::new(Vec::new())),
            balances: BalanceLedger::new(),
            sealing: Arc::new(AtomicBool::new(false)),
            subscriber: Arc::new(Mutex::new(None)),
        };

        let genesis = ledger.create_genesis_block();
        ledger.apply_events(&genesis);
        lock(&ledger.chain).push(genesis);

        Ok(ledger)
    }

    fn create_genesis_block(&self) -> Block {
        let timestamp = self.clock.now_millis();
        let payload = GenesisPayload {
            peer: self.signer.peer_id().clone(),
            amount: self.config.initial_balance,
        };
        let event = Event::new(
            GENESIS_KIND,
            json!(payload),
            ZERO_HASH,
            timestamp,
            self.signer.as_ref(),
        );

        let events = vec![event];
        let merkle_root = Block::merkle_root_of(&events);
        let header = Block::header_data(
            0,
            timestamp,
            ZERO_HASH,
            &merkle_root,
            self.signer.peer_id(),
            self.config.difficulty,
        );
        let solution = PowSearch::new(header, self.config.difficulty).run();

        Block {
            index: 0,
            timestamp,
            events,
            previous_hash: ZERO_HASH.to_string(),
            signature: self.signer.sign(solution.hash.as_bytes()),
            hash: solution.hash,
            merkle_root,
            proof: Proof {
                nonce: solution.nonce,
                difficulty: self.config.difficulty,
            },
            producer_id: self.signer.peer_id().clone(),
        }
    }

    /// Identity this ledger signs with
    pub fn peer_id(&self) -> &PeerId {
        self.signer.peer_id()
    }

    pub fn config(&self) -> &LedgerConfig {
        &self.config
    }

    /// Registers the receiver of sealed blocks, replacing any earlier one
    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<Block> {
        let (sender, receiver) = mpsc::unbounded_channel();
        *lock(&self.subscriber) = Some(sender);
        receiver
    }

    /// Queues a new signed event, sealing a block once the batch is full
    ///
    /// A seal already running elsewhere is not an error here: the event
    /// stays queued for the next seal.
    pub async fn integrate(&self, kind: &str, payload: Value) -> Result<Event, LedgerError> {
        let (event, queued) = self.enqueue(kind, payload);

        if queued >= self.config.batch_size {
            match self.seal_block().await {
                Ok(_) | Err(LedgerError::SealInProgress) | Err(LedgerError::EmptyQueue) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(event)
    }

    fn enqueue(&self, kind: &str, payload: Value) -> (Event, usize) {
        let previous_hash = self.latest_block().hash;
        let event = Event::new(
            kind,
            payload,
            &previous_hash,
            self.clock.now_millis(),
            self.signer.as_ref(),
        );

        let mut pending = lock(&self.pending);
        pending.push(event.clone());
        (event, pending.len())
    }

    /// Seals every pending event into a new block
    ///
    /// Proof of work runs in chunks that yield to the runtime, so the seal
    /// never starves other tasks on the same thread.
    pub async fn seal_block(&self) -> Result<Block, LedgerError> {
        let _guard = SealGuard::acquire(&self.sealing)?;

        let events = {
            let mut pending = lock(&self.pending);
            if pending.is_empty() {
                return Err(LedgerError::EmptyQueue);
            }
            let events = std::mem::take(&mut *pending);
            *lock(&self.in_flight) = events.clone();
            events
        };
        let _in_flight = InFlightBatch(&self.in_flight);

        let previous = self.latest_block();
        let index = previous.index + 1;
        let timestamp = self.clock.now_millis();
        let merkle_root = Block::merkle_root_of(&events);
        let header = Block::header_data(
            index,
            timestamp,
            &previous.hash,
            &merkle_root,
            self.signer.peer_id(),
            self.config.difficulty,
        );

        let solution = solve(&header, self.config.difficulty, self.config.pow_chunk_size).await;

        let block = Block {
            index,
            timestamp,
            events,
            previous_hash: previous.hash,
            signature: self.signer.sign(solution.hash.as_bytes()),
            hash: solution.hash,
            merkle_root,
            proof: Proof {
                nonce: solution.nonce,
                difficulty: self.config.difficulty,
            },
            producer_id: self.signer.peer_id().clone(),
        };

        lock(&self.chain).push(block.clone());
        self.apply_events(&block);

        self.log.info(
            "sealed block",
            json!({
                "index": block.index,
                "hash": block.hash,
                "events": block.events.len(),
                "attempts": solution.attempts,
            }),
        );

        if let Some(subscriber) = lock(&self.subscriber).as_ref() {
            if subscriber.send(block.clone()).is_err() {
                self.log.debug("sealed block subscriber is gone", Value::Null);
            }
        }

        Ok(block)
    }

    /// Applies the balance effects of a freshly sealed block
    fn apply_events(&self, block: &Block) {
        for event in &block.events {
            if let Some(transfer) = event.transfer_payload() {
                if let Err(err) = self.balances.transfer(&transfer.from, &transfer.to, transfer.amount) {
                    self.log.warn(
                        "skipping transfer",
                        json!({
                            "block": block.index,
                            "event": event.id,
                            "reason": err.to_string(),
                        }),
                    );
                }
            } else if let Some(genesis) = event.genesis_payload() {
                if let Err(err) = self.balances.credit(&genesis.peer, genesis.amount) {
                    self.log.warn("skipping genesis credit", json!({ "reason": err.to_string() }));
                }
            }
        }
    }

    /// Checks every block from genesis, stopping at the first failure
    pub fn validate_chain(&self) -> bool {
        let chain = lock(&self.chain);

        match validate_blocks(&chain, self.signer.as_ref()) {
            Ok(()) => true,
            Err(err) => {
                self.log.warn("chain validation failed", json!({ "reason": err.to_string() }));
                false
            }
        }
    }

    /// Committed balance of a peer
    pub fn get_balance(&self, peer: &PeerId) -> u64 {
        self.balances.balance(peer)
    }

    /// Committed balance minus transfers out of `peer` that are queued or
    /// being sealed
    pub fn available_balance(&self, peer: &PeerId) -> u64 {
        let pending = lock(&self.pending);
        let in_flight = lock(&self.in_flight);
        let debits = outgoing(pending.iter().chain(in_flight.iter()), peer);

        self.get_balance(peer).saturating_sub(debits)
    }

    /// Queues a transfer if `from` can cover it
    ///
    /// # Returns
    ///
    /// false, with nothing queued, when the available balance is too low
    pub async fn transfer(&self, from: &PeerId, to: &PeerId, amount: u64) -> bool {
        if amount == 0 || self.available_balance(from) < amount {
            self.log.info(
                "transfer refused",
                json!({ "from": from, "to": to, "amount": amount }),
            );
            return false;
        }

        let payload = TransferPayload {
            from: from.clone(),
            to: to.clone(),
            amount,
        };

        match self.integrate(TRANSFER_KIND, json!(payload)).await {
            Ok(_) => true,
            Err(err) => {
                self.log.warn("transfer failed", json!({ "reason": err.to_string() }));
                false
            }
        }
    }

    /// Gets the entire chain
    pub fn get_blocks(&self) -> Vec<Block> {
        lock(&self.chain).clone()
    }

    /// Gets all events waiting to be sealed
    pub fn get_pending_events(&self) -> Vec<Event> {
        lock(&self.pending).clone()
    }

    /// Gets the last block in the chain
    pub fn latest_block(&self) -> Block {
        let chain = lock(&self.chain);
        match chain.last() {
            Some(block) => block.clone(),
            None => unreachable!("the chain always holds a genesis block"),
        }
    }

    /// Index of the last block
    pub fn height(&self) -> u64 {
        lock(&self.chain).last().map(|block| block.index).unwrap_or(0)
    }

    /// Blocks with an index greater than `index`
    pub fn blocks_after(&self, index: u64) -> Vec<Block> {
        lock(&self.chain)
            .iter()
            .filter(|block| block.index > index)
            .cloned()
            .collect()
    }

    /// Looks up a block by hash
    pub fn find_block(&self, hash: &str) -> Option<Block> {
        lock(&self.chain).iter().find(|block| block.hash == hash).cloned()
    }
}

// Node wiring
//
// Connects the ledger, the consensus engine and the transport. Consensus
// messages are handled one at a time by a single loop task; the engine is
// only mutated from that loop and from explicit API calls.

use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use crate::blockchain::block::Block;
use crate::blockchain::chain::{Ledger, LedgerError};
use crate::blockchain::crypto::{PeerId, SignatureScheme};
use crate::blockchain::event::Event;
use crate::clock::Clock;
use crate::config::NodeConfig;
use crate::consensus::engine::{
    ConsensusEngine, ConsensusError, ConsensusStatus, VoteOutcome, RETAINED_BLOCKS,
};
use crate::consensus::messages::{
    FinalizationMessage, ProposalMessage, SyncRequestMessage, SyncResponseMessage, VoteMessage,
};
use crate::consensus::vote::Phase;
use crate::health::HealthRegistry;
use crate::logging::LogSink;
use crate::network::protocol::{Inbound, Message, MessageKind, Unhandled};
use crate::network::transport::{Transport, TransportError};

/// Errors that can occur while running a node
#[derive(Debug, Error)]
pub enum NodeError {
    #[error("Ledger error: {0}")]
    Ledger(#[from] LedgerError),

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Node is already running")]
    AlreadyRunning,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// A running peer: ledger, consensus and transport
#[derive(Clone)]
pub struct Node {
    config: NodeConfig,
    ledger: Ledger,
    engine: Arc<Mutex<ConsensusEngine>>,
    transport: Transport,
    health: HealthRegistry,
    log: Arc<dyn LogSink>,
    event_loop: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl Node {
    pub fn new(
        config: NodeConfig,
        signer: Arc<dyn SignatureScheme>,
        clock: Arc<dyn Clock>,
        log: Arc<dyn LogSink>,
    ) -> Result<Self, NodeError> {
        let ledger = Ledger::new(config.ledger.clone(), signer.clone(), clock.clone(), log.clone())?;
        let engine = ConsensusEngine::new(
            config.consensus.clone(),
            signer.clone(),
            clock.clone(),
            log.clone(),
        );
        let transport = Transport::new(
            config.transport.clone(),
            signer,
            clock,
            log.clone(),
        );

        let node = Node {
            config,
            ledger,
            engine: Arc::new(Mutex::new(engine)),
            transport,
            health: HealthRegistry::new(),
            log,
            event_loop: Arc::new(Mutex::new(None)),
        };
        node.register_gauges();
        Ok(node)
    }

    fn register_gauges(&self) {
        let ledger = self.ledger.clone();
        self.health
            .register("chainValid", move || json!(ledger.validate_chain()));

        let ledger = self.ledger.clone();
        self.health.register("chainHeight", move || json!(ledger.height()));

        let ledger = self.ledger.clone();
        self.health.register("pendingEventCount", move || {
            json!(ledger.get_pending_events().len())
        });

        let transport = self.transport.clone();
        self.health.register("connectionCount", move || {
            json!(transport.connection_count())
        });
    }

    pub fn peer_id(&self) -> &PeerId {
        self.ledger.peer_id()
    }

    pub fn config(&self) -> &NodeConfig {
        &self.config
    }

    pub fn ledger(&self) -> &Ledger {
        &self.ledger
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn health(&self) -> &HealthRegistry {
        &self.health
    }

    fn engine(&self) -> MutexGuard<'_, ConsensusEngine> {
        lock(&self.engine)
    }

    /// Starts the transport on the configured port and the consensus loop
    pub async fn start(&self) -> Result<SocketAddr, NodeError> {
        self.start_on(self.config.transport.port).await
    }

    /// Starts the transport on `port` and the consensus loop
    pub async fn start_on(&self, port: u16) -> Result<SocketAddr, NodeError> {
        if lock(&self.event_loop).is_some() {
            return Err(NodeError::AlreadyRunning);
        }

        let (inbound_tx, inbound) = mpsc::unbounded_channel();
        for kind in MessageKind::CONSENSUS {
            self.transport.register_handler(kind, inbound_tx.clone());
        }
        let (unhandled_tx, unhandled) = mpsc::unbounded_channel();
        self.transport.on_unhandled(unhandled_tx);
        let sealed = self.ledger.subscribe();

        let addr = self.transport.start(port).await?;

        let node = self.clone();
        let handle = tokio::spawn(async move { node.run(inbound, sealed, unhandled).await });
        *lock(&self.event_loop) = Some(handle);

        self.log.info(
            "node started",
            json!({ "peer": self.peer_id(), "address": addr.to_string() }),
        );
        Ok(addr)
    }

    /// Stops the consensus loop and closes every connection
    pub fn stop(&self) {
        if let Some(handle) = lock(&self.event_loop).take() {
            handle.abort();
        }
        self.transport.shutdown();
    }

    async fn run(
        self,
        mut inbound: mpsc::UnboundedReceiver<Inbound>,
        mut sealed: mpsc::UnboundedReceiver<Block>,
        mut unhandled: mpsc::UnboundedReceiver<Unhandled>,
    ) {
        let period = (self.config.consensus.vote_timeout_ms / 4).clamp(50, 1_000);
        let mut deadlines = tokio::time::interval(Duration::from_millis(period));
        deadlines.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                Some(message) = inbound.recv() => self.handle_inbound(message),
                Some(block) = sealed.recv() => self.handle_sealed(&block),
                _ = deadlines.tick() => self.conclude_expired(),
                Some(other) = unhandled.recv() => {
                    self.log.debug(
                        "ignoring unhandled message",
                        json!({ "peer": other.peer_id, "type": other.kind }),
                    );
                }
                else => break,
            }
        }
    }

    /// Proposes a freshly sealed block to every peer
    fn handle_sealed(&self, block: &Block) {
        let proposal = {
            let mut engine = self.engine();
            let proposal = engine.propose_block(block);
            engine.prune_before(block.index.saturating_sub(RETAINED_BLOCKS));
            proposal
        };
        let sent = self
            .transport
            .broadcast(&Message::ProposeBlock(proposal), None);

        if sent == 0 {
            self.log.info(
                "no peers to propose to",
                json!({ "hash": block.hash, "index": block.index }),
            );
        }
    }

    fn handle_inbound(&self, inbound: Inbound) {
        let peer = inbound.peer_id;
        let kind = inbound.message.kind();

        let result = match inbound.message {
            Message::ProposeBlock(proposal) => self.on_proposal(&peer, &proposal),
            Message::CastVote(vote) => self.on_vote(&vote),
            Message::FinalizeBlock(finalization) => self.on_finalization(&finalization),
            Message::SyncRequest(request) => self.on_sync_request(&peer, &request),
            Message::SyncResponse(response) => self.on_sync_response(&peer, &response),
            _ => Ok(()),
        };

        if let Err(err) = result {
            self.log.warn(
                "dropping consensus message",
                json!({ "peer": peer, "type": kind.as_str(), "reason": err.to_string() }),
            );
        }
    }

    fn on_proposal(&self, peer: &PeerId, proposal: &ProposalMessage) -> Result<(), ConsensusError> {
        if &proposal.proposer_id == self.peer_id() {
            return Ok(());
        }

        let local_tip = self.ledger.height();
        let (vote, sync) = {
            let mut engine = self.engine();
            let known = engine.is_known_peer(&proposal.proposer_id)
                || self.transport.is_connected(&proposal.proposer_id);
            let vote = engine.receive_proposal(proposal, local_tip, known)?;
            let sync = (proposal.block_index > local_tip + 1).then(|| engine.request_sync(local_tip));
            (vote, sync)
        };

        self.transport.send_to(peer, &Message::CastVote(vote));
        if let Some(request) = sync {
            self.log.info(
                "behind proposer, requesting sync",
                json!({ "peer": peer, "localTip": local_tip, "proposed": proposal.block_index }),
            );
            self.transport.send_to(peer, &Message::SyncRequest(request));
        }
        Ok(())
    }

    fn on_vote(&self, vote: &VoteMessage) -> Result<(), ConsensusError> {
        let outcome = self.engine().receive_vote(vote)?;
        match outcome {
            VoteOutcome::Counted => self.conclude(&vote.block_hash, false),
            VoteOutcome::Duplicate => {
                self.log.debug(
                    "duplicate vote ignored",
                    json!({ "voter": vote.voter_id, "hash": vote.block_hash }),
                );
                Ok(())
            }
            VoteOutcome::Closed => Ok(()),
        }
    }

    /// Finalizes or rejects one of our proposals once every connected peer
    /// has voted or its vote deadline has passed
    fn conclude(&self, block_hash: &str, deadline_passed: bool) -> Result<(), ConsensusError> {
        let connected = self.transport.connected_peers();

        let finalization = {
            let mut engine = self.engine();
            let status = engine.status(block_hash);
            let ours = status.proposer_id.as_ref() == Some(self.peer_id());
            if !ours || status.phase.map_or(true, Phase::is_closed) {
                return Ok(());
            }

            let voters = engine.voters(block_hash);
            let everyone_voted =
                !connected.is_empty() && connected.iter().all(|peer| voters.contains(peer));
            if !everyone_voted && !deadline_passed {
                return Ok(());
            }

            if status.result.reached {
                Some(engine.finalize(block_hash, &status.result)?)
            } else {
                engine.reject(block_hash)?;
                None
            }
        };

        if let Some(finalization) = finalization {
            self.transport
                .broadcast(&Message::FinalizeBlock(finalization), None);
        }
        Ok(())
    }

    /// Concludes every own proposal whose vote deadline has passed
    fn conclude_expired(&self) {
        let expired = self.engine().expired_proposals();
        for block_hash in expired {
            if let Err(err) = self.conclude(&block_hash, true) {
                self.log.warn(
                    "could not conclude proposal",
                    json!({ "hash": block_hash, "reason": err.to_string() }),
                );
            }
        }
    }

    fn on_finalization(&self, finalization: &FinalizationMessage) -> Result<(), ConsensusError> {
        self.engine().receive_finalization(finalization)?;
        self.log.info(
            "block finalized by peer",
            json!({ "hash": finalization.block_hash, "by": finalization.signature.signer }),
        );
        Ok(())
    }

    fn on_sync_request(&self, peer: &PeerId, request: &SyncRequestMessage) -> Result<(), ConsensusError> {
        let response = {
            let engine = self.engine();
            engine.verify_sync_request(request)?;
            engine.respond_sync(&self.ledger.blocks_after(request.last_known_index))
        };
        self.transport.send_to(peer, &Message::SyncResponse(response));
        Ok(())
    }

    fn on_sync_response(&self, peer: &PeerId, response: &SyncResponseMessage) -> Result<(), ConsensusError> {
        self.engine().verify_sync_response(response)?;
        self.log.info(
            "received sync response",
            json!({
                "peer": peer,
                "blocks": response.blocks.len(),
                "remoteTip": response.blocks.last().map(|block| block.index),
            }),
        );
        Ok(())
    }

    /// Adds an event to the ledger, sealing when the batch is full
    pub async fn submit_event(&self, kind: &str, payload: Value) -> Result<Event, NodeError> {
        Ok(self.ledger.integrate(kind, payload).await?)
    }

    /// Seals the pending events now
    pub async fn seal(&self) -> Result<Block, NodeError> {
        Ok(self.ledger.seal_block().await?)
    }

    pub async fn transfer(&self, from: &PeerId, to: &PeerId, amount: u64) -> bool {
        self.ledger.transfer(from, to, amount).await
    }

    /// Dials a peer with the configured retry budget, optionally insisting
    /// on its identity
    pub async fn connect(&self, address: &str, expected: Option<&PeerId>) -> bool {
        let connected = self
            .transport
            .connect(address, expected, self.config.transport.connect_retries)
            .await;
        if connected {
            for peer in self.transport.connected_peers() {
                self.engine().add_known_peer(peer);
            }
        }
        connected
    }

    /// Dials every bootstrap peer in the background
    pub fn connect_bootstrap_peers(&self) {
        for address in self.config.node.bootstrap_peers.clone() {
            let node = self.clone();
            tokio::spawn(async move {
                node.connect(&address, None).await;
            });
        }
    }

    pub fn consensus_status(&self, block_hash: &str) -> ConsensusStatus {
        self.engine().status(block_hash)
    }

    /// Tallies and, if this node proposed the block and the vote is over,
    /// concludes it
    pub fn tally(&self, block_hash: &str) -> Result<ConsensusStatus, ConsensusError> {
        self.conclude(block_hash, false)?;
        Ok(self.consensus_status(block_hash))
    }
}

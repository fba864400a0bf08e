use actix_web::{web, HttpResponse, Responder};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use utoipa::ToSchema;

use crate::blockchain::crypto::PeerId;
use crate::blockchain::{Block, Event, LedgerError};
use crate::network::{ConnectionInfo, DiscoveredPeer};
use crate::node::{Node, NodeError};

/// Shared node handle
pub type NodeData = web::Data<Node>;

fn error_response(err: &NodeError) -> HttpResponse {
    let body = json!({ "error": err.to_string() });
    match err {
        NodeError::Ledger(LedgerError::SealInProgress) => HttpResponse::Conflict().json(body),
        NodeError::Ledger(_) => HttpResponse::BadRequest().json(body),
        _ => HttpResponse::InternalServerError().json(body),
    }
}

fn parse_peer(peer: &str) -> Result<PeerId, HttpResponse> {
    peer.parse().map_err(|err| {
        HttpResponse::BadRequest().json(json!({
            "error": format!("Invalid peer id {}: {}", peer, err)
        }))
    })
}

/// Response for the chain endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ChainResponse {
    /// The length of the chain
    pub length: usize,

    /// The blocks in the chain
    #[schema(value_type = Vec<Object>)]
    pub chain: Vec<Block>,

    /// Whether the chain is valid
    pub is_valid: bool,
}

/// Get the full chain
///
/// Returns every sealed block and the chain's validity
#[utoipa::path(
    get,
    path = "/api/v1/chain",
    responses(
        (status = 200, description = "Chain retrieved successfully", body = ChainResponse)
    )
)]
pub async fn get_chain(node: NodeData) -> impl Responder {
    let chain = node.ledger().get_blocks();
    let is_valid = node.ledger().validate_chain();

    HttpResponse::Ok().json(ChainResponse {
        length: chain.len(),
        chain,
        is_valid,
    })
}

/// Response for the pending events endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct PendingEventsResponse {
    pub count: usize,

    #[schema(value_type = Vec<Object>)]
    pub events: Vec<Event>,
}

/// Get all pending events
///
/// Returns the events waiting to be sealed into a block
#[utoipa::path(
    get,
    path = "/api/v1/events/pending",
    responses(
        (status = 200, description = "Pending events retrieved successfully", body = PendingEventsResponse)
    )
)]
pub async fn get_pending_events(node: NodeData) -> impl Responder {
    let events = node.ledger().get_pending_events();
    HttpResponse::Ok().json(PendingEventsResponse {
        count: events.len(),
        events,
    })
}

/// Request for the submit event endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct EventRequest {
    /// Application defined event kind
    pub kind: String,

    /// Arbitrary JSON payload
    #[schema(value_type = Object)]
    #[serde(default)]
    pub payload: Value,
}

/// Response for the submit event endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct EventResponse {
    pub message: String,

    #[schema(value_type = Object)]
    pub event: Event,
}

/// Submit a new event
///
/// Queues an event; a full batch is sealed into a block and proposed to peers
#[utoipa::path(
    post,
    path = "/api/v1/events",
    request_body = EventRequest,
    responses(
        (status = 201, description = "Event queued", body = EventResponse),
        (status = 400, description = "Invalid event")
    )
)]
pub async fn submit_event(node: NodeData, request: web::Json<EventRequest>) -> impl Responder {
    let request = request.into_inner();
    if request.kind.trim().is_empty() {
        return HttpResponse::BadRequest().json(json!({ "error": "Event kind must not be empty" }));
    }

    match node.submit_event(&request.kind, request.payload).await {
        Ok(event) => HttpResponse::Created().json(EventResponse {
            message: "Event queued".to_string(),
            event,
        }),
        Err(err) => error_response(&err),
    }
}

/// Response for the seal endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct SealResponse {
    pub message: String,

    #[schema(value_type = Object)]
    pub block: Block,
}

/// Seal pending events now
///
/// Seals every pending event into a block without waiting for a full batch
#[utoipa::path(
    post,
    path = "/api/v1/blocks/seal",
    responses(
        (status = 200, description = "Block sealed", body = SealResponse),
        (status = 400, description = "No pending events"),
        (status = 409, description = "A seal is already running")
    )
)]
pub async fn seal_block(node: NodeData) -> impl Responder {
    match node.seal().await {
        Ok(block) => HttpResponse::Ok().json(SealResponse {
            message: "New block sealed".to_string(),
            block,
        }),
        Err(err) => error_response(&err),
    }
}

/// Check if the chain is valid
#[utoipa::path(
    get,
    path = "/api/v1/validate",
    responses(
        (status = 200, description = "Chain validation status", body = bool)
    )
)]
pub async fn validate_chain(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(node.ledger().validate_chain())
}

/// Response for the balance endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct BalanceResponse {
    pub peer: String,

    /// Balance committed by sealed blocks
    pub balance: u64,

    /// Balance minus transfers still waiting to be sealed
    pub available: u64,
}

/// Get a peer's balance
#[utoipa::path(
    get,
    path = "/api/v1/balance/{peer}",
    params(
        ("peer" = String, Path, description = "Base58 peer id")
    ),
    responses(
        (status = 200, description = "Balance retrieved successfully", body = BalanceResponse),
        (status = 400, description = "Invalid peer id")
    )
)]
pub async fn get_balance(node: NodeData, peer: web::Path<String>) -> impl Responder {
    let peer = match parse_peer(&peer) {
        Ok(peer) => peer,
        Err(response) => return response,
    };

    HttpResponse::Ok().json(BalanceResponse {
        balance: node.ledger().get_balance(&peer),
        available: node.ledger().available_balance(&peer),
        peer: peer.to_string(),
    })
}

/// Request for the transfer endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct TransferRequest {
    /// Sender, defaults to this node
    #[serde(default)]
    pub from: Option<String>,

    pub to: String,

    pub amount: u64,
}

/// Queue a transfer
///
/// The transfer is applied when the block holding it is sealed
#[utoipa::path(
    post,
    path = "/api/v1/transfer",
    request_body = TransferRequest,
    responses(
        (status = 201, description = "Transfer queued"),
        (status = 400, description = "Invalid peer id or insufficient funds")
    )
)]
pub async fn transfer(node: NodeData, request: web::Json<TransferRequest>) -> impl Responder {
    let from = match &request.from {
        Some(from) => match parse_peer(from) {
            Ok(peer) => peer,
            Err(response) => return response,
        },
        None => node.peer_id().clone(),
    };
    let to = match parse_peer(&request.to) {
        Ok(peer) => peer,
        Err(response) => return response,
    };

    if node.transfer(&from, &to, request.amount).await {
        HttpResponse::Created().json(json!({
            "message": format!("Transfer of {} queued", request.amount),
            "available": node.ledger().available_balance(&from),
        }))
    } else {
        HttpResponse::BadRequest().json(json!({
            "error": format!(
                "Insufficient funds: required {}, available {}",
                request.amount,
                node.ledger().available_balance(&from)
            ),
            "required": request.amount,
            "available": node.ledger().available_balance(&from),
        }))
    }
}

/// Get the consensus state of a block
#[utoipa::path(
    get,
    path = "/api/v1/consensus/{hash}",
    params(
        ("hash" = String, Path, description = "Block hash")
    ),
    responses(
        (status = 200, description = "Phase, votes and current tally of the block"),
        (status = 404, description = "No proposal or vote seen for this block")
    )
)]
pub async fn get_consensus(node: NodeData, hash: web::Path<String>) -> impl Responder {
    let status = node.consensus_status(&hash);
    if status.phase.is_none() && status.votes.is_empty() {
        return HttpResponse::NotFound().json(json!({
            "error": format!("Unknown block {}", hash.as_str())
        }));
    }
    HttpResponse::Ok().json(status)
}

/// Response for the peers endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct PeersResponse {
    /// This node's peer id
    pub peer_id: String,

    #[schema(value_type = Vec<Object>)]
    pub connections: Vec<ConnectionInfo>,

    #[schema(value_type = Vec<Object>)]
    pub discovered: Vec<DiscoveredPeer>,
}

/// List connected and discovered peers
#[utoipa::path(
    get,
    path = "/api/v1/peers",
    responses(
        (status = 200, description = "Peers retrieved successfully", body = PeersResponse)
    )
)]
pub async fn get_peers(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(PeersResponse {
        peer_id: node.peer_id().to_string(),
        connections: node.transport().connections(),
        discovered: node.transport().discovered_peers(),
    })
}

/// Request for the connect endpoint
#[derive(Serialize, Deserialize, ToSchema)]
pub struct ConnectRequest {
    /// Peer listening address as `host:port`
    pub address: String,

    /// Peer id the remote node must prove during the handshake
    pub peer_id: Option<String>,
}

/// Connect to a peer
#[utoipa::path(
    post,
    path = "/api/v1/peers/connect",
    request_body = ConnectRequest,
    responses(
        (status = 200, description = "Connected"),
        (status = 400, description = "Invalid peer id"),
        (status = 502, description = "Peer could not be reached")
    )
)]
pub async fn connect_peer(node: NodeData, request: web::Json<ConnectRequest>) -> impl Responder {
    let expected = match request.peer_id.as_deref().map(parse_peer).transpose() {
        Ok(expected) => expected,
        Err(response) => return response,
    };

    if node.connect(&request.address, expected.as_ref()).await {
        HttpResponse::Ok().json(json!({
            "message": format!("Connected to {}", request.address),
            "connections": node.transport().connection_count(),
        }))
    } else {
        HttpResponse::BadGateway().json(json!({
            "error": format!("Could not connect to {}", request.address)
        }))
    }
}

/// Read the health gauges
#[utoipa::path(
    get,
    path = "/api/v1/health",
    responses(
        (status = 200, description = "Current gauge readings")
    )
)]
pub async fn get_health(node: NodeData) -> impl Responder {
    HttpResponse::Ok().json(json!({
        "peerId": node.peer_id(),
        "gauges": node.health().snapshot(),
    }))
}

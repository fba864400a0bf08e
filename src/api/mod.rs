// API module
//
// HTTP surface of the node: handlers, routes and the OpenAPI document

pub mod handlers;
pub mod routes;

use utoipa::OpenApi;

pub use routes::configure_routes;

#[derive(OpenApi)]
#[openapi(
    paths(
        handlers::get_chain,
        handlers::get_pending_events,
        handlers::submit_event,
        handlers::seal_block,
        handlers::validate_chain,
        handlers::get_balance,
        handlers::transfer,
        handlers::get_consensus,
        handlers::get_peers,
        handlers::connect_peer,
        handlers::get_health
    ),
    components(
        schemas(
            handlers::ChainResponse,
            handlers::PendingEventsResponse,
            handlers::EventRequest,
            handlers::EventResponse,
            handlers::SealResponse,
            handlers::BalanceResponse,
            handlers::TransferRequest,
            handlers::PeersResponse,
            handlers::ConnectRequest
        )
    ),
    tags(
        (name = "resonance", description = "Ledger, consensus and peer endpoints")
    ),
    info(
        title = "Resonance Node API",
        version = "0.1.0",
        description = "HTTP API of a resonance ledger node",
        license(
            name = "MIT",
            url = "https://opensource.org/licenses/MIT"
        )
    )
)]
pub struct ApiDoc;

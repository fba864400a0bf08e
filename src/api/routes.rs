use actix_web::web;

use super::handlers;

/// Configures the API routes
///
/// # Arguments
///
/// * `cfg` - The service configuration
pub fn configure_routes(cfg: &mut web::ServiceConfig) {
    cfg.service(
        web::scope("/api/v1")
            .route("/chain", web::get().to(handlers::get_chain))
            .route("/events/pending", web::get().to(handlers::get_pending_events))
            .route("/events", web::post().to(handlers::submit_event))
            .route("/blocks/seal", web::post().to(handlers::seal_block))
            .route("/validate", web::get().to(handlers::validate_chain))
            .route("/balance/{peer}", web::get().to(handlers::get_balance))
            .route("/transfer", web::post().to(handlers::transfer))
            .route("/consensus/{hash}", web::get().to(handlers::get_consensus))
            .route("/peers", web::get().to(handlers::get_peers))
            .route("/peers/connect", web::post().to(handlers::connect_peer))
            .route("/health", web::get().to(handlers::get_health)),
    );
}

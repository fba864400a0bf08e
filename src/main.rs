use actix_cors::Cors;
use actix_web::{middleware, web, App, HttpServer};
use anyhow::Context;
use log::info;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use std::sync::Arc;

use resonance_node::api::{self, ApiDoc};
use resonance_node::blockchain::Wallet;
use resonance_node::clock::SystemClock;
use resonance_node::logging::LogFacade;
use resonance_node::{Node, NodeConfig};

// Use the configured identity, or generate one for this run
fn load_wallet(config: &NodeConfig) -> anyhow::Result<Wallet> {
    match &config.node.secret_key_hex {
        Some(secret) => Wallet::from_secret_hex(secret).context("invalid secret key"),
        None => {
            let wallet = Wallet::new();
            info!(
                "Generated node identity, secret key: {}",
                hex::encode(wallet.export_secret_key())
            );
            Ok(wallet)
        }
    }
}

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or("info"));

    let config = NodeConfig::load().context("failed to load configuration")?;
    let wallet = load_wallet(&config)?;
    let api_port = config.node.api_port;

    let node = Node::new(
        config,
        Arc::new(wallet),
        Arc::new(SystemClock),
        Arc::new(LogFacade),
    )
    .context("failed to create node")?;

    let address = node.start().await.context("failed to start transport")?;
    info!("Node {} listening for peers on {}", node.peer_id(), address);
    node.connect_bootstrap_peers();

    let data = web::Data::new(node.clone());

    info!("Starting HTTP server at http://0.0.0.0:{}", api_port);

    let server = HttpServer::new(move || {
        // Configure CORS
        let cors = Cors::default()
            .allow_any_origin()
            .allow_any_method()
            .allow_any_header()
            .max_age(3600);

        App::new()
            .wrap(middleware::Logger::default())
            .wrap(cors)
            .app_data(data.clone())
            .configure(api::configure_routes)
            .service(
                SwaggerUi::new("/swagger-ui/{_:.*}")
                    .url("/api-docs/openapi.json", ApiDoc::openapi()),
            )
    })
    .bind(("0.0.0.0", api_port))?
    .disable_signals()
    .run();

    let handle = server.handle();
    tokio::select! {
        result = server => result?,
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down");
            handle.stop(true).await;
        }
    }

    node.stop();
    Ok(())
}

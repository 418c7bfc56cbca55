use std::error::Error;
use std::sync::Arc;

use fulfillment::{
    executable_utils::{initialize_executable, initialize_tracing},
    outbox::Relay,
};
use market::{
    http_object_storage::HttpObjectStorage,
    metrics::{init_metrics, serve_metrics},
    pg_outbox::PgOutbox,
    pg_storage::PgMarketStorage,
};
use tokio::net::TcpListener;
use tracing::error;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    println!("Starting relay...");
    let config = initialize_executable()?;
    initialize_tracing(&config.relay.log_level);
    let metrics = init_metrics()?;

    let listener = TcpListener::bind(&config.relay.metrics_address).await?;
    tokio::spawn(async move {
        if let Err(e) = serve_metrics(listener, metrics).await {
            error!(error = %e, "Relay metrics server stopped");
        }
    });

    let outbox = Arc::new(PgOutbox::new(&config.common.database_url).await?);
    let conversations = Arc::new(PgMarketStorage::new(&config.common.database_url).await?);
    let objects = Arc::new(HttpObjectStorage::new(&config.storage));

    let relay = Relay::new(outbox, conversations, objects, config.relay);
    relay.run().await;

    Ok(())
}

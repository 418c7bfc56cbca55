use std::error::Error;
use std::sync::Arc;

use fulfillment::{
    changes::ChangeHub,
    executable_utils::{AppState, initialize_executable, initialize_tracing, run_backend},
    image::{CompressionOptions, ImagePipeline, ImagePolicy, JpegCompressor},
    object_store::ObjectStorage,
    order_service::OrderService,
    replacement::ReplacementService,
    reviews::ReviewService,
    storage::{OrderStorage, ReviewStorage},
};
use market::{
    http_object_storage::HttpObjectStorage,
    metrics::{init_metrics, metrics_router},
    pg_listener::OrderChangeListener,
    pg_storage::PgMarketStorage,
};
use tracing::{error, info};

const CHANGE_HUB_CAPACITY: usize = 1024;

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error + Send + Sync>> {
    println!("Starting backend...");
    let config = initialize_executable()?;
    initialize_tracing(&config.backend.log_level);
    let metrics = init_metrics()?;

    let changes = ChangeHub::new(CHANGE_HUB_CAPACITY);
    let listener =
        OrderChangeListener::connect(&config.common.database_url, changes.clone()).await?;
    tokio::spawn(async move {
        if let Err(e) = listener.run().await {
            error!(error = %e, "Order change listener stopped");
        }
    });

    let storage = Arc::new(PgMarketStorage::new(&config.common.database_url).await?);
    let order_storage: Arc<dyn OrderStorage> = storage.clone();
    let review_storage: Arc<dyn ReviewStorage> = storage;
    let objects: Arc<dyn ObjectStorage> = Arc::new(HttpObjectStorage::new(&config.storage));

    let policy = ImagePolicy::with_max_bytes(config.storage.max_upload_bytes);
    let mut images = ImagePipeline::new(objects, policy);
    if let Some(compression) = &config.storage.compression {
        let options = CompressionOptions::from(compression);
        info!(?options, "Compressing uploaded images");
        images = images.with_compressor(Arc::new(JpegCompressor), options);
    }

    let state = AppState::new(
        OrderService::new(order_storage.clone()),
        ReplacementService::new(order_storage.clone(), images),
        ReviewService::new(review_storage, order_storage.clone()),
        order_storage,
        changes,
    )
    .with_upload_limit(config.storage.max_upload_bytes);

    run_backend(config.backend, state, metrics_router(metrics)).await
}

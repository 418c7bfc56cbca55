use async_trait::async_trait;
use axum::{Router, body::Body, http::StatusCode};
use http_body_util::BodyExt;
use mockall::mock;
use std::sync::Arc;
use tower::ServiceExt;

use fulfillment::{
    error::MarketError,
    executable_utils::{AppState, build_router},
    image::{ImagePipeline, ImagePolicy},
    model::*,
    object_store::MemoryObjectStorage,
    order_service::OrderService,
    replacement::ReplacementService,
    reviews::ReviewService,
    storage::OrderStorage,
};

use super::test_utils::Market;

mock! {
    pub OrderStore {}

    #[async_trait]
    impl OrderStorage for OrderStore {
        async fn get_order(&self, order_id: ModelId) -> Result<Order, MarketError>;
        async fn get_order_item(&self, item_id: ModelId) -> Result<OrderItem, MarketError>;
        async fn get_product(&self, product_id: ModelId) -> Result<Product, MarketError>;
        async fn update_status(
            &self,
            order_id: ModelId,
            expected: OrderStatus,
            target: OrderStatus,
        ) -> Result<Order, MarketError>;
        async fn cancel_order(
            &self,
            order_id: ModelId,
            expected: OrderStatus,
        ) -> Result<Vec<StockRestore>, MarketError>;
        async fn file_replacement_request(
            &self,
            item_id: ModelId,
            request: &ReplacementRequest,
            notification: OutboxPayload,
        ) -> Result<OrderItem, MarketError>;
        async fn clear_replacement_request(
            &self,
            item_id: ModelId,
            expected: &ReplacementRequest,
            follow_ups: Vec<OutboxPayload>,
        ) -> Result<OrderItem, MarketError>;
        async fn load_order_view(
            &self,
            order_id: ModelId,
        ) -> Result<Option<OrderView>, MarketError>;
        async fn list_order_views(&self, scope: OrderScope) -> Result<Vec<OrderView>, MarketError>;
    }
}

pub fn market_router(market: &Market) -> Router {
    build_router(AppState::new(
        market.orders.clone(),
        market.replacements.clone(),
        market.reviews.clone(),
        market.storage.clone(),
        market.changes.clone(),
    ))
}

/// Router whose order storage is `store`; reviews still use an in-memory store.
pub fn mocked_router(store: MockOrderStore) -> Router {
    let store: Arc<dyn OrderStorage> = Arc::new(store);
    let market = Market::new();
    let images = ImagePipeline::new(Arc::new(MemoryObjectStorage::new()), ImagePolicy::default());
    build_router(AppState::new(
        OrderService::new(store.clone()),
        ReplacementService::new(store.clone(), images),
        ReviewService::new(market.storage.clone(), store.clone()),
        store,
        market.changes.clone(),
    ))
}

pub async fn send<B>(router: Router, request: http::Request<B>) -> (StatusCode, serde_json::Value)
where
    B: Into<Body>,
{
    let (parts, body) = request.into_parts();
    let request = http::Request::from_parts(parts, body.into());
    let response = router.oneshot(request).await.unwrap();
    let status = response.status();
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    let json = if bytes.is_empty() {
        serde_json::Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or_else(|_| {
            serde_json::Value::String(String::from_utf8_lossy(&bytes).into_owned())
        })
    };
    (status, json)
}

#![allow(dead_code)]

use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

use common::config::RelayConfig;
use fulfillment::{
    changes::ChangeHub,
    error::MarketError,
    image::{ImageFile, ImagePipeline, ImagePolicy},
    model::{
        Actor, ModelId, Order, OrderItem, OrderScope, OrderStatus, OrderView, OutboxPayload,
        Product, ReplacementRequest, StockRestore,
    },
    object_store::MemoryObjectStorage,
    order_service::OrderService,
    outbox::Relay,
    replacement::ReplacementService,
    reviews::ReviewService,
    storage::{OrderStorage, memory::MemoryStorage},
};

/// Relay settings that retry immediately and park after three attempts.
pub fn fast_relay_config() -> RelayConfig {
    RelayConfig {
        batch_size: 50,
        sleep_ms: 10,
        max_attempts: 3,
        base_delay_ms: 0,
        max_delay_ms: 0,
        log_level: "debug".to_string(),
        metrics_address: "127.0.0.1:0".to_string(),
    }
}

pub fn jpeg(len: usize) -> ImageFile {
    ImageFile::new("evidence.jpg", "image/jpeg", vec![0xFF; len])
}

/// Order storage that yields to the scheduler after every read, so two
/// operations joined on one task both read before either writes.
pub struct YieldingStorage {
    inner: Arc<MemoryStorage>,
}

impl YieldingStorage {
    pub fn new(inner: Arc<MemoryStorage>) -> Arc<Self> {
        Arc::new(Self { inner })
    }
}

#[async_trait]
impl OrderStorage for YieldingStorage {
    async fn get_order(&self, order_id: ModelId) -> Result<Order, MarketError> {
        let order = self.inner.get_order(order_id).await;
        tokio::task::yield_now().await;
        order
    }

    async fn get_order_item(&self, item_id: ModelId) -> Result<OrderItem, MarketError> {
        let item = self.inner.get_order_item(item_id).await;
        tokio::task::yield_now().await;
        item
    }

    async fn get_product(&self, product_id: ModelId) -> Result<Product, MarketError> {
        self.inner.get_product(product_id).await
    }

    async fn update_status(
        &self,
        order_id: ModelId,
        expected: OrderStatus,
        target: OrderStatus,
    ) -> Result<Order, MarketError> {
        self.inner.update_status(order_id, expected, target).await
    }

    async fn cancel_order(
        &self,
        order_id: ModelId,
        expected: OrderStatus,
    ) -> Result<Vec<StockRestore>, MarketError> {
        self.inner.cancel_order(order_id, expected).await
    }

    async fn file_replacement_request(
        &self,
        item_id: ModelId,
        request: &ReplacementRequest,
        notification: OutboxPayload,
    ) -> Result<OrderItem, MarketError> {
        self.inner.file_replacement_request(item_id, request, notification).await
    }

    async fn clear_replacement_request(
        &self,
        item_id: ModelId,
        expected: &ReplacementRequest,
        follow_ups: Vec<OutboxPayload>,
    ) -> Result<OrderItem, MarketError> {
        self.inner.clear_replacement_request(item_id, expected, follow_ups).await
    }

    async fn load_order_view(&self, order_id: ModelId) -> Result<Option<OrderView>, MarketError> {
        self.inner.load_order_view(order_id).await
    }

    async fn list_order_views(&self, scope: OrderScope) -> Result<Vec<OrderView>, MarketError> {
        self.inner.list_order_views(scope).await
    }
}

/// A marketplace wired entirely to in-memory backends.
pub struct Market {
    pub changes: ChangeHub,
    pub storage: Arc<MemoryStorage>,
    pub objects: Arc<MemoryObjectStorage>,
    pub orders: OrderService,
    pub replacements: ReplacementService,
    pub reviews: ReviewService,
    pub consumer: Uuid,
    pub producer: Uuid,
}

impl Market {
    pub fn new() -> Self {
        let changes = ChangeHub::new(64);
        let storage = Arc::new(MemoryStorage::new(changes.clone()));
        let objects = Arc::new(MemoryObjectStorage::new());
        let images = ImagePipeline::new(objects.clone(), ImagePolicy::default());
        let consumer = Uuid::new_v4();
        let producer = Uuid::new_v4();
        storage.add_profile(consumer, "Maria Santos");
        storage.add_profile(producer, "Jose Cruz");

        Self {
            orders: OrderService::new(storage.clone()),
            replacements: ReplacementService::new(storage.clone(), images),
            reviews: ReviewService::new(storage.clone(), storage.clone()),
            changes,
            storage,
            objects,
            consumer,
            producer,
        }
    }

    /// Same backing store, but reads yield; see [`YieldingStorage`].
    pub fn yielding_storage(&self) -> Arc<YieldingStorage> {
        YieldingStorage::new(self.storage.clone())
    }

    pub fn relay(&self, config: RelayConfig) -> Relay {
        Relay::new(self.storage.clone(), self.storage.clone(), self.objects.clone(), config)
    }

    pub fn consumer_actor(&self) -> Actor {
        Actor::consumer(self.consumer)
    }

    pub fn producer_actor(&self) -> Actor {
        Actor::producer(self.producer)
    }

    pub fn product(&self, name: &str, stock: i32) -> Product {
        self.storage.add_product(self.producer, name, Some("Vegetables"), stock)
    }

    pub fn order(&self, status: OrderStatus, lines: &[(ModelId, i32)]) -> Order {
        let lines: Vec<(ModelId, i32, f64)> = lines.iter().map(|(p, q)| (*p, *q, 25.0)).collect();
        self.storage
            .add_order(self.consumer, self.producer, status, 0.0, &lines)
            .expect("seed order")
    }
}

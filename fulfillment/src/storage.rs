use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::error::MarketError;
use crate::model::*;

#[cfg(any(test, feature = "test-helpers"))]
pub mod memory;

/// Orders, their items and the stock of the products they reference.
///
/// Every mutating method is a single atomic unit in the backing store and
/// publishes an order change once it has committed.
#[async_trait]
pub trait OrderStorage: Send + Sync {
    async fn get_order(&self, order_id: ModelId) -> Result<Order, MarketError>;

    async fn get_order_item(&self, item_id: ModelId) -> Result<OrderItem, MarketError>;

    async fn get_product(&self, product_id: ModelId) -> Result<Product, MarketError>;

    /// Compare-and-swap of the status. Fails with `StaleStatus` when the
    /// stored status is no longer `expected`.
    async fn update_status(
        &self,
        order_id: ModelId,
        expected: OrderStatus,
        target: OrderStatus,
    ) -> Result<Order, MarketError>;

    /// Restores `stock += quantity` for every item and marks the order
    /// cancelled, all in one transaction guarded by the `expected` status.
    async fn cancel_order(
        &self,
        order_id: ModelId,
        expected: OrderStatus,
    ) -> Result<Vec<StockRestore>, MarketError>;

    /// Writes the request onto the item only if it has none open, together
    /// with the outbox notification.
    async fn file_replacement_request(
        &self,
        item_id: ModelId,
        request: &ReplacementRequest,
        notification: OutboxPayload,
    ) -> Result<OrderItem, MarketError>;

    /// Clears the request only if it still equals `expected`, together with
    /// the follow-up outbox events.
    async fn clear_replacement_request(
        &self,
        item_id: ModelId,
        expected: &ReplacementRequest,
        follow_ups: Vec<OutboxPayload>,
    ) -> Result<OrderItem, MarketError>;

    async fn load_order_view(&self, order_id: ModelId) -> Result<Option<OrderView>, MarketError>;

    /// Newest orders first.
    async fn list_order_views(&self, scope: OrderScope) -> Result<Vec<OrderView>, MarketError>;
}

#[async_trait]
pub trait ConversationStorage: Send + Sync {
    /// Conversations are unique per (consumer, producer) pair.
    async fn find_or_create_conversation(
        &self,
        consumer_id: UserId,
        producer_id: UserId,
    ) -> Result<Conversation, MarketError>;

    async fn append_message(
        &self,
        conversation_id: ModelId,
        sender_id: UserId,
        body: &str,
    ) -> Result<Message, MarketError>;

    async fn list_messages(&self, conversation_id: ModelId) -> Result<Vec<Message>, MarketError>;
}

#[async_trait]
pub trait OutboxStorage: Send + Sync {
    /// Claims up to `limit` events that are due. A claimed event is not
    /// handed out again until its lease expires or it is marked.
    async fn fetch_due(&self, limit: u32) -> Result<Vec<OutboxEvent>, MarketError>;

    async fn mark_delivered(&self, event_id: ModelId) -> Result<(), MarketError>;

    /// Records a failed attempt. `retry_at = None` parks the event for good.
    async fn mark_failed(
        &self,
        event_id: ModelId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), MarketError>;
}

#[async_trait]
pub trait ReviewStorage: Send + Sync {
    /// Whether `user_id` has a completed order containing `product_id`.
    async fn has_completed_purchase(
        &self,
        user_id: UserId,
        product_id: ModelId,
    ) -> Result<bool, MarketError>;

    async fn find_review(
        &self,
        user_id: UserId,
        product_id: ModelId,
    ) -> Result<Option<Review>, MarketError>;

    async fn get_review(&self, review_id: ModelId) -> Result<Review, MarketError>;

    /// Fails with `Conflict` when the user already reviewed the product.
    async fn insert_review(&self, review: NewReview) -> Result<Review, MarketError>;

    async fn product_ratings(&self, product_id: ModelId) -> Result<Vec<i16>, MarketError>;

    /// Adds the vote if absent, removes it otherwise. Returns whether the
    /// vote is now present and the new vote count.
    async fn toggle_helpful(
        &self,
        user_id: UserId,
        review_id: ModelId,
    ) -> Result<(bool, i64), MarketError>;

    /// Fails with `Conflict` when the user already reported the review.
    async fn insert_report(
        &self,
        user_id: UserId,
        review_id: ModelId,
        reason: &str,
    ) -> Result<(), MarketError>;
}

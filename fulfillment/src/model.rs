use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use strum_macros::Display;
use uuid::Uuid;

pub use crate::status::OrderStatus;

pub type ModelId = i64;

/// Identifier of an authenticated platform user.
pub type UserId = Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum Role {
    Consumer,
    Producer,
}

/// The authenticated caller of an operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Actor {
    pub user_id: UserId,
    pub role: Role,
}

impl Actor {
    pub fn consumer(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Consumer,
        }
    }

    pub fn producer(user_id: UserId) -> Self {
        Self {
            user_id,
            role: Role::Producer,
        }
    }

    /// Whether this actor is the party of `order` that its role refers to.
    pub fn owns(&self, order: &Order) -> bool {
        match self.role {
            Role::Consumer => order.user_id == self.user_id,
            Role::Producer => order.seller_id == self.user_id,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacementRequest {
    pub reason: String,
    pub image_url: String,
    pub requested_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItem {
    pub id: ModelId,
    pub order_id: ModelId,
    pub product_id: ModelId,
    /// Name at the time of purchase
    pub product_name: String,
    /// Unit price at the time of purchase
    pub price: f64,
    pub quantity: i32,
    pub replacement: Option<ReplacementRequest>,
}

impl OrderItem {
    pub fn subtotal(&self) -> f64 {
        self.price * f64::from(self.quantity)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Order {
    pub id: ModelId,
    pub user_id: UserId,
    pub seller_id: UserId,
    pub status: OrderStatus,
    pub delivery_method: String,
    pub payment_method: String,
    pub delivery_fee: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<OrderItem>,
}

impl Order {
    pub fn total(&self) -> f64 {
        self.items.iter().map(OrderItem::subtotal).sum::<f64>() + self.delivery_fee
    }

    pub fn item(&self, item_id: ModelId) -> Option<&OrderItem> {
        self.items.iter().find(|item| item.id == item_id)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Product {
    pub id: ModelId,
    pub seller_id: UserId,
    pub name: String,
    pub category: Option<String>,
    pub stock: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Profile {
    pub id: UserId,
    pub full_name: String,
}

/// Stock given back to a product when an order is cancelled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StockRestore {
    pub product_id: ModelId,
    pub quantity: i32,
    /// Stock after the restore
    pub stock: i32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: ModelId,
    pub consumer_id: UserId,
    pub producer_id: UserId,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub id: ModelId,
    pub conversation_id: ModelId,
    pub sender_id: UserId,
    pub body: String,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Review {
    pub id: ModelId,
    pub user_id: UserId,
    pub product_id: ModelId,
    pub rating: i16,
    pub comment: Option<String>,
    pub image_url: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewReview {
    pub user_id: UserId,
    pub product_id: ModelId,
    pub rating: i16,
    pub comment: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RatingSummary {
    pub product_id: ModelId,
    pub count: i64,
    pub average: f64,
    /// Number of reviews per star, index 0 holds the 1-star count
    pub distribution: [i64; 5],
}

impl RatingSummary {
    pub fn from_ratings(product_id: ModelId, ratings: &[i16]) -> Self {
        let mut distribution = [0i64; 5];
        for rating in ratings.iter().filter(|r| (1..=5).contains(*r)) {
            distribution[(*rating - 1) as usize] += 1;
        }
        let count: i64 = distribution.iter().sum();
        let weighted: i64 = distribution
            .iter()
            .enumerate()
            .map(|(idx, n)| (idx as i64 + 1) * n)
            .sum();
        let average = if count == 0 {
            0.0
        } else {
            weighted as f64 / count as f64
        };

        Self {
            product_id,
            count,
            average,
            distribution,
        }
    }
}

// =============================================================================
// Outbox
// =============================================================================

/// Side effect recorded in the same transaction as the state change that
/// caused it, delivered later by the relay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum OutboxPayload {
    ChatMessage {
        consumer_id: UserId,
        producer_id: UserId,
        sender_id: UserId,
        body: String,
    },
    DeleteObject {
        bucket: String,
        url: String,
    },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub id: ModelId,
    pub payload: OutboxPayload,
    pub attempts: i32,
    pub next_attempt_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}

// =============================================================================
// Realtime changes
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ChangeKind {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OrderChange {
    pub kind: ChangeKind,
    pub order_id: ModelId,
    pub user_id: UserId,
    pub seller_id: UserId,
}

impl OrderChange {
    pub fn of(kind: ChangeKind, order: &Order) -> Self {
        Self {
            kind,
            order_id: order.id,
            user_id: order.user_id,
            seller_id: order.seller_id,
        }
    }
}

/// Row filter of a change subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderScope {
    /// `orders.user_id = me`
    Consumer(UserId),
    /// `orders.seller_id = me`
    Seller(UserId),
}

impl OrderScope {
    pub fn for_actor(actor: &Actor) -> Self {
        match actor.role {
            Role::Consumer => OrderScope::Consumer(actor.user_id),
            Role::Producer => OrderScope::Seller(actor.user_id),
        }
    }

    pub fn matches(&self, change: &OrderChange) -> bool {
        match self {
            OrderScope::Consumer(user) => change.user_id == *user,
            OrderScope::Seller(user) => change.seller_id == *user,
        }
    }

    pub fn includes(&self, order: &Order) -> bool {
        match self {
            OrderScope::Consumer(user) => order.user_id == *user,
            OrderScope::Seller(user) => order.seller_id == *user,
        }
    }
}

// =============================================================================
// Projections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderItemView {
    pub id: ModelId,
    pub product_id: ModelId,
    pub product_name: String,
    pub category: Option<String>,
    pub farmer_name: Option<String>,
    pub price: f64,
    pub quantity: i32,
    pub replacement: Option<ReplacementRequest>,
}

/// Flattened order as shown on the consumer and producer order screens.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OrderView {
    pub id: ModelId,
    pub user_id: UserId,
    pub seller_id: UserId,
    pub consumer_name: Option<String>,
    pub status: OrderStatus,
    pub status_code: i32,
    pub delivery_method: String,
    pub payment_method: String,
    pub delivery_fee: f64,
    pub total: f64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub items: Vec<OrderItemView>,
}

impl OrderView {
    pub fn build(
        order: &Order,
        products: &HashMap<ModelId, Product>,
        profiles: &HashMap<UserId, Profile>,
    ) -> Self {
        let items = order
            .items
            .iter()
            .map(|item| {
                let product = products.get(&item.product_id);
                OrderItemView {
                    id: item.id,
                    product_id: item.product_id,
                    product_name: item.product_name.clone(),
                    category: product.and_then(|p| p.category.clone()),
                    farmer_name: product
                        .and_then(|p| profiles.get(&p.seller_id))
                        .map(|profile| profile.full_name.clone()),
                    price: item.price,
                    quantity: item.quantity,
                    replacement: item.replacement.clone(),
                }
            })
            .collect();

        Self {
            id: order.id,
            user_id: order.user_id,
            seller_id: order.seller_id,
            consumer_name: profiles.get(&order.user_id).map(|p| p.full_name.clone()),
            status: order.status,
            status_code: order.status.code(),
            delivery_method: order.delivery_method.clone(),
            payment_method: order.payment_method.clone(),
            delivery_fee: order.delivery_fee,
            total: order.total(),
            created_at: order.created_at,
            updated_at: order.updated_at,
            items,
        }
    }
}

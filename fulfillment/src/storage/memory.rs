//! In-process storage used by tests and local runs.
//!
//! One mutex guards all tables so every trait method is atomic, the same
//! guarantee the Postgres implementation gets from its transactions.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::changes::ChangeHub;
use crate::error::MarketError;
use crate::model::*;
use crate::storage::{ConversationStorage, OrderStorage, OutboxStorage, ReviewStorage};

/// Lease given to claimed outbox events.
const CLAIM_LEASE_SECS: i64 = 30;

#[derive(Default)]
struct State {
    next_id: ModelId,
    orders: BTreeMap<ModelId, Order>,
    products: HashMap<ModelId, Product>,
    profiles: HashMap<UserId, Profile>,
    conversations: Vec<Conversation>,
    messages: Vec<Message>,
    outbox: BTreeMap<ModelId, OutboxRecord>,
    reviews: BTreeMap<ModelId, Review>,
    helpful: HashSet<(UserId, ModelId)>,
    reports: HashSet<(UserId, ModelId)>,
}

#[derive(Debug, Clone)]
struct OutboxRecord {
    event: OutboxEvent,
    delivered: bool,
    parked: bool,
}

impl State {
    fn next_id(&mut self) -> ModelId {
        self.next_id += 1;
        self.next_id
    }

    fn order(&self, order_id: ModelId) -> Result<&Order, MarketError> {
        self.orders
            .get(&order_id)
            .ok_or_else(|| MarketError::not_found("order", order_id))
    }

    fn order_of_item(&mut self, item_id: ModelId) -> Result<&mut Order, MarketError> {
        self.orders
            .values_mut()
            .find(|order| order.item(item_id).is_some())
            .ok_or_else(|| MarketError::not_found("order item", item_id))
    }

    fn enqueue(&mut self, payload: OutboxPayload) {
        let id = self.next_id();
        self.outbox.insert(
            id,
            OutboxRecord {
                event: OutboxEvent {
                    id,
                    payload,
                    attempts: 0,
                    next_attempt_at: None,
                    last_error: None,
                    created_at: Utc::now(),
                },
                delivered: false,
                parked: false,
            },
        );
    }

    fn view(&self, order: &Order) -> OrderView {
        OrderView::build(order, &self.products, &self.profiles)
    }
}

/// Storage backed by in-memory tables.
pub struct MemoryStorage {
    state: Mutex<State>,
    changes: ChangeHub,
    fail_replacement_writes: AtomicBool,
    fail_messages: AtomicBool,
}

impl Default for MemoryStorage {
    fn default() -> Self {
        Self::new(ChangeHub::default())
    }
}

impl MemoryStorage {
    pub fn new(changes: ChangeHub) -> Self {
        Self {
            state: Mutex::new(State::default()),
            changes,
            fail_replacement_writes: AtomicBool::new(false),
            fail_messages: AtomicBool::new(false),
        }
    }

    pub fn changes(&self) -> &ChangeHub {
        &self.changes
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // --- seeding -----------------------------------------------------------

    pub fn add_profile(&self, id: UserId, full_name: &str) {
        self.lock().profiles.insert(
            id,
            Profile {
                id,
                full_name: full_name.to_string(),
            },
        );
    }

    pub fn add_product(
        &self,
        seller_id: UserId,
        name: &str,
        category: Option<&str>,
        stock: i32,
    ) -> Product {
        let mut state = self.lock();
        let product = Product {
            id: state.next_id(),
            seller_id,
            name: name.to_string(),
            category: category.map(str::to_string),
            stock,
        };
        state.products.insert(product.id, product.clone());
        product
    }

    /// Inserts an order with one item per `(product, quantity)`; prices and
    /// names are snapshotted from the products.
    pub fn add_order(
        &self,
        user_id: UserId,
        seller_id: UserId,
        status: OrderStatus,
        delivery_fee: f64,
        lines: &[(ModelId, i32, f64)],
    ) -> Result<Order, MarketError> {
        let order = {
            let mut state = self.lock();
            let order_id = state.next_id();
            let mut items = Vec::with_capacity(lines.len());
            for (product_id, quantity, price) in lines {
                let product_name = state
                    .products
                    .get(product_id)
                    .map(|p| p.name.clone())
                    .ok_or_else(|| MarketError::not_found("product", product_id))?;
                let item_id = state.next_id();
                items.push(OrderItem {
                    id: item_id,
                    order_id,
                    product_id: *product_id,
                    product_name,
                    price: *price,
                    quantity: *quantity,
                    replacement: None,
                });
            }
            let now = Utc::now();
            let order = Order {
                id: order_id,
                user_id,
                seller_id,
                status,
                delivery_method: "pickup".to_string(),
                payment_method: "cash_on_pickup".to_string(),
                delivery_fee,
                created_at: now,
                updated_at: now,
                items,
            };
            state.orders.insert(order_id, order.clone());
            order
        };
        self.changes.publish(OrderChange::of(ChangeKind::Insert, &order));
        Ok(order)
    }

    pub fn delete_order(&self, order_id: ModelId) -> Result<(), MarketError> {
        let order = self
            .lock()
            .orders
            .remove(&order_id)
            .ok_or_else(|| MarketError::not_found("order", order_id))?;
        self.changes.publish(OrderChange::of(ChangeKind::Delete, &order));
        Ok(())
    }

    /// Changes stock outside of any order flow, like a producer editing the product.
    pub fn set_stock(&self, product_id: ModelId, stock: i32) {
        if let Some(product) = self.lock().products.get_mut(&product_id) {
            product.stock = stock;
        }
    }

    // --- inspection --------------------------------------------------------

    pub fn product_stock(&self, product_id: ModelId) -> Option<i32> {
        self.lock().products.get(&product_id).map(|p| p.stock)
    }

    pub fn conversation_between(
        &self,
        consumer_id: UserId,
        producer_id: UserId,
    ) -> Option<Conversation> {
        self.lock()
            .conversations
            .iter()
            .find(|c| c.consumer_id == consumer_id && c.producer_id == producer_id)
            .cloned()
    }

    pub fn messages_between(&self, consumer_id: UserId, producer_id: UserId) -> Vec<Message> {
        let state = self.lock();
        let Some(conversation) = state
            .conversations
            .iter()
            .find(|c| c.consumer_id == consumer_id && c.producer_id == producer_id)
        else {
            return vec![];
        };
        state
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation.id)
            .cloned()
            .collect()
    }

    pub fn pending_outbox(&self) -> Vec<OutboxEvent> {
        self.lock()
            .outbox
            .values()
            .filter(|r| !r.delivered && !r.parked)
            .map(|r| r.event.clone())
            .collect()
    }

    pub fn parked_outbox(&self) -> Vec<OutboxEvent> {
        self.lock()
            .outbox
            .values()
            .filter(|r| r.parked)
            .map(|r| r.event.clone())
            .collect()
    }

    /// Makes every pending outbox event due now.
    pub fn expire_outbox_leases(&self) {
        for record in self.lock().outbox.values_mut() {
            record.event.next_attempt_at = None;
        }
    }

    // --- failure injection -------------------------------------------------

    pub fn set_fail_replacement_writes(&self, fail: bool) {
        self.fail_replacement_writes.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_messages(&self, fail: bool) {
        self.fail_messages.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderStorage for MemoryStorage {
    async fn get_order(&self, order_id: ModelId) -> Result<Order, MarketError> {
        self.lock().order(order_id).cloned()
    }

    async fn get_order_item(&self, item_id: ModelId) -> Result<OrderItem, MarketError> {
        self.lock()
            .orders
            .values()
            .find_map(|order| order.item(item_id).cloned())
            .ok_or_else(|| MarketError::not_found("order item", item_id))
    }

    async fn get_product(&self, product_id: ModelId) -> Result<Product, MarketError> {
        self.lock()
            .products
            .get(&product_id)
            .cloned()
            .ok_or_else(|| MarketError::not_found("product", product_id))
    }

    async fn update_status(
        &self,
        order_id: ModelId,
        expected: OrderStatus,
        target: OrderStatus,
    ) -> Result<Order, MarketError> {
        let order = {
            let mut state = self.lock();
            let order = state
                .orders
                .get_mut(&order_id)
                .ok_or_else(|| MarketError::not_found("order", order_id))?;
            if order.status != expected {
                return Err(MarketError::StaleStatus { order_id });
            }
            order.status = target;
            order.updated_at = Utc::now();
            order.clone()
        };
        self.changes.publish(OrderChange::of(ChangeKind::Update, &order));
        Ok(order)
    }

    async fn cancel_order(
        &self,
        order_id: ModelId,
        expected: OrderStatus,
    ) -> Result<Vec<StockRestore>, MarketError> {
        let (order, restored) = {
            let mut state = self.lock();
            let order = state.order(order_id)?.clone();
            if order.status != expected {
                return Err(MarketError::StaleStatus { order_id });
            }
            // Validate every product first so a missing one leaves nothing half-applied
            for item in &order.items {
                if !state.products.contains_key(&item.product_id) {
                    return Err(MarketError::not_found("product", item.product_id));
                }
            }

            let mut restored = Vec::with_capacity(order.items.len());
            for item in &order.items {
                if let Some(product) = state.products.get_mut(&item.product_id) {
                    product.stock += item.quantity;
                    restored.push(StockRestore {
                        product_id: product.id,
                        quantity: item.quantity,
                        stock: product.stock,
                    });
                }
            }

            let stored = state
                .orders
                .get_mut(&order_id)
                .ok_or_else(|| MarketError::not_found("order", order_id))?;
            stored.status = OrderStatus::Cancelled;
            stored.updated_at = Utc::now();
            (stored.clone(), restored)
        };
        self.changes.publish(OrderChange::of(ChangeKind::Update, &order));
        Ok(restored)
    }

    async fn file_replacement_request(
        &self,
        item_id: ModelId,
        request: &ReplacementRequest,
        notification: OutboxPayload,
    ) -> Result<OrderItem, MarketError> {
        if self.fail_replacement_writes.load(Ordering::SeqCst) {
            return Err(MarketError::Database("replacement write rejected".to_string()));
        }
        let (order, item) = {
            let mut state = self.lock();
            let order = state.order_of_item(item_id)?;
            let item = order
                .items
                .iter_mut()
                .find(|item| item.id == item_id)
                .ok_or_else(|| MarketError::not_found("order item", item_id))?;
            if item.replacement.is_some() {
                return Err(MarketError::Conflict(format!(
                    "Order item {} already has an open replacement request",
                    item_id
                )));
            }
            item.replacement = Some(request.clone());
            let item = item.clone();
            order.updated_at = Utc::now();
            let order = order.clone();
            state.enqueue(notification);
            (order, item)
        };
        self.changes.publish(OrderChange::of(ChangeKind::Update, &order));
        Ok(item)
    }

    async fn clear_replacement_request(
        &self,
        item_id: ModelId,
        expected: &ReplacementRequest,
        follow_ups: Vec<OutboxPayload>,
    ) -> Result<OrderItem, MarketError> {
        if self.fail_replacement_writes.load(Ordering::SeqCst) {
            return Err(MarketError::Database("replacement write rejected".to_string()));
        }
        let (order, item) = {
            let mut state = self.lock();
            let order = state.order_of_item(item_id)?;
            let item = order
                .items
                .iter_mut()
                .find(|item| item.id == item_id)
                .ok_or_else(|| MarketError::not_found("order item", item_id))?;
            if item.replacement.as_ref() != Some(expected) {
                return Err(MarketError::Conflict(format!(
                    "Replacement request of order item {} changed concurrently",
                    item_id
                )));
            }
            item.replacement = None;
            let item = item.clone();
            order.updated_at = Utc::now();
            let order = order.clone();
            for payload in follow_ups {
                state.enqueue(payload);
            }
            (order, item)
        };
        self.changes.publish(OrderChange::of(ChangeKind::Update, &order));
        Ok(item)
    }

    async fn load_order_view(&self, order_id: ModelId) -> Result<Option<OrderView>, MarketError> {
        let state = self.lock();
        Ok(state.orders.get(&order_id).map(|order| state.view(order)))
    }

    async fn list_order_views(&self, scope: OrderScope) -> Result<Vec<OrderView>, MarketError> {
        let state = self.lock();
        let mut views: Vec<OrderView> = state
            .orders
            .values()
            .filter(|order| scope.includes(order))
            .map(|order| state.view(order))
            .collect();
        views.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(b.id.cmp(&a.id)));
        Ok(views)
    }
}

#[async_trait]
impl ConversationStorage for MemoryStorage {
    async fn find_or_create_conversation(
        &self,
        consumer_id: UserId,
        producer_id: UserId,
    ) -> Result<Conversation, MarketError> {
        let mut state = self.lock();
        if let Some(existing) = state
            .conversations
            .iter()
            .find(|c| c.consumer_id == consumer_id && c.producer_id == producer_id)
        {
            return Ok(existing.clone());
        }
        let conversation = Conversation {
            id: state.next_id(),
            consumer_id,
            producer_id,
            created_at: Utc::now(),
        };
        state.conversations.push(conversation.clone());
        Ok(conversation)
    }

    async fn append_message(
        &self,
        conversation_id: ModelId,
        sender_id: UserId,
        body: &str,
    ) -> Result<Message, MarketError> {
        if self.fail_messages.load(Ordering::SeqCst) {
            return Err(MarketError::Database("message insert rejected".to_string()));
        }
        let mut state = self.lock();
        if !state.conversations.iter().any(|c| c.id == conversation_id) {
            return Err(MarketError::not_found("conversation", conversation_id));
        }
        let message = Message {
            id: state.next_id(),
            conversation_id,
            sender_id,
            body: body.to_string(),
            created_at: Utc::now(),
        };
        state.messages.push(message.clone());
        Ok(message)
    }

    async fn list_messages(&self, conversation_id: ModelId) -> Result<Vec<Message>, MarketError> {
        Ok(self
            .lock()
            .messages
            .iter()
            .filter(|m| m.conversation_id == conversation_id)
            .cloned()
            .collect())
    }
}

#[async_trait]
impl OutboxStorage for MemoryStorage {
    async fn fetch_due(&self, limit: u32) -> Result<Vec<OutboxEvent>, MarketError> {
        let now = Utc::now();
        let lease = now + chrono::Duration::seconds(CLAIM_LEASE_SECS);
        let mut state = self.lock();
        let claimed = state
            .outbox
            .values_mut()
            .filter(|r| !r.delivered && !r.parked)
            .filter(|r| r.event.next_attempt_at.is_none_or(|at| at <= now))
            .take(limit as usize)
            .map(|r| {
                let due = r.event.clone();
                r.event.next_attempt_at = Some(lease);
                due
            })
            .collect();
        Ok(claimed)
    }

    async fn mark_delivered(&self, event_id: ModelId) -> Result<(), MarketError> {
        let mut state = self.lock();
        let record = state
            .outbox
            .get_mut(&event_id)
            .ok_or_else(|| MarketError::not_found("outbox event", event_id))?;
        record.delivered = true;
        Ok(())
    }

    async fn mark_failed(
        &self,
        event_id: ModelId,
        error: &str,
        retry_at: Option<DateTime<Utc>>,
    ) -> Result<(), MarketError> {
        let mut state = self.lock();
        let record = state
            .outbox
            .get_mut(&event_id)
            .ok_or_else(|| MarketError::not_found("outbox event", event_id))?;
        record.event.attempts += 1;
        record.event.last_error = Some(error.to_string());
        record.event.next_attempt_at = retry_at;
        record.parked = retry_at.is_none();
        Ok(())
    }
}

#[async_trait]
impl ReviewStorage for MemoryStorage {
    async fn has_completed_purchase(
        &self,
        user_id: UserId,
        product_id: ModelId,
    ) -> Result<bool, MarketError> {
        Ok(self.lock().orders.values().any(|order| {
            order.user_id == user_id
                && order.status == OrderStatus::Completed
                && order.items.iter().any(|item| item.product_id == product_id)
        }))
    }

    async fn find_review(
        &self,
        user_id: UserId,
        product_id: ModelId,
    ) -> Result<Option<Review>, MarketError> {
        Ok(self
            .lock()
            .reviews
            .values()
            .find(|r| r.user_id == user_id && r.product_id == product_id)
            .cloned())
    }

    async fn get_review(&self, review_id: ModelId) -> Result<Review, MarketError> {
        self.lock()
            .reviews
            .get(&review_id)
            .cloned()
            .ok_or_else(|| MarketError::not_found("review", review_id))
    }

    async fn insert_review(&self, review: NewReview) -> Result<Review, MarketError> {
        let mut state = self.lock();
        if state
            .reviews
            .values()
            .any(|r| r.user_id == review.user_id && r.product_id == review.product_id)
        {
            return Err(MarketError::Conflict(format!(
                "Product {} was already reviewed by this user",
                review.product_id
            )));
        }
        let stored = Review {
            id: state.next_id(),
            user_id: review.user_id,
            product_id: review.product_id,
            rating: review.rating,
            comment: review.comment,
            image_url: review.image_url,
            created_at: Utc::now(),
        };
        state.reviews.insert(stored.id, stored.clone());
        Ok(stored)
    }

    async fn product_ratings(&self, product_id: ModelId) -> Result<Vec<i16>, MarketError> {
        Ok(self
            .lock()
            .reviews
            .values()
            .filter(|r| r.product_id == product_id)
            .map(|r| r.rating)
            .collect())
    }

    async fn toggle_helpful(
        &self,
        user_id: UserId,
        review_id: ModelId,
    ) -> Result<(bool, i64), MarketError> {
        let mut state = self.lock();
        if !state.reviews.contains_key(&review_id) {
            return Err(MarketError::not_found("review", review_id));
        }
        let key = (user_id, review_id);
        let voted = if state.helpful.remove(&key) {
            false
        } else {
            state.helpful.insert(key);
            true
        };
        let count = state.helpful.iter().filter(|(_, r)| *r == review_id).count() as i64;
        Ok((voted, count))
    }

    async fn insert_report(
        &self,
        user_id: UserId,
        review_id: ModelId,
        _reason: &str,
    ) -> Result<(), MarketError> {
        let mut state = self.lock();
        if !state.reviews.contains_key(&review_id) {
            return Err(MarketError::not_found("review", review_id));
        }
        if !state.reports.insert((user_id, review_id)) {
            return Err(MarketError::Conflict(format!("Review {} was already reported", review_id)));
        }
        Ok(())
    }
}

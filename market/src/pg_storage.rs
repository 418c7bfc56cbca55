use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, Database, DatabaseConnection, EntityTrait,
    JoinType, NotSet, PaginatorTrait, QueryFilter, QueryOrder, QuerySelect, RelationTrait, Set,
    TransactionTrait,
    sea_query::{Expr, OnConflict},
};
use std::collections::{HashMap, HashSet};
use std::error::Error;
use tracing::{debug, info};

use fulfillment::{
    error::MarketError,
    model::*,
    storage::{ConversationStorage, OrderStorage, ReviewStorage},
};

use crate::entities::{
    conversation, helpful_review, message, order, order_item, outbox_event, product, profile,
    reported_review, review,
};

/// Orders, conversations and reviews stored in Postgres through SeaORM.
///
/// Change notifications are raised by the `orders_notify_change` trigger, so
/// nothing here publishes to the change hub directly.
pub struct PgMarketStorage {
    pub db: DatabaseConnection,
}

impl PgMarketStorage {
    pub async fn new(database_url: &str) -> Result<Self, Box<dyn Error + Send + Sync>> {
        let db = Database::connect(database_url).await?;
        info!("Connected market storage");
        Ok(Self { db })
    }

    pub fn from_connection(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

fn item_from(model: order_item::Model) -> OrderItem {
    let replacement = match (
        model.replacement_reason,
        model.replacement_image_url,
        model.replacement_requested_at,
    ) {
        (Some(reason), Some(image_url), Some(requested_at)) => Some(ReplacementRequest {
            reason,
            image_url,
            requested_at,
        }),
        _ => None,
    };
    OrderItem {
        id: model.id,
        order_id: model.order_id,
        product_id: model.product_id,
        product_name: model.product_name,
        price: model.price,
        quantity: model.quantity,
        replacement,
    }
}

fn order_from(model: order::Model, items: Vec<OrderItem>) -> Result<Order, MarketError> {
    Ok(Order {
        id: model.id,
        user_id: model.user_id,
        seller_id: model.seller_id,
        status: OrderStatus::from_code(model.status_id)?,
        delivery_method: model.delivery_method,
        payment_method: model.payment_method,
        delivery_fee: model.delivery_fee,
        created_at: model.created_at,
        updated_at: model.updated_at,
        items,
    })
}

fn product_from(model: product::Model) -> Product {
    Product {
        id: model.id,
        seller_id: model.seller_id,
        name: model.name,
        category: model.category,
        stock: model.stock,
    }
}

fn review_from(model: review::Model) -> Review {
    Review {
        id: model.id,
        user_id: model.user_id,
        product_id: model.product_id,
        rating: model.rating,
        comment: model.comment,
        image_url: model.image_url,
        created_at: model.created_at,
    }
}

fn outbox_row(payload: &OutboxPayload) -> Result<outbox_event::ActiveModel, MarketError> {
    Ok(outbox_event::ActiveModel {
        id: NotSet,
        payload: Set(serde_json::to_value(payload)?),
        attempts: Set(0),
        next_attempt_at: Set(None),
        last_error: Set(None),
        delivered_at: Set(None),
        parked_at: Set(None),
        created_at: Set(Utc::now()),
    })
}

async fn enqueue<C: ConnectionTrait>(
    conn: &C,
    payloads: &[OutboxPayload],
) -> Result<(), MarketError> {
    for payload in payloads {
        outbox_row(payload)?.insert(conn).await?;
    }
    Ok(())
}

async fn touch_order<C: ConnectionTrait>(conn: &C, order_id: ModelId) -> Result<(), MarketError> {
    order::Entity::update_many()
        .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(order::Column::Id.eq(order_id))
        .exec(conn)
        .await?;
    Ok(())
}

async fn find_item<C: ConnectionTrait>(
    conn: &C,
    item_id: ModelId,
) -> Result<order_item::Model, MarketError> {
    order_item::Entity::find_by_id(item_id)
        .one(conn)
        .await?
        .ok_or_else(|| MarketError::not_found("order item", item_id))
}

impl PgMarketStorage {
    async fn load_orders(&self, orders: Vec<order::Model>) -> Result<Vec<Order>, MarketError> {
        let ids: Vec<ModelId> = orders.iter().map(|o| o.id).collect();
        let mut items_by_order: HashMap<ModelId, Vec<OrderItem>> = HashMap::new();
        if !ids.is_empty() {
            let items = order_item::Entity::find()
                .filter(order_item::Column::OrderId.is_in(ids))
                .order_by_asc(order_item::Column::Id)
                .all(&self.db)
                .await?;
            for item in items {
                items_by_order.entry(item.order_id).or_default().push(item_from(item));
            }
        }

        orders
            .into_iter()
            .map(|model| {
                let items = items_by_order.remove(&model.id).unwrap_or_default();
                order_from(model, items)
            })
            .collect()
    }

    async fn build_views(&self, orders: Vec<Order>) -> Result<Vec<OrderView>, MarketError> {
        let product_ids: HashSet<ModelId> = orders
            .iter()
            .flat_map(|o| o.items.iter().map(|i| i.product_id))
            .collect();
        let products: HashMap<ModelId, Product> = if product_ids.is_empty() {
            HashMap::new()
        } else {
            product::Entity::find()
                .filter(product::Column::Id.is_in(product_ids))
                .all(&self.db)
                .await?
                .into_iter()
                .map(|p| (p.id, product_from(p)))
                .collect()
        };

        let profile_ids: HashSet<UserId> = orders
            .iter()
            .map(|o| o.user_id)
            .chain(products.values().map(|p| p.seller_id))
            .collect();
        let profiles: HashMap<UserId, Profile> = if profile_ids.is_empty() {
            HashMap::new()
        } else {
            profile::Entity::find()
                .filter(profile::Column::Id.is_in(profile_ids))
                .all(&self.db)
                .await?
                .into_iter()
                .map(|p| {
                    (
                        p.id,
                        Profile {
                            id: p.id,
                            full_name: p.full_name,
                        },
                    )
                })
                .collect()
        };

        Ok(orders
            .iter()
            .map(|order| OrderView::build(order, &products, &profiles))
            .collect())
    }
}

#[async_trait]
impl OrderStorage for PgMarketStorage {
    async fn get_order(&self, order_id: ModelId) -> Result<Order, MarketError> {
        let model = order::Entity::find_by_id(order_id)
            .one(&self.db)
            .await?
            .ok_or_else(|| MarketError::not_found("order", order_id))?;
        let mut orders = self.load_orders(vec![model]).await?;
        orders.pop().ok_or_else(|| MarketError::not_found("order", order_id))
    }

    async fn get_order_item(&self, item_id: ModelId) -> Result<OrderItem, MarketError> {
        Ok(item_from(find_item(&self.db, item_id).await?))
    }

    async fn get_product(&self, product_id: ModelId) -> Result<Product, MarketError> {
        product::Entity::find_by_id(product_id)
            .one(&self.db)
            .await?
            .map(product_from)
            .ok_or_else(|| MarketError::not_found("product", product_id))
    }

    async fn update_status(
        &self,
        order_id: ModelId,
        expected: OrderStatus,
        target: OrderStatus,
    ) -> Result<Order, MarketError> {
        let result = order::Entity::update_many()
            .col_expr(order::Column::StatusId, Expr::value(target.code()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .filter(order::Column::StatusId.eq(expected.code()))
            .exec(&self.db)
            .await?;

        if result.rows_affected == 0 {
            // Either gone or moved by someone else
            let exists = order::Entity::find_by_id(order_id).one(&self.db).await?.is_some();
            return Err(if exists {
                MarketError::StaleStatus { order_id }
            } else {
                MarketError::not_found("order", order_id)
            });
        }

        debug!(order_id, from = %expected, to = %target, "Updated order status");
        self.get_order(order_id).await
    }

    async fn cancel_order(
        &self,
        order_id: ModelId,
        expected: OrderStatus,
    ) -> Result<Vec<StockRestore>, MarketError> {
        let txn = self.db.begin().await?;

        let order = order::Entity::find_by_id(order_id)
            .lock_exclusive()
            .one(&txn)
            .await?
            .ok_or_else(|| MarketError::not_found("order", order_id))?;
        if order.status_id != expected.code() {
            return Err(MarketError::StaleStatus { order_id });
        }

        // Lock products in id order so concurrent cancels cannot deadlock
        let mut items = order_item::Entity::find()
            .filter(order_item::Column::OrderId.eq(order_id))
            .all(&txn)
            .await?;
        items.sort_by_key(|item| (item.product_id, item.id));

        let mut restored = Vec::with_capacity(items.len());
        for item in &items {
            let result = product::Entity::update_many()
                .col_expr(
                    product::Column::Stock,
                    Expr::col(product::Column::Stock).add(item.quantity),
                )
                .filter(product::Column::Id.eq(item.product_id))
                .exec(&txn)
                .await?;
            if result.rows_affected == 0 {
                // Dropping the transaction rolls back what was restored so far
                return Err(MarketError::not_found("product", item.product_id));
            }
            let stock = product::Entity::find_by_id(item.product_id)
                .one(&txn)
                .await?
                .map(|p| p.stock)
                .ok_or_else(|| MarketError::not_found("product", item.product_id))?;
            restored.push(StockRestore {
                product_id: item.product_id,
                quantity: item.quantity,
                stock,
            });
        }

        order::Entity::update_many()
            .col_expr(order::Column::StatusId, Expr::value(OrderStatus::Cancelled.code()))
            .col_expr(order::Column::UpdatedAt, Expr::value(Utc::now()))
            .filter(order::Column::Id.eq(order_id))
            .exec(&txn)
            .await?;

        txn.commit().await?;
        Ok(restored)
    }

    async fn file_replacement_request(
        &self,
        item_id: ModelId,
        request: &ReplacementRequest,
        notification: OutboxPayload,
    ) -> Result<OrderItem, MarketError> {
        let txn = self.db.begin().await?;
        let item = find_item(&txn, item_id).await?;

        let result = order_item::Entity::update_many()
            .col_expr(order_item::Column::ReplacementReason, Expr::value(request.reason.clone()))
            .col_expr(
                order_item::Column::ReplacementImageUrl,
                Expr::value(request.image_url.clone()),
            )
            .col_expr(order_item::Column::ReplacementRequestedAt, Expr::value(request.requested_at))
            .filter(order_item::Column::Id.eq(item_id))
            .filter(order_item::Column::ReplacementReason.is_null())
            .filter(order_item::Column::ReplacementImageUrl.is_null())
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(MarketError::Conflict(format!(
                "Order item {} already has an open replacement request",
                item_id
            )));
        }

        touch_order(&txn, item.order_id).await?;
        enqueue(&txn, &[notification]).await?;
        let updated = find_item(&txn, item_id).await?;
        txn.commit().await?;
        Ok(item_from(updated))
    }

    async fn clear_replacement_request(
        &self,
        item_id: ModelId,
        expected: &ReplacementRequest,
        follow_ups: Vec<OutboxPayload>,
    ) -> Result<OrderItem, MarketError> {
        let txn = self.db.begin().await?;
        let item = find_item(&txn, item_id).await?;

        let result = order_item::Entity::update_many()
            .col_expr(order_item::Column::ReplacementReason, Expr::value(Option::<String>::None))
            .col_expr(order_item::Column::ReplacementImageUrl, Expr::value(Option::<String>::None))
            .col_expr(
                order_item::Column::ReplacementRequestedAt,
                Expr::value(Option::<chrono::DateTime<Utc>>::None),
            )
            .filter(order_item::Column::Id.eq(item_id))
            .filter(order_item::Column::ReplacementReason.eq(expected.reason.clone()))
            .filter(order_item::Column::ReplacementImageUrl.eq(expected.image_url.clone()))
            .exec(&txn)
            .await?;
        if result.rows_affected == 0 {
            return Err(MarketError::Conflict(format!(
                "Replacement request of order item {} changed concurrently",
                item_id
            )));
        }

        touch_order(&txn, item.order_id).await?;
        enqueue(&txn, &follow_ups).await?;
        let updated = find_item(&txn, item_id).await?;
        txn.commit().await?;
        Ok(item_from(updated))
    }

    async fn load_order_view(&self, order_id: ModelId) -> Result<Option<OrderView>, MarketError> {
        let Some(model) = order::Entity::find_by_id(order_id).one(&self.db).await? else {
            return Ok(None);
        };
        let orders = self.load_orders(vec![model]).await?;
        Ok(self.build_views(orders).await?.pop())
    }

    async fn list_order_views(&self, scope: OrderScope) -> Result<Vec<OrderView>, MarketError> {
        let query = match scope {
            OrderScope::Consumer(user) => {
                order::Entity::find().filter(order::Column::UserId.eq(user))
            }
            OrderScope::Seller(user) => {
                order::Entity::find().filter(order::Column::SellerId.eq(user))
            }
        };
        let models = query
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .all(&self.db)
            .await?;
        let orders = self.load_orders(models).await?;
        self.build_views(orders).await
    }
}

#[async_trait]
impl ConversationStorage for PgMarketStorage {
    async fn find_or_create_conversation(
        &self,
        consumer_id: UserId,
        producer_id: UserId,
    ) -> Result<Conversation, MarketError> {
        let row = conversation::ActiveModel {
            id: NotSet,
            consumer_id: Set(consumer_id),
            producer_id: Set(producer_id),
            created_at: Set(Utc::now()),
        };
        conversation::Entity::insert(row)
            .on_conflict(
                OnConflict::columns([
                    conversation::Column::ConsumerId,
                    conversation::Column::ProducerId,
                ])
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(&self.db)
            .await?;

        let model = conversation::Entity::find()
            .filter(conversation::Column::ConsumerId.eq(consumer_id))
            .filter(conversation::Column::ProducerId.eq(producer_id))
            .one(&self.db)
            .await?
            .ok_or_else(|| {
                MarketError::not_found("conversation", format!("{}/{}", consumer_id, producer_id))
            })?;

        Ok(Conversation {
            id: model.id,
            consumer_id: model.consumer_id,
            producer_id: model.producer_id,
            created_at: model.created_at,
        })
    }

    async fn append_message(
        &self,
        conversation_id: ModelId,
        sender_id: UserId,
        body: &str,
    ) -> Result<Message, MarketError> {
        let model = message::ActiveModel {
            id: NotSet,
            conversation_id: Set(conversation_id),
            sender_id: Set(sender_id),
            body: Set(body.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;

        Ok(Message {
            id: model.id,
            conversation_id: model.conversation_id,
            sender_id: model.sender_id,
            body: model.body,
            created_at: model.created_at,
        })
    }

    async fn list_messages(&self, conversation_id: ModelId) -> Result<Vec<Message>, MarketError> {
        Ok(message::Entity::find()
            .filter(message::Column::ConversationId.eq(conversation_id))
            .order_by_asc(message::Column::CreatedAt)
            .order_by_asc(message::Column::Id)
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| Message {
                id: m.id,
                conversation_id: m.conversation_id,
                sender_id: m.sender_id,
                body: m.body,
                created_at: m.created_at,
            })
            .collect())
    }
}

#[async_trait]
impl ReviewStorage for PgMarketStorage {
    async fn has_completed_purchase(
        &self,
        user_id: UserId,
        product_id: ModelId,
    ) -> Result<bool, MarketError> {
        let count = order_item::Entity::find()
            .join(JoinType::InnerJoin, order_item::Relation::Order.def())
            .filter(order::Column::UserId.eq(user_id))
            .filter(order::Column::StatusId.eq(OrderStatus::Completed.code()))
            .filter(order_item::Column::ProductId.eq(product_id))
            .count(&self.db)
            .await?;
        Ok(count > 0)
    }

    async fn find_review(
        &self,
        user_id: UserId,
        product_id: ModelId,
    ) -> Result<Option<Review>, MarketError> {
        Ok(review::Entity::find()
            .filter(review::Column::UserId.eq(user_id))
            .filter(review::Column::ProductId.eq(product_id))
            .one(&self.db)
            .await?
            .map(review_from))
    }

    async fn get_review(&self, review_id: ModelId) -> Result<Review, MarketError> {
        review::Entity::find_by_id(review_id)
            .one(&self.db)
            .await?
            .map(review_from)
            .ok_or_else(|| MarketError::not_found("review", review_id))
    }

    async fn insert_review(&self, new: NewReview) -> Result<Review, MarketError> {
        let model = review::ActiveModel {
            id: NotSet,
            user_id: Set(new.user_id),
            product_id: Set(new.product_id),
            rating: Set(new.rating),
            comment: Set(new.comment),
            image_url: Set(new.image_url),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;
        Ok(review_from(model))
    }

    async fn product_ratings(&self, product_id: ModelId) -> Result<Vec<i16>, MarketError> {
        Ok(review::Entity::find()
            .select_only()
            .column(review::Column::Rating)
            .filter(review::Column::ProductId.eq(product_id))
            .into_tuple::<i16>()
            .all(&self.db)
            .await?)
    }

    async fn toggle_helpful(
        &self,
        user_id: UserId,
        review_id: ModelId,
    ) -> Result<(bool, i64), MarketError> {
        let txn = self.db.begin().await?;
        if review::Entity::find_by_id(review_id).one(&txn).await?.is_none() {
            return Err(MarketError::not_found("review", review_id));
        }

        let removed = helpful_review::Entity::delete_many()
            .filter(helpful_review::Column::UserId.eq(user_id))
            .filter(helpful_review::Column::ReviewId.eq(review_id))
            .exec(&txn)
            .await?;
        let voted = removed.rows_affected == 0;
        if voted {
            helpful_review::ActiveModel {
                user_id: Set(user_id),
                review_id: Set(review_id),
                created_at: Set(Utc::now()),
            }
            .insert(&txn)
            .await?;
        }

        let count = helpful_review::Entity::find()
            .filter(helpful_review::Column::ReviewId.eq(review_id))
            .count(&txn)
            .await?;
        txn.commit().await?;
        Ok((voted, count as i64))
    }

    async fn insert_report(
        &self,
        user_id: UserId,
        review_id: ModelId,
        reason: &str,
    ) -> Result<(), MarketError> {
        reported_review::ActiveModel {
            id: NotSet,
            user_id: Set(user_id),
            review_id: Set(review_id),
            reason: Set(reason.to_string()),
            created_at: Set(Utc::now()),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }
}

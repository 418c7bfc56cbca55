use metrics::{counter, histogram};
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

use crate::error::MarketError;
use crate::model::{Actor, ModelId, Order, OrderStatus, StockRestore};
use crate::status;
use crate::storage::OrderStorage;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatusChangeOutcome {
    pub order: Order,
    /// `false` when the order already was in the requested status.
    pub changed: bool,
    pub restored: Vec<StockRestore>,
}

impl StatusChangeOutcome {
    fn unchanged(order: Order) -> Self {
        Self {
            order,
            changed: false,
            restored: vec![],
        }
    }
}

/// Order status controller shared by the consumer and producer surfaces.
#[derive(Clone)]
pub struct OrderService {
    storage: Arc<dyn OrderStorage>,
}

impl OrderService {
    pub fn new(storage: Arc<dyn OrderStorage>) -> Self {
        info!("Initializing new OrderService");
        Self { storage }
    }

    async fn load_owned(&self, actor: &Actor, order_id: ModelId) -> Result<Order, MarketError> {
        let order = self.storage.get_order(order_id).await?;
        if !actor.owns(&order) {
            return Err(MarketError::Forbidden(format!(
                "Order {} does not belong to this {}",
                order_id, actor.role
            )));
        }
        Ok(order)
    }

    pub async fn next_actions(
        &self,
        actor: &Actor,
        order_id: ModelId,
    ) -> Result<Vec<OrderStatus>, MarketError> {
        let order = self.load_owned(actor, order_id).await?;
        Ok(status::next_actions(actor.role, order.status))
    }

    pub async fn cancel(
        &self,
        actor: &Actor,
        order_id: ModelId,
    ) -> Result<StatusChangeOutcome, MarketError> {
        self.change_status(actor, order_id, OrderStatus::Cancelled).await
    }

    /// Moves the order to the status named by `target_label`.
    pub async fn set_status(
        &self,
        actor: &Actor,
        order_id: ModelId,
        target_label: &str,
    ) -> Result<StatusChangeOutcome, MarketError> {
        let target: OrderStatus = target_label.parse()?;
        self.change_status(actor, order_id, target).await
    }

    pub async fn change_status(
        &self,
        actor: &Actor,
        order_id: ModelId,
        target: OrderStatus,
    ) -> Result<StatusChangeOutcome, MarketError> {
        let started = Instant::now();
        let order = self.load_owned(actor, order_id).await?;

        if order.status == target {
            debug!(order_id, status = %target, "Order already in requested status");
            return Ok(StatusChangeOutcome::unchanged(order));
        }
        status::ensure_transition(actor.role, order.status, target)?;

        let result = self.apply(&order, target).await;
        histogram!("market_status_change_seconds", "target" => target.label())
            .record(started.elapsed().as_secs_f64());

        match result {
            Ok(outcome) => Ok(outcome),
            Err(MarketError::StaleStatus { .. }) => {
                // Someone else moved the order; fine if they moved it where we wanted
                let current = self.storage.get_order(order_id).await?;
                if current.status == target {
                    debug!(order_id, status = %target, "Concurrent change reached the same status");
                    Ok(StatusChangeOutcome::unchanged(current))
                } else {
                    warn!(
                        order_id,
                        expected = %order.status,
                        actual = %current.status,
                        "Order status changed concurrently"
                    );
                    Err(MarketError::StaleStatus { order_id })
                }
            }
            Err(e) => Err(e),
        }
    }

    async fn apply(
        &self,
        order: &Order,
        target: OrderStatus,
    ) -> Result<StatusChangeOutcome, MarketError> {
        if target == OrderStatus::Cancelled {
            let restored = self.storage.cancel_order(order.id, order.status).await?;
            let units: i32 = restored.iter().map(|r| r.quantity).sum();
            counter!("market_orders_cancelled_total").increment(1);
            counter!("market_stock_restored_units_total").increment(units.max(0) as u64);
            info!(
                order_id = order.id,
                items = restored.len(),
                units,
                "Cancelled order and restored stock"
            );
            let order = self.storage.get_order(order.id).await?;
            return Ok(StatusChangeOutcome {
                order,
                changed: true,
                restored,
            });
        }

        let updated = self.storage.update_status(order.id, order.status, target).await?;
        info!(order_id = order.id, from = %order.status, to = %target, "Order status changed");
        Ok(StatusChangeOutcome {
            order: updated,
            changed: true,
            restored: vec![],
        })
    }
}

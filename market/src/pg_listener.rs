use sqlx::postgres::PgListener;
use tracing::{debug, info, warn};

use fulfillment::{changes::ChangeHub, error::MarketError, model::OrderChange};

/// Channel the `orders_notify_change` trigger notifies on.
pub const ORDER_CHANGES_CHANNEL: &str = "order_changes";

/// Forwards Postgres order change notifications into a [`ChangeHub`].
pub struct OrderChangeListener {
    listener: PgListener,
    hub: ChangeHub,
}

impl OrderChangeListener {
    pub async fn connect(database_url: &str, hub: ChangeHub) -> Result<Self, MarketError> {
        let mut listener = PgListener::connect(database_url).await?;
        listener.listen(ORDER_CHANGES_CHANNEL).await?;
        info!(channel = ORDER_CHANGES_CHANNEL, "Listening for order changes");
        Ok(Self { listener, hub })
    }

    pub fn parse(payload: &str) -> Result<OrderChange, MarketError> {
        Ok(serde_json::from_str(payload)?)
    }

    /// Runs until the connection fails for good.
    pub async fn run(mut self) -> Result<(), MarketError> {
        loop {
            // `None` means the connection dropped and was re-established
            let Some(notification) = self.listener.try_recv().await? else {
                warn!("Order change listener reconnected; notifications may have been missed");
                self.hub.request_resync();
                continue;
            };
            match Self::parse(notification.payload()) {
                Ok(change) => {
                    debug!(
                        order_id = change.order_id,
                        kind = %change.kind,
                        "Received order change"
                    );
                    self.hub.publish(change);
                }
                Err(e) => warn!(
                    error = %e,
                    payload = notification.payload(),
                    "Ignoring malformed order change"
                ),
            }
        }
    }
}

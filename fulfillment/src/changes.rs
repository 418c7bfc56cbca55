use tokio::sync::broadcast;
use tracing::{debug, warn};

use crate::model::{OrderChange, OrderScope};

const DEFAULT_CAPACITY: usize = 1024;

/// Fan-out of order row changes to realtime subscribers.
///
/// Storage implementations publish after their transaction commits; the
/// Postgres listener forwards `order_changes` notifications here.
#[derive(Debug, Clone, Copy)]
enum HubEvent {
    Change(OrderChange),
    /// Changes may have been lost upstream.
    Resync,
}

#[derive(Clone)]
pub struct ChangeHub {
    sender: broadcast::Sender<HubEvent>,
}

impl Default for ChangeHub {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl ChangeHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, change: OrderChange) {
        // No subscribers is not an error
        match self.sender.send(HubEvent::Change(change)) {
            Ok(receivers) => debug!(
                order_id = change.order_id,
                kind = %change.kind,
                receivers,
                "Published order change"
            ),
            Err(_) => debug!(order_id = change.order_id, "No subscribers for order change"),
        }
    }

    /// Tells every subscriber to reload, e.g. after the upstream
    /// notification connection was re-established.
    pub fn request_resync(&self) {
        if self.sender.send(HubEvent::Resync).is_err() {
            debug!("No subscribers to resync");
        }
    }

    pub fn subscribe(&self, scope: OrderScope) -> Subscription {
        Subscription {
            receiver: self.sender.subscribe(),
            scope,
        }
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionEvent {
    Change(OrderChange),
    /// Notifications were dropped (count, 0 if unknown); local state must
    /// be reloaded.
    Lagged(u64),
}

pub struct Subscription {
    receiver: broadcast::Receiver<HubEvent>,
    scope: OrderScope,
}

impl Subscription {
    pub fn scope(&self) -> OrderScope {
        self.scope
    }

    /// Next change within the scope, `None` once the hub is gone.
    pub async fn next(&mut self) -> Option<SubscriptionEvent> {
        loop {
            match self.receiver.recv().await {
                Ok(HubEvent::Change(change)) if self.scope.matches(&change) => {
                    return Some(SubscriptionEvent::Change(change));
                }
                Ok(HubEvent::Change(_)) => continue,
                Ok(HubEvent::Resync) => return Some(SubscriptionEvent::Lagged(0)),
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, scope = ?self.scope, "Order change subscriber lagged");
                    return Some(SubscriptionEvent::Lagged(skipped));
                }
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    }
}

use serde::Serialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::changes::{Subscription, SubscriptionEvent};
use crate::error::MarketError;
use crate::model::{ChangeKind, ModelId, OrderChange, OrderScope, OrderView};
use crate::storage::OrderStorage;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ProjectionUpdate {
    Upserted { order: OrderView },
    Removed { order_id: ModelId },
    /// The whole list was reloaded after missed notifications.
    Reloaded { orders: Vec<OrderView> },
    #[serde(skip)]
    Ignored,
}

/// Local list of order views, newest first.
#[derive(Debug, Clone, Default)]
pub struct OrderProjection {
    views: Vec<OrderView>,
}

impl OrderProjection {
    pub fn new(views: Vec<OrderView>) -> Self {
        Self { views }
    }

    pub fn views(&self) -> &[OrderView] {
        &self.views
    }

    pub fn get(&self, order_id: ModelId) -> Option<&OrderView> {
        self.views.iter().find(|v| v.id == order_id)
    }

    pub fn len(&self) -> usize {
        self.views.len()
    }

    pub fn is_empty(&self) -> bool {
        self.views.is_empty()
    }

    /// Splices a freshly fetched view in by id. Views older than the one
    /// held are dropped.
    pub fn upsert(&mut self, view: OrderView) -> ProjectionUpdate {
        match self.views.iter_mut().find(|v| v.id == view.id) {
            Some(existing) if existing.updated_at > view.updated_at || *existing == view => {
                debug!(order_id = view.id, "Dropping stale or duplicate order view");
                ProjectionUpdate::Ignored
            }
            Some(existing) => {
                *existing = view.clone();
                ProjectionUpdate::Upserted { order: view }
            }
            None => {
                self.views.insert(0, view.clone());
                ProjectionUpdate::Upserted { order: view }
            }
        }
    }

    pub fn remove(&mut self, order_id: ModelId) -> ProjectionUpdate {
        let before = self.views.len();
        self.views.retain(|v| v.id != order_id);
        if self.views.len() == before {
            ProjectionUpdate::Ignored
        } else {
            ProjectionUpdate::Removed { order_id }
        }
    }
}

/// Keeps an [`OrderProjection`] in step with order change notifications by
/// re-fetching the full view of every changed order.
pub struct ProjectionSync {
    storage: Arc<dyn OrderStorage>,
    scope: OrderScope,
    projection: OrderProjection,
}

impl ProjectionSync {
    pub async fn load(
        storage: Arc<dyn OrderStorage>,
        scope: OrderScope,
    ) -> Result<Self, MarketError> {
        let views = storage.list_order_views(scope).await?;
        debug!(scope = ?scope, orders = views.len(), "Loaded order projection");
        Ok(Self {
            storage,
            scope,
            projection: OrderProjection::new(views),
        })
    }

    pub fn projection(&self) -> &OrderProjection {
        &self.projection
    }

    pub async fn apply(&mut self, change: &OrderChange) -> Result<ProjectionUpdate, MarketError> {
        if !self.scope.matches(change) {
            return Ok(ProjectionUpdate::Ignored);
        }
        match change.kind {
            ChangeKind::Delete => Ok(self.projection.remove(change.order_id)),
            ChangeKind::Insert | ChangeKind::Update => {
                match self.storage.load_order_view(change.order_id).await? {
                    Some(view) => Ok(self.projection.upsert(view)),
                    // Deleted between the notification and the fetch
                    None => Ok(self.projection.remove(change.order_id)),
                }
            }
        }
    }

    pub async fn reload(&mut self) -> Result<ProjectionUpdate, MarketError> {
        let views = self.storage.list_order_views(self.scope).await?;
        self.projection = OrderProjection::new(views.clone());
        Ok(ProjectionUpdate::Reloaded { orders: views })
    }

    /// Next non-trivial update, `None` once the subscription ends.
    pub async fn next_update(
        &mut self,
        subscription: &mut Subscription,
    ) -> Option<ProjectionUpdate> {
        loop {
            let result = match subscription.next().await? {
                SubscriptionEvent::Change(change) => self.apply(&change).await,
                SubscriptionEvent::Lagged(_) => self.reload().await,
            };
            match result {
                Ok(ProjectionUpdate::Ignored) => continue,
                Ok(update) => return Some(update),
                Err(e) => {
                    warn!(error = %e, scope = ?self.scope, "Failed to refresh order projection");
                    continue;
                }
            }
        }
    }

    /// Forwards updates until the subscription ends or the receiver is dropped.
    pub async fn run(
        mut self,
        mut subscription: Subscription,
        updates: mpsc::Sender<ProjectionUpdate>,
    ) {
        while let Some(update) = self.next_update(&mut subscription).await {
            if updates.send(update).await.is_err() {
                break;
            }
        }
        info!(scope = ?self.scope, "Order projection sync stopped");
    }
}

//! Replacement requests filed by consumers against delivered order items.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, warn};

use crate::error::MarketError;
use crate::image::{ImageFile, ImagePipeline};
use crate::model::{Actor, ModelId, Order, OrderItem, OutboxPayload, ReplacementRequest, Role};
use crate::storage::OrderStorage;

/// Prefix of chat messages carrying a structured replacement request.
pub const REPLACEMENT_TAG: &str = ":::REPLACEMENT_REQUEST_V1:::";

/// Reason whose actual text lives in the free-text field.
pub const OTHERS_REASON: &str = "Others";

pub const EVIDENCE_BUCKET: &str = "replacement-requests";

#[derive(Debug, Clone, Default)]
pub struct SubmitReplacement {
    pub reason: String,
    pub other_text: Option<String>,
    pub image: Option<ImageFile>,
}

/// JSON body following [`REPLACEMENT_TAG`] in the notification message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReplacementNotice {
    pub order_id: ModelId,
    pub order_item_id: ModelId,
    pub product_id: ModelId,
    pub product_name: String,
    pub quantity: i32,
    pub reason: String,
    pub image_url: String,
    pub requested_at: DateTime<Utc>,
}

impl ReplacementNotice {
    pub fn to_message(&self) -> Result<String, MarketError> {
        Ok(format!("{}{}", REPLACEMENT_TAG, serde_json::to_string(self)?))
    }

    /// Parses a message body; `None` for ordinary chat messages.
    pub fn from_message(body: &str) -> Option<Self> {
        body.strip_prefix(REPLACEMENT_TAG)
            .and_then(|json| serde_json::from_str(json).ok())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", content = "item", rename_all = "snake_case")]
pub enum Resolution {
    Resolved(OrderItem),
    /// Nothing was open; no side effects happened.
    AlreadyResolved(OrderItem),
}

/// Effective reason and evidence of a submission, checked without any I/O.
pub fn validate_submission(
    submission: &SubmitReplacement,
) -> Result<(String, &ImageFile), MarketError> {
    let reason = submission.reason.trim();
    if reason.is_empty() {
        return Err(MarketError::Validation("A replacement reason is required".to_string()));
    }

    let reason = if reason == OTHERS_REASON {
        match submission.other_text.as_deref().map(str::trim) {
            Some(text) if !text.is_empty() => text.to_string(),
            _ => {
                return Err(MarketError::Validation(
                    "Please describe the problem when choosing Others".to_string(),
                ));
            }
        }
    } else {
        reason.to_string()
    };

    let image = submission.image.as_ref().ok_or_else(|| {
        MarketError::Validation("A photo of the received item is required".to_string())
    })?;

    Ok((reason, image))
}

pub fn resolution_notice(order: &Order, item: &OrderItem) -> String {
    format!(
        "Your replacement request for {} (order #{}) has been resolved by the seller.",
        item.product_name, order.id
    )
}

#[derive(Clone)]
pub struct ReplacementService {
    storage: Arc<dyn OrderStorage>,
    images: ImagePipeline,
}

impl ReplacementService {
    pub fn new(storage: Arc<dyn OrderStorage>, images: ImagePipeline) -> Self {
        info!("Initializing new ReplacementService");
        Self { storage, images }
    }

    async fn load(&self, item_id: ModelId) -> Result<(Order, OrderItem), MarketError> {
        let item = self.storage.get_order_item(item_id).await?;
        let order = self.storage.get_order(item.order_id).await?;
        Ok((order, item))
    }

    pub async fn submit(
        &self,
        actor: &Actor,
        item_id: ModelId,
        submission: SubmitReplacement,
    ) -> Result<OrderItem, MarketError> {
        let (reason, image) = validate_submission(&submission)?;
        self.images.validate(image)?;

        if actor.role != Role::Consumer {
            return Err(MarketError::Forbidden(
                "Only consumers can request replacements".to_string(),
            ));
        }
        let (order, item) = self.load(item_id).await?;
        if !actor.owns(&order) {
            return Err(MarketError::Forbidden(format!(
                "Order {} does not belong to this consumer",
                order.id
            )));
        }
        if item.replacement.is_some() {
            return Err(MarketError::Conflict(format!(
                "Order item {} already has an open replacement request",
                item_id
            )));
        }
        let product = self.storage.get_product(item.product_id).await?;

        let image_url = self.images.upload(EVIDENCE_BUCKET, image.clone()).await?;

        let request = ReplacementRequest {
            reason,
            image_url: image_url.clone(),
            requested_at: Utc::now(),
        };
        let notice = ReplacementNotice {
            order_id: order.id,
            order_item_id: item.id,
            product_id: item.product_id,
            product_name: item.product_name.clone(),
            quantity: item.quantity,
            reason: request.reason.clone(),
            image_url: image_url.clone(),
            requested_at: request.requested_at,
        };
        let notification = OutboxPayload::ChatMessage {
            consumer_id: order.user_id,
            producer_id: product.seller_id,
            sender_id: actor.user_id,
            body: notice.to_message()?,
        };

        match self
            .storage
            .file_replacement_request(item_id, &request, notification)
            .await
        {
            Ok(updated) => {
                info!(order_id = order.id, item_id, "Replacement request filed");
                Ok(updated)
            }
            Err(e) => {
                // The upload is orphaned now
                if let Err(cleanup) = self.images.delete_by_url(EVIDENCE_BUCKET, &image_url).await {
                    warn!(
                        error = %cleanup,
                        image_url = %image_url,
                        "Failed to remove orphaned evidence image"
                    );
                }
                Err(e)
            }
        }
    }

    pub async fn resolve(
        &self,
        actor: &Actor,
        item_id: ModelId,
    ) -> Result<Resolution, MarketError> {
        if actor.role != Role::Producer {
            return Err(MarketError::Forbidden(
                "Only producers can resolve replacements".to_string(),
            ));
        }
        let (order, item) = self.load(item_id).await?;
        if !actor.owns(&order) {
            return Err(MarketError::Forbidden(format!(
                "Order {} does not belong to this producer",
                order.id
            )));
        }

        let Some(open) = item.replacement.clone() else {
            info!(order_id = order.id, item_id, "Replacement request already resolved");
            return Ok(Resolution::AlreadyResolved(item));
        };

        let follow_ups = vec![
            OutboxPayload::ChatMessage {
                consumer_id: order.user_id,
                producer_id: order.seller_id,
                sender_id: actor.user_id,
                body: resolution_notice(&order, &item),
            },
            OutboxPayload::DeleteObject {
                bucket: EVIDENCE_BUCKET.to_string(),
                url: open.image_url.clone(),
            },
        ];

        match self
            .storage
            .clear_replacement_request(item_id, &open, follow_ups)
            .await
        {
            Ok(cleared) => {
                info!(order_id = order.id, item_id, "Replacement request resolved");
                Ok(Resolution::Resolved(cleared))
            }
            Err(MarketError::Conflict(message)) => {
                // Lost the race; fine if the other side cleared it
                let current = self.storage.get_order_item(item_id).await?;
                if current.replacement.is_none() {
                    info!(
                        order_id = order.id,
                        item_id, "Replacement request resolved concurrently"
                    );
                    Ok(Resolution::AlreadyResolved(current))
                } else {
                    warn!(
                        order_id = order.id,
                        item_id, "Replacement request changed while resolving"
                    );
                    Err(MarketError::Conflict(message))
                }
            }
            Err(e) => Err(e),
        }
    }
}

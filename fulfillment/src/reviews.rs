use serde::Serialize;
use std::sync::Arc;
use tracing::info;

use crate::error::MarketError;
use crate::model::{Actor, ModelId, NewReview, RatingSummary, Review, Role, UserId};
use crate::storage::{OrderStorage, ReviewStorage};

#[derive(Debug, Clone, Default)]
pub struct SubmitReview {
    pub rating: i16,
    pub comment: Option<String>,
    pub image_url: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct HelpfulVote {
    pub review_id: ModelId,
    pub voted: bool,
    pub count: i64,
}

#[derive(Clone)]
pub struct ReviewService {
    reviews: Arc<dyn ReviewStorage>,
    orders: Arc<dyn OrderStorage>,
}

impl ReviewService {
    pub fn new(reviews: Arc<dyn ReviewStorage>, orders: Arc<dyn OrderStorage>) -> Self {
        Self { reviews, orders }
    }

    pub async fn submit_review(
        &self,
        actor: &Actor,
        product_id: ModelId,
        submission: SubmitReview,
    ) -> Result<Review, MarketError> {
        if !(1..=5).contains(&submission.rating) {
            return Err(MarketError::Validation(format!(
                "Rating must be between 1 and 5, got {}",
                submission.rating
            )));
        }
        if actor.role != Role::Consumer {
            return Err(MarketError::Forbidden("Only consumers can review products".to_string()));
        }

        self.orders.get_product(product_id).await?;
        if !self.reviews.has_completed_purchase(actor.user_id, product_id).await? {
            return Err(MarketError::Forbidden(format!(
                "Product {} can only be reviewed after a completed order",
                product_id
            )));
        }
        // The unique constraint is the real guard; this gives the friendlier error
        if self.has_reviewed(actor.user_id, product_id).await? {
            return Err(MarketError::Conflict(format!(
                "Product {} was already reviewed",
                product_id
            )));
        }

        let comment = submission
            .comment
            .map(|c| c.trim().to_string())
            .filter(|c| !c.is_empty());
        let review = self
            .reviews
            .insert_review(NewReview {
                user_id: actor.user_id,
                product_id,
                rating: submission.rating,
                comment,
                image_url: submission.image_url,
            })
            .await?;

        info!(review_id = review.id, product_id, rating = review.rating, "Review submitted");
        Ok(review)
    }

    pub async fn has_reviewed(
        &self,
        user_id: UserId,
        product_id: ModelId,
    ) -> Result<bool, MarketError> {
        Ok(self.reviews.find_review(user_id, product_id).await?.is_some())
    }

    pub async fn product_rating(&self, product_id: ModelId) -> Result<RatingSummary, MarketError> {
        self.orders.get_product(product_id).await?;
        let ratings = self.reviews.product_ratings(product_id).await?;
        Ok(RatingSummary::from_ratings(product_id, &ratings))
    }

    pub async fn mark_helpful(
        &self,
        actor: &Actor,
        review_id: ModelId,
    ) -> Result<HelpfulVote, MarketError> {
        let review = self.reviews.get_review(review_id).await?;
        if review.user_id == actor.user_id {
            return Err(MarketError::Forbidden("You cannot vote on your own review".to_string()));
        }
        let (voted, count) = self.reviews.toggle_helpful(actor.user_id, review_id).await?;
        Ok(HelpfulVote { review_id, voted, count })
    }

    pub async fn report_review(
        &self,
        actor: &Actor,
        review_id: ModelId,
        reason: &str,
    ) -> Result<(), MarketError> {
        let reason = reason.trim();
        if reason.is_empty() {
            return Err(MarketError::Validation("A report reason is required".to_string()));
        }
        self.reviews.get_review(review_id).await?;
        self.reviews.insert_report(actor.user_id, review_id, reason).await?;
        info!(review_id, "Review reported");
        Ok(())
    }
}

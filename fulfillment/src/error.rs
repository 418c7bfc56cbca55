use thiserror::Error;

use crate::model::ModelId;
use crate::status::OrderStatus;

#[derive(Debug, Error)]
pub enum MarketError {
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: &'static str, id: String },

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Transition from {from} to {to} is not allowed")]
    InvalidTransition { from: OrderStatus, to: OrderStatus },

    /// The status changed between reading the order and writing it.
    #[error("Order {order_id} was modified concurrently")]
    StaleStatus { order_id: ModelId },

    #[error("Object storage error: {0}")]
    ObjectStore(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl MarketError {
    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        MarketError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, MarketError::NotFound { .. })
    }
}

impl From<sea_orm::DbErr> for MarketError {
    fn from(err: sea_orm::DbErr) -> Self {
        match err {
            sea_orm::DbErr::RecordNotFound(what) => MarketError::NotFound {
                entity: "record",
                id: what,
            },
            other => match other.sql_err() {
                Some(sea_orm::SqlErr::UniqueConstraintViolation(detail)) => {
                    MarketError::Conflict(detail)
                }
                _ => MarketError::Database(other.to_string()),
            },
        }
    }
}

impl From<sqlx::Error> for MarketError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::RowNotFound => MarketError::NotFound {
                entity: "row",
                id: String::new(),
            },
            other => MarketError::Database(other.to_string()),
        }
    }
}

impl From<url::ParseError> for MarketError {
    fn from(err: url::ParseError) -> Self {
        MarketError::Validation(format!("Invalid URL: {}", err))
    }
}

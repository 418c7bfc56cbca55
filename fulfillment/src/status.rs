//! Canonical order status table.
//!
//! Status codes are the integers stored in `orders.status_id`. Both the
//! consumer and the producer surfaces go through this module; nothing else
//! maps codes to labels.

use serde::{Deserialize, Serialize};
use std::str::FromStr;
use strum_macros::{Display, EnumIter};

use crate::error::MarketError;
use crate::model::Role;

#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    PartialOrd,
    Ord,
    Serialize,
    Deserialize,
    Display,
    EnumIter,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OrderStatus {
    Pending,
    Confirmed,
    Preparing,
    ReadyForPickup,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const fn code(self) -> i32 {
        match self {
            OrderStatus::Pending => 3,
            OrderStatus::Confirmed => 4,
            OrderStatus::Preparing => 5,
            OrderStatus::ReadyForPickup => 6,
            OrderStatus::Completed => 7,
            OrderStatus::Cancelled => 8,
        }
    }

    pub fn from_code(code: i32) -> Result<Self, MarketError> {
        match code {
            3 => Ok(OrderStatus::Pending),
            4 => Ok(OrderStatus::Confirmed),
            5 => Ok(OrderStatus::Preparing),
            6 => Ok(OrderStatus::ReadyForPickup),
            7 => Ok(OrderStatus::Completed),
            8 => Ok(OrderStatus::Cancelled),
            other => Err(MarketError::Validation(format!("Unknown order status code: {}", other))),
        }
    }

    pub fn label(self) -> String {
        self.to_string()
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }

    /// The step a producer moves the order forward to, if any.
    pub fn next_forward(self) -> Option<Self> {
        match self {
            OrderStatus::Pending => Some(OrderStatus::Confirmed),
            OrderStatus::Confirmed => Some(OrderStatus::Preparing),
            OrderStatus::Preparing => Some(OrderStatus::ReadyForPickup),
            OrderStatus::ReadyForPickup => Some(OrderStatus::Completed),
            OrderStatus::Completed | OrderStatus::Cancelled => None,
        }
    }
}

impl FromStr for OrderStatus {
    type Err = MarketError;

    /// Accepts `ready_for_pickup`, `ready-for-pickup` and `Ready for pickup`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .trim()
            .chars()
            .map(|c| match c {
                '-' | ' ' => '_',
                other => other.to_ascii_lowercase(),
            })
            .collect();

        match normalized.as_str() {
            "pending" => Ok(OrderStatus::Pending),
            "confirmed" => Ok(OrderStatus::Confirmed),
            "preparing" => Ok(OrderStatus::Preparing),
            "ready_for_pickup" => Ok(OrderStatus::ReadyForPickup),
            "completed" => Ok(OrderStatus::Completed),
            "cancelled" | "canceled" => Ok(OrderStatus::Cancelled),
            _ => Err(MarketError::Validation(format!("Unknown order status: {}", s))),
        }
    }
}

/// Targets `role` may move an order in `from` to.
pub fn next_actions(role: Role, from: OrderStatus) -> Vec<OrderStatus> {
    match role {
        Role::Consumer => match from {
            OrderStatus::Pending => vec![OrderStatus::Cancelled],
            _ => vec![],
        },
        Role::Producer => {
            let mut targets: Vec<OrderStatus> = from.next_forward().into_iter().collect();
            if !from.is_terminal() {
                targets.push(OrderStatus::Cancelled);
            }
            targets
        }
    }
}

pub fn is_allowed(role: Role, from: OrderStatus, to: OrderStatus) -> bool {
    next_actions(role, from).contains(&to)
}

pub fn ensure_transition(
    role: Role,
    from: OrderStatus,
    to: OrderStatus,
) -> Result<(), MarketError> {
    if is_allowed(role, from, to) {
        Ok(())
    } else {
        Err(MarketError::InvalidTransition { from, to })
    }
}

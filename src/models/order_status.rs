use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Lifecycle of a repair order.
#[derive(
    Clone,
    Copy,
    Debug,
    PartialEq,
    Eq,
    Hash,
    EnumIter,
    DeriveActiveEnum,
    Serialize,
    Deserialize,
    strum::Display,
    strum::EnumString,
)]
#[sea_orm(rs_type = "String", db_type = "String(StringLen::N(20))")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[strum(serialize_all = "SCREAMING_SNAKE_CASE", ascii_case_insensitive)]
pub enum OrderStatus {
    #[sea_orm(string_value = "PENDING")]
    Pending,
    #[sea_orm(string_value = "CONFIRMED")]
    Confirmed,
    #[sea_orm(string_value = "IN_PROGRESS")]
    InProgress,
    #[sea_orm(string_value = "WAITING_PARTS")]
    WaitingParts,
    #[sea_orm(string_value = "COMPLETED")]
    Completed,
    #[sea_orm(string_value = "PAID")]
    Paid,
    #[sea_orm(string_value = "CANCELLED")]
    Cancelled,
}

impl OrderStatus {
    /// Human-readable label used in history comments and notifications
    pub fn label(&self) -> &'static str {
        match self {
            OrderStatus::Pending => "Pending",
            OrderStatus::Confirmed => "Confirmed",
            OrderStatus::InProgress => "In progress",
            OrderStatus::WaitingParts => "Waiting for parts",
            OrderStatus::Completed => "Completed",
            OrderStatus::Paid => "Paid",
            OrderStatus::Cancelled => "Cancelled",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Paid | OrderStatus::Cancelled)
    }

    /// Whether an order may move from `self` to `to`.
    ///
    /// Re-applying the current status is allowed on open orders and leaves the
    /// order unchanged apart from a new history entry. Terminal orders accept
    /// nothing.
    pub fn can_transition_to(&self, to: OrderStatus) -> bool {
        use OrderStatus::*;

        if *self == to {
            return !self.is_terminal();
        }

        match (self, to) {
            (from, Cancelled) => !from.is_terminal(),

            (Pending, Confirmed) => true,
            (Confirmed, InProgress) => true,
            (InProgress, WaitingParts) => true,
            (WaitingParts, InProgress) => true,
            (InProgress, Completed) => true,
            (WaitingParts, Completed) => true,
            (Completed, Paid) => true,

            _ => false,
        }
    }
}

use crate::entities::order_history;
use crate::errors::ServiceError;
use crate::models::HistoryAction;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use tracing::debug;

/// One change to be appended to an order's audit trail
#[derive(Debug, Clone)]
pub struct HistoryRecord {
    pub order_id: i32,
    pub actor_id: i32,
    pub action: HistoryAction,
    pub old_value: Option<String>,
    pub new_value: Option<String>,
    pub comment: Option<String>,
}

impl HistoryRecord {
    pub fn new(order_id: i32, actor_id: i32, action: HistoryAction) -> Self {
        Self {
            order_id,
            actor_id,
            action,
            old_value: None,
            new_value: None,
            comment: None,
        }
    }

    pub fn old_value(mut self, value: impl Into<String>) -> Self {
        self.old_value = Some(value.into());
        self
    }

    pub fn new_value(mut self, value: impl Into<String>) -> Self {
        self.new_value = Some(value.into());
        self
    }

    pub fn comment(mut self, comment: impl Into<String>) -> Self {
        self.comment = Some(comment.into());
        self
    }
}

/// Appends an entry; runs on the caller's connection so it commits with the change it documents.
pub async fn record<C: ConnectionTrait>(
    conn: &C,
    entry: HistoryRecord,
    at: DateTime<Utc>,
) -> Result<order_history::Model, ServiceError> {
    let model = order_history::ActiveModel {
        order_id: Set(entry.order_id),
        user_id: Set(entry.actor_id),
        action: Set(entry.action),
        old_value: Set(entry.old_value),
        new_value: Set(entry.new_value),
        comment: Set(entry.comment),
        created_at: Set(at),
        ..Default::default()
    }
    .insert(conn)
    .await?;

    debug!(
        order_id = model.order_id,
        action = %model.action,
        history_id = model.id,
        "History entry recorded"
    );
    Ok(model)
}

/// Entries of an order, most recent first; ties fall back to insertion order.
pub async fn list<C: ConnectionTrait>(
    conn: &C,
    order_id: i32,
) -> Result<Vec<order_history::Model>, ServiceError> {
    let entries = order_history::Entity::find()
        .filter(order_history::Column::OrderId.eq(order_id))
        .order_by_desc(order_history::Column::CreatedAt)
        .order_by_desc(order_history::Column::Id)
        .all(conn)
        .await?;
    Ok(entries)
}

pub async fn count<C: ConnectionTrait>(conn: &C, order_id: i32) -> Result<u64, ServiceError> {
    let total = order_history::Entity::find()
        .filter(order_history::Column::OrderId.eq(order_id))
        .count(conn)
        .await?;
    Ok(total)
}

use crate::entities::{notification, user};
use crate::models::{NotificationType, UserRole};
use async_trait::async_trait;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, DbErr, EntityTrait, PaginatorTrait,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, instrument};

/// Content of one in-app notification
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NotificationMessage {
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub order_id: Option<i32>,
}

impl NotificationMessage {
    pub fn new(
        title: impl Into<String>,
        message: impl Into<String>,
        kind: NotificationType,
        order_id: Option<i32>,
    ) -> Self {
        Self {
            title: title.into(),
            message: message.into(),
            kind,
            order_id,
        }
    }
}

/// Notification delivery errors
#[derive(Debug, Error)]
pub enum NotificationError {
    #[error("Database error: {0}")]
    Database(#[from] DbErr),
    #[error("Notification not found: {0}")]
    NotFound(i32),
    #[error("Delivery failed: {0}")]
    Delivery(String),
}

/// Outbound side of the notification path.
///
/// Calls are best-effort; the event worker logs and drops any error.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NotificationGateway: Send + Sync {
    async fn notify(
        &self,
        user_id: i32,
        message: &NotificationMessage,
    ) -> Result<(), NotificationError>;

    async fn notify_many(
        &self,
        user_ids: &[i32],
        message: &NotificationMessage,
    ) -> Result<(), NotificationError>;

    /// Delivers to every active user holding one of `roles`
    async fn notify_roles(
        &self,
        roles: &[UserRole],
        message: &NotificationMessage,
    ) -> Result<(), NotificationError>;
}

/// Stores notifications in the `notifications` table and serves the inbox.
#[derive(Clone)]
pub struct DbNotificationGateway {
    db: Arc<DatabaseConnection>,
}

impl DbNotificationGateway {
    pub fn new(db: Arc<DatabaseConnection>) -> Self {
        Self { db }
    }

    fn row(user_id: i32, message: &NotificationMessage) -> notification::ActiveModel {
        notification::ActiveModel {
            user_id: Set(user_id),
            title: Set(message.title.clone()),
            message: Set(message.message.clone()),
            notification_type: Set(message.kind),
            order_id: Set(message.order_id),
            is_read: Set(false),
            created_at: Set(Utc::now()),
            ..Default::default()
        }
    }

    /// Notifications for a user, newest first
    #[instrument(skip(self))]
    pub async fn list_for_user(
        &self,
        user_id: i32,
        limit: u64,
    ) -> Result<Vec<notification::Model>, NotificationError> {
        let rows = notification::Entity::find()
            .filter(notification::Column::UserId.eq(user_id))
            .order_by_desc(notification::Column::CreatedAt)
            .order_by_desc(notification::Column::Id)
            .limit(limit)
            .all(&*self.db)
            .await?;
        Ok(rows)
    }

    pub async fn unread_count(&self, user_id: i32) -> Result<u64, NotificationError> {
        let count = notification::Entity::find()
            .filter(notification::Column::UserId.eq(user_id))
            .filter(notification::Column::IsRead.eq(false))
            .count(&*self.db)
            .await?;
        Ok(count)
    }

    /// Marks one of the user's notifications read
    #[instrument(skip(self))]
    pub async fn mark_read(
        &self,
        user_id: i32,
        notification_id: i32,
    ) -> Result<notification::Model, NotificationError> {
        let existing = notification::Entity::find_by_id(notification_id)
            .filter(notification::Column::UserId.eq(user_id))
            .one(&*self.db)
            .await?
            .ok_or(NotificationError::NotFound(notification_id))?;

        if existing.is_read {
            return Ok(existing);
        }

        let mut active: notification::ActiveModel = existing.into();
        active.is_read = Set(true);
        Ok(active.update(&*self.db).await?)
    }

    /// Marks every unread notification of the user read; returns how many changed
    #[instrument(skip(self))]
    pub async fn mark_all_read(&self, user_id: i32) -> Result<u64, NotificationError> {
        let result = notification::Entity::update_many()
            .col_expr(notification::Column::IsRead, sea_orm::sea_query::Expr::value(true))
            .filter(notification::Column::UserId.eq(user_id))
            .filter(notification::Column::IsRead.eq(false))
            .exec(&*self.db)
            .await?;
        Ok(result.rows_affected)
    }
}

#[async_trait]
impl NotificationGateway for DbNotificationGateway {
    #[instrument(skip(self, message), fields(kind = %message.kind))]
    async fn notify(
        &self,
        user_id: i32,
        message: &NotificationMessage,
    ) -> Result<(), NotificationError> {
        Self::row(user_id, message).insert(&*self.db).await?;
        debug!(user_id, "Notification stored");
        Ok(())
    }

    #[instrument(skip(self, message), fields(kind = %message.kind, recipients = user_ids.len()))]
    async fn notify_many(
        &self,
        user_ids: &[i32],
        message: &NotificationMessage,
    ) -> Result<(), NotificationError> {
        if user_ids.is_empty() {
            return Ok(());
        }
        let rows: Vec<_> = user_ids.iter().map(|id| Self::row(*id, message)).collect();
        notification::Entity::insert_many(rows).exec(&*self.db).await?;
        Ok(())
    }

    #[instrument(skip(self, message), fields(kind = %message.kind))]
    async fn notify_roles(
        &self,
        roles: &[UserRole],
        message: &NotificationMessage,
    ) -> Result<(), NotificationError> {
        let recipients: Vec<i32> = user::Entity::find()
            .select_only()
            .column(user::Column::Id)
            .filter(user::Column::Role.is_in(roles.iter().copied()))
            .filter(user::Column::DeletedAt.is_null())
            .into_tuple()
            .all(&*self.db)
            .await?;
        self.notify_many(&recipients, message).await
    }
}

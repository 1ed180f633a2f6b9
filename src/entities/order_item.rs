use crate::models::ItemKind;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sea_orm::entity::prelude::*;
use sea_orm::{ActiveValue, Set};
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, Eq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "order_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i32,
    pub order_id: i32,
    pub service_id: Option<i32>,
    pub part_id: Option<i32>,
    pub item_type: ItemKind,
    pub name: String,
    pub quantity: i32,
    /// Unit price
    pub price: Decimal,
    /// Cost basis recorded at the time the line was added
    pub cost_price: Option<Decimal>,
    pub mechanic_id: Option<i32>,
    pub created_at: DateTime<Utc>,
}

impl Model {
    /// One-line form used by history entries
    pub fn summary(&self) -> String {
        format!("{} x{} — {}", self.name, self.quantity, self.price)
    }
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::order::Entity",
        from = "Column::OrderId",
        to = "super::order::Column::Id"
    )]
    Order,
    #[sea_orm(
        belongs_to = "super::part::Entity",
        from = "Column::PartId",
        to = "super::part::Column::Id"
    )]
    Part,
    #[sea_orm(
        belongs_to = "super::catalog_service::Entity",
        from = "Column::ServiceId",
        to = "super::catalog_service::Column::Id"
    )]
    Service,
}

impl Related<super::order::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Order.def()
    }
}

impl Related<super::part::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Part.def()
    }
}

impl Related<super::catalog_service::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Service.def()
    }
}

#[async_trait]
impl ActiveModelBehavior for ActiveModel {
    async fn before_save<C>(self, _db: &C, insert: bool) -> Result<Self, DbErr>
    where
        C: ConnectionTrait,
    {
        let mut active_model = self;

        if insert {
            if let ActiveValue::NotSet = active_model.created_at {
                active_model.created_at = Set(Utc::now());
            }
        }

        Ok(active_model)
    }
}

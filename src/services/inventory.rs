use crate::clock::Clock;
use crate::db::DatabaseAccess;
use crate::entities::{part, user};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{Money, Quantity};
use crate::services::Actor;
use rand::Rng;
use rust_decimal::Decimal;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use validator::Validate;

const SKU_PREFIX: &str = "PRT-";
const SKU_SUFFIX_LEN: usize = 6;
const SKU_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
const SKU_MAX_ATTEMPTS: usize = 10;
const DEFAULT_MIN_STOCK_LEVEL: i32 = 3;

// Stock ledger. These run on the caller's connection so that a reservation
// commits or rolls back together with the order change that caused it.

/// Atomically takes `quantity` units out of stock.
///
/// The decrement is a single conditional update, so two concurrent callers can
/// never both succeed when together they would drive stock negative.
pub async fn reserve<C: ConnectionTrait>(
    conn: &C,
    part_id: i32,
    quantity: Quantity,
) -> Result<part::Model, ServiceError> {
    let requested = quantity.get();
    let result = part::Entity::update_many()
        .col_expr(
            part::Column::StockQuantity,
            Expr::col(part::Column::StockQuantity).sub(requested),
        )
        .filter(part::Column::Id.eq(part_id))
        .filter(part::Column::DeletedAt.is_null())
        .filter(part::Column::StockQuantity.gte(requested))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        let current = find_active_part(conn, part_id).await?;
        warn!(
            part_id,
            requested,
            on_hand = current.stock_quantity,
            "Stock reservation rejected"
        );
        return Err(ServiceError::InsufficientStock {
            part_id,
            requested,
            on_hand: current.stock_quantity,
        });
    }

    find_part(conn, part_id).await
}

/// Atomically returns `quantity` units to stock.
///
/// Retired parts still take their stock back, so removing an old line never fails.
pub async fn release<C: ConnectionTrait>(
    conn: &C,
    part_id: i32,
    quantity: Quantity,
) -> Result<part::Model, ServiceError> {
    let result = part::Entity::update_many()
        .col_expr(
            part::Column::StockQuantity,
            Expr::col(part::Column::StockQuantity).add(quantity.get()),
        )
        .filter(part::Column::Id.eq(part_id))
        .exec(conn)
        .await?;

    if result.rows_affected == 0 {
        return Err(ServiceError::NotFound(format!("Part {} not found", part_id)));
    }

    find_part(conn, part_id).await
}

async fn find_part<C: ConnectionTrait>(conn: &C, part_id: i32) -> Result<part::Model, ServiceError> {
    part::Entity::find_by_id(part_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Part {} not found", part_id)))
}

/// Looks up a part that has not been removed from the catalog
pub async fn find_active_part<C: ConnectionTrait>(
    conn: &C,
    part_id: i32,
) -> Result<part::Model, ServiceError> {
    part::Entity::find_by_id(part_id)
        .filter(part::Column::DeletedAt.is_null())
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Part {} not found", part_id)))
}

fn generate_sku() -> String {
    let mut rng = rand::thread_rng();
    let suffix: String = (0..SKU_SUFFIX_LEN)
        .map(|_| SKU_CHARSET[rng.gen_range(0..SKU_CHARSET.len())] as char)
        .collect();
    format!("{}{}", SKU_PREFIX, suffix)
}

/// Input for adding a part to the catalog
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreatePartInput {
    #[validate(length(min = 1, max = 200))]
    pub name: String,
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub stock_quantity: i32,
    #[validate(range(min = 0))]
    pub min_stock_level: Option<i32>,
    pub purchase_price: Decimal,
    pub retail_price: Decimal,
}

/// Catalog fields that may change after creation; stock moves only through the ledger
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct UpdatePartInput {
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub description: Option<String>,
    #[validate(range(min = 0))]
    pub min_stock_level: Option<i32>,
    pub purchase_price: Option<Decimal>,
    pub retail_price: Option<Decimal>,
}

/// Parts catalog and stock adjustments
#[derive(Clone)]
pub struct InventoryService {
    db: DatabaseAccess,
    event_sender: EventSender,
    clock: Arc<dyn Clock>,
}

impl InventoryService {
    pub fn new(db: DatabaseAccess, event_sender: EventSender, clock: Arc<dyn Clock>) -> Self {
        Self {
            db,
            event_sender,
            clock,
        }
    }

    /// Adds a part under a freshly generated unique SKU
    #[instrument(skip(self, input), fields(name = %input.name))]
    pub async fn create_part(&self, input: CreatePartInput) -> Result<part::Model, ServiceError> {
        input.validate()?;
        Money::non_negative(input.purchase_price)?;
        Money::non_negative(input.retail_price)?;

        let now = self.clock.now();
        let created = self
            .db
            .transaction("create_part", move |txn| {
                let input = input.clone();
                Box::pin(async move {
                    let mut sku = None;
                    for _ in 0..SKU_MAX_ATTEMPTS {
                        let candidate = generate_sku();
                        let taken = part::Entity::find()
                            .filter(part::Column::Sku.eq(candidate.as_str()))
                            .count(txn)
                            .await?;
                        if taken == 0 {
                            sku = Some(candidate);
                            break;
                        }
                    }
                    let sku = sku.ok_or_else(|| {
                        ServiceError::Conflict("Could not allocate a unique SKU".to_string())
                    })?;

                    let model = part::ActiveModel {
                        sku: Set(sku),
                        name: Set(input.name),
                        description: Set(input.description),
                        stock_quantity: Set(input.stock_quantity),
                        min_stock_level: Set(input.min_stock_level.unwrap_or(DEFAULT_MIN_STOCK_LEVEL)),
                        purchase_price: Set(input.purchase_price),
                        retail_price: Set(input.retail_price),
                        created_at: Set(now),
                        updated_at: Set(None),
                        deleted_at: Set(None),
                        ..Default::default()
                    }
                    .insert(txn)
                    .await?;
                    Ok(model)
                })
            })
            .await?;

        info!(part_id = created.id, sku = %created.sku, "Part created");
        Ok(created)
    }

    pub async fn get_part(&self, part_id: i32) -> Result<part::Model, ServiceError> {
        find_active_part(self.db.get_pool(), part_id).await
    }

    /// Active parts ordered by name, optionally filtered by a name or SKU fragment
    pub async fn list_parts(&self, search: Option<&str>) -> Result<Vec<part::Model>, ServiceError> {
        let mut query = part::Entity::find().filter(part::Column::DeletedAt.is_null());
        if let Some(term) = search.map(str::trim).filter(|t| !t.is_empty()) {
            query = query.filter(
                part::Column::Name
                    .contains(term)
                    .or(part::Column::Sku.contains(term)),
            );
        }
        Ok(query
            .order_by_asc(part::Column::Name)
            .all(self.db.get_pool())
            .await?)
    }

    #[instrument(skip(self, input))]
    pub async fn update_part(
        &self,
        part_id: i32,
        input: UpdatePartInput,
    ) -> Result<part::Model, ServiceError> {
        input.validate()?;
        if let Some(price) = input.purchase_price {
            Money::non_negative(price)?;
        }
        if let Some(price) = input.retail_price {
            Money::non_negative(price)?;
        }

        let now = self.clock.now();
        self.db
            .transaction("update_part", move |txn| {
                let input = input.clone();
                Box::pin(async move {
                    let existing = find_active_part(txn, part_id).await?;
                    let mut active: part::ActiveModel = existing.into();
                    if let Some(name) = input.name {
                        active.name = Set(name);
                    }
                    if let Some(description) = input.description {
                        active.description = Set(Some(description));
                    }
                    if let Some(level) = input.min_stock_level {
                        active.min_stock_level = Set(level);
                    }
                    if let Some(price) = input.purchase_price {
                        active.purchase_price = Set(price);
                    }
                    if let Some(price) = input.retail_price {
                        active.retail_price = Set(price);
                    }
                    active.updated_at = Set(Some(now));
                    Ok(active.update(txn).await?)
                })
            })
            .await
    }

    /// Moves stock by `delta` through the ledger; a negative delta may not overdraw
    #[instrument(skip(self))]
    pub async fn adjust_stock(&self, part_id: i32, delta: i32) -> Result<part::Model, ServiceError> {
        if delta == 0 {
            return Err(ServiceError::BadRequest(
                "Stock adjustment must be non-zero".to_string(),
            ));
        }
        let quantity = Quantity::new(delta.saturating_abs())?;

        let updated = self
            .db
            .transaction("adjust_stock", move |txn| {
                Box::pin(async move {
                    if delta > 0 {
                        find_active_part(txn, part_id).await?;
                        release(txn, part_id, quantity).await
                    } else {
                        reserve(txn, part_id, quantity).await
                    }
                })
            })
            .await?;

        info!(
            part_id,
            delta,
            on_hand = updated.stock_quantity,
            "Stock adjusted"
        );
        if delta < 0 {
            self.warn_if_low(&updated);
        }
        Ok(updated)
    }

    /// Retires a part from the catalog; existing order lines keep their reference
    #[instrument(skip(self))]
    pub async fn remove_part(&self, part_id: i32) -> Result<(), ServiceError> {
        let now = self.clock.now();
        self.db
            .transaction("remove_part", move |txn| {
                Box::pin(async move {
                    let existing = find_active_part(txn, part_id).await?;
                    let mut active: part::ActiveModel = existing.into();
                    active.deleted_at = Set(Some(now));
                    active.updated_at = Set(Some(now));
                    active.update(txn).await?;
                    Ok(())
                })
            })
            .await?;
        info!(part_id, "Part removed from catalog");
        Ok(())
    }

    /// Active parts at or below their reorder threshold
    pub async fn low_stock_parts(&self) -> Result<Vec<part::Model>, ServiceError> {
        Ok(part::Entity::find()
            .filter(part::Column::DeletedAt.is_null())
            .filter(Expr::col(part::Column::StockQuantity).lte(Expr::col(part::Column::MinStockLevel)))
            .order_by_asc(part::Column::StockQuantity)
            .order_by_asc(part::Column::Name)
            .all(self.db.get_pool())
            .await?)
    }

    /// Tells admins and managers that a part could not be found on the shelf
    #[instrument(skip(self, comment))]
    pub async fn report_missing(
        &self,
        part_id: i32,
        actor: Actor,
        comment: Option<String>,
    ) -> Result<(), ServiceError> {
        let pool = self.db.get_pool();
        let part = find_active_part(pool, part_id).await?;
        let reporter = user::Entity::find_by_id(actor.user_id)
            .one(pool)
            .await?
            .map(|u| u.full_name())
            .unwrap_or_else(|| format!("User #{}", actor.user_id));

        self.event_sender.publish(Event::PartReportedMissing {
            part_id: part.id,
            part_name: part.name,
            sku: part.sku,
            reported_by: reporter,
            comment,
        });
        Ok(())
    }

    fn warn_if_low(&self, part: &part::Model) {
        if let Some(event) = low_stock_event(part) {
            self.event_sender.publish(event);
        }
    }
}

/// Low-stock notice for a part that has dropped to its threshold
pub(crate) fn low_stock_event(part: &part::Model) -> Option<Event> {
    part.is_low_stock().then(|| Event::LowStock {
        part_id: part.id,
        part_name: part.name.clone(),
        on_hand: part.stock_quantity,
        threshold: part.min_stock_level,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_sku_shape() {
        for _ in 0..50 {
            let sku = generate_sku();
            assert!(sku.starts_with("PRT-"));
            assert_eq!(sku.len(), SKU_PREFIX.len() + SKU_SUFFIX_LEN);
            assert!(sku[SKU_PREFIX.len()..]
                .chars()
                .all(|c| c.is_ascii_uppercase() || c.is_ascii_digit()));
        }
    }
}

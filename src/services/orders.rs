use crate::clock::Clock;
use crate::db::DatabaseAccess;
use crate::entities::{appointment, catalog_service, order, order_history, order_item, user, vehicle};
use crate::errors::ServiceError;
use crate::events::{Audience, Event, EventSender};
use crate::models::{recompute_total, HistoryAction, ItemKind, Money, OrderStatus, Quantity, UserRole};
use crate::services::appointments;
use crate::services::history::{self, HistoryRecord};
use crate::services::inventory::{self, low_stock_event};
use crate::services::Actor;
use chrono::{DateTime, Utc};
use metrics::counter;
use rust_decimal::Decimal;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, ModelTrait, QueryFilter,
    QueryOrder, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

/// Workflow knobs taken from `AppConfig`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkflowSettings {
    /// Reject status changes outside the transition table
    pub enforce_status_transitions: bool,
    pub default_appointment_minutes: i32,
}

impl Default for WorkflowSettings {
    fn default() -> Self {
        Self {
            enforce_status_transitions: true,
            default_appointment_minutes: 60,
        }
    }
}

/// Input for opening a new order
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateOrderInput {
    pub vehicle_id: i32,
    #[validate(length(max = 2000))]
    pub description: Option<String>,
    /// Odometer reading at intake; the vehicle's last reading when absent
    #[validate(range(min = 0))]
    pub mileage: Option<i32>,
    /// Books a visit at this time together with the order
    pub scheduled_at: Option<DateTime<Utc>>,
}

/// A line to add to an order.
///
/// The kind is inferred from `part_id` when not given. Name and price default
/// to the catalog entry the line references.
#[derive(Debug, Clone, Default, Serialize, Deserialize, Validate)]
pub struct AddItemInput {
    pub kind: Option<ItemKind>,
    pub service_id: Option<i32>,
    pub part_id: Option<i32>,
    #[validate(length(min = 1, max = 200))]
    pub name: Option<String>,
    pub quantity: Option<i32>,
    pub price: Option<Decimal>,
    pub cost_price: Option<Decimal>,
    pub mechanic_id: Option<i32>,
}

/// New manager and/or mechanic for an order
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct AssignStaffInput {
    pub manager_id: Option<i32>,
    pub mechanic_id: Option<i32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderFilter {
    pub status: Option<OrderStatus>,
    pub mechanic_id: Option<i32>,
    pub created_from: Option<DateTime<Utc>>,
    pub created_to: Option<DateTime<Utc>>,
}

/// An order with everything attached to it
#[derive(Debug, Clone, Serialize)]
pub struct OrderDetails {
    pub order: order::Model,
    pub vehicle: vehicle::Model,
    pub items: Vec<order_item::Model>,
    /// Most recent first
    pub history: Vec<order_history::Model>,
    pub appointment: Option<appointment::Model>,
}

/// Result of adding a line: the line and its order with the new total
#[derive(Debug, Clone, Serialize)]
pub struct ItemAdded {
    pub order: order::Model,
    pub item: order_item::Model,
}

#[derive(Debug, Clone, Copy)]
enum LineSource {
    Service(Option<i32>),
    Part(i32),
}

impl LineSource {
    fn resolve(input: &AddItemInput) -> Result<Self, ServiceError> {
        let kind = input.kind.unwrap_or(if input.part_id.is_some() {
            ItemKind::Part
        } else {
            ItemKind::Service
        });
        match (kind, input.part_id) {
            (ItemKind::Part, Some(part_id)) => Ok(LineSource::Part(part_id)),
            (ItemKind::Part, None) => Err(ServiceError::BadRequest(
                "A part line must reference a part".to_string(),
            )),
            (ItemKind::Service, Some(_)) => Err(ServiceError::BadRequest(
                "A service line cannot reference a part".to_string(),
            )),
            (ItemKind::Service, None) => Ok(LineSource::Service(input.service_id)),
        }
    }
}

/// Transactional order lifecycle: intake, status, staff and line items
#[derive(Clone)]
pub struct OrderService {
    db: DatabaseAccess,
    event_sender: EventSender,
    clock: Arc<dyn Clock>,
    settings: WorkflowSettings,
}

impl OrderService {
    pub fn new(
        db: DatabaseAccess,
        event_sender: EventSender,
        clock: Arc<dyn Clock>,
        settings: WorkflowSettings,
    ) -> Self {
        Self {
            db,
            event_sender,
            clock,
            settings,
        }
    }

    /// Opens a `CONFIRMED` order with a zero total, optionally booking a visit.
    ///
    /// Staff hear about orders opened by clients; the vehicle owner hears about
    /// orders opened by staff.
    #[instrument(skip(self, input), fields(vehicle_id = input.vehicle_id))]
    pub async fn create_order(
        &self,
        input: CreateOrderInput,
        actor: Actor,
    ) -> Result<order::Model, ServiceError> {
        input.validate()?;
        let now = self.clock.now();
        let appointment_minutes = self.settings.default_appointment_minutes;

        let (created, vehicle) = self
            .db
            .transaction("create_order", move |txn| {
                let input = input.clone();
                Box::pin(async move {
                    let vehicle = find_vehicle(txn, input.vehicle_id).await?;

                    let created = order::ActiveModel {
                        vehicle_id: Set(vehicle.id),
                        manager_id: Set(None),
                        mechanic_id: Set(None),
                        mileage: Set(Some(input.mileage.unwrap_or(vehicle.mileage))),
                        description: Set(input.description),
                        total_amount: Set(Money::ZERO.amount()),
                        status: Set(OrderStatus::Confirmed),
                        created_at: Set(now),
                        updated_at: Set(None),
                        completed_at: Set(None),
                        ..Default::default()
                    }
                    .insert(txn)
                    .await?;

                    if let Some(at) = input.scheduled_at {
                        appointments::book(txn, created.id, at, appointment_minutes, now).await?;
                    }

                    history::record(
                        txn,
                        HistoryRecord::new(created.id, actor.user_id, HistoryAction::OrderCreated)
                            .new_value(created.status.to_string())
                            .comment("Order created"),
                        now,
                    )
                    .await?;

                    Ok((created, vehicle))
                })
            })
            .await?;

        info!(order_id = created.id, vehicle_id = vehicle.id, "Order created");
        counter!("workshop.orders.created", 1);

        let audience = if actor.is_staff() {
            Audience::Users(vec![vehicle.owner_id])
        } else {
            Audience::Roles(vec![UserRole::Admin, UserRole::Manager])
        };
        self.event_sender.publish(Event::OrderCreated {
            order_id: created.id,
            vehicle: vehicle.display_name(),
            description: created.description.clone(),
            audience,
        });
        Ok(created)
    }

    /// Moves an order to `new_status`, stamping the completion time the first time it completes
    #[instrument(skip(self, comment))]
    pub async fn change_status(
        &self,
        order_id: i32,
        new_status: OrderStatus,
        actor: Actor,
        comment: Option<String>,
    ) -> Result<order::Model, ServiceError> {
        let now = self.clock.now();
        let enforce = self.settings.enforce_status_transitions;

        let (updated, old_status, owner_id) = self
            .db
            .transaction("change_order_status", move |txn| {
                let comment = comment.clone();
                Box::pin(async move {
                    let existing = lock_order(txn, order_id).await?;
                    let old_status = existing.status;
                    if enforce && !old_status.can_transition_to(new_status) {
                        return Err(ServiceError::InvalidStatus(format!(
                            "Order {} cannot move from {} to {}",
                            order_id, old_status, new_status
                        )));
                    }

                    let owner_id = find_vehicle(txn, existing.vehicle_id).await?.owner_id;
                    let first_completion =
                        new_status == OrderStatus::Completed && existing.completed_at.is_none();

                    let mut active: order::ActiveModel = existing.into();
                    active.status = Set(new_status);
                    active.updated_at = Set(Some(now));
                    if first_completion {
                        active.completed_at = Set(Some(now));
                    }
                    let updated = active.update(txn).await?;

                    let mut text = format!(
                        "Status changed: {} → {}",
                        old_status.label(),
                        new_status.label()
                    );
                    if let Some(note) = comment.as_deref().map(str::trim).filter(|c| !c.is_empty()) {
                        text.push_str(". ");
                        text.push_str(note);
                    }
                    history::record(
                        txn,
                        HistoryRecord::new(order_id, actor.user_id, HistoryAction::StatusChange)
                            .old_value(old_status.to_string())
                            .new_value(new_status.to_string())
                            .comment(text),
                        now,
                    )
                    .await?;

                    Ok((updated, old_status, owner_id))
                })
            })
            .await?;

        info!(
            order_id,
            from = %old_status,
            to = %updated.status,
            "Order status changed"
        );
        counter!("workshop.orders.status_changed", 1, "status" => updated.status.to_string());

        let recipients = status_recipients(owner_id, &updated, actor.user_id);
        if !recipients.is_empty() {
            self.event_sender.publish(Event::OrderStatusChanged {
                order_id,
                old_status,
                new_status: updated.status,
                recipients,
            });
        }
        Ok(updated)
    }

    /// Reassigns the manager and/or mechanic; newly assigned people are told individually
    #[instrument(skip(self))]
    pub async fn assign_staff(
        &self,
        order_id: i32,
        input: AssignStaffInput,
        actor: Actor,
    ) -> Result<order::Model, ServiceError> {
        if input.manager_id.is_none() && input.mechanic_id.is_none() {
            return Err(ServiceError::BadRequest(
                "Either a manager or a mechanic must be given".to_string(),
            ));
        }
        let now = self.clock.now();

        let (updated, previous) = self
            .db
            .transaction("assign_staff", move |txn| {
                Box::pin(async move {
                    let manager = match input.manager_id {
                        Some(id) => {
                            let user = find_user(txn, id).await?;
                            if !user.role.can_manage_orders() {
                                return Err(ServiceError::BadRequest(format!(
                                    "User {} is not a manager",
                                    id
                                )));
                            }
                            Some(user)
                        }
                        None => None,
                    };
                    let mechanic = match input.mechanic_id {
                        Some(id) => {
                            let user = find_user(txn, id).await?;
                            if user.role != UserRole::Mechanic {
                                return Err(ServiceError::BadRequest(format!(
                                    "User {} is not a mechanic",
                                    id
                                )));
                            }
                            Some(user)
                        }
                        None => None,
                    };

                    let existing = lock_order(txn, order_id).await?;
                    let previous = (existing.manager_id, existing.mechanic_id);

                    let mut changes = Vec::new();
                    let mut old_parts = Vec::new();
                    let mut new_parts = Vec::new();
                    if let Some(manager) = &manager {
                        let old = staff_name(txn, existing.manager_id).await?;
                        changes.push(format!("Manager: {} → {}", old, manager.full_name()));
                        old_parts.push(format!("manager: {}", old));
                        new_parts.push(format!("manager: {}", manager.full_name()));
                    }
                    if let Some(mechanic) = &mechanic {
                        let old = staff_name(txn, existing.mechanic_id).await?;
                        changes.push(format!("Mechanic: {} → {}", old, mechanic.full_name()));
                        old_parts.push(format!("mechanic: {}", old));
                        new_parts.push(format!("mechanic: {}", mechanic.full_name()));
                    }

                    let mut active: order::ActiveModel = existing.into();
                    if let Some(manager) = &manager {
                        active.manager_id = Set(Some(manager.id));
                    }
                    if let Some(mechanic) = &mechanic {
                        active.mechanic_id = Set(Some(mechanic.id));
                    }
                    active.updated_at = Set(Some(now));
                    let updated = active.update(txn).await?;

                    history::record(
                        txn,
                        HistoryRecord::new(order_id, actor.user_id, HistoryAction::AssignmentChange)
                            .old_value(old_parts.join("; "))
                            .new_value(new_parts.join("; "))
                            .comment(changes.join("; ")),
                        now,
                    )
                    .await?;

                    Ok((updated, previous))
                })
            })
            .await?;

        info!(
            order_id,
            manager_id = ?updated.manager_id,
            mechanic_id = ?updated.mechanic_id,
            "Order staff assigned"
        );

        let (old_manager, old_mechanic) = previous;
        let assignments = [
            (input.manager_id, old_manager, UserRole::Manager),
            (input.mechanic_id, old_mechanic, UserRole::Mechanic),
        ];
        for (assigned, before, role) in assignments {
            if let Some(user_id) = assigned {
                if user_id != actor.user_id && Some(user_id) != before {
                    self.event_sender.publish(Event::StaffAssigned {
                        order_id,
                        user_id,
                        role,
                    });
                }
            }
        }
        Ok(updated)
    }

    /// Adds a line; a part line takes its quantity out of stock in the same transaction
    #[instrument(skip(self, input))]
    pub async fn add_item(
        &self,
        order_id: i32,
        input: AddItemInput,
        actor: Actor,
    ) -> Result<ItemAdded, ServiceError> {
        input.validate()?;
        let source = LineSource::resolve(&input)?;
        let quantity = Quantity::new(input.quantity.unwrap_or(1))?;
        if let Some(price) = input.price {
            Money::non_negative(price)?;
        }
        if let Some(cost) = input.cost_price {
            Money::non_negative(cost)?;
        }
        let now = self.clock.now();

        let (added, stock_after) = self
            .db
            .transaction("add_order_item", move |txn| {
                let input = input.clone();
                Box::pin(async move {
                    let order = lock_order(txn, order_id).await?;

                    let (kind, name, price, cost_price, stock_after) = match source {
                        LineSource::Part(part_id) => {
                            let part = inventory::find_active_part(txn, part_id).await?;
                            let reserved = inventory::reserve(txn, part_id, quantity).await?;
                            (
                                ItemKind::Part,
                                input.name.unwrap_or(part.name),
                                input.price.unwrap_or(part.retail_price),
                                Some(input.cost_price.unwrap_or(part.purchase_price)),
                                Some(reserved),
                            )
                        }
                        LineSource::Service(Some(service_id)) => {
                            let service = catalog_service::Entity::find_by_id(service_id)
                                .one(txn)
                                .await?
                                .ok_or_else(|| {
                                    ServiceError::NotFound(format!(
                                        "Service {} not found",
                                        service_id
                                    ))
                                })?;
                            (
                                ItemKind::Service,
                                input.name.unwrap_or(service.name),
                                input.price.unwrap_or(service.price),
                                input.cost_price,
                                None,
                            )
                        }
                        LineSource::Service(None) => {
                            let name = input.name.ok_or_else(|| {
                                ServiceError::BadRequest(
                                    "A custom service line needs a name".to_string(),
                                )
                            })?;
                            let price = input.price.ok_or_else(|| {
                                ServiceError::BadRequest(
                                    "A custom service line needs a price".to_string(),
                                )
                            })?;
                            (ItemKind::Service, name, price, input.cost_price, None)
                        }
                    };

                    let part_id = match source {
                        LineSource::Part(id) => Some(id),
                        LineSource::Service(_) => None,
                    };
                    let service_id = match source {
                        LineSource::Service(id) => id,
                        LineSource::Part(_) => None,
                    };

                    let item = order_item::ActiveModel {
                        order_id: Set(order.id),
                        service_id: Set(service_id),
                        part_id: Set(part_id),
                        item_type: Set(kind),
                        name: Set(name),
                        quantity: Set(quantity.get()),
                        price: Set(price),
                        cost_price: Set(cost_price),
                        mechanic_id: Set(input.mechanic_id),
                        created_at: Set(now),
                        ..Default::default()
                    }
                    .insert(txn)
                    .await?;

                    let order = refresh_total(txn, order, now).await?;

                    history::record(
                        txn,
                        HistoryRecord::new(order_id, actor.user_id, HistoryAction::ItemAdded)
                            .new_value(item.summary())
                            .comment(format!("Added {} line: {}", kind, item.summary())),
                        now,
                    )
                    .await?;

                    Ok((ItemAdded { order, item }, stock_after))
                })
            })
            .await?;

        info!(
            order_id,
            item_id = added.item.id,
            kind = %added.item.item_type,
            total = %added.order.total_amount,
            "Order item added"
        );

        if let Some(event) = stock_after.as_ref().and_then(low_stock_event) {
            self.event_sender.publish(event);
        }
        Ok(added)
    }

    /// Removes a line, returning a part line's quantity to stock
    #[instrument(skip(self))]
    pub async fn remove_item(
        &self,
        order_id: i32,
        item_id: i32,
        actor: Actor,
    ) -> Result<order::Model, ServiceError> {
        let now = self.clock.now();

        let updated = self
            .db
            .transaction("remove_order_item", move |txn| {
                Box::pin(async move {
                    let order = lock_order(txn, order_id).await?;
                    let item = order_item::Entity::find_by_id(item_id)
                        .filter(order_item::Column::OrderId.eq(order_id))
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Item {} not found on order {}",
                                item_id, order_id
                            ))
                        })?;

                    if let (ItemKind::Part, Some(part_id)) = (item.item_type, item.part_id) {
                        inventory::release(txn, part_id, Quantity::new(item.quantity)?).await?;
                    }

                    let summary = item.summary();
                    let kind = item.item_type;
                    item.delete(txn).await?;

                    let order = refresh_total(txn, order, now).await?;

                    history::record(
                        txn,
                        HistoryRecord::new(order_id, actor.user_id, HistoryAction::ItemRemoved)
                            .old_value(summary.clone())
                            .comment(format!("Removed {} line: {}", kind, summary)),
                        now,
                    )
                    .await?;
                    Ok(order)
                })
            })
            .await?;

        info!(order_id, item_id, total = %updated.total_amount, "Order item removed");
        Ok(updated)
    }

    /// The order with its vehicle, items, history and appointment
    pub async fn get_order(&self, order_id: i32) -> Result<OrderDetails, ServiceError> {
        let pool = self.db.get_pool();
        let order = order::Entity::find_by_id(order_id)
            .one(pool)
            .await?
            .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))?;
        let vehicle = find_vehicle(pool, order.vehicle_id).await?;
        let items = order
            .find_related(order_item::Entity)
            .order_by_asc(order_item::Column::Id)
            .all(pool)
            .await?;
        let history = history::list(pool, order_id).await?;
        let appointment = order
            .find_related(appointment::Entity)
            .order_by_desc(appointment::Column::Id)
            .one(pool)
            .await?;

        Ok(OrderDetails {
            order,
            vehicle,
            items,
            history,
            appointment,
        })
    }

    /// Orders matching `filter`, newest first
    pub async fn list_orders(&self, filter: OrderFilter) -> Result<Vec<order::Model>, ServiceError> {
        let mut query = order::Entity::find();
        if let Some(status) = filter.status {
            query = query.filter(order::Column::Status.eq(status));
        }
        if let Some(mechanic_id) = filter.mechanic_id {
            query = query.filter(order::Column::MechanicId.eq(mechanic_id));
        }
        if let Some(from) = filter.created_from {
            query = query.filter(order::Column::CreatedAt.gte(from));
        }
        if let Some(to) = filter.created_to {
            query = query.filter(order::Column::CreatedAt.lte(to));
        }
        Ok(query
            .order_by_desc(order::Column::CreatedAt)
            .order_by_desc(order::Column::Id)
            .all(self.db.get_pool())
            .await?)
    }
}

/// Loads an order for update, serializing concurrent mutations of the same order
pub(crate) async fn lock_order<C: ConnectionTrait>(
    conn: &C,
    order_id: i32,
) -> Result<order::Model, ServiceError> {
    order::Entity::find_by_id(order_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

pub(crate) async fn find_vehicle<C: ConnectionTrait>(
    conn: &C,
    vehicle_id: i32,
) -> Result<vehicle::Model, ServiceError> {
    vehicle::Entity::find_by_id(vehicle_id)
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("Vehicle {} not found", vehicle_id)))
}

pub(crate) async fn find_user<C: ConnectionTrait>(conn: &C, user_id: i32) -> Result<user::Model, ServiceError> {
    user::Entity::find_by_id(user_id)
        .filter(user::Column::DeletedAt.is_null())
        .one(conn)
        .await?
        .ok_or_else(|| ServiceError::NotFound(format!("User {} not found", user_id)))
}

async fn staff_name<C: ConnectionTrait>(
    conn: &C,
    user_id: Option<i32>,
) -> Result<String, ServiceError> {
    let Some(id) = user_id else {
        return Ok("not assigned".to_string());
    };
    Ok(user::Entity::find_by_id(id)
        .one(conn)
        .await?
        .map(|u| u.full_name())
        .unwrap_or_else(|| format!("User #{}", id)))
}

/// Re-derives the total from the order's current lines and stores it
async fn refresh_total<C: ConnectionTrait>(
    conn: &C,
    order: order::Model,
    now: DateTime<Utc>,
) -> Result<order::Model, ServiceError> {
    let items = order_item::Entity::find()
        .filter(order_item::Column::OrderId.eq(order.id))
        .all(conn)
        .await?;
    let total = recompute_total(&items);

    let mut active: order::ActiveModel = order.into();
    active.total_amount = Set(total.amount());
    active.updated_at = Set(Some(now));
    Ok(active.update(conn).await?)
}

/// Owner, manager and mechanic of an order, once each, without the actor
fn status_recipients(owner_id: i32, order: &order::Model, actor_id: i32) -> Vec<i32> {
    let mut recipients = Vec::with_capacity(3);
    for id in [Some(owner_id), order.manager_id, order.mechanic_id]
        .into_iter()
        .flatten()
    {
        if id != actor_id && !recipients.contains(&id) {
            recipients.push(id);
        }
    }
    recipients
}

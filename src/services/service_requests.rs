use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::db::DatabaseAccess;
use crate::entities::{appointment, order, service_request};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{HistoryAction, Money, OrderStatus, ServiceRequestStatus, UserRole};
use crate::services::appointments::{self, format_local, workshop_offset};
use crate::services::history::{self, HistoryRecord};
use crate::services::orders::{find_user, find_vehicle};
use crate::services::Actor;
use chrono::{DateTime, Utc};
use metrics::counter;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QueryOrder,
    QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument};
use validator::Validate;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct CreateRequestInput {
    pub vehicle_id: i32,
    #[validate(length(min = 1, max = 2000, message = "Reason must be between 1 and 2000 characters"))]
    pub reason: String,
}

/// What the approving manager decides about the visit
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct ApproveRequestInput {
    pub scheduled_at: DateTime<Utc>,
    #[validate(range(min = 1))]
    pub estimated_min: Option<i32>,
    pub mechanic_id: Option<i32>,
    /// Order description; the request's reason when absent
    #[validate(length(max = 2000))]
    pub description: Option<String>,
}

/// Everything approval creates
#[derive(Debug, Clone, Serialize)]
pub struct ApprovedRequest {
    pub request: service_request::Model,
    pub order: order::Model,
    pub appointment: appointment::Model,
}

/// Client requests for a visit and their conversion into orders
#[derive(Clone)]
pub struct ServiceRequestService {
    db: DatabaseAccess,
    event_sender: EventSender,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerConfig,
}

impl ServiceRequestService {
    pub fn new(
        db: DatabaseAccess,
        event_sender: EventSender,
        clock: Arc<dyn Clock>,
        scheduler: SchedulerConfig,
    ) -> Self {
        Self {
            db,
            event_sender,
            clock,
            scheduler,
        }
    }

    /// Files a request for one of the client's own vehicles
    #[instrument(skip(self, input), fields(vehicle_id = input.vehicle_id))]
    pub async fn create_request(
        &self,
        client: Actor,
        input: CreateRequestInput,
    ) -> Result<service_request::Model, ServiceError> {
        input.validate()?;
        let reason = input.reason.trim().to_string();
        if reason.is_empty() {
            return Err(ServiceError::BadRequest("Reason must not be blank".to_string()));
        }

        let pool = self.db.get_pool();
        let vehicle = find_vehicle(pool, input.vehicle_id).await?;
        if vehicle.owner_id != client.user_id {
            return Err(ServiceError::BadRequest(format!(
                "Vehicle {} does not belong to user {}",
                vehicle.id, client.user_id
            )));
        }

        let created = service_request::ActiveModel {
            client_id: Set(client.user_id),
            vehicle_id: Set(vehicle.id),
            reason: Set(reason),
            status: Set(ServiceRequestStatus::New),
            order_id: Set(None),
            created_at: Set(self.clock.now()),
            updated_at: Set(None),
            ..Default::default()
        }
        .insert(pool)
        .await?;

        info!(request_id = created.id, client_id = client.user_id, "Service request created");
        counter!("workshop.service_requests.created", 1);
        Ok(created)
    }

    pub async fn get_request(&self, request_id: i32) -> Result<service_request::Model, ServiceError> {
        service_request::Entity::find_by_id(request_id)
            .one(self.db.get_pool())
            .await?
            .ok_or_else(|| not_found(request_id))
    }

    /// All requests, newest first, optionally of one status
    pub async fn list_requests(
        &self,
        status: Option<ServiceRequestStatus>,
    ) -> Result<Vec<service_request::Model>, ServiceError> {
        let mut query = service_request::Entity::find();
        if let Some(status) = status {
            query = query.filter(service_request::Column::Status.eq(status));
        }
        Ok(query
            .order_by_desc(service_request::Column::CreatedAt)
            .order_by_desc(service_request::Column::Id)
            .all(self.db.get_pool())
            .await?)
    }

    pub async fn list_for_client(
        &self,
        client_id: i32,
    ) -> Result<Vec<service_request::Model>, ServiceError> {
        Ok(service_request::Entity::find()
            .filter(service_request::Column::ClientId.eq(client_id))
            .order_by_desc(service_request::Column::CreatedAt)
            .order_by_desc(service_request::Column::Id)
            .all(self.db.get_pool())
            .await?)
    }

    /// Marks a new request as being looked at
    #[instrument(skip(self))]
    pub async fn start_review(&self, request_id: i32) -> Result<service_request::Model, ServiceError> {
        let now = self.clock.now();
        let updated = self
            .db
            .transaction("start_request_review", move |txn| {
                Box::pin(async move {
                    let request = lock_request(txn, request_id).await?;
                    if request.status != ServiceRequestStatus::New {
                        return Err(ServiceError::BadRequest(format!(
                            "Request {} is {} and cannot be taken into review",
                            request_id, request.status
                        )));
                    }
                    let mut active: service_request::ActiveModel = request.into();
                    active.status = Set(ServiceRequestStatus::InReview);
                    active.updated_at = Set(Some(now));
                    Ok(active.update(txn).await?)
                })
            })
            .await?;
        info!(request_id, "Service request in review");
        Ok(updated)
    }

    /// Turns an open request into a confirmed order with a booked visit.
    ///
    /// The order is managed by the approver. Order, appointment, request
    /// status and history entry are written in one transaction; the client is
    /// notified after it commits.
    #[instrument(skip(self, input))]
    pub async fn approve_and_schedule(
        &self,
        request_id: i32,
        manager: Actor,
        input: ApproveRequestInput,
    ) -> Result<ApprovedRequest, ServiceError> {
        input.validate()?;
        let offset = workshop_offset(self.scheduler.utc_offset_minutes)?;
        let default_minutes = self.scheduler.default_appointment_minutes;
        let now = self.clock.now();

        let approved = self
            .db
            .transaction("approve_service_request", move |txn| {
                let input = input.clone();
                Box::pin(async move {
                    let request = lock_request(txn, request_id).await?;
                    if !request.status.is_open() {
                        return Err(ServiceError::BadRequest(format!(
                            "Request {} is already {}",
                            request_id, request.status
                        )));
                    }

                    if let Some(mechanic_id) = input.mechanic_id {
                        let mechanic = find_user(txn, mechanic_id).await?;
                        if mechanic.role != UserRole::Mechanic {
                            return Err(ServiceError::BadRequest(format!(
                                "User {} is not a mechanic",
                                mechanic_id
                            )));
                        }
                    }
                    let vehicle = find_vehicle(txn, request.vehicle_id).await?;

                    let description = input
                        .description
                        .filter(|d| !d.trim().is_empty())
                        .unwrap_or_else(|| request.reason.clone());
                    let order = order::ActiveModel {
                        vehicle_id: Set(vehicle.id),
                        manager_id: Set(Some(manager.user_id)),
                        mechanic_id: Set(input.mechanic_id),
                        mileage: Set(Some(vehicle.mileage)),
                        description: Set(Some(description)),
                        total_amount: Set(Money::ZERO.amount()),
                        status: Set(OrderStatus::Confirmed),
                        created_at: Set(now),
                        updated_at: Set(None),
                        completed_at: Set(None),
                        ..Default::default()
                    }
                    .insert(txn)
                    .await?;

                    let appointment = appointments::book(
                        txn,
                        order.id,
                        input.scheduled_at,
                        input.estimated_min.unwrap_or(default_minutes),
                        now,
                    )
                    .await?;

                    let mut active: service_request::ActiveModel = request.into();
                    active.status = Set(ServiceRequestStatus::Processed);
                    active.order_id = Set(Some(order.id));
                    active.updated_at = Set(Some(now));
                    let request = active.update(txn).await?;

                    history::record(
                        txn,
                        HistoryRecord::new(order.id, manager.user_id, HistoryAction::OrderCreated)
                            .new_value(order.status.to_string())
                            .comment(format!("Order created from request #{}", request_id)),
                        now,
                    )
                    .await?;

                    Ok(ApprovedRequest {
                        request,
                        order,
                        appointment,
                    })
                })
            })
            .await?;

        info!(
            request_id,
            order_id = approved.order.id,
            appointment_id = approved.appointment.id,
            "Service request approved"
        );
        counter!("workshop.service_requests.approved", 1);

        self.event_sender.publish(Event::ServiceRequestApproved {
            request_id,
            order_id: approved.order.id,
            client_id: approved.request.client_id,
            scheduled_for: format_local(approved.appointment.scheduled_at, offset),
        });
        Ok(approved)
    }

    #[instrument(skip(self))]
    pub async fn reject_request(&self, request_id: i32) -> Result<service_request::Model, ServiceError> {
        let now = self.clock.now();
        let rejected = self
            .db
            .transaction("reject_service_request", move |txn| {
                Box::pin(async move {
                    let request = lock_request(txn, request_id).await?;
                    if !request.status.is_open() {
                        return Err(ServiceError::BadRequest(format!(
                            "Request {} is already {}",
                            request_id, request.status
                        )));
                    }
                    let mut active: service_request::ActiveModel = request.into();
                    active.status = Set(ServiceRequestStatus::Rejected);
                    active.updated_at = Set(Some(now));
                    Ok(active.update(txn).await?)
                })
            })
            .await?;

        info!(request_id, "Service request rejected");
        self.event_sender.publish(Event::ServiceRequestRejected {
            request_id,
            client_id: rejected.client_id,
        });
        Ok(rejected)
    }
}

async fn lock_request<C: ConnectionTrait>(
    conn: &C,
    request_id: i32,
) -> Result<service_request::Model, ServiceError> {
    service_request::Entity::find_by_id(request_id)
        .lock_exclusive()
        .one(conn)
        .await?
        .ok_or_else(|| not_found(request_id))
}

fn not_found(request_id: i32) -> ServiceError {
    ServiceError::NotFound(format!("Service request {} not found", request_id))
}

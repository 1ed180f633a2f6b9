use crate::clock::Clock;
use crate::config::SchedulerConfig;
use crate::db::DatabaseAccess;
use crate::entities::{appointment, order, vehicle};
use crate::errors::ServiceError;
use crate::events::{Event, EventSender};
use crate::models::{AppointmentStatus, HistoryAction};
use crate::services::history::{self, HistoryRecord};
use crate::services::Actor;
use chrono::{DateTime, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DbErr, EntityTrait, JoinType, QueryFilter,
    QueryOrder, QuerySelect, RelationTrait, Set, SqlErr,
};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{info, instrument};

/// Wall-clock offset of the workshop
pub(crate) fn workshop_offset(utc_offset_minutes: i32) -> Result<FixedOffset, ServiceError> {
    FixedOffset::east_opt(utc_offset_minutes * 60).ok_or_else(|| {
        ServiceError::InternalError(format!(
            "Invalid workshop UTC offset: {} minutes",
            utc_offset_minutes
        ))
    })
}

/// `dd.mm.yyyy HH:MM` in the workshop's local time
pub(crate) fn format_local(at: DateTime<Utc>, offset: FixedOffset) -> String {
    at.with_timezone(&offset).format("%d.%m.%Y %H:%M").to_string()
}

/// Parses a calendar day given as `YYYY-MM-DD` or as a full RFC 3339 timestamp.
pub fn parse_day(input: &str, offset: FixedOffset) -> Result<NaiveDate, ServiceError> {
    let trimmed = input.trim();
    if let Ok(date) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
        return Ok(date);
    }
    if let Ok(at) = DateTime::parse_from_rfc3339(trimmed) {
        return Ok(at.with_timezone(&offset).date_naive());
    }
    Err(ServiceError::BadRequest(format!("Invalid date: {}", input)))
}

/// Fails with `Conflict` when another active appointment starts at `at`.
pub(crate) async fn ensure_slot_free<C: ConnectionTrait>(
    conn: &C,
    at: DateTime<Utc>,
    except: Option<i32>,
) -> Result<(), ServiceError> {
    let mut query = appointment::Entity::find()
        .filter(appointment::Column::ScheduledAt.eq(at))
        .filter(appointment::Column::Status.is_in(AppointmentStatus::ACTIVE));
    if let Some(id) = except {
        query = query.filter(appointment::Column::Id.ne(id));
    }

    if let Some(existing) = query.one(conn).await? {
        return Err(ServiceError::Conflict(format!(
            "Slot {} is already taken by appointment {}",
            at.to_rfc3339(),
            existing.id
        )));
    }
    Ok(())
}

/// Maps a hit on the active-slot unique index to `Conflict`
fn slot_write_error(err: DbErr, at: DateTime<Utc>) -> ServiceError {
    match err.sql_err() {
        Some(SqlErr::UniqueConstraintViolation(_)) => ServiceError::Conflict(format!(
            "Slot {} is already taken",
            at.to_rfc3339()
        )),
        _ => err.into(),
    }
}

/// Books a new `SCHEDULED` appointment for an order inside the caller's transaction.
pub(crate) async fn book<C: ConnectionTrait>(
    conn: &C,
    order_id: i32,
    at: DateTime<Utc>,
    estimated_min: i32,
    now: DateTime<Utc>,
) -> Result<appointment::Model, ServiceError> {
    if estimated_min < 1 {
        return Err(ServiceError::BadRequest(
            "Estimated duration must be at least one minute".to_string(),
        ));
    }
    ensure_slot_free(conn, at, None).await?;

    let model = appointment::ActiveModel {
        order_id: Set(order_id),
        scheduled_at: Set(at),
        estimated_min: Set(estimated_min),
        status: Set(AppointmentStatus::Scheduled),
        created_at: Set(now),
        updated_at: Set(None),
        ..Default::default()
    }
    .insert(conn)
    .await
    .map_err(|err| slot_write_error(err, at))?;
    Ok(model)
}

/// Filter for listing appointments
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppointmentFilter {
    /// Only appointments for vehicles owned by this client
    pub client_id: Option<i32>,
    /// Only appointments of orders assigned to this mechanic
    pub mechanic_id: Option<i32>,
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
}

/// Working calendar: free slots, reschedules and appointment status
#[derive(Clone)]
pub struct AppointmentService {
    db: DatabaseAccess,
    event_sender: EventSender,
    clock: Arc<dyn Clock>,
    scheduler: SchedulerConfig,
}

impl AppointmentService {
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

    /// Starts of the free slots of `date`, as `HH:MM` in workshop time.
    ///
    /// A slot is taken when an active appointment starts exactly at it; slots
    /// that do not lie strictly in the future are never offered.
    #[instrument(skip(self))]
    pub async fn get_available_slots(&self, date: &str) -> Result<Vec<String>, ServiceError> {
        let offset = workshop_offset(self.scheduler.utc_offset_minutes)?;
        let day = parse_day(date, offset)?;

        let midnight = offset
            .from_local_datetime(&day.and_time(chrono::NaiveTime::MIN))
            .single()
            .ok_or_else(|| ServiceError::BadRequest(format!("Invalid date: {}", date)))?
            .with_timezone(&Utc);
        let window_start = midnight + Duration::hours(i64::from(self.scheduler.workday_start_hour));
        let window_end = midnight + Duration::hours(i64::from(self.scheduler.workday_end_hour));

        let busy: HashSet<String> = appointment::Entity::find()
            .filter(appointment::Column::ScheduledAt.gte(window_start))
            .filter(appointment::Column::ScheduledAt.lt(window_end))
            .filter(appointment::Column::Status.is_in(AppointmentStatus::ACTIVE))
            .all(self.db.get_pool())
            .await?
            .into_iter()
            .map(|a| a.scheduled_at.with_timezone(&offset).format("%H:%M").to_string())
            .collect();

        let now = self.clock.now();
        let step = Duration::minutes(i64::from(self.scheduler.slot_minutes));
        let mut slots = Vec::new();
        let mut slot = window_start;
        while slot < window_end {
            let label = slot.with_timezone(&offset).format("%H:%M").to_string();
            if slot > now && !busy.contains(&label) {
                slots.push(label);
            }
            slot += step;
        }
        Ok(slots)
    }

    /// Moves an appointment; the vehicle owner hears about it unless they made the change
    #[instrument(skip(self))]
    pub async fn reschedule(
        &self,
        appointment_id: i32,
        new_time: DateTime<Utc>,
        estimated_min: Option<i32>,
        actor: Actor,
    ) -> Result<appointment::Model, ServiceError> {
        if matches!(estimated_min, Some(minutes) if minutes < 1) {
            return Err(ServiceError::BadRequest(
                "Estimated duration must be at least one minute".to_string(),
            ));
        }
        let offset = workshop_offset(self.scheduler.utc_offset_minutes)?;
        let now = self.clock.now();

        let (updated, owner_id) = self
            .db
            .transaction("reschedule_appointment", move |txn| {
                Box::pin(async move {
                    let existing = appointment::Entity::find_by_id(appointment_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Appointment {} not found",
                                appointment_id
                            ))
                        })?;
                    ensure_slot_free(txn, new_time, Some(existing.id)).await?;

                    let old_time = existing.scheduled_at;
                    let order_id = existing.order_id;
                    let mut active: appointment::ActiveModel = existing.into();
                    active.scheduled_at = Set(new_time);
                    if let Some(minutes) = estimated_min {
                        active.estimated_min = Set(minutes);
                    }
                    active.updated_at = Set(Some(now));
                    let updated = active
                        .update(txn)
                        .await
                        .map_err(|err| slot_write_error(err, new_time))?;

                    history::record(
                        txn,
                        HistoryRecord::new(order_id, actor.user_id, HistoryAction::AppointmentRescheduled)
                            .old_value(format_local(old_time, offset))
                            .new_value(format_local(new_time, offset))
                            .comment(format!(
                                "Visit moved from {} to {}",
                                format_local(old_time, offset),
                                format_local(new_time, offset)
                            )),
                        now,
                    )
                    .await?;

                    let owner_id = owner_of_order(txn, order_id).await?;
                    Ok((updated, owner_id))
                })
            })
            .await?;

        info!(
            appointment_id,
            scheduled_at = %updated.scheduled_at,
            "Appointment rescheduled"
        );

        if owner_id != actor.user_id {
            self.event_sender.publish(Event::AppointmentRescheduled {
                appointment_id: updated.id,
                order_id: updated.order_id,
                client_id: owner_id,
                scheduled_for: format_local(updated.scheduled_at, offset),
            });
        }
        Ok(updated)
    }

    /// Overwrites the appointment status. Any status may follow any other, but a
    /// cancelled or finished visit only comes back while its slot is still free.
    #[instrument(skip(self))]
    pub async fn update_status(
        &self,
        appointment_id: i32,
        status: AppointmentStatus,
        actor: Actor,
    ) -> Result<appointment::Model, ServiceError> {
        let now = self.clock.now();
        let updated = self
            .db
            .transaction("update_appointment_status", move |txn| {
                Box::pin(async move {
                    let existing = appointment::Entity::find_by_id(appointment_id)
                        .one(txn)
                        .await?
                        .ok_or_else(|| {
                            ServiceError::NotFound(format!(
                                "Appointment {} not found",
                                appointment_id
                            ))
                        })?;

                    // Reviving a visit must not double-book its slot
                    if status.is_active() && !existing.status.is_active() {
                        ensure_slot_free(txn, existing.scheduled_at, Some(existing.id)).await?;
                    }

                    let old_status = existing.status;
                    let order_id = existing.order_id;
                    let scheduled_at = existing.scheduled_at;
                    let mut active: appointment::ActiveModel = existing.into();
                    active.status = Set(status);
                    active.updated_at = Set(Some(now));
                    let updated = active
                        .update(txn)
                        .await
                        .map_err(|err| slot_write_error(err, scheduled_at))?;

                    history::record(
                        txn,
                        HistoryRecord::new(order_id, actor.user_id, HistoryAction::AppointmentStatusChange)
                            .old_value(old_status.to_string())
                            .new_value(status.to_string())
                            .comment(format!("Appointment #{}: {} → {}", appointment_id, old_status, status)),
                        now,
                    )
                    .await?;
                    Ok(updated)
                })
            })
            .await?;

        info!(appointment_id, status = %updated.status, "Appointment status updated");
        Ok(updated)
    }

    /// Appointments in ascending time order
    pub async fn list_appointments(
        &self,
        filter: AppointmentFilter,
    ) -> Result<Vec<appointment::Model>, ServiceError> {
        let mut query = appointment::Entity::find();

        if filter.client_id.is_some() || filter.mechanic_id.is_some() {
            query = query.join(JoinType::InnerJoin, appointment::Relation::Order.def());
        }
        if let Some(client_id) = filter.client_id {
            query = query
                .join(JoinType::InnerJoin, order::Relation::Vehicle.def())
                .filter(vehicle::Column::OwnerId.eq(client_id));
        }
        if let Some(mechanic_id) = filter.mechanic_id {
            query = query.filter(order::Column::MechanicId.eq(mechanic_id));
        }
        if let Some(from) = filter.from {
            query = query.filter(appointment::Column::ScheduledAt.gte(from));
        }
        if let Some(to) = filter.to {
            query = query.filter(appointment::Column::ScheduledAt.lte(to));
        }

        Ok(query
            .order_by_asc(appointment::Column::ScheduledAt)
            .order_by_asc(appointment::Column::Id)
            .all(self.db.get_pool())
            .await?)
    }
}

async fn owner_of_order<C: ConnectionTrait>(conn: &C, order_id: i32) -> Result<i32, ServiceError> {
    let owner: Option<i32> = order::Entity::find_by_id(order_id)
        .select_only()
        .column(vehicle::Column::OwnerId)
        .join(JoinType::InnerJoin, order::Relation::Vehicle.def())
        .into_tuple()
        .one(conn)
        .await?;
    owner.ok_or_else(|| ServiceError::NotFound(format!("Order {} not found", order_id)))
}

use crate::errors::ServiceError;
use crate::models::{NotificationType, OrderStatus, UserRole};
use crate::notifications::{NotificationGateway, NotificationMessage};
use metrics::counter;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Who should hear about an event
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Audience {
    Users(Vec<i32>),
    Roles(Vec<UserRole>),
}

/// Facts published after a workflow transaction commits.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Event {
    OrderCreated {
        order_id: i32,
        vehicle: String,
        description: Option<String>,
        audience: Audience,
    },
    OrderStatusChanged {
        order_id: i32,
        old_status: OrderStatus,
        new_status: OrderStatus,
        recipients: Vec<i32>,
    },
    StaffAssigned {
        order_id: i32,
        user_id: i32,
        role: UserRole,
    },
    AppointmentRescheduled {
        appointment_id: i32,
        order_id: i32,
        client_id: i32,
        /// Local wall-clock rendering, `dd.mm.yyyy HH:MM`
        scheduled_for: String,
    },
    ServiceRequestApproved {
        request_id: i32,
        order_id: i32,
        client_id: i32,
        scheduled_for: String,
    },
    ServiceRequestRejected {
        request_id: i32,
        client_id: i32,
    },
    PartReportedMissing {
        part_id: i32,
        part_name: String,
        sku: String,
        reported_by: String,
        comment: Option<String>,
    },
    LowStock {
        part_id: i32,
        part_name: String,
        on_hand: i32,
        threshold: i32,
    },
}

impl Event {
    pub fn name(&self) -> &'static str {
        match self {
            Event::OrderCreated { .. } => "order_created",
            Event::OrderStatusChanged { .. } => "order_status_changed",
            Event::StaffAssigned { .. } => "staff_assigned",
            Event::AppointmentRescheduled { .. } => "appointment_rescheduled",
            Event::ServiceRequestApproved { .. } => "service_request_approved",
            Event::ServiceRequestRejected { .. } => "service_request_rejected",
            Event::PartReportedMissing { .. } => "part_reported_missing",
            Event::LowStock { .. } => "low_stock",
        }
    }

    /// Renders the event as a notification and the audience it goes to.
    pub fn notification(&self) -> (Audience, NotificationMessage) {
        match self {
            Event::OrderCreated {
                order_id,
                vehicle,
                description,
                audience,
            } => {
                let mut text = format!("Order #{} was created for {}", order_id, vehicle);
                if let Some(description) = description.as_deref().filter(|d| !d.is_empty()) {
                    text.push_str(": ");
                    text.push_str(description);
                }
                (
                    audience.clone(),
                    NotificationMessage::new(
                        "New order",
                        text,
                        NotificationType::OrderCreated,
                        Some(*order_id),
                    ),
                )
            }
            Event::OrderStatusChanged {
                order_id,
                new_status,
                recipients,
                ..
            } => (
                Audience::Users(recipients.clone()),
                NotificationMessage::new(
                    "Order status changed",
                    format!("Order #{}: {}", order_id, new_status.label()),
                    NotificationType::StatusChanged,
                    Some(*order_id),
                ),
            ),
            Event::StaffAssigned {
                order_id,
                user_id,
                role,
            } => {
                let position = match role {
                    UserRole::Mechanic => "mechanic",
                    _ => "manager",
                };
                (
                    Audience::Users(vec![*user_id]),
                    NotificationMessage::new(
                        format!("You were assigned as {}", position),
                        format!("You were assigned as {} of order #{}", position, order_id),
                        NotificationType::Assignment,
                        Some(*order_id),
                    ),
                )
            }
            Event::AppointmentRescheduled {
                order_id,
                client_id,
                scheduled_for,
                ..
            } => (
                Audience::Users(vec![*client_id]),
                NotificationMessage::new(
                    "Visit time changed",
                    format!(
                        "Your visit for order #{} was moved to {}",
                        order_id, scheduled_for
                    ),
                    NotificationType::Rescheduled,
                    Some(*order_id),
                ),
            ),
            Event::ServiceRequestApproved {
                request_id,
                order_id,
                client_id,
                scheduled_for,
            } => (
                Audience::Users(vec![*client_id]),
                NotificationMessage::new(
                    "Request approved",
                    format!(
                        "Your request #{} was approved. Visit scheduled for {}. Order #{}",
                        request_id, scheduled_for, order_id
                    ),
                    NotificationType::Appointment,
                    Some(*order_id),
                ),
            ),
            Event::ServiceRequestRejected {
                request_id,
                client_id,
            } => (
                Audience::Users(vec![*client_id]),
                NotificationMessage::new(
                    "Request rejected",
                    format!("Your request #{} was rejected", request_id),
                    NotificationType::System,
                    None,
                ),
            ),
            Event::PartReportedMissing {
                part_name,
                sku,
                reported_by,
                comment,
                ..
            } => {
                let mut text = format!("{} reports part {} ({}) is missing", reported_by, part_name, sku);
                if let Some(comment) = comment.as_deref().filter(|c| !c.is_empty()) {
                    text.push_str(": ");
                    text.push_str(comment);
                }
                (
                    Audience::Roles(vec![UserRole::Admin, UserRole::Manager]),
                    NotificationMessage::new(
                        "Part missing",
                        text,
                        NotificationType::Inventory,
                        None,
                    ),
                )
            }
            Event::LowStock {
                part_name,
                on_hand,
                threshold,
                ..
            } => (
                Audience::Roles(vec![UserRole::Admin, UserRole::Manager]),
                NotificationMessage::new(
                    "Low stock",
                    format!(
                        "{} is running low: {} on hand, threshold {}",
                        part_name, on_hand, threshold
                    ),
                    NotificationType::Inventory,
                    None,
                ),
            ),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EventSender {
    sender: mpsc::Sender<Event>,
}

impl EventSender {
    /// Creates a new EventSender
    pub fn new(sender: mpsc::Sender<Event>) -> Self {
        Self { sender }
    }

    /// Queues an event without waiting for channel capacity
    pub fn send(&self, event: Event) -> Result<(), ServiceError> {
        let name = event.name();
        self.sender.try_send(event).map_err(|e| {
            counter!("workshop.events.dropped", 1, "event" => name);
            ServiceError::EventError(format!("Failed to queue {} event: {}", name, e))
        })
    }

    /// Queues an event; failures are logged and dropped
    pub fn publish(&self, event: Event) {
        if let Err(e) = self.send(event) {
            warn!(error = %e, "Event not published");
        }
    }
}

/// Creates the channel between the services and the event worker
pub fn channel(capacity: usize) -> (EventSender, mpsc::Receiver<Event>) {
    let (tx, rx) = mpsc::channel(capacity);
    (EventSender::new(tx), rx)
}

/// Drains the event channel and delivers notifications until every sender is dropped.
pub async fn process_events(mut rx: mpsc::Receiver<Event>, gateway: Arc<dyn NotificationGateway>) {
    info!("Starting event processing loop");

    while let Some(event) = rx.recv().await {
        let name = event.name();
        debug!(event = name, "Received event");
        deliver(gateway.as_ref(), &event).await;
    }

    warn!("Event processing loop has ended");
}

async fn deliver(gateway: &dyn NotificationGateway, event: &Event) {
    let name = event.name();
    let (audience, message) = event.notification();

    let result = match &audience {
        Audience::Users(ids) if ids.is_empty() => return,
        Audience::Users(ids) if ids.len() == 1 => gateway.notify(ids[0], &message).await,
        Audience::Users(ids) => gateway.notify_many(ids, &message).await,
        Audience::Roles(roles) => gateway.notify_roles(roles, &message).await,
    };

    match result {
        Ok(()) => {
            counter!("workshop.events.delivered", 1, "event" => name);
        }
        Err(e) => {
            counter!("workshop.events.delivery_failed", 1, "event" => name);
            error!(event = name, error = %e, "Failed to deliver notification");
        }
    }
}

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::{
    clock::Clock,
    config::AppConfig,
    db::{DatabaseAccess, DbPool},
    events::{self, Event, EventSender},
    notifications::DbNotificationGateway,
    services::{
        appointments::AppointmentService,
        inventory::InventoryService,
        orders::{OrderService, WorkflowSettings},
        service_requests::ServiceRequestService,
    },
};

/// Factory for creating service instances with shared dependencies
pub struct ServiceFactory {
    db: DatabaseAccess,
    event_sender: EventSender,
    clock: Arc<dyn Clock>,
    config: AppConfig,
}

impl ServiceFactory {
    /// Creates a new service factory with the given dependencies
    pub fn new(
        db: DatabaseAccess,
        event_sender: EventSender,
        clock: Arc<dyn Clock>,
        config: AppConfig,
    ) -> Self {
        Self {
            db,
            event_sender,
            clock,
            config,
        }
    }

    pub fn workflow_settings(&self) -> WorkflowSettings {
        WorkflowSettings {
            enforce_status_transitions: self.config.enforce_status_transitions,
            default_appointment_minutes: self.config.scheduler.default_appointment_minutes,
        }
    }

    /// Creates an inventory service instance
    pub fn inventory_service(&self) -> InventoryService {
        InventoryService::new(self.db.clone(), self.event_sender.clone(), self.clock.clone())
    }

    /// Creates an order service instance
    pub fn order_service(&self) -> OrderService {
        OrderService::new(
            self.db.clone(),
            self.event_sender.clone(),
            self.clock.clone(),
            self.workflow_settings(),
        )
    }

    pub fn appointment_service(&self) -> AppointmentService {
        AppointmentService::new(
            self.db.clone(),
            self.event_sender.clone(),
            self.clock.clone(),
            self.config.scheduler.clone(),
        )
    }

    pub fn service_request_service(&self) -> ServiceRequestService {
        ServiceRequestService::new(
            self.db.clone(),
            self.event_sender.clone(),
            self.clock.clone(),
            self.config.scheduler.clone(),
        )
    }

    /// Gets a reference to the database access wrapper
    pub fn db(&self) -> &DatabaseAccess {
        &self.db
    }
}

/// Service container holding all service instances
#[derive(Clone)]
pub struct ServiceContainer {
    pub inventory: Arc<InventoryService>,
    pub orders: Arc<OrderService>,
    pub appointments: Arc<AppointmentService>,
    pub service_requests: Arc<ServiceRequestService>,
    pub notifications: Arc<DbNotificationGateway>,
}

impl ServiceContainer {
    /// Creates a new service container with all services initialized
    pub fn new(factory: &ServiceFactory) -> Self {
        Self {
            inventory: Arc::new(factory.inventory_service()),
            orders: Arc::new(factory.order_service()),
            appointments: Arc::new(factory.appointment_service()),
            service_requests: Arc::new(factory.service_request_service()),
            notifications: Arc::new(DbNotificationGateway::new(Arc::new(
                factory.db().get_pool().clone(),
            ))),
        }
    }

    /// Wires every service to `pool` and returns the receiving end of the event channel
    pub fn build(
        pool: Arc<DbPool>,
        config: &AppConfig,
        clock: Arc<dyn Clock>,
    ) -> (Self, mpsc::Receiver<Event>) {
        let (event_sender, rx) = events::channel(config.event_channel_capacity);
        let db = DatabaseAccess::from_app_config(pool, config);
        let factory = ServiceFactory::new(db, event_sender, clock, config.clone());
        (Self::new(&factory), rx)
    }

    /// Builds the services and spawns the notification worker on the current runtime
    pub fn start(pool: Arc<DbPool>, config: &AppConfig, clock: Arc<dyn Clock>) -> Self {
        let (container, rx) = Self::build(pool, config, clock);
        tokio::spawn(events::process_events(rx, container.notifications.clone()));
        container
    }
}

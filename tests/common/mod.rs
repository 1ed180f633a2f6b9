#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use sea_orm::{ActiveModelTrait, EntityTrait, Set};
use tokio::sync::mpsc;
use workshop_core::{
    clock::FixedClock,
    config::AppConfig,
    db::{self, DbPool},
    entities::{catalog_service, order, part, user, vehicle},
    events::Event,
    models::{OrderStatus, UserRole},
    notifications::{NotificationError, NotificationGateway, NotificationMessage},
    services::{factory::ServiceContainer, Actor},
};

/// Instant the test clock starts at: 2025-06-01 09:00 UTC
pub fn start_of_tests() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
}

pub fn at(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
}

/// Reference data every test starts with
pub struct Seed {
    pub admin: user::Model,
    pub manager: user::Model,
    pub mechanic: user::Model,
    pub client: user::Model,
    pub other_client: user::Model,
    pub vehicle: vehicle::Model,
    pub other_vehicle: vehicle::Model,
    pub oil_change: catalog_service::Model,
    /// Two on hand, reorder threshold 1
    pub brake_pads: part::Model,
    /// Ten on hand, reorder threshold 3
    pub oil_filter: part::Model,
}

/// Services wired to a fresh SQLite database, in memory unless configured otherwise.
///
/// Events are not consumed by a worker; tests read them with [`TestContext::drain_events`].
pub struct TestContext {
    pub db: Arc<DbPool>,
    pub clock: Arc<FixedClock>,
    pub config: AppConfig,
    pub services: ServiceContainer,
    pub events: mpsc::Receiver<Event>,
    pub seed: Seed,
}

impl TestContext {
    pub async fn new() -> Self {
        Self::with_config(test_config()).await
    }

    pub async fn with_config(config: AppConfig) -> Self {
        let pool = db::establish_connection_from_app_config(&config)
            .await
            .expect("failed to open test database");
        db::run_migrations(&pool)
            .await
            .expect("failed to run migrations in tests");

        let seed = seed(&pool).await;
        let db = Arc::new(pool);
        let clock = Arc::new(FixedClock::new(start_of_tests()));
        let (services, events) = ServiceContainer::build(db.clone(), &config, clock.clone());

        Self {
            db,
            clock,
            config,
            services,
            events,
            seed,
        }
    }

    pub fn pool(&self) -> &DbPool {
        &self.db
    }

    pub fn admin(&self) -> Actor {
        actor(&self.seed.admin)
    }

    pub fn manager(&self) -> Actor {
        actor(&self.seed.manager)
    }

    pub fn mechanic(&self) -> Actor {
        actor(&self.seed.mechanic)
    }

    pub fn client(&self) -> Actor {
        actor(&self.seed.client)
    }

    /// Every event published so far, in order
    pub fn drain_events(&mut self) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    /// Inserts an order directly, bypassing the workflow
    pub async fn insert_order(&self, status: OrderStatus) -> order::Model {
        order::ActiveModel {
            vehicle_id: Set(self.seed.vehicle.id),
            manager_id: Set(None),
            mechanic_id: Set(None),
            mileage: Set(Some(self.seed.vehicle.mileage)),
            description: Set(Some("Seeded order".to_string())),
            total_amount: Set(Decimal::ZERO),
            status: Set(status),
            created_at: Set(self.clock_now()),
            updated_at: Set(None),
            completed_at: Set(None),
            ..Default::default()
        }
        .insert(self.pool())
        .await
        .expect("failed to insert order")
    }

    pub async fn reload_part(&self, part_id: i32) -> part::Model {
        part::Entity::find_by_id(part_id)
            .one(self.pool())
            .await
            .expect("part query failed")
            .expect("part missing")
    }

    pub async fn reload_order(&self, order_id: i32) -> order::Model {
        order::Entity::find_by_id(order_id)
            .one(self.pool())
            .await
            .expect("order query failed")
            .expect("order missing")
    }

    fn clock_now(&self) -> DateTime<Utc> {
        use workshop_core::clock::Clock;
        self.clock.now()
    }
}

pub fn test_config() -> AppConfig {
    let mut cfg = AppConfig::new("sqlite::memory:".to_string(), "test".to_string());
    cfg.db_max_connections = 1;
    cfg.db_min_connections = 1;
    cfg.transaction_timeout_secs = 5;
    cfg
}

/// Settings for a SQLite file under `dir` shared by several pooled connections,
/// so that transactions really interleave.
pub fn file_backed_config(dir: &std::path::Path, connections: u32) -> AppConfig {
    let url = format!("sqlite://{}?mode=rwc", dir.join("workshop.db").display());
    let mut cfg = AppConfig::new(url, "test".to_string());
    cfg.db_max_connections = connections;
    cfg.db_min_connections = 1;
    cfg.transaction_timeout_secs = 10;
    cfg
}

pub fn actor(user: &user::Model) -> Actor {
    Actor::new(user.id, user.role)
}

async fn seed(pool: &DbPool) -> Seed {
    let now = start_of_tests();

    let admin = insert_user(pool, "Olena", "Admin", "admin@workshop.test", UserRole::Admin).await;
    let manager = insert_user(pool, "Petro", "Manager", "manager@workshop.test", UserRole::Manager).await;
    let mechanic = insert_user(pool, "Ivan", "Mechanic", "mechanic@workshop.test", UserRole::Mechanic).await;
    let client = insert_user(pool, "Anna", "Client", "client@workshop.test", UserRole::Client).await;
    let other_client = insert_user(pool, "Taras", "Other", "other@workshop.test", UserRole::Client).await;

    let vehicle = insert_vehicle(pool, client.id, "Toyota", "Corolla", 120_000).await;
    let other_vehicle = insert_vehicle(pool, other_client.id, "Skoda", "Octavia", 80_000).await;

    let oil_change = catalog_service::ActiveModel {
        name: Set("Oil change".to_string()),
        description: Set(Some("Engine oil and filter replacement".to_string())),
        price: Set(dec!(500)),
        duration_min: Set(Some(60)),
        is_active: Set(true),
        ..Default::default()
    }
    .insert(pool)
    .await
    .expect("failed to seed service");

    let brake_pads = insert_part(pool, "PRT-BRAKE1", "Brake pads", 2, 1, dec!(400), dec!(650.5), now).await;
    let oil_filter = insert_part(pool, "PRT-FILTR1", "Oil filter", 10, 3, dec!(80), dec!(120.25), now).await;

    Seed {
        admin,
        manager,
        mechanic,
        client,
        other_client,
        vehicle,
        other_vehicle,
        oil_change,
        brake_pads,
        oil_filter,
    }
}

async fn insert_user(
    pool: &DbPool,
    first: &str,
    last: &str,
    email: &str,
    role: UserRole,
) -> user::Model {
    user::ActiveModel {
        first_name: Set(first.to_string()),
        last_name: Set(last.to_string()),
        email: Set(email.to_string()),
        phone: Set(None),
        role: Set(role),
        created_at: Set(start_of_tests()),
        deleted_at: Set(None),
        ..Default::default()
    }
    .insert(pool)
    .await
    .expect("failed to seed user")
}

async fn insert_vehicle(
    pool: &DbPool,
    owner_id: i32,
    brand: &str,
    model: &str,
    mileage: i32,
) -> vehicle::Model {
    vehicle::ActiveModel {
        owner_id: Set(owner_id),
        brand: Set(brand.to_string()),
        model: Set(model.to_string()),
        year: Set(Some(2018)),
        vin: Set(None),
        license_plate: Set(None),
        mileage: Set(mileage),
        created_at: Set(start_of_tests()),
        ..Default::default()
    }
    .insert(pool)
    .await
    .expect("failed to seed vehicle")
}

#[allow(clippy::too_many_arguments)]
async fn insert_part(
    pool: &DbPool,
    sku: &str,
    name: &str,
    stock: i32,
    min_stock: i32,
    purchase: Decimal,
    retail: Decimal,
    now: DateTime<Utc>,
) -> part::Model {
    part::ActiveModel {
        sku: Set(sku.to_string()),
        name: Set(name.to_string()),
        description: Set(None),
        stock_quantity: Set(stock),
        min_stock_level: Set(min_stock),
        purchase_price: Set(purchase),
        retail_price: Set(retail),
        created_at: Set(now),
        updated_at: Set(None),
        deleted_at: Set(None),
        ..Default::default()
    }
    .insert(pool)
    .await
    .expect("failed to seed part")
}

/// Gateway that remembers every delivery and can be told to fail
#[derive(Default)]
pub struct RecordingGateway {
    pub delivered: Mutex<Vec<(Vec<i32>, NotificationMessage)>>,
    pub role_deliveries: Mutex<Vec<(Vec<UserRole>, NotificationMessage)>>,
    pub fail: bool,
}

impl RecordingGateway {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Default::default()
        }
    }

    pub fn user_deliveries(&self) -> Vec<(Vec<i32>, NotificationMessage)> {
        self.delivered.lock().unwrap().clone()
    }

    fn check(&self) -> Result<(), NotificationError> {
        if self.fail {
            Err(NotificationError::Delivery("gateway offline".to_string()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl NotificationGateway for RecordingGateway {
    async fn notify(
        &self,
        user_id: i32,
        message: &NotificationMessage,
    ) -> Result<(), NotificationError> {
        self.check()?;
        self.delivered
            .lock()
            .unwrap()
            .push((vec![user_id], message.clone()));
        Ok(())
    }

    async fn notify_many(
        &self,
        user_ids: &[i32],
        message: &NotificationMessage,
    ) -> Result<(), NotificationError> {
        self.check()?;
        self.delivered
            .lock()
            .unwrap()
            .push((user_ids.to_vec(), message.clone()));
        Ok(())
    }

    async fn notify_roles(
        &self,
        roles: &[UserRole],
        message: &NotificationMessage,
    ) -> Result<(), NotificationError> {
        self.check()?;
        self.role_deliveries
            .lock()
            .unwrap()
            .push((roles.to_vec(), message.clone()));
        Ok(())
    }
}

//! Workshop Core Library
//!
//! Order workflow, stock ledger, audit history and appointment calendar of a
//! vehicle-service workshop.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod clock;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod events;
pub mod migrator;
pub mod models;
pub mod notifications;
pub mod services;

pub use clock::{Clock, FixedClock, SystemClock};
pub use config::{AppConfig, SchedulerConfig};
pub use db::{DatabaseAccess, DbPool};
pub use errors::ServiceError;
pub use events::{Event, EventSender};
pub use models::{Money, OrderStatus, Quantity};
pub use services::factory::{ServiceContainer, ServiceFactory};
pub use services::Actor;

pub mod appointment;
pub mod catalog_service;
pub mod notification;
pub mod order;
pub mod order_history;
pub mod order_item;
pub mod part;
pub mod service_request;
pub mod user;
pub mod vehicle;

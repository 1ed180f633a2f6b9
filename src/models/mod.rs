//! Ledger primitives and the enumerations shared by the entities.

pub mod kinds;
pub mod money;
pub mod order_status;

pub use kinds::{
    AppointmentStatus, HistoryAction, ItemKind, NotificationType, ServiceRequestStatus, UserRole,
};
pub use money::{line_total, recompute_total, Money, Quantity};
pub use order_status::OrderStatus;

use crate::models::UserRole;
use serde::{Deserialize, Serialize};

pub mod appointments;
pub mod factory;
pub mod history;
pub mod inventory;
pub mod orders;
pub mod service_requests;

/// The pre-authenticated user performing an operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Actor {
    pub user_id: i32,
    pub role: UserRole,
}

impl Actor {
    pub fn new(user_id: i32, role: UserRole) -> Self {
        Self { user_id, role }
    }

    pub fn is_staff(&self) -> bool {
        self.role.is_staff()
    }
}

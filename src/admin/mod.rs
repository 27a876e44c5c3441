//! Admin surface: user management with last-admin protection.

pub mod users;

pub use users::{AdminService, UserSummary};

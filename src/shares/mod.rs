//! Shared credentials: owner-to-grantee re-encryption and the pending
//! queue for grantees who were locked at grant time.

pub mod manager;

pub use manager::ShareManager;

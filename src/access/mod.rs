//! Access control: the request-scoped data-access gate and the host
//! permission resolver.

pub mod gate;
pub mod permissions;

pub use gate::{AccessGate, RequestContext};
pub use permissions::{Access, GrantSource, Intent, PermissionResolver};

//! Drawbridge - credential-security core for an SSH management platform
//!
//! Drawbridge stores user-owned host connection profiles and credentials and
//! enforces end-to-end encryption of secrets under per-user keys, so that
//! ciphertext at rest is useless without the user's password (or an external
//! identity's proof).
//!
//! ## Services
//!
//! - **Keys**: Argon2id KEK derivation, the per-user data-key vault, and the
//!   machine-local system key manager
//! - **Fieldcrypto**: per-record field encryption with entity-aware registry
//! - **Sessions**: persisted sessions with in-memory unlock state and tokens
//! - **Authn**: the login state machine (password, external identity, TOTP),
//!   rate limiting, password change and reset
//! - **Access**: the request-scoped data-access gate and permission resolver
//! - **Shares**: shared-credential re-encryption with pending-share queue
//! - **Db**: the hot in-memory store, snapshot persistence, save coordinator
//!
//! The HTTP layer, SSH plumbing, and UI are external collaborators; they see
//! only the [`App`] object and the service interfaces it exposes.

pub mod access;
pub mod admin;
pub mod app;
pub mod authn;
pub mod config;
pub mod db;
pub mod fieldcrypto;
pub mod keys;
pub mod logging;
pub mod records;
pub mod sessions;
pub mod shares;
pub mod types;

pub use app::App;
pub use config::Args;
pub use types::{DrawbridgeError, ErrorKind, Result};

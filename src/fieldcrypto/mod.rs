//! Per-record field encryption.
//!
//! The engine seals individual fields under a user's DEK with associated
//! data binding each ciphertext to its entity kind, record, field, and
//! owner. The registry is the compile-time list of which fields of which
//! entity kinds are sensitive. The record service applies both on the
//! storage read/write paths.

pub mod engine;
pub mod records;
pub mod registry;

pub use engine::{
    decrypt_field, encrypt_field, is_encrypted, open_bytes, seal_bytes, FieldContext,
    VERSION_PREFIX,
};
pub use records::RecordCrypto;
pub use registry::{is_lazy, is_sensitive, sensitive_fields, EntityKind, FieldSpec};

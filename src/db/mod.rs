//! Storage: the hot in-memory store, its row schemas, and the save
//! coordinator that snapshots it to disk.

pub mod saver;
pub mod schemas;
pub mod store;

pub use saver::SaveCoordinator;
pub use store::{HotStore, Tables, SNAPSHOT_FILE};

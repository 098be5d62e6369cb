//! Zone & client state management.

pub mod client;
pub mod store;
pub mod zone;

pub use store::{SharedStore, StateStore};

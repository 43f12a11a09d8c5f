//! Declarative configuration store.
//!
//! Configuration lives as one JSON file per named group inside a single
//! directory. The store loads every group at startup, watches the
//! directory for external edits, and broadcasts typed [`StoreEvent`]s so
//! consumers (the orchestrator, chiefly) can react to refreshed groups
//! without polling.

mod group;
mod store;

pub use group::ConfigGroup;
pub use store::{ConfigStore, StoreEvent, ENABLEMENT_GROUP};

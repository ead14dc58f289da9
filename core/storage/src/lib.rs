//! Local entity store for Waypoint.
//!
//! This module persists steps, links, news, sync records and push
//! bookkeeping in SQLite, and publishes live query results to subscribers
//! after every committed write.
//!
//! # Design Principles
//! - One transaction per write call: a batch commits whole or not at all
//! - Referential integrity is enforced by the database
//! - Subscribers observe commits in order and never a stale result

pub mod bus;
pub mod database;
pub mod entity;
pub mod query;
pub mod steps;
pub mod store;
pub mod syncs;

pub use bus::{ChangeBus, Subscription};
pub use database::{Database, ReadTx, StoreConfig, WriteTx, SCHEMA_VERSION};
pub use entity::{Entity, EntityKind};
pub use query::{Direction, Filter, Order, Query};
pub use store::EntityStore;

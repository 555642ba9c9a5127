//! Warehouse client interface for the featurepipe engine.
//!
//! Provides the [`Warehouse`] / [`WarehouseConnection`] traits the engine
//! issues logical read, write and swap requests through, plus a
//! [`SqliteWarehouse`] backend and a [`MemoryWarehouse`] with fault
//! injection for tests.

#![warn(clippy::pedantic)]

pub mod backend;
pub mod error;
pub mod memory;
pub mod sqlite;

pub use backend::{ConnectOptions, Warehouse, WarehouseConnection, WriteMode};
pub use error::WarehouseError;
pub use memory::{FaultPlan, MemoryStats, MemoryWarehouse};
pub use sqlite::SqliteWarehouse;
